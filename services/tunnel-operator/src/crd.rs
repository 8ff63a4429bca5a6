//! Tunnel custom resource
//!
//! The declarative record (spec) plus the only persisted memory of what the
//! operator has already done (status).

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DeploymentSpec;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding provider-side resources
pub const TUNNEL_FINALIZER: &str = "tunnel.zeeweb.xyz/finalizer";

pub const CONDITION_CREATED: &str = "Created";
pub const REASON_CREATION_SUCCEEDED: &str = "CreationSucceeded";
pub const REASON_CREATION_FAILED: &str = "CreationFailed";
pub const REASON_ALREADY_EXISTS: &str = "AlreadyExists";
pub const REASON_TUNNEL_MISSING: &str = "TunnelMissing";

pub const CONDITION_DNS_RECORDS: &str = "DNSRecords";
pub const REASON_RECORD_CONFLICT: &str = "DNSRecordConflict";
pub const REASON_RECORDS_SYNCED: &str = "RecordsSynced";

/// Desired state of a Cloudflare tunnel
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "tunnel.zeeweb.xyz",
    version = "v1alpha1",
    kind = "Tunnel",
    singular = "tunnel",
    plural = "tunnels",
    shortname = "tun",
    status = "TunnelStatus",
    namespaced,
    printcolumn = r#"{"name":"Tunnel","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"TunnelID","type":"string","jsonPath":".status.tunnelId"}"#,
    printcolumn = r#"{"name":"Run","type":"boolean","jsonPath":".spec.run"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// Name of the provider tunnel; immutable identity used for lookup and creation
    pub name: String,

    /// Name of the Secret holding credentials.json and config.yaml (defaults to the resource name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Ordered hostname to service routing rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<TunnelIngress>>,

    /// Run a managed cloudflared Deployment for this tunnel
    #[serde(default)]
    pub run: bool,

    /// Workload template; pinned to the default on first run so later edits are explicit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_spec: Option<DeploymentSpec>,
}

/// One hostname to upstream service mapping, in cloudflared's config.yaml shape
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelIngress {
    /// Public hostname routed through the tunnel
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Upstream locator, e.g. `http://svc:80` or `http_status:404`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequestConfig>,
}

impl TunnelIngress {
    /// Catch-all rule terminating every rendered ingress list.
    pub fn catch_all() -> Self {
        Self {
            service: Some("http_status:404".to_string()),
            ..Default::default()
        }
    }
}

/// Per-rule proxy settings passed through to cloudflared.
///
/// Durations use cloudflared notation ("30s", "1m").
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OriginRequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
    /// Path to the CA for the origin certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,
    #[serde(
        rename = "noTLSVerify",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub no_tls_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    /// Either "socks" or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_rules: Vec<IngressIpRule>,
}

/// Allow or deny an IP prefix when proxying
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct IngressIpRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow: bool,
}

/// Observed state of a Tunnel
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    /// Account in which the provider tunnel was created
    #[serde(default)]
    pub account_id: Option<String>,

    /// Provider-assigned tunnel identity; never changes once recorded
    #[serde(default)]
    pub tunnel_id: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Hostnames confirmed as recorded in DNS
    #[serde(default)]
    pub hostnames: Vec<String>,
}

/// Status of a condition
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A status condition, keyed by its type
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Kind of condition (e.g., Created)
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine-readable reason code
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time `status` changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

impl TunnelStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Merge a condition by type.
    ///
    /// `last_transition_time` is carried over from the existing entry unless
    /// the status flips.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

impl Tunnel {
    /// Recorded provider identity, if any
    pub fn tunnel_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tunnel_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn account_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.account_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Name of the Secret holding the tunnel artifacts
    pub fn secret_name(&self) -> String {
        self.spec
            .secret_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// Declared hostnames: non-empty, de-duplicated, in declaration order
    pub fn declared_hostnames(&self) -> Vec<String> {
        let mut hostnames: Vec<String> = Vec::new();
        for rule in self.spec.ingress.iter().flatten() {
            if !rule.hostname.is_empty() && !hostnames.contains(&rule.hostname) {
                hostnames.push(rule.hostname.clone());
            }
        }
        hostnames
    }

    /// Hostnames confirmed in DNS by earlier cycles
    pub fn observed_hostnames(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.hostnames.as_slice())
            .unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == TUNNEL_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut TunnelStatus {
        self.status.get_or_insert_with(TunnelStatus::default)
    }
}
