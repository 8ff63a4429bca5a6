//! Cloudflare collaborators
//!
//! Two capability sets drive the provider: tunnel registration and DNS
//! records. Both are implemented by [`CloudflareClient`] and substituted with
//! fakes in tests.

mod client;

pub use client::CloudflareClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::credentials::TunnelSecret;
use crate::error::Result;

/// A tunnel as listed by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTunnel {
    pub id: String,
    pub name: String,
    /// Set once the tunnel was deleted; deleted tunnels keep being listed
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProviderTunnel {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    #[allow(clippy::upper_case_acronyms)]
    CNAME,
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsRecordType::CNAME => write!(f, "CNAME"),
        }
    }
}

/// A DNS record from the zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
}

/// Request to create a DNS record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRecordRequest {
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub name: String,
    pub content: String,
    /// 1 means automatic
    pub ttl: u32,
    pub proxied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl DnsRecordRequest {
    /// Proxied CNAME pointing a public hostname at a tunnel
    pub fn tunnel_cname(hostname: &str, target: &str) -> Self {
        Self {
            record_type: DnsRecordType::CNAME,
            name: hostname.to_string(),
            content: target.to_string(),
            ttl: 1,
            proxied: true,
            comment: Some("Managed by tunnel-operator".to_string()),
        }
    }
}

/// Provider-side tunnel registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// Account the tunnels are registered in
    fn account_id(&self) -> String;

    /// List tunnels matching `name`, including deleted ones
    async fn list_tunnels(&self, name: &str) -> Result<Vec<ProviderTunnel>>;

    async fn create_tunnel(&self, name: &str, secret: &TunnelSecret) -> Result<ProviderTunnel>;

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()>;
}

/// DNS zone the tunnel hostnames are published in
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsApi: Send + Sync {
    /// Exact name + type lookup
    async fn list_records(&self, record_type: DnsRecordType, name: &str) -> Result<Vec<DnsRecord>>;

    async fn create_record(&self, request: &DnsRecordRequest) -> Result<DnsRecord>;

    async fn delete_record(&self, record_id: &str) -> Result<()>;
}
