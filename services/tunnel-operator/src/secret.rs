//! Secret and routing config rendering
//!
//! The artifact Secret carries two entries: `credentials.json`, written once
//! when the tunnel is created, and `config.yaml`, re-rendered from the
//! declaration on every cycle and written only when it changes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::credentials::TunnelSecret;
use crate::crd::{Tunnel, TunnelIngress};
use crate::error::{Error, Result};
use crate::kube_store::TunnelStore;

pub const CREDENTIALS_KEY: &str = "credentials.json";
pub const CONFIG_KEY: &str = "config.yaml";

/// cloudflared credentials file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialBundle {
    #[serde(rename = "AccountTag")]
    pub account_tag: String,
    #[serde(rename = "TunnelID")]
    pub tunnel_id: String,
    #[serde(rename = "TunnelName")]
    pub tunnel_name: String,
    #[serde(rename = "TunnelSecret")]
    pub tunnel_secret: String,
}

/// cloudflared config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub tunnel: String,
    pub ingress: Vec<TunnelIngress>,
}

fn recorded_identity(tunnel: &Tunnel) -> Result<(&str, &str)> {
    let tunnel_id = tunnel
        .tunnel_id()
        .ok_or_else(|| Error::MissingArtifact(format!("tunnel ID of {}", tunnel.name_any())))?;
    let account_id = tunnel
        .account_id()
        .ok_or_else(|| Error::MissingArtifact(format!("account ID of {}", tunnel.name_any())))?;
    Ok((tunnel_id, account_id))
}

pub fn render_credential_bundle(tunnel: &Tunnel, secret: &TunnelSecret) -> Result<CredentialBundle> {
    let (tunnel_id, account_id) = recorded_identity(tunnel)?;
    Ok(CredentialBundle {
        account_tag: account_id.to_string(),
        tunnel_id: tunnel_id.to_string(),
        tunnel_name: tunnel.spec.name.clone(),
        tunnel_secret: secret.as_str().to_string(),
    })
}

/// Declared rules in order, terminated by the catch-all.
pub fn render_routing_config(tunnel: &Tunnel, tunnel_id: &str) -> RoutingConfig {
    let mut ingress: Vec<TunnelIngress> = tunnel.spec.ingress.clone().unwrap_or_default();
    ingress.push(TunnelIngress::catch_all());
    RoutingConfig {
        tunnel: tunnel_id.to_string(),
        ingress,
    }
}

pub fn render_routing_config_yaml(tunnel: &Tunnel, tunnel_id: &str) -> Result<String> {
    Ok(serde_yaml::to_string(&render_routing_config(tunnel, tunnel_id))?)
}

/// Full artifact Secret for a freshly created tunnel
pub fn build_secret(tunnel: &Tunnel, secret: &TunnelSecret) -> Result<Secret> {
    let bundle = render_credential_bundle(tunnel, secret)?;
    let config = render_routing_config_yaml(tunnel, &bundle.tunnel_id)?;

    let mut string_data = BTreeMap::new();
    string_data.insert(CREDENTIALS_KEY.to_string(), serde_json::to_string(&bundle)?);
    string_data.insert(CONFIG_KEY.to_string(), config);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(tunnel.secret_name()),
            namespace: tunnel.namespace(),
            owner_references: tunnel.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    })
}

/// Write the artifact Secret for a new tunnel, replacing a stale one left by an earlier tunnel.
pub async fn persist_bundle(
    store: &dyn TunnelStore,
    tunnel: &Tunnel,
    secret: &TunnelSecret,
) -> Result<()> {
    let artifact = build_secret(tunnel, secret)?;
    let name = tunnel.secret_name();

    match store.create_secret(&artifact).await {
        Ok(()) => {
            info!(secret = %name, tunnel = %tunnel.name_any(), "Created tunnel secret");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            let ns = tunnel.namespace().unwrap_or_default();
            let existing = store.get_secret(&ns, &name).await?;
            let mut replacement = artifact;
            replacement.metadata.resource_version =
                existing.and_then(|s| s.metadata.resource_version);
            store.replace_secret(&replacement).await?;
            info!(secret = %name, tunnel = %tunnel.name_any(), "Replaced stale tunnel secret");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn stored_config(secret: &Secret) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(CONFIG_KEY)) {
        return String::from_utf8(value.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(CONFIG_KEY))
        .cloned()
}

/// Re-render `config.yaml` into the existing Secret. Returns true when it was written.
///
/// The credentials entry is never touched; a missing Secret is an error since
/// the tunnel secret cannot be recovered.
pub async fn sync_routing_config(
    store: &dyn TunnelStore,
    tunnel: &Tunnel,
    tunnel_id: &str,
) -> Result<bool> {
    let name = tunnel.secret_name();
    let ns = tunnel.namespace().unwrap_or_default();
    let mut secret = store
        .get_secret(&ns, &name)
        .await?
        .ok_or_else(|| Error::MissingArtifact(format!("secret {}/{}", ns, name)))?;

    let rendered = render_routing_config_yaml(tunnel, tunnel_id)?;
    if stored_config(&secret).as_deref() == Some(rendered.as_str()) {
        debug!(secret = %name, "Routing config up to date");
        return Ok(false);
    }

    if let Some(string_data) = secret.string_data.as_mut() {
        string_data.remove(CONFIG_KEY);
    }
    secret
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(CONFIG_KEY.to_string(), ByteString(rendered.into_bytes()));
    store.replace_secret(&secret).await?;

    info!(secret = %name, tunnel = %tunnel.name_any(), "Updated routing config");
    Ok(true)
}
