//! Cloudflare API Client
//!
//! Thin wrapper over the v4 REST API covering tunnel registration
//! (`/accounts/{id}/cfd_tunnel`) and zone DNS records.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DnsApi, DnsRecord, DnsRecordRequest, DnsRecordType, ProviderTunnel, TunnelApi};
use crate::config::CloudflareConfig;
use crate::credentials::TunnelSecret;
use crate::error::{Error, Result};

/// Cloudflare API response wrapper
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateTunnelRequest<'a> {
    name: &'a str,
    tunnel_secret: &'a str,
    config_src: &'a str,
}

fn join_errors(errors: &[ApiError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} (code {})", e.message, e.code))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cloudflare client scoped to one account and one zone
pub struct CloudflareClient {
    http_client: Client,
    api_url: String,
    api_token: String,
    account_id: String,
    zone_id: String,
}

impl CloudflareClient {
    /// Build a client and resolve the configured zone name to its ID.
    pub async fn connect(config: &CloudflareConfig) -> Result<Self> {
        config.validate()?;

        let mut client = Self::with_zone_id(config, String::new())?;
        client.zone_id = client.zone_id_by_name(&config.zone_name).await?;

        info!(
            account_id = %client.account_id,
            zone = %config.zone_name,
            zone_id = %client.zone_id,
            "Cloudflare client initialized"
        );
        Ok(client)
    }

    /// Build a client for an already-known zone ID.
    pub fn with_zone_id(config: &CloudflareConfig, zone_id: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("tunnel-operator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            account_id: config.account_id.clone(),
            zone_id,
        })
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    /// Look up zone ID by name
    async fn zone_id_by_name(&self, zone_name: &str) -> Result<String> {
        debug!(zone = %zone_name, "Looking up zone ID");

        let url = format!(
            "{}/zones?name={}",
            self.api_url,
            urlencoding::encode(zone_name)
        );
        let zones: Vec<Zone> = self.send(self.http_client.get(&url)).await?;

        zones
            .into_iter()
            .next()
            .map(|z| z.id)
            .ok_or_else(|| Error::Config(format!("Zone not found: {}", zone_name)))
    }

    /// Send an authenticated request and unwrap the response envelope.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.api_token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(Error::cloudflare(Some(status.as_u16()), body));
            }
        };

        if !status.is_success() || !envelope.success {
            return Err(Error::cloudflare(
                Some(status.as_u16()),
                join_errors(&envelope.errors),
            ));
        }

        envelope
            .result
            .ok_or_else(|| Error::cloudflare(Some(status.as_u16()), "No result in response"))
    }
}

#[async_trait]
impl TunnelApi for CloudflareClient {
    fn account_id(&self) -> String {
        self.account_id.clone()
    }

    async fn list_tunnels(&self, name: &str) -> Result<Vec<ProviderTunnel>> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel?name={}&per_page=100",
            self.api_url,
            self.account_id,
            urlencoding::encode(name)
        );
        self.send(self.http_client.get(&url)).await
    }

    async fn create_tunnel(&self, name: &str, secret: &TunnelSecret) -> Result<ProviderTunnel> {
        let url = format!("{}/accounts/{}/cfd_tunnel", self.api_url, self.account_id);
        let request = CreateTunnelRequest {
            name,
            tunnel_secret: secret.as_str(),
            config_src: "local",
        };

        let tunnel: ProviderTunnel = self.send(self.http_client.post(&url).json(&request)).await?;
        info!(tunnel = %name, tunnel_id = %tunnel.id, "Created Cloudflare tunnel");
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}",
            self.api_url, self.account_id, tunnel_id
        );
        let _: serde_json::Value = self.send(self.http_client.delete(&url)).await?;
        info!(tunnel_id = %tunnel_id, "Deleted Cloudflare tunnel");
        Ok(())
    }
}

#[async_trait]
impl DnsApi for CloudflareClient {
    async fn list_records(&self, record_type: DnsRecordType, name: &str) -> Result<Vec<DnsRecord>> {
        let url = format!(
            "{}/zones/{}/dns_records?type={}&name={}",
            self.api_url,
            self.zone_id,
            record_type,
            urlencoding::encode(name)
        );
        self.send(self.http_client.get(&url)).await
    }

    async fn create_record(&self, request: &DnsRecordRequest) -> Result<DnsRecord> {
        let url = format!("{}/zones/{}/dns_records", self.api_url, self.zone_id);
        let record: DnsRecord = self.send(self.http_client.post(&url).json(request)).await?;
        info!(
            hostname = %record.name,
            content = %record.content,
            record_id = %record.id,
            "Created DNS record"
        );
        Ok(record)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.api_url, self.zone_id, record_id
        );
        let _: serde_json::Value = self.send(self.http_client.delete(&url)).await?;
        info!(record_id = %record_id, "Deleted DNS record");
        Ok(())
    }
}
