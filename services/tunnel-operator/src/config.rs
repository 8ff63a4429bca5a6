//! Operator configuration
//!
//! Resolved once at startup from flags and environment, then shared read-only
//! with every collaborator.

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_ROUTING_DOMAIN: &str = "cfargotunnel.com";
pub const DEFAULT_CLOUDFLARED_IMAGE: &str = "cloudflare/cloudflared:2022.1.3";

/// Credentials and scope for the Cloudflare account the operator drives
#[derive(Clone)]
pub struct CloudflareConfig {
    /// Base URL of the v4 REST API
    pub api_url: String,
    /// API token with Tunnel:Edit and DNS:Edit permissions
    pub api_token: String,
    /// Account that owns the tunnels
    pub account_id: String,
    /// DNS zone in which tunnel hostnames are published
    pub zone_name: String,
}

impl CloudflareConfig {
    pub fn validate(&self) -> Result<()> {
        if self.api_token.trim().is_empty() {
            return Err(Error::Config("missing Cloudflare API token".to_string()));
        }
        if self.account_id.trim().is_empty() {
            return Err(Error::Config("missing Cloudflare account ID".to_string()));
        }
        if self.zone_name.trim().is_empty() {
            return Err(Error::Config("missing Cloudflare zone name".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("zone_name", &self.zone_name)
            .finish()
    }
}

/// Process-wide operator settings
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Domain under which tunnel identities resolve (`<id>.<routing_domain>`)
    pub routing_domain: String,
    /// Image used by the default cloudflared workload template
    pub cloudflared_image: String,
    /// Requeue delay after a successful, quiescent reconcile
    pub resync_interval: Duration,
    /// Requeue delay after the workload was rolled to a new tunnel identity
    pub rollout_cooldown: Duration,
    /// Requeue delay after a single committed mutation
    pub mutation_requeue: Duration,
    /// Requeue delay after a failed reconcile
    pub error_backoff: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            routing_domain: DEFAULT_ROUTING_DOMAIN.to_string(),
            cloudflared_image: DEFAULT_CLOUDFLARED_IMAGE.to_string(),
            resync_interval: Duration::from_secs(300),
            rollout_cooldown: Duration::from_secs(60),
            mutation_requeue: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    /// CNAME target for a tunnel identity.
    pub fn cname_target(&self, tunnel_id: &str) -> String {
        format!("{}.{}", tunnel_id, self.routing_domain)
    }
}
