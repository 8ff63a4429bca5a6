//! Tunnel Operator Library
//!
//! Converges `Tunnel` resources onto Cloudflare: a registered tunnel, one
//! proxied CNAME per hostname, the cloudflared credentials and config Secret,
//! and optionally a cloudflared Deployment. Deletion is guarded by a
//! finalizer until every provider-side resource has been released.

pub mod cloudflare;
pub mod config;
pub mod credentials;
pub mod crd;
pub mod dns;
pub mod error;
pub mod finalizer;
pub mod kube_store;
pub mod reconciler;
pub mod secret;
pub mod tunnel;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use cloudflare::CloudflareClient;
pub use config::{CloudflareConfig, OperatorConfig};
pub use crd::{Tunnel, TunnelSpec, TunnelStatus};
pub use error::{Error, Result};
pub use kube_store::KubeStore;
pub use reconciler::{error_policy, reconcile, Context};
