//! Finalizer guard
//!
//! Keeps a Tunnel in the store until every provider-side resource it owns has
//! been released. Deletion is re-entrant: a failed release leaves the
//! finalizer in place and the next trigger resumes from the same point.

use std::future::Future;

use kube::ResourceExt;
use tracing::{info, warn};

use crate::crd::{Tunnel, TUNNEL_FINALIZER};
use crate::error::Result;
use crate::kube_store::TunnelStore;

/// Attach the finalizer if absent. Returns true when the declaration was written.
pub async fn ensure_attached(store: &dyn TunnelStore, tunnel: &Tunnel) -> Result<bool> {
    if tunnel.has_finalizer() {
        return Ok(false);
    }

    let mut updated = tunnel.clone();
    updated
        .finalizers_mut()
        .push(TUNNEL_FINALIZER.to_string());
    store.replace_tunnel(&updated).await?;

    info!(tunnel = %tunnel.name_any(), "Added finalizer");
    Ok(true)
}

/// Run `release` and drop the finalizer once it succeeds.
///
/// A declaration that never recorded a provider identity owns nothing
/// external, so its finalizer is removed without releasing anything.
pub async fn drain_and_release<F, Fut>(
    store: &dyn TunnelStore,
    tunnel: &Tunnel,
    release: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if !tunnel.has_finalizer() {
        return Ok(());
    }

    if tunnel.tunnel_id().is_none() {
        info!(tunnel = %tunnel.name_any(), "No tunnel recorded, nothing to release");
        return remove(store, tunnel).await;
    }

    if let Err(e) = release().await {
        warn!(
            tunnel = %tunnel.name_any(),
            error = %e,
            "Release failed, keeping finalizer"
        );
        return Err(e);
    }

    remove(store, tunnel).await
}

async fn remove(store: &dyn TunnelStore, tunnel: &Tunnel) -> Result<()> {
    let mut updated = tunnel.clone();
    updated.finalizers_mut().retain(|f| f != TUNNEL_FINALIZER);
    store.replace_tunnel(&updated).await?;

    info!(tunnel = %tunnel.name_any(), "Removed finalizer");
    Ok(())
}
