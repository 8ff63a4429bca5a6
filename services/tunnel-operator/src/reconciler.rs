//! Reconcile orchestrator
//!
//! Each invocation re-reads the Tunnel, works through finalizer, tunnel,
//! DNS, config and workload in that order, and stops at the first step that
//! committed a change. The requeue it returns decides when the next step runs.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::cloudflare::{DnsApi, TunnelApi};
use crate::config::OperatorConfig;
use crate::crd::Tunnel;
use crate::dns::{drain_set, DnsSync};
use crate::error::{Error, Result};
use crate::finalizer;
use crate::kube_store::{TunnelStore, WorkloadScheduler};
use crate::secret;
use crate::tunnel::TunnelManager;
use crate::workload::{WorkloadManager, WorkloadOutcome};

/// Shared collaborators handed to every reconcile
pub struct Context {
    pub store: Arc<dyn TunnelStore>,
    pub scheduler: Arc<dyn WorkloadScheduler>,
    pub tunnels: Arc<dyn TunnelApi>,
    pub dns: Arc<dyn DnsApi>,
    pub config: OperatorConfig,
}

/// Where a Tunnel is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Deleting,
    Creating,
    Converging,
}

impl Phase {
    pub fn of(tunnel: &Tunnel) -> Self {
        if tunnel.is_deleting() {
            Phase::Deleting
        } else if !tunnel.has_finalizer() || tunnel.tunnel_id().is_none() {
            Phase::Creating
        } else {
            Phase::Converging
        }
    }
}

/// Reconcile a Tunnel resource
#[instrument(skip(tunnel, ctx), fields(tunnel = %tunnel.name_any(), namespace = ?tunnel.namespace()))]
pub async fn reconcile(tunnel: Arc<Tunnel>, ctx: Arc<Context>) -> Result<Action> {
    let name = tunnel.name_any();
    let namespace = tunnel
        .namespace()
        .ok_or_else(|| Error::MissingArtifact(format!("namespace of {}", name)))?;

    // Desired state is always read fresh.
    let Some(tunnel) = ctx.store.get_tunnel(&namespace, &name).await? else {
        debug!("Tunnel not found, assuming deleted");
        return Ok(Action::await_change());
    };

    let phase = Phase::of(&tunnel);
    debug!(?phase, "Reconciling");

    match phase {
        Phase::Deleting => delete(&tunnel, &ctx).await,
        Phase::Creating | Phase::Converging => apply(&tunnel, &ctx).await,
    }
}

async fn apply(tunnel: &Tunnel, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    let config = &ctx.config;
    let changed = Action::requeue(config.mutation_requeue);

    if finalizer::ensure_attached(store, tunnel).await? {
        return Ok(changed);
    }

    let manager = TunnelManager::new(store, ctx.tunnels.as_ref());
    let ensured = manager
        .ensure_exists(tunnel, move |updated, tunnel_secret| async move {
            secret::persist_bundle(store, &updated, &tunnel_secret).await
        })
        .await?;
    if ensured.created {
        return Ok(changed);
    }
    let tunnel_id = ensured.tunnel_id.as_str();

    let dns = DnsSync::new(ctx.dns.as_ref(), store, config);
    let outcome = dns.converge(tunnel, tunnel_id).await?;
    if outcome.is_mutation() {
        debug!(?outcome, "DNS changed");
        return Ok(changed);
    }

    if secret::sync_routing_config(store, tunnel, tunnel_id).await? {
        return Ok(changed);
    }

    let workload = WorkloadManager::new(ctx.scheduler.as_ref(), store, config);
    match workload.converge(tunnel, tunnel_id).await? {
        WorkloadOutcome::Unchanged => {
            debug!("Tunnel converged");
            Ok(Action::requeue(config.resync_interval))
        }
        WorkloadOutcome::RolledOut => Ok(Action::requeue(config.rollout_cooldown)),
        WorkloadOutcome::TemplatePinned | WorkloadOutcome::Created | WorkloadOutcome::Deleted => {
            Ok(changed)
        }
    }
}

async fn delete(tunnel: &Tunnel, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    let dns = DnsSync::new(ctx.dns.as_ref(), store, &ctx.config);
    let workload = WorkloadManager::new(ctx.scheduler.as_ref(), store, &ctx.config);
    let manager = TunnelManager::new(store, ctx.tunnels.as_ref());

    let (dns, workload, manager) = (&dns, &workload, &manager);
    finalizer::drain_and_release(store, tunnel, move || async move {
        if let Some(tunnel_id) = tunnel.tunnel_id() {
            dns.drain(&drain_set(tunnel), tunnel_id).await?;
            workload.scale_to_zero(tunnel).await?;
            manager.release(tunnel_id).await?;
            info!(tunnel_id = %tunnel_id, "Released tunnel");
        }
        Ok(())
    })
    .await?;

    Ok(Action::await_change())
}

/// Requeue policy for failed reconciles
pub fn error_policy(tunnel: Arc<Tunnel>, error: &Error, ctx: Arc<Context>) -> Action {
    match error {
        Error::Conflict(_) => {
            warn!(
                tunnel = %tunnel.name_any(),
                namespace = ?tunnel.namespace(),
                %error,
                "Tunnel conflicts with provider state"
            );
            Action::requeue(ctx.config.resync_interval)
        }
        _ => {
            error!(
                tunnel = %tunnel.name_any(),
                namespace = ?tunnel.namespace(),
                %error,
                "Tunnel reconciliation failed"
            );
            Action::requeue(ctx.config.error_backoff)
        }
    }
}
