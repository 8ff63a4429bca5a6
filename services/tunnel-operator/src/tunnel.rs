//! Tunnel lifecycle
//!
//! Ensures exactly one provider tunnel exists per declaration, records its
//! identity, and deletes it on teardown. Creation is all-or-nothing: if the
//! credential bundle or the status cannot be persisted, the tunnel that was
//! just registered is deleted again before the error surfaces.

use std::future::Future;

use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::cloudflare::TunnelApi;
use crate::credentials::{generate_tunnel_secret, TunnelSecret};
use crate::crd::{
    Condition, Tunnel, CONDITION_CREATED, REASON_ALREADY_EXISTS, REASON_CREATION_FAILED,
    REASON_CREATION_SUCCEEDED, REASON_TUNNEL_MISSING,
};
use crate::error::{Error, Result};
use crate::kube_store::TunnelStore;

/// Outcome of [`TunnelManager::ensure_exists`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredTunnel {
    pub tunnel_id: String,
    /// True when the tunnel was registered during this call
    pub created: bool,
}

pub struct TunnelManager<'a> {
    store: &'a dyn TunnelStore,
    provider: &'a dyn TunnelApi,
}

impl<'a> TunnelManager<'a> {
    pub fn new(store: &'a dyn TunnelStore, provider: &'a dyn TunnelApi) -> Self {
        Self { store, provider }
    }

    /// Look up the declared tunnel by name and create it when absent.
    ///
    /// `persist_bundle` receives the declaration with its new identity already
    /// recorded in status, plus the freshly generated secret. It runs only on
    /// creation.
    pub async fn ensure_exists<F, Fut>(
        &self,
        tunnel: &Tunnel,
        persist_bundle: F,
    ) -> Result<EnsuredTunnel>
    where
        F: FnOnce(Tunnel, TunnelSecret) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let name = &tunnel.spec.name;
        let recorded = tunnel.tunnel_id();

        let live: Vec<_> = self
            .provider
            .list_tunnels(name)
            .await?
            .into_iter()
            .filter(|t| &t.name == name && t.is_live())
            .collect();

        match (live.first(), recorded) {
            (Some(found), Some(id)) if found.id == id => Ok(EnsuredTunnel {
                tunnel_id: found.id.clone(),
                created: false,
            }),
            (Some(found), _) => {
                let message = match recorded {
                    Some(id) => format!(
                        "Cloudflare tunnel {} exists with ID {} but {} is recorded",
                        name, found.id, id
                    ),
                    None => format!("Cloudflare tunnel already exists with name {}", name),
                };
                self.report_conflict(tunnel, REASON_ALREADY_EXISTS, message)
                    .await
            }
            (None, Some(id)) => {
                let message = format!(
                    "Cloudflare tunnel {} with recorded ID {} no longer exists",
                    name, id
                );
                self.report_conflict(tunnel, REASON_TUNNEL_MISSING, message)
                    .await
            }
            (None, None) => self.create(tunnel, persist_bundle).await,
        }
    }

    async fn create<F, Fut>(&self, tunnel: &Tunnel, persist_bundle: F) -> Result<EnsuredTunnel>
    where
        F: FnOnce(Tunnel, TunnelSecret) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let name = &tunnel.spec.name;
        let secret = generate_tunnel_secret();

        info!(tunnel = %name, "Creating Cloudflare tunnel");
        let created = match self.provider.create_tunnel(name, &secret).await {
            Ok(created) => created,
            Err(e) => {
                error!(tunnel = %name, error = %e, "Failed to create Cloudflare tunnel");
                let mut failed = tunnel.clone();
                failed.status_mut().set_condition(Condition::new(
                    CONDITION_CREATED,
                    false,
                    REASON_CREATION_FAILED,
                    format!("Cloudflare tunnel creation failed: {}", e),
                ));
                if let Err(status_err) = self.store.replace_tunnel_status(&failed).await {
                    warn!(tunnel = %name, error = %status_err, "Failed to record CreationFailed condition");
                    return Err(status_err);
                }
                return Err(e);
            }
        };

        let mut updated = tunnel.clone();
        let status = updated.status_mut();
        status.account_id = Some(self.provider.account_id());
        status.tunnel_id = Some(created.id.clone());
        status.set_condition(Condition::new(
            CONDITION_CREATED,
            true,
            REASON_CREATION_SUCCEEDED,
            format!("Cloudflare tunnel created successfully with ID {}", created.id),
        ));

        let committed = match persist_bundle(updated.clone(), secret).await {
            Ok(()) => self.store.replace_tunnel_status(&updated).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            error!(
                tunnel = %name,
                tunnel_id = %created.id,
                error = %e,
                "Failed to persist new tunnel, deleting it"
            );
            if let Err(cleanup) = self.release(&created.id).await {
                error!(tunnel_id = %created.id, error = %cleanup, "Compensating delete failed");
            }
            return Err(e);
        }

        info!(
            tunnel = %name,
            tunnel_id = %created.id,
            resource = %tunnel.name_any(),
            "Tunnel created"
        );
        Ok(EnsuredTunnel {
            tunnel_id: created.id,
            created: true,
        })
    }

    async fn report_conflict(
        &self,
        tunnel: &Tunnel,
        reason: &str,
        message: String,
    ) -> Result<EnsuredTunnel> {
        warn!(tunnel = %tunnel.spec.name, reason = %reason, "{}", message);

        let mut failed = tunnel.clone();
        failed
            .status_mut()
            .set_condition(Condition::new(CONDITION_CREATED, false, reason, message.clone()));
        if failed.status != tunnel.status {
            self.store.replace_tunnel_status(&failed).await?;
        }

        Err(Error::Conflict(message))
    }

    /// Delete the provider tunnel. An already-deleted tunnel is not an error.
    pub async fn release(&self, tunnel_id: &str) -> Result<()> {
        info!(tunnel_id = %tunnel_id, "Deleting Cloudflare tunnel");
        match self.provider.delete_tunnel(tunnel_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(tunnel_id = %tunnel_id, "Cloudflare tunnel already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
