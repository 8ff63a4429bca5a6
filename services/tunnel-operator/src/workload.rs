//! cloudflared workload
//!
//! When a Tunnel asks to run, a Deployment named after it runs cloudflared
//! with the artifact Secret mounted at `/config`. The running Deployment is
//! tagged with the tunnel identity; a stale tag triggers a rollout.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::crd::Tunnel;
use crate::error::Result;
use crate::kube_store::{TunnelStore, WorkloadScheduler};

pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "cloudflared-run";
/// Generation tag carrying the tunnel identity
pub const TUNNEL_ID_LABEL: &str = "tunnel-id";

pub const CONTAINER_NAME: &str = "cloudflared";
pub const CONFIG_VOLUME: &str = "cloudflared-config";
pub const CONFIG_MOUNT_PATH: &str = "/config";
pub const METRICS_PORT: i32 = 10000;

pub fn workload_labels(tunnel_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
        (TUNNEL_ID_LABEL.to_string(), tunnel_id.to_string()),
    ])
}

fn cloudflared_args() -> Vec<String> {
    [
        "tunnel",
        "--config",
        "/config/config.yaml",
        "--metrics",
        "0.0.0.0:10000",
        "run",
        "--credentials-file",
        "/config/credentials.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Template pinned into a Tunnel that runs without one
pub fn default_deployment_spec(tunnel: &Tunnel, tunnel_id: &str, image: &str) -> DeploymentSpec {
    let labels = workload_labels(tunnel_id);

    DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(image.to_string()),
                    args: Some(cloudflared_args()),
                    ports: Some(vec![ContainerPort {
                        name: Some("metrics".to_string()),
                        container_port: METRICS_PORT,
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![VolumeMount {
                        name: CONFIG_VOLUME.to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: CONFIG_VOLUME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(tunnel.secret_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

/// Deployment to run for `tunnel`; selector and pod labels always carry the current identity
pub fn deployment_for_tunnel(tunnel: &Tunnel, tunnel_id: &str, image: &str) -> Deployment {
    let labels = workload_labels(tunnel_id);
    let mut spec = tunnel
        .spec
        .deployment_spec
        .clone()
        .unwrap_or_else(|| default_deployment_spec(tunnel, tunnel_id, image));

    spec.selector.match_labels = Some(labels.clone());
    spec.template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels = Some(labels.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(tunnel.name_any()),
            namespace: tunnel.namespace(),
            labels: Some(labels),
            owner_references: tunnel.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

fn generation_tag(deployment: &Deployment) -> Option<&str> {
    deployment.labels().get(TUNNEL_ID_LABEL).map(String::as_str)
}

fn is_managed(deployment: &Deployment) -> bool {
    deployment.labels().get(APP_LABEL).map(String::as_str) == Some(APP_LABEL_VALUE)
}

/// What a workload pass changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Unchanged,
    /// The default template was written into the Tunnel spec
    TemplatePinned,
    Created,
    /// The Deployment was updated to a new tunnel identity
    RolledOut,
    Deleted,
}

pub struct WorkloadManager<'a> {
    scheduler: &'a dyn WorkloadScheduler,
    store: &'a dyn TunnelStore,
    config: &'a OperatorConfig,
}

impl<'a> WorkloadManager<'a> {
    pub fn new(
        scheduler: &'a dyn WorkloadScheduler,
        store: &'a dyn TunnelStore,
        config: &'a OperatorConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
        }
    }

    /// Bring the workload in line with `spec.run`, one change per call.
    pub async fn converge(&self, tunnel: &Tunnel, tunnel_id: &str) -> Result<WorkloadOutcome> {
        let ns = tunnel.namespace().unwrap_or_default();
        let name = tunnel.name_any();

        if !tunnel.spec.run {
            return match self.scheduler.get_deployment(&ns, &name).await? {
                Some(existing) if is_managed(&existing) => {
                    info!(deployment = %name, namespace = %ns, "Deleting cloudflared Deployment");
                    self.scheduler.delete_deployment(&ns, &name).await?;
                    Ok(WorkloadOutcome::Deleted)
                }
                _ => Ok(WorkloadOutcome::Unchanged),
            };
        }

        if tunnel.spec.deployment_spec.is_none() {
            let mut pinned = tunnel.clone();
            pinned.spec.deployment_spec = Some(default_deployment_spec(
                tunnel,
                tunnel_id,
                &self.config.cloudflared_image,
            ));
            self.store.replace_tunnel(&pinned).await?;
            info!(tunnel = %name, "Pinned default workload template");
            return Ok(WorkloadOutcome::TemplatePinned);
        }

        let desired = deployment_for_tunnel(tunnel, tunnel_id, &self.config.cloudflared_image);
        let existing = match self.scheduler.get_deployment(&ns, &name).await? {
            Some(existing) => existing,
            None => {
                info!(deployment = %name, namespace = %ns, "Creating cloudflared Deployment");
                self.scheduler.create_deployment(&desired).await?;
                return Ok(WorkloadOutcome::Created);
            }
        };

        if generation_tag(&existing) != Some(tunnel_id) {
            info!(
                deployment = %name,
                from = ?generation_tag(&existing),
                to = %tunnel_id,
                "Rolling cloudflared Deployment to new tunnel"
            );
            let mut updated = desired;
            updated.metadata.resource_version = existing.resource_version();
            // Selectors are immutable; keep the running one and its pod labels.
            if let (Some(spec), Some(running)) = (updated.spec.as_mut(), existing.spec.as_ref()) {
                spec.selector = running.selector.clone();
                spec.template
                    .metadata
                    .get_or_insert_with(ObjectMeta::default)
                    .labels = running.selector.match_labels.clone();
            }
            self.scheduler.replace_deployment(&updated).await?;
            return Ok(WorkloadOutcome::RolledOut);
        }

        debug!(deployment = %name, "Workload up to date");
        Ok(WorkloadOutcome::Unchanged)
    }

    /// Stop the agent before its tunnel is deleted. Returns true when replicas were changed.
    pub async fn scale_to_zero(&self, tunnel: &Tunnel) -> Result<bool> {
        let ns = tunnel.namespace().unwrap_or_default();
        let name = tunnel.name_any();

        let Some(mut deployment) = self.scheduler.get_deployment(&ns, &name).await? else {
            return Ok(false);
        };
        if !is_managed(&deployment) {
            return Ok(false);
        }
        let Some(spec) = deployment.spec.as_mut() else {
            return Ok(false);
        };
        if spec.replicas == Some(0) {
            return Ok(false);
        }

        spec.replicas = Some(0);
        self.scheduler.replace_deployment(&deployment).await?;
        info!(deployment = %name, namespace = %ns, "Scaled cloudflared Deployment to zero");
        Ok(true)
    }
}
