//! Kubernetes-backed collaborators
//!
//! The declaration store (Tunnel objects and their artifact Secret) and the
//! workload scheduler (cloudflared Deployments), behind traits so the
//! reconciler can run against in-memory fakes.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Tunnel;
use crate::error::{Error, Result};

/// Read-modify-write access to Tunnel declarations and their artifact Secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<Tunnel>>;

    /// Replace spec and metadata (finalizers, pinned template)
    async fn replace_tunnel(&self, tunnel: &Tunnel) -> Result<Tunnel>;

    /// Write the status subresource, guarded by the object's resourceVersion
    async fn replace_tunnel_status(&self, tunnel: &Tunnel) -> Result<Tunnel>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    async fn replace_secret(&self, secret: &Secret) -> Result<()>;
}

/// Scheduler running the cloudflared agent
#[async_trait]
pub trait WorkloadScheduler: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()>;

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a Deployment; deleting an absent one is not an error
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Store and scheduler backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn tunnels(&self, namespace: &str) -> Api<Tunnel> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::MissingArtifact(format!("namespace of {}", obj.name_any())))
}

#[async_trait]
impl TunnelStore for KubeStore {
    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<Tunnel>> {
        Ok(self.tunnels(namespace).get_opt(name).await?)
    }

    async fn replace_tunnel(&self, tunnel: &Tunnel) -> Result<Tunnel> {
        let ns = namespace_of(tunnel)?;
        let name = tunnel.name_any();
        debug!(tunnel = %name, namespace = %ns, "Replacing Tunnel");
        Ok(self
            .tunnels(&ns)
            .replace(&name, &PostParams::default(), tunnel)
            .await?)
    }

    async fn replace_tunnel_status(&self, tunnel: &Tunnel) -> Result<Tunnel> {
        let ns = namespace_of(tunnel)?;
        let name = tunnel.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": tunnel.resource_version() },
            "status": tunnel.status,
        });
        debug!(tunnel = %name, namespace = %ns, "Updating Tunnel status");
        Ok(self
            .tunnels(&ns)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let ns = namespace_of(secret)?;
        self.secrets(&ns)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let ns = namespace_of(secret)?;
        self.secrets(&ns)
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadScheduler for KubeStore {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let ns = namespace_of(deployment)?;
        self.deployments(&ns)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        let ns = namespace_of(deployment)?;
        self.deployments(&ns)
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
