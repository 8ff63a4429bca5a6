//! In-memory collaborators for reconciler tests

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use crate::cloudflare::{DnsApi, DnsRecord, DnsRecordRequest, DnsRecordType, ProviderTunnel, TunnelApi};
use crate::credentials::TunnelSecret;
use crate::crd::{Tunnel, TunnelIngress, TunnelSpec};
use crate::error::{Error, Result};
use crate::kube_store::{TunnelStore, WorkloadScheduler};

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_ACCOUNT: &str = "acct";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

impl TunnelSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_hostnames(name: &str, hostnames: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            ingress: Some(
                hostnames
                    .iter()
                    .map(|h| TunnelIngress {
                        hostname: h.to_string(),
                        service: Some(format!("http://{}:80", h.split('.').next().unwrap_or("svc"))),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// A Tunnel as the API server would hand it out: namespaced, with a uid
pub fn test_tunnel(name: &str, spec: TunnelSpec) -> Tunnel {
    let mut tunnel = Tunnel::new(name, spec);
    tunnel.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    tunnel.metadata.uid = Some(format!("uid-{}", name));
    tunnel
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterCounters {
    pub tunnel_writes: usize,
    pub status_writes: usize,
    pub secret_writes: usize,
    pub deployment_writes: usize,
    pub deployment_deletes: usize,
}

#[derive(Default)]
pub struct ClusterState {
    pub tunnels: BTreeMap<Key, Tunnel>,
    pub secrets: BTreeMap<Key, Secret>,
    pub deployments: BTreeMap<Key, Deployment>,
    pub counters: ClusterCounters,
    pub fail_secret_writes: bool,
    pub fail_status_updates: bool,
    next_version: u64,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Declaration store and workload scheduler with API-server-like write semantics
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    /// Store a declaration as if it had been applied by a user
    pub fn insert(&self, mut tunnel: Tunnel) -> Tunnel {
        let mut state = self.state();
        tunnel.metadata.resource_version = Some(state.bump());
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        state.tunnels.insert(k, tunnel.clone());
        tunnel
    }

    pub fn tunnel(&self, name: &str) -> Tunnel {
        self.try_tunnel(name).unwrap()
    }

    pub fn try_tunnel(&self, name: &str) -> Option<Tunnel> {
        self.state().tunnels.get(&key(TEST_NAMESPACE, name)).cloned()
    }

    /// Apply a user edit to the spec
    pub fn edit_spec(&self, name: &str, edit: impl FnOnce(&mut TunnelSpec)) {
        let mut state = self.state();
        let version = state.bump();
        let tunnel = state.tunnels.get_mut(&key(TEST_NAMESPACE, name)).unwrap();
        edit(&mut tunnel.spec);
        tunnel.metadata.resource_version = Some(version);
    }

    /// Request deletion; objects without finalizers disappear immediately
    pub fn request_delete(&self, name: &str) {
        let mut state = self.state();
        let version = state.bump();
        let k = key(TEST_NAMESPACE, name);
        if state.tunnels[&k].finalizers().is_empty() {
            state.tunnels.remove(&k);
            return;
        }
        let tunnel = state.tunnels.get_mut(&k).unwrap();
        tunnel.metadata.deletion_timestamp = Some(Time(Utc::now()));
        tunnel.metadata.resource_version = Some(version);
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(&key(TEST_NAMESPACE, name)).cloned()
    }

    /// Value of one Secret key as text
    pub fn secret_value(&self, name: &str, data_key: &str) -> Option<String> {
        let secret = self.secret(name)?;
        let bytes = secret.data?.get(data_key)?.0.clone();
        String::from_utf8(bytes).ok()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.state().deployments.get(&key(TEST_NAMESPACE, name)).cloned()
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        let k = key(
            &deployment.namespace().unwrap_or_default(),
            &deployment.name_any(),
        );
        self.state().deployments.insert(k, deployment);
    }

    pub fn counters(&self) -> ClusterCounters {
        self.state().counters.clone()
    }
}

// The API server folds stringData into data on write.
fn normalize_secret(secret: &Secret) -> Secret {
    let mut stored = secret.clone();
    let mut data = stored.data.take().unwrap_or_default();
    for (k, v) in stored.string_data.take().unwrap_or_default() {
        data.insert(k, ByteString(v.into_bytes()));
    }
    stored.data = Some(data);
    stored
}

#[async_trait]
impl TunnelStore for FakeCluster {
    async fn get_tunnel(&self, namespace: &str, name: &str) -> Result<Option<Tunnel>> {
        Ok(self.state().tunnels.get(&key(namespace, name)).cloned())
    }

    async fn replace_tunnel(&self, tunnel: &Tunnel) -> Result<Tunnel> {
        let mut state = self.state();
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        let existing = state
            .tunnels
            .get(&k)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("tunnel {} not found", k.1)))?;
        if existing.resource_version() != tunnel.resource_version() {
            return Err(api_error(409, "Conflict", "object has been modified".to_string()));
        }

        let mut stored = tunnel.clone();
        stored.status = existing.status.clone();
        stored.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.counters.tunnel_writes += 1;

        if stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            state.tunnels.remove(&k);
        } else {
            state.tunnels.insert(k, stored.clone());
        }
        Ok(stored)
    }

    async fn replace_tunnel_status(&self, tunnel: &Tunnel) -> Result<Tunnel> {
        let mut state = self.state();
        if state.fail_status_updates {
            return Err(api_error(500, "InternalError", "etcd unavailable".to_string()));
        }
        let k = key(&tunnel.namespace().unwrap_or_default(), &tunnel.name_any());
        let mut stored = state
            .tunnels
            .get(&k)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("tunnel {} not found", k.1)))?;
        if stored.resource_version() != tunnel.resource_version() {
            return Err(api_error(409, "Conflict", "object has been modified".to_string()));
        }

        stored.status = tunnel.status.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.counters.status_writes += 1;
        state.tunnels.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.state().secrets.get(&key(namespace, name)).cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.state();
        if state.fail_secret_writes {
            return Err(api_error(403, "Forbidden", "secrets is forbidden".to_string()));
        }
        let k = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        if state.secrets.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("secret {} already exists", k.1)));
        }
        let mut stored = normalize_secret(secret);
        stored.metadata.resource_version = Some(state.bump());
        state.counters.secret_writes += 1;
        state.secrets.insert(k, stored);
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let mut state = self.state();
        if state.fail_secret_writes {
            return Err(api_error(403, "Forbidden", "secrets is forbidden".to_string()));
        }
        let k = key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        if !state.secrets.contains_key(&k) {
            return Err(api_error(404, "NotFound", format!("secret {} not found", k.1)));
        }
        let mut stored = normalize_secret(secret);
        stored.metadata.resource_version = Some(state.bump());
        state.counters.secret_writes += 1;
        state.secrets.insert(k, stored);
        Ok(())
    }
}

#[async_trait]
impl WorkloadScheduler for FakeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.state().deployments.get(&key(namespace, name)).cloned())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut state = self.state();
        let k = key(&deployment.namespace().unwrap_or_default(), &deployment.name_any());
        if state.deployments.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("deployment {} already exists", k.1)));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.counters.deployment_writes += 1;
        state.deployments.insert(k, stored);
        Ok(())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut state = self.state();
        let k = key(&deployment.namespace().unwrap_or_default(), &deployment.name_any());
        if !state.deployments.contains_key(&k) {
            return Err(api_error(404, "NotFound", format!("deployment {} not found", k.1)));
        }
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.counters.deployment_writes += 1;
        state.deployments.insert(k, stored);
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.deployments.remove(&key(namespace, name)).is_some() {
            state.counters.deployment_deletes += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CloudCounters {
    pub tunnel_creates: usize,
    pub tunnel_deletes: usize,
    pub record_creates: usize,
    pub record_deletes: usize,
}

impl CloudCounters {
    pub fn dns_mutations(&self) -> usize {
        self.record_creates + self.record_deletes
    }
}

#[derive(Default)]
pub struct CloudState {
    pub tunnels: Vec<ProviderTunnel>,
    pub tunnel_secrets: BTreeMap<String, String>,
    pub records: Vec<DnsRecord>,
    pub counters: CloudCounters,
    pub fail_tunnel_create: bool,
    pub fail_tunnel_delete: bool,
    pub fail_dns: bool,
    next_id: u64,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Provider tunnel registry and DNS zone
#[derive(Default)]
pub struct FakeCloudflare {
    state: Mutex<CloudState>,
}

impl FakeCloudflare {
    pub fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    /// Register a tunnel out of band and return its id
    pub fn seed_tunnel(&self, name: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("tunnel");
        state.tunnels.push(ProviderTunnel {
            id: id.clone(),
            name: name.to_string(),
            deleted_at: None,
        });
        id
    }

    pub fn mark_deleted(&self, tunnel_id: &str) {
        let mut state = self.state();
        if let Some(t) = state.tunnels.iter_mut().find(|t| t.id == tunnel_id) {
            t.deleted_at = Some(Utc::now());
        }
    }

    pub fn live_tunnels(&self, name: &str) -> Vec<ProviderTunnel> {
        self.state()
            .tunnels
            .iter()
            .filter(|t| t.name == name && t.is_live())
            .cloned()
            .collect()
    }

    pub fn seed_record(&self, hostname: &str, content: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("record");
        state.records.push(DnsRecord {
            id: id.clone(),
            name: hostname.to_string(),
            record_type: DnsRecordType::CNAME,
            content: content.to_string(),
            proxied: true,
        });
        id
    }

    pub fn remove_record(&self, hostname: &str) {
        self.state().records.retain(|r| r.name != hostname);
    }

    /// Hostnames with a CNAME record, sorted
    pub fn cname_hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .records
            .iter()
            .filter(|r| r.record_type == DnsRecordType::CNAME)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn records_for(&self, hostname: &str) -> Vec<DnsRecord> {
        self.state()
            .records
            .iter()
            .filter(|r| r.name == hostname)
            .cloned()
            .collect()
    }

    pub fn counters(&self) -> CloudCounters {
        self.state().counters.clone()
    }
}

#[async_trait]
impl TunnelApi for FakeCloudflare {
    fn account_id(&self) -> String {
        TEST_ACCOUNT.to_string()
    }

    async fn list_tunnels(&self, name: &str) -> Result<Vec<ProviderTunnel>> {
        Ok(self
            .state()
            .tunnels
            .iter()
            .filter(|t| t.name == name)
            .cloned()
            .collect())
    }

    async fn create_tunnel(&self, name: &str, secret: &TunnelSecret) -> Result<ProviderTunnel> {
        let mut state = self.state();
        if state.fail_tunnel_create {
            return Err(Error::cloudflare(Some(500), "tunnel creation unavailable"));
        }
        let id = state.next_id("tunnel");
        let tunnel = ProviderTunnel {
            id: id.clone(),
            name: name.to_string(),
            deleted_at: None,
        };
        state.tunnels.push(tunnel.clone());
        state.tunnel_secrets.insert(id, secret.as_str().to_string());
        state.counters.tunnel_creates += 1;
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_tunnel_delete {
            return Err(Error::cloudflare(Some(400), "tunnel has active connections"));
        }
        let tunnel = state
            .tunnels
            .iter_mut()
            .find(|t| t.id == tunnel_id && t.is_live())
            .ok_or_else(|| Error::cloudflare(Some(404), "tunnel not found"))?;
        tunnel.deleted_at = Some(Utc::now());
        state.counters.tunnel_deletes += 1;
        Ok(())
    }
}

#[async_trait]
impl DnsApi for FakeCloudflare {
    async fn list_records(&self, record_type: DnsRecordType, name: &str) -> Result<Vec<DnsRecord>> {
        let state = self.state();
        if state.fail_dns {
            return Err(Error::cloudflare(Some(503), "dns unavailable"));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| r.record_type == record_type && r.name == name)
            .cloned()
            .collect())
    }

    async fn create_record(&self, request: &DnsRecordRequest) -> Result<DnsRecord> {
        let mut state = self.state();
        if state.fail_dns {
            return Err(Error::cloudflare(Some(503), "dns unavailable"));
        }
        let record = DnsRecord {
            id: state.next_id("record"),
            name: request.name.clone(),
            record_type: request.record_type,
            content: request.content.clone(),
            proxied: request.proxied,
        };
        state.records.push(record.clone());
        state.counters.record_creates += 1;
        Ok(record)
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_dns {
            return Err(Error::cloudflare(Some(503), "dns unavailable"));
        }
        let before = state.records.len();
        state.records.retain(|r| r.id != record_id);
        if state.records.len() == before {
            return Err(Error::cloudflare(Some(404), "record not found"));
        }
        state.counters.record_deletes += 1;
        Ok(())
    }
}
