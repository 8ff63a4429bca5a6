//! DNS Sync
//!
//! Publishes one proxied CNAME per declared hostname and keeps the observed
//! hostname list in status in step with the zone, one change per cycle.
//! Only records pointing at this tunnel are recorded or deleted; a CNAME
//! owned by anything else is reported through the `DNSRecords` condition.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cloudflare::{DnsApi, DnsRecordRequest, DnsRecordType};
use crate::config::OperatorConfig;
use crate::crd::{
    Condition, ConditionStatus, Tunnel, CONDITION_DNS_RECORDS, REASON_RECORDS_SYNCED,
    REASON_RECORD_CONFLICT,
};
use crate::error::Result;
use crate::kube_store::TunnelStore;

/// What a DNS pass changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsOutcome {
    /// Zone and observed state already match the declaration
    Unchanged,
    /// A CNAME was created (and the hostname recorded)
    RecordCreated(String),
    /// An existing record pointing at this tunnel was adopted into observed state
    HostnameRecorded(String),
    /// A hostname no longer ours was dropped from status (and its record deleted)
    HostnameRemoved(String),
    /// The `DNSRecords` condition was set or cleared
    ConditionUpdated,
}

impl DnsOutcome {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, DnsOutcome::Unchanged)
    }
}

/// The CNAME found for a declared hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Created,
    /// Already points at this tunnel
    Owned,
    /// Points elsewhere; holds the record content
    Foreign(String),
}

pub struct DnsSync<'a> {
    dns: &'a dyn DnsApi,
    store: &'a dyn TunnelStore,
    config: &'a OperatorConfig,
}

impl<'a> DnsSync<'a> {
    pub fn new(dns: &'a dyn DnsApi, store: &'a dyn TunnelStore, config: &'a OperatorConfig) -> Self {
        Self { dns, store, config }
    }

    /// Run one pass and stop at the first committed change.
    pub async fn converge(&self, tunnel: &Tunnel, tunnel_id: &str) -> Result<DnsOutcome> {
        let declared = tunnel.declared_hostnames();
        let observed = tunnel.observed_hostnames();
        let target = self.config.cname_target(tunnel_id);
        let mut conflicts: Vec<(String, String)> = Vec::new();

        for hostname in &declared {
            match self.ensure_record(hostname, &target).await? {
                RecordState::Created => {
                    if !observed.contains(hostname) {
                        self.record_hostnames(tunnel, |h| h.push(hostname.clone()))
                            .await?;
                    }
                    return Ok(DnsOutcome::RecordCreated(hostname.clone()));
                }
                RecordState::Owned => {}
                RecordState::Foreign(content) => conflicts.push((hostname.clone(), content)),
            }
        }
        let is_foreign = |hostname: &String| conflicts.iter().any(|(h, _)| h == hostname);

        if self.report_conflicts(tunnel, &conflicts, &target).await? {
            return Ok(DnsOutcome::ConditionUpdated);
        }

        if let Some(hostname) = declared
            .iter()
            .find(|h| !observed.contains(h) && !is_foreign(*h))
        {
            self.record_hostnames(tunnel, |h| h.push(hostname.clone()))
                .await?;
            info!(tunnel = %tunnel.name_any(), hostname = %hostname, "Recorded hostname");
            return Ok(DnsOutcome::HostnameRecorded(hostname.clone()));
        }

        if let Some(hostname) = observed
            .iter()
            .find(|h| !declared.contains(h) || is_foreign(*h))
        {
            self.delete_records(hostname, &target).await?;
            self.record_hostnames(tunnel, |h| h.retain(|x| x != hostname))
                .await?;
            info!(tunnel = %tunnel.name_any(), hostname = %hostname, "Removed hostname");
            return Ok(DnsOutcome::HostnameRemoved(hostname.clone()));
        }

        Ok(DnsOutcome::Unchanged)
    }

    /// Create the CNAME for `hostname` unless one exists.
    pub async fn ensure_record(&self, hostname: &str, target: &str) -> Result<RecordState> {
        let existing = self.dns.list_records(DnsRecordType::CNAME, hostname).await?;

        if let Some(record) = existing.first() {
            if record.content != target {
                warn!(
                    hostname = %hostname,
                    content = %record.content,
                    expected = %target,
                    "CNAME exists with a different target, leaving it in place"
                );
                return Ok(RecordState::Foreign(record.content.clone()));
            }
            debug!(hostname = %hostname, "CNAME already present");
            return Ok(RecordState::Owned);
        }

        let record = self
            .dns
            .create_record(&DnsRecordRequest::tunnel_cname(hostname, target))
            .await?;
        info!(hostname = %hostname, record_id = %record.id, target = %target, "Created CNAME");
        Ok(RecordState::Created)
    }

    /// Delete the CNAMEs for `hostname` that point at `target`. Returns the number deleted.
    pub async fn delete_records(&self, hostname: &str, target: &str) -> Result<usize> {
        let records = self.dns.list_records(DnsRecordType::CNAME, hostname).await?;
        let mut deleted = 0;

        for record in records {
            if record.content != target {
                info!(
                    hostname = %hostname,
                    content = %record.content,
                    "Leaving CNAME owned elsewhere"
                );
                continue;
            }
            match self.dns.delete_record(&record.id).await {
                Ok(()) => {
                    info!(hostname = %hostname, record_id = %record.id, "Deleted DNS record");
                    deleted += 1;
                }
                Err(e) if e.is_not_found() => {
                    debug!(hostname = %hostname, record_id = %record.id, "Record already gone");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(deleted)
    }

    /// Remove this tunnel's records for every hostname in `hostnames`.
    pub async fn drain(&self, hostnames: &[String], tunnel_id: &str) -> Result<()> {
        let target = self.config.cname_target(tunnel_id);
        for hostname in hostnames {
            self.delete_records(hostname, &target).await?;
        }
        Ok(())
    }

    /// Set `DNSRecords=False` while conflicts exist; flip it back once they are gone.
    /// Returns true when status was written.
    async fn report_conflicts(
        &self,
        tunnel: &Tunnel,
        conflicts: &[(String, String)],
        target: &str,
    ) -> Result<bool> {
        let condition = if conflicts.is_empty() {
            let previous = tunnel
                .status
                .as_ref()
                .and_then(|s| s.condition(CONDITION_DNS_RECORDS));
            match previous {
                Some(c) if c.status == ConditionStatus::False => Condition::new(
                    CONDITION_DNS_RECORDS,
                    true,
                    REASON_RECORDS_SYNCED,
                    format!("All declared hostnames point at {}", target),
                ),
                _ => return Ok(false),
            }
        } else {
            let owners = conflicts
                .iter()
                .map(|(hostname, content)| format!("{} -> {}", hostname, content))
                .collect::<Vec<_>>()
                .join(", ");
            Condition::new(
                CONDITION_DNS_RECORDS,
                false,
                REASON_RECORD_CONFLICT,
                format!("CNAME records point elsewhere (expected {}): {}", target, owners),
            )
        };

        let mut updated = tunnel.clone();
        updated.status_mut().set_condition(condition);
        if updated.status == tunnel.status {
            return Ok(false);
        }

        self.store.replace_tunnel_status(&updated).await?;
        info!(tunnel = %tunnel.name_any(), conflicts = conflicts.len(), "Updated DNS condition");
        Ok(true)
    }

    async fn record_hostnames(
        &self,
        tunnel: &Tunnel,
        update: impl FnOnce(&mut Vec<String>),
    ) -> Result<()> {
        let mut updated = tunnel.clone();
        update(&mut updated.status_mut().hostnames);
        self.store.replace_tunnel_status(&updated).await?;
        Ok(())
    }
}

/// Hostnames to drain on deletion: observed first, then declared ones never recorded.
/// Only records pointing at the tunnel are deleted.
pub fn drain_set(tunnel: &Tunnel) -> Vec<String> {
    let mut hostnames = tunnel.observed_hostnames().to_vec();
    for hostname in tunnel.declared_hostnames() {
        if !hostnames.contains(&hostname) {
            hostnames.push(hostname);
        }
    }
    hostnames
}
