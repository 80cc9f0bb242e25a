use super::{ClientRecord, ClientRegistry, Slot};
use crate::cache::CacheEntry;
use crate::config::{discover_descriptors, ConfigDescriptor, DescriptorKind};
use crate::daemon::{DaemonState, ProcessRef};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Ports with a descriptor on disk.
    pub loaded: Vec<u16>,
    /// Descriptor files that were rejected, with the reason.
    pub skipped: Vec<(PathBuf, Error)>,
    /// Ports whose cached runtime state was merged into the record.
    pub merged: Vec<u16>,
    /// Ports known only from the cache whose daemon is still alive.
    pub orphaned: Vec<u16>,
    /// Ports whose cached pid was no longer alive.
    pub stale_pids: Vec<u16>,
    /// Ports dropped because their descriptor disappeared and no daemon
    /// was left running.
    pub dropped: Vec<u16>,
}

impl ClientRegistry {
    /// Rebuild the record set from the config directory and the runtime
    /// cache, probing every reattached pid.
    ///
    /// Records that already exist keep their live runtime state, so running
    /// this twice over an unchanged directory yields the same records.
    #[tracing::instrument(skip(self), fields(config_dir = %self.config_dir.display()))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let descriptors = self.load_descriptors(&mut report)?;
        let mut cached: HashMap<u16, CacheEntry> = self
            .cache
            .load_and_drain()?
            .into_iter()
            .map(|entry| (entry.socks_port, entry))
            .collect();

        let mut records = self.records.write().await;
        let mut previous = std::mem::take(&mut *records);
        let mut next: BTreeMap<u16, Slot> = BTreeMap::new();

        for descriptor in descriptors {
            let port = descriptor.socks_port;
            report.loaded.push(port);

            let slot = match previous.remove(&port) {
                Some(existing) => {
                    let mut record = existing.record.lock().await;
                    if record.descriptor != descriptor {
                        debug!("Descriptor for client {} changed on disk", port);
                        record.descriptor = descriptor;
                    }
                    record.orphaned = false;
                    let refreshed = Slot {
                        control_port: record.control_port(),
                        exit_labels: record.descriptor.exit_labels.clone(),
                        external: record.is_external(),
                        record: existing.record.clone(),
                    };
                    drop(record);
                    refreshed
                }
                None => Slot::new(ClientRecord::from_descriptor(descriptor)),
            };

            if let Some(entry) = cached.remove(&port) {
                slot.record.lock().await.merge_cached(entry);
                report.merged.push(port);
            }
            next.insert(port, slot);
        }

        let mut leftovers: Vec<CacheEntry> = cached.into_values().collect();
        leftovers.sort_by_key(|e| e.socks_port);
        for entry in leftovers {
            let port = entry.socks_port;
            if next.contains_key(&port) {
                continue;
            }
            warn!("Cache holds client {} but no descriptor defines it", port);
            next.insert(port, Slot::new(ClientRecord::from_orphan(entry)));
            report.orphaned.push(port);
        }

        for (port, slot) in previous {
            let record = slot.record.lock().await;
            let keep = record.is_orphaned()
                || (record.process.is_some() || record.pid.and_then(|p| p.pid()).is_some());
            let external = record.is_external();
            drop(record);
            if keep && !external && !next.contains_key(&port) {
                slot.record.lock().await.orphaned = true;
                report.orphaned.push(port);
                next.insert(port, slot);
            } else {
                info!("Client {} no longer has a descriptor, dropping it", port);
                report.dropped.push(port);
            }
        }

        let mut vanished = Vec::new();
        for (port, slot) in next.iter() {
            let mut record = slot.record.lock().await;
            if self.probe(&mut record) {
                report.stale_pids.push(*port);
            }
            if record.is_orphaned() && record.process.is_none() && record.pid.is_none() {
                vanished.push(*port);
            }
        }
        // An orphan only lives as long as its daemon
        for port in vanished {
            info!(
                "Client {} has no descriptor and no live daemon, dropping it",
                port
            );
            next.remove(&port);
            report.orphaned.retain(|p| *p != port);
            report.dropped.push(port);
        }

        *records = next;
        report.orphaned.sort_unstable();
        info!(
            "Reconciled {} clients ({} merged from cache, {} orphaned, {} skipped)",
            records.len(),
            report.merged.len(),
            report.orphaned.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Parse every descriptor in the config directory, rejecting malformed
    /// files and duplicate socks ports. Custom descriptors without a hash
    /// inherit the default descriptor's.
    fn load_descriptors(&self, report: &mut ReconcileReport) -> Result<Vec<ConfigDescriptor>> {
        let mut parsed = Vec::new();
        for (_, path) in discover_descriptors(&self.config_dir)? {
            match ConfigDescriptor::load(&path) {
                Ok(descriptor) => parsed.push(descriptor),
                Err(e) => {
                    warn!("Skipping descriptor {:?}: {}", path, e);
                    report.skipped.push((path, e));
                }
            }
        }

        let default_hash = parsed
            .iter()
            .find(|d| d.kind == DescriptorKind::Default)
            .and_then(|d| d.secret_hash.clone());
        if let Some(ref hash) = default_hash {
            for descriptor in parsed.iter_mut().filter(|d| d.secret_hash.is_none()) {
                descriptor.secret_hash = Some(hash.clone());
            }
        }

        let mut owners: HashMap<u16, PathBuf> = HashMap::new();
        let mut accepted = Vec::with_capacity(parsed.len());
        for descriptor in parsed {
            if let Some(existing) = owners.get(&descriptor.socks_port) {
                let err = Error::DuplicatePort {
                    port: descriptor.socks_port,
                    path: descriptor.path.clone(),
                    existing: existing.clone(),
                };
                warn!("Skipping descriptor {:?}: {}", descriptor.path, err);
                report.skipped.push((descriptor.path.clone(), err));
                continue;
            }
            owners.insert(descriptor.socks_port, descriptor.path.clone());
            accepted.push(descriptor);
        }
        Ok(accepted)
    }

    /// Check a reattached pid. Returns true when it turned out to be dead.
    fn probe(&self, record: &mut ClientRecord) -> bool {
        if record.process.is_some() {
            return false;
        }
        match record.pid {
            Some(ProcessRef::Pid(pid)) => {
                if self.launcher.is_alive(pid) {
                    debug!("Client {} reattached to live pid {}", record.port(), pid);
                    record.state = DaemonState::Running;
                    false
                } else {
                    info!(
                        "Client {} cached pid {} is gone, marking stopped",
                        record.port(),
                        pid
                    );
                    record.clear_runtime();
                    record.state = DaemonState::Stopped;
                    true
                }
            }
            Some(ProcessRef::External) => false,
            None => {
                if !record.is_external() {
                    record.identity = None;
                    if record.state == DaemonState::Running {
                        record.state = DaemonState::Stopped;
                    }
                }
                false
            }
        }
    }
}
