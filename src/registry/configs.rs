use super::{ClientRecord, ClientRegistry, ClientView, Selector, Slot};
use crate::config::{
    discover_descriptors, is_known_label, normalize_label, ConfigDescriptor, DescriptorKind,
};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Parameters for a new custom descriptor.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub port: Option<u16>,
    pub labels: Vec<String>,
    pub data_directory: Option<PathBuf>,
}

impl ClientRegistry {
    /// Write a new `torrc.<n>` descriptor and register its client.
    ///
    /// Nothing is written when the request is rejected.
    pub async fn create_config(&self, request: CreateRequest) -> Result<ClientView> {
        let port = match request.port {
            None | Some(0) => {
                return Err(Error::InvalidArgument(
                    "a non-zero SocksPort is required".to_string(),
                ))
            }
            Some(port) => port,
        };
        let control_port = port.checked_add(1).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "port {} leaves no room for its ControlPort ({} + 1)",
                port, port
            ))
        })?;

        let mut exit_labels = BTreeSet::new();
        for raw in &request.labels {
            let label = normalize_label(raw);
            if !is_known_label(&label) {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is not a known exit label",
                    raw
                )));
            }
            exit_labels.insert(label);
        }

        let mut records = self.records.write().await;
        for (existing, slot) in records.iter() {
            let taken = [*existing, slot.control_port];
            if taken.contains(&port) || taken.contains(&control_port) {
                return Err(Error::InvalidArgument(format!(
                    "port {} or its ControlPort {} is already used by client {}",
                    port, control_port, existing
                )));
            }
        }

        let suffix = discover_descriptors(&self.config_dir)?
            .into_iter()
            .filter_map(|(kind, _)| match kind {
                DescriptorKind::Custom(n) => Some(n),
                DescriptorKind::Default => None,
            })
            .max()
            .map_or(1, |n| n.saturating_add(1));
        let kind = DescriptorKind::Custom(suffix);

        let mut secret_hash = None;
        for slot in records.values().filter(|s| s.external) {
            let record = slot.record.lock().await;
            if record.descriptor().is_default() {
                secret_hash = record.descriptor().secret_hash.clone();
            }
        }

        let descriptor = ConfigDescriptor {
            path: self.config_dir.join(kind.file_name()),
            kind,
            socks_port: port,
            control_port,
            exit_labels,
            data_directory: Some(
                request
                    .data_directory
                    .unwrap_or_else(|| self.data_root.join(format!("tor{}", suffix))),
            ),
            secret_hash,
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&descriptor.path)
            .map_err(|e| Error::ConfigDirUnavailable {
                path: self.config_dir.clone(),
                reason: format!("cannot create {:?}: {}", descriptor.path, e),
            })?;
        let contents = descriptor.to_torrc();
        write_or_remove(file, &descriptor.path, |f| f.write_all(contents.as_bytes()))?;
        info!(
            "Created {:?} for client {} (control {})",
            descriptor.path, port, control_port
        );

        let record = ClientRecord::from_descriptor(descriptor);
        let view = record.view();
        records.insert(port, Slot::new(record));
        Ok(view)
    }

    /// Remove a client's descriptor file, its record, and its cache entry.
    ///
    /// The default descriptor and running clients cannot be deleted.
    pub async fn delete_config(&self, selector: &Selector) -> Result<PathBuf> {
        let (port, _) = self.require_slot(selector).await?;

        let mut records = self.records.write().await;
        let slot = records
            .get(&port)
            .cloned()
            .ok_or_else(|| Error::NotFound(selector.to_string()))?;
        let record = slot.record.lock().await;

        if record.is_external() {
            return Err(Error::InvalidArgument(format!(
                "client {} is the system daemon's descriptor and cannot be deleted",
                port
            )));
        }
        if record.state().is_running() {
            return Err(Error::InvalidArgument(format!(
                "client {} is running; stop it before deleting its descriptor",
                port
            )));
        }

        let path = record.descriptor().path.clone();
        if path.is_absolute() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(record);
        records.remove(&port);
        self.cache.remove(port)?;
        info!("Deleted {:?} (client {})", path, port);
        Ok(path)
    }
}

/// Fill a freshly created descriptor and flush it to disk. On failure the
/// partial file is removed so reconciliation never sees it.
fn write_or_remove<F>(mut file: File, path: &Path, fill: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let written = fill(&mut file).and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        if let Err(cleanup) = std::fs::remove_file(path) {
            warn!("Failed to remove partial descriptor {:?}: {}", path, cleanup);
        }
        return Err(e);
    }
    Ok(())
}
