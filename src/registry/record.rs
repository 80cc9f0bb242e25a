use crate::cache::CacheEntry;
use crate::config::{ConfigDescriptor, DescriptorKind};
use crate::control::Secret;
use crate::daemon::{DaemonProcess, DaemonState, ProcessRef};
use crate::error::{Error, Result};
use crate::identity::Identity;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// In-memory state of one client. One per socks port.
pub struct ClientRecord {
    pub(crate) descriptor: ConfigDescriptor,
    pub(crate) state: DaemonState,
    /// Present only for daemons spawned by this run.
    pub(crate) process: Option<Box<dyn DaemonProcess>>,
    pub(crate) pid: Option<ProcessRef>,
    pub(crate) identity: Option<Identity>,
    pub(crate) secret: Option<Secret>,
    /// Restored from the cache with no descriptor on disk.
    pub(crate) orphaned: bool,
}

impl ClientRecord {
    pub fn from_descriptor(descriptor: ConfigDescriptor) -> Self {
        let external = descriptor.is_default();
        Self {
            descriptor,
            // The system daemon is assumed up; it is never started here
            state: if external {
                DaemonState::Running
            } else {
                DaemonState::Stopped
            },
            process: None,
            pid: external.then_some(ProcessRef::External),
            identity: None,
            secret: None,
            orphaned: false,
        }
    }

    /// Rebuild a record from a cache entry whose descriptor is gone.
    pub fn from_orphan(entry: CacheEntry) -> Self {
        let path = entry
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("client.{}", entry.socks_port)));
        let kind = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(DescriptorKind::from_file_name)
            .unwrap_or(DescriptorKind::Custom(0));
        let descriptor = ConfigDescriptor {
            path,
            kind,
            socks_port: entry.socks_port,
            control_port: entry.control_port,
            exit_labels: entry.exit_labels.clone(),
            data_directory: entry.data_directory.clone(),
            secret_hash: None,
        };
        let mut record = Self::from_descriptor(descriptor);
        record.orphaned = true;
        record.merge_cached(entry);
        record
    }

    /// Take the runtime fields from a cache entry. Descriptor fields stay as
    /// parsed from disk.
    pub fn merge_cached(&mut self, entry: CacheEntry) {
        if !self.is_external() {
            self.pid = entry.pid.filter(|p| !p.is_external());
        }
        // No daemon, no identity
        self.identity = self.pid.and(entry.identity);
    }

    pub fn port(&self) -> u16 {
        self.descriptor.socks_port
    }

    pub fn control_port(&self) -> u16 {
        self.descriptor.control_port
    }

    pub fn descriptor(&self) -> &ConfigDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn pid(&self) -> Option<ProcessRef> {
        self.pid
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn is_external(&self) -> bool {
        matches!(self.pid, Some(ProcessRef::External)) || self.descriptor.is_default()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.descriptor.exit_labels.contains(label)
    }

    /// Move to `to`, refusing transitions the state machine does not allow.
    pub(crate) fn transition(&mut self, to: DaemonState) -> Result<()> {
        if !self.state.is_valid_transition(to) {
            return Err(Error::InvalidArgument(format!(
                "client {} cannot go from {} to {}",
                self.port(),
                self.state,
                to
            )));
        }
        tracing::trace!("Client {}: {} -> {}", self.port(), self.state, to);
        self.state = to;
        Ok(())
    }

    /// Forget everything tied to the (former) process.
    pub(crate) fn clear_runtime(&mut self) {
        self.process = None;
        self.pid = None;
        self.identity = None;
    }

    pub(crate) fn attach(&mut self, process: Box<dyn DaemonProcess>) {
        self.pid = Some(ProcessRef::Pid(process.pid()));
        self.process = Some(process);
    }

    pub fn to_cache_entry(&self) -> CacheEntry {
        CacheEntry {
            socks_port: self.descriptor.socks_port,
            control_port: self.descriptor.control_port,
            exit_labels: self.descriptor.exit_labels.clone(),
            data_directory: self.descriptor.data_directory.clone(),
            config_path: (!self.orphaned || self.descriptor.path.is_absolute())
                .then(|| self.descriptor.path.clone()),
            pid: self.pid,
            identity: self.identity.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            socks_port: self.descriptor.socks_port,
            control_port: self.descriptor.control_port,
            exit_labels: self.descriptor.exit_labels.clone(),
            state: self.state,
            pid: self.pid,
            identity: self.identity.clone(),
            config_path: self.descriptor.path.clone(),
            data_directory: self.descriptor.data_directory.clone(),
            external: self.is_external(),
            orphaned: self.orphaned,
        }
    }
}

impl From<&ClientRecord> for CacheEntry {
    fn from(record: &ClientRecord) -> Self {
        record.to_cache_entry()
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("socks_port", &self.descriptor.socks_port)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("identity", &self.identity)
            .field("orphaned", &self.orphaned)
            .finish_non_exhaustive()
    }
}

/// Read-only copy of a record for display and queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientView {
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_labels: BTreeSet<String>,
    pub state: DaemonState,
    pub pid: Option<ProcessRef>,
    pub identity: Option<Identity>,
    pub config_path: PathBuf,
    pub data_directory: Option<PathBuf>,
    pub external: bool,
    pub orphaned: bool,
}

impl ClientView {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn config_name(&self) -> String {
        self.config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn custom(port: u16) -> ConfigDescriptor {
        ConfigDescriptor::parse(
            Path::new("/etc/tor/torrc.1"),
            DescriptorKind::Custom(1),
            &format!("SocksPort {}\nExitNodes {{us}}\n", port),
        )
        .unwrap()
    }

    fn identity() -> Identity {
        Identity {
            address: "1.2.3.4".to_string(),
            region: "US".to_string(),
            subregion: "Ohio".to_string(),
            locality: "Columbus".to_string(),
        }
    }

    #[test]
    fn default_descriptor_is_external_and_running() {
        let descriptor = ConfigDescriptor::parse(
            Path::new("/etc/tor/torrc"),
            DescriptorKind::Default,
            "",
        )
        .unwrap();
        let record = ClientRecord::from_descriptor(descriptor);
        assert!(record.is_external());
        assert_eq!(record.pid(), Some(ProcessRef::External));
        assert_eq!(record.state(), DaemonState::Running);
    }

    #[test]
    fn merge_takes_only_runtime_fields() {
        let mut record = ClientRecord::from_descriptor(custom(9060));
        let mut entry = record.to_cache_entry();
        entry.exit_labels = ["de".to_string()].into_iter().collect();
        entry.pid = Some(ProcessRef::Pid(777));
        entry.identity = Some(identity());

        record.merge_cached(entry);
        assert_eq!(record.pid(), Some(ProcessRef::Pid(777)));
        assert_eq!(record.identity(), Some(&identity()));
        assert!(record.has_label("us"));
        assert!(!record.has_label("de"));
    }

    #[test]
    fn merge_never_overrides_external_sentinel() {
        let descriptor =
            ConfigDescriptor::parse(Path::new("/etc/tor/torrc"), DescriptorKind::Default, "")
                .unwrap();
        let mut record = ClientRecord::from_descriptor(descriptor);
        let mut entry = record.to_cache_entry();
        entry.pid = Some(ProcessRef::Pid(12));
        record.merge_cached(entry);
        assert_eq!(record.pid(), Some(ProcessRef::External));
    }

    #[test]
    fn merge_without_pid_drops_identity() {
        let mut record = ClientRecord::from_descriptor(custom(9060));
        let mut entry = record.to_cache_entry();
        entry.pid = None;
        entry.identity = Some(identity());

        record.merge_cached(entry);
        assert_eq!(record.state(), DaemonState::Stopped);
        assert_eq!(record.identity(), None);
    }

    #[test]
    fn orphan_keeps_cached_fields() {
        let mut entry = ClientRecord::from_descriptor(custom(9070)).to_cache_entry();
        entry.pid = Some(ProcessRef::Pid(4242));
        entry.identity = Some(identity());
        let record = ClientRecord::from_orphan(entry);
        assert!(record.is_orphaned());
        assert_eq!(record.port(), 9070);
        assert_eq!(record.control_port(), 9071);
        assert_eq!(record.identity(), Some(&identity()));
        assert_eq!(record.to_cache_entry().config_path, Some(PathBuf::from("/etc/tor/torrc.1")));
    }

    #[test]
    fn invalid_transition_is_refused() {
        let mut record = ClientRecord::from_descriptor(custom(9060));
        assert!(record.transition(DaemonState::Running).is_err());
        assert_eq!(record.state(), DaemonState::Stopped);
        record.transition(DaemonState::Starting).unwrap();
        record.transition(DaemonState::Running).unwrap();
    }

    #[test]
    fn cache_entry_never_carries_secret() {
        let mut record = ClientRecord::from_descriptor(custom(9060));
        record.secret = Some(Secret::new("hunter2"));
        let encoded = bincode::serialize(&record.to_cache_entry()).unwrap();
        assert!(!encoded.windows(7).any(|w| w == b"hunter2"));
    }
}
