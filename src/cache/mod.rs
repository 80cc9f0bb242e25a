//! Durable hand-over of per-client runtime state between manager runs.
//!
//! One file per client, `client.<port>`, holding a format version byte
//! followed by a bincode-encoded [`CacheEntry`]. Entries are one-shot: they are
//! deleted as soon as they are loaded.

use crate::daemon::ProcessRef;
use crate::error::{Error, Result};
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FORMAT_VERSION: u8 = 1;
const ENTRY_PREFIX: &str = "client.";
const LOCK_FILE: &str = ".lock";

/// Serializable subset of a client record. Never holds a process handle or
/// the control password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_labels: BTreeSet<String>,
    pub data_directory: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub pid: Option<ProcessRef>,
    pub identity: Option<Identity>,
    pub saved_at: DateTime<Utc>,
}

pub struct RuntimeCache {
    dir: PathBuf,
    _lock: Option<File>,
}

impl RuntimeCache {
    /// Open the cache directory, creating it if missing, and take the advisory
    /// lock. Fails with `CacheUnavailable` if the directory cannot be used.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let unavailable = |reason: String| Error::CacheUnavailable {
            path: dir.clone(),
            reason,
        };
        fs::create_dir_all(&dir).map_err(|e| unavailable(e.to_string()))?;
        if !dir.is_dir() {
            return Err(unavailable("not a directory".to_string()));
        }
        let lock = try_acquire_lock(&dir.join(LOCK_FILE)).map_err(|e| unavailable(e.to_string()))?;
        Ok(Self { dir, _lock: lock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, port: u16) -> PathBuf {
        self.dir.join(format!("{}{}", ENTRY_PREFIX, port))
    }

    /// Write `entry`, replacing any entry with the same port. The write is
    /// atomic: readers see either the old or the new file.
    pub fn save(&self, entry: &CacheEntry) -> Result<()> {
        let mut bytes = vec![FORMAT_VERSION];
        bincode::serialize_into(&mut bytes, entry)
            .map_err(|e| Error::Cache(format!("Failed to encode entry {}: {}", entry.socks_port, e)))?;

        let path = self.entry_path(entry.socks_port);
        let temp_path = self.dir.join(format!(".{}{}.tmp", ENTRY_PREFIX, entry.socks_port));
        atomic_write(&temp_path, &path, &bytes)?;
        debug!("Saved cache entry {:?}", path);
        Ok(())
    }

    /// Read every entry and delete it. Undecodable entries are logged and
    /// deleted too.
    pub fn load_and_drain(&self) -> Result<Vec<CacheEntry>> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| Error::CacheUnavailable {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;

        let mut entries = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(port) = name.to_str().and_then(parse_entry_name) else {
                continue;
            };
            let path = dir_entry.path();

            match fs::read(&path) {
                Ok(bytes) => match decode(&bytes) {
                    Ok(entry) if entry.socks_port == port => entries.push(entry),
                    Ok(entry) => warn!(
                        "Cache entry {:?} claims port {}, discarding",
                        path, entry.socks_port
                    ),
                    Err(reason) => warn!("Discarding unreadable cache entry {:?}: {}", path, reason),
                },
                Err(e) => warn!("Failed to read cache entry {:?}: {}", path, e),
            }

            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove cache entry {:?}: {}", path, e);
                }
            }
        }

        entries.sort_by_key(|e| e.socks_port);
        debug!("Drained {} cache entries from {:?}", entries.len(), self.dir);
        Ok(entries)
    }

    /// Delete the entry for `port`, if any.
    pub fn remove(&self, port: u16) -> Result<()> {
        match fs::remove_file(self.entry_path(port)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cache(format!(
                "Failed to remove cache entry {}: {}",
                port, e
            ))),
        }
    }
}

fn parse_entry_name(name: &str) -> Option<u16> {
    let suffix = name.strip_prefix(ENTRY_PREFIX)?;
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

fn decode(bytes: &[u8]) -> std::result::Result<CacheEntry, String> {
    match bytes.split_first() {
        Some((&FORMAT_VERSION, body)) => bincode::deserialize(body).map_err(|e| e.to_string()),
        Some((version, _)) => Err(format!("unsupported format version {}", version)),
        None => Err("empty file".to_string()),
    }
}

fn atomic_write(temp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(temp_path)
        .map_err(|e| Error::Cache(format!("Failed to create temp file: {}", e)))?;
    file.write_all(contents)
        .map_err(|e| Error::Cache(format!("Failed to write temp file: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Cache(format!("Failed to sync temp file: {}", e)))?;
    drop(file);

    fs::rename(temp_path, path)
        .map_err(|e| Error::Cache(format!("Failed to rename temp file: {}", e)))?;
    Ok(())
}

/// Take the advisory lock, or warn and carry on without it.
fn try_acquire_lock(lock_path: &Path) -> std::io::Result<Option<File>> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = writeln!(file, "{}", std::process::id());
            debug!("Acquired advisory lock on {:?}", lock_path);
            Ok(Some(file))
        }
        Err(e) => {
            debug!("Lock acquisition failed: {} (kind: {:?})", e, e.kind());
            let owner = fs::read_to_string(lock_path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            warn!(
                "Another tor-fleet instance (PID {}) is using this cache. \
                 Proceeding anyway, but runtime state may be lost.",
                owner
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16) -> CacheEntry {
        CacheEntry {
            socks_port: port,
            control_port: port + 1,
            exit_labels: ["us".to_string()].into_iter().collect(),
            data_directory: Some(PathBuf::from("/var/lib/tor1")),
            config_path: Some(PathBuf::from("/etc/tor/torrc.1")),
            pid: Some(ProcessRef::Pid(4242)),
            identity: Some(Identity {
                address: "1.2.3.4".to_string(),
                region: "US".to_string(),
                subregion: "Oregon".to_string(),
                locality: "Portland".to_string(),
            }),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn save_then_drain_empties_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RuntimeCache::open(dir.path().join("cache")).unwrap();
        cache.save(&entry(9060)).unwrap();
        cache.save(&entry(9050)).unwrap();

        let drained = cache.load_and_drain().unwrap();
        assert_eq!(
            drained.iter().map(|e| e.socks_port).collect::<Vec<_>>(),
            vec![9050, 9060]
        );
        assert_eq!(drained[1], {
            let mut e = entry(9060);
            e.saved_at = drained[1].saved_at;
            e
        });
        assert!(!cache.entry_path(9050).exists());
        assert!(!cache.entry_path(9060).exists());
        assert!(cache.load_and_drain().unwrap().is_empty());
    }

    #[test]
    fn save_overwrites_same_port() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RuntimeCache::open(dir.path()).unwrap();
        cache.save(&entry(9050)).unwrap();
        let mut updated = entry(9050);
        updated.pid = None;
        updated.identity = None;
        cache.save(&updated).unwrap();

        let drained = cache.load_and_drain().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pid, None);
        assert_eq!(drained[0].identity, None);
    }

    #[test]
    fn corrupt_entries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RuntimeCache::open(dir.path()).unwrap();
        fs::write(cache.entry_path(9050), b"\x07garbage").unwrap();
        fs::write(cache.entry_path(9051), b"").unwrap();
        fs::write(dir.path().join("client.notaport"), b"x").unwrap();
        cache.save(&entry(9060)).unwrap();

        let drained = cache.load_and_drain().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(!cache.entry_path(9050).exists());
        assert!(!cache.entry_path(9051).exists());
        assert!(dir.path().join("client.notaport").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RuntimeCache::open(dir.path()).unwrap();
        cache.save(&entry(9050)).unwrap();
        cache.remove(9050).unwrap();
        cache.remove(9050).unwrap();
        assert!(!cache.entry_path(9050).exists());
    }

    #[test]
    fn open_fails_when_path_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"").unwrap();
        let err = RuntimeCache::open(&file).err().unwrap();
        assert!(matches!(err, Error::CacheUnavailable { .. }));
    }

    #[test]
    fn second_handle_still_opens() {
        let dir = tempfile::tempdir().unwrap();
        let _first = RuntimeCache::open(dir.path()).unwrap();
        let second = RuntimeCache::open(dir.path()).unwrap();
        second.save(&entry(9050)).unwrap();
    }
}
