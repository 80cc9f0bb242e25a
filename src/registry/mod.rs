//! The client registry: one record per configured client, reconciled from
//! descriptors on disk, the runtime cache, and live processes.
//!
//! Lock order: the record map (`RwLock`) is always acquired before any
//! per-record `Mutex`, never the other way around. A record's mutex is held
//! for the whole of a lifecycle transition, cache save included.

mod builder;
mod configs;
mod core;
mod record;
mod reconcile;
mod selector;

pub use builder::RegistryBuilder;
pub use configs::CreateRequest;
pub use record::{ClientRecord, ClientView};
pub use reconcile::ReconcileReport;
pub use selector::Selector;

use crate::cache::RuntimeCache;
use crate::control::{ControlConnector, Secret, SecretSource};
use crate::daemon::Launcher;
use crate::error::Error;
use crate::identity::IdentityLookup;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub type SharedRecord = Arc<Mutex<ClientRecord>>;

/// Map entry: the record plus the fields selectors match on, readable
/// without waiting for the record lock.
#[derive(Clone)]
pub(crate) struct Slot {
    pub(crate) control_port: u16,
    pub(crate) exit_labels: BTreeSet<String>,
    pub(crate) external: bool,
    pub(crate) record: SharedRecord,
}

impl Slot {
    pub(crate) fn new(record: ClientRecord) -> Self {
        Self {
            control_port: record.control_port(),
            exit_labels: record.descriptor().exit_labels.clone(),
            external: record.is_external(),
            record: Arc::new(Mutex::new(record)),
        }
    }
}

pub struct ClientRegistry {
    pub(crate) config_dir: PathBuf,
    pub(crate) data_root: PathBuf,
    pub(crate) records: RwLock<BTreeMap<u16, Slot>>,
    pub(crate) cache: RuntimeCache,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) lookup: Arc<dyn IdentityLookup>,
    pub(crate) connector: Arc<dyn ControlConnector>,
    pub(crate) secrets: Arc<dyn SecretSource>,
    /// Secrets already entered, keyed by the hash they should match, so
    /// clients sharing a hash are asked for it once.
    pub(crate) known_secrets: parking_lot::Mutex<HashMap<String, Secret>>,
    pub(crate) secret_lock: Mutex<()>,
    pub(crate) launch_timeout: Duration,
    pub(crate) lookup_timeout: Duration,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) startup_report: ReconcileReport,
}

impl ClientRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// What the reconciliation run by `RegistryBuilder::build` found.
    pub fn startup_report(&self) -> &ReconcileReport {
        &self.startup_report
    }

    pub fn config_dir(&self) -> &std::path::Path {
        &self.config_dir
    }

    /// Cancel in-flight launches. They fail with `Error::Cancelled`.
    pub fn cancel_operations(&self) {
        self.cancellation_token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

/// Outcome of an operation applied to many clients. Failures never abort the
/// remaining clients.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<u16>,
    pub failed: Vec<(u16, Error)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub(crate) fn record(&mut self, port: u16, result: crate::error::Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(port),
            Err(e) => {
                tracing::warn!("Client {}: {}", port, e);
                self.failed.push((port, e));
            }
        }
    }

    /// Collapse into a single result: one failure as itself, several as
    /// `Error::Multiple`.
    pub fn into_result(self) -> crate::error::Result<Vec<u16>> {
        let mut errors: Vec<Error> = self.failed.into_iter().map(|(_, e)| e).collect();
        match errors.len() {
            0 => Ok(self.succeeded),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }
}

/// Which records `ClientRegistry::list` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    All,
    Running,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_report_collapses_errors() {
        let mut report = BatchReport::default();
        report.record(9050, Ok(()));
        assert!(report.is_success());
        assert_eq!(report.into_result().unwrap(), vec![9050]);

        let mut report = BatchReport::default();
        report.record(9050, Err(Error::NotFound("a".to_string())));
        report.record(9060, Err(Error::NotFound("b".to_string())));
        assert!(matches!(report.into_result(), Err(Error::Multiple(ref e)) if e.len() == 2));
    }
}
