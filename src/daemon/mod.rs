//! Daemon processes: lifecycle states, launching, and termination.
//!
//! - `DaemonState` - the per-client state machine
//! - `Launcher` / `DaemonProcess` - traits the registry talks to
//! - `TorLauncher` - spawns the `tor` binary and waits for bootstrap

mod tor;

pub use tor::{pid_is_alive, terminate_pid, TorLauncher, TorProcess};

use crate::config::ConfigDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl DaemonState {
    /// Check if a state transition is valid.
    ///
    /// ```
    /// use tor_fleet::daemon::DaemonState;
    ///
    /// assert!(DaemonState::Stopped.is_valid_transition(DaemonState::Starting));
    /// assert!(DaemonState::Starting.is_valid_transition(DaemonState::Stopped));
    /// assert!(!DaemonState::Stopped.is_valid_transition(DaemonState::Running));
    /// ```
    pub fn is_valid_transition(&self, to: DaemonState) -> bool {
        use DaemonState::*;
        match (self, to) {
            (Stopped, Starting) => true,

            // Launch succeeded, or failed/timed out
            (Starting, Running) => true,
            (Starting, Stopped) => true,

            (Running, Stopping) => true,

            // Termination succeeded, or failed and the process lives on
            (Stopping, Stopped) => true,
            (Stopping, Running) => true,

            // Same state is a no-op (rotation keeps Running)
            (s1, s2) if *s1 == s2 => true,

            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DaemonState::Running)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// What the manager knows about a client's OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessRef {
    /// Managed by the system (the default daemon). Never started or stopped
    /// here; shown as pid `-1`.
    External,
    Pid(u32),
}

impl ProcessRef {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessRef::External => None,
            ProcessRef::Pid(pid) => Some(*pid),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, ProcessRef::External)
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRef::External => f.write_str("-1"),
            ProcessRef::Pid(pid) => write!(f, "{}", pid),
        }
    }
}

/// A daemon spawned by this manager.
#[async_trait]
pub trait DaemonProcess: Send {
    fn pid(&self) -> u32;

    /// Stop the daemon: graceful signal, then forced kill after the grace
    /// period. Fails with `Error::StopFailed` if the process survives.
    async fn terminate(&mut self) -> Result<()>;
}

/// Spawns daemons and manages processes known only by pid.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn a daemon for `descriptor` and resolve once it is ready to serve.
    ///
    /// Dropping the returned future before it resolves must not leave a
    /// half-started process behind.
    async fn launch(&self, descriptor: &ConfigDescriptor) -> Result<Box<dyn DaemonProcess>>;

    /// Whether `pid` refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Terminate a process this run did not spawn (reattached from the cache).
    async fn kill_pid(&self, port: u16, pid: u32) -> Result<()>;
}
