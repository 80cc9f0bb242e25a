// thiserror's expansion for struct variants trips unused_assignments.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Failed to parse descriptor '{}': {reason}", .path.display())]
    #[diagnostic(
        code(tor_fleet::descriptor::parse),
        help("Check the SocksPort, ControlPort, ExitNodes, DataDirectory and HashedControlPassword lines")
    )]
    Parse { path: PathBuf, reason: String },

    #[error("Descriptor '{}' reuses SocksPort {port} already claimed by '{}'", .path.display(), .existing.display())]
    #[diagnostic(
        code(tor_fleet::descriptor::duplicate_port),
        help("Every descriptor needs its own SocksPort; edit or delete one of the two files")
    )]
    DuplicatePort {
        port: u16,
        path: PathBuf,
        existing: PathBuf,
    },

    #[error("No client matches {0}")]
    #[diagnostic(
        code(tor_fleet::client::not_found),
        help("List known clients with `tor-fleet list`")
    )]
    NotFound(String),

    #[error("Client {port}: launch failed: {reason}")]
    #[diagnostic(
        code(tor_fleet::launch::failed),
        help("Check that the tor binary exists and that the descriptor is accepted by `tor --verify-config -f <file>`")
    )]
    LaunchFailed { port: u16, reason: String },

    #[error("Client {port}: daemon did not become ready within {deadline:?}")]
    #[diagnostic(
        code(tor_fleet::launch::timeout),
        help("The network may be unreachable, or another process (VPN client, firewall) is blocking tor")
    )]
    LaunchTimeout { port: u16, deadline: Duration },

    #[error("Client {port}: control channel authentication failed: {reason}")]
    #[diagnostic(code(tor_fleet::control::auth))]
    Auth { port: u16, reason: String },

    #[error("Client {port}: control channel error: {reason}")]
    #[diagnostic(code(tor_fleet::control::channel))]
    Channel { port: u16, reason: String },

    #[error("Client {port}: identity rotation failed: {source}")]
    #[diagnostic(code(tor_fleet::control::rotation))]
    RotationFailed {
        port: u16,
        #[source]
        source: Box<Error>,
    },

    #[error("Client {port}: identity lookup failed: {reason}")]
    #[diagnostic(
        code(tor_fleet::identity::lookup),
        help("The daemon may still be building circuits; try `tor-fleet ip` again in a few seconds")
    )]
    Lookup { port: u16, reason: String },

    #[error("Client {port}: operation cancelled")]
    #[diagnostic(code(tor_fleet::cancelled))]
    Cancelled { port: u16 },

    #[error("Client {port}: stop failed: {reason}")]
    #[diagnostic(code(tor_fleet::stop::failed))]
    StopFailed { port: u16, reason: String },

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(tor_fleet::invalid_argument))]
    InvalidArgument(String),

    #[error("Runtime cache directory '{}' is not accessible: {reason}", .path.display())]
    #[diagnostic(
        code(tor_fleet::cache::unavailable),
        help("Pass --cache-dir or set TOR_FLEET_CACHE_DIR to a writable directory")
    )]
    CacheUnavailable { path: PathBuf, reason: String },

    #[error("Configuration directory '{}' is not accessible: {reason}", .path.display())]
    #[diagnostic(
        code(tor_fleet::config_dir::unavailable),
        help("Pass --config-dir or set TOR_FLEET_CONFIG_DIR to the directory holding torrc files")
    )]
    ConfigDirUnavailable { path: PathBuf, reason: String },

    #[error("Runtime cache error: {0}")]
    Cache(String),

    #[error("Settings error: {0}")]
    #[diagnostic(code(tor_fleet::settings))]
    Settings(String),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The client (socks port) this error is about, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Error::DuplicatePort { port, .. }
            | Error::LaunchFailed { port, .. }
            | Error::LaunchTimeout { port, .. }
            | Error::Auth { port, .. }
            | Error::Channel { port, .. }
            | Error::RotationFailed { port, .. }
            | Error::Lookup { port, .. }
            | Error::Cancelled { port }
            | Error::StopFailed { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// Whether this error (or the rotation failure wrapping it) came from a
    /// rejected control secret.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Error::Auth { .. } => true,
            Error::RotationFailed { source, .. } => source.is_auth_failure(),
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::NotFound(_) => {
                Some("List known clients with: tor-fleet list".to_string())
            }
            Error::LaunchTimeout { port, .. } => Some(format!(
                "Check the daemon log for client {} or raise `launch_timeout` in settings.yaml.",
                port
            )),
            Error::LaunchFailed { .. } => Some(
                "Verify the tor binary path (`tor_binary` in settings.yaml) and the descriptor contents."
                    .to_string(),
            ),
            Error::Auth { port, .. } => Some(format!(
                "The control password for client {} was rejected. It must match the descriptor's HashedControlPassword (see `tor --hash-password`).",
                port
            )),
            Error::RotationFailed { source, .. } => source.suggestion(),
            Error::Channel { port, .. } => Some(format!(
                "Check that client {} is running (`tor-fleet running`) and its ControlPort is reachable.",
                port
            )),
            Error::Parse { .. } | Error::DuplicatePort { .. } => Some(
                "Fix or remove the descriptor; other descriptors are still loaded.".to_string(),
            ),
            Error::CacheUnavailable { .. } => Some(
                "Use --cache-dir to point at a writable directory.".to_string(),
            ),
            Error::ConfigDirUnavailable { .. } => Some(
                "Use --config-dir to point at the directory holding torrc descriptors.".to_string(),
            ),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, port: u16) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for client {} (refers to process group, not a process)",
                port
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("refusing to signal PID 1 (init) for client {}", port),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for client {}, cannot convert safely",
                pid, port
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1, for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}
