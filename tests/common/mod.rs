//! Stub collaborators and fixtures shared by the registry tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tor_fleet::config::ConfigDescriptor;
use tor_fleet::control::{ControlChannel, ControlConnector, Secret, SecretSource, Signal};
use tor_fleet::daemon::{DaemonProcess, Launcher};
use tor_fleet::identity::{Identity, IdentityLookup};
use tor_fleet::registry::{ClientRegistry, RegistryBuilder};
use tor_fleet::{Error, Result};

pub const HASH: &str = "16:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const PASSWORD: &str = "hunter2";

pub fn stub_identity() -> Identity {
    Identity {
        address: "9.9.9.9".to_string(),
        region: "X".to_string(),
        subregion: "Y".to_string(),
        locality: "Z".to_string(),
    }
}

/// A config directory and a cache directory that live for one test.
pub struct Fixture {
    pub config: TempDir,
    pub cache: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            config: tempfile::tempdir().expect("config dir"),
            cache: tempfile::tempdir().expect("cache dir"),
        }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.path().join(name);
        fs::write(&path, content).expect("write descriptor");
        path
    }

    /// Default descriptor on 9050 plus custom clients on 9060 {us}, 9070 {de}.
    pub fn with_fleet(self) -> Self {
        self.write(
            "torrc",
            &format!("SocksPort 9050\nControlPort 9051\nHashedControlPassword {}\n", HASH),
        );
        self.write("torrc.1", "SocksPort 9060\nControlPort 9061\nExitNodes {us}\n");
        self.write("torrc.2", "SocksPort 9070\nControlPort 9071\nExitNodes {de},{fr}\n");
        self
    }

    pub fn builder(&self, stubs: &Stubs) -> RegistryBuilder {
        ClientRegistry::builder()
            .config_dir(self.config.path())
            .cache_dir(self.cache.path())
            .data_root(self.config.path().join("data"))
            .launch_timeout(Duration::from_secs(60))
            .lookup_timeout(Duration::from_secs(5))
            .launcher(stubs.launcher.clone())
            .identity_lookup(stubs.lookup.clone())
            .control_connector(stubs.connector.clone())
            .secret_source(stubs.secrets.clone())
    }

    pub async fn registry(&self, stubs: &Stubs) -> ClientRegistry {
        self.builder(stubs).build().await.expect("registry builds")
    }
}

pub struct Stubs {
    pub launcher: Arc<StubLauncher>,
    pub lookup: Arc<StubLookup>,
    pub connector: Arc<StubConnector>,
    pub secrets: Arc<StubSecrets>,
}

impl Stubs {
    pub fn new() -> Self {
        Self {
            launcher: Arc::new(StubLauncher::default()),
            lookup: Arc::new(StubLookup::default()),
            connector: Arc::new(StubConnector::default()),
            secrets: Arc::new(StubSecrets::new(&[PASSWORD])),
        }
    }
}

/// Hands out fake pids and tracks which of them are "alive".
pub struct StubLauncher {
    pub next_pid: AtomicU32,
    pub alive: Arc<Mutex<HashSet<u32>>>,
    pub launches: AtomicUsize,
    pub never_ready: bool,
    pub fail_launch: bool,
    pub fail_terminate: Option<u16>,
}

impl Default for StubLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            alive: Arc::new(Mutex::new(HashSet::new())),
            launches: AtomicUsize::new(0),
            never_ready: false,
            fail_launch: false,
            fail_terminate: None,
        }
    }
}

impl StubLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn is_pid_alive(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

#[async_trait]
impl Launcher for StubLauncher {
    async fn launch(&self, descriptor: &ConfigDescriptor) -> Result<Box<dyn DaemonProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.never_ready {
            futures::future::pending::<()>().await;
        }
        if self.fail_launch {
            return Err(Error::LaunchFailed {
                port: descriptor.socks_port,
                reason: "stub refused to launch".to_string(),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().insert(pid);
        Ok(Box::new(StubProcess {
            pid,
            port: descriptor.socks_port,
            fail: self.fail_terminate == Some(descriptor.socks_port),
            alive: self.alive.clone(),
        }))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.is_pid_alive(pid)
    }

    async fn kill_pid(&self, port: u16, pid: u32) -> Result<()> {
        if self.fail_terminate == Some(port) {
            return Err(Error::StopFailed {
                port,
                reason: "stub refused to die".to_string(),
            });
        }
        self.alive.lock().remove(&pid);
        Ok(())
    }
}

struct StubProcess {
    pid: u32,
    port: u16,
    fail: bool,
    alive: Arc<Mutex<HashSet<u32>>>,
}

#[async_trait]
impl DaemonProcess for StubProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.fail {
            return Err(Error::StopFailed {
                port: self.port,
                reason: "stub refused to die".to_string(),
            });
        }
        self.alive.lock().remove(&self.pid);
        Ok(())
    }
}

/// Always answers with 9.9.9.9 unless told to fail.
#[derive(Default)]
pub struct StubLookup {
    pub calls: AtomicUsize,
    pub fail: std::sync::atomic::AtomicBool,
}

impl StubLookup {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityLookup for StubLookup {
    async fn lookup(&self, port: u16) -> Result<Identity> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Lookup {
                port,
                reason: "stub lookup down".to_string(),
            });
        }
        Ok(stub_identity())
    }
}

/// Burns one request deadline per failing service before the last service
/// answers, or never answers at all.
pub struct SlowLookup {
    per_request: Duration,
    services: u32,
    hang: bool,
}

impl SlowLookup {
    pub fn hanging() -> Self {
        Self {
            per_request: Duration::ZERO,
            services: 1,
            hang: true,
        }
    }

    pub fn falling_back(per_request: Duration, services: u32) -> Self {
        Self {
            per_request,
            services,
            hang: false,
        }
    }
}

#[async_trait]
impl IdentityLookup for SlowLookup {
    async fn lookup(&self, _port: u16) -> Result<Identity> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        for _ in 1..self.services {
            tokio::time::sleep(self.per_request).await;
        }
        // The answering service is not instant either
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(stub_identity())
    }

    fn attempts(&self) -> u32 {
        self.services
    }
}

/// Records every command it receives; accepts only [`PASSWORD`].
#[derive(Default)]
pub struct StubConnector {
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl StubConnector {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl ControlConnector for StubConnector {
    async fn connect(&self, port: u16, control_port: u16) -> Result<Box<dyn ControlChannel>> {
        self.commands.lock().push(format!("CONNECT {}", control_port));
        Ok(Box::new(StubChannel {
            port,
            commands: self.commands.clone(),
            authenticated: false,
        }))
    }
}

struct StubChannel {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    authenticated: bool,
}

#[async_trait]
impl ControlChannel for StubChannel {
    async fn authenticate(&mut self, secret: &Secret) -> Result<()> {
        self.commands
            .lock()
            .push(format!("AUTHENTICATE {}", secret.expose()));
        if secret.expose() != PASSWORD {
            return Err(Error::Auth {
                port: self.port,
                reason: "515 Authentication failed".to_string(),
            });
        }
        self.authenticated = true;
        Ok(())
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        self.commands
            .lock()
            .push(format!("SIGNAL {}", signal.keyword()));
        if !self.authenticated {
            return Err(Error::Channel {
                port: self.port,
                reason: "514 Authentication required".to_string(),
            });
        }
        Ok(())
    }
}

/// Returns the given secrets in order, repeating the last one.
pub struct StubSecrets {
    answers: Vec<String>,
    pub calls: AtomicUsize,
}

impl StubSecrets {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSource for StubSecrets {
    async fn obtain(&self, port: u16) -> Result<Secret> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .get(n)
            .or_else(|| self.answers.last())
            .map(|s| Secret::new(s.clone()))
            .ok_or_else(|| Error::Auth {
                port,
                reason: "no secret configured".to_string(),
            })
    }
}
