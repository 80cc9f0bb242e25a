use super::{ClientRegistry, ReconcileReport};
use crate::cache::RuntimeCache;
use crate::config::Settings;
use crate::control::{ControlConnector, FallbackSecretSource, SecretSource, TcpControlConnector};
use crate::daemon::{Launcher, TorLauncher};
use crate::error::{Error, Result};
use crate::identity::{HttpIdentityLookup, IdentityLookup};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for constructing a `ClientRegistry` with a fluent API.
///
/// `build()` opens the runtime cache and runs the first reconciliation, so a
/// built registry is ready for lifecycle operations.
///
/// # Example
///
/// ```no_run
/// use tor_fleet::config::Settings;
/// use tor_fleet::registry::ClientRegistry;
///
/// # async fn example() -> Result<(), tor_fleet::Error> {
/// let settings = Settings::load(None)?;
/// let registry = ClientRegistry::builder()
///     .settings(&settings)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RegistryBuilder {
    config_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    data_root: PathBuf,
    launch_timeout: Duration,
    lookup_timeout: Duration,
    launcher: Option<Arc<dyn Launcher>>,
    lookup: Option<Arc<dyn IdentityLookup>>,
    connector: Option<Arc<dyn ControlConnector>>,
    secrets: Option<Arc<dyn SecretSource>>,
    cancellation_token: Option<CancellationToken>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let defaults = Settings::default();
        Self {
            config_dir: None,
            cache_dir: None,
            data_root: defaults.data_root,
            launch_timeout: defaults.launch_timeout,
            lookup_timeout: defaults.lookup_timeout,
            launcher: None,
            lookup: None,
            connector: None,
            secrets: None,
            cancellation_token: None,
        }
    }

    /// Take directories and deadlines from `settings` and use the production
    /// collaborators (`tor` binary, HTTP identity services, TCP control port,
    /// env/prompt secret).
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.config_dir = Some(settings.config_dir.clone());
        self.cache_dir = Some(settings.cache_dir.clone());
        self.data_root = settings.data_root.clone();
        self.launch_timeout = settings.launch_timeout;
        self.lookup_timeout = settings.lookup_timeout;
        self.launcher = Some(Arc::new(TorLauncher::new(
            settings.tor_binary.clone(),
            settings.stop_grace,
        )));
        self.lookup = Some(Arc::new(HttpIdentityLookup::new(
            settings.identity_services.clone(),
            settings.lookup_timeout,
        )));
        self.connector = Some(Arc::new(TcpControlConnector::default()));
        self.secrets = Some(Arc::new(FallbackSecretSource::new()));
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Parent of the data directories given to created descriptors.
    pub fn data_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_root = dir.into();
        self
    }

    /// Deadline for a daemon to become ready. Defaults to 60 seconds.
    pub fn launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    /// Deadline for each identity request. Defaults to 15 seconds.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn identity_lookup(mut self, lookup: Arc<dyn IdentityLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn control_connector(mut self, connector: Arc<dyn ControlConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn secret_source(mut self, secrets: Arc<dyn SecretSource>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Open the cache, check the config directory, and reconcile.
    ///
    /// # Errors
    ///
    /// - `CacheUnavailable` if the cache directory cannot be created or read
    /// - `ConfigDirUnavailable` if the config directory does not exist
    /// - `InvalidArgument` if a directory or collaborator was not provided
    pub async fn build(self) -> Result<ClientRegistry> {
        let config_dir = self
            .config_dir
            .ok_or_else(|| Error::InvalidArgument("config_dir is required".to_string()))?;
        let cache_dir = self
            .cache_dir
            .ok_or_else(|| Error::InvalidArgument("cache_dir is required".to_string()))?;
        if !config_dir.is_dir() {
            return Err(Error::ConfigDirUnavailable {
                path: config_dir,
                reason: "not an existing directory".to_string(),
            });
        }
        let missing = |what: &str| Error::InvalidArgument(format!("{} is required", what));

        let cache = RuntimeCache::open(cache_dir)?;
        let mut registry = ClientRegistry {
            config_dir,
            data_root: self.data_root,
            records: tokio::sync::RwLock::new(BTreeMap::new()),
            cache,
            launcher: self.launcher.ok_or_else(|| missing("launcher"))?,
            lookup: self.lookup.ok_or_else(|| missing("identity lookup"))?,
            connector: self.connector.ok_or_else(|| missing("control connector"))?,
            secrets: self.secrets.ok_or_else(|| missing("secret source"))?,
            known_secrets: parking_lot::Mutex::new(HashMap::new()),
            secret_lock: tokio::sync::Mutex::new(()),
            launch_timeout: self.launch_timeout,
            lookup_timeout: self.lookup_timeout,
            cancellation_token: self.cancellation_token.unwrap_or_default(),
            startup_report: ReconcileReport::default(),
        };

        registry.startup_report = registry.reconcile().await?;
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
