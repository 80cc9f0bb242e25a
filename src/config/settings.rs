//! Manager-level settings: directories, deadlines, daemon binary and the
//! identity services used for lookups.
//!
//! Resolution order, lowest to highest priority:
//! built-in defaults, `settings.yaml`, environment variables, CLI flags.

use super::duration::deserialize_duration;
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_ENV: &str = "TOR_FLEET_CONFIG_DIR";
pub const CACHE_DIR_ENV: &str = "TOR_FLEET_CACHE_DIR";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory holding `torrc` and `torrc.<n>` descriptors.
    pub config_dir: PathBuf,
    /// Directory holding `client.<port>` runtime cache entries.
    pub cache_dir: PathBuf,
    /// Parent of the per-client data directories created by `create`.
    pub data_root: PathBuf,
    pub tor_binary: PathBuf,
    #[serde(deserialize_with = "deserialize_duration")]
    pub launch_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub lookup_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a daemon.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_grace: Duration,
    /// Identity services in the order they are tried.
    pub identity_services: Vec<IdentityService>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/tor"),
            cache_dir: default_cache_dir(),
            data_root: PathBuf::from("/var/lib"),
            tor_binary: PathBuf::from("tor"),
            launch_timeout: Duration::from_secs(60),
            lookup_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            identity_services: vec![IdentityService::Ipinfo, IdentityService::IpApi],
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tor-fleet")
        .join("clients_cache")
}

/// `$XDG_CONFIG_HOME/tor-fleet/settings.yaml`, or the platform equivalent.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tor-fleet").join("settings.yaml"))
}

impl Settings {
    /// Load settings from an explicit file, or from the default location.
    ///
    /// An explicit path must exist. A missing default file just yields the
    /// built-in defaults. Environment overrides are applied afterwards.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_settings_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Settings(format!(
                "Failed to read settings file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content).map_err(|e| match e {
            Error::Yaml(e) => Error::Settings(format!("'{}': {}", path.display(), e)),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `TOR_FLEET_CONFIG_DIR` / `TOR_FLEET_CACHE_DIR`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
            tracing::debug!("{} overrides config_dir: {}", CONFIG_DIR_ENV, dir);
            self.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            tracing::debug!("{} overrides cache_dir: {}", CACHE_DIR_ENV, dir);
            self.cache_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.launch_timeout.is_zero() {
            return Err(Error::Settings("launch_timeout must be positive".to_string()));
        }
        if self.lookup_timeout.is_zero() {
            return Err(Error::Settings("lookup_timeout must be positive".to_string()));
        }
        if self.identity_services.is_empty() {
            return Err(Error::Settings(
                "identity_services must name at least one service".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.launch_timeout, Duration::from_secs(60));
        assert_eq!(settings.lookup_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let settings = Settings::parse(
            "config_dir: /opt/tor\nlaunch_timeout: 90s\nidentity_services: [ip-api]\n",
        )
        .unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/opt/tor"));
        assert_eq!(settings.launch_timeout, Duration::from_secs(90));
        assert_eq!(settings.identity_services, vec![IdentityService::IpApi]);
        assert_eq!(settings.tor_binary, PathBuf::from("tor"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(Settings::parse("cofig_dir: /opt/tor\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(|key| match key {
            CONFIG_DIR_ENV => Some("/srv/tor".to_string()),
            CACHE_DIR_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(settings.config_dir, PathBuf::from("/srv/tor"));
        assert_eq!(settings.cache_dir, default_cache_dir());
    }

    #[test]
    fn test_validate_rejects_zero_deadline() {
        let settings = Settings {
            launch_timeout: Duration::ZERO,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
    }
}
