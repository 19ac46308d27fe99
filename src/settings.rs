use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

fn default_root() -> PathBuf {
    std::env::temp_dir().join("restash-http-cache")
}

fn default_max_entries() -> usize {
    1_000
}

fn default_initial_expiration_secs() -> u64 {
    2 * 24 * 60 * 60
}

fn default_refresh_expiration_secs() -> u64 {
    2 * 24 * 60 * 60
}

fn default_purge_interval_secs() -> u64 {
    300
}

/// Cache configuration. Loadable from an optional TOML file plus
/// `RESTASH__*` environment variables, or constructed directly by the
/// embedding client.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Directory holding the permanent entries; `temp/` is created below it.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Soft cap on `*.json` entries under the root, enforced by purge.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Lifetime applied to stored responses that carry no `max-age`.
    #[serde(default = "default_initial_expiration_secs")]
    pub default_initial_expiration_secs: u64,
    /// Lifetime applied to refreshes without an explicit new `max-age`.
    #[serde(default = "default_refresh_expiration_secs")]
    pub default_refresh_expiration_secs: u64,
    /// When true, an unparseable bearer token yields no cache key instead
    /// of falling back to the raw `Authorization` value.
    #[serde(default)]
    pub require_jwt_token: bool,
    /// Period of the scheduled purge task; 0 disables it.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: default_root(),
            max_entries: default_max_entries(),
            default_initial_expiration_secs: default_initial_expiration_secs(),
            default_refresh_expiration_secs: default_refresh_expiration_secs(),
            require_jwt_token: false,
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("RESTASH")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_entries > 0,
            "max_entries must be at least 1 (got {})",
            self.max_entries
        );
        ensure!(
            self.default_initial_expiration_secs > 0,
            "default_initial_expiration_secs must be greater than 0 (got {})",
            self.default_initial_expiration_secs
        );
        ensure!(
            self.default_refresh_expiration_secs > 0,
            "default_refresh_expiration_secs must be greater than 0 (got {})",
            self.default_refresh_expiration_secs
        );
        ensure!(
            !self.root.as_os_str().is_empty(),
            "root directory must not be empty"
        );
        Ok(())
    }

    pub fn default_initial_expiration(&self) -> Duration {
        Duration::from_secs(self.default_initial_expiration_secs)
    }

    pub fn default_refresh_expiration(&self) -> Duration {
        Duration::from_secs(self.default_refresh_expiration_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_entries, 1_000);
        assert_eq!(
            settings.default_initial_expiration(),
            Duration::from_secs(172_800)
        );
        assert_eq!(settings.purge_interval(), Duration::from_secs(300));
    }

    #[test]
    fn zero_max_entries_is_rejected() {
        let settings = Settings {
            max_entries: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_expirations_are_rejected() {
        let settings = Settings {
            default_initial_expiration_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            default_refresh_expiration_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
