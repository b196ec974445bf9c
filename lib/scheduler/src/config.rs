//! Scheduler configuration.
//!
//! Loaded from a TOML file with two sections, `[default]` and
//! `[session]`, via the `config` crate, pointed at a file source
//! instead of the environment since this config is a long-lived,
//! operator-edited artifact rather than process-launch parameters.
//! Two fields are derived rather than stored (`root_directory`,
//! `config_path`) and two are the only ones ever written back
//! (`session.port`, `last_shutdown`), both through [`SchedulerConfig::save`].

use cadence_core::Moment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors loading or saving a [`SchedulerConfig`].
#[derive(Debug)]
pub enum ConfigError {
    /// The config file does not exist.
    Missing { path: PathBuf },
    /// The config file exists but failed to parse.
    Invalid { reason: String },
    /// The config file could not be (re)written.
    WriteFailed { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "config file not found: {}", path.display()),
            Self::Invalid { reason } => write!(f, "config file is invalid: {reason}"),
            Self::WriteFailed { reason } => write!(f, "failed to write config file: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// `[session]` section: the control channel's ephemeral port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Recorded at launch once the control channel is bound.
    #[serde(default)]
    pub port: Option<u16>,
}

/// The on-disk shape of a scheduler's config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    registry: PathBuf,
    database: PathBuf,
    log_directory: PathBuf,
    #[serde(default)]
    last_shutdown: Option<Moment>,
    #[serde(default)]
    session: SessionConfig,
}

/// A scheduler's full configuration: the on-disk fields plus the two
/// values derived from the config file's own location.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub registry: PathBuf,
    pub database: PathBuf,
    pub log_directory: PathBuf,
    pub last_shutdown: Option<Moment>,
    pub session: SessionConfig,
    /// Directory containing the config file (not serialized).
    pub root_directory: PathBuf,
    /// Path to the config file itself (not serialized).
    pub config_path: PathBuf,
}

impl SchedulerConfig {
    /// Loads a config file from `path`, deriving `root_directory` and
    /// `config_path` from the path itself.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if `path` does not exist, or
    /// [`ConfigError::Invalid`] if it fails to parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing { path: path.to_path_buf() });
        }

        let raw: RawConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ConfigError::Invalid { reason: e.to_string() })?
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid { reason: e.to_string() })?;

        let root_directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            registry: raw.registry,
            database: raw.database,
            log_directory: raw.log_directory,
            last_shutdown: raw.last_shutdown,
            session: raw.session,
            root_directory,
            config_path: path.to_path_buf(),
        })
    }

    /// Re-serializes the whole config and writes it back atomically
    /// (write to a sibling temp file, then rename over the original).
    /// The only two call sites that mutate fields before calling this
    /// are recording the listening port at launch and `last_shutdown`
    /// at shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WriteFailed`] if serialization or the
    /// rename fails.
    pub fn save(&self) -> Result<(), ConfigError> {
        let raw = RawConfig {
            registry: self.registry.clone(),
            database: self.database.clone(),
            log_directory: self.log_directory.clone(),
            last_shutdown: self.last_shutdown,
            session: self.session.clone(),
        };

        let body = toml::to_string_pretty(&raw).map_err(|e| ConfigError::WriteFailed { reason: e.to_string() })?;

        let tmp_path = self.config_path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, body).map_err(|e| ConfigError::WriteFailed { reason: e.to_string() })?;
        std::fs::rename(&tmp_path, &self.config_path)
            .map_err(|e| ConfigError::WriteFailed { reason: e.to_string() })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("cadence.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_and_derives_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
            registry = "/etc/cadence/registry.xml"
            database = "/var/lib/cadence/state.db"
            log_directory = "/var/log/cadence"
            "#,
        );

        let config = SchedulerConfig::load(&path).unwrap();
        assert_eq!(config.root_directory, dir.path());
        assert_eq!(config.config_path, path);
        assert!(config.session.port.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = SchedulerConfig::load(Path::new("/nonexistent/cadence.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn save_round_trips_port_and_last_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
            registry = "/etc/cadence/registry.xml"
            database = "/var/lib/cadence/state.db"
            log_directory = "/var/log/cadence"
            "#,
        );

        let mut config = SchedulerConfig::load(&path).unwrap();
        config.session.port = Some(40221);
        config.last_shutdown = Some("2021-09-22T09:00:00".parse().unwrap());
        config.save().unwrap();

        let reloaded = SchedulerConfig::load(&path).unwrap();
        assert_eq!(reloaded.session.port, Some(40221));
        assert_eq!(reloaded.last_shutdown, Some("2021-09-22T09:00:00".parse().unwrap()));
    }
}
