//! Worker settings.
//!
//! Settings come from an optional TOML file; the binary applies command
//! line overrides on top. Only `ttl` can change while the worker runs: a
//! reload request (SIGHUP in the binary) re-reads the file at the next
//! dispatch tick and picks up the new retention interval, unless `--ttl`
//! pinned it on the command line. Everything else needs a restart.
//!
//! ```toml
//! ttl = "6 hours"
//! database = "/var/lib/netq/queue.db"
//! max_connections = 100
//! idle_interval_ms = 1000
//! connect_timeout_secs = 300
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netq_core::Interval;
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Retention for queue rows.
    pub ttl: Interval,
    /// SQLite database holding the queue and response tables.
    pub database: PathBuf,
    /// Cap on simultaneously open connections.
    pub max_connections: usize,
    /// Period of the dispatch tick.
    pub idle_interval_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ttl: Interval::default(),
            database: PathBuf::from("netq.db"),
            max_connections: 100,
            idle_interval_ms: 1000,
            connect_timeout_secs: 300,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.idle_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout(),
            ..EngineConfig::default()
        }
    }
}

/// Where settings were loaded from, for later reloads.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    ttl_override: Option<Interval>,
}

impl ConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            ttl_override: None,
        }
    }

    /// Pin the ttl to a value given outside the file (the `--ttl` flag).
    /// Reloads still re-read and validate the file but keep this ttl.
    pub fn with_ttl_override(mut self, ttl: Option<Interval>) -> Self {
        self.ttl_override = ttl;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load from the file, or defaults when there is none.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        match &self.path {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }

    /// Re-read the reloadable part of the settings.
    pub fn reload_ttl(&self) -> Result<Option<Interval>, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let settings = Settings::load(path)?;
        Ok(Some(self.ttl_override.clone().unwrap_or(settings.ttl)))
    }
}

/// Cross-thread request to reload settings at the next tick.
#[derive(Debug, Clone, Default)]
pub struct ReloadHandle(Arc<AtomicBool>);

impl ReloadHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let settings = Settings::from_toml("ttl = \"1 hour\"").unwrap();
        assert_eq!(settings.ttl.duration(), Duration::from_secs(3_600));
        assert_eq!(settings.max_connections, 100);
        assert_eq!(settings.idle_interval(), Duration::from_secs(1));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            Settings::from_toml("colour = \"blue\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Settings::from_toml("ttl = \"3 fortnights\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Settings::from_toml("max_connections = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn engine_config_carries_limits() {
        let settings = Settings::from_toml("max_connections = 4\nconnect_timeout_secs = 2").unwrap();
        let engine = settings.engine_config();
        assert_eq!(engine.max_connections, 4);
        assert_eq!(engine.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn reload_reads_new_ttl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ttl = \"2 days\"").unwrap();
        let source = ConfigSource::new(Some(file.path().to_path_buf()));
        assert_eq!(
            source.reload_ttl().unwrap().unwrap().duration(),
            Duration::from_secs(172_800)
        );

        fs::write(file.path(), "ttl = \"30 minutes\"\n").unwrap();
        assert_eq!(
            source.reload_ttl().unwrap().unwrap().duration(),
            Duration::from_secs(1_800)
        );
    }

    #[test]
    fn ttl_override_survives_reload() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), "max_connections = 10\n").unwrap();
        let pinned = Interval::parse("2 hours").unwrap();
        let source = ConfigSource::new(Some(file.path().to_path_buf()))
            .with_ttl_override(Some(pinned.clone()));
        assert_eq!(source.reload_ttl().unwrap(), Some(pinned.clone()));

        fs::write(file.path(), "ttl = \"5 minutes\"\n").unwrap();
        assert_eq!(source.reload_ttl().unwrap(), Some(pinned));

        fs::write(file.path(), "max_connections = 0\n").unwrap();
        assert!(matches!(source.reload_ttl(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let source = ConfigSource::new(Some(PathBuf::from("/nonexistent/netq.toml")));
        assert!(matches!(source.load(), Err(ConfigError::Read { .. })));
        assert_eq!(ConfigSource::default().reload_ttl().unwrap(), None);
    }

    #[test]
    fn reload_handle_is_consumed_once() {
        let handle = ReloadHandle::default();
        let other = handle.clone();
        other.request();
        assert!(handle.take());
        assert!(!handle.take());
    }
}
