//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! root = "/var/lib/strata"
//!
//! [store]
//! verify_reads = true
//! read_timeout_ms = 30000
//! retry_attempts = 4
//!
//! [gc]
//! enabled = true
//! interval_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_gc::GcConfig;
use strata_store::{RetryPolicy, StoreConfig};

use crate::error::{EngineError, EngineResult};

/// Top-level engine settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding objects and `refs.json`. `None` keeps everything in
    /// memory.
    pub root: Option<PathBuf>,
    pub store: StoreSettings,
    pub gc: GcConfig,
}

/// Content store settings in file-friendly units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub verify_reads: bool,
    /// Bound for reads that have to fetch missing objects. `None` waits
    /// indefinitely.
    pub read_timeout_ms: Option<u64>,
    pub retry_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_jitter: bool,
    /// `fsync` objects before publishing them.
    pub sync_writes: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            verify_reads: store.verify_reads,
            read_timeout_ms: store.read_timeout.map(|t| t.as_millis() as u64),
            retry_attempts: store.retry.max_attempts,
            retry_initial_backoff_ms: store.retry.initial_backoff.as_millis() as u64,
            retry_max_backoff_ms: store.retry.max_backoff.as_millis() as u64,
            retry_jitter: store.retry.jitter,
            sync_writes: true,
        }
    }
}

impl StoreSettings {
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                jitter: self.retry_jitter,
            },
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
            verify_reads: self.verify_reads,
        }
    }
}

impl EngineConfig {
    /// Settings for a filesystem-backed engine rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file. Relative roots are resolved against the file's
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        if let (Some(root), Some(dir)) = (config.root.as_mut(), path.parent()) {
            if root.is_relative() {
                *root = dir.join(&*root);
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    fn validate(&self) -> EngineResult<()> {
        if self.store.retry_initial_backoff_ms > self.store.retry_max_backoff_ms {
            return Err(EngineError::Config(
                "store.retry_initial_backoff_ms exceeds store.retry_max_backoff_ms".into(),
            ));
        }
        if self.gc.enabled && self.gc.interval_secs == 0 {
            return Err(EngineError::Config("gc.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_store_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.root, None);
        assert_eq!(config.store.to_store_config(), StoreConfig::default());
        assert_eq!(config.gc, GcConfig::default());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            root = "/var/lib/strata"

            [store]
            read_timeout_ms = 500
            retry_attempts = 2

            [gc]
            interval_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.root, Some(PathBuf::from("/var/lib/strata")));
        let store = config.store.to_store_config();
        assert_eq!(store.read_timeout, Some(Duration::from_millis(500)));
        assert_eq!(store.retry.max_attempts, 2);
        assert!(store.verify_reads);
        assert_eq!(config.gc.interval(), Duration::from_secs(60));
        assert!(config.gc.enabled);
    }

    #[test]
    fn toml_round_trips() {
        let mut config = EngineConfig::at("/tmp/strata");
        config.store.read_timeout_ms = Some(100);
        config.gc.enabled = false;
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let err = EngineConfig::from_toml_str("[gc]\ninterval_secs = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        let err = EngineConfig::from_toml_str("[store]\nretry_initial_backoff_ms = 5000\nretry_max_backoff_ms = 10\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(EngineConfig::from_toml_str("root = 7").is_err());
    }

    #[test]
    fn load_resolves_relative_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "root = \"data\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.root, Some(dir.path().join("data")));
    }
}
