use crate::error::ConfigError;
use crate::hashers::{CHUNK_SIZE, PROGRESS_INTERVAL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers; fixed for the lifetime of the pool.
    ///
    /// Defaults to the hardware parallelism. A larger value is honoured as an
    /// explicit override and logged as a warning when the pool starts.
    pub workers: usize,
    /// Read buffer size in bytes.
    pub chunk_size: usize,
    /// Bytes between two progress events.
    pub progress_interval: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            chunk_size: CHUNK_SIZE,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl PoolConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PoolConfig = serde_json::from_str(&s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Hardware parallelism, at least 1.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PoolConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.progress_interval, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        fs::write(&path, r#"{"workers": 3}"#).unwrap();

        let config = PoolConfig::load(&path).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        fs::write(&path, r#"{"workers": 0}"#).unwrap();
        assert!(matches!(PoolConfig::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn workers_above_parallelism_are_an_accepted_override() {
        let config = PoolConfig::default().with_workers(default_workers() + 8);
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, default_workers() + 8);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PoolConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
