//! Typed `config.json` settings.

use crate::time_spec::parse_time_spec;
use jr_telemetry::StorageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Errors from loading or validating a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for jr_common::Error {
    fn from(err: ConfigError) -> Self {
        jr_common::Error::Config(err.to_string())
    }
}

/// Recording settings. Every field has a default, so an empty JSON object is
/// a valid config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Sampling period in seconds. 0 picks one from the expected runtime.
    pub sampling_time_secs: u64,

    /// Maximum expected runtime as a Slurm time spec (`D-H:M:S` and friends).
    pub max_time: Option<String>,

    /// Base directory of the output tree.
    pub output: Option<PathBuf>,

    /// Write one shared file per step instead of one file per process.
    pub single_file: bool,

    /// Directory for single-file lock files (defaults to next to the data).
    pub lock_dir: Option<PathBuf>,

    pub storage_format: StorageFormat,

    /// Replace an existing fragment instead of failing.
    pub force: bool,

    /// Monitor all visible GPUs even when Slurm bound specific ones.
    pub ignore_gpu_binding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_time_secs: 10,
            max_time: None,
            output: None,
            single_file: false,
            lock_dir: None,
            storage_format: StorageFormat::Csv,
            force: false,
            ignore_gpu_binding: false,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read and parse a config file. Does not validate.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(spec) = &self.max_time {
            parse_time_spec(spec).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(dir) = &self.lock_dir {
            if !self.single_file {
                tracing::warn!(
                    lock_dir = %dir.display(),
                    "lock_dir is only used in single-file mode"
                );
            }
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("lock_dir is empty".to_string()));
            }
        }
        if matches!(&self.output, Some(p) if p.as_os_str().is_empty()) {
            return Err(ConfigError::Invalid("output is empty".to_string()));
        }
        Ok(())
    }

    /// Maximum runtime in seconds, when one is configured.
    pub fn max_time_secs(&self) -> jr_common::Result<Option<u64>> {
        self.max_time.as_deref().map(parse_time_spec).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_object_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sampling_time_secs, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_json() {
        let config = Config {
            max_time: Some("1-00:00:00".into()),
            single_file: true,
            lock_dir: Some("/tmp/locks".into()),
            storage_format: StorageFormat::Binary,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"binary\""));
        assert_eq!(Config::from_json(&json).unwrap(), config);
        assert_eq!(config.max_time_secs().unwrap(), Some(86_400));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_json(r#"{"sampling_time": 5}"#).is_err());
    }

    #[test]
    fn test_bad_time_spec_invalid() {
        let config = Config {
            max_time: Some("soon".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            Config::load_from_file(&missing),
            Err(ConfigError::NotFound(_))
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let err = Config::load_from_file(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        let common: jr_common::Error = err.into();
        assert_eq!(common.code(), 10);
    }
}
