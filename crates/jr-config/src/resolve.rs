//! Locate the config file and load it.
//!
//! Search order, first hit wins:
//! 1. explicit `--config` path (must exist)
//! 2. `$JOBREPORT_CONFIG` (must exist)
//! 3. `<config_dir>/jobreport/config.json` (optional)
//! 4. built-in defaults

use crate::config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "JOBREPORT_CONFIG";

const CONFIG_DIR_NAME: &str = "jobreport";
const CONFIG_FILE_NAME: &str = "config.json";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Cli(PathBuf),
    Env(PathBuf),
    UserConfig(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Cli(p) | ConfigSource::Env(p) | ConfigSource::UserConfig(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Config,
    pub source: ConfigSource,
}

/// Resolve the configuration from the process environment.
pub fn resolve_config(explicit: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
    let env_path = std::env::var_os(CONFIG_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    let user_dir = dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME));
    resolve_config_with(explicit, env_path, user_dir.as_deref())
}

/// Resolution with every input supplied by the caller.
pub fn resolve_config_with(
    explicit: Option<&Path>,
    env_path: Option<PathBuf>,
    user_dir: Option<&Path>,
) -> Result<ResolvedConfig, ConfigError> {
    let source = if let Some(path) = explicit {
        ConfigSource::Cli(path.to_path_buf())
    } else if let Some(path) = env_path {
        ConfigSource::Env(path)
    } else {
        match user_dir.map(|d| d.join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => ConfigSource::UserConfig(path),
            _ => ConfigSource::Defaults,
        }
    };

    let config = match source.path() {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    debug!(source = ?source, "resolved configuration");
    Ok(ResolvedConfig { config, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_when_nothing_found() {
        let dir = tempdir().unwrap();
        let resolved = resolve_config_with(None, None, Some(dir.path())).unwrap();
        assert_eq!(resolved.source, ConfigSource::Defaults);
        assert_eq!(resolved.config, Config::default());
    }

    #[test]
    fn test_precedence() {
        let dir = tempdir().unwrap();
        let cli = write(dir.path(), "cli.json", r#"{"sampling_time_secs": 1}"#);
        let env = write(dir.path(), "env.json", r#"{"sampling_time_secs": 2}"#);
        write(dir.path(), CONFIG_FILE_NAME, r#"{"sampling_time_secs": 3}"#);

        let r = resolve_config_with(Some(&cli), Some(env.clone()), Some(dir.path())).unwrap();
        assert_eq!(r.config.sampling_time_secs, 1);

        let r = resolve_config_with(None, Some(env.clone()), Some(dir.path())).unwrap();
        assert_eq!(r.source, ConfigSource::Env(env));
        assert_eq!(r.config.sampling_time_secs, 2);

        let r = resolve_config_with(None, None, Some(dir.path())).unwrap();
        assert!(matches!(r.source, ConfigSource::UserConfig(_)));
        assert_eq!(r.config.sampling_time_secs, 3);
    }

    #[test]
    fn test_explicit_missing_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            resolve_config_with(Some(&missing), None, None),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_values_are_fatal() {
        let dir = tempdir().unwrap();
        let bad = write(dir.path(), "bad.json", r#"{"max_time": "later"}"#);
        assert!(matches!(
            resolve_config_with(Some(&bad), None, None),
            Err(ConfigError::Invalid(_))
        ));
    }
}
