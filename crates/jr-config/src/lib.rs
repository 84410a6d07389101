//! Jobreport configuration loading and validation.
//!
//! This crate provides:
//! - The typed `config.json` settings struct
//! - Config resolution (CLI → env → user config dir → defaults)
//! - Semantic validation and Slurm time-spec parsing
//! - Reading the Slurm environment into a `JobTopology`

pub mod config;
pub mod resolve;
pub mod slurm;
pub mod time_spec;

pub use config::{Config, ConfigError};
pub use resolve::{resolve_config, resolve_config_with, ConfigSource, ResolvedConfig, CONFIG_ENV_VAR};
pub use slurm::{topology_from_env, topology_from_env_map};
pub use time_spec::parse_time_spec;

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
