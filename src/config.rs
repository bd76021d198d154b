//! Server configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file,
//! then `ENCOUNTERD_*` environment variables, then command-line overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::battlefield::DEFAULT_OUTBOX_CAPACITY;

/// File read when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "encounterd.toml";
pub const ENV_PREFIX: &str = "ENCOUNTERD_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Seed for encounters created without one; None = entropy
    pub default_seed: Option<u64>,
    /// Frames buffered per observer before deltas are dropped
    pub outbox_capacity: usize,
    pub log_format: LogFormat,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            default_seed: None,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            log_format: LogFormat::Text,
            log_filter: "encounterd=info,tower_http=debug".to_string(),
        }
    }
}

/// Values given on the command line; unset fields leave lower layers alone
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_seed: Option<u64>,
}

impl Config {
    /// Resolve every layer; an explicit `path` must exist
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX, overrides)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str, overrides: Overrides) -> Result<Self> {
        let file = match path {
            Some(p) if !p.exists() => {
                anyhow::bail!("Config file not found: {}", p.display());
            }
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(prefix))
            .merge(Serialized::defaults(overrides))
            .extract()
            .with_context(|| format!("Invalid configuration (file {})", file.display()))?;

        if config.outbox_capacity == 0 {
            anyhow::bail!("outbox_capacity must be at least 1");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load_with_prefix(
            None,
            "ENCOUNTERD_TEST_UNSET_",
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_file_then_overrides() {
        let file = write_toml(
            r#"
bind_addr = "0.0.0.0:9000"
default_seed = 7
outbox_capacity = 8
log_format = "json"
"#,
        );
        let config =
            Config::load_with_prefix(Some(file.path()), "ENCOUNTERD_TEST_FILE_", Overrides::default())
                .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.default_seed, Some(7));
        assert_eq!(config.outbox_capacity, 8);
        assert_eq!(config.log_format, LogFormat::Json);

        let overrides = Overrides {
            bind_addr: Some("127.0.0.1:0".parse().unwrap()),
            default_seed: None,
        };
        let config =
            Config::load_with_prefix(Some(file.path()), "ENCOUNTERD_TEST_FILE_", overrides).unwrap();
        assert_eq!(config.bind_addr.port(), 0);
        // Unset override keeps the file's value
        assert_eq!(config.default_seed, Some(7));
    }

    #[test]
    fn test_environment_layer() {
        let file = write_toml("outbox_capacity = 8\n");
        std::env::set_var("ENCOUNTERD_TEST_ENV_OUTBOX_CAPACITY", "3");
        let config =
            Config::load_with_prefix(Some(file.path()), "ENCOUNTERD_TEST_ENV_", Overrides::default())
                .unwrap();
        std::env::remove_var("ENCOUNTERD_TEST_ENV_OUTBOX_CAPACITY");
        assert_eq!(config.outbox_capacity, 3);
    }

    #[test]
    fn test_rejects_bad_values() {
        let missing = Config::load(
            Some(Path::new("/definitely/not/here.toml")),
            Overrides::default(),
        );
        assert!(missing.is_err());

        let file = write_toml("outbox_capacity = 0\n");
        assert!(
            Config::load_with_prefix(Some(file.path()), "ENCOUNTERD_TEST_BAD_", Overrides::default())
                .is_err()
        );

        let file = write_toml("log_format = \"xml\"\n");
        assert!(
            Config::load_with_prefix(Some(file.path()), "ENCOUNTERD_TEST_BAD_", Overrides::default())
                .is_err()
        );
    }
}
