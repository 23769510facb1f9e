//! Configuration for justdb.
//!
//! Looks for `.config/justdb.toml` in the current directory or any parent
//! directory. Every value has a default, so an empty file (or no file, via
//! [`Config::default`]) is valid.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::Duration;

/// Location of the config file, relative to a project directory.
pub const CONFIG_PATH: &str = ".config/justdb.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub migration: MigrationConfig,
    pub runtime: RuntimeConfig,
}

/// How migrations are applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Apply destructive changes without an explicit confirmation
    pub confirm_destructive: bool,
    /// Skip diffing when the last complete history entry matches the
    /// declared schema's fingerprint
    pub trust_history: bool,
    /// How long a migration waits for in-flight record operations
    pub drain_timeout_ms: u64,
    /// Name recorded as the schema lock holder
    pub lock_owner: Option<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            confirm_destructive: false,
            trust_history: true,
            drain_timeout_ms: 5_000,
            lock_owner: None,
        }
    }
}

impl MigrationConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// How record operations behave.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Records fetched per page by queries
    pub page_size: usize,
    /// How long an operation waits for a migration touching its entities
    pub gate_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            gate_wait_ms: 1_000,
        }
    }
}

impl RuntimeConfig {
    pub fn gate_wait(&self) -> Duration {
        Duration::from_millis(self.gate_wait_ms)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no .config/justdb.toml found in {start} or any parent")]
    NotFound { start: Utf8PathBuf },

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: Utf8PathBuf, message: String },
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

impl Config {
    /// Parse configuration from TOML source.
    pub fn from_toml(source: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Load configuration, searching up from the current directory.
    pub fn load() -> Result<(Self, Utf8PathBuf)> {
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: Utf8PathBuf::from("."),
            source,
        })?;
        let cwd = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|p| ConfigError::NonUtf8Path(p.display().to_string()))?;
        Self::load_from(&cwd)
    }

    /// Load configuration, searching up from `start`.
    pub fn load_from(start: &Utf8Path) -> Result<(Self, Utf8PathBuf)> {
        let path = find_config_file(start)?;
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            message: e.message().to_string(),
        })?;
        tracing::debug!(path = %path, "loaded configuration");
        Ok((config, path))
    }
}

/// Find `.config/justdb.toml` by searching up the directory tree.
pub fn find_config_file(start: &Utf8Path) -> Result<Utf8PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_PATH))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::NotFound {
            start: start.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join(format!("justdb-config-{}-{}", name, std::process::id()));
        let dir = Utf8PathBuf::from_path_buf(dir).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.migration.trust_history);
        assert!(!config.migration.confirm_destructive);
        assert_eq!(config.migration.drain_timeout(), Duration::from_secs(5));
        assert_eq!(config.runtime.page_size, 100);
        assert_eq!(config.runtime.gate_wait(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_tables() {
        let config = Config::from_toml(
            r#"
[migration]
confirm_destructive = true
lock_owner = "deploy-1"

[runtime]
page_size = 10
"#,
        )
        .unwrap();
        assert!(config.migration.confirm_destructive);
        assert!(config.migration.trust_history);
        assert_eq!(config.migration.lock_owner.as_deref(), Some("deploy-1"));
        assert_eq!(config.runtime.page_size, 10);
        assert_eq!(config.runtime.gate_wait_ms, 1_000);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_toml("[migration]\nconfirm = true\n").is_err());
    }

    #[test]
    fn test_search_walks_up() {
        let root = scratch("walk");
        let nested = root.join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(root.join(".config")).unwrap();
        std::fs::write(root.join(CONFIG_PATH), "[runtime]\npage_size = 7\n").unwrap();

        let (config, path) = Config::load_from(&nested).unwrap();
        assert_eq!(path, root.join(CONFIG_PATH));
        assert_eq!(config.runtime.page_size, 7);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_parse_error_names_file() {
        let root = scratch("bad");
        std::fs::create_dir_all(root.join(".config")).unwrap();
        std::fs::write(root.join(CONFIG_PATH), "[runtime]\npage_size = \"many\"\n").unwrap();

        let err = Config::load_from(&root).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("justdb.toml"));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
