//! Connection and mount configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "DOJO_CONFIG";

/// Config file location relative to `$HOME` when no override is set
const DEFAULT_CONFIG_PATH: &str = ".config/dojo-bridge/config.json";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file exists but could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },
    /// Config file is not valid JSON for [`BridgeConfig`]
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the config file
        path: PathBuf,
        /// Underlying parse error
        source: serde_json::Error,
    },
}

/// Settings for reaching the remote host and presenting it locally.
///
/// Every field has a default, so a config file only needs to name the
/// values it wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Remote host name
    pub host: String,
    /// Remote SSH port
    pub port: u16,
    /// Remote user name
    pub username: String,
    /// Private key used for public-key authentication
    pub identity_file: String,
    /// Remote working directory for file operations and mounts
    pub project_path: String,
    /// Local directory the remote project is mounted onto
    pub mount_point: String,
    /// Terminal type requested for pseudo-terminals
    pub term: String,
    /// Report file times to the filesystem driver in nanoseconds
    pub timestamps_in_nanoseconds: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "dojo.pwn.college".to_string(),
            port: 22,
            username: "hacker".to_string(),
            identity_file: "~/.ssh/id_ed25519".to_string(),
            project_path: "/home/hacker".to_string(),
            mount_point: "~/dojo".to_string(),
            term: "xterm-256color".to_string(),
            timestamps_in_nanoseconds: true,
        }
    }
}

impl BridgeConfig {
    /// Location of the config file: `$DOJO_CONFIG` if set, otherwise the
    /// default path under the home directory.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(p) => expand_home(Path::new(&p)),
            None => home_dir().join(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Private key path with `~` expanded.
    pub fn identity_path(&self) -> PathBuf {
        expand_home(Path::new(&self.identity_file))
    }

    /// Mount point with `~` expanded.
    pub fn mount_path(&self) -> PathBuf {
        expand_home(Path::new(&self.mount_point))
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Expand a leading `~` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "dojo.pwn.college");
        assert_eq!(config.port, 22);
        assert_eq!(config.username, "hacker");
        assert_eq!(config.project_path, "/home/hacker");
        assert!(config.timestamps_in_nanoseconds);
    }

    #[test]
    fn test_partial_file_overrides_only_named_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 2222, "username": "student"}}"#).unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "student");
        assert_eq!(config.host, "dojo.pwn.college");
        assert_eq!(config.term, "xterm-256color");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = 22").unwrap();

        let err = BridgeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home(Path::new("~/.ssh/id_ed25519"));
        assert!(expanded.ends_with(".ssh/id_ed25519"));
        assert!(!expanded.starts_with("~"));

        let absolute = expand_home(Path::new("/etc/hosts"));
        assert_eq!(absolute, PathBuf::from("/etc/hosts"));
    }
}
