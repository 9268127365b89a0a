use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.coderd/config.toml`, with every
/// field overridable by an environment variable named as in the daemon's
/// external interface contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "human".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: PathBuf,
    #[serde(default = "default_coder_cli_bin")]
    pub coder_cli_bin: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub database_service_key: Option<String>,
    #[serde(default)]
    pub api_bearer_secret: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `featureTypeId` that marks a feature as purely cosmetic/UI work,
    /// per §9's constitution-prompt testable property.
    #[serde(default)]
    pub cosmetic_feature_type_id: Option<uuid::Uuid>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            repos_dir: default_repos_dir(),
            worktrees_dir: default_worktrees_dir(),
            coder_cli_bin: default_coder_cli_bin(),
            database_url: None,
            database_service_key: None,
            api_bearer_secret: None,
            host: default_host(),
            port: default_port(),
            cosmetic_feature_type_id: None,
        }
    }
}

fn default_max_concurrent_jobs() -> u32 {
    2
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_repos_dir() -> PathBuf {
    home_dir().join("repos")
}

fn default_worktrees_dir() -> PathBuf {
    home_dir().join("worktrees")
}

fn default_coder_cli_bin() -> String {
    "coder".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Default config file location, `~/.coderd/config.toml`.
    pub fn default_path() -> PathBuf {
        home_dir().join(".coderd").join("config.toml")
    }

    /// Load configuration from the default path, if present, then apply
    /// environment-variable overrides. Missing file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, applying environment-variable overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MAX_CONCURRENT_JOBS") {
            if let Ok(n) = v.parse() {
                self.daemon.max_concurrent_jobs = n;
            }
        }
        if let Ok(v) = std::env::var("REPOS_DIR") {
            self.daemon.repos_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WORKTREES_DIR") {
            self.daemon.worktrees_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CODER_CLI_BIN") {
            self.daemon.coder_cli_bin = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.daemon.database_url = Some(v);
        }
        if let Ok(v) = std::env::var("DATABASE_SERVICE_KEY") {
            self.daemon.database_service_key = Some(v);
        }
        if let Ok(v) = std::env::var("API_BEARER_SECRET") {
            self.daemon.api_bearer_secret = Some(v);
        }
        if let Ok(v) = std::env::var("CODERD_HOST") {
            self.daemon.host = v;
        }
        if let Ok(v) = std::env::var("CODERD_PORT") {
            if let Ok(p) = v.parse() {
                self.daemon.port = p;
            }
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            self.general.log_level = v;
        }
        if let Ok(v) = std::env::var("COSMETIC_FEATURE_TYPE_ID") {
            if let Ok(id) = v.parse() {
                self.daemon.cosmetic_feature_type_id = Some(id);
            }
        }
    }

    /// Serialize back to TOML, e.g. for `coderd config print`.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.daemon.max_concurrent_jobs, 2);
        assert_eq!(config.daemon.port, 8787);
        assert!(config.daemon.database_url.is_none());
    }

    #[test]
    fn load_from_missing_file_errors() {
        let err = Config::load_from("/nonexistent/path/config.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_from_parses_toml_and_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [daemon]
            max_concurrent_jobs = 5
            coder_cli_bin = "/usr/local/bin/coder"
            "#,
        )
        .unwrap();

        std::env::remove_var("MAX_CONCURRENT_JOBS");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.daemon.max_concurrent_jobs, 5);
        assert_eq!(config.daemon.coder_cli_bin, "/usr/local/bin/coder");
        assert_eq!(config.daemon.host, default_host());
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\nmax_concurrent_jobs = 5\n").unwrap();

        std::env::set_var("MAX_CONCURRENT_JOBS", "9");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.daemon.max_concurrent_jobs, 9);
        std::env::remove_var("MAX_CONCURRENT_JOBS");
    }

    #[test]
    fn to_toml_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.daemon.port, config.daemon.port);
    }
}
