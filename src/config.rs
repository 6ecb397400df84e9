//! Configuration loader and validator for the CRM server.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub auth: Auth,
    #[serde(default)]
    pub upload: Upload,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Defaults to `sqlite://<data_dir>/crm.db`; `DATABASE_URL` overrides both.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind_addr: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Token signing and first-run admin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub secret_key: String,
    #[serde(default = "default_access_minutes")]
    pub access_token_expire_minutes: u64,
    #[serde(default = "default_refresh_days")]
    pub refresh_token_expire_days: u64,
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

/// Admin account created when the user table is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upload {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_access_minutes() -> u64 {
    30
}

fn default_refresh_days() -> u64 {
    7
}

fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        self.app
            .database_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| format!("sqlite://{}/crm.db", self.app.data_dir.trim_end_matches('/')))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.server.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind_addr must be non-empty"));
    }
    let prefix = cfg.server.api_prefix.trim();
    if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
        return Err(ConfigError::Invalid(
            "server.api_prefix must start with '/' and not end with '/'",
        ));
    }

    if cfg.auth.secret_key.trim().len() < 32 {
        return Err(ConfigError::Invalid("auth.secret_key must be at least 32 characters"));
    }
    if cfg.auth.access_token_expire_minutes == 0 {
        return Err(ConfigError::Invalid("auth.access_token_expire_minutes must be > 0"));
    }
    if cfg.auth.refresh_token_expire_days == 0 {
        return Err(ConfigError::Invalid("auth.refresh_token_expire_days must be > 0"));
    }
    if let Some(admin) = &cfg.auth.bootstrap_admin {
        if admin.email.trim().is_empty() || !admin.email.contains('@') {
            return Err(ConfigError::Invalid("auth.bootstrap_admin.email must be an email address"));
        }
        if admin.password.len() < 8 {
            return Err(ConfigError::Invalid(
                "auth.bootstrap_admin.password must be at least 8 characters",
            ));
        }
    }

    if cfg.upload.max_file_bytes == 0 {
        return Err(ConfigError::Invalid("upload.max_file_bytes must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  bind_addr: "127.0.0.1:8000"
  api_prefix: "/api/v1"
  cors_origins:
    - "http://localhost:3000"

auth:
  secret_key: "CHANGE_ME_TO_A_LONG_RANDOM_SECRET_VALUE"
  access_token_expire_minutes: 30
  refresh_token_expire_days: 7
  bootstrap_admin:
    email: "admin@example.com"
    name: "Administrator"
    password: "change-me-now"

upload:
  max_file_bytes: 10485760
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.upload.max_file_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"app:
  data_dir: "./data"
server:
  bind_addr: "0.0.0.0:8000"
auth:
  secret_key: "0123456789abcdef0123456789abcdef"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.server.api_prefix, "/api/v1");
        assert_eq!(cfg.auth.access_token_expire_minutes, 30);
        assert_eq!(cfg.auth.refresh_token_expire_days, 7);
        assert_eq!(cfg.upload.max_file_bytes, 10485760);
        assert_eq!(cfg.database_url(), "sqlite://./data/crm.db");
    }

    #[test]
    fn invalid_secret_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.secret_key = "short".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("auth.secret_key")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_api_prefix() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.server.api_prefix = "api/v1".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        cfg.server.api_prefix = "/api/v1/".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.upload.max_file_bytes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.access_token_expire_minutes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_bootstrap_admin() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        if let Some(admin) = cfg.auth.bootstrap_admin.as_mut() {
            admin.password = "short".into();
        }
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("bootstrap_admin.password")), _ => panic!("wrong error") }
    }

    #[test]
    fn explicit_database_url_wins() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.database_url = Some("sqlite::memory:".into());
        assert_eq!(cfg.database_url(), "sqlite::memory:");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.server.cors_origins, vec!["http://localhost:3000".to_string()]);
    }
}
