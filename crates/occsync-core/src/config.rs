//! Configuration parsing and management.
//!
//! The daemon is configured from a TOML file (`occsync.toml` by default).
//! Secrets are never stored in the file; instead the file names the
//! environment variables that carry them, and [`CouchDbSection::resolve`] /
//! [`ServerSection::resolve_auth_secret`] read them exactly once at startup.
//! A missing secret is a configuration error and fatal before the server
//! starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Minimum reconciler poll interval to prevent excessive resource usage.
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Maximum reconciler poll interval to keep convergence timely.
pub const MAX_POLL_INTERVAL_SECS: u64 = 3600;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OccsyncConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Relational store settings.
    #[serde(default)]
    pub database: DatabaseSection,

    /// Document-store (CouchDB) settings.
    #[serde(default)]
    pub couchdb: CouchDbSection,

    /// Background reconciliation settings.
    #[serde(default)]
    pub reconciler: ReconcilerSection,
}

impl OccsyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the reconciler poll
    /// interval is outside `1..=3600` seconds.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let secs = self.reconciler.poll_interval_secs;
        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&secs) {
            return Err(ConfigError::Validation(format!(
                "reconciler.poll_interval_secs out of range: {secs} \
                 (allowed {MIN_POLL_INTERVAL_SECS}..={MAX_POLL_INTERVAL_SECS})"
            )));
        }
        if self.couchdb.url.is_empty() {
            return Err(ConfigError::Validation(
                "couchdb.url cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address the HTTP server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Environment variable holding the bearer-token signing secret.
    #[serde(default = "default_auth_secret_env")]
    pub auth_secret_env: String,
}

impl ServerSection {
    /// Resolve the bearer-token secret from the configured env var.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] if the variable is unset or
    /// empty.
    pub fn resolve_auth_secret(&self) -> Result<String, ConfigError> {
        read_secret_env(&self.auth_secret_env)
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_secret_env: default_auth_secret_env(),
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Document-store (CouchDB) settings.
///
/// The admin password and the proxy-auth shared secret are referenced by
/// environment-variable name, not stored inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDbSection {
    /// Base URL of the CouchDB instance.
    #[serde(default = "default_couch_url")]
    pub url: String,

    /// Administrator username.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,

    /// Environment variable holding the administrator password.
    #[serde(default = "default_admin_pass_env")]
    pub admin_pass_env: String,

    /// Environment variable holding the proxy-authentication shared secret
    /// (must match CouchDB's `chttpd_auth/secret`).
    #[serde(default = "default_proxy_secret_env")]
    pub proxy_secret_env: String,

    /// Prefix for per-workstation database names. Part of the durable
    /// naming contract `<prefix>_ws_<workstation_id>`; changing it strands
    /// existing tenants.
    #[serde(default = "default_db_prefix")]
    pub db_prefix: String,

    /// Request timeout for document-store calls, in seconds.
    #[serde(default = "default_couch_timeout_secs")]
    pub timeout_secs: u64,
}

impl CouchDbSection {
    /// Resolve the admin password and proxy secret from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] if either variable is unset
    /// or empty.
    pub fn resolve(&self) -> Result<CouchSecrets, ConfigError> {
        Ok(CouchSecrets {
            admin_pass: read_secret_env(&self.admin_pass_env)?,
            proxy_secret: read_secret_env(&self.proxy_secret_env)?,
        })
    }
}

impl Default for CouchDbSection {
    fn default() -> Self {
        Self {
            url: default_couch_url(),
            admin_user: default_admin_user(),
            admin_pass_env: default_admin_pass_env(),
            proxy_secret_env: default_proxy_secret_env(),
            db_prefix: default_db_prefix(),
            timeout_secs: default_couch_timeout_secs(),
        }
    }
}

/// Secrets resolved from the environment at startup.
pub struct CouchSecrets {
    /// CouchDB administrator password.
    pub admin_pass: String,
    /// Shared secret for proxy-auth token signing.
    pub proxy_secret: String,
}

/// Background reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    /// Whether the background reconciler runs at all.
    #[serde(default = "default_reconciler_enabled")]
    pub enabled: bool,

    /// Poll interval in seconds between sweep cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            enabled: default_reconciler_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_auth_secret_env() -> String {
    "OCCSYNC_AUTH_SECRET".to_string()
}

fn default_db_path() -> String {
    "occsync.db".to_string()
}

fn default_couch_url() -> String {
    "http://localhost:5984".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_admin_pass_env() -> String {
    "OCCSYNC_COUCH_ADMIN_PASS".to_string()
}

fn default_proxy_secret_env() -> String {
    "OCCSYNC_COUCH_PROXY_SECRET".to_string()
}

fn default_db_prefix() -> String {
    "db".to_string()
}

const fn default_couch_timeout_secs() -> u64 {
    10
}

const fn default_reconciler_enabled() -> bool {
    true
}

const fn default_poll_interval_secs() -> u64 {
    60
}

fn read_secret_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingSecret(name.to_string())),
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// A secret environment variable is unset or empty.
    #[error("required secret environment variable {0} is unset or empty")]
    MissingSecret(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = OccsyncConfig::from_toml("").unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.couchdb.url, "http://localhost:5984");
        assert_eq!(config.couchdb.db_prefix, "db");
        assert_eq!(config.reconciler.poll_interval_secs, 60);
        assert!(config.reconciler.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            auth_secret_env = "MY_AUTH_SECRET"

            [database]
            path = "/var/lib/occsync/occsync.db"

            [couchdb]
            url = "http://couch.internal:5984"
            admin_user = "root"
            admin_pass_env = "COUCH_PASS"
            proxy_secret_env = "COUCH_PROXY_SECRET"
            db_prefix = "field"
            timeout_secs = 5

            [reconciler]
            enabled = false
            poll_interval_secs = 30
        "#;

        let config = OccsyncConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.database.path, "/var/lib/occsync/occsync.db");
        assert_eq!(config.couchdb.admin_user, "root");
        assert_eq!(config.couchdb.db_prefix, "field");
        assert_eq!(config.couchdb.timeout_secs, 5);
        assert!(!config.reconciler.enabled);
        assert_eq!(config.reconciler.poll_interval_secs, 30);
    }

    #[test]
    fn test_poll_interval_out_of_range_rejected() {
        let toml = r"
            [reconciler]
            poll_interval_secs = 0
        ";
        let result = OccsyncConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let toml = r"
            [reconciler]
            poll_interval_secs = 4000
        ";
        let result = OccsyncConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_empty_couch_url_rejected() {
        let toml = r#"
            [couchdb]
            url = ""
        "#;
        let result = OccsyncConfig::from_toml(toml);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_missing_secret_env_is_error() {
        let section = CouchDbSection {
            admin_pass_env: "OCCSYNC_TEST_UNSET_ADMIN_PASS".to_string(),
            proxy_secret_env: "OCCSYNC_TEST_UNSET_PROXY_SECRET".to_string(),
            ..CouchDbSection::default()
        };
        let result = section.resolve();
        assert!(matches!(result, Err(ConfigError::MissingSecret(name)) if name.contains("ADMIN_PASS")));
    }
}
