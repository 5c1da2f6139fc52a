//! TOML-based configuration for idsync.
//!
//! All secrets (client secret, bind password) are stored as `_env` fields
//! naming environment variables. The actual values are resolved at runtime
//! via [`AppConfig::resolve_env_vars`]. The resulting [`AppConfig`] is built
//! once and handed to the reconciler; nothing reads settings globally.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, SyncError};
use crate::mapping::{default_group_table, default_user_table, FieldMappingTable};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Reconciliation behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Cloud identity provider (IDCS) settings.
    pub source: SourceConfig,

    /// Local LDAP directory settings.
    pub directory: DirectoryConfig,

    /// Audit database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Attribute mapping tables.
    #[serde(default)]
    pub mapping: MappingConfig,
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Reconciliation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Master switch. When false, runs are refused.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Compute and report changes without applying them.
    #[serde(default)]
    pub dry_run: bool,

    /// Delete directory users that no longer exist in the identity provider.
    #[serde(default)]
    pub delete_missing_users: bool,

    /// Delete directory groups that no longer exist in the identity provider.
    #[serde(default)]
    pub delete_missing_groups: bool,

    /// Seconds between scheduled runs in the daemon (default one hour).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    3600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            delete_missing_users: false,
            delete_missing_groups: false,
            interval_secs: default_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity provider
// ---------------------------------------------------------------------------

/// IDCS tenant and OAuth client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Tenant base URL, e.g. `https://idcs-abc123.identity.oraclecloud.com`.
    pub tenant_url: String,

    /// OAuth client id.
    pub client_id: String,

    /// Environment variable holding the OAuth client secret.
    pub client_secret_env: String,

    /// OAuth scope requested with the client-credentials grant.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Token endpoint path relative to `tenant_url`.
    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// Page size for SCIM list requests.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved client secret (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub client_secret: Option<String>,
}

fn default_scope() -> String {
    "urn:opc:idm:__myscopes__".into()
}
fn default_token_path() -> String {
    "/oauth2/v1/token".into()
}
fn default_page_size() -> u32 {
    100
}
fn default_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// LDAP server and layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Server URL, `ldap://` or `ldaps://`.
    pub url: String,

    /// DN used for the simple bind.
    pub bind_dn: String,

    /// Environment variable holding the bind password.
    pub bind_password_env: String,

    /// Directory suffix, e.g. `dc=example,dc=com`.
    pub base_dn: String,

    /// Container for users. Defaults to `ou=users,<base_dn>`.
    #[serde(default)]
    pub user_dn: Option<String>,

    /// Container for groups. Defaults to `ou=groups,<base_dn>`.
    #[serde(default)]
    pub group_dn: Option<String>,

    /// RDN attribute for users.
    #[serde(default = "default_user_id_attr")]
    pub user_id_attr: String,

    /// RDN attribute for groups.
    #[serde(default = "default_group_name_attr")]
    pub group_name_attr: String,

    /// Attribute listing group member DNs.
    #[serde(default = "default_group_member_attr")]
    pub group_member_attr: String,

    #[serde(default = "default_user_object_classes")]
    pub user_object_classes: Vec<String>,

    #[serde(default = "default_group_object_classes")]
    pub group_object_classes: Vec<String>,

    /// Member DN written when a group would otherwise have no members.
    /// Defaults to `cn=placeholder,<base_dn>`.
    #[serde(default)]
    pub placeholder_member_dn: Option<String>,

    /// Per-operation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Upgrade a plain `ldap://` connection with StartTLS.
    #[serde(default)]
    pub starttls: bool,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

fn default_user_id_attr() -> String {
    "uid".into()
}
fn default_group_name_attr() -> String {
    "cn".into()
}
fn default_group_member_attr() -> String {
    "member".into()
}
fn default_user_object_classes() -> Vec<String> {
    ["top", "person", "organizationalPerson", "inetOrgPerson"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_group_object_classes() -> Vec<String> {
    vec!["top".into(), "groupOfNames".into()]
}

impl DirectoryConfig {
    /// Effective user container DN.
    pub fn user_base(&self) -> String {
        self.user_dn
            .clone()
            .unwrap_or_else(|| format!("ou=users,{}", self.base_dn))
    }

    /// Effective group container DN.
    pub fn group_base(&self) -> String {
        self.group_dn
            .clone()
            .unwrap_or_else(|| format!("ou=groups,{}", self.base_dn))
    }

    /// Effective placeholder member DN for otherwise empty groups.
    pub fn placeholder_member(&self) -> String {
        self.placeholder_member_dn
            .clone()
            .unwrap_or_else(|| format!("cn=placeholder,{}", self.base_dn))
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Audit database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("idsync.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file. The daemon rolls it daily.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Field mapping tables applied on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default = "default_user_table")]
    pub user: FieldMappingTable,

    #[serde(default = "default_group_table")]
    pub group: FieldMappingTable,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            user: default_user_table(),
            group: default_group_table(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables; call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables are logged and left as `None`; the clients report
    /// the missing secret when they try to authenticate.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.source.client_secret =
            resolve_optional_env(&self.source.client_secret_env, "source.client_secret_env");
        self.directory.bind_password = resolve_optional_env(
            &self.directory.bind_password_env,
            "directory.bind_password_env",
        );

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Refuse to sync when `[sync] enabled = false`.
    pub fn ensure_enabled(&self) -> Result<(), SyncError> {
        if self.sync.enabled {
            Ok(())
        } else {
            Err(SyncError::Disabled)
        }
    }

    /// Fail on the first secret that [`resolve_env_vars`](Self::resolve_env_vars)
    /// could not resolve.
    pub fn require_secrets(&self) -> Result<(), ConfigError> {
        if self.source.client_secret.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.source.client_secret_env.clone(),
                field: "source.client_secret_env".into(),
            });
        }
        if self.directory.bind_password.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.directory.bind_password_env.clone(),
                field: "directory.bind_password_env".into(),
            });
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, detail: &str| ConfigError::InvalidValue {
            field: field.into(),
            detail: detail.into(),
        };

        if !self.source.tenant_url.starts_with("https://") {
            return Err(invalid("source.tenant_url", "tenant URL must use https://"));
        }
        if self.source.client_id.trim().is_empty() {
            return Err(invalid("source.client_id", "client id must not be empty"));
        }
        if self.source.page_size == 0 {
            return Err(invalid("source.page_size", "page size must be > 0"));
        }
        if self.source.timeout_secs == 0 {
            return Err(invalid("source.timeout_secs", "timeout must be > 0"));
        }

        let url = self.directory.url.as_str();
        if !(url.starts_with("ldap://") || url.starts_with("ldaps://")) {
            return Err(invalid(
                "directory.url",
                "directory URL must start with ldap:// or ldaps://",
            ));
        }
        if self.directory.base_dn.trim().is_empty() {
            return Err(invalid("directory.base_dn", "base DN must not be empty"));
        }
        if self.directory.bind_dn.trim().is_empty() {
            return Err(invalid("directory.bind_dn", "bind DN must not be empty"));
        }
        if self.directory.starttls && url.starts_with("ldaps://") {
            return Err(invalid(
                "directory.starttls",
                "StartTLS cannot be combined with an ldaps:// URL",
            ));
        }
        if self.directory.timeout_secs == 0 {
            return Err(invalid("directory.timeout_secs", "timeout must be > 0"));
        }
        if matches!(&self.directory.placeholder_member_dn, Some(dn) if dn.trim().is_empty()) {
            return Err(invalid(
                "directory.placeholder_member_dn",
                "placeholder member DN must not be empty",
            ));
        }

        if self.sync.interval_secs == 0 {
            return Err(invalid("sync.interval_secs", "interval must be > 0"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(
                "logging.level",
                "must be one of trace, debug, info, warn, error",
            ));
        }
        if self.mapping.user.is_empty() {
            warn!("user mapping table is empty; only basic attributes will be written");
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[sync]
enabled = true
dry_run = false
delete_missing_users = true
interval_secs = 900

[source]
tenant_url = "https://idcs-abc.identity.example.com"
client_id = "sync-client"
client_secret_env = "IDCS_CLIENT_SECRET"
page_size = 50

[directory]
url = "ldaps://ldap.example.com:636"
bind_dn = "cn=admin,dc=example,dc=com"
bind_password_env = "LDAP_BIND_PASSWORD"
base_dn = "dc=example,dc=com"
group_dn = "ou=teams,dc=example,dc=com"

[database]
path = "/var/lib/idsync/audit.db"

[logging]
level = "debug"
file = "/var/log/idsync/idsync.log"

[mapping]
user = "uid:userName,mail:emails[0].value,title:title"
group = [
  { target = "cn", source = "displayName" },
  { target = "businessCategory", source = "urn:ietf:params:scim:schemas:oracle:idcs:extension:group:Group.creationMechanism" },
]
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_toml_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.sync.interval_secs, 900);
        assert!(config.sync.delete_missing_users);
        assert!(!config.sync.delete_missing_groups);
        assert_eq!(config.source.page_size, 50);
        assert_eq!(config.directory.group_base(), "ou=teams,dc=example,dc=com");
        assert_eq!(config.directory.user_base(), "ou=users,dc=example,dc=com");
        assert_eq!(config.mapping.user.len(), 3);
        assert_eq!(config.mapping.group.entries()[1].target, "businessCategory");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idsync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/idsync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_bad_mapping_is_a_parse_error() {
        let toml_str = sample_toml().replace("title:title", "title:title[x]");
        assert!(matches!(
            AppConfig::from_toml_str(&toml_str),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_plain_http_tenant() {
        let mut config = AppConfig::from_toml_str(sample_toml()).unwrap();
        config.source.tenant_url = "http://idcs.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "source.tenant_url"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_directory_url() {
        let mut config = AppConfig::from_toml_str(sample_toml()).unwrap();
        config.directory.url = "ldap.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "directory.url"
        ));

        let mut config = AppConfig::from_toml_str(sample_toml()).unwrap();
        config.directory.starttls = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_bad_level() {
        let mut config = AppConfig::from_toml_str(sample_toml()).unwrap();
        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_toml_str(sample_toml()).unwrap();
        config.logging.level = "chatty".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_IDSYNC_SECRET", "s3cret");
        std::env::set_var("TEST_IDSYNC_BIND", "hunter2");

        let toml_str = sample_toml()
            .replace("IDCS_CLIENT_SECRET", "TEST_IDSYNC_SECRET")
            .replace("LDAP_BIND_PASSWORD", "TEST_IDSYNC_BIND");
        let mut config = AppConfig::from_toml_str(&toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.source.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.directory.bind_password.as_deref(), Some("hunter2"));
        config.require_secrets().unwrap();

        std::env::remove_var("TEST_IDSYNC_SECRET");
        std::env::remove_var("TEST_IDSYNC_BIND");
    }

    #[test]
    fn test_require_secrets_reports_missing_var() {
        let toml_str = sample_toml().replace("IDCS_CLIENT_SECRET", "TEST_IDSYNC_UNSET_SECRET");
        let mut config = AppConfig::from_toml_str(&toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert!(matches!(
            config.require_secrets(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "TEST_IDSYNC_UNSET_SECRET"
        ));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[source]
tenant_url = "https://idcs.example.com"
client_id = "c"
client_secret_env = "S"
[directory]
url = "ldap://localhost:389"
bind_dn = "cn=admin,dc=example,dc=com"
bind_password_env = "P"
base_dn = "dc=example,dc=com"
"#;
        let config = AppConfig::from_toml_str(minimal).unwrap();
        assert!(config.sync.enabled);
        assert!(!config.sync.dry_run);
        assert!(!config.sync.delete_missing_users);
        assert_eq!(config.sync.interval_secs, 3600);
        assert_eq!(config.source.token_path, "/oauth2/v1/token");
        assert_eq!(config.source.page_size, 100);
        assert_eq!(config.directory.user_id_attr, "uid");
        assert_eq!(config.directory.group_member_attr, "member");
        assert_eq!(
            config.directory.placeholder_member(),
            "cn=placeholder,dc=example,dc=com"
        );
        assert_eq!(config.database.path, PathBuf::from("idsync.db"));
        assert!(config.ensure_enabled().is_ok());
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.mapping.user.to_compact(),
            "uid:userName,mail:emails[0].value,givenName:name.givenName,sn:name.familyName"
        );
        config.validate().unwrap();
    }
}
