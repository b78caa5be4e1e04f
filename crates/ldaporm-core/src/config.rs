//! Directory engine configuration types
//!
//! Server/role connection settings and engine-wide tuning knobs.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};

/// Which connection of a server to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::Write => "write",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Role::Read),
            "write" => Ok(Role::Write),
            other => Err(DirectoryError::config(format!(
                "unknown server role '{other}' (expected \"read\" or \"write\")"
            ))),
        }
    }
}

/// Server certificate verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerify {
    /// Accept any certificate.
    Never,
    /// Full chain and hostname verification.
    #[default]
    Always,
}

impl FromStr for TlsVerify {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(TlsVerify::Never),
            "always" => Ok(TlsVerify::Always),
            other => Err(DirectoryError::config(format!(
                "invalid tls_verify value '{other}' (expected \"never\" or \"always\")"
            ))),
        }
    }
}

/// Connection settings for one role of one server.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerRoleConfig {
    /// Server URL, `ldap://host:port` or `ldaps://host:port`.
    pub url: String,

    /// Bind DN.
    pub user: String,

    /// Bind password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Negotiate STARTTLS after connecting.
    #[serde(default)]
    pub use_starttls: bool,

    /// Certificate verification policy.
    #[serde(default)]
    pub tls_verify: TlsVerify,

    /// CA certificate bundle (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca_certfile: Option<String>,

    /// Client certificate (PEM) for mutual TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_certfile: Option<String>,

    /// Client private key (PEM, PKCS#8) for mutual TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_keyfile: Option<String>,

    /// Connect and operation timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Default size limit applied to searches that do not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizelimit: Option<u32>,

    /// Whether referrals should be chased.
    #[serde(default)]
    pub follow_referrals: bool,
}

fn default_timeout_secs() -> u64 {
    15
}

impl fmt::Debug for ServerRoleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRoleConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("use_starttls", &self.use_starttls)
            .field("tls_verify", &self.tls_verify)
            .field("tls_ca_certfile", &self.tls_ca_certfile)
            .field("tls_certfile", &self.tls_certfile)
            .field("tls_keyfile", &self.tls_keyfile)
            .field("timeout_secs", &self.timeout_secs)
            .field("sizelimit", &self.sizelimit)
            .field("follow_referrals", &self.follow_referrals)
            .finish()
    }
}

impl ServerRoleConfig {
    /// Create a role config with required fields.
    pub fn new(url: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: None,
            use_starttls: false,
            tls_verify: TlsVerify::default(),
            tls_ca_certfile: None,
            tls_certfile: None,
            tls_keyfile: None,
            timeout_secs: default_timeout_secs(),
            sizelimit: None,
            follow_referrals: false,
        }
    }

    /// Set bind password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Enable STARTTLS.
    #[must_use]
    pub fn with_starttls(mut self) -> Self {
        self.use_starttls = true;
        self
    }

    /// Set the certificate verification policy.
    #[must_use]
    pub fn with_tls_verify(mut self, verify: TlsVerify) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Configure CA and client certificate files.
    pub fn with_tls_files(
        mut self,
        ca: Option<String>,
        cert: Option<String>,
        key: Option<String>,
    ) -> Self {
        self.tls_ca_certfile = ca;
        self.tls_certfile = cert;
        self.tls_keyfile = key;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the default size limit.
    #[must_use]
    pub fn with_sizelimit(mut self, limit: u32) -> Self {
        self.sizelimit = Some(limit);
        self
    }

    /// Get the timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the URL scheme is `ldaps`.
    pub fn is_ldaps(&self) -> bool {
        self.url.to_ascii_lowercase().starts_with("ldaps://")
    }

    /// Whether any TLS is negotiated on this connection.
    pub fn uses_tls(&self) -> bool {
        self.is_ldaps() || self.use_starttls
    }

    /// Validate the configuration without touching the network.
    pub fn validate(&self) -> DirectoryResult<()> {
        let lower = self.url.to_ascii_lowercase();
        if self.url.is_empty() {
            return Err(DirectoryError::config("url is required"));
        }
        if !(lower.starts_with("ldap://") || lower.starts_with("ldaps://")) {
            return Err(DirectoryError::config(format!(
                "url '{}' must use the ldap:// or ldaps:// scheme",
                self.url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(DirectoryError::config("timeout_secs must be positive"));
        }

        match (&self.tls_certfile, &self.tls_keyfile) {
            (Some(_), None) => {
                return Err(DirectoryError::config(
                    "tls_certfile is set but tls_keyfile is missing",
                ))
            }
            (None, Some(_)) => {
                return Err(DirectoryError::config(
                    "tls_keyfile is set but tls_certfile is missing",
                ))
            }
            _ => {}
        }

        for (name, path) in [
            ("tls_ca_certfile", &self.tls_ca_certfile),
            ("tls_certfile", &self.tls_certfile),
            ("tls_keyfile", &self.tls_keyfile),
        ] {
            if let Some(path) = path {
                if !Path::new(path).is_file() {
                    return Err(DirectoryError::config(format!(
                        "{name} '{path}' does not exist"
                    )));
                }
            }
        }

        if self.uses_tls() && self.tls_verify == TlsVerify::Never {
            tracing::warn!(
                target: "security",
                url = %self.url,
                "TLS certificate verification is disabled for this server"
            );
        }

        Ok(())
    }
}

/// Settings for one named server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default base DN for models on this server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basedn: Option<String>,

    /// Connection used for searches.
    pub read: ServerRoleConfig,

    /// Connection used for mutations.
    pub write: ServerRoleConfig,
}

impl ServerConfig {
    /// Config for the given role.
    pub fn role(&self, role: Role) -> &ServerRoleConfig {
        match role {
            Role::Read => &self.read,
            Role::Write => &self.write,
        }
    }
}

/// All configured servers, keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LdapServers {
    servers: HashMap<String, ServerConfig>,
}

impl LdapServers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `{name: {basedn, read: {...}, write: {...}}}` document.
    pub fn from_json(json: &str) -> DirectoryResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| DirectoryError::config(format!("invalid server configuration: {e}")))
    }

    /// Register a server.
    pub fn with_server(mut self, name: impl Into<String>, server: ServerConfig) -> Self {
        self.servers.insert(name.into(), server);
        self
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> DirectoryResult<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| DirectoryError::config(format!("no LDAP server named '{name}'")))
    }

    /// Look up and validate one role of a server.
    pub fn role(&self, name: &str, role: Role) -> DirectoryResult<&ServerRoleConfig> {
        let config = self.server(name)?.role(role);
        config.validate()?;
        Ok(config)
    }
}

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Page size used when the server does not advertise one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Lower clamp for detected page sizes.
    #[serde(default = "default_min_page_size")]
    pub min_page_size: u32,

    /// Upper clamp for detected page sizes.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Lifetime of a capability record in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Lifetime of a VLV context id in seconds.
    #[serde(default = "default_vlv_context_ttl")]
    pub vlv_context_ttl_secs: u64,

    /// Entries requested before the VLV target.
    #[serde(default)]
    pub vlv_default_before_count: u32,

    /// Entries requested after the VLV target.
    #[serde(default)]
    pub vlv_default_after_count: u32,
}

fn default_page_size() -> u32 {
    1000
}

fn default_min_page_size() -> u32 {
    10
}

fn default_max_page_size() -> u32 {
    10000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_vlv_context_ttl() -> u64 {
    60
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            min_page_size: default_min_page_size(),
            max_page_size: default_max_page_size(),
            cache_ttl_secs: default_cache_ttl(),
            vlv_context_ttl_secs: default_vlv_context_ttl(),
            vlv_default_before_count: 0,
            vlv_default_after_count: 0,
        }
    }
}

impl EngineSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size bounds.
    #[must_use]
    pub fn with_page_sizes(mut self, min: u32, default: u32, max: u32) -> Self {
        self.min_page_size = min;
        self.default_page_size = default;
        self.max_page_size = max;
        self
    }

    /// Set the capability cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    /// Set the VLV context TTL.
    #[must_use]
    pub fn with_vlv_context_ttl(mut self, secs: u64) -> Self {
        self.vlv_context_ttl_secs = secs;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn vlv_context_ttl(&self) -> Duration {
        Duration::from_secs(self.vlv_context_ttl_secs)
    }

    /// Clamp a page size into `[min_page_size, max_page_size]`.
    pub fn clamp_page_size(&self, size: u32) -> u32 {
        size.clamp(self.min_page_size, self.max_page_size)
    }

    /// Check that the bounds and TTLs are consistent.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.min_page_size > self.max_page_size {
            return Err(DirectoryError::config(format!(
                "min_page_size ({}) cannot be greater than max_page_size ({})",
                self.min_page_size, self.max_page_size
            )));
        }
        if self.default_page_size < self.min_page_size
            || self.default_page_size > self.max_page_size
        {
            return Err(DirectoryError::config(format!(
                "default_page_size ({}) must be between min_page_size ({}) and max_page_size ({})",
                self.default_page_size, self.min_page_size, self.max_page_size
            )));
        }
        if self.cache_ttl_secs == 0 {
            return Err(DirectoryError::config("cache_ttl_secs must be positive"));
        }
        if self.vlv_context_ttl_secs == 0 {
            return Err(DirectoryError::config(
                "vlv_context_ttl_secs must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_config() -> ServerRoleConfig {
        ServerRoleConfig::new("ldap://ldap.example.com:389", "cn=admin,dc=example,dc=com")
            .with_password("secret")
    }

    #[test]
    fn test_role_config_defaults() {
        let config = role_config();
        assert_eq!(config.timeout_secs, 15);
        assert_eq!(config.tls_verify, TlsVerify::Always);
        assert!(!config.use_starttls);
        assert!(!config.follow_referrals);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_config_debug_redacts_password() {
        let debug = format!("{:?}", role_config());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("***REDACTED***"));
    }

    #[test]
    fn test_role_config_rejects_bad_scheme() {
        let config = ServerRoleConfig::new("http://ldap.example.com", "cn=admin");
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_role_config_rejects_missing_cert_files() {
        let config = role_config().with_tls_files(
            Some("/nonexistent/ca.pem".to_string()),
            None,
            None,
        );
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("tls_ca_certfile"));
    }

    #[test]
    fn test_role_config_rejects_cert_without_key() {
        let config = role_config().with_tls_files(None, Some("/tmp/cert.pem".to_string()), None);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tls_keyfile is missing"));
    }

    #[test]
    fn test_tls_verify_parse() {
        assert_eq!("never".parse::<TlsVerify>().unwrap(), TlsVerify::Never);
        assert_eq!("always".parse::<TlsVerify>().unwrap(), TlsVerify::Always);
        assert!("sometimes".parse::<TlsVerify>().unwrap_err().is_configuration());
    }

    #[test]
    fn test_servers_from_json() {
        let json = r#"{
            "default": {
                "basedn": "dc=example,dc=com",
                "read": {"url": "ldap://ro.example.com", "user": "cn=ro", "password": "x"},
                "write": {"url": "ldap://rw.example.com", "user": "cn=rw", "password": "y",
                          "use_starttls": true, "tls_verify": "never", "sizelimit": 500}
            }
        }"#;
        let servers = LdapServers::from_json(json).unwrap();
        let write = servers.role("default", Role::Write).unwrap();
        assert!(write.use_starttls);
        assert_eq!(write.tls_verify, TlsVerify::Never);
        assert_eq!(write.sizelimit, Some(500));
        assert_eq!(
            servers.server("default").unwrap().basedn.as_deref(),
            Some("dc=example,dc=com")
        );
        assert!(servers.server("missing").unwrap_err().is_configuration());
    }

    #[test]
    fn test_servers_from_json_invalid_tls_verify() {
        let json = r#"{
            "default": {
                "read": {"url": "ldap://x", "user": "cn=ro", "tls_verify": "maybe"},
                "write": {"url": "ldap://x", "user": "cn=rw"}
            }
        }"#;
        let err = LdapServers::from_json(json).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_servers_from_json_missing_required_key() {
        let json = r#"{"default": {"read": {"user": "cn=ro"}, "write": {"url": "ldap://x", "user": "cn=rw"}}}"#;
        assert!(LdapServers::from_json(json).unwrap_err().is_configuration());
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.default_page_size, 1000);
        assert_eq!(settings.min_page_size, 10);
        assert_eq!(settings.max_page_size, 10000);
        assert_eq!(settings.cache_ttl_secs, 3600);
        assert_eq!(settings.vlv_context_ttl_secs, 60);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_engine_settings_inconsistent_bounds() {
        let settings = EngineSettings::new().with_page_sizes(100, 50, 1000);
        assert!(settings.validate().unwrap_err().is_configuration());

        let settings = EngineSettings::new().with_page_sizes(2000, 2000, 1000);
        assert!(settings.validate().is_err());

        let settings = EngineSettings::new().with_cache_ttl(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_engine_settings_clamp() {
        let settings = EngineSettings::default();
        assert_eq!(settings.clamp_page_size(5), 10);
        assert_eq!(settings.clamp_page_size(500), 500);
        assert_eq!(settings.clamp_page_size(50_000), 10000);
    }
}
