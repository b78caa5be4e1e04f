//! LDAP session implementation
//!
//! Implements the session traits on top of ldap3's blocking `LdapConn`.

use std::collections::HashSet;
use std::time::Duration;

use ldap3::{LdapConn, LdapConnSettings, LdapError, LdapResult, Mod, Scope, SearchEntry, SearchOptions};
use native_tls::{Certificate, Identity, TlsConnector};
use tracing::{debug, info, instrument, warn};

use ldaporm_core::config::{ServerRoleConfig, TlsVerify};
use ldaporm_core::error::{DirectoryError, DirectoryResult, ResultCode};
use ldaporm_core::operation::{
    Attributes, Entry, Modification, SearchRequest, SearchResponse, SearchScope,
};
use ldaporm_core::traits::{Connector, DirectorySession};

use crate::controls::{from_response_controls, to_raw_control};

/// Opens sessions against real LDAP servers.
#[derive(Debug, Clone, Default)]
pub struct LdapConnector;

impl LdapConnector {
    pub fn new() -> Self {
        Self
    }

    /// Build the TLS connector for a role, reading certificate files.
    fn tls_connector(config: &ServerRoleConfig) -> DirectoryResult<TlsConnector> {
        let mut builder = TlsConnector::builder();

        if config.tls_verify == TlsVerify::Never {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }

        if let Some(path) = &config.tls_ca_certfile {
            let pem = read_file("tls_ca_certfile", path)?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                DirectoryError::config(format!("tls_ca_certfile '{path}' is not a PEM certificate: {e}"))
            })?;
            builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&config.tls_certfile, &config.tls_keyfile) {
            let cert = read_file("tls_certfile", cert_path)?;
            let key = read_file("tls_keyfile", key_path)?;
            let identity = Identity::from_pkcs8(&cert, &key).map_err(|e| {
                DirectoryError::config(format!(
                    "cannot load client certificate '{cert_path}' with key '{key_path}': {e}"
                ))
            })?;
            builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| DirectoryError::config(format!("invalid TLS configuration: {e}")))
    }

    /// Translate a role config into ldap3 connection settings.
    fn settings(config: &ServerRoleConfig) -> DirectoryResult<LdapConnSettings> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(config.timeout())
            .set_starttls(config.use_starttls);

        if config.uses_tls() {
            settings = settings
                .set_connector(Self::tls_connector(config)?)
                .set_no_tls_verify(config.tls_verify == TlsVerify::Never);
        }

        Ok(settings)
    }

    fn connect(
        config: &ServerRoleConfig,
        bind_dn: &str,
        password: &str,
    ) -> DirectoryResult<LdapSession> {
        config.validate()?;
        let settings = Self::settings(config)?;

        debug!(url = %config.url, "Connecting to LDAP server");

        let mut ldap = LdapConn::with_settings(settings, &config.url).map_err(|e| {
            DirectoryError::connection_failed_with_source(
                format!("Failed to connect to LDAP server at {}", config.url),
                e,
            )
        })?;

        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .with_timeout(config.timeout())
            .simple_bind(bind_dn, password)
            .map_err(|e| {
                DirectoryError::connection_failed_with_source(
                    format!("LDAP bind failed for {bind_dn}"),
                    e,
                )
            })?;

        if result.rc != 0 {
            if result.rc == ResultCode::INVALID_CREDENTIALS.0 {
                return Err(DirectoryError::AuthenticationFailed {
                    bind_dn: bind_dn.to_string(),
                });
            }
            return Err(DirectoryError::connection_failed(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        info!(url = %config.url, "LDAP connection established successfully");

        Ok(LdapSession {
            ldap,
            url: config.url.clone(),
            timeout: config.timeout(),
            default_sizelimit: config.sizelimit,
            follow_referrals: config.follow_referrals,
        })
    }
}

fn read_file(name: &str, path: &str) -> DirectoryResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| DirectoryError::config(format!("cannot read {name} '{path}': {e}")))
}

impl Connector for LdapConnector {
    fn open(&self, config: &ServerRoleConfig) -> DirectoryResult<Box<dyn DirectorySession>> {
        let password = config.password.as_deref().unwrap_or("");
        Ok(Box::new(Self::connect(config, &config.user, password)?))
    }

    fn open_as(
        &self,
        config: &ServerRoleConfig,
        bind_dn: &str,
        password: &str,
    ) -> DirectoryResult<Box<dyn DirectorySession>> {
        Ok(Box::new(Self::connect(config, bind_dn, password)?))
    }
}

/// A bound ldap3 connection.
pub struct LdapSession {
    ldap: LdapConn,
    url: String,
    timeout: Duration,
    default_sizelimit: Option<u32>,
    follow_referrals: bool,
}

impl LdapSession {
    fn scope(scope: SearchScope) -> Scope {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }

    /// Map an ldap3 failure: server results stay protocol errors, anything
    /// else means the connection is unusable.
    fn map_error(context: &str, err: LdapError) -> DirectoryError {
        match err {
            LdapError::LdapResult { result } => Self::result_error(context, &result),
            other => DirectoryError::connection_failed_with_source(context.to_string(), other),
        }
    }

    fn result_error(context: &str, result: &LdapResult) -> DirectoryError {
        DirectoryError::protocol(
            ResultCode(result.rc),
            format!("{context}: {}", result.text),
        )
    }

    fn check_mutation(dn: &str, context: &str, result: LdapResult) -> DirectoryResult<()> {
        match ResultCode(result.rc) {
            ResultCode::SUCCESS => Ok(()),
            ResultCode::NO_SUCH_OBJECT => Err(DirectoryError::ObjectNotFound {
                dn: dn.to_string(),
            }),
            ResultCode::ALREADY_EXISTS => Err(DirectoryError::ObjectAlreadyExists {
                dn: dn.to_string(),
            }),
            _ => Err(Self::result_error(context, &result)),
        }
    }

    fn to_entry(entry: SearchEntry) -> Entry {
        let mut attrs = Attributes::new();
        for (name, values) in entry.attrs {
            attrs.insert(name, values.into_iter().map(String::into_bytes).collect());
        }
        for (name, values) in entry.bin_attrs {
            attrs.entry(name).or_default().extend(values);
        }
        Entry {
            dn: entry.dn,
            attrs,
        }
    }

    fn value_set(values: &[Vec<u8>]) -> HashSet<Vec<u8>> {
        values.iter().cloned().collect()
    }
}

impl DirectorySession for LdapSession {
    #[instrument(skip(self, request), fields(filter = %request.filter, base = %request.base))]
    fn search(&mut self, request: &SearchRequest) -> DirectoryResult<SearchResponse> {
        let controls = request
            .controls
            .iter()
            .map(to_raw_control)
            .collect::<DirectoryResult<Vec<_>>>()?;

        let size_limit = if request.size_limit > 0 {
            request.size_limit
        } else {
            self.default_sizelimit.unwrap_or(0)
        };
        let size_limit_i32 = i32::try_from(size_limit).unwrap_or(i32::MAX);

        let attrs: Vec<&str> = if request.attributes.is_empty() {
            vec!["*"]
        } else {
            request.attributes.iter().map(String::as_str).collect()
        };

        let result = self
            .ldap
            .with_search_options(SearchOptions::new().sizelimit(size_limit_i32))
            .with_controls(controls)
            .with_timeout(self.timeout)
            .search(&request.base, Self::scope(request.scope), &request.filter, attrs)
            .map_err(|e| Self::map_error("LDAP search failed", e))?;

        let ldap3::SearchResult(raw_entries, result) = result;
        let rc = ResultCode(result.rc);
        if rc != ResultCode::SUCCESS && !(rc == ResultCode::SIZE_LIMIT_EXCEEDED && size_limit > 0)
        {
            return Err(Self::result_error("LDAP search failed", &result));
        }

        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut referrals = 0usize;
        for raw in raw_entries {
            if raw.is_ref() {
                referrals += 1;
                continue;
            }
            entries.push(Self::to_entry(SearchEntry::construct(raw)));
        }
        if referrals > 0 {
            debug!(
                referrals,
                follow_referrals = self.follow_referrals,
                "Dropping search result references"
            );
        }

        let controls = from_response_controls(&result.ctrls)?;

        debug!(returned = entries.len(), "LDAP search completed");

        Ok(SearchResponse { entries, controls })
    }

    #[instrument(skip(self, attrs))]
    fn add(&mut self, dn: &str, attrs: &[(String, Vec<Vec<u8>>)]) -> DirectoryResult<()> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attrs
            .iter()
            .map(|(name, values)| (name.as_bytes().to_vec(), Self::value_set(values)))
            .collect();

        let result = self
            .ldap
            .with_timeout(self.timeout)
            .add(dn, attrs)
            .map_err(|e| Self::map_error("LDAP add failed", e))?;
        Self::check_mutation(dn, "LDAP add failed", result)
    }

    #[instrument(skip(self, mods))]
    fn modify(&mut self, dn: &str, mods: &[Modification]) -> DirectoryResult<()> {
        let mods: Vec<Mod<Vec<u8>>> = mods
            .iter()
            .map(|m| match m {
                Modification::Add(name, values) => {
                    Mod::Add(name.as_bytes().to_vec(), Self::value_set(values))
                }
                Modification::Delete(name) => Mod::Delete(name.as_bytes().to_vec(), HashSet::new()),
                Modification::Replace(name, values) => {
                    Mod::Replace(name.as_bytes().to_vec(), Self::value_set(values))
                }
            })
            .collect();

        let result = self
            .ldap
            .with_timeout(self.timeout)
            .modify(dn, mods)
            .map_err(|e| Self::map_error("LDAP modify failed", e))?;
        Self::check_mutation(dn, "LDAP modify failed", result)
    }

    #[instrument(skip(self))]
    fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .delete(dn)
            .map_err(|e| Self::map_error("LDAP delete failed", e))?;
        Self::check_mutation(dn, "LDAP delete failed", result)
    }

    #[instrument(skip(self))]
    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
    ) -> DirectoryResult<()> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .modifydn(dn, new_rdn, true, new_superior)
            .map_err(|e| Self::map_error("LDAP rename failed", e))?;
        Self::check_mutation(dn, "LDAP rename failed", result)
    }

    fn unbind(&mut self) -> DirectoryResult<()> {
        self.ldap.unbind().map_err(|e| {
            warn!(error = %e, url = %self.url, "Error during LDAP unbind");
            DirectoryError::connection_failed_with_source("LDAP unbind failed", e)
        })
    }
}

impl std::fmt::Debug for LdapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSession")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .field("default_sizelimit", &self.default_sizelimit)
            .finish()
    }
}
