//! Server capability detection and caching
//!
//! Reads the root DSE of a server once, classifies the vendor, records the
//! supported controls and the page size ceiling, and keeps the result for
//! `cache_ttl_secs`. The cache is an ordinary value so every manager (and
//! every test) can own an isolated instance.

use std::collections::hash_map::Entry as CacheEntry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ldaporm_core::config::EngineSettings;
use ldaporm_core::error::DirectoryResult;
use ldaporm_core::operation::{
    Attributes, SearchRequest, SearchScope, PAGED_RESULTS_OID, SORT_REQUEST_OID, VLV_REQUEST_OID,
};
use ldaporm_core::traits::DirectorySession;

/// Root DSE attributes requested by the probe.
const ROOT_DSE_ATTRIBUTES: &[&str] = &[
    "vendorName",
    "vendorVersion",
    "forestFunctionality",
    "sizelimit",
    "hardlimit",
    "MaxPageSize",
    "nsslapd-sizelimit",
    "supportedControl",
];

/// Vendor name fragments identifying the 389 Directory Server family.
const DS389_VENDOR_ALIASES: &[&str] = &["Fedora Project", "Red Hat", "Oracle", "ForgeRock", "389"];

const OPENLDAP_VENDOR: &str = "OpenLDAP Foundation";

/// Human-readable capability names used in log output.
pub const FEATURE_SORTING: &str = "server-side sorting";
pub const FEATURE_PAGING: &str = "paged results";
pub const FEATURE_VLV: &str = "virtual list view";

const SSSVLV_REMEDIATION: &str = "add 'overlay sssvlv' to slapd.conf, or add this entry to \
    cn=config: dn: olcOverlay=sssvlv,olcDatabase={1}mdb,cn=config \
    objectClass: olcOverlayConfig objectClass: olcSssVlvConfig olcOverlay: sssvlv";

/// Directory server implementation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerFlavor {
    #[serde(rename = "active_directory")]
    ActiveDirectory,
    #[serde(rename = "389")]
    Ds389,
    #[serde(rename = "openldap")]
    OpenLdap,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl ServerFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerFlavor::ActiveDirectory => "active_directory",
            ServerFlavor::Ds389 => "389",
            ServerFlavor::OpenLdap => "openldap",
            ServerFlavor::Unknown => "unknown",
        }
    }

    /// Root DSE attribute carrying the server's page size ceiling.
    fn page_size_attribute(&self) -> Option<&'static str> {
        match self {
            ServerFlavor::ActiveDirectory => Some("MaxPageSize"),
            ServerFlavor::Ds389 => Some("nsslapd-sizelimit"),
            ServerFlavor::OpenLdap => Some("sizelimit"),
            ServerFlavor::Unknown => None,
        }
    }
}

impl fmt::Display for ServerFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one server role can do.
#[derive(Debug, Clone)]
pub struct CapabilityRecord {
    /// Raw root DSE attributes.
    pub root_dse: Attributes,
    pub flavor: ServerFlavor,
    /// First `vendorName` value, kept even when the flavor is unknown.
    pub vendor_name: Option<String>,
    /// Page size ceiling, clamped to the configured bounds.
    pub page_size: u32,
    pub supported_controls: BTreeSet<String>,
    pub sorting: bool,
    pub paging: bool,
    pub vlv: bool,
    logged: HashSet<String>,
    cached_at: Instant,
}

impl CapabilityRecord {
    /// Classify a root DSE.
    pub fn from_root_dse(root_dse: Attributes, settings: &EngineSettings) -> Self {
        let vendor_name = first_value(&root_dse, "vendorName");
        let flavor = detect_flavor(&root_dse);
        let page_size = determine_page_size(flavor, &root_dse, settings);

        let supported_controls: BTreeSet<String> = get_ci(&root_dse, "supportedControl")
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            flavor,
            vendor_name,
            page_size,
            sorting: supported_controls.contains(SORT_REQUEST_OID),
            paging: supported_controls.contains(PAGED_RESULTS_OID),
            vlv: supported_controls.contains(VLV_REQUEST_OID),
            supported_controls,
            root_dse,
            logged: HashSet::new(),
            cached_at: Instant::now(),
        }
    }

    /// Record used when the probe fails: nothing optional, default page size.
    pub fn unknown(settings: &EngineSettings) -> Self {
        Self {
            root_dse: Attributes::new(),
            flavor: ServerFlavor::Unknown,
            vendor_name: None,
            page_size: settings.default_page_size,
            supported_controls: BTreeSet::new(),
            sorting: false,
            paging: false,
            vlv: false,
            logged: HashSet::new(),
            cached_at: Instant::now(),
        }
    }

    pub fn supports_control(&self, oid: &str) -> bool {
        self.supported_controls.contains(oid)
    }

    fn is_valid(&self, settings: &EngineSettings) -> bool {
        self.cached_at.elapsed() < settings.cache_ttl()
    }
}

fn get_ci<'a>(attrs: &'a Attributes, name: &str) -> Option<&'a Vec<Vec<u8>>> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn first_value(attrs: &Attributes, name: &str) -> Option<String> {
    get_ci(attrs, name)
        .and_then(|values| values.first())
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

/// Classify a server by its root DSE.
///
/// `forestFunctionality` wins outright, then the 389 vendor aliases, then the
/// OpenLDAP vendor name.
pub fn detect_flavor(root_dse: &Attributes) -> ServerFlavor {
    if get_ci(root_dse, "forestFunctionality").is_some() {
        return ServerFlavor::ActiveDirectory;
    }
    let Some(vendor) = first_value(root_dse, "vendorName") else {
        return ServerFlavor::Unknown;
    };
    if DS389_VENDOR_ALIASES.iter().any(|alias| vendor.contains(alias)) {
        return ServerFlavor::Ds389;
    }
    if vendor.contains(OPENLDAP_VENDOR) {
        return ServerFlavor::OpenLdap;
    }
    ServerFlavor::Unknown
}

fn determine_page_size(flavor: ServerFlavor, root_dse: &Attributes, settings: &EngineSettings) -> u32 {
    let Some(attribute) = flavor.page_size_attribute() else {
        return settings.default_page_size;
    };
    match first_value(root_dse, attribute).and_then(|raw| raw.trim().parse::<i64>().ok()) {
        Some(size) => {
            let size = u32::try_from(size.max(0)).unwrap_or(u32::MAX);
            settings.clamp_page_size(size)
        }
        None => settings.default_page_size,
    }
}

/// Snapshot of the cache for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub cache_keys: Vec<String>,
}

/// Capability cache shared by every query against a set of servers.
#[derive(Debug)]
pub struct ServerCapabilities {
    settings: EngineSettings,
    cache: Mutex<HashMap<String, CapabilityRecord>>,
}

impl ServerCapabilities {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn probe(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<Option<CapabilityRecord>> {
        let request = SearchRequest::new("", SearchScope::Base, "(objectClass=*)")
            .with_attributes(ROOT_DSE_ATTRIBUTES.iter().copied());

        match session.search(&request) {
            Ok(response) => match response.entries.into_iter().next() {
                Some(entry) => {
                    let record = CapabilityRecord::from_root_dse(entry.attrs, &self.settings);
                    debug!(
                        key = %key,
                        flavor = %record.flavor,
                        page_size = record.page_size,
                        "Detected server capabilities"
                    );
                    Ok(Some(record))
                }
                None => {
                    warn!(key = %key, "Root DSE search returned no entry");
                    Ok(None)
                }
            },
            Err(e) if e.is_connectivity() => Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "LDAP error while querying Root DSE");
                Ok(None)
            }
        }
    }

    /// Run `f` against the record for `key`, probing the server when the
    /// cached one is missing or expired.
    ///
    /// Degraded records are handed to `f` but never cached.
    fn with_record<T>(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
        f: impl FnOnce(&mut CapabilityRecord) -> T,
    ) -> DirectoryResult<T> {
        let mut cache = self.cache.lock();

        if let Some(record) = cache.get_mut(key) {
            if record.is_valid(&self.settings) {
                return Ok(f(record));
            }
        }

        match self.probe(session, key)? {
            Some(record) => {
                let record = match cache.entry(key.to_string()) {
                    CacheEntry::Occupied(mut slot) => {
                        slot.insert(record);
                        slot.into_mut()
                    }
                    CacheEntry::Vacant(slot) => slot.insert(record),
                };
                Ok(f(record))
            }
            None => {
                cache.remove(key);
                Ok(f(&mut CapabilityRecord::unknown(&self.settings)))
            }
        }
    }

    /// Capabilities of the server behind `key`.
    ///
    /// Connectivity errors during the probe propagate; any other failure
    /// yields an unknown-flavor record with no optional capabilities.
    pub fn get_capabilities(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<CapabilityRecord> {
        self.with_record(session, key, |record| record.clone())
    }

    /// Whether the server advertises a control, logging the first confirmation.
    pub fn check_control_support(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
        oid: &str,
        feature: &str,
    ) -> DirectoryResult<bool> {
        self.with_record(session, key, |record| {
            let supported = record.supports_control(oid);
            if supported && record.logged.insert(feature.to_string()) {
                info!(
                    key = %key,
                    feature = %feature,
                    "LDAP server '{key}' supports {feature}. Will use server-side {feature}."
                );
            }
            supported
        })
    }

    fn check_with_openldap_hint(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
        oid: &str,
        feature: &str,
    ) -> DirectoryResult<bool> {
        self.with_record(session, key, |record| {
            let supported = record.supports_control(oid);
            if supported {
                if record.logged.insert(feature.to_string()) {
                    info!(
                        key = %key,
                        feature = %feature,
                        "LDAP server '{key}' supports {feature}. Will use server-side {feature}."
                    );
                }
            } else if record.flavor == ServerFlavor::OpenLdap
                && record.logged.insert(format!("missing:{feature}"))
            {
                warn!(
                    key = %key,
                    feature = %feature,
                    "OpenLDAP server '{key}' does not support {feature}. \
                     To enable it, {SSSVLV_REMEDIATION}"
                );
            }
            supported
        })
    }

    pub fn supports_sorting(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<bool> {
        self.check_with_openldap_hint(session, key, SORT_REQUEST_OID, FEATURE_SORTING)
    }

    pub fn supports_paging(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<bool> {
        self.check_control_support(session, key, PAGED_RESULTS_OID, FEATURE_PAGING)
    }

    pub fn supports_vlv(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<bool> {
        self.check_with_openldap_hint(session, key, VLV_REQUEST_OID, FEATURE_VLV)
    }

    /// Page size to request from the server behind `key`.
    pub fn page_size_limit(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<u32> {
        self.with_record(session, key, |record| record.page_size)
    }

    pub fn detect_flavor(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
    ) -> DirectoryResult<ServerFlavor> {
        self.with_record(session, key, |record| record.flavor)
    }

    /// Drop one cached record, or all of them.
    pub fn clear(&self, key: Option<&str>) {
        let mut cache = self.cache.lock();
        match key {
            Some(key) => {
                cache.remove(key);
            }
            None => cache.clear(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        let total_entries = cache.len();
        let valid_entries = cache
            .values()
            .filter(|r| r.is_valid(&self.settings))
            .count();
        let mut cache_keys: Vec<String> = cache.keys().cloned().collect();
        cache_keys.sort();
        CacheStats {
            total_entries,
            valid_entries,
            expired_entries: total_entries - valid_entries,
            cache_keys,
        }
    }
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}
