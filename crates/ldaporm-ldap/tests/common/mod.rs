//! Common test utilities for the LDAP engine tests.
//!
//! These tests run against an in-memory directory that speaks the session
//! traits, evaluates filters and honours the sort, paged results and virtual
//! list view controls, so no LDAP server is required.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

use ldaporm_core::filter::split_dn;
use ldaporm_core::operation::{
    ResponseControl, PAGED_RESULTS_OID, SORT_REQUEST_OID, VLV_REQUEST_OID,
};
use ldaporm_ldap::prelude::*;

pub const BASE_DN: &str = "ou=users,dc=example,dc=com";
pub const ADMIN_DN: &str = "cn=admin,dc=example,dc=com";
pub const ADMIN_PASSWORD: &str = "secret";

/// Fixture users: `(uid, uidNumber, loginShell, cn)`.
pub const USERS: &[(&str, &str, &str, &str)] = &[
    ("alice", "1001", "/bin/bash", "Alice Anderson"),
    ("bob", "1002", "/bin/bash", "Bob Brown"),
    ("charlie", "1003", "/bin/zsh", "Charlie Clark"),
    ("diana", "1004", "/bin/bash", "Diana Davis"),
    ("edward", "1005", "/bin/tcsh", "Edward Evans"),
];

/// One recorded write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add(String),
    Modify(String, Vec<Modification>),
    Delete(String),
    Rename(String, String),
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    root_dse: Option<Attributes>,
    passwords: HashMap<String, String>,
    requests: Vec<SearchRequest>,
    mutations: Vec<Mutation>,
    rejected: HashMap<String, ResultCode>,
    reject_context_ids: bool,
    root_dse_error: Option<ResultCode>,
    unreachable: bool,
    contexts_issued: u32,
    opened: usize,
    unbound: usize,
}

/// In-memory directory shared by every session it opens.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryDirectory {
    /// An empty directory advertising `root_dse`, with the admin account set up.
    pub fn new(root_dse: Attributes) -> Self {
        let directory = Self::default();
        {
            let mut state = directory.state.lock();
            state.root_dse = Some(root_dse);
            state
                .passwords
                .insert(ADMIN_DN.to_ascii_lowercase(), ADMIN_PASSWORD.to_string());
        }
        directory
    }

    /// Add the fixture users; each one's password is `<uid>-pw`.
    pub fn with_users(self) -> Self {
        for (uid, number, shell, cn) in USERS {
            let dn = format!("uid={uid},{BASE_DN}");
            self.set_password(&dn, &format!("{uid}-pw"));
            self.insert(
                Entry::new(dn)
                    .with("uid", [*uid])
                    .with("uidNumber", [*number])
                    .with("loginShell", [*shell])
                    .with("cn", [*cn])
                    .with("objectClass", ["posixAccount", "top"]),
            );
        }
        self
    }

    pub fn insert(&self, entry: Entry) {
        self.state
            .lock()
            .entries
            .insert(entry.dn.to_ascii_lowercase(), entry);
    }

    pub fn entry(&self, dn: &str) -> Option<Entry> {
        self.state.lock().entries.get(&dn.to_ascii_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn set_password(&self, dn: &str, password: &str) {
        self.state
            .lock()
            .passwords
            .insert(dn.to_ascii_lowercase(), password.to_string());
    }

    /// Fail any search carrying the control `oid` with `code`.
    pub fn reject_control(&self, oid: &str, code: ResultCode) {
        self.state.lock().rejected.insert(oid.to_string(), code);
    }

    /// Answer VLV requests that carry a context id with an error result.
    pub fn reject_context_ids(&self) {
        self.state.lock().reject_context_ids = true;
    }

    /// Fail root DSE searches with `code`.
    pub fn fail_root_dse(&self, code: ResultCode) {
        self.state.lock().root_dse_error = Some(code);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.state.lock().requests.clone()
    }

    /// Searches other than root DSE probes.
    pub fn data_requests(&self) -> Vec<SearchRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !is_root_dse(r))
            .collect()
    }

    pub fn root_dse_probes(&self) -> usize {
        self.requests().iter().filter(|r| is_root_dse(r)).count()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.clone()
    }

    /// Sessions opened so far.
    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn unbound(&self) -> usize {
        self.state.lock().unbound
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn bind(&self, config: &ServerRoleConfig, dn: &str, password: &str) -> DirectoryResult<Box<dyn DirectorySession>> {
        config.validate()?;
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(DirectoryError::connection_failed(format!(
                "Failed to connect to LDAP server {}",
                config.url
            )));
        }
        match state.passwords.get(&dn.to_ascii_lowercase()) {
            Some(expected) if expected == password => {}
            _ => {
                return Err(DirectoryError::AuthenticationFailed {
                    bind_dn: dn.to_string(),
                })
            }
        }
        state.opened += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

impl Connector for MemoryDirectory {
    fn open(&self, config: &ServerRoleConfig) -> DirectoryResult<Box<dyn DirectorySession>> {
        self.bind(config, &config.user, config.password.as_deref().unwrap_or_default())
    }

    fn open_as(
        &self,
        config: &ServerRoleConfig,
        bind_dn: &str,
        password: &str,
    ) -> DirectoryResult<Box<dyn DirectorySession>> {
        self.bind(config, bind_dn, password)
    }
}

fn is_root_dse(request: &SearchRequest) -> bool {
    request.base.is_empty() && request.scope == SearchScope::Base
}

struct MemorySession {
    state: Arc<Mutex<State>>,
}

impl DirectorySession for MemorySession {
    fn search(&mut self, request: &SearchRequest) -> DirectoryResult<SearchResponse> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if is_root_dse(request) {
            if let Some(code) = state.root_dse_error {
                return Err(DirectoryError::protocol(code, "root DSE unavailable"));
            }
            let entries = state
                .root_dse
                .clone()
                .map(|attrs| Entry {
                    dn: String::new(),
                    attrs,
                })
                .into_iter()
                .collect();
            return Ok(SearchResponse::new(entries));
        }

        for control in &request.controls {
            if let Some(code) = state.rejected.get(control.oid()) {
                return Err(DirectoryError::protocol(
                    *code,
                    format!("control {} rejected", control.oid()),
                ));
            }
        }

        let filter = Filter::from_str(&request.filter)?;
        let base = request.base.to_ascii_lowercase();
        let mut matched: Vec<Entry> = if request.scope == SearchScope::Base {
            let Some(entry) = state.entries.get(&base) else {
                return Err(DirectoryError::protocol(
                    ResultCode::NO_SUCH_OBJECT,
                    format!("no such object: {}", request.base),
                ));
            };
            vec![entry.clone()]
                .into_iter()
                .filter(|e| matches(&filter, e))
                .collect()
        } else {
            state
                .entries
                .iter()
                .filter(|(dn, _)| in_scope(dn, &base, request.scope))
                .filter(|(_, e)| matches(&filter, e))
                .map(|(_, e)| e.clone())
                .collect()
        };

        let mut controls = Vec::new();
        let sort_keys = request.controls.iter().find_map(|c| match c {
            SearchControl::Sort { keys } => Some(keys.clone()),
            _ => None,
        });
        if let Some(keys) = &sort_keys {
            sort(&mut matched, keys);
            controls.push(ResponseControl::Sort {
                result: ResultCode::SUCCESS,
                attribute: None,
            });
        }

        let vlv = request.controls.iter().find_map(|c| match c {
            SearchControl::VirtualListView(vlv) => Some(vlv.clone()),
            _ => None,
        });
        if let Some(vlv) = vlv {
            let Some(keys) = sort_keys else {
                return Err(DirectoryError::protocol(
                    ResultCode::SORT_CONTROL_MISSING,
                    "virtual list view requires a sort control",
                ));
            };
            let content_count = matched.len() as u32;
            if vlv.context_id.is_some() && state.reject_context_ids {
                controls.push(ResponseControl::VirtualListView {
                    target_position: 0,
                    content_count,
                    result: ResultCode::OTHER,
                    context_id: None,
                });
                return Ok(SearchResponse {
                    entries: Vec::new(),
                    controls,
                });
            }

            let offset = match &vlv.target {
                VlvTarget::ByOffset { offset, .. } => *offset,
                VlvTarget::GreaterThanOrEqual(value) => {
                    let value = String::from_utf8_lossy(value).into_owned();
                    let position = matched.iter().position(|e| {
                        first_value(e, &keys[0].attribute)
                            .is_some_and(|v| compare(&v, &value) != Ordering::Less)
                    });
                    position.map_or(content_count + 1, |p| p as u32 + 1)
                }
            };
            let target_position = if content_count == 0 {
                0
            } else {
                offset.clamp(1, content_count)
            };
            let (start, end) = if content_count == 0 {
                (0, 0)
            } else {
                let target = target_position as usize - 1;
                (
                    target.saturating_sub(vlv.before_count as usize),
                    (target + vlv.after_count as usize + 1).min(matched.len()),
                )
            };

            state.contexts_issued += 1;
            controls.push(ResponseControl::VirtualListView {
                target_position,
                content_count,
                result: ResultCode::SUCCESS,
                context_id: Some(format!("ctx-{}", state.contexts_issued).into_bytes()),
            });
            let entries = matched[start..end]
                .iter()
                .map(|e| project(e, &request.attributes))
                .collect();
            return Ok(SearchResponse { entries, controls });
        }

        if let Some((size, cookie)) = request.controls.iter().find_map(|c| match c {
            SearchControl::Paged { size, cookie } => Some((*size as usize, cookie.clone())),
            _ => None,
        }) {
            let start: usize = if cookie.is_empty() {
                0
            } else {
                String::from_utf8_lossy(&cookie).parse().map_err(|_| {
                    DirectoryError::protocol(ResultCode::UNWILLING_TO_PERFORM, "bad paging cookie")
                })?
            };
            let start = start.min(matched.len());
            let end = (start + size.max(1)).min(matched.len());
            let next = if end < matched.len() {
                end.to_string().into_bytes()
            } else {
                Vec::new()
            };
            controls.push(ResponseControl::Paged {
                size: matched.len() as u32,
                cookie: next,
            });
            matched = matched[start..end].to_vec();
        }

        if request.size_limit > 0 {
            matched.truncate(request.size_limit as usize);
        }

        let entries = matched
            .iter()
            .map(|e| project(e, &request.attributes))
            .collect();
        Ok(SearchResponse { entries, controls })
    }

    fn add(&mut self, dn: &str, attrs: &[(String, Vec<Vec<u8>>)]) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        state.mutations.push(Mutation::Add(dn.to_string()));
        let key = dn.to_ascii_lowercase();
        if state.entries.contains_key(&key) {
            return Err(DirectoryError::ObjectAlreadyExists { dn: dn.to_string() });
        }
        let entry = Entry {
            dn: dn.to_string(),
            attrs: attrs.iter().cloned().collect(),
        };
        state.entries.insert(key, entry);
        Ok(())
    }

    fn modify(&mut self, dn: &str, mods: &[Modification]) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        state
            .mutations
            .push(Mutation::Modify(dn.to_string(), mods.to_vec()));
        let Some(entry) = state.entries.get_mut(&dn.to_ascii_lowercase()) else {
            return Err(DirectoryError::ObjectNotFound { dn: dn.to_string() });
        };
        for modification in mods {
            let name = modification.attribute().to_string();
            let existing = entry
                .attrs
                .keys()
                .find(|k| k.eq_ignore_ascii_case(&name))
                .cloned();
            match modification {
                Modification::Add(_, values) => {
                    let key = existing.unwrap_or(name);
                    entry.attrs.entry(key).or_default().extend(values.iter().cloned());
                }
                Modification::Delete(_) => {
                    if let Some(key) = existing {
                        entry.attrs.remove(&key);
                    }
                }
                Modification::Replace(_, values) => {
                    if let Some(key) = existing {
                        entry.attrs.remove(&key);
                    }
                    if !values.is_empty() {
                        entry.attrs.insert(name, values.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn delete(&mut self, dn: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        state.mutations.push(Mutation::Delete(dn.to_string()));
        match state.entries.remove(&dn.to_ascii_lowercase()) {
            Some(_) => Ok(()),
            None => Err(DirectoryError::ObjectNotFound { dn: dn.to_string() }),
        }
    }

    fn rename(&mut self, dn: &str, new_rdn: &str, new_superior: Option<&str>) -> DirectoryResult<()> {
        let mut state = self.state.lock();
        let parent = new_superior.unwrap_or_else(|| split_dn(dn).1).to_string();
        let new_dn = format!("{new_rdn},{parent}");
        state
            .mutations
            .push(Mutation::Rename(dn.to_string(), new_dn.clone()));

        if state.entries.contains_key(&new_dn.to_ascii_lowercase()) {
            return Err(DirectoryError::ObjectAlreadyExists { dn: new_dn });
        }
        let Some(mut entry) = state.entries.remove(&dn.to_ascii_lowercase()) else {
            return Err(DirectoryError::ObjectNotFound { dn: dn.to_string() });
        };

        let (old_attr, _) = split_dn(dn).0.split_once('=').unwrap_or_default();
        let old_key = entry
            .attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(old_attr))
            .cloned();
        if let Some(key) = old_key {
            entry.attrs.remove(&key);
        }
        if let Some((attr, value)) = new_rdn.split_once('=') {
            entry
                .attrs
                .insert(attr.to_string(), vec![value.as_bytes().to_vec()]);
        }
        entry.dn = new_dn.clone();
        state.entries.insert(new_dn.to_ascii_lowercase(), entry);
        Ok(())
    }

    fn unbind(&mut self) -> DirectoryResult<()> {
        self.state.lock().unbound += 1;
        Ok(())
    }
}

fn in_scope(dn: &str, base: &str, scope: SearchScope) -> bool {
    match scope {
        SearchScope::Base => dn == base,
        SearchScope::OneLevel => split_dn(dn).1 == base,
        SearchScope::Subtree => dn == base || dn.ends_with(&format!(",{base}")),
    }
}

fn first_value(entry: &Entry, attribute: &str) -> Option<String> {
    entry.first_str(attribute).map(str::to_string)
}

/// Integer comparison when both sides are integers, otherwise case-insensitive.
fn compare(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

fn any_value(entry: &Entry, attribute: &str, test: impl Fn(&str) -> bool) -> bool {
    entry.strs(attribute).into_iter().any(test)
}

fn matches(filter: &Filter, entry: &Entry) -> bool {
    match filter {
        Filter::And { filters } => filters.iter().all(|f| matches(f, entry)),
        Filter::Or { filters } => filters.iter().any(|f| matches(f, entry)),
        Filter::Not { filter } => !matches(filter, entry),
        Filter::Equals { attribute, value } | Filter::Approx { attribute, value } => {
            any_value(entry, attribute, |v| compare(v, value) == Ordering::Equal)
        }
        Filter::Contains { attribute, value } => any_value(entry, attribute, |v| {
            v.to_lowercase().contains(&value.to_lowercase())
        }),
        Filter::StartsWith { attribute, value } => any_value(entry, attribute, |v| {
            v.to_lowercase().starts_with(&value.to_lowercase())
        }),
        Filter::EndsWith { attribute, value } => any_value(entry, attribute, |v| {
            v.to_lowercase().ends_with(&value.to_lowercase())
        }),
        Filter::Substring {
            attribute,
            initial,
            any,
            final_,
        } => any_value(entry, attribute, |v| {
            let v = v.to_lowercase();
            let mut rest = v.as_str();
            if let Some(initial) = initial {
                match rest.strip_prefix(initial.to_lowercase().as_str()) {
                    Some(r) => rest = r,
                    None => return false,
                }
            }
            for part in any {
                let part = part.to_lowercase();
                match rest.find(&part) {
                    Some(i) => rest = &rest[i + part.len()..],
                    None => return false,
                }
            }
            final_
                .as_ref()
                .map_or(true, |f| rest.ends_with(&f.to_lowercase()))
        }),
        Filter::GreaterThan { attribute, value } => {
            any_value(entry, attribute, |v| compare(v, value) == Ordering::Greater)
        }
        Filter::GreaterThanOrEquals { attribute, value } => {
            any_value(entry, attribute, |v| compare(v, value) != Ordering::Less)
        }
        Filter::LessThan { attribute, value } => {
            any_value(entry, attribute, |v| compare(v, value) == Ordering::Less)
        }
        Filter::LessThanOrEquals { attribute, value } => {
            any_value(entry, attribute, |v| compare(v, value) != Ordering::Greater)
        }
        Filter::Present { attribute } => entry.get(attribute).is_some_and(|v| !v.is_empty()),
    }
}

fn sort(entries: &mut [Entry], keys: &[SortKey]) {
    entries.sort_by(|a, b| {
        for key in keys {
            let ordering = match (first_value(a, &key.attribute), first_value(b, &key.attribute)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => compare(&x, &y),
            };
            let ordering = if key.reverse { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(entry: &Entry, attributes: &[String]) -> Entry {
    if attributes.is_empty() || attributes.iter().any(|a| a == "*") {
        return entry.clone();
    }
    Entry {
        dn: entry.dn.clone(),
        attrs: entry
            .attrs
            .iter()
            .filter(|(k, _)| attributes.iter().any(|a| a.eq_ignore_ascii_case(k)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

// Root DSE fixtures

/// Build attributes from `(name, value)` pairs; repeated names collect values.
pub fn root_dse(pairs: &[(&str, &str)]) -> Attributes {
    let mut attrs = Attributes::new();
    for (name, value) in pairs {
        attrs
            .entry(name.to_string())
            .or_default()
            .push(value.as_bytes().to_vec());
    }
    attrs
}

/// OpenLDAP, with or without the sssvlv overlay loaded.
pub fn openldap_root_dse(sssvlv: bool) -> Attributes {
    let mut pairs = vec![
        ("vendorName", "OpenLDAP Foundation"),
        ("sizelimit", "500"),
        ("supportedControl", PAGED_RESULTS_OID),
    ];
    if sssvlv {
        pairs.push(("supportedControl", SORT_REQUEST_OID));
        pairs.push(("supportedControl", VLV_REQUEST_OID));
    }
    root_dse(&pairs)
}

pub fn ds389_root_dse() -> Attributes {
    root_dse(&[
        ("vendorName", "389 Project"),
        ("nsslapd-sizelimit", "2000"),
        ("supportedControl", PAGED_RESULTS_OID),
        ("supportedControl", SORT_REQUEST_OID),
        ("supportedControl", VLV_REQUEST_OID),
    ])
}

pub fn active_directory_root_dse() -> Attributes {
    root_dse(&[
        ("forestFunctionality", "7"),
        ("MaxPageSize", "1000"),
        ("supportedControl", PAGED_RESULTS_OID),
        ("supportedControl", SORT_REQUEST_OID),
        ("supportedControl", VLV_REQUEST_OID),
    ])
}

// Manager fixtures

pub fn user_meta() -> ModelMeta {
    ModelMeta::builder("User")
        .basedn(BASE_DN)
        .objectclass("posixAccount")
        .extra_objectclasses(["top"])
        .field(FieldSpec::string("uid").primary_key())
        .field(FieldSpec::integer("uidNumber"))
        .field(FieldSpec::string("loginShell"))
        .field(FieldSpec::string("full_name").with_attribute("cn"))
        .build()
        .expect("valid model")
}

pub fn servers() -> LdapServers {
    LdapServers::new().with_server(
        "default",
        ServerConfig {
            basedn: Some("dc=example,dc=com".to_string()),
            read: ServerRoleConfig::new("ldap://ldap.example.com", ADMIN_DN)
                .with_password(ADMIN_PASSWORD),
            write: ServerRoleConfig::new("ldap://ldap-master.example.com", ADMIN_DN)
                .with_password(ADMIN_PASSWORD),
        },
    )
}

pub fn manager_with(
    directory: &MemoryDirectory,
    meta: ModelMeta,
    settings: EngineSettings,
) -> LdapManager {
    LdapManager::new(
        meta,
        servers(),
        directory.connector(),
        Arc::new(ServerCapabilities::new(settings)),
    )
    .expect("valid manager")
}

pub fn manager(directory: &MemoryDirectory) -> LdapManager {
    manager_with(directory, user_meta(), EngineSettings::default())
}

/// Directory with the fixture users behind a server with every control.
pub fn users_directory() -> MemoryDirectory {
    MemoryDirectory::new(ds389_root_dse()).with_users()
}

pub fn uids(entries: &[Entry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|e| e.first_str("uid"))
        .map(str::to_string)
        .collect()
}

pub fn attrs(pairs: &[(&str, &str)]) -> Attributes {
    root_dse(pairs)
}

// Log capture

/// Shared buffer collecting formatted log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a subscriber recording everything at debug level and above.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, LogBuffer) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer)
}
