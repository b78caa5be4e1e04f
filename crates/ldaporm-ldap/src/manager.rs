//! Connection manager and entry-level operations
//!
//! [`LdapManager`] owns everything needed to talk to the servers behind one
//! model: the server configuration, a [`Connector`], the shared capability
//! cache and the per-thread "current" connections.
//!
//! Every operation runs inside [`LdapManager::with_connection`]: when the
//! calling thread already holds a connection (see [`LdapManager::connect`])
//! it is reused and left open, otherwise a fresh one is opened for the
//! operation and unbound when it finishes, whether it succeeded or not.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use ldaporm_core::config::{LdapServers, Role, ServerRoleConfig};
use ldaporm_core::error::{DirectoryError, DirectoryResult, ResultCode};
use ldaporm_core::filter::{escape_dn_value, split_dn, Filter};
use ldaporm_core::model::{ModelMeta, OBJECTCLASS_ATTRIBUTE, PAGED_SEARCH_OPTION};
use ldaporm_core::modlist::{compute_add, compute_update};
use ldaporm_core::operation::{Attributes, Entry, SearchRequest, SearchScope};
use ldaporm_core::traits::{Connector, DirectorySession};

use crate::capabilities::ServerCapabilities;
use crate::connector::LdapConnector;
use crate::query::{QueryBuilder, TermValue, ValuesList, ValuesListMode};
use crate::strategy::{self, PagedResultSet};

struct BoundConnection {
    session: Box<dyn DirectorySession>,
    role: Role,
}

struct ManagerInner {
    meta: ModelMeta,
    servers: LdapServers,
    connector: Arc<dyn Connector>,
    capabilities: Arc<ServerCapabilities>,
    connections: Mutex<HashMap<ThreadId, BoundConnection>>,
}

/// Connection lifecycle and data operations for one model.
///
/// Cloning is cheap and clones share the connection table, so a clone used
/// on the same thread sees the same current connection.
#[derive(Clone)]
pub struct LdapManager {
    inner: Arc<ManagerInner>,
}

/// Connection borrowed for the duration of one operation.
///
/// On drop, a connection opened for the operation is unbound and a borrowed
/// current connection is handed back to the thread.
struct ConnectionScope<'a> {
    inner: &'a ManagerInner,
    thread: ThreadId,
    session: Option<Box<dyn DirectorySession>>,
    role: Role,
    acquired: bool,
}

impl Drop for ConnectionScope<'_> {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if self.acquired {
            if let Err(e) = session.unbind() {
                warn!(error = %e, "Error during LDAP unbind");
            }
        } else {
            self.inner.connections.lock().insert(
                self.thread,
                BoundConnection {
                    session,
                    role: self.role,
                },
            );
        }
    }
}

impl LdapManager {
    /// Create a manager for a model.
    pub fn new(
        meta: ModelMeta,
        servers: LdapServers,
        connector: Arc<dyn Connector>,
        capabilities: Arc<ServerCapabilities>,
    ) -> DirectoryResult<Self> {
        meta.validate()?;
        capabilities.settings().validate()?;
        servers.server(&meta.server)?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                meta,
                servers,
                connector,
                capabilities,
                connections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Create a manager talking to real servers through ldap3.
    pub fn ldap(
        meta: ModelMeta,
        servers: LdapServers,
        capabilities: Arc<ServerCapabilities>,
    ) -> DirectoryResult<Self> {
        Self::new(meta, servers, Arc::new(LdapConnector::new()), capabilities)
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.inner.meta
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    /// Cache key for the capabilities of one server role.
    pub fn capability_key(&self, role: Role) -> String {
        format!("{}/{}", self.inner.meta.server, role)
    }

    fn role_config(&self, role: Role) -> DirectoryResult<&ServerRoleConfig> {
        self.inner.servers.role(&self.inner.meta.server, role)
    }

    /// Base DN of the model, falling back to the server's.
    pub fn base_dn(&self) -> DirectoryResult<String> {
        if !self.inner.meta.basedn.is_empty() {
            return Ok(self.inner.meta.basedn.clone());
        }
        self.inner
            .servers
            .server(&self.inner.meta.server)?
            .basedn
            .clone()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                DirectoryError::config(format!(
                    "basedn is required either in model {} or in server '{}'",
                    self.inner.meta.name, self.inner.meta.server
                ))
            })
    }

    /// Attributes fetched for full entries.
    pub fn attributes(&self) -> Vec<String> {
        let mut attributes: Vec<String> = self
            .inner
            .meta
            .fields
            .iter()
            .map(|f| f.attribute.clone())
            .collect();
        if !attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE))
        {
            attributes.push(OBJECTCLASS_ATTRIBUTE.to_string());
        }
        attributes
    }

    // Connection lifecycle

    /// Open an independent session that is not made current.
    pub fn new_connection(&self, role: Role) -> DirectoryResult<Box<dyn DirectorySession>> {
        let config = self.role_config(role)?;
        self.inner.connector.open(config)
    }

    fn install(&self, role: Role, session: Box<dyn DirectorySession>) {
        let previous = self
            .inner
            .connections
            .lock()
            .insert(thread::current().id(), BoundConnection { session, role });
        if let Some(mut previous) = previous {
            if let Err(e) = previous.session.unbind() {
                warn!(error = %e, "Error unbinding replaced connection");
            }
        }
    }

    /// Open a session for `role` and make it the calling thread's current one.
    #[instrument(skip(self))]
    pub fn connect(&self, role: Role) -> DirectoryResult<()> {
        let session = self.new_connection(role)?;
        self.install(role, session);
        debug!(role = %role, "Current connection established");
        Ok(())
    }

    /// Like [`connect`](Self::connect), binding with other credentials.
    #[instrument(skip(self, password))]
    pub fn connect_as(&self, role: Role, bind_dn: &str, password: &str) -> DirectoryResult<()> {
        let config = self.role_config(role)?;
        let session = self.inner.connector.open_as(config, bind_dn, password)?;
        self.install(role, session);
        Ok(())
    }

    /// Unbind and forget the calling thread's current connection.
    pub fn disconnect(&self) {
        let bound = self
            .inner
            .connections
            .lock()
            .remove(&thread::current().id());
        if let Some(mut bound) = bound {
            if let Err(e) = bound.session.unbind() {
                warn!(error = %e, "Error during LDAP unbind");
            }
            debug!(role = %bound.role, "Current connection released");
        }
    }

    /// Whether the calling thread holds a current connection.
    pub fn has_connection(&self) -> bool {
        self.inner
            .connections
            .lock()
            .contains_key(&thread::current().id())
    }

    fn acquire(&self, role: Role) -> DirectoryResult<ConnectionScope<'_>> {
        let thread = thread::current().id();
        let bound = self.inner.connections.lock().remove(&thread);
        if let Some(bound) = bound {
            return Ok(ConnectionScope {
                inner: &self.inner,
                thread,
                session: Some(bound.session),
                role: bound.role,
                acquired: false,
            });
        }
        let session = self.new_connection(role)?;
        Ok(ConnectionScope {
            inner: &self.inner,
            thread,
            session: Some(session),
            role,
            acquired: true,
        })
    }

    /// Run `f` with a session and the capability key of its server role.
    ///
    /// Reuses the thread's current connection when there is one; otherwise
    /// opens a connection for `role` and unbinds it afterwards.
    ///
    /// The current connection is lent to `f` for the duration of the call, so
    /// work nested inside `f` should go through the session it is given.
    /// Calling back into the manager from `f` opens a second connection.
    pub fn with_connection<T, F>(&self, role: Role, f: F) -> DirectoryResult<T>
    where
        F: FnOnce(&mut dyn DirectorySession, &str) -> DirectoryResult<T>,
    {
        let mut scope = self.acquire(role)?;
        let key = self.capability_key(scope.role);
        match scope.session.as_deref_mut() {
            Some(session) => f(session, &key),
            None => Err(DirectoryError::operation_failed(
                "connection scope lost its session",
            )),
        }
    }

    // Searches

    fn request(
        &self,
        filter: &str,
        attributes: &[String],
        size_limit: u32,
        basedn: Option<&str>,
        scope: SearchScope,
    ) -> DirectoryResult<SearchRequest> {
        let base = match basedn {
            Some(base) => base.to_string(),
            None => self.base_dn()?,
        };
        Ok(SearchRequest::new(base, scope, filter)
            .with_attributes(attributes.iter().cloned())
            .with_size_limit(size_limit))
    }

    /// Run a prepared request on a session, paging when the model asks for it.
    pub(crate) fn search_in(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
        request: &SearchRequest,
    ) -> DirectoryResult<Vec<Entry>> {
        let wants_paging = self.inner.meta.has_option(PAGED_SEARCH_OPTION)
            && request.size_limit == 0
            && request.scope != SearchScope::Base;
        if wants_paging && self.inner.capabilities.supports_paging(session, key)? {
            let page_size = self.inner.capabilities.page_size_limit(session, key)?;
            return strategy::paged_search(session, request, page_size);
        }
        strategy::plain_search(session, request)
    }

    /// Search under the model base (or `basedn`).
    #[instrument(skip(self, attributes))]
    pub fn search(
        &self,
        filter: &str,
        attributes: &[String],
        size_limit: u32,
        basedn: Option<&str>,
        scope: SearchScope,
    ) -> DirectoryResult<Vec<Entry>> {
        let request = self.request(filter, attributes, size_limit, basedn, scope)?;
        self.with_connection(Role::Read, |session, key| {
            self.search_in(session, key, &request)
        })
    }

    /// Fetch every entry through the paged results control.
    ///
    /// `page_size` defaults to the server's detected limit.
    #[instrument(skip(self, attributes))]
    pub fn paged_search(
        &self,
        filter: &str,
        attributes: &[String],
        page_size: Option<u32>,
    ) -> DirectoryResult<Vec<Entry>> {
        let request = self.request(filter, attributes, 0, None, SearchScope::Subtree)?;
        self.with_connection(Role::Read, |session, key| {
            let page_size = match page_size {
                Some(size) => size,
                None => self.inner.capabilities.page_size_limit(session, key)?,
            };
            strategy::paged_search(session, &request, page_size)
        })
    }

    /// Fetch one page; pass the previous page's cookie to continue.
    #[instrument(skip(self, attributes, cookie))]
    pub fn search_page(
        &self,
        filter: &str,
        attributes: &[String],
        page_size: u32,
        cookie: &[u8],
    ) -> DirectoryResult<PagedResultSet> {
        let request = self.request(filter, attributes, 0, None, SearchScope::Subtree)?;
        self.with_connection(Role::Read, |session, _| {
            strategy::search_page(session, &request, page_size, cookie)
        })
    }

    // Entries

    /// DN an entry with primary key `pk` has under the model base.
    pub fn dn_for(&self, pk: &str) -> DirectoryResult<String> {
        Ok(format!(
            "{}={},{}",
            self.inner.meta.pk_attribute()?,
            escape_dn_value(pk),
            self.base_dn()?
        ))
    }

    fn pk_value<'a>(&self, attrs: &'a Attributes) -> DirectoryResult<Option<&'a str>> {
        let pk_attr = self.inner.meta.pk_attribute()?;
        Ok(attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(pk_attr))
            .and_then(|(_, values)| values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
            .filter(|v| !v.is_empty()))
    }

    fn read_entry(
        &self,
        session: &mut dyn DirectorySession,
        dn: &str,
    ) -> DirectoryResult<Entry> {
        let request = SearchRequest::new(dn, SearchScope::Base, "(objectClass=*)")
            .with_attributes(self.attributes());
        let entries = match session.search(&request) {
            Ok(response) => response.entries,
            Err(DirectoryError::Protocol { code, .. }) if code == ResultCode::NO_SUCH_OBJECT => {
                Vec::new()
            }
            Err(DirectoryError::ObjectNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let count = entries.len();
        let mut entries = entries.into_iter();
        match (entries.next(), count) {
            (Some(entry), 1) => Ok(entry),
            (None, _) => Err(DirectoryError::DoesNotExist {
                model: self.inner.meta.name.clone(),
            }),
            (Some(_), count) => Err(DirectoryError::MultipleObjectsReturned {
                model: self.inner.meta.name.clone(),
                count,
            }),
        }
    }

    /// Read one entry by DN. The DN must live under the model base.
    #[instrument(skip(self))]
    pub fn get_by_dn(&self, dn: &str) -> DirectoryResult<Entry> {
        let base = self.base_dn()?;
        if !is_under(dn, &base) {
            return Err(DirectoryError::invalid_value(format!(
                "The requested dn '{dn}' is not in our model's basedn '{base}'"
            )));
        }
        self.with_connection(Role::Read, |session, _| self.read_entry(session, dn))
    }

    /// Add a new entry and return its DN.
    #[instrument(skip(self, attrs))]
    pub fn add(&self, attrs: &Attributes) -> DirectoryResult<String> {
        let pk = self.pk_value(attrs)?.ok_or_else(|| {
            DirectoryError::invalid_value(format!(
                "cannot add a {} without a primary key value",
                self.inner.meta.name
            ))
        })?;
        let dn = self.dn_for(pk)?;
        let modlist = compute_add(&self.inner.meta, attrs)?;

        debug!(dn = %dn, attributes = modlist.len(), "Creating LDAP entry");
        self.with_connection(Role::Write, |session, _| session.add(&dn, &modlist))?;
        info!(dn = %dn, "LDAP entry created successfully");

        Ok(dn)
    }

    /// Add an entry and read it back.
    pub fn create(&self, attrs: &Attributes) -> DirectoryResult<Entry> {
        let dn = self.add(attrs)?;
        self.get_by_dn(&dn)
    }

    pub(crate) fn modify_in(
        &self,
        session: &mut dyn DirectorySession,
        dn: &str,
        new: &Attributes,
        old: Option<&Attributes>,
    ) -> DirectoryResult<String> {
        let meta = &self.inner.meta;
        let pk_attr = meta.pk_attribute()?;
        let mut dn = dn.to_string();
        let mut old = old;

        if let Some(new_pk) = self.pk_value(new)? {
            let (rdn, parent) = split_dn(&dn);
            let current = rdn.split_once('=').map(|(_, v)| v).unwrap_or_default();
            let escaped = escape_dn_value(new_pk);
            if !escaped.eq_ignore_ascii_case(current) {
                let new_rdn = format!("{pk_attr}={escaped}");
                let new_dn = format!("{new_rdn},{parent}");
                debug!(dn = %dn, new_dn = %new_dn, "Renaming LDAP entry for new primary key");
                session.rename(&dn, &new_rdn, None)?;
                dn = new_dn;
                old = None;
            }
        }

        let loaded;
        let old = match old {
            Some(old) => old,
            None => {
                loaded = self.read_entry(session, &dn)?.attrs;
                &loaded
            }
        };

        let diff = compute_update(meta, new, old);
        if diff.is_empty() {
            debug!(dn = %dn, "modify.no-changes");
            return Ok(dn);
        }

        debug!(dn = %dn, changes = diff.len(), "Updating LDAP entry");
        session.modify(&dn, &diff.into_modifications())?;
        info!(dn = %dn, "LDAP entry updated successfully");
        Ok(dn)
    }

    /// Bring the entry at `dn` to the state `new`, returning its (possibly
    /// renamed) DN.
    ///
    /// `new` is a full snapshot: editable attributes it lacks are deleted.
    /// Without `old` the current entry is read from the server first.
    #[instrument(skip(self, new, old))]
    pub fn modify(
        &self,
        dn: &str,
        new: &Attributes,
        old: Option<&Attributes>,
    ) -> DirectoryResult<String> {
        self.with_connection(Role::Write, |session, _| {
            self.modify_in(session, dn, new, old)
        })
    }

    /// Delete the entry at `dn`.
    #[instrument(skip(self))]
    pub fn delete_dn(&self, dn: &str) -> DirectoryResult<()> {
        debug!(dn = %dn, "Deleting LDAP entry");
        self.with_connection(Role::Write, |session, _| session.delete(dn))?;
        info!(dn = %dn, "LDAP entry deleted successfully");
        Ok(())
    }

    /// Move an entry to `new_dn`, changing parent when needed.
    #[instrument(skip(self))]
    pub fn rename(&self, old_dn: &str, new_dn: &str) -> DirectoryResult<()> {
        let (new_rdn, new_parent) = split_dn(new_dn);
        let (_, old_parent) = split_dn(old_dn);
        let new_superior = if old_parent.eq_ignore_ascii_case(new_parent) {
            None
        } else {
            Some(new_parent)
        };
        self.with_connection(Role::Write, |session, _| {
            session.rename(old_dn, new_rdn, new_superior)
        })?;
        info!(old_dn = %old_dn, new_dn = %new_dn, "LDAP entry renamed");
        Ok(())
    }

    /// Check a user's password by binding as them.
    ///
    /// Unknown users and rejected credentials return `false`.
    #[instrument(skip(self, password))]
    pub fn authenticate(&self, username: &str, password: &str) -> DirectoryResult<bool> {
        let pk_attr = self.inner.meta.pk()?.name.clone();
        let user = self
            .query()
            .filter(vec![("pk", TermValue::from(username))])?
            .only([pk_attr.as_str()])?
            .get_or_none(Vec::<(&str, TermValue)>::new())?;
        let Some(user) = user else {
            warn!(user = %username, "auth.no_such_user");
            return Ok(false);
        };

        let config = self.role_config(Role::Read)?;
        match self.inner.connector.open_as(config, &user.dn, password) {
            Ok(mut session) => {
                if let Err(e) = session.unbind() {
                    debug!(error = %e, "Error during LDAP unbind");
                }
                info!(user = %username, "auth.success");
                Ok(true)
            }
            Err(DirectoryError::AuthenticationFailed { .. }) => {
                warn!(user = %username, "auth.invalid_credentials");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    // Query shortcuts

    /// A builder pre-filtered to the model's object class.
    pub fn query(&self) -> QueryBuilder {
        let builder = QueryBuilder::new(self.clone());
        match &self.inner.meta.objectclass {
            Some(objectclass) => {
                builder.filter_expr(Filter::eq(OBJECTCLASS_ATTRIBUTE, objectclass.as_str()))
            }
            None => builder,
        }
    }

    pub fn filter<I, K>(&self, terms: I) -> DirectoryResult<QueryBuilder>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        self.query().filter(terms)
    }

    pub fn exclude<I, K>(&self, terms: I) -> DirectoryResult<QueryBuilder>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        self.query().exclude(terms)
    }

    pub fn filter_expr(&self, filter: Filter) -> QueryBuilder {
        self.query().filter_expr(filter)
    }

    pub fn wildcard(&self, name: &str, pattern: &str) -> DirectoryResult<QueryBuilder> {
        self.query().wildcard(name, pattern)
    }

    pub fn order_by<I, S>(&self, names: I) -> DirectoryResult<QueryBuilder>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query().order_by(names)
    }

    pub fn only<I, S>(&self, names: I) -> DirectoryResult<QueryBuilder>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query().only(names)
    }

    pub fn get<I, K>(&self, terms: I) -> DirectoryResult<Entry>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        self.query().get(terms)
    }

    pub fn all(&self) -> DirectoryResult<Vec<Entry>> {
        self.query().all()
    }

    pub fn values<I, S>(&self, names: I) -> DirectoryResult<Vec<Attributes>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query().values(names)
    }

    pub fn values_list<I, S>(&self, names: I, mode: ValuesListMode) -> DirectoryResult<ValuesList>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.query().values_list(names, mode)
    }

    /// Delete the single entry matching `terms`.
    pub fn delete<I, K>(&self, terms: I) -> DirectoryResult<()>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        self.query().filter(terms)?.delete()
    }
}

/// Whether `dn` is `base` or an entry below it, comparing RDNs rather than
/// raw suffixes.
fn is_under(dn: &str, base: &str) -> bool {
    let dn = dn.to_lowercase();
    let base = base.to_lowercase();
    dn == base
        || dn
            .strip_suffix(&base)
            .is_some_and(|prefix| prefix.ends_with(','))
}

impl fmt::Debug for LdapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LdapManager")
            .field("model", &self.inner.meta.name)
            .field("server", &self.inner.meta.server)
            .field("basedn", &self.inner.meta.basedn)
            .finish()
    }
}
