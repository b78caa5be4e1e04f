//! Session and connector traits
//!
//! A [`Connector`] opens bound [`DirectorySession`]s from a role
//! configuration. The engine only talks to servers through these two traits,
//! so tests can substitute an in-memory directory for a real server.

use crate::config::ServerRoleConfig;
use crate::error::DirectoryResult;
use crate::operation::{Modification, SearchRequest, SearchResponse};

/// A bound session with a directory server.
///
/// Sessions are owned by one operation at a time and are never shared between
/// concurrent callers.
pub trait DirectorySession: Send {
    /// Run one search round trip.
    ///
    /// When `size_limit` is hit the entries returned so far are still
    /// returned as a success.
    fn search(&mut self, request: &SearchRequest) -> DirectoryResult<SearchResponse>;

    /// Add a new entry.
    fn add(&mut self, dn: &str, attrs: &[(String, Vec<Vec<u8>>)]) -> DirectoryResult<()>;

    /// Apply modifications to an entry, in order.
    fn modify(&mut self, dn: &str, mods: &[Modification]) -> DirectoryResult<()>;

    /// Delete an entry.
    fn delete(&mut self, dn: &str) -> DirectoryResult<()>;

    /// Rename an entry, optionally moving it under a new parent.
    fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_superior: Option<&str>,
    ) -> DirectoryResult<()>;

    /// Unbind and close the session.
    fn unbind(&mut self) -> DirectoryResult<()>;
}

/// Opens sessions.
pub trait Connector: Send + Sync {
    /// Connect and bind with the configured credentials.
    fn open(&self, config: &ServerRoleConfig) -> DirectoryResult<Box<dyn DirectorySession>>;

    /// Connect and bind with explicit credentials.
    fn open_as(
        &self,
        config: &ServerRoleConfig,
        bind_dn: &str,
        password: &str,
    ) -> DirectoryResult<Box<dyn DirectorySession>>;
}
