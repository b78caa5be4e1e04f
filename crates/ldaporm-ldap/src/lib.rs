//! # ldaporm LDAP engine
//!
//! Directory query and synchronization engine on top of `ldap3`.
//!
//! ## Features
//!
//! - Per-thread current connections with read and write server roles
//! - Root DSE capability detection with a TTL cache
//! - Cookie-paged searches and server-side sorting
//! - Virtual list view windows for slicing, with client-side fallback
//! - A chainable query builder rendering RFC 4515 filters
//! - Minimal add and modify operations computed from attribute snapshots
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ldaporm_ldap::prelude::*;
//!
//! let servers = LdapServers::from_json(&std::fs::read_to_string("ldap.json")?)?;
//! let meta = ModelMeta::builder("User")
//!     .basedn("ou=users,dc=example,dc=com")
//!     .objectclass("posixAccount")
//!     .field(FieldSpec::string("uid").primary_key())
//!     .field(FieldSpec::integer("uidNumber"))
//!     .build()?;
//!
//! let users = LdapManager::ldap(meta, servers, Arc::new(ServerCapabilities::default()))?;
//! let window = users
//!     .filter(terms! { "uidNumber__gte" => 1000 })?
//!     .order_by(["uid"])?
//!     .slice(Some(20), Some(40))?;
//! ```

pub mod capabilities;
pub mod connector;
pub mod controls;
pub mod manager;
pub mod query;
pub mod strategy;

// Re-exports
pub use capabilities::{CacheStats, CapabilityRecord, ServerCapabilities, ServerFlavor};
pub use connector::LdapConnector;
pub use manager::LdapManager;
pub use query::{QueryBuilder, QueryIter, TermValue, ValuesList, ValuesListMode};
pub use strategy::{PagedResultSet, VlvContext, VlvPage, VlvWindow};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::capabilities::{CacheStats, CapabilityRecord, ServerCapabilities, ServerFlavor};
    pub use crate::connector::LdapConnector;
    pub use crate::manager::LdapManager;
    pub use crate::query::{QueryBuilder, TermValue, ValuesList, ValuesListMode};
    pub use crate::strategy::PagedResultSet;
    pub use crate::terms;
    pub use ldaporm_core::prelude::*;
}
