//! # ldaporm core
//!
//! Protocol-agnostic foundation of the ldaporm directory engine.
//!
//! ## Crate Organization
//!
//! - [`error`] - Error taxonomy and directory result codes
//! - [`config`] - Server/role connection settings and engine settings
//! - [`operation`] - Entries, search requests, controls and modifications
//! - [`filter`] - Filter expressions, rendering, parsing and escaping
//! - [`model`] - The name-mapping table supplied by the model layer
//! - [`modlist`] - Add and update planning
//! - [`traits`] - Session and connector traits

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod modlist;
pub mod operation;
pub mod traits;

/// Prelude module for convenient imports.
///
/// ```
/// use ldaporm_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{
        EngineSettings, LdapServers, Role, ServerConfig, ServerRoleConfig, TlsVerify,
    };
    pub use crate::error::{DirectoryError, DirectoryResult, ResultCode};
    pub use crate::filter::Filter;
    pub use crate::model::{FieldKind, FieldSpec, ModelMeta};
    pub use crate::modlist::{compute_add, compute_update, ModlistDiff};
    pub use crate::operation::{
        Attributes, Entry, Modification, ResponseControl, SearchControl, SearchRequest,
        SearchResponse, SearchScope, SortKey, VlvRequest, VlvTarget,
    };
    pub use crate::traits::{Connector, DirectorySession};
}
