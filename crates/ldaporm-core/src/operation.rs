//! Directory operation types
//!
//! Entries, search requests and responses, request/response controls and
//! modification primitives shared by every session implementation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ResultCode;

/// Raw attribute map: attribute name to its byte-string values.
pub type Attributes = BTreeMap<String, Vec<Vec<u8>>>;

/// One directory entry as returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Distinguished name.
    pub dn: String,
    /// Attribute values keyed by attribute name as the server returned it.
    pub attrs: Attributes,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: Attributes::new(),
        }
    }

    /// Add string values for an attribute (builder style).
    pub fn with<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        self.attrs.insert(
            name.into(),
            values.into_iter().map(|v| v.as_ref().to_vec()).collect(),
        );
        self
    }

    /// Values of an attribute, matching the name case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Vec<Vec<u8>>> {
        self.attrs
            .get(name)
            .or_else(|| {
                self.attrs
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
    }

    /// First value of an attribute as UTF-8 text.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All values of an attribute as UTF-8 text, skipping non-text values.
    pub fn strs(&self, name: &str) -> Vec<&str> {
        self.get(name)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| std::str::from_utf8(v).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Split into the `(dn, attributes)` tuple handed to collaborators.
    pub fn into_parts(self) -> (String, Attributes) {
        (self.dn, self.attrs)
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Only the base entry.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything below it.
    #[default]
    Subtree,
}

/// One server-side sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub attribute: String,
    #[serde(default)]
    pub reverse: bool,
}

impl SortKey {
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            reverse: false,
        }
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            reverse: true,
        }
    }
}

/// Where a virtual list view window is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VlvTarget {
    /// 1-based offset into a list of `content_count` entries (0 = server estimate).
    ByOffset { offset: u32, content_count: u32 },
    /// First entry whose sort key is greater than or equal to the value.
    GreaterThanOrEqual(Vec<u8>),
}

/// Virtual list view request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlvRequest {
    pub before_count: u32,
    pub after_count: u32,
    pub target: VlvTarget,
    pub context_id: Option<Vec<u8>>,
}

/// Request controls understood by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchControl {
    /// Simple paged results (RFC 2696).
    Paged { size: u32, cookie: Vec<u8> },
    /// Server-side sort (RFC 2891).
    Sort { keys: Vec<SortKey> },
    /// Virtual list view.
    VirtualListView(VlvRequest),
}

impl SearchControl {
    /// Control OID.
    pub fn oid(&self) -> &'static str {
        match self {
            SearchControl::Paged { .. } => PAGED_RESULTS_OID,
            SearchControl::Sort { .. } => SORT_REQUEST_OID,
            SearchControl::VirtualListView(_) => VLV_REQUEST_OID,
        }
    }
}

/// Server-side sort request control.
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// Server-side sort response control.
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
/// Simple paged results control.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// Virtual list view request control.
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
/// Virtual list view response control.
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";

/// Response controls decoded from a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseControl {
    Paged {
        size: u32,
        cookie: Vec<u8>,
    },
    Sort {
        result: ResultCode,
        attribute: Option<String>,
    },
    VirtualListView {
        target_position: u32,
        content_count: u32,
        result: ResultCode,
        context_id: Option<Vec<u8>>,
    },
}

/// A single search round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    /// Attributes to return; empty means all user attributes.
    pub attributes: Vec<String>,
    /// Maximum entries to return; 0 means no client limit.
    pub size_limit: u32,
    pub controls: Vec<SearchControl>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            size_limit: 0,
            controls: Vec::new(),
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_size_limit(mut self, limit: u32) -> Self {
        self.size_limit = limit;
        self
    }

    #[must_use]
    pub fn with_control(mut self, control: SearchControl) -> Self {
        self.controls.push(control);
        self
    }

    /// Find a request control by kind.
    pub fn control(&self, oid: &str) -> Option<&SearchControl> {
        self.controls.iter().find(|c| c.oid() == oid)
    }
}

/// Entries and decoded response controls of one search round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub entries: Vec<Entry>,
    pub controls: Vec<ResponseControl>,
}

impl SearchResponse {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            controls: Vec::new(),
        }
    }

    /// Cookie of the paged results response control, if any.
    pub fn paged_cookie(&self) -> Option<&[u8]> {
        self.controls.iter().find_map(|c| match c {
            ResponseControl::Paged { cookie, .. } => Some(cookie.as_slice()),
            _ => None,
        })
    }

    /// Sort response result, if any.
    pub fn sort_result(&self) -> Option<ResultCode> {
        self.controls.iter().find_map(|c| match c {
            ResponseControl::Sort { result, .. } => Some(*result),
            _ => None,
        })
    }

    /// VLV response `(target_position, content_count, result, context_id)`.
    pub fn vlv(&self) -> Option<(u32, u32, ResultCode, Option<&[u8]>)> {
        self.controls.iter().find_map(|c| match c {
            ResponseControl::VirtualListView {
                target_position,
                content_count,
                result,
                context_id,
            } => Some((
                *target_position,
                *content_count,
                *result,
                context_id.as_deref(),
            )),
            _ => None,
        })
    }
}

/// One attribute modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    /// Add values to an attribute.
    Add(String, Vec<Vec<u8>>),
    /// Remove the whole attribute.
    Delete(String),
    /// Replace all values of an attribute.
    Replace(String, Vec<Vec<u8>>),
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add(name, _)
            | Modification::Delete(name)
            | Modification::Replace(name, _) => name,
        }
    }
}
