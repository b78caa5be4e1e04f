//! Chainable query builder
//!
//! A [`QueryBuilder`] collects filter groups, exclusions, ordering and a
//! projection, renders them into one RFC 4515 filter and picks the cheapest
//! way to fetch what the caller consumes:
//!
//! - full iteration: plain (or paged) search, sorted by the server when it
//!   can, otherwise on the client
//! - `[:n]`: a size-limited search
//! - other slices and indexing: a virtual list view window, falling back to
//!   fetching everything and slicing locally when the server refuses
//!
//! Terms are `(lookup, value)` pairs where the lookup is a field name with an
//! optional `__suffix`; see [`terms!`](crate::terms) for a compact literal form.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ldaporm_core::config::Role;
use ldaporm_core::error::{DirectoryError, DirectoryResult};
use ldaporm_core::filter::Filter;
use ldaporm_core::model::{FieldSpec, ModelMeta};
use ldaporm_core::operation::{Attributes, Entry, SearchRequest, SearchScope, SortKey};
use ldaporm_core::traits::DirectorySession;

use crate::manager::LdapManager;
use crate::strategy::{self, PagedResultSet, VlvContext, VlvWindow};

/// Build a list of query terms.
///
/// ```ignore
/// manager.filter(terms! { "loginShell" => "/bin/bash", "uidNumber__gte" => 1002 })?;
/// ```
#[macro_export]
macro_rules! terms {
    () => {
        ::std::vec::Vec::<(&str, $crate::query::TermValue)>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$(($key, $crate::query::TermValue::from($value))),+]
    };
}

/// Operand of a query term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TermValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<TermValue>),
}

impl TermValue {
    /// Filter operand for a single value; strings are trimmed.
    fn scalar(&self) -> Option<String> {
        match self {
            TermValue::Str(s) => Some(s.trim().to_string()),
            TermValue::Int(i) => Some(i.to_string()),
            TermValue::Bool(true) => Some("TRUE".to_string()),
            TermValue::Bool(false) => Some("FALSE".to_string()),
            TermValue::Null | TermValue::List(_) => None,
        }
    }

    fn integer(&self) -> Option<i64> {
        match self {
            TermValue::Int(i) => Some(*i),
            TermValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Attribute values written by an update.
    fn to_values(&self) -> Vec<Vec<u8>> {
        match self {
            TermValue::Null => Vec::new(),
            TermValue::Str(s) => vec![s.as_bytes().to_vec()],
            TermValue::List(items) => items.iter().flat_map(TermValue::to_values).collect(),
            other => other
                .scalar()
                .map(|s| vec![s.into_bytes()])
                .unwrap_or_default(),
        }
    }
}

impl From<&str> for TermValue {
    fn from(value: &str) -> Self {
        TermValue::Str(value.to_string())
    }
}

impl From<String> for TermValue {
    fn from(value: String) -> Self {
        TermValue::Str(value)
    }
}

impl From<&String> for TermValue {
    fn from(value: &String) -> Self {
        TermValue::Str(value.clone())
    }
}

impl From<i64> for TermValue {
    fn from(value: i64) -> Self {
        TermValue::Int(value)
    }
}

impl From<i32> for TermValue {
    fn from(value: i32) -> Self {
        TermValue::Int(i64::from(value))
    }
}

impl From<u32> for TermValue {
    fn from(value: u32) -> Self {
        TermValue::Int(i64::from(value))
    }
}

impl From<bool> for TermValue {
    fn from(value: bool) -> Self {
        TermValue::Bool(value)
    }
}

impl<T: Into<TermValue>> From<Vec<T>> for TermValue {
    fn from(values: Vec<T>) -> Self {
        TermValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<TermValue>, const N: usize> From<[T; N]> for TermValue {
    fn from(values: [T; N]) -> Self {
        TermValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<TermValue>> From<Option<T>> for TermValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(TermValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Exists,
}

/// Split `field__suffix`; directory matching rules decide case sensitivity,
/// so the `i` variants map to the same lookups.
fn parse_lookup(key: &str) -> DirectoryResult<(&str, Lookup)> {
    let Some((name, suffix)) = key.rsplit_once("__") else {
        return Ok((key, Lookup::Exact));
    };
    let lookup = match suffix {
        "exact" | "iexact" => Lookup::Exact,
        "contains" | "icontains" => Lookup::Contains,
        "startswith" | "istartswith" => Lookup::StartsWith,
        "endswith" | "iendswith" => Lookup::EndsWith,
        "gt" => Lookup::Gt,
        "gte" => Lookup::Gte,
        "lt" => Lookup::Lt,
        "lte" => Lookup::Lte,
        "in" => Lookup::In,
        "exists" => Lookup::Exists,
        _ => {
            return Err(DirectoryError::UnknownSuffix {
                lookup: key.to_string(),
            })
        }
    };
    Ok((name, lookup))
}

fn single_value(key: &str, value: &TermValue) -> DirectoryResult<String> {
    value.scalar().ok_or_else(|| {
        DirectoryError::invalid_value(format!("The search filter \"{key}\" needs a single value"))
    })
}

/// Translate one term into a filter.
fn term_filter(meta: &ModelMeta, key: &str, value: &TermValue) -> DirectoryResult<Filter> {
    let (name, lookup) = parse_lookup(key)?;
    let field = meta.field(name)?;
    let attribute = field.attribute.as_str();

    match lookup {
        Lookup::Exact => match value {
            TermValue::Null => Ok(Filter::negate(Filter::present(attribute))),
            _ => Ok(Filter::eq(attribute, single_value(key, value)?)),
        },
        Lookup::Contains => Ok(Filter::contains(attribute, single_value(key, value)?)),
        Lookup::StartsWith => Ok(Filter::starts_with(attribute, single_value(key, value)?)),
        Lookup::EndsWith => Ok(Filter::ends_with(attribute, single_value(key, value)?)),
        Lookup::Gt | Lookup::Gte | Lookup::Lt | Lookup::Lte => {
            if !field.kind.is_numeric() {
                return Err(DirectoryError::TypeMismatch {
                    message: format!(
                        "\"{key}\" compares numerically but field '{}' of model {} is not an integer field",
                        field.name, meta.name
                    ),
                });
            }
            let number = value
                .integer()
                .ok_or_else(|| DirectoryError::TypeMismatch {
                    message: format!("\"{key}\" needs an integer operand, got {value:?}"),
                })?
                .to_string();
            Ok(match lookup {
                Lookup::Gt => Filter::gt(attribute, number),
                Lookup::Gte => Filter::gte(attribute, number),
                Lookup::Lt => Filter::lt(attribute, number),
                _ => Filter::lte(attribute, number),
            })
        }
        Lookup::In => {
            let TermValue::List(items) = value else {
                return Err(DirectoryError::invalid_value(
                    "When using the \"__in\" filter you must supply a list",
                ));
            };
            let alternatives = items
                .iter()
                .map(|item| Ok(Filter::eq(attribute, single_value(key, item)?)))
                .collect::<DirectoryResult<Vec<_>>>()?;
            Ok(Filter::or(alternatives))
        }
        Lookup::Exists => match value {
            TermValue::Bool(false) => Ok(Filter::negate(Filter::present(attribute))),
            _ => Ok(Filter::present(attribute)),
        },
    }
}

fn group<I, K>(meta: &ModelMeta, terms: I) -> DirectoryResult<Option<Filter>>
where
    I: IntoIterator<Item = (K, TermValue)>,
    K: AsRef<str>,
{
    let steps = terms
        .into_iter()
        .map(|(key, value)| term_filter(meta, key.as_ref(), &value))
        .collect::<DirectoryResult<Vec<_>>>()?;
    Ok(match steps.len() {
        0 => None,
        _ => Some(Filter::and(steps)),
    })
}

fn combine(mut chain: Vec<Filter>) -> Option<Filter> {
    match chain.len() {
        0 => None,
        1 => chain.pop().map(Filter::simplify),
        _ => Some(Filter::and(chain).simplify()),
    }
}

/// Python-style bound resolution against a known length.
fn resolve_bound(index: Option<isize>, default: usize, len: usize) -> usize {
    match index {
        None => default,
        Some(i) if i < 0 => len.saturating_sub(i.unsigned_abs()),
        Some(i) => i.unsigned_abs().min(len),
    }
}

fn slice_entries(entries: Vec<Entry>, start: Option<isize>, stop: Option<isize>) -> Vec<Entry> {
    let len = entries.len();
    let start = resolve_bound(start, 0, len);
    let stop = resolve_bound(stop, len, len);
    if stop <= start {
        return Vec::new();
    }
    entries.into_iter().skip(start).take(stop - start).collect()
}

fn vlv_window(start: usize, stop: usize) -> DirectoryResult<VlvWindow> {
    let offset = u32::try_from(start + 1).map_err(|_| {
        DirectoryError::control_encoding(format!("VLV offset {} exceeds maxInt", start + 1))
    })?;
    let after_count = u32::try_from(stop - start - 1).map_err(|_| {
        DirectoryError::control_encoding(format!("VLV window of {} entries is too large", stop - start))
    })?;
    Ok(VlvWindow {
        offset,
        before_count: 0,
        after_count,
        content_count: 0,
    })
}

/// Attribute values of one field.
pub type AttributeValues = Vec<Vec<u8>>;

/// Shape of [`QueryBuilder::values_list`] rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValuesListMode {
    /// One tuple of value lists per entry.
    #[default]
    Tuples,
    /// The value list of the single requested field per entry.
    Flat,
    /// `(field name, values)` pairs per entry.
    Named,
}

/// Rows returned by [`QueryBuilder::values_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuesList {
    Tuples(Vec<Vec<AttributeValues>>),
    Flat(Vec<AttributeValues>),
    Named(Vec<Vec<(String, AttributeValues)>>),
}

impl ValuesList {
    pub fn len(&self) -> usize {
        match self {
            ValuesList::Tuples(rows) => rows.len(),
            ValuesList::Flat(rows) => rows.len(),
            ValuesList::Named(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chainable query against one model.
///
/// Chained calls consume the builder and return a new one; clone it to keep
/// the original. Every terminal operation issues fresh searches.
#[derive(Clone)]
pub struct QueryBuilder {
    manager: LdapManager,
    chain: Vec<Filter>,
    ordering: Vec<String>,
    /// Attributes restricted by `only()`.
    only: Option<Vec<String>>,
    vlv: VlvContext,
}

impl QueryBuilder {
    /// An empty builder; it must be given at least one filter before use.
    pub fn new(manager: LdapManager) -> Self {
        let ordering = manager.meta().ordering.clone();
        let vlv = VlvContext::new(manager.capabilities().settings().vlv_context_ttl());
        Self {
            manager,
            chain: Vec::new(),
            ordering,
            only: None,
            vlv,
        }
    }

    fn meta(&self) -> &ModelMeta {
        self.manager.meta()
    }

    fn push(mut self, filter: Filter) -> Self {
        self.chain.push(filter);
        self.vlv.reset();
        self
    }

    // Chaining

    /// Add one group of AND-combined terms.
    pub fn filter<I, K>(self, terms: I) -> DirectoryResult<Self>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        Ok(match group(self.meta(), terms)? {
            Some(filter) => self.push(filter),
            None => self,
        })
    }

    /// Exclude entries matching all of `terms` at once.
    pub fn exclude<I, K>(self, terms: I) -> DirectoryResult<Self>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        Ok(match group(self.meta(), terms)? {
            Some(filter) => self.push(Filter::negate(filter)),
            None => self,
        })
    }

    /// Add a prebuilt filter, such as one parsed from a raw filter string.
    pub fn filter_expr(self, filter: Filter) -> Self {
        self.push(filter)
    }

    /// Exclude entries matching every one of `queries` at once.
    pub fn exclude_queries<'q, I>(self, queries: I) -> DirectoryResult<Self>
    where
        I: IntoIterator<Item = &'q QueryBuilder>,
    {
        let filters = queries
            .into_iter()
            .map(QueryBuilder::to_filter)
            .collect::<DirectoryResult<Vec<_>>>()?;
        Ok(match combine(filters) {
            Some(filter) => self.push(Filter::negate(filter)),
            None => self,
        })
    }

    /// Substring match where `*` marks the wildcard ends of `pattern`.
    pub fn wildcard(self, name: &str, pattern: &str) -> DirectoryResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(self);
        }
        let value = pattern.replace('*', "");
        let attribute = self.meta().field(name)?.attribute.clone();
        let filter = if value.is_empty() {
            Filter::present(attribute)
        } else {
            match (pattern.starts_with('*'), pattern.ends_with('*')) {
                (true, true) => Filter::contains(attribute, value),
                (true, false) => Filter::ends_with(attribute, value),
                (false, true) => Filter::starts_with(attribute, value),
                (false, false) => Filter::eq(attribute, value),
            }
        };
        Ok(self.push(filter))
    }

    /// Replace the ordering; a leading `-` sorts descending.
    pub fn order_by<I, S>(mut self, names: I) -> DirectoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ordering = Vec::new();
        for name in names {
            let name = name.as_ref();
            self.meta().field(name.trim_start_matches('-'))?;
            ordering.push(name.to_string());
        }
        self.ordering = ordering;
        self.vlv.reset();
        Ok(self)
    }

    /// Fetch only these fields (the primary key is always included).
    pub fn only<I, S>(mut self, names: I) -> DirectoryResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let attributes = names
            .into_iter()
            .map(|name| Ok(self.meta().field(name.as_ref())?.attribute.clone()))
            .collect::<DirectoryResult<Vec<_>>>()?;
        self.only = Some(attributes);
        Ok(self)
    }

    /// The combined filter.
    pub fn to_filter(&self) -> DirectoryResult<Filter> {
        combine(self.chain.clone()).ok_or_else(|| DirectoryError::NoFilterSpecified {
            model: self.meta().name.clone(),
        })
    }

    /// The combined filter rendered as an RFC 4515 string.
    pub fn filter_string(&self) -> DirectoryResult<String> {
        Ok(self.to_filter()?.to_string())
    }

    // Request planning

    fn sort_keys(&self) -> DirectoryResult<Vec<SortKey>> {
        self.ordering
            .iter()
            .map(|name| {
                let (name, reverse) = match name.strip_prefix('-') {
                    Some(name) => (name, true),
                    None => (name.as_str(), false),
                };
                let attribute = self.meta().field(name)?.attribute.clone();
                Ok(SortKey { attribute, reverse })
            })
            .collect()
    }

    /// Sort keys for a VLV window: the ordering, or the primary key.
    fn window_sort_keys(&self) -> DirectoryResult<Vec<SortKey>> {
        let keys = self.sort_keys()?;
        if !keys.is_empty() {
            return Ok(keys);
        }
        Ok(vec![SortKey::ascending(self.meta().pk_attribute()?)])
    }

    fn with_sort_attributes(&self, mut attributes: Vec<String>) -> DirectoryResult<Vec<String>> {
        for key in self.window_sort_keys()? {
            if !attributes
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&key.attribute))
            {
                attributes.push(key.attribute);
            }
        }
        Ok(attributes)
    }

    fn fetch_attributes(&self) -> DirectoryResult<Vec<String>> {
        let attributes = match &self.only {
            Some(only) => {
                let mut attributes = vec![self.meta().pk_attribute()?.to_string()];
                for attribute in only {
                    if !attributes.iter().any(|a| a.eq_ignore_ascii_case(attribute)) {
                        attributes.push(attribute.clone());
                    }
                }
                attributes
            }
            None => self.manager.attributes(),
        };
        self.with_sort_attributes(attributes)
    }

    fn request(&self, attributes: &[String], size_limit: u32) -> DirectoryResult<SearchRequest> {
        Ok(
            SearchRequest::new(self.manager.base_dn()?, SearchScope::Subtree, self.filter_string()?)
                .with_attributes(attributes.iter().cloned())
                .with_size_limit(size_limit),
        )
    }

    fn client_sort(&self, entries: &mut [Entry], keys: &[SortKey]) {
        let meta = self.meta();
        strategy::sort_entries(entries, keys, |attribute| {
            meta.field_for_attribute(attribute)
                .is_some_and(|f| f.kind.is_numeric())
        });
    }

    /// Fetch entries in `keys` order, sorting on the client when the server
    /// cannot or will not.
    fn fetch_in(
        &self,
        session: &mut dyn DirectorySession,
        key: &str,
        request: &SearchRequest,
        keys: &[SortKey],
    ) -> DirectoryResult<Vec<Entry>> {
        if keys.is_empty() {
            return self.manager.search_in(session, key, request);
        }

        if self.manager.capabilities().supports_sorting(session, key)? {
            match strategy::sorted_search(session, request, keys) {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_fallback_eligible() => {
                    warn!(error = %e, "Server-side sorting failed, sorting on the client");
                }
                Err(e) => return Err(e),
            }
        }

        let unlimited = request.clone().with_size_limit(0);
        let mut entries = self.manager.search_in(session, key, &unlimited)?;
        self.client_sort(&mut entries, keys);
        if request.size_limit > 0 {
            entries.truncate(request.size_limit as usize);
        }
        Ok(entries)
    }

    fn fetch(&self, attributes: &[String], size_limit: u32) -> DirectoryResult<Vec<Entry>> {
        let request = self.request(attributes, size_limit)?;
        let keys = self.sort_keys()?;
        self.manager.with_connection(Role::Read, |session, key| {
            self.fetch_in(session, key, &request, &keys)
        })
    }

    /// Entries `[start, stop)` through VLV windows, plus the server's count.
    fn vlv_range(
        &self,
        session: &mut dyn DirectorySession,
        request: &SearchRequest,
        keys: &[SortKey],
        start: Option<isize>,
        stop: Option<isize>,
    ) -> DirectoryResult<(Vec<Entry>, Option<usize>)> {
        let negative = start.is_some_and(|s| s < 0) || stop.map_or(true, |s| s < 0);
        let (start, stop, count) = if negative {
            let probe = strategy::vlv_search(session, request, keys, vlv_window(0, 1)?, &self.vlv)?;
            let len = probe.content_count as usize;
            (
                resolve_bound(start, 0, len),
                resolve_bound(stop, len, len),
                Some(len),
            )
        } else {
            (
                start.map_or(0, isize::unsigned_abs),
                stop.map_or(0, isize::unsigned_abs),
                None,
            )
        };
        if stop <= start {
            return Ok((Vec::new(), count));
        }

        let page = strategy::vlv_search(session, request, keys, vlv_window(start, stop)?, &self.vlv)?;
        Ok((page.entries, Some(page.content_count as usize)))
    }

    /// Arbitrary slice through VLV, or a full fetch sliced locally.
    fn windowed(
        &self,
        attributes: &[String],
        start: Option<isize>,
        stop: Option<isize>,
    ) -> DirectoryResult<(Vec<Entry>, Option<usize>)> {
        let request = self.request(attributes, 0)?;
        let keys = self.window_sort_keys()?;

        self.manager.with_connection(Role::Read, |session, key| {
            if self.manager.capabilities().supports_vlv(session, key)? {
                match self.vlv_range(session, &request, &keys, start, stop) {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_fallback_eligible() => {
                        warn!(error = %e, "Virtual list view failed, falling back to a full search");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                debug!("Virtual list view unavailable, slicing on the client");
            }
            let entries = self.fetch_in(session, key, &request, &keys)?;
            Ok((slice_entries(entries, start, stop), None))
        })
    }

    fn slice_with_count(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
    ) -> DirectoryResult<(Vec<Entry>, Option<usize>)> {
        let attributes = self.fetch_attributes()?;
        match (start.unwrap_or(0), stop) {
            (0, None) => Ok((self.fetch(&attributes, 0)?, None)),
            (0, Some(0)) => Ok((Vec::new(), None)),
            (0, Some(stop)) if stop > 0 => {
                let limit = u32::try_from(stop).unwrap_or(u32::MAX);
                Ok((self.fetch(&attributes, limit)?, None))
            }
            (start, Some(stop)) if start > 0 && stop >= 0 && stop <= start => Ok((Vec::new(), None)),
            _ => self.windowed(&attributes, start, stop),
        }
    }

    // Terminal operations

    /// Every matching entry, in order.
    pub fn all(&self) -> DirectoryResult<Vec<Entry>> {
        self.slice(None, None)
    }

    /// Lazy iterator; each call re-issues the search on first use.
    pub fn iter(&self) -> QueryIter {
        QueryIter {
            builder: self.clone(),
            entries: None,
            done: false,
        }
    }

    /// Entries `[start:stop]` with Python slice semantics.
    ///
    /// Windows past the end of the result set are clamped by the server.
    pub fn slice(&self, start: Option<isize>, stop: Option<isize>) -> DirectoryResult<Vec<Entry>> {
        Ok(self.slice_with_count(start, stop)?.0)
    }

    /// Entry at `index`; negative indexes count from the end.
    pub fn nth(&self, index: isize) -> DirectoryResult<Entry> {
        let out_of_range = || DirectoryError::IndexOutOfRange {
            model: self.meta().name.clone(),
            index,
        };
        let stop = if index == -1 {
            None
        } else {
            Some(index.checked_add(1).ok_or_else(out_of_range)?)
        };
        let (entries, count) = self.slice_with_count(Some(index), stop)?;
        let in_range = count.map_or(true, |count| {
            if index < 0 {
                index.unsigned_abs() <= count
            } else {
                index.unsigned_abs() < count
            }
        });
        match entries.into_iter().next() {
            Some(entry) if in_range => Ok(entry),
            _ => Err(out_of_range()),
        }
    }

    /// Number of matching entries.
    pub fn count(&self) -> DirectoryResult<usize> {
        let pk = self.meta().pk_attribute()?.to_string();
        let request = self.request(&[pk], 0)?;
        self.manager.with_connection(Role::Read, |session, key| {
            Ok(self.manager.search_in(session, key, &request)?.len())
        })
    }

    /// Whether anything matches.
    pub fn exists(&self) -> DirectoryResult<bool> {
        let pk = self.meta().pk_attribute()?.to_string();
        let request = self.request(&[pk], 1)?;
        self.manager.with_connection(Role::Read, |session, _| {
            Ok(!strategy::plain_search(session, &request)?.is_empty())
        })
    }

    /// The single entry matching this query and `terms`.
    pub fn get<I, K>(&self, terms: I) -> DirectoryResult<Entry>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        let query = self.clone().filter(terms)?;
        let mut entries = query.fetch(&query.fetch_attributes()?, 0)?;
        match entries.len() {
            1 => entries.pop().ok_or_else(|| DirectoryError::DoesNotExist {
                model: self.meta().name.clone(),
            }),
            0 => Err(DirectoryError::DoesNotExist {
                model: self.meta().name.clone(),
            }),
            count => Err(DirectoryError::MultipleObjectsReturned {
                model: self.meta().name.clone(),
                count,
            }),
        }
    }

    /// Like [`get`](Self::get), with `None` when nothing matches.
    pub fn get_or_none<I, K>(&self, terms: I) -> DirectoryResult<Option<Entry>>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        match self.get(terms) {
            Ok(entry) => Ok(Some(entry)),
            Err(DirectoryError::DoesNotExist { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// First entry in order.
    pub fn first(&self) -> DirectoryResult<Entry> {
        self.first_or_none()?
            .ok_or_else(|| DirectoryError::DoesNotExist {
                model: self.meta().name.clone(),
            })
    }

    pub fn first_or_none(&self) -> DirectoryResult<Option<Entry>> {
        Ok(self.slice(None, Some(1))?.into_iter().next())
    }

    fn projection<I, S>(&self, names: I, operation: &str) -> DirectoryResult<Vec<FieldSpec>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.only.is_some() {
            return Err(DirectoryError::usage(format!(
                "Don't use .only() with .{operation}()"
            )));
        }
        let fields = names
            .into_iter()
            .map(|name| self.meta().field(name.as_ref()).cloned())
            .collect::<DirectoryResult<Vec<_>>>()?;
        if fields.is_empty() {
            return Ok(self.meta().fields.clone());
        }
        Ok(fields)
    }

    fn fetch_fields(&self, fields: &[FieldSpec]) -> DirectoryResult<Vec<Entry>> {
        let attributes = self.with_sort_attributes(fields.iter().map(|f| f.attribute.clone()).collect())?;
        self.fetch(&attributes, 0)
    }

    /// One map of field name to values per entry.
    pub fn values<I, S>(&self, names: I) -> DirectoryResult<Vec<Attributes>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = self.projection(names, "values")?;
        let entries = self.fetch_fields(&fields)?;
        Ok(entries
            .iter()
            .map(|entry| {
                fields
                    .iter()
                    .map(|f| (f.name.clone(), entry.get(&f.attribute).cloned().unwrap_or_default()))
                    .collect::<BTreeMap<_, _>>()
            })
            .collect())
    }

    /// Field values per entry, shaped by `mode`.
    pub fn values_list<I, S>(&self, names: I, mode: ValuesListMode) -> DirectoryResult<ValuesList>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields = self.projection(names, "values_list")?;
        if mode == ValuesListMode::Flat && fields.len() > 1 {
            return Err(DirectoryError::usage(
                "Cannot use flat=True when asking for more than one field",
            ));
        }
        let entries = self.fetch_fields(&fields)?;
        let values = |entry: &Entry, field: &FieldSpec| -> AttributeValues {
            entry.get(&field.attribute).cloned().unwrap_or_default()
        };

        Ok(match mode {
            ValuesListMode::Tuples => ValuesList::Tuples(
                entries
                    .iter()
                    .map(|e| fields.iter().map(|f| values(e, f)).collect())
                    .collect(),
            ),
            ValuesListMode::Flat => ValuesList::Flat(
                entries
                    .iter()
                    .map(|e| fields.first().map(|f| values(e, f)).unwrap_or_default())
                    .collect(),
            ),
            ValuesListMode::Named => ValuesList::Named(
                entries
                    .iter()
                    .map(|e| fields.iter().map(|f| (f.name.clone(), values(e, f))).collect())
                    .collect(),
            ),
        })
    }

    /// Apply `changes` to every matching entry, returning how many matched.
    pub fn update<I, K>(&self, changes: I) -> DirectoryResult<usize>
    where
        I: IntoIterator<Item = (K, TermValue)>,
        K: AsRef<str>,
    {
        let changes = changes
            .into_iter()
            .map(|(name, value)| {
                let attribute = self.meta().field(name.as_ref())?.attribute.clone();
                Ok((attribute, value.to_values()))
            })
            .collect::<DirectoryResult<Vec<_>>>()?;

        let entries = self.fetch(&self.with_sort_attributes(self.manager.attributes())?, 0)?;

        self.manager.with_connection(Role::Write, |session, _| {
            for entry in &entries {
                let mut new = entry.attrs.clone();
                for (attribute, values) in &changes {
                    new.retain(|k, _| !k.eq_ignore_ascii_case(attribute));
                    new.insert(attribute.clone(), values.clone());
                }
                self.manager
                    .modify_in(session, &entry.dn, &new, Some(&entry.attrs))?;
            }
            Ok(entries.len())
        })
    }

    /// Delete the single matching entry.
    pub fn delete(&self) -> DirectoryResult<()> {
        let entry = self.get(crate::terms!())?;
        self.manager.delete_dn(&entry.dn)
    }

    /// One page of results through the paged results control.
    pub fn page(&self, page_size: u32, cookie: &[u8]) -> DirectoryResult<PagedResultSet> {
        self.manager
            .search_page(&self.filter_string()?, &self.fetch_attributes()?, page_size, cookie)
    }
}

impl BitAnd for QueryBuilder {
    type Output = QueryBuilder;

    fn bitand(mut self, rhs: QueryBuilder) -> QueryBuilder {
        for filter in rhs.chain {
            if !self.chain.contains(&filter) {
                self.chain.push(filter);
            }
        }
        self.vlv.reset();
        self
    }
}

impl BitOr for QueryBuilder {
    type Output = QueryBuilder;

    fn bitor(mut self, rhs: QueryBuilder) -> QueryBuilder {
        let left = combine(std::mem::take(&mut self.chain));
        let right = combine(rhs.chain);
        self.chain = match (left, right) {
            (Some(left), Some(right)) => vec![Filter::or(vec![left, right])],
            (Some(only), None) | (None, Some(only)) => vec![only],
            (None, None) => Vec::new(),
        };
        self.vlv.reset();
        self
    }
}

impl fmt::Display for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_filter() {
            Ok(filter) => write!(f, "{filter}"),
            Err(_) => Ok(()),
        }
    }
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("model", &self.meta().name)
            .field("chain", &self.chain)
            .field("ordering", &self.ordering)
            .field("only", &self.only)
            .finish()
    }
}

/// Lazy iterator over a query's results.
pub struct QueryIter {
    builder: QueryBuilder,
    entries: Option<std::vec::IntoIter<Entry>>,
    done: bool,
}

impl Iterator for QueryIter {
    type Item = DirectoryResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.entries.is_none() {
            match self.builder.all() {
                Ok(entries) => self.entries = Some(entries.into_iter()),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.entries.as_mut().and_then(Iterator::next).map(Ok)
    }
}

impl<'a> IntoIterator for &'a QueryBuilder {
    type Item = DirectoryResult<Entry>;
    type IntoIter = QueryIter;

    fn into_iter(self) -> QueryIter {
        self.iter()
    }
}
