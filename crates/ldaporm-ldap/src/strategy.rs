//! Retrieval strategies
//!
//! Plain searches, cookie-paged searches and virtual list view windows, plus
//! the client-side sort used whenever the server cannot sort for us. Every
//! strategy takes a prepared [`SearchRequest`] and only adds its controls.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ldaporm_core::error::{DirectoryError, DirectoryResult, ResultCode};
use ldaporm_core::operation::{
    Entry, SearchControl, SearchRequest, SortKey, VlvRequest, VlvTarget,
};
use ldaporm_core::traits::DirectorySession;

use crate::controls;

/// One page of a cookie-paged search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedResultSet {
    pub entries: Vec<Entry>,
    /// Continuation cookie; empty when the result set is exhausted.
    pub cookie: Vec<u8>,
    pub has_more: bool,
}

impl PagedResultSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Single round trip, optionally size limited.
pub fn plain_search(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
) -> DirectoryResult<Vec<Entry>> {
    Ok(session.search(request)?.entries)
}

/// Fetch one page, continuing from `cookie` (empty for the first page).
pub fn search_page(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
    page_size: u32,
    cookie: &[u8],
) -> DirectoryResult<PagedResultSet> {
    let request = request.clone().with_control(SearchControl::Paged {
        size: page_size,
        cookie: cookie.to_vec(),
    });
    let response = session.search(&request)?;
    let cookie = response.paged_cookie().unwrap_or_default().to_vec();
    Ok(PagedResultSet {
        has_more: !cookie.is_empty(),
        cookie,
        entries: response.entries,
    })
}

/// Walk every page until the server hands back an empty cookie.
pub fn paged_search(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
    page_size: u32,
) -> DirectoryResult<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut cookie = Vec::new();
    let mut pages = 0usize;
    loop {
        let page = search_page(session, request, page_size, &cookie)?;
        pages += 1;
        entries.extend(page.entries);
        if !page.has_more {
            break;
        }
        cookie = page.cookie;
    }
    debug!(pages, total = entries.len(), "Paged search completed");
    Ok(entries)
}

fn check_sort_result(response_result: Option<ResultCode>) -> DirectoryResult<()> {
    match response_result {
        Some(code) if code != ResultCode::SUCCESS => Err(DirectoryError::protocol(
            code,
            "server refused to sort the result set",
        )),
        _ => Ok(()),
    }
}

/// Plain search with the server-side sort control attached.
pub fn sorted_search(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
    keys: &[SortKey],
) -> DirectoryResult<Vec<Entry>> {
    let request = request.clone().with_control(SearchControl::Sort {
        keys: keys.to_vec(),
    });
    let response = session.search(&request)?;
    check_sort_result(response.sort_result())?;
    Ok(response.entries)
}

/// Opaque VLV context id handed back by the server, with an expiry.
///
/// Cloning yields an empty context: the id belongs to one result set.
#[derive(Debug)]
pub struct VlvContext {
    ttl: Duration,
    slot: Mutex<Option<(Vec<u8>, Instant)>>,
}

impl VlvContext {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Current context id, dropping it once it has expired.
    pub fn current(&self) -> Option<Vec<u8>> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some((id, stored)) if stored.elapsed() < self.ttl => Some(id.clone()),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    pub fn store(&self, id: Option<&[u8]>) {
        *self.slot.lock() = id
            .filter(|id| !id.is_empty())
            .map(|id| (id.to_vec(), Instant::now()));
    }

    pub fn reset(&self) {
        *self.slot.lock() = None;
    }
}

impl Clone for VlvContext {
    fn clone(&self) -> Self {
        Self::new(self.ttl)
    }
}

/// Position of a VLV window over the sorted result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlvWindow {
    /// 1-based index of the target entry.
    pub offset: u32,
    pub before_count: u32,
    pub after_count: u32,
    /// Client estimate of the list size; 0 lets the server decide.
    pub content_count: u32,
}

/// Entries of one VLV window and the server's view of the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvPage {
    pub entries: Vec<Entry>,
    pub target_position: u32,
    pub content_count: u32,
}

fn vlv_round_trip(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
    keys: &[SortKey],
    window: VlvWindow,
    context_id: Option<Vec<u8>>,
) -> DirectoryResult<(VlvPage, Option<Vec<u8>>)> {
    let vlv = VlvRequest {
        before_count: window.before_count,
        after_count: window.after_count,
        target: VlvTarget::ByOffset {
            offset: window.offset,
            content_count: window.content_count,
        },
        context_id,
    };
    // Windows the control cannot carry fail here, before any round trip.
    controls::encode_sort_request(keys)?;
    controls::encode_vlv_request(&vlv)?;

    let request = request
        .clone()
        .with_control(SearchControl::Sort {
            keys: keys.to_vec(),
        })
        .with_control(SearchControl::VirtualListView(vlv));

    let response = session.search(&request)?;
    check_sort_result(response.sort_result())?;

    let Some((target_position, content_count, result, context)) = response.vlv() else {
        return Err(DirectoryError::protocol(
            ResultCode::UNAVAILABLE_CRITICAL_EXTENSION,
            "server returned no virtual list view response",
        ));
    };
    if result != ResultCode::SUCCESS {
        return Err(DirectoryError::protocol(
            result,
            "server rejected the virtual list view request",
        ));
    }
    let context = context.map(<[u8]>::to_vec);

    Ok((
        VlvPage {
            target_position,
            content_count,
            entries: response.entries,
        },
        context,
    ))
}

/// Fetch one VLV window, reusing and refreshing the context id.
///
/// When the server rejects a request that carried a context id the id is
/// assumed stale and the request is retried once without it.
pub fn vlv_search(
    session: &mut dyn DirectorySession,
    request: &SearchRequest,
    keys: &[SortKey],
    window: VlvWindow,
    context: &VlvContext,
) -> DirectoryResult<VlvPage> {
    if keys.is_empty() {
        return Err(DirectoryError::control_encoding(
            "virtual list view needs at least one sort key",
        ));
    }

    let current = context.current();
    let retry_possible = current.is_some();

    let outcome = match vlv_round_trip(session, request, keys, window, current) {
        Err(e) if retry_possible && e.is_fallback_eligible() => {
            debug!(error = %e, "Retrying VLV request without context id");
            context.reset();
            vlv_round_trip(session, request, keys, window, None)
        }
        other => other,
    };

    match outcome {
        Ok((page, id)) => {
            context.store(id.as_deref());
            debug!(
                offset = window.offset,
                target_position = page.target_position,
                content_count = page.content_count,
                returned = page.entries.len(),
                "VLV window fetched"
            );
            Ok(page)
        }
        Err(e) => {
            context.reset();
            Err(e)
        }
    }
}

fn compare_values(a: Option<&[u8]>, b: Option<&[u8]>, numeric: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if numeric {
                let parse = |v: &[u8]| std::str::from_utf8(v).ok()?.trim().parse::<i64>().ok();
                if let (Some(x), Some(y)) = (parse(a), parse(b)) {
                    return x.cmp(&y);
                }
            }
            a.cmp(b)
        }
    }
}

/// Stable multi-key sort on the first value of each key attribute.
///
/// `is_numeric` picks the attributes compared as integers. Entries missing
/// a key attribute sort before those that have it.
pub fn sort_entries<F>(entries: &mut [Entry], keys: &[SortKey], is_numeric: F)
where
    F: Fn(&str) -> bool,
{
    if keys.is_empty() {
        return;
    }
    fn first<'e>(entry: &'e Entry, key: &SortKey) -> Option<&'e [u8]> {
        entry
            .get(&key.attribute)
            .and_then(|values| values.first())
            .map(Vec::as_slice)
    }

    let numeric: Vec<bool> = keys.iter().map(|k| is_numeric(&k.attribute)).collect();
    entries.sort_by(|a, b| {
        for (key, numeric) in keys.iter().zip(&numeric) {
            let ordering = compare_values(first(a, key), first(b, key), *numeric);
            let ordering = if key.reverse {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}
