//! # Query Handle Store
//!
//! The anti-hallucination core of the server. A WIQL or OData result set is
//! bound to an opaque `qh_…` token at query time; every bulk operation then
//! names the token instead of work-item ids, so a model can never feed the
//! server ids it made up.
//!
//! Properties the store guarantees:
//!
//! - handle ids are 128 bits of OS randomness rendered as hex; nothing is
//!   encoded in them and they cannot be predicted or forged in practice;
//! - the stored id list is deduplicated preserving query order, and the
//!   context map never contains a key outside that list;
//! - handles are immutable once stored; a new query makes a new handle;
//! - an expired handle behaves exactly like a missing one: no partial
//!   reads, no appearance in listings.
//!
//! Expiry is checked lazily on every access, and a periodic sweep
//! ([`QueryHandleStore::purge_expired`]) reclaims memory.

use crate::models::ItemContext;
use crate::selector::{self, ItemSelector};
use crate::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// How a handle's id set was produced. Affects display only; the store
/// treats all kinds identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    Flat,
    Tree,
    Analytics,
    SingleItem,
}

impl QueryKind {
    /// Map the `queryType` string from a WIQL response.
    pub fn from_wiql_type(raw: &str) -> Self {
        match raw {
            "tree" | "oneHop" => QueryKind::Tree,
            _ => QueryKind::Flat,
        }
    }
}

/// Descriptive metadata attached to a handle at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleMetadata {
    pub project: String,
    pub query_type: QueryKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_criteria: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

/// A stored query result. Immutable after creation.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    pub id: String,
    pub work_item_ids: Vec<i64>,
    pub item_context: HashMap<i64, ItemContext>,
    pub original_query: String,
    pub metadata: HandleMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QueryHandle {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Listing entry for `list-query-handles`. Deliberately omits the ids so a
/// listing can never be used to smuggle them back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleSummary {
    pub id: String,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub query_type: QueryKind,
}

/// In-memory handle store. Concurrent readers, serialized writers; nothing
/// survives a process restart, which is the intended lifecycle.
pub struct QueryHandleStore {
    inner: RwLock<HashMap<String, QueryHandle>>,
    default_ttl: Duration,
}

impl QueryHandleStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Store a query result and return the new opaque handle id.
    ///
    /// Ids are deduplicated preserving first occurrence; context entries
    /// whose key is not in the (deduplicated) id list are dropped to keep
    /// the `itemContext ⊆ workItemIds` invariant.
    pub fn store(
        &self,
        ids: Vec<i64>,
        original_query: impl Into<String>,
        metadata: HandleMetadata,
        ttl: Option<Duration>,
        item_context: HashMap<i64, ItemContext>,
    ) -> String {
        let work_item_ids = dedupe_preserving_order(ids);
        let id_set: std::collections::HashSet<i64> = work_item_ids.iter().copied().collect();
        let item_context: HashMap<i64, ItemContext> = item_context
            .into_iter()
            .filter(|(id, _)| id_set.contains(id))
            .collect();

        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let handle = QueryHandle {
            id: generate_handle_id(),
            work_item_ids,
            item_context,
            original_query: original_query.into(),
            metadata,
            created_at: now,
            expires_at: now
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1)),
        };

        let id = handle.id.clone();
        self.inner
            .write()
            .expect("handle store lock poisoned")
            .insert(id.clone(), handle);
        id
    }

    /// The stored id list, iff the handle exists and is unexpired.
    pub fn get_ids(&self, handle_id: &str) -> Result<Vec<i64>> {
        self.with_live_handle(handle_id, |handle| handle.work_item_ids.clone())
    }

    /// The full record, iff the handle exists and is unexpired. Used by the
    /// inspection tools.
    pub fn get_data(&self, handle_id: &str) -> Result<QueryHandle> {
        self.with_live_handle(handle_id, Clone::clone)
    }

    /// Resolve a selector against a live handle.
    pub fn resolve_selector(&self, handle_id: &str, sel: &ItemSelector) -> Result<Vec<i64>> {
        let handle = self.get_data(handle_id)?;
        selector::resolve(&handle, sel)
    }

    /// Summaries of all unexpired handles, newest first.
    pub fn list(&self) -> Vec<HandleSummary> {
        let now = Utc::now();
        let guard = self.inner.read().expect("handle store lock poisoned");
        let mut summaries: Vec<HandleSummary> = guard
            .values()
            .filter(|h| !h.is_expired(now))
            .map(|h| HandleSummary {
                id: h.id.clone(),
                item_count: h.work_item_ids.len(),
                created_at: h.created_at,
                expires_at: h.expires_at,
                query_type: h.metadata.query_type,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Drop expired handles; returns how many were reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.inner.write().expect("handle store lock poisoned");
        let before = guard.len();
        guard.retain(|_, h| !h.is_expired(now));
        before - guard.len()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.inner
            .read()
            .expect("handle store lock poisoned")
            .values()
            .filter(|h| !h.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_live_handle<T>(&self, handle_id: &str, f: impl FnOnce(&QueryHandle) -> T) -> Result<T> {
        let now = Utc::now();
        let guard = self.inner.read().expect("handle store lock poisoned");
        match guard.get(handle_id) {
            Some(handle) if !handle.is_expired(now) => Ok(f(handle)),
            _ => Err(Error::handle_not_found(handle_id)),
        }
    }
}

fn dedupe_preserving_order(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// `qh_` + 32 hex chars (128 bits from the OS RNG). The id encodes nothing.
fn generate_handle_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("qh_{hex}")
}

/// Random operation id for the undo journal, same construction as handle
/// ids with an `op_` prefix.
pub fn generate_operation_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("op_{hex}")
}
