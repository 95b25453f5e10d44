//! The remote data store boundary.
//!
//! The core treats the store as a black box exposing paginated reads,
//! row writes, and per-table change streams. Rows are untyped JSON
//! objects; typed models live in `crate::models` and convert at the edge.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Table names used by the sync core.
pub mod tables {
    pub const REPORTS: &str = "reports";
    pub const CHATS: &str = "chats";
    pub const MESSAGES: &str = "messages";
    pub const NOTIFICATIONS: &str = "notifications";
}

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A push event from the store. Ephemeral; never persisted client-side.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOp,
    pub row: Value,
}

impl ChangeEvent {
    /// The row's `id` field, when present.
    pub fn row_id(&self) -> Option<&str> {
        self.row.get("id").and_then(Value::as_str)
    }
}

/// A single row predicate. Conjunction of filters is implied by the slice
/// passed to `query`.
#[derive(Debug, Clone)]
pub enum Filter {
    /// `row[field] == value`
    Eq(&'static str, Value),
    /// `row[field]` is an array containing `value`.
    Contains(&'static str, Value),
}

impl Filter {
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => row.get(*field) == Some(value),
            Filter::Contains(field, value) => row
                .get(*field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

/// Sort order for `query`.
#[derive(Debug, Clone, Copy)]
pub struct Order {
    pub field: &'static str,
    pub descending: bool,
}

impl Order {
    pub fn desc(field: &'static str) -> Self {
        Self {
            field,
            descending: true,
        }
    }

    pub fn asc(field: &'static str) -> Self {
        Self {
            field,
            descending: false,
        }
    }
}

/// Pagination window over the filtered, ordered result set.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
}

impl Range {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

/// A page of rows plus the total row count matching the filters at fetch
/// time (before the range was applied).
pub type QueryResult = (Vec<Value>, u64);

/// Read/write/subscribe contract consumed by the sync core.
///
/// Implementations assign `id`, `created_at`, and a monotonic `seq` to
/// inserted rows when absent. `update` merges shallowly, except that when
/// both the existing and patch values of a field are objects they merge one
/// level deep; per-participant read-state patches rely on this.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(
        &self,
        table: &str,
        filters: &[Filter],
        order: Order,
        range: Range,
    ) -> Result<QueryResult, StoreError>;

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError>;

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// One logical change stream per table. The adapter holds the only
    /// long-lived subscriptions; everything else fans out from there.
    fn subscribe_changes(&self, table: &str) -> BoxStream<'static, ChangeEvent>;
}
