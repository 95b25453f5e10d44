//! In-process reference implementation of [`RemoteStore`].
//!
//! Backs the test suite and the demo CLI. Rows are JSON objects in plain
//! vectors; change streams ride per-table broadcast channels. Fault
//! injection and operation counters exist so tests can assert coalescing,
//! retry, and fire-and-forget properties without a network.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ChangeEvent, ChangeOp, Filter, Order, QueryResult, Range, RemoteStore};
use crate::error::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct Inner {
    tables: HashMap<String, Vec<Value>>,
    channels: HashMap<String, broadcast::Sender<ChangeEvent>>,
    /// Monotonic insertion sequence, shared across tables. Used as the
    /// ordering tie-break for rows created within the same millisecond.
    seq: i64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    query_delay: Mutex<Duration>,
    query_count: AtomicUsize,
    insert_count: AtomicUsize,
    update_count: AtomicUsize,
    fail_next_queries: AtomicUsize,
    fail_next_inserts: AtomicUsize,
    fail_next_updates: AtomicUsize,
    fail_inserts_by_table: Mutex<HashMap<String, usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                channels: HashMap::new(),
                seq: 0,
            }),
            query_delay: Mutex::new(Duration::ZERO),
            query_count: AtomicUsize::new(0),
            insert_count: AtomicUsize::new(0),
            update_count: AtomicUsize::new(0),
            fail_next_queries: AtomicUsize::new(0),
            fail_next_inserts: AtomicUsize::new(0),
            fail_next_updates: AtomicUsize::new(0),
            fail_inserts_by_table: Mutex::new(HashMap::new()),
        }
    }

    // ===== Test instrumentation =====

    /// Delay applied to every `query` before touching state. Lets tests
    /// hold a fetch in flight while issuing concurrent calls.
    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock() = delay;
    }

    /// Fail the next `n` queries with a transient error.
    pub fn fail_next_queries(&self, n: usize) {
        self.fail_next_queries.store(n, AtomicOrdering::SeqCst);
    }

    /// Fail the next `n` inserts with a transient error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_next_inserts.store(n, AtomicOrdering::SeqCst);
    }

    /// Fail the next `n` inserts into `table` only.
    pub fn fail_next_inserts_in(&self, table: &str, n: usize) {
        self.fail_inserts_by_table
            .lock()
            .insert(table.to_string(), n);
    }

    /// Fail the next `n` updates with a transient error.
    pub fn fail_next_updates(&self, n: usize) {
        self.fail_next_updates.store(n, AtomicOrdering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(AtomicOrdering::SeqCst)
    }

    pub fn insert_count(&self) -> usize {
        self.insert_count.load(AtomicOrdering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.update_count.load(AtomicOrdering::SeqCst)
    }

    /// Number of rows currently in `table` (unfiltered).
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Re-publish an insert event for an existing row, simulating a
    /// reconnect replay from the change channel.
    pub fn replay_insert(&self, table: &str, id: &str) {
        let (row, sender) = {
            let mut inner = self.inner.lock();
            let row = inner
                .tables
                .get(table)
                .and_then(|rows| rows.iter().find(|r| row_id(r) == Some(id)))
                .cloned();
            (row, inner.sender(table))
        };
        if let Some(row) = row {
            let _ = sender.send(ChangeEvent {
                table: table.to_string(),
                op: ChangeOp::Insert,
                row,
            });
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

impl Inner {
    fn sender(&mut self, table: &str) -> broadcast::Sender<ChangeEvent> {
        self.channels
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .clone()
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// Total order over JSON values for sorting: numbers before strings,
/// everything else last. Sufficient for `created_at` / `seq` ordering.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Shallow merge with one level of object-merge, so read-state patches like
/// `{"last_read": {"alice": 123}}` compose instead of clobbering the map.
fn merge_patch(target: &mut Value, patch: Value) {
    let Some(patch) = patch.as_object().cloned() else {
        return;
    };
    let Some(row) = target.as_object_mut() else {
        return;
    };
    for (key, value) in patch {
        match (row.get_mut(&key), value.as_object()) {
            (Some(Value::Object(existing)), Some(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            (_, _) => {
                row.insert(key, value);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(
        &self,
        table: &str,
        filters: &[Filter],
        order: Order,
        range: Range,
    ) -> Result<QueryResult, StoreError> {
        let delay = *self.query_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.query_count.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_failure(&self.fail_next_queries) {
            return Err(StoreError::Transient("injected query failure".into()));
        }

        let inner = self.inner.lock();
        let mut rows: Vec<Value> = inner
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            let ord = cmp_values(a.get(order.field), b.get(order.field))
                .then_with(|| cmp_values(a.get("seq"), b.get("seq")));
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let total = rows.len() as u64;
        let page: Vec<Value> = rows
            .into_iter()
            .skip(range.offset as usize)
            .take(range.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, StoreError> {
        self.insert_count.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_failure(&self.fail_next_inserts) {
            return Err(StoreError::Transient("injected insert failure".into()));
        }
        if let Some(n) = self.fail_inserts_by_table.lock().get_mut(table) {
            if *n > 0 {
                *n -= 1;
                return Err(StoreError::Transient(format!(
                    "injected insert failure for {table}"
                )));
            }
        }
        let Value::Object(mut fields) = row else {
            return Err(StoreError::Invalid(format!(
                "insert into {table}: row is not an object"
            )));
        };

        let (stored, sender) = {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            fields
                .entry("id")
                .or_insert_with(|| json!(Uuid::new_v4().to_string()));
            fields
                .entry("created_at")
                .or_insert_with(|| json!(Utc::now().timestamp_millis()));
            fields.insert("seq".to_string(), json!(seq));

            let row = Value::Object(fields);
            inner
                .tables
                .entry(table.to_string())
                .or_default()
                .push(row.clone());
            (row, inner.sender(table))
        };

        let _ = sender.send(ChangeEvent {
            table: table.to_string(),
            op: ChangeOp::Insert,
            row: stored.clone(),
        });
        Ok(stored)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        self.update_count.fetch_add(1, AtomicOrdering::SeqCst);
        if Self::take_failure(&self.fail_next_updates) {
            return Err(StoreError::Transient("injected update failure".into()));
        }

        let (updated, sender) = {
            let mut inner = self.inner.lock();
            let sender = inner.sender(table);
            let row = inner
                .tables
                .get_mut(table)
                .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id)))
                .ok_or_else(|| StoreError::Invalid(format!("update {table}/{id}: no such row")))?;
            merge_patch(row, patch);
            (row.clone(), sender)
        };

        let _ = sender.send(ChangeEvent {
            table: table.to_string(),
            op: ChangeOp::Update,
            row: updated,
        });
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let (removed, sender) = {
            let mut inner = self.inner.lock();
            let sender = inner.sender(table);
            let rows = inner
                .tables
                .get_mut(table)
                .ok_or_else(|| StoreError::Invalid(format!("delete {table}/{id}: no such table")))?;
            let pos = rows
                .iter()
                .position(|r| row_id(r) == Some(id))
                .ok_or_else(|| StoreError::Invalid(format!("delete {table}/{id}: no such row")))?;
            (rows.remove(pos), sender)
        };

        let _ = sender.send(ChangeEvent {
            table: table.to_string(),
            op: ChangeOp::Delete,
            row: removed,
        });
        Ok(())
    }

    fn subscribe_changes(&self, table: &str) -> BoxStream<'static, ChangeEvent> {
        let mut rx = self.inner.lock().sender(table).subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    // A lagged receiver missed events; the polling backstop
                    // covers the gap, so just keep consuming.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("change stream lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
