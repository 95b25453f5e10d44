//! Keyed cache of paginated feed queries.
//!
//! One entry per normalized filter set; pages accumulate under the entry
//! as the consumer scrolls. Entries are replaced (never mutated in place)
//! on invalidation so renders holding the old snapshot stay internally
//! consistent until they re-read. Concurrent `load_next` calls for the
//! same key coalesce into one remote query, and every coalesced caller
//! observes the winner's outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{CoreError, CoreResult, StoreError};
use crate::models::{PetReport, ReportFilter};
use crate::remote::{Order, Range, RemoteStore};

/// What a `load_next` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched; `n` previously-unseen items were appended.
    Appended(usize),
    /// The feed was already fully fetched; nothing was requested.
    Exhausted,
    /// The entry was invalidated while the fetch was in flight; the result
    /// was discarded. Call again to fetch against the fresh entry.
    Superseded,
}

/// Immutable view of one cache entry. Handed out behind an `Arc`;
/// invalidation swaps the entry's snapshot rather than touching this one.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub pages: Vec<Vec<PetReport>>,
    pub next_cursor: Option<u64>,
    /// Store-reported total matching the filters at last fetch.
    pub total: u64,
    /// Unix ms of the last successful fetch; `None` until the first one.
    pub last_fetched_at: Option<i64>,
}

impl FeedSnapshot {
    fn empty() -> Self {
        Self {
            pages: Vec::new(),
            next_cursor: None,
            total: 0,
            last_fetched_at: None,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &PetReport> {
        self.pages.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    fn is_exhausted(&self) -> bool {
        self.last_fetched_at.is_some() && self.next_cursor.is_none()
    }
}

type LoadResult = Result<LoadOutcome, StoreError>;

struct Entry {
    snapshot: Arc<FeedSnapshot>,
    /// Bumped on invalidation; in-flight fetches compare against it and
    /// discard stale results.
    generation: u64,
    in_flight: Option<watch::Receiver<Option<LoadResult>>>,
    refs: usize,
}

impl Entry {
    fn new() -> Self {
        Self {
            snapshot: Arc::new(FeedSnapshot::empty()),
            generation: 0,
            in_flight: None,
            refs: 0,
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.snapshot = Arc::new(FeedSnapshot::empty());
        // A fresh fetch may now start; the superseded one cleans up after
        // itself via the generation check.
        self.in_flight = None;
    }
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    table: &'static str,
    page_size: u64,
    entries: Mutex<HashMap<ReportFilter, Entry>>,
}

#[derive(Clone)]
pub struct FeedCache {
    inner: Arc<Inner>,
}

impl FeedCache {
    pub fn new(store: Arc<dyn RemoteStore>, table: &'static str, page_size: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                table,
                page_size,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current snapshot for a key (empty snapshot if never fetched).
    pub fn snapshot(&self, filter: &ReportFilter) -> Arc<FeedSnapshot> {
        let mut entries = self.inner.entries.lock();
        entries
            .entry(filter.clone())
            .or_insert_with(Entry::new)
            .snapshot
            .clone()
    }

    /// Register a consumer for a key. Paired with `release`.
    pub fn retain(&self, filter: &ReportFilter) {
        let mut entries = self.inner.entries.lock();
        entries.entry(filter.clone()).or_insert_with(Entry::new).refs += 1;
    }

    /// Drop a consumer reference; the entry is evicted when none remain.
    pub fn release(&self, filter: &ReportFilter) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(filter) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(filter);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Drop all cached pages for one key; the next read refetches from the
    /// first page. A fetch in flight against the old generation discards
    /// its result when it lands.
    pub fn invalidate_key(&self, filter: &ReportFilter) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(filter) {
            entry.reset();
        }
    }

    /// Invalidate every key backed by `table`.
    pub fn invalidate_table(&self, table: &str) {
        if table != self.inner.table {
            return;
        }
        let mut entries = self.inner.entries.lock();
        for entry in entries.values_mut() {
            entry.reset();
        }
    }

    /// Clear everything (identity change).
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Fetch the next page for a key, coalescing with any fetch already in
    /// flight for it. Every caller observes the single fetch's outcome.
    pub async fn load_next(&self, filter: &ReportFilter) -> CoreResult<LoadOutcome> {
        let mut rx = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(filter.clone()).or_insert_with(Entry::new);

            if let Some(rx) = &entry.in_flight {
                rx.clone()
            } else {
                if entry.snapshot.is_exhausted() {
                    return Ok(LoadOutcome::Exhausted);
                }
                let cursor = entry.snapshot.next_cursor.unwrap_or(0);
                let generation = entry.generation;
                let (tx, rx) = watch::channel(None);
                entry.in_flight = Some(rx.clone());

                let inner = Arc::clone(&self.inner);
                let key = filter.clone();
                // Spawned so a caller abandoned mid-await cannot strand the
                // in-flight marker; the fetch always runs to completion.
                tokio::spawn(async move {
                    let result = inner.fetch_and_apply(&key, cursor, generation).await;
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        loop {
            let settled = rx.borrow_and_update().clone();
            if let Some(result) = settled {
                return result.map_err(CoreError::from);
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a result; treat as superseded.
                return Ok(LoadOutcome::Superseded);
            }
        }
    }
}

impl Inner {
    async fn fetch_and_apply(
        self: Arc<Self>,
        key: &ReportFilter,
        cursor: u64,
        generation: u64,
    ) -> LoadResult {
        let result = self.fetch_page(key, cursor).await;

        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            // Evicted while in flight; nothing to apply.
            return Ok(LoadOutcome::Superseded);
        };
        if entry.generation == generation {
            entry.in_flight = None;
        }

        let (rows, total) = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(table = self.table, "page fetch failed: {e}");
                return Err(e);
            }
        };

        if entry.generation != generation {
            tracing::debug!(table = self.table, "discarding stale page fetch");
            return Ok(LoadOutcome::Superseded);
        }

        let fetched_after = cursor + rows.len() as u64;
        let next_cursor = if rows.is_empty() || fetched_after >= total {
            None
        } else if (rows.len() as u64) < self.page_size {
            // Store claims more rows than it returned. Treat as exhausted
            // rather than chasing the remainder forever.
            tracing::warn!(
                table = self.table,
                returned = rows.len(),
                total,
                "short page with more claimed available; treating as exhausted"
            );
            None
        } else {
            Some(fetched_after)
        };

        let seen: HashSet<&str> = entry.snapshot.items().map(|r| r.id.as_str()).collect();
        let page: Vec<PetReport> = rows
            .iter()
            .filter_map(PetReport::from_row)
            .filter(|r| !seen.contains(r.id.as_str()))
            .collect();
        let appended = page.len();
        drop(seen);

        let mut pages = entry.snapshot.pages.clone();
        if !page.is_empty() {
            pages.push(page);
        }
        entry.snapshot = Arc::new(FeedSnapshot {
            pages,
            next_cursor,
            total,
            last_fetched_at: Some(Utc::now().timestamp_millis()),
        });

        if rows.is_empty() {
            Ok(LoadOutcome::Exhausted)
        } else {
            Ok(LoadOutcome::Appended(appended))
        }
    }

    /// One remote page read, retrying a transient failure once.
    async fn fetch_page(
        &self,
        key: &ReportFilter,
        cursor: u64,
    ) -> Result<(Vec<serde_json::Value>, u64), StoreError> {
        let filters = key.to_store_filters();
        let order = Order::desc("created_at");
        let range = Range::new(cursor, self.page_size);

        match self.store.query(self.table, &filters, order, range).await {
            Ok(page) => Ok(page),
            Err(e) if e.is_transient() => {
                tracing::debug!(table = self.table, "transient page fetch, retrying once: {e}");
                self.store.query(self.table, &filters, order, range).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportStatus, Species};
    use crate::remote::{tables, ChangeEvent, Filter, MemoryStore, QueryResult};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use serde_json::json;
    use std::time::Duration;

    async fn seed_reports(store: &MemoryStore, n: usize, status: &str) {
        for i in 0..n {
            store
                .insert(
                    tables::REPORTS,
                    json!({
                        "id": format!("{status}-{i}"),
                        "status": status,
                        "species": "dog",
                        "reporter_id": "alice",
                        "created_at": 1_000 + i as i64,
                    }),
                )
                .await
                .unwrap();
        }
    }

    fn cache(store: &Arc<MemoryStore>, page_size: u64) -> FeedCache {
        FeedCache::new(
            store.clone() as Arc<dyn RemoteStore>,
            tables::REPORTS,
            page_size,
        )
    }

    #[tokio::test]
    async fn pagination_is_complete_and_duplicate_free() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 30, "lost").await;
        seed_reports(&store, 4, "found").await;

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        let mut outcomes = Vec::new();
        loop {
            match cache.load_next(&filter).await.unwrap() {
                LoadOutcome::Exhausted => break,
                outcome => outcomes.push(outcome),
            }
        }
        assert_eq!(
            outcomes,
            vec![
                LoadOutcome::Appended(12),
                LoadOutcome::Appended(12),
                LoadOutcome::Appended(6),
            ]
        );

        let snapshot = cache.snapshot(&filter);
        assert_eq!(snapshot.total, 30);
        assert_eq!(snapshot.len(), 30);
        assert!(!snapshot.has_more());

        let ids: HashSet<String> = snapshot.items().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 30, "no duplicate ids across pages");

        // Descending creation order, no gaps across page boundaries.
        let stamps: Vec<i64> = snapshot.items().map(|r| r.created_at).collect();
        let mut expected = stamps.clone();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(stamps, expected);
    }

    #[tokio::test]
    async fn concurrent_load_next_coalesces_to_one_query() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 12, "lost").await;
        store.set_query_delay(Duration::from_millis(50));

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let filter = filter.clone();
            tasks.push(tokio::spawn(
                async move { cache.load_next(&filter).await },
            ));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), LoadOutcome::Appended(12));
        }

        assert_eq!(store.query_count(), 1, "coalesced into a single fetch");
        assert_eq!(cache.snapshot(&filter).len(), 12, "single page appended");
    }

    #[tokio::test]
    async fn invalidate_discards_in_flight_result() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 5, "lost").await;

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        store.set_query_delay(Duration::from_millis(60));
        let loading = {
            let cache = cache.clone();
            let filter = filter.clone();
            tokio::spawn(async move { cache.load_next(&filter).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_key(&filter);

        assert_eq!(loading.await.unwrap().unwrap(), LoadOutcome::Superseded);
        assert!(cache.snapshot(&filter).is_empty(), "stale page not applied");

        // Fresh fetch against the new generation succeeds.
        store.set_query_delay(Duration::ZERO);
        assert_eq!(
            cache.load_next(&filter).await.unwrap(),
            LoadOutcome::Appended(5)
        );
        assert_eq!(cache.snapshot(&filter).len(), 5);
    }

    #[tokio::test]
    async fn invalidation_preserves_old_snapshot_for_holders() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 3, "lost").await;

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);
        cache.load_next(&filter).await.unwrap();

        let held = cache.snapshot(&filter);
        cache.invalidate_table(tables::REPORTS);

        // The held snapshot is untouched; the entry's current one is fresh.
        assert_eq!(held.len(), 3);
        assert!(cache.snapshot(&filter).is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_corrupts_nothing_and_allows_retry() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 12, "lost").await;

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        // First attempt and its automatic retry both fail.
        store.fail_next_queries(2);
        let err = cache.load_next(&filter).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(StoreError::Transient(_))));
        assert!(cache.snapshot(&filter).is_empty(), "no partial append");

        // Loading flag was cleared; a retry succeeds.
        assert_eq!(
            cache.load_next(&filter).await.unwrap(),
            LoadOutcome::Appended(12)
        );
    }

    #[tokio::test]
    async fn transient_read_is_retried_once() {
        let store = Arc::new(MemoryStore::new());
        seed_reports(&store, 3, "lost").await;

        let cache = cache(&store, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        store.fail_next_queries(1);
        assert_eq!(
            cache.load_next(&filter).await.unwrap(),
            LoadOutcome::Appended(3)
        );
        assert_eq!(store.query_count(), 2, "one failure, one retry");
    }

    #[tokio::test]
    async fn release_to_zero_evicts_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store, 12);
        let filter = ReportFilter::default().species(Species::Cat);

        cache.retain(&filter);
        cache.retain(&filter);
        assert_eq!(cache.entry_count(), 1);

        cache.release(&filter);
        assert_eq!(cache.entry_count(), 1);
        cache.release(&filter);
        assert_eq!(cache.entry_count(), 0);
    }

    /// Wrapper that reports more rows available than it returns, simulating
    /// the store inconsistency behind the partial-data rule.
    struct ShortPageStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl RemoteStore for ShortPageStore {
        async fn query(
            &self,
            table: &str,
            filters: &[Filter],
            order: Order,
            range: Range,
        ) -> Result<QueryResult, StoreError> {
            let (rows, total) = self.inner.query(table, filters, order, range).await?;
            Ok((rows, total + 10))
        }

        async fn insert(
            &self,
            table: &str,
            row: serde_json::Value,
        ) -> Result<serde_json::Value, StoreError> {
            self.inner.insert(table, row).await
        }

        async fn update(
            &self,
            table: &str,
            id: &str,
            patch: serde_json::Value,
        ) -> Result<(), StoreError> {
            self.inner.update(table, id, patch).await
        }

        async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
            self.inner.delete(table, id).await
        }

        fn subscribe_changes(&self, table: &str) -> BoxStream<'static, ChangeEvent> {
            self.inner.subscribe_changes(table)
        }
    }

    #[tokio::test]
    async fn short_page_with_more_claimed_is_exhausted() {
        let inner = Arc::new(MemoryStore::new());
        seed_reports(&inner, 5, "lost").await;

        let store: Arc<dyn RemoteStore> = Arc::new(ShortPageStore { inner });
        let cache = FeedCache::new(store, tables::REPORTS, 12);
        let filter = ReportFilter::default().status(ReportStatus::Lost);

        assert_eq!(
            cache.load_next(&filter).await.unwrap(),
            LoadOutcome::Appended(5)
        );
        let snapshot = cache.snapshot(&filter);
        assert!(
            !snapshot.has_more(),
            "short page must not produce an endless cursor"
        );
        assert_eq!(
            cache.load_next(&filter).await.unwrap(),
            LoadOutcome::Exhausted
        );
    }
}
