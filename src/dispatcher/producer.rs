//! The background producer. `Dispatcher::start` absorbs any already
//! partially-labeled items from the store (`fillPartial`) synchronously
//! before returning; this module's `run_producer` then loops in the
//! background, refilling `unannotated` from fresh store records once it
//! drops below the low-water mark (`fillUnannotated`), until the source is
//! exhausted or `stop()` is called, per `spec.md` §4.3/§5.

use std::time::Duration;

use crate::item::Item;
use crate::store::{Query, Sort, SortOrder};

use super::Dispatcher;

const SEARCH_PAGE_SIZE: usize = 50;
const SCAN_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

impl Dispatcher {
    /// Runs for the lifetime of the dispatcher; returns once `stop()` has
    /// been called, or once the source is exhausted (`spec.md` §4.3: "If it
    /// returned zero items and unannotated is still empty, set
    /// running=false, broadcast, and exit").
    pub(super) async fn run_producer(&self) {
        loop {
            if !self.is_running().await {
                return;
            }

            let below_low_water = {
                let state = self.state.lock().await;
                state.unannotated.len() < self.config.low_water()
            };

            if !below_low_water {
                self.producer_notify.notified().await;
                continue;
            }

            let fetched = self.fill_unannotated_with_backoff().await;
            let still_empty = self.state.lock().await.unannotated.is_empty();

            if fetched == 0 && still_empty {
                {
                    let mut state = self.state.lock().await;
                    state.running = false;
                }
                tracing::info!(name = %self.config.name, "unannotated source exhausted, producer stopping");
                self.consumer_notify.notify_waiters();
                self.producer_notify.notify_waiters();
                return;
            }

            self.consumer_notify.notify_waiters();

            if fetched == 0 {
                // Below low-water but not empty, and the store had nothing
                // new this pass: avoid a hot loop until a consumer signals
                // again or the poll interval elapses.
                let notified = self.producer_notify.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
            }
        }
    }

    /// Absorb items left partially-annotated by a previous process (the
    /// Python original's `__fillPartiallyAnnotatedItems`): anything matching
    /// this task that already carries at least one label, is below the
    /// required replication factor, and has not been invalidated. Called
    /// synchronously from `Dispatcher::start` before any consumer can run.
    pub(super) async fn fill_partial_with_backoff(&self) {
        let query = self.partial_query();
        loop {
            if !self.is_running().await {
                return;
            }
            match self.store.scan(&self.config.index, &self.config.annotation_type, &query).await {
                Ok(records) => {
                    self.absorb_partial_records(records).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(name = %self.config.name, error = %e, "fillPartial scan failed, retrying");
                    tokio::time::sleep(SCAN_RETRY_BACKOFF).await;
                }
            }
        }
    }

    async fn absorb_partial_records(&self, records: Vec<(String, serde_json::Value)>) {
        let mut state = self.state.lock().await;
        for (id, record) in records {
            if state.items.contains_key(&id) {
                continue;
            }
            match Item::from_record(id.clone(), &record) {
                Ok(item) => {
                    let slots = self.config.num_annotations_per_item.saturating_sub(item.valid_count);
                    state.items.insert(id.clone(), item);
                    for _ in 0..slots.max(1) {
                        state.partial.push_back(id.clone());
                    }
                }
                Err(e) => {
                    tracing::error!(id, error = %e, "skipping malformed partial item record");
                }
            }
        }
    }

    /// Fetch a page of brand-new (never labeled) items for this task and add
    /// them to `unannotated`, one copy per item (replication slots are added
    /// lazily when the item transitions into `partial` on first allocation).
    ///
    /// Returns the number of rows the store handed back. `spec.md` §4.3/§4.4
    /// makes this the exhaustion signal: "When the search returns zero rows,
    /// the producer signals the exhaustion condition" — so this never rewinds
    /// `searchFrom` to paper over a genuinely-finished source; the caller
    /// decides what zero means.
    async fn fill_unannotated_with_backoff(&self) -> usize {
        let query = self.unannotated_query();
        // `SqliteStore` only special-cases a sort on `docId`; anything else
        // falls back to its internal id order, which is still stable enough
        // for cursor pagination across calls.
        let sort = Sort {
            field: "docId".to_string(),
            order: SortOrder::Asc,
        };

        loop {
            if !self.is_running().await {
                return 0;
            }

            let from = self.state.lock().await.search_from;
            match self
                .store
                .search(
                    &self.config.index,
                    &self.config.annotation_type,
                    &query,
                    from,
                    SEARCH_PAGE_SIZE,
                    Some(&sort),
                )
                .await
            {
                Ok(page) => {
                    let got = page.hits.len();
                    let mut state = self.state.lock().await;
                    for (id, record) in page.hits {
                        if state.items.contains_key(&id) {
                            continue;
                        }
                        match Item::from_record(id.clone(), &record) {
                            Ok(item) => {
                                state.items.insert(id.clone(), item);
                                state.unannotated.push_back(id);
                            }
                            Err(e) => {
                                tracing::error!(id, error = %e, "skipping malformed unannotated item record");
                            }
                        }
                    }
                    state.search_from = from + got;
                    return got;
                }
                Err(e) => {
                    tracing::warn!(name = %self.config.name, error = %e, "fillUnannotated search failed, retrying");
                    tokio::time::sleep(SCAN_RETRY_BACKOFF).await;
                }
            }
        }
    }

    fn partial_query(&self) -> Query {
        Query::Bool {
            filter: vec![
                Query::term("name", self.config.task_name.clone()),
                Query::exists("annotations"),
                Query::Range {
                    field: "numValidAnnotations".to_string(),
                    lt: Some(self.config.num_annotations_per_item as i64),
                    gt: None,
                },
            ],
            must_not: vec![Query::exists("invalid")],
        }
    }

    fn unannotated_query(&self) -> Query {
        Query::Bool {
            filter: vec![Query::term("name", self.config.task_name.clone())],
            must_not: vec![Query::exists("annotations"), Query::exists("invalid")],
        }
    }
}
