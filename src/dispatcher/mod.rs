//! The Annotation Dispatcher: one instance per annotation task. Owns two
//! in-memory queues (`unannotated`, `partial`) plus a holding table keyed by
//! annotator id, runs a background producer that refills `unannotated` from
//! the store, and serves `getItem`/`annotate`/`skip`/`invalidate` requests
//! from callers (`spec.md` §4.3).

mod producer;
mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::item::{Item, LabelValue};
use crate::store::{with_retry, StoreAdapter, StoreError};
use state::State;

/// Configuration per Dispatcher instance (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identifies the dispatcher; used as the log prefix.
    pub name: String,
    /// Store index name.
    pub index: String,
    /// Store type name for item records.
    pub annotation_type: String,
    /// Used in query filters; must match the `name` field on item records.
    pub task_name: String,
    /// `N`: required label count per item.
    pub num_annotations_per_item: u32,
    /// High-water mark for the unannotated queue. Low-water is half this.
    pub num_unannotated_items: usize,
}

impl DispatcherConfig {
    pub fn low_water(&self) -> usize {
        self.num_unannotated_items / 2
    }
}

/// Errors the Dispatcher surfaces out of its public operations. Per `spec.md`
/// §7, the Dispatcher never panics or throws out of `getItem`/`annotate`/
/// `skip`/`invalidate`: a `HoldingInconsistency` is recovered locally (logged,
/// then a fresh item is allocated), and only a persistence failure that
/// survived the retry policy reaches the caller.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("failed to persist annotation: {0}")]
    Store(#[from] StoreError),
}

/// The Annotation Dispatcher. Construct with [`Dispatcher::new`], then call
/// [`Dispatcher::start`] to launch the background producer — kept separate
/// so no background task can observe a partially-initialized instance
/// (`spec.md` §9).
pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn StoreAdapter>,
    state: Mutex<State>,
    consumer_notify: Notify,
    producer_notify: Notify,
}

impl Dispatcher {
    /// Build a new, unstarted Dispatcher. No background task runs and no
    /// store I/O happens until [`Dispatcher::start`] is called.
    pub fn new(config: DispatcherConfig, store: Arc<dyn StoreAdapter>) -> Arc<Self> {
        Arc::new(Dispatcher {
            config,
            store,
            state: Mutex::new(State::new()),
            consumer_notify: Notify::new(),
            producer_notify: Notify::new(),
        })
    }

    /// Install the store schema, mark the dispatcher running, absorb any
    /// already-partially-labeled items (`fillPartial`), and spawn the
    /// background producer task.
    ///
    /// `fillPartial` runs to completion here, before returning, per
    /// `spec.md` §4.3 ("This must complete before any consumer is served.");
    /// only the ongoing `fillUnannotated` refill loop moves to the
    /// background task.
    pub async fn start(self: Arc<Self>) -> Arc<Self> {
        if let Err(e) = self
            .store
            .ensure_schema(&self.config.index, &self.config.annotation_type)
            .await
        {
            tracing::error!(name = %self.config.name, error = %e, "failed to ensure store schema");
        }
        {
            let mut state = self.state.lock().await;
            state.running = true;
        }
        self.fill_partial_with_backoff().await;
        let producer_self = Arc::clone(&self);
        tokio::spawn(async move {
            producer_self.run_producer().await;
        });
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    fn check_holding(state: &State, annotator_id: &str, item_id: &str) -> bool {
        let holds_via_map = state
            .holding
            .get(annotator_id)
            .map(|id| id == item_id)
            .unwrap_or(false);
        let item_has_holder = state
            .items
            .get(item_id)
            .map(|item| item.holders.contains_key(annotator_id))
            .unwrap_or(false);
        holds_via_map && item_has_holder
    }

    /// Release whatever the annotator is currently holding (if anything)
    /// back into `partial`, without touching its labels. Used when a hold
    /// check fails (`spec.md` scenario 5: "releases A's hold on X; X goes
    /// back to partial").
    async fn release_stale_hold(&self, annotator_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(item_id) = state.holding.remove(annotator_id) {
            let still_open = if let Some(item) = state.items.get_mut(&item_id) {
                item.holders.remove(annotator_id);
                !item.is_invalid() && !item.is_complete(self.config.num_annotations_per_item)
            } else {
                false
            };
            if still_open {
                state.partial.push_back(item_id);
            }
        }
    }

    /// `getItem(annotatorId)`: idempotent on repeated calls while a hold is
    /// outstanding, otherwise allocates the next item.
    pub async fn get_item(&self, annotator_id: &str) -> Option<Item> {
        {
            let mut state = self.state.lock().await;
            if let Some(item_id) = state.holding.get(annotator_id).cloned() {
                let now = Utc::now();
                if let Some(item) = state.items.get_mut(&item_id) {
                    item.holders.insert(annotator_id.to_string(), now);
                    return Some(item.clone());
                }
            }
        }
        self.next_item(annotator_id).await
    }

    /// The allocation rule (`spec.md` §4.3 "nextItem"). Drains `partial`
    /// strictly FIFO before ever touching `unannotated`; blocks only while
    /// `unannotated` is empty and the dispatcher is still running.
    async fn next_item(&self, annotator_id: &str) -> Option<Item> {
        loop {
            let mut state = self.state.lock().await;

            if let Some(pos) = state.partial.iter().position(|id| {
                state
                    .items
                    .get(id)
                    .map(|item| !item.has_label_from(annotator_id) && !item.is_invalid())
                    .unwrap_or(false)
            }) {
                let item_id = state.partial.remove(pos).unwrap();
                let now = Utc::now();
                state.holding.insert(annotator_id.to_string(), item_id.clone());
                let item = state.items.get_mut(&item_id).unwrap();
                item.holders.insert(annotator_id.to_string(), now);
                return Some(item.clone());
            }

            if !state.unannotated.is_empty() {
                let item_id = state.unannotated.pop_front().unwrap();
                let below_low_water = state.unannotated.len() < self.config.low_water();
                let now = Utc::now();
                state.holding.insert(annotator_id.to_string(), item_id.clone());
                let n = self.config.num_annotations_per_item;
                let item = state.items.get_mut(&item_id).unwrap();
                item.holders.insert(annotator_id.to_string(), now);
                let snapshot = item.clone();
                for _ in 0..n.saturating_sub(1) {
                    state.partial.push_back(item_id.clone());
                }
                drop(state);
                if below_low_water {
                    self.producer_notify.notify_one();
                }
                return Some(snapshot);
            }

            if !state.running {
                return None;
            }

            // Register as a waiter before releasing the lock, so a notify
            // that lands in the gap between dropping the guard and awaiting
            // is not lost (tokio::sync::Notify's documented condvar idiom).
            let notified = self.consumer_notify.notified();
            drop(state);
            notified.await;
        }
    }

    /// `annotate(annotatorId, itemId, label)`.
    pub async fn annotate(
        &self,
        annotator_id: &str,
        item_id: &str,
        value: LabelValue,
    ) -> Result<Option<Item>, DispatcherError> {
        let now = Utc::now();
        let holds = {
            let state = self.state.lock().await;
            Self::check_holding(&state, annotator_id, item_id)
        };
        if !holds {
            tracing::error!(annotator_id, item_id, op = "annotate", "holding inconsistency");
            self.release_stale_hold(annotator_id).await;
            return Ok(self.next_item(annotator_id).await);
        }

        let (patch, complete) = {
            let mut state = self.state.lock().await;
            let item = state.items.get_mut(item_id).expect("checked holding above");
            item.record_label(annotator_id.to_string(), value, now);
            (
                item.to_persistable_patch(),
                item.is_complete(self.config.num_annotations_per_item),
            )
        };

        let store = Arc::clone(&self.store);
        let index = self.config.index.clone();
        let doc_type = self.config.annotation_type.clone();
        let item_id_owned = item_id.to_string();
        if let Err(e) = with_retry(|| {
            store.update(&index, &doc_type, &item_id_owned, patch.clone())
        })
        .await
        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.labels.remove(annotator_id);
                item.valid_count = item
                    .labels
                    .values()
                    .filter(|l| l.annotation.is_valid())
                    .count() as u32;
            }
            tracing::error!(annotator_id, item_id, error = %e, "failed to persist annotation");
            return Err(DispatcherError::Store(e));
        }

        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.holders.remove(annotator_id);
            }
            state.holding.remove(annotator_id);
            if complete {
                state.partial.retain(|id| id != item_id);
                state.items.remove(item_id);
            }
        }

        Ok(self.next_item(annotator_id).await)
    }

    /// `skip(annotatorId, itemId)`.
    pub async fn skip(
        &self,
        annotator_id: &str,
        item_id: &str,
    ) -> Result<Option<Item>, DispatcherError> {
        let now = Utc::now();
        let holds = {
            let state = self.state.lock().await;
            Self::check_holding(&state, annotator_id, item_id)
        };
        if !holds {
            tracing::error!(annotator_id, item_id, op = "skip", "holding inconsistency");
            self.release_stale_hold(annotator_id).await;
            return Ok(self.next_item(annotator_id).await);
        }

        let patch = {
            let mut state = self.state.lock().await;
            let item = state.items.get_mut(item_id).expect("checked holding above");
            item.record_label(annotator_id.to_string(), LabelValue::Skip, now);
            item.to_persistable_patch()
        };

        let store = Arc::clone(&self.store);
        let index = self.config.index.clone();
        let doc_type = self.config.annotation_type.clone();
        let item_id_owned = item_id.to_string();
        if let Err(e) = with_retry(|| {
            store.update(&index, &doc_type, &item_id_owned, patch.clone())
        })
        .await
        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.labels.remove(annotator_id);
            }
            tracing::error!(annotator_id, item_id, error = %e, "failed to persist skip");
            return Err(DispatcherError::Store(e));
        }

        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.holders.remove(annotator_id);
            }
            state.holding.remove(annotator_id);
            let still_open = state
                .items
                .get(item_id)
                .map(|item| {
                    !item.is_invalid() && !item.is_complete(self.config.num_annotations_per_item)
                })
                .unwrap_or(false);
            if still_open {
                state.partial.push_back(item_id.to_string());
            }
        }

        Ok(self.next_item(annotator_id).await)
    }

    /// `invalidate(annotatorId, itemId, cause)`.
    pub async fn invalidate(
        &self,
        annotator_id: &str,
        item_id: &str,
        cause: String,
    ) -> Result<Option<Item>, DispatcherError> {
        let now = Utc::now();
        let holds = {
            let state = self.state.lock().await;
            Self::check_holding(&state, annotator_id, item_id)
        };
        if !holds {
            tracing::error!(annotator_id, item_id, op = "invalidate", "holding inconsistency");
            self.release_stale_hold(annotator_id).await;
            return Ok(self.next_item(annotator_id).await);
        }

        let patch = {
            let mut state = self.state.lock().await;
            let item = state.items.get_mut(item_id).expect("checked holding above");
            item.invalidate(annotator_id.to_string(), cause, now);
            item.to_persistable_patch()
        };

        let store = Arc::clone(&self.store);
        let index = self.config.index.clone();
        let doc_type = self.config.annotation_type.clone();
        let item_id_owned = item_id.to_string();
        if let Err(e) = with_retry(|| {
            store.update(&index, &doc_type, &item_id_owned, patch.clone())
        })
        .await
        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.invalid = None;
            }
            tracing::error!(annotator_id, item_id, error = %e, "failed to persist invalidation");
            return Err(DispatcherError::Store(e));
        }

        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(item_id) {
                item.holders.remove(annotator_id);
            }
            state.holding.remove(annotator_id);
            state.partial.retain(|id| id != item_id);
            state.items.remove(item_id);
        }

        Ok(self.next_item(annotator_id).await)
    }

    /// Stop the dispatcher: wakes the producer and any blocked consumers,
    /// who receive `None`.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            state.running = false;
        }
        self.consumer_notify.notify_waiters();
        self.producer_notify.notify_waiters();
    }

    /// Documented extension (`spec.md` §5): not wired into the producer
    /// loop automatically. A caller (e.g. a periodic task) invokes this to
    /// release holds inactive past `threshold` back into `partial`.
    pub async fn reap_stale_holds(&self, threshold: Duration) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let stale: Vec<(String, String)> = state
            .holding
            .iter()
            .filter(|(annotator_id, item_id)| {
                state
                    .items
                    .get(*item_id)
                    .and_then(|item| item.holders.get(*annotator_id))
                    .map(|held_since| {
                        now.signed_duration_since(*held_since)
                            .to_std()
                            .map(|d| d > threshold)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .map(|(a, i)| (a.clone(), i.clone()))
            .collect();

        for (annotator_id, item_id) in stale {
            state.holding.remove(&annotator_id);
            if let Some(item) = state.items.get_mut(&item_id) {
                item.holders.remove(&annotator_id);
                if !item.is_invalid() && !item.is_complete(self.config.num_annotations_per_item) {
                    state.partial.push_back(item_id.clone());
                }
            }
            tracing::info!(annotator_id, item_id, "reaped stale hold");
        }
    }
}
