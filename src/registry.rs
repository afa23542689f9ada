//! Holds every running [`Dispatcher`], keyed by task name, so the CLI's
//! `serve` command can look one up per incoming request (`spec.md` §9).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::store::StoreAdapter;

/// A process-wide table of started dispatchers. Cheap to clone: callers
/// typically hold one `Arc<DispatcherRegistry>` per process.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: RwLock<HashMap<String, Arc<Dispatcher>>>,
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        DispatcherRegistry {
            dispatchers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, task_name: &str) -> Option<Arc<Dispatcher>> {
        self.dispatchers.read().await.get(task_name).cloned()
    }

    /// Build, start, and register a new dispatcher for `config.task_name`.
    /// Replaces (and drops) any previous dispatcher registered under the
    /// same name, which stops accepting new consumers once its last `Arc`
    /// goes away and nobody polls it anymore.
    pub async fn start(
        &self,
        config: DispatcherConfig,
        store: Arc<dyn StoreAdapter>,
    ) -> Arc<Dispatcher> {
        let task_name = config.task_name.clone();
        let dispatcher = Dispatcher::new(config, store).start().await;
        self.dispatchers
            .write()
            .await
            .insert(task_name, Arc::clone(&dispatcher));
        dispatcher
    }

    pub async fn stop(&self, task_name: &str) {
        if let Some(dispatcher) = self.dispatchers.write().await.remove(task_name) {
            dispatcher.stop().await;
        }
    }

    pub async fn task_names(&self) -> Vec<String> {
        self.dispatchers.read().await.keys().cloned().collect()
    }
}
