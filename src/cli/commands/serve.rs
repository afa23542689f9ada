//! `labelqueue serve` — stand-in for the external HTTP front-end
//! (`spec.md` §1 "Out of scope"). Starts one `Dispatcher` for `task` and
//! drives a configurable number of simulated concurrent annotators through
//! `getItem`/`annotate` loops against the real `SqliteStore`, exercising the
//! whole system end-to-end without a router.

use std::sync::Arc;

use console::style;
use rand::Rng;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::item::LabelValue;
use crate::registry::DispatcherRegistry;
use crate::store::{SqliteStore, StoreAdapter};

pub async fn cmd_serve(
    config: &Config,
    task: &str,
    annotations_per_item: u32,
    queue_size: usize,
    demo_annotators: usize,
) -> anyhow::Result<()> {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(&config.db_path));
    let annotator_store = Arc::clone(&store);
    let annotator_index = config.index.clone();

    let dispatcher_config = DispatcherConfig {
        name: format!("labelqueue[{task}]"),
        index: config.index.clone(),
        annotation_type: config.annotation_type.clone(),
        task_name: task.to_string(),
        num_annotations_per_item: annotations_per_item,
        num_unannotated_items: queue_size,
    };

    println!(
        "{} starting dispatcher for task {} (N={}, queue={})",
        style("→").cyan(),
        style(task).bold(),
        annotations_per_item,
        queue_size,
    );

    // One registry per process, per `SPEC_FULL.md` §9: `serve` builds it,
    // keys the dispatcher by task name, and hands out the shared `Arc`.
    let registry = DispatcherRegistry::new();
    let dispatcher = registry.start(dispatcher_config, store).await;

    let mut handles = Vec::with_capacity(demo_annotators);
    for n in 0..demo_annotators {
        let dispatcher = Arc::clone(&dispatcher);
        let annotator_id = format!("demo-{}-{n}", Uuid::new_v4());
        let annotator_store = Arc::clone(&annotator_store);
        let annotator_index = annotator_index.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = annotator_store
                .ensure_annotator(&annotator_index, "annotator", &annotator_id)
                .await
            {
                tracing::warn!(annotator_id, error = %e, "failed to lazily create annotator record");
            }
            run_simulated_annotator(dispatcher, annotator_id).await
        }));
    }

    let mut total_labeled = 0u64;
    for handle in handles {
        total_labeled += handle.await.unwrap_or(0);
    }

    registry.stop(task).await;

    println!(
        "{} task {} exhausted: {} labels recorded across {} simulated annotators",
        style("done").green().bold(),
        style(task).bold(),
        total_labeled,
        demo_annotators,
    );

    Ok(())
}

/// One simulated annotator: repeatedly `getItem` then `annotate` with a
/// random `yes`/`no` judgment (occasionally `skip`, mirroring a real
/// annotator declining an item) until the dispatcher reports exhaustion.
/// Returns the number of labels this annotator recorded.
async fn run_simulated_annotator(dispatcher: Arc<Dispatcher>, annotator_id: String) -> u64 {
    let mut labeled = 0u64;

    let mut current = dispatcher.get_item(&annotator_id).await;
    while let Some(item) = current {
        let roll: f64 = rand::thread_rng().gen();
        let value = if roll < 0.05 {
            LabelValue::Skip
        } else if roll < 0.55 {
            LabelValue::Yes
        } else {
            LabelValue::No
        };

        // `annotate`/`skip` hand back the next allocated item directly
        // (`spec.md` §4.3), so the simulated annotator never calls
        // `getItem` twice for the same turn.
        let result = if value == LabelValue::Skip {
            dispatcher.skip(&annotator_id, &item.id).await
        } else {
            dispatcher.annotate(&annotator_id, &item.id, value).await
        };

        current = match result {
            Ok(next) => {
                if value != LabelValue::Skip {
                    labeled += 1;
                }
                next
            }
            Err(e) => {
                tracing::warn!(annotator_id, item_id = %item.id, error = %e, "demo annotator failed to persist");
                // The hold on `item` is still outstanding; retry the same
                // item rather than spinning on a dropped allocation.
                dispatcher.get_item(&annotator_id).await
            }
        };
    }

    labeled
}
