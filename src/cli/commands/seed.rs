//! `labelqueue seed` — materialize an annotation task from a flat file of
//! source documents, grounded in `create_annotation_task.py`.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use console::style;
use serde_json::Value;

use crate::config::Config;
use crate::seeder::Seeder;
use crate::store::{SqliteStore, StoreAdapter};

pub async fn cmd_seed(
    config: &Config,
    task: &str,
    source: &Path,
    doc_id_field: &str,
    max_count: usize,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(source)
        .with_context(|| format!("reading source file {}", source.display()))?;
    let mut docs: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {} as a JSON array of documents", source.display()))?;

    if max_count > 0 && docs.len() > max_count {
        docs.truncate(max_count);
    }

    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(&config.db_path));
    let seeder = Seeder::new(
        Arc::clone(&store),
        config.index.clone(),
        config.annotation_type.clone(),
        task.to_string(),
    );

    let report = seeder.seed_from_documents(docs, doc_id_field).await?;

    println!(
        "{} seeded {} items for task {} (from {} source documents)",
        style("done").green().bold(),
        report.items_created,
        style(task).bold(),
        report.source_documents,
    );

    Ok(())
}
