//! Task Seeder: populates an annotation task's store records from a source
//! document collection, grounded in the Python original's
//! `create_annotation_task` (`checkIndexAndType` + per-document indexing) and
//! the teacher's `cmd_annotate` progress-reporting style.

use std::sync::Arc;

use chrono::Utc;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::store::{Query, Result, StoreAdapter};

const BULK_BATCH_SIZE: usize = 200;

/// Optional per-document context builder, used to attach a human-readable
/// `context` block (`spec.md` §6) derived from the source record. Mirrors
/// the original's caller-supplied context-decider hook.
pub type ContextDecider = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub struct Seeder {
    store: Arc<dyn StoreAdapter>,
    index: String,
    annotation_type: String,
    task_name: String,
    context_decider: Option<ContextDecider>,
}

pub struct SeedReport {
    pub source_documents: usize,
    pub items_created: usize,
}

impl Seeder {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        index: impl Into<String>,
        annotation_type: impl Into<String>,
        task_name: impl Into<String>,
    ) -> Self {
        Seeder {
            store,
            index: index.into(),
            annotation_type: annotation_type.into(),
            task_name: task_name.into(),
            context_decider: None,
        }
    }

    pub fn with_context_decider(mut self, decider: ContextDecider) -> Self {
        self.context_decider = Some(decider);
        self
    }

    /// Scan `source_index`/`source_type` and create one annotation item per
    /// source document, batched into the target index via `bulk_index`.
    pub async fn seed_from(
        &self,
        source_index: &str,
        source_type: &str,
        doc_id_field: &str,
    ) -> Result<SeedReport> {
        let source_docs = self.store.scan(source_index, source_type, &Query::All).await?;
        self.seed_from_documents(source_docs.into_iter().map(|(_, doc)| doc).collect(), doc_id_field)
            .await
    }

    /// Create one annotation item per document in `source_docs`, without
    /// requiring the source collection to live in the same store. Used by
    /// the `seed` CLI command against a flat file of source documents, in
    /// place of a second store adapter for the external corpus.
    pub async fn seed_from_documents(
        &self,
        source_docs: Vec<Value>,
        doc_id_field: &str,
    ) -> Result<SeedReport> {
        self.store.ensure_schema(&self.index, &self.annotation_type).await?;

        let total = source_docs.len();

        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        progress.set_message(format!("seeding task {}", style(&self.task_name).bold()));

        let mut batch = Vec::with_capacity(BULK_BATCH_SIZE);
        let mut created = 0usize;

        for source_doc in source_docs {
            let doc_id = source_doc
                .get(doc_id_field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let context = self.context_decider.as_ref().and_then(|f| f(&source_doc));
            let mut record = json!({
                "name": self.task_name,
                "created": Utc::now().to_rfc3339(),
                "docId": doc_id,
                "doc": source_doc,
                "numValidAnnotations": 0,
                "annotations": [],
            });
            if let Some(context) = context {
                record["context"] = context;
            }

            batch.push((Uuid::new_v4().to_string(), record));
            created += 1;
            progress.inc(1);

            if batch.len() >= BULK_BATCH_SIZE {
                self.flush(&mut batch).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await?;
        }

        progress.finish_with_message(format!("seeded {created} items"));

        Ok(SeedReport {
            source_documents: total,
            items_created: created,
        })
    }

    async fn flush(&self, batch: &mut Vec<(String, Value)>) -> Result<()> {
        let records = std::mem::take(batch);
        self.store.bulk_index(&self.index, &self.annotation_type, records).await
    }
}
