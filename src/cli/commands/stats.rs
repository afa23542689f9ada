//! `labelqueue stats` — report completion counts for a task directly from
//! the store, without starting a dispatcher.

use std::sync::Arc;

use console::style;
use serde_json::Value;

use crate::config::Config;
use crate::store::{Query, SqliteStore, StoreAdapter};

/// Completion buckets for one task's records, per `spec.md` §8's Completion
/// property and §3's item lifecycle.
#[derive(Debug, Default, PartialEq, Eq)]
struct Buckets {
    total: usize,
    complete: usize,
    in_progress: usize,
    untouched: usize,
    invalid: usize,
}

/// Bucket one record. A record with any recorded label (including a
/// `skip`-only one, which never increments `numValidAnnotations`) counts as
/// in progress rather than untouched — `item.rs`'s `record_label` keeps
/// `skip` out of `valid_count` but still writes it into `annotations`.
fn bucket_record(record: &Value, num_annotations_per_item: u32) -> &'static str {
    if record.get("invalid").filter(|v| !v.is_null()).is_some() {
        return "invalid";
    }
    let valid_count = record
        .get("numValidAnnotations")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if valid_count >= num_annotations_per_item as u64 {
        return "complete";
    }
    let has_any_label = record
        .get("annotations")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if valid_count > 0 || has_any_label {
        "in_progress"
    } else {
        "untouched"
    }
}

fn bucket_records(records: &[(String, Value)], num_annotations_per_item: u32) -> Buckets {
    let mut buckets = Buckets {
        total: records.len(),
        ..Buckets::default()
    };
    for (_, record) in records {
        match bucket_record(record, num_annotations_per_item) {
            "invalid" => buckets.invalid += 1,
            "complete" => buckets.complete += 1,
            "in_progress" => buckets.in_progress += 1,
            _ => buckets.untouched += 1,
        }
    }
    buckets
}

pub async fn cmd_stats(config: &Config, task: &str) -> anyhow::Result<()> {
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::new(&config.db_path));
    store.ensure_schema(&config.index, &config.annotation_type).await?;

    let query = Query::term("name", task);
    let records = store.scan(&config.index, &config.annotation_type, &query).await?;
    let buckets = bucket_records(&records, config.num_annotations_per_item);

    println!("{} {}", style("task").bold(), style(task).cyan());
    println!("  total items:       {}", buckets.total);
    println!("  complete:          {}", buckets.complete);
    println!("  in progress:       {}", buckets.in_progress);
    println!("  untouched:         {}", buckets.untouched);
    println!("  invalidated:       {}", buckets.invalid);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skip_only_item_counts_as_in_progress_not_untouched() {
        let record = json!({
            "numValidAnnotations": 0,
            "annotations": [{"annotatorId": "a1", "annotation": "skip", "time": "now"}],
        });
        assert_eq!(bucket_record(&record, 2), "in_progress");
    }

    #[test]
    fn never_touched_item_counts_as_untouched() {
        let record = json!({ "numValidAnnotations": 0, "annotations": [] });
        assert_eq!(bucket_record(&record, 2), "untouched");
    }

    #[test]
    fn invalid_item_counts_as_invalid_even_with_labels() {
        let record = json!({
            "numValidAnnotations": 1,
            "annotations": [{"annotatorId": "a1", "annotation": "yes", "time": "now"}],
            "invalid": {"annotatorId": "a2", "cause": "bad", "time": "now"},
        });
        assert_eq!(bucket_record(&record, 2), "invalid");
    }

    #[test]
    fn complete_item_counts_as_complete() {
        let record = json!({
            "numValidAnnotations": 2,
            "annotations": [
                {"annotatorId": "a1", "annotation": "yes", "time": "now"},
                {"annotatorId": "a2", "annotation": "no", "time": "now"}
            ],
        });
        assert_eq!(bucket_record(&record, 2), "complete");
    }

    #[test]
    fn bucket_records_tallies_a_mixed_set() {
        let records = vec![
            (
                "i1".to_string(),
                json!({ "numValidAnnotations": 0, "annotations": [] }),
            ),
            (
                "i2".to_string(),
                json!({
                    "numValidAnnotations": 0,
                    "annotations": [{"annotatorId": "a1", "annotation": "skip", "time": "now"}],
                }),
            ),
            (
                "i3".to_string(),
                json!({
                    "numValidAnnotations": 2,
                    "annotations": [
                        {"annotatorId": "a1", "annotation": "yes", "time": "now"},
                        {"annotatorId": "a2", "annotation": "no", "time": "now"}
                    ],
                }),
            ),
        ];
        let buckets = bucket_records(&records, 2);
        assert_eq!(
            buckets,
            Buckets {
                total: 3,
                complete: 1,
                in_progress: 1,
                untouched: 1,
                invalid: 0,
            }
        );
    }
}
