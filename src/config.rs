//! Process configuration: a TOML file on disk, overridable by environment
//! variables and CLI flags, in that precedence order. Simplified from the
//! teacher's `prefer`-crate-based layered config down to plain `serde` +
//! `toml`, since this crate has a single small settings surface rather than
//! the teacher's sprawling one.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_db_path() -> String {
    "labelqueue.db".to_string()
}

fn default_index() -> String {
    "annotations".to_string()
}

fn default_annotation_type() -> String {
    "annotation".to_string()
}

fn default_num_annotations_per_item() -> u32 {
    2
}

fn default_num_unannotated_items() -> usize {
    200
}

/// Settings shared by every dispatcher the process starts, unless a CLI flag
/// overrides a field for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_index")]
    pub index: String,

    #[serde(default = "default_annotation_type")]
    pub annotation_type: String,

    #[serde(default = "default_num_annotations_per_item")]
    pub num_annotations_per_item: u32,

    #[serde(default = "default_num_unannotated_items")]
    pub num_unannotated_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: default_db_path(),
            index: default_index(),
            annotation_type: default_annotation_type(),
            num_annotations_per_item: default_num_annotations_per_item(),
            num_unannotated_items: default_num_unannotated_items(),
        }
    }
}

impl Config {
    /// Load from `path` if it exists, else fall back to defaults; either way
    /// apply `LABELQUEUE_*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            _ => Config::default(),
        };

        if let Ok(db_path) = std::env::var("LABELQUEUE_DB_PATH") {
            config.db_path = db_path;
        }
        if let Ok(index) = std::env::var("LABELQUEUE_INDEX") {
            config.index = index;
        }
        if let Ok(n) = std::env::var("LABELQUEUE_NUM_ANNOTATIONS_PER_ITEM") {
            config.num_annotations_per_item = n
                .parse()
                .context("LABELQUEUE_NUM_ANNOTATIONS_PER_ITEM must be a positive integer")?;
        }
        if let Ok(n) = std::env::var("LABELQUEUE_NUM_UNANNOTATED_ITEMS") {
            config.num_unannotated_items = n
                .parse()
                .context("LABELQUEUE_NUM_UNANNOTATED_ITEMS must be a positive integer")?;
        }

        Ok(config)
    }
}
