//! Internal shared state guarded by the Dispatcher's single mutex (`spec.md`
//! §5: "All mutation of `unannotated`, `partial`, `holding`, `searchFrom`,
//! `running` happens while holding a single per-Dispatcher mutex").

use std::collections::{HashMap, VecDeque};

use crate::item::Item;

/// `unannotated`/`partial` hold item ids ("slot references" per `spec.md`
/// §4.3); the authoritative `Item` value for every id currently referenced
/// anywhere (a queue, a hold, or both) lives in `items`.
pub(super) struct State {
    pub items: HashMap<String, Item>,
    pub unannotated: VecDeque<String>,
    pub partial: VecDeque<String>,
    pub holding: HashMap<String, String>,
    pub search_from: usize,
    pub running: bool,
}

impl State {
    pub fn new() -> Self {
        State {
            items: HashMap::new(),
            unannotated: VecDeque::new(),
            partial: VecDeque::new(),
            holding: HashMap::new(),
            search_from: 0,
            running: false,
        }
    }
}
