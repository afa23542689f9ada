//! labelqueue - a crowd-sourced annotation dispatcher.
//!
//! A pool of human annotators each request one item (a document) at a time,
//! submit a labeled judgment, and are immediately handed the next item. The
//! [`dispatcher::Dispatcher`] is the core coordinator: it maintains two bounded
//! in-memory queues populated from the [`store`], matches each requesting
//! annotator with exactly one item under precise allocation rules, and records
//! labels durably.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod item;
pub mod registry;
pub mod seeder;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherError};
pub use item::{Annotator, Invalidation, Item, Label, LabelValue};
pub use registry::DispatcherRegistry;
pub use store::{Query, SortOrder, StoreAdapter, StoreError};
