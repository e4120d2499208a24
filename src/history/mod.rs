// src/history/mod.rs

//! Run history: the persisted status model and the store that keeps one
//! JSON document per run.

pub mod model;
pub mod store;

pub use model::{format_time, parse_time, NodeStatus, Status};
pub use store::{HistoryStore, JsonHistoryStore};
