// src/cron/mod.rs

//! Background scheduling: discovering DAG files, materializing cron
//! entries, and firing start/stop/restart jobs at the right instants.

pub mod entry_reader;
pub mod job;
pub mod runner;

pub use entry_reader::{Entry, EntryKind, EntryReader};
pub use job::DagJob;
pub use runner::CronRunner;
