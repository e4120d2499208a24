// src/dag/mod.rs

//! DAG definition model, YAML loading and structural validation.

pub mod loader;
pub mod model;
pub mod schedule;
pub mod validate;

pub use loader::{load_dag, load_metadata};
pub use model::{
    ContinueOn, Dag, HandlerOn, MailOn, Precondition, RepeatPolicy, RetryPolicy, SmtpConfig, Step,
    SubDag,
};
pub use schedule::CronSchedule;
