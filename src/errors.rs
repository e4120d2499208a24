// src/errors.rs

//! Crate-wide error type and `Result` alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrondagError {
    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Command is empty")]
    CommandEmpty,

    #[error("Malformed command: {0}")]
    CommandBadShape(String),

    #[error("Cycle detected in DAG: {0}")]
    DependencyCycle(String),

    #[error("The DAG is already running. socket={0}")]
    DagAlreadyRunning(String),

    #[error("Precondition not met: expected \"{expected}\", got \"{actual}\"")]
    PreconditionFailed { expected: String, actual: String },

    #[error("Job already running")]
    JobRunning,

    #[error("Job is not running")]
    JobNotRunning,

    #[error("Job already finished for this scheduled time")]
    JobFinished,

    #[error("Job already ran successfully in this window")]
    JobSuccess,

    #[error("Failed to bind control socket at {path}: {source}")]
    SocketBind {
        path: String,
        source: std::io::Error,
    },

    #[error("History store error: {0}")]
    HistoryIo(String),

    #[error("Invalid cron expression \"{expr}\": {reason}")]
    CronParse { expr: String, reason: String },

    #[error("Step failed: {0}")]
    StepFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, CrondagError>;
