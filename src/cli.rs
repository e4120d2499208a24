// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `crondag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "crondag",
    version,
    about = "Run DAGs of shell commands on cron schedules.",
    long_about = None
)]
pub struct CliArgs {
    /// Base directory for logs, history and suspend flags.
    ///
    /// Default: `$CRONDAG_HOME`, falling back to `~/.crondag`.
    #[arg(long, value_name = "PATH", global = true)]
    pub home: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CRONDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a DAG now.
    Start {
        /// Path to the DAG definition file (YAML).
        dag_file: String,

        /// Positional params exported to every step as `$1..$n`.
        #[arg(last = true)]
        params: Vec<String>,
    },

    /// Stop a running DAG gracefully.
    Stop {
        dag_file: String,
    },

    /// Stop a running DAG, wait, then start it again with its previous params.
    Restart {
        dag_file: String,
    },

    /// Re-run a historical invocation, resuming only steps that did not succeed.
    Retry {
        dag_file: String,

        /// Request ID of the run to retry.
        #[arg(long, value_name = "ID")]
        request_id: String,
    },

    /// Print the current status of a DAG (live if running, else latest persisted).
    Status {
        dag_file: String,
    },

    /// Simulate a run without executing any commands or persisting status.
    Dry {
        dag_file: String,

        #[arg(last = true)]
        params: Vec<String>,
    },

    /// Run the cron scheduler over a directory of DAG files until SIGTERM/SIGINT.
    Scheduler {
        /// Directory containing DAG definition files.
        #[arg(long, value_name = "DIR")]
        dags: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
