// src/lib.rs

pub mod agent;
pub mod cli;
pub mod client;
pub mod cron;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod graph;
pub mod history;
pub mod logging;
pub mod sock;

use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::agent::reporter::LogMailer;
use crate::agent::{Agent, AgentOptions};
use crate::cli::{CliArgs, Command};
use crate::client::{Client, DagClient};
use crate::cron::{CronRunner, EntryReader};
use crate::dag::loader::{load_dag, load_dag_with_params, load_metadata};
use crate::errors::{CrondagError, Result};
use crate::history::store::{HistoryStore, JsonHistoryStore};

/// Where logs, history and suspend flags live.
///
/// Resolution order: `--home` flag, `CRONDAG_HOME`, `~/.crondag`.
pub struct AppEnv {
    pub home: PathBuf,
}

impl AppEnv {
    pub fn resolve(cli_home: Option<&str>) -> Self {
        let home = cli_home
            .map(PathBuf::from)
            .or_else(|| std::env::var("CRONDAG_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(base).join(".crondag")
            });
        Self { home }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::new(JsonHistoryStore::new(self.data_dir()))
    }

    fn client(&self) -> Arc<dyn Client> {
        Arc::new(DagClient::new(self.history(), &self.home))
    }
}

/// High-level entry point used by `main.rs`: dispatch one subcommand.
pub async fn run(args: CliArgs) -> Result<()> {
    let env = AppEnv::resolve(args.home.as_deref());

    match args.command {
        Command::Start { dag_file, params } => run_agent(&env, &dag_file, &params, false, None).await,
        Command::Dry { dag_file, params } => run_agent(&env, &dag_file, &params, true, None).await,
        Command::Retry {
            dag_file,
            request_id,
        } => run_retry(&env, &dag_file, &request_id).await,
        Command::Stop { dag_file } => run_stop(&env, &dag_file),
        Command::Restart { dag_file } => run_restart(&env, &dag_file),
        Command::Status { dag_file } => run_status(&env, &dag_file),
        Command::Scheduler { dags } => run_scheduler(&env, &dags).await,
    }
}

/// Run one DAG invocation in this process.
async fn run_agent(
    env: &AppEnv,
    dag_file: &str,
    params: &[String],
    dry: bool,
    retry_target: Option<crate::history::model::Status>,
) -> Result<()> {
    let dag = Arc::new(load_dag_with_params(dag_file, params)?);

    let agent = Arc::new(Agent::new(
        dag,
        env.history(),
        Arc::new(LogMailer),
        AgentOptions {
            dry,
            retry_target,
            log_dir: env.log_dir(),
        },
    )?);

    spawn_signal_relay(Arc::clone(&agent));
    agent.run().await
}

async fn run_retry(env: &AppEnv, dag_file: &str, request_id: &str) -> Result<()> {
    let dag = load_dag(dag_file)?;
    let prior = env
        .history()
        .find_by_request_id(&dag.location, request_id)?
        .ok_or_else(|| {
            CrondagError::HistoryIo(format!(
                "no run with request ID '{request_id}' for DAG '{}'",
                dag.name
            ))
        })?;

    info!(dag = %dag.name, request_id, "retrying run");
    run_agent(env, dag_file, &[], false, Some(prior)).await
}

fn run_stop(env: &AppEnv, dag_file: &str) -> Result<()> {
    let dag = load_metadata(dag_file)?;
    env.client().stop(&dag)?;
    println!("stop requested for '{}'", dag.name);
    Ok(())
}

fn run_restart(env: &AppEnv, dag_file: &str) -> Result<()> {
    let dag = load_dag(dag_file)?;
    env.client().restart(&dag)?;
    println!("restart requested for '{}'", dag.name);
    Ok(())
}

fn run_status(env: &AppEnv, dag_file: &str) -> Result<()> {
    let dag = load_metadata(dag_file)?;
    let status = env.client().get_current_status(&dag)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Run the cron scheduler until SIGTERM/SIGINT.
async fn run_scheduler(env: &AppEnv, dags_dir: &str) -> Result<()> {
    let reader = Arc::new(EntryReader::new(dags_dir, env.client()));
    let _watcher = reader.start_watching()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "failed to listen for shutdown signals");
            return;
        }
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    CronRunner::new(reader).run(stop_rx).await;
    Ok(())
}

/// Relay SIGTERM/SIGINT to the agent, which signals the graph and
/// escalates to SIGKILL after the cleanup window.
fn spawn_signal_relay(agent: Arc<Agent>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut int) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(t), Ok(i)) => (t, i),
            _ => {
                error!("failed to install signal handlers");
                return;
            }
        };

        let sig = tokio::select! {
            _ = term.recv() => Signal::SIGTERM,
            _ = int.recv() => Signal::SIGINT,
        };
        info!(signal = %sig, "received shutdown signal");
        agent.signal(sig, false).await;
    });
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}
