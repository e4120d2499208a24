// src/client/mod.rs

//! Unified read/write facade over DAG runs.
//!
//! The CLI, the cron loop and any front-end go through [`Client`] instead
//! of touching sockets or history files directly. [`DagClient`] is the
//! production implementation: reads come from the live control socket when
//! an agent is up (falling back to persisted history), and `start` spawns
//! this same executable as a detached child so a run does not inherit its
//! parent's lifetime.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::dag::model::{safe_name, Dag};
use crate::errors::Result;
use crate::graph::scheduler::RunStatus;
use crate::history::model::Status;
use crate::history::store::HistoryStore;
use crate::sock::SocketClient;

/// How long `restart` waits for the old agent to disappear.
const STOP_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Facade operations. Injected as a capability set wherever run control is
/// needed.
pub trait Client: Send + Sync {
    /// Latest known status: persisted history corrected against socket
    /// liveness.
    fn get_latest_status(&self, dag: &Dag) -> Result<Status>;

    /// Live status from the running agent's socket, else the latest
    /// persisted one.
    fn get_current_status(&self, dag: &Dag) -> Result<Status>;

    /// Launch a new run in a detached child process.
    fn start(&self, dag: &Dag, params: &[String]) -> Result<()>;

    /// Ask a running agent to stop gracefully. A DAG that is not running
    /// is left alone.
    fn stop(&self, dag: &Dag) -> Result<()>;

    /// Stop, wait out `restartWait`, then start again with the previous
    /// run's params.
    fn restart(&self, dag: &Dag) -> Result<()>;

    fn is_suspended(&self, id: &str) -> bool;

    fn toggle_suspend(&self, id: &str, suspend: bool) -> Result<()>;

    fn get_recent_history(&self, dag: &Dag, n: usize) -> Result<Vec<Status>>;
}

pub struct DagClient {
    history: Arc<dyn HistoryStore>,
    /// Propagated to spawned agents via `CRONDAG_HOME`.
    home: PathBuf,
    suspend_dir: PathBuf,
}

impl DagClient {
    pub fn new(history: Arc<dyn HistoryStore>, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let suspend_dir = home.join("suspend");
        Self {
            history,
            home,
            suspend_dir,
        }
    }

    fn suspend_flag(&self, id: &str) -> PathBuf {
        self.suspend_dir.join(format!("{}.suspend", safe_name(id)))
    }

    /// Placeholder status for a DAG with no history at all.
    fn default_status(dag: &Dag) -> Status {
        Status {
            request_id: String::new(),
            name: dag.name.clone(),
            status: RunStatus::None,
            status_text: RunStatus::None.to_string(),
            pid: None,
            started_at: "-".to_string(),
            finished_at: "-".to_string(),
            log: String::new(),
            params: Vec::new(),
            nodes: Vec::new(),
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        }
    }
}

impl Client for DagClient {
    fn get_latest_status(&self, dag: &Dag) -> Result<Status> {
        let mut status = self
            .history
            .latest(&dag.location)?
            .unwrap_or_else(|| Self::default_status(dag));

        // A persisted `Running` from a crashed agent would block the cron
        // loop forever; trust socket liveness over the stale record.
        if status.status == RunStatus::Running && !SocketClient::new(dag.sock_addr()).is_alive() {
            debug!(dag = %dag.name, "stale running status; correcting to failed");
            status.status = RunStatus::Error;
            status.status_text = RunStatus::Error.to_string();
        }

        Ok(status)
    }

    fn get_current_status(&self, dag: &Dag) -> Result<Status> {
        let client = SocketClient::new(dag.sock_addr());
        match client.get_status() {
            Ok(status) => Ok(status),
            Err(_) => self.get_latest_status(dag),
        }
    }

    fn start(&self, dag: &Dag, params: &[String]) -> Result<()> {
        let exe = std::env::current_exe().map_err(anyhow::Error::from)?;

        let mut cmd = Command::new(exe);
        cmd.arg("start")
            .arg(&dag.location)
            .env("CRONDAG_HOME", &self.home)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if !params.is_empty() {
            cmd.arg("--").args(params);
        }

        // Detach into its own process group so the run outlives us.
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn()?;
        info!(dag = %dag.name, pid = child.id(), "spawned agent process");
        Ok(())
    }

    fn stop(&self, dag: &Dag) -> Result<()> {
        let client = SocketClient::new(dag.sock_addr());
        if !client.is_alive() {
            info!(dag = %dag.name, "not running; nothing to stop");
            return Ok(());
        }
        client.post_stop()
    }

    fn restart(&self, dag: &Dag) -> Result<()> {
        self.stop(dag)?;

        let sock = SocketClient::new(dag.sock_addr());
        let deadline = Instant::now() + STOP_POLL_TIMEOUT;
        while sock.is_alive() {
            if Instant::now() >= deadline {
                warn!(dag = %dag.name, "old agent still alive after stop; starting anyway");
                break;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        if !dag.restart_wait.is_zero() {
            debug!(dag = %dag.name, wait = ?dag.restart_wait, "waiting before restart");
            std::thread::sleep(dag.restart_wait);
        }

        let params = self
            .history
            .latest(&dag.location)?
            .map(|s| s.params)
            .unwrap_or_default();

        self.start(dag, &params)
    }

    fn is_suspended(&self, id: &str) -> bool {
        self.suspend_flag(id).exists()
    }

    fn toggle_suspend(&self, id: &str, suspend: bool) -> Result<()> {
        let flag = self.suspend_flag(id);
        if suspend {
            std::fs::create_dir_all(&self.suspend_dir)?;
            std::fs::write(&flag, b"")?;
            info!(id, "DAG suspended");
        } else if flag.exists() {
            std::fs::remove_file(&flag)?;
            info!(id, "DAG resumed");
        }
        Ok(())
    }

    fn get_recent_history(&self, dag: &Dag, n: usize) -> Result<Vec<Status>> {
        self.history.recent(&dag.location, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::store::JsonHistoryStore;

    #[test]
    fn suspend_flag_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let history = Arc::new(JsonHistoryStore::new(tmp.path().join("data")));
        let client = DagClient::new(history, tmp.path());

        assert!(!client.is_suspended("demo"));
        client.toggle_suspend("demo", true).unwrap();
        assert!(client.is_suspended("demo"));
        client.toggle_suspend("demo", false).unwrap();
        assert!(!client.is_suspended("demo"));
    }
}
