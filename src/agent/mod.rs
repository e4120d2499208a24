// src/agent/mod.rs

//! The per-run controller.
//!
//! One [`Agent`] binds one DAG invocation to an execution graph: it
//! enforces single-instance execution, persists progressive status through
//! the [`HistoryStore`], serves the per-run control socket, relays signals
//! with SIGKILL escalation, and reports the outcome when the scheduler
//! returns.

pub mod reporter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dag::model::Dag;
use crate::errors::{CrondagError, Result};
use crate::exec::command::expand_env;
use crate::exec::condition::eval_conditions;
use crate::graph::graph::ExecutionGraph;
use crate::graph::node::{Node, NodeData};
use crate::graph::scheduler::{GraphScheduler, HandlerType, RunStatus, SchedulerConfig};
use crate::history::model::{format_time, NodeStatus, Status};
use crate::history::store::HistoryStore;
use crate::sock::{SocketClient, SocketHandler, SocketServer};

use self::reporter::{Mailer, Reporter};

/// Delay before the "first status" write, so very short runs usually win
/// the race and never show `Running`.
const FIRST_STATUS_DELAY: Duration = Duration::from_millis(100);

pub struct AgentOptions {
    /// Simulate the run: no processes, no persistence, no socket.
    pub dry: bool,
    /// Seed the graph from this prior run, re-executing only unfinished
    /// nodes. The run still gets a fresh request ID.
    pub retry_target: Option<Status>,
    /// Base log directory; the DAG's own `logDir` takes precedence.
    pub log_dir: PathBuf,
}

pub struct Agent {
    dag: Arc<Dag>,
    history: Arc<dyn HistoryStore>,
    reporter: Reporter,
    dry: bool,
    req_id: String,
    params: Vec<String>,
    log_filename: PathBuf,
    graph: Arc<ExecutionGraph>,
    scheduler: Arc<GraphScheduler>,
    finished: AtomicBool,
}

impl Agent {
    pub fn new(
        dag: Arc<Dag>,
        history: Arc<dyn HistoryStore>,
        mailer: Arc<dyn Mailer>,
        options: AgentOptions,
    ) -> Result<Self> {
        let req_id = Uuid::new_v4().to_string();

        let params = match &options.retry_target {
            Some(prior) if !prior.params.is_empty() => prior.params.clone(),
            _ => dag.params.clone(),
        };

        let log_dir = dag
            .log_dir
            .clone()
            .unwrap_or_else(|| options.log_dir.join(dag.safe_name()));

        let reqid8: String = req_id.chars().take(8).collect();
        let log_filename = log_dir.join(format!(
            "agent_{}.{}.{}.log",
            dag.safe_name(),
            Utc::now().format("%Y%m%d.%H:%M:%S%.3f"),
            reqid8,
        ));

        let graph = match &options.retry_target {
            Some(prior) => {
                debug!(request_id = %prior.request_id, "seeding graph from prior run");
                let seed = dag
                    .steps
                    .iter()
                    .map(|step| {
                        let data = prior
                            .nodes
                            .iter()
                            .find(|n| n.name == step.name)
                            .map(NodeStatus::to_node_data)
                            .unwrap_or_else(NodeData::default);
                        (step.clone(), data)
                    })
                    .collect();
                ExecutionGraph::for_retry(seed)?
            }
            None => ExecutionGraph::new(&dag.steps)?,
        };

        let scheduler = GraphScheduler::new(SchedulerConfig {
            log_dir,
            max_active_runs: dag.max_active_runs,
            delay: dag.delay,
            dry: options.dry,
            req_id: req_id.clone(),
            shell: dag.shell.clone(),
            on_exit: dag.handler_on.exit.clone(),
            on_success: dag.handler_on.success.clone(),
            on_failure: dag.handler_on.failure.clone(),
            on_cancel: dag.handler_on.cancel.clone(),
        });

        Ok(Self {
            dag,
            history,
            reporter: Reporter::new(mailer),
            dry: options.dry,
            req_id,
            params,
            log_filename,
            graph: Arc::new(graph),
            scheduler: Arc::new(scheduler),
            finished: AtomicBool::new(false),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.req_id
    }

    /// Environment every step expands against: DAG env, then positional
    /// params as `$1..$n`, plus run identity variables.
    fn base_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        for (k, v) in &self.dag.env {
            let expanded = expand_env(v, &env);
            env.insert(k.clone(), expanded);
        }
        for (i, p) in self.params.iter().enumerate() {
            env.insert((i + 1).to_string(), p.clone());
        }
        env.insert("DAG_NAME".to_string(), self.dag.name.clone());
        env.insert("DAG_REQUEST_ID".to_string(), self.req_id.clone());
        env
    }

    /// Current status snapshot of the run.
    pub fn status(&self) -> Status {
        let scheduler_status = self.scheduler.status(&self.graph);

        let handler = |h: HandlerType| {
            self.scheduler
                .handler_node(h)
                .map(|n| NodeStatus::from_node(&n))
        };

        Status {
            request_id: self.req_id.clone(),
            name: self.dag.name.clone(),
            status: scheduler_status,
            status_text: scheduler_status.to_string(),
            pid: Some(std::process::id()),
            started_at: format_time(self.graph.start_at()),
            finished_at: format_time(self.graph.finish_at()),
            log: self.log_filename.display().to_string(),
            params: self.params.clone(),
            nodes: self
                .graph
                .nodes()
                .iter()
                .map(|n| NodeStatus::from_node(n))
                .collect(),
            on_exit: handler(HandlerType::Exit),
            on_success: handler(HandlerType::Success),
            on_failure: handler(HandlerType::Failure),
            on_cancel: handler(HandlerType::Cancel),
        }
    }

    /// Run the DAG end-to-end. Setup is all-or-nothing; any failure before
    /// the first step aborts the run cleanly.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(dag = %self.dag.name, request_id = %self.req_id, dry = self.dry, "starting DAG run");

        let env = Arc::new(self.base_env());

        // DAG-level preconditions gate the whole run.
        if !self.dag.preconditions.is_empty() {
            let conds = self.dag.preconditions.clone();
            let cond_env = (*env).clone();
            let checked =
                tokio::task::spawn_blocking(move || eval_conditions(&conds, &cond_env))
                    .await
                    .map_err(|e| CrondagError::Other(e.into()))?;
            if let Err(e) = checked {
                warn!(dag = %self.dag.name, reason = %e, "precondition not met; cancelling run");
                self.scheduler.cancel(&self.graph);
                return Err(e);
            }
        }

        if self.dry {
            info!("dry-run: commands will not be executed");
            let result = self.scheduler.schedule(&self.graph, env, None).await;
            let status = self.status();
            self.reporter.write_summary(
                &self.log_filename,
                &status,
                result.as_ref().err().map(|e| e.to_string()).as_deref(),
            );
            return result;
        }

        // Single-instance guard: a live socket means this DAG is running.
        let sock_path = self.dag.sock_addr();
        if SocketClient::new(&sock_path).is_alive() {
            return Err(CrondagError::DagAlreadyRunning(
                sock_path.display().to_string(),
            ));
        }

        if let Err(e) = self
            .history
            .remove_old(&self.dag.location, self.dag.hist_retention_days)
        {
            warn!(error = %e, "failed to purge old history");
        }
        self.history
            .open(&self.dag.location, Utc::now(), &self.req_id)?;

        if let Some(parent) = self.log_filename.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let server = SocketServer::bind(&sock_path)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handler: Arc<dyn SocketHandler> = Arc::new(AgentSocketHandler {
            agent: Arc::clone(self),
        });
        let server_task = tokio::spawn(async move {
            // The server owns the socket file; it is removed when this
            // task drops it.
            if let Err(e) = server.serve(handler, shutdown_rx).await {
                warn!(error = %e, "control socket server failed");
            }
        });

        // Status writer: one snapshot after every node completion, all
        // writes serialized through this task.
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Arc<Node>>();
        let writer_task = {
            let agent = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(node) = done_rx.recv().await {
                    let status = agent.status();
                    if let Err(e) = agent.history.write(&status) {
                        warn!(error = %e, "failed to write status");
                    }
                    agent.reporter.report_step(&agent.dag, &node);
                }
            })
        };

        if let Err(e) = self.history.write(&self.status()) {
            warn!(error = %e, "failed to write initial status");
        }

        // First-status task: after a short delay, record `Running` unless
        // the run has already finished.
        {
            let agent = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(FIRST_STATUS_DELAY).await;
                if agent.finished.load(Ordering::SeqCst) {
                    return;
                }
                let mut status = agent.status();
                status.status = RunStatus::Running;
                status.status_text = RunStatus::Running.to_string();
                if let Err(e) = agent.history.write(&status) {
                    debug!(error = %e, "failed to write first status");
                }
            });
        }

        let result = self.scheduler.schedule(&self.graph, env, Some(done_tx)).await;
        self.finished.store(true, Ordering::SeqCst);
        let _ = writer_task.await;

        let status = self.status();
        let run_error = result.as_ref().err().map(|e| e.to_string());

        info!(dag = %self.dag.name, status = %status.status_text, "schedule finished");
        if let Err(e) = self.history.write(&status) {
            warn!(error = %e, "failed to write final status");
        }

        self.reporter
            .write_summary(&self.log_filename, &status, run_error.as_deref());
        self.reporter
            .send_report_mail(&self.dag, &status, run_error.as_deref());

        if let Err(e) = self.history.close() {
            warn!(error = %e, "failed to close history store");
        }

        let _ = shutdown_tx.send(());
        let _ = server_task.await;

        result
    }

    /// Deliver `sig` to the graph and wait for it to quiesce, re-sending
    /// every 5 seconds and escalating to SIGKILL after `maxCleanUpTime`.
    pub async fn signal(&self, sig: Signal, allow_override: bool) {
        info!(signal = %sig, "sending signal to running steps");

        let (done_tx, mut done_rx) = oneshot::channel();
        self.scheduler
            .signal(&self.graph, sig, allow_override, Some(done_tx));

        let deadline = tokio::time::Instant::now() + self.dag.max_cleanup_time;
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = &mut done_rx => {
                    info!("all child processes have terminated");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("max cleanup time reached; sending SIGKILL");
                    self.scheduler
                        .signal(&self.graph, Signal::SIGKILL, false, None);
                    return;
                }
                _ = tick.tick() => {
                    info!(signal = %sig, "re-sending signal to remaining processes");
                    self.scheduler.signal(&self.graph, sig, false, None);
                }
            }
        }
    }
}

/// Bridges the control socket to the agent.
struct AgentSocketHandler {
    agent: Arc<Agent>,
}

impl SocketHandler for AgentSocketHandler {
    fn status_json(&self) -> Result<String> {
        // A live agent always reports Running; the persisted record is the
        // source of truth once the agent exits.
        let mut status = self.agent.status();
        status.status = RunStatus::Running;
        status.status_text = RunStatus::Running.to_string();
        status.to_json()
    }

    fn request_stop(&self) {
        info!("stop requested via control socket");
        let agent = Arc::clone(&self.agent);
        tokio::spawn(async move {
            agent.signal(Signal::SIGTERM, true).await;
        });
    }
}
