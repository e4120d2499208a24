// src/graph/scheduler.rs

//! Drives an [`ExecutionGraph`] from `None` to terminal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::dag::model::Step;
use crate::errors::{CrondagError, Result};
use crate::graph::graph::ExecutionGraph;
use crate::graph::node::{ExecContext, Node, NodeState};

/// Aggregate status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    None,
    Running,
    Error,
    Cancel,
    Success,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::None => "not started",
            RunStatus::Running => "running",
            RunStatus::Error => "failed",
            RunStatus::Cancel => "canceled",
            RunStatus::Success => "finished",
        };
        f.write_str(s)
    }
}

/// Lifecycle handler slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    Exit,
    Success,
    Failure,
    Cancel,
}

impl HandlerType {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerType::Exit => "onExit",
            HandlerType::Success => "onSuccess",
            HandlerType::Failure => "onFailure",
            HandlerType::Cancel => "onCancel",
        }
    }
}

/// Per-run scheduler configuration, derived from the DAG by the agent.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub log_dir: PathBuf,
    pub max_active_runs: u32,
    /// Pause between step admissions.
    pub delay: Duration,
    pub dry: bool,
    pub req_id: String,
    pub shell: Option<String>,
    pub on_exit: Option<Step>,
    pub on_success: Option<Step>,
    pub on_failure: Option<Step>,
    pub on_cancel: Option<Step>,
}

/// Readiness of a node with respect to its dependencies.
enum DepsStatus {
    Ready,
    Wait,
    /// An upstream failure or cancellation blocks this node for good.
    Cancel,
    /// An upstream skip cascades to this node.
    Skip,
}

/// Drives one graph: admission up to the concurrency limit, completion
/// handling, failure cascades, cancellation and lifecycle handlers.
///
/// Assumes exclusive ownership of the graph it schedules. Handler nodes are
/// registered per scheduler instance, never process-global.
pub struct GraphScheduler {
    config: SchedulerConfig,
    cancel_tx: watch::Sender<bool>,
    /// External cancellation (user signal or stop request).
    canceled: AtomicBool,
    /// A step failed without `continueOn`; stop admitting, but the run
    /// still classifies as `Error`, not `Cancel`.
    failing: AtomicBool,
    last_error: Mutex<Option<String>>,
    handlers: Mutex<HashMap<HandlerType, Arc<Node>>>,
}

impl GraphScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            cancel_tx,
            canceled: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            last_error: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Run the graph to completion.
    ///
    /// Every node that reaches a terminal state (executed, cascaded or
    /// canceled) is forwarded over `done_tx` so the caller can persist
    /// progressive status. Returns the first unrecovered error.
    pub async fn schedule(
        &self,
        graph: &Arc<ExecutionGraph>,
        env: Arc<HashMap<String, String>>,
        done_tx: Option<mpsc::UnboundedSender<Arc<Node>>>,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.config.log_dir)?;

        graph.mark_started();

        let ctx = ExecContext {
            log_dir: self.config.log_dir.clone(),
            req_id: self.config.req_id.clone(),
            env,
            outputs: Arc::new(Mutex::new(HashMap::new())),
            shell: self.config.shell.clone(),
            dry: self.config.dry,
            cancel: self.cancel_tx.subscribe(),
        };

        let (comp_tx, mut comp_rx) = mpsc::unbounded_channel::<usize>();
        let mut scheduled = vec![false; graph.nodes().len()];
        let mut active: usize = 0;

        loop {
            self.admit_ready(graph, &ctx, &comp_tx, &mut scheduled, &mut active, &done_tx)
                .await;

            if graph.is_finished() {
                break;
            }
            if active == 0 {
                // Nothing running and nothing admissible: every remaining
                // node is waiting on a dependency that can no longer move.
                warn!("no runnable nodes left; finishing run");
                break;
            }

            let Some(idx) = comp_rx.recv().await else { break };
            active -= 1;
            let node = graph.nodes()[idx].clone();
            self.on_node_finished(graph, &node);
            if let Some(tx) = &done_tx {
                let _ = tx.send(node);
            }
        }

        graph.mark_finished();
        self.run_handlers(graph, &ctx, &done_tx).await;

        match self.last_error.lock().unwrap().clone() {
            Some(msg) => Err(CrondagError::StepFailed(msg)),
            None => Ok(()),
        }
    }

    /// Admit every ready node (in step declaration order) up to the
    /// concurrency limit, cascading skips and upstream failures along the
    /// way.
    async fn admit_ready(
        &self,
        graph: &Arc<ExecutionGraph>,
        ctx: &ExecContext,
        comp_tx: &mpsc::UnboundedSender<usize>,
        scheduled: &mut [bool],
        active: &mut usize,
        done_tx: &Option<mpsc::UnboundedSender<Arc<Node>>>,
    ) {
        if self.is_canceled() || self.failing.load(Ordering::SeqCst) {
            self.mark_unstarted(graph, NodeState::Cancel, done_tx);
            return;
        }

        let max_active = self.config.max_active_runs.max(1) as usize;

        // Cascade marks can unblock (or block) later nodes, so scan until
        // a pass makes no state change.
        loop {
            let mut changed = false;

            for i in 0..graph.nodes().len() {
                let node = &graph.nodes()[i];
                if scheduled[i] || node.state() != NodeState::None {
                    continue;
                }

                match self.deps_status(graph, i) {
                    DepsStatus::Wait => {}
                    DepsStatus::Cancel => {
                        node.mark(NodeState::Cancel);
                        changed = true;
                        if let Some(tx) = done_tx {
                            let _ = tx.send(node.clone());
                        }
                    }
                    DepsStatus::Skip => {
                        info!(step = %node.name(), "upstream step skipped; skipping");
                        node.mark(NodeState::Skipped);
                        changed = true;
                        if let Some(tx) = done_tx {
                            let _ = tx.send(node.clone());
                        }
                    }
                    DepsStatus::Ready => {
                        if *active >= max_active {
                            continue;
                        }
                        scheduled[i] = true;
                        *active += 1;

                        debug!(step = %node.name(), "admitting step");
                        let node = node.clone();
                        let ctx = ctx.clone();
                        let comp_tx = comp_tx.clone();
                        tokio::spawn(async move {
                            node.execute(&ctx).await;
                            let _ = comp_tx.send(i);
                        });

                        if !self.config.delay.is_zero() {
                            tokio::time::sleep(self.config.delay).await;
                        }
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn deps_status(&self, graph: &ExecutionGraph, i: usize) -> DepsStatus {
        for &d in graph.deps_of(i) {
            let dep = &graph.nodes()[d];
            match dep.state() {
                NodeState::Success => {}
                NodeState::Skipped => {
                    if !dep.step().continue_on.skipped {
                        return DepsStatus::Skip;
                    }
                }
                NodeState::Error => {
                    if !dep.should_continue() {
                        return DepsStatus::Cancel;
                    }
                }
                NodeState::Cancel => return DepsStatus::Cancel,
                NodeState::None | NodeState::Running => return DepsStatus::Wait,
            }
        }
        DepsStatus::Ready
    }

    fn on_node_finished(&self, graph: &ExecutionGraph, node: &Arc<Node>) {
        let state = node.state();
        if state == NodeState::Error {
            let error = node
                .data()
                .error
                .unwrap_or_else(|| "unknown error".to_string());
            self.record_error(format!("step '{}': {}", node.name(), error));

            if !node.should_continue() {
                info!(step = %node.name(), "step failed; stopping remaining steps");
                self.failing.store(true, Ordering::SeqCst);
                let _ = self.cancel_tx.send(true);
                for running in graph.nodes() {
                    running.signal(Signal::SIGTERM, true);
                }
            }
        }
        debug!(step = %node.name(), state = %state, "step finished");
    }

    /// Run lifecycle handlers once the main graph is terminal: exactly one
    /// of on_cancel / on_failure / on_success by outcome, then on_exit.
    async fn run_handlers(
        &self,
        graph: &Arc<ExecutionGraph>,
        ctx: &ExecContext,
        done_tx: &Option<mpsc::UnboundedSender<Arc<Node>>>,
    ) {
        let mut to_run: Vec<(HandlerType, Step)> = Vec::new();
        match self.status(graph) {
            RunStatus::Cancel => {
                if let Some(step) = &self.config.on_cancel {
                    to_run.push((HandlerType::Cancel, step.clone()));
                }
            }
            RunStatus::Error => {
                if let Some(step) = &self.config.on_failure {
                    to_run.push((HandlerType::Failure, step.clone()));
                }
            }
            RunStatus::Success => {
                if let Some(step) = &self.config.on_success {
                    to_run.push((HandlerType::Success, step.clone()));
                }
            }
            _ => {}
        }
        if let Some(step) = &self.config.on_exit {
            to_run.push((HandlerType::Exit, step.clone()));
        }
        if to_run.is_empty() {
            return;
        }

        // Handlers run even after a cancel, on a fresh cancel channel.
        let (handler_cancel_tx, handler_cancel_rx) = watch::channel(false);
        let hctx = ExecContext {
            cancel: handler_cancel_rx,
            ..ctx.clone()
        };

        for (handler, step) in to_run {
            info!(handler = handler.as_str(), step = %step.name, "running lifecycle handler");
            let node = Arc::new(Node::new(step));
            self.handlers.lock().unwrap().insert(handler, node.clone());

            let state = node.execute(&hctx).await;
            if state == NodeState::Error {
                let error = node
                    .data()
                    .error
                    .unwrap_or_else(|| "unknown error".to_string());
                self.record_error(format!("handler '{}': {}", node.name(), error));
            }
            if let Some(tx) = done_tx {
                let _ = tx.send(node);
            }
        }

        drop(handler_cancel_tx);
    }

    /// Aggregate status of the graph under this scheduler.
    ///
    /// `Cancel` means the user canceled the run; a step failure (even one
    /// that stopped the rest of the graph) classifies as `Error`.
    pub fn status(&self, graph: &ExecutionGraph) -> RunStatus {
        if !graph.is_started() {
            return RunStatus::None;
        }
        if !graph.is_finished() {
            return RunStatus::Running;
        }
        let any = |state: NodeState| graph.nodes().iter().any(|n| n.state() == state);
        if self.is_canceled() {
            RunStatus::Cancel
        } else if self.last_error.lock().unwrap().is_some() || any(NodeState::Error) {
            RunStatus::Error
        } else if any(NodeState::Cancel) {
            RunStatus::Cancel
        } else {
            RunStatus::Success
        }
    }

    /// Cancel the run: stop admitting, mark unstarted nodes, and signal
    /// running children with SIGTERM (step overrides respected).
    pub fn cancel(&self, graph: &Arc<ExecutionGraph>) {
        self.signal(graph, Signal::SIGTERM, true, None);
    }

    /// Deliver `sig` to every running node's child process group.
    ///
    /// When `done` is given, it fires once every node is terminal.
    pub fn signal(
        &self,
        graph: &Arc<ExecutionGraph>,
        sig: Signal,
        allow_override: bool,
        done: Option<oneshot::Sender<()>>,
    ) {
        self.canceled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);

        self.mark_unstarted(graph, NodeState::Cancel, &None);
        for node in graph.nodes() {
            node.signal(sig, allow_override);
        }

        if let Some(done) = done {
            let graph = graph.clone();
            tokio::spawn(async move {
                while !graph.is_finished() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                let _ = done.send(());
            });
        }
    }

    fn mark_unstarted(
        &self,
        graph: &ExecutionGraph,
        state: NodeState,
        done_tx: &Option<mpsc::UnboundedSender<Arc<Node>>>,
    ) {
        for node in graph.nodes() {
            if node.state() == NodeState::None {
                node.mark(state);
                if let Some(tx) = done_tx {
                    let _ = tx.send(node.clone());
                }
            }
        }
    }

    pub fn handler_node(&self, handler: HandlerType) -> Option<Arc<Node>> {
        self.handlers.lock().unwrap().get(&handler).cloned()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn record_error(&self, msg: String) {
        let mut last = self.last_error.lock().unwrap();
        // First unrecovered error wins as the run result.
        if last.is_none() {
            *last = Some(msg);
        }
    }
}
