// src/graph/node.rs

//! One step instance: state machine, attempts, output capture and the
//! child process handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dag::model::{safe_name, Step};
use crate::errors::{CrondagError, Result};
use crate::exec::command::{expand_env, shell_command, split_command_with_eval, substitute_commands};
use crate::exec::condition::eval_conditions;

/// State of a node. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    None,
    Running,
    Error,
    Cancel,
    Success,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Error | NodeState::Cancel | NodeState::Success | NodeState::Skipped
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::None => "not started",
            NodeState::Running => "running",
            NodeState::Error => "failed",
            NodeState::Cancel => "canceled",
            NodeState::Success => "finished",
            NodeState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Mutable per-run data of a node, behind the node's lock.
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub state: NodeState,
    /// Executions so far, retries and repeats included.
    pub attempts: u32,
    pub retry_count: u32,
    pub done_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub outputs: HashMap<String, String>,
    pub log_file: Option<PathBuf>,
    /// Process group ID of the running child, if any.
    pub pid: Option<i32>,
}

/// Everything a node needs from its run: where to log, what environment to
/// expand against, where to publish outputs, and the cancel signal.
#[derive(Clone)]
pub struct ExecContext {
    pub log_dir: PathBuf,
    pub req_id: String,
    /// DAG-level env plus positional params (`"1"` → first param, ...).
    pub env: Arc<HashMap<String, String>>,
    /// Output variables published by completed nodes, shared across the run.
    pub outputs: Arc<Mutex<HashMap<String, String>>>,
    pub shell: Option<String>,
    pub dry: bool,
    pub cancel: watch::Receiver<bool>,
}

impl ExecContext {
    /// Snapshot of env + published outputs, outputs shadowing env.
    pub fn merged_env(&self) -> HashMap<String, String> {
        let mut merged = (*self.env).clone();
        let outputs = self.outputs.lock().unwrap();
        for (k, v) in outputs.iter() {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }
}

enum StepOutcome {
    Success,
    Canceled,
    Failed(i32),
}

/// Runtime instance of a [`Step`].
#[derive(Debug)]
pub struct Node {
    step: Step,
    data: Mutex<NodeData>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            data: Mutex::new(NodeData::default()),
        }
    }

    /// Construct a node carrying state from a previous run (retry seed).
    pub fn with_data(step: Step, data: NodeData) -> Self {
        Self {
            step,
            data: Mutex::new(data),
        }
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    /// Snapshot of the node's data.
    pub fn data(&self) -> NodeData {
        self.data.lock().unwrap().clone()
    }

    pub fn state(&self) -> NodeState {
        self.data.lock().unwrap().state
    }

    /// Transition to a terminal state without executing (cascades, cancel).
    pub fn mark(&self, state: NodeState) {
        let mut data = self.data.lock().unwrap();
        if data.state.is_terminal() {
            return;
        }
        data.state = state;
        if data.finished_at.is_none() {
            data.finished_at = Some(Utc::now());
        }
    }

    /// Whether a failure of this node lets the DAG keep going.
    pub fn should_continue(&self) -> bool {
        self.step.continue_on.failure
    }

    /// Deliver `sig` to the child's process group.
    ///
    /// With `allow_override`, a step-level `signalOnStop` takes precedence.
    pub fn signal(&self, sig: Signal, allow_override: bool) {
        let (pid, state) = {
            let data = self.data.lock().unwrap();
            (data.pid, data.state)
        };
        if state != NodeState::Running {
            return;
        }
        let sig = if allow_override {
            self.stop_signal().unwrap_or(sig)
        } else {
            sig
        };
        if let Some(pid) = pid {
            info!(step = %self.step.name, pid, signal = %sig, "signaling process group");
            if let Err(e) = killpg(Pid::from_raw(pid), sig) {
                warn!(step = %self.step.name, pid, error = %e, "failed to signal process group");
            }
        }
    }

    fn stop_signal(&self) -> Option<Signal> {
        let name = self.step.signal_on_stop.as_deref()?;
        match Signal::from_str(name) {
            Ok(sig) => Some(sig),
            Err(_) => {
                warn!(step = %self.step.name, signal = %name, "unknown signalOnStop; using default");
                None
            }
        }
    }

    /// Execute the step to a terminal state: preconditions, then the
    /// retry/repeat loop around single process runs.
    pub async fn execute(&self, ctx: &ExecContext) -> NodeState {
        {
            let mut data = self.data.lock().unwrap();
            if data.state.is_terminal() {
                return data.state;
            }
            data.state = NodeState::Running;
            data.started_at = Some(Utc::now());
        }

        if ctx.dry {
            return self.finish(NodeState::Success, None);
        }

        let env = ctx.merged_env();
        if !self.step.preconditions.is_empty() {
            let conds = self.step.preconditions.clone();
            let check = tokio::task::spawn_blocking(move || eval_conditions(&conds, &env)).await;
            match check {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    info!(step = %self.step.name, reason = %e, "precondition not met; skipping");
                    return self.finish(NodeState::Skipped, Some(e.to_string()));
                }
                Err(e) => {
                    return self.finish(NodeState::Error, Some(e.to_string()));
                }
            }
        }

        loop {
            self.data.lock().unwrap().attempts += 1;

            let outcome = match self.run_once(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return self.finish(NodeState::Error, Some(e.to_string()));
                }
            };

            match outcome {
                StepOutcome::Success => {
                    if self.step.repeat_policy.repeat {
                        self.data.lock().unwrap().done_count += 1;
                        let interval = Duration::from_secs(self.step.repeat_policy.interval);
                        if self.wait_or_cancel(ctx, interval).await {
                            return self.finish(NodeState::Cancel, None);
                        }
                        continue;
                    }
                    self.data.lock().unwrap().done_count += 1;
                    return self.finish(NodeState::Success, None);
                }
                StepOutcome::Canceled => {
                    return self.finish(NodeState::Cancel, None);
                }
                StepOutcome::Failed(code) => {
                    let retries = self.data.lock().unwrap().retry_count;
                    if retries < self.step.retry_policy.limit && !ctx.cancel_requested() {
                        self.data.lock().unwrap().retry_count += 1;
                        info!(
                            step = %self.step.name,
                            exit_code = code,
                            retry = retries + 1,
                            limit = self.step.retry_policy.limit,
                            "step failed; retrying"
                        );
                        let interval = Duration::from_secs(self.step.retry_policy.interval);
                        if self.wait_or_cancel(ctx, interval).await {
                            return self.finish(NodeState::Cancel, None);
                        }
                        continue;
                    }
                    if ctx.cancel_requested() {
                        return self.finish(NodeState::Cancel, None);
                    }
                    let msg = format!("exit status {code}");
                    let state = if self.step.continue_on.mark_success {
                        NodeState::Success
                    } else {
                        NodeState::Error
                    };
                    return self.finish(state, Some(msg));
                }
            }
        }
    }

    /// Sleep for `interval`, returning `true` if cancellation arrived first.
    async fn wait_or_cancel(&self, ctx: &ExecContext, interval: Duration) -> bool {
        if ctx.cancel_requested() {
            return true;
        }
        let mut cancel = ctx.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = cancel.changed() => *cancel.borrow(),
        }
    }

    /// One process launch: expand the command, spawn in its own process
    /// group, stream stdout/stderr to the step log, capture `output`.
    async fn run_once(&self, ctx: &ExecContext) -> Result<StepOutcome> {
        let env = ctx.merged_env();
        let (program, args) = self.resolve_command(ctx, &env).await?;
        let log_path = self.ensure_log_file(ctx)?;

        debug!(step = %self.step.name, program = %program, ?args, "spawning step process");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = &self.step.dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            CrondagError::StepFailed(format!("spawning '{}': {e}", self.step.name))
        })?;

        let pid = child.id().map(|p| p as i32);
        self.data.lock().unwrap().pid = pid;

        let capture = Arc::new(Mutex::new(String::new()));
        let wants_output = self.step.output.is_some();

        let stdout_task = child.stdout.take().map(|stdout| {
            let log_path = log_path.clone();
            let capture = Arc::clone(&capture);
            tokio::spawn(async move {
                stream_to_log(stdout, &log_path, wants_output.then_some(capture)).await;
            })
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            let log_path = log_path.clone();
            tokio::spawn(async move {
                stream_to_log(stderr, &log_path, None).await;
            })
        });

        let status = child.wait().await.map_err(|e| {
            CrondagError::StepFailed(format!("waiting for '{}': {e}", self.step.name))
        })?;

        if let Some(t) = stdout_task {
            let _ = t.await;
        }
        if let Some(t) = stderr_task {
            let _ = t.await;
        }
        self.data.lock().unwrap().pid = None;

        if let Some(var) = &self.step.output {
            let value = capture.lock().unwrap().trim_end_matches('\n').to_string();
            self.data
                .lock()
                .unwrap()
                .outputs
                .insert(var.clone(), value.clone());
            ctx.outputs.lock().unwrap().insert(var.clone(), value);
        }

        use std::os::unix::process::ExitStatusExt;
        if let Some(code) = status.code() {
            if code == 0 || self.step.continue_on.exit_code.contains(&code) {
                Ok(StepOutcome::Success)
            } else {
                Ok(StepOutcome::Failed(code))
            }
        } else if ctx.cancel_requested() {
            Ok(StepOutcome::Canceled)
        } else {
            Ok(StepOutcome::Failed(
                status.signal().map(|s| 128 + s).unwrap_or(-1),
            ))
        }
    }

    /// Turn the step definition into a `(program, args)` pair.
    ///
    /// Sub-DAG steps re-invoke this executable; command strings run through
    /// the DAG's shell after env expansion and backtick substitution; when
    /// no shell is resolvable the expanded words are executed directly.
    async fn resolve_command(
        &self,
        ctx: &ExecContext,
        env: &HashMap<String, String>,
    ) -> Result<(String, Vec<String>)> {
        if let Some(sub) = &self.step.sub_dag {
            let exe = std::env::current_exe()
                .map_err(|e| CrondagError::StepFailed(format!("locating executable: {e}")))?;
            let mut args = vec!["start".to_string(), sub.location.clone()];
            if !sub.params.is_empty() {
                args.push("--".to_string());
                args.extend(sub.params.iter().cloned());
            }
            return Ok((exe.to_string_lossy().into_owned(), args));
        }

        let raw = self.step.cmd_with_args.clone();
        if raw.trim().is_empty() {
            return Err(CrondagError::CommandEmpty);
        }

        let env = env.clone();
        let shell = shell_command(ctx.shell.as_deref());
        tokio::task::spawn_blocking(move || {
            let expanded = substitute_commands(&expand_env(&raw, &env))?;
            match shell {
                Some(shell) => Ok((shell, vec!["-c".to_string(), expanded])),
                None => split_command_with_eval(&expanded, &env),
            }
        })
        .await
        .map_err(|e| CrondagError::StepFailed(e.to_string()))?
    }

    fn ensure_log_file(&self, ctx: &ExecContext) -> Result<PathBuf> {
        let mut data = self.data.lock().unwrap();
        if let Some(path) = &data.log_file {
            return Ok(path.clone());
        }
        let reqid8: String = ctx.req_id.chars().take(8).collect();
        let path = ctx.log_dir.join(format!(
            "{}.{}.{}.log",
            safe_name(&self.step.name),
            Utc::now().format("%Y%m%d.%H:%M:%S%.3f"),
            reqid8,
        ));
        data.log_file = Some(path.clone());
        Ok(path)
    }

    fn finish(&self, state: NodeState, error: Option<String>) -> NodeState {
        let mut data = self.data.lock().unwrap();
        data.state = state;
        data.finished_at = Some(Utc::now());
        if let Some(e) = error {
            data.error = Some(e);
        }
        state
    }
}

/// Append lines from a child stream to the step log, optionally collecting
/// them into `capture` for output-variable steps.
async fn stream_to_log(
    stream: impl tokio::io::AsyncRead + Unpin,
    log_path: &Path,
    capture: Option<Arc<Mutex<String>>>,
) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %log_path.display(), error = %e, "failed to open step log");
            return;
        }
    };

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(capture) = &capture {
            let mut buf = capture.lock().unwrap();
            buf.push_str(&line);
            buf.push('\n');
        }
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }
    let _ = file.flush().await;
}
