// src/dag/model.rs

//! DAG and step definitions.
//!
//! [`RawDag`] is a direct serde mapping of the YAML file. [`Dag`] is the
//! validated, parsed form the rest of the engine works with; the conversion
//! happens in [`Dag::build`], driven by the loader.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dag::schedule::CronSchedule;
use crate::errors::{CrondagError, Result};

/// Default steps-per-DAG concurrency.
const DEFAULT_MAX_ACTIVE_RUNS: u32 = 1;
/// Grace period before escalating a stop signal to SIGKILL.
const DEFAULT_MAX_CLEANUP_SECS: u64 = 60;
/// How long run history is kept, in days.
const DEFAULT_HIST_RETENTION_DAYS: i64 = 30;

/// A validated DAG definition, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Dag {
    pub name: String,
    pub location: PathBuf,
    pub description: Option<String>,
    pub schedule: Vec<CronSchedule>,
    pub stop_schedule: Vec<CronSchedule>,
    pub restart_schedule: Vec<CronSchedule>,
    pub env: Vec<(String, String)>,
    pub log_dir: Option<PathBuf>,
    /// Default positional params, exported as `$1..$n`.
    pub params: Vec<String>,
    pub preconditions: Vec<Precondition>,
    pub max_active_runs: u32,
    /// Pause between step admissions.
    pub delay: Duration,
    pub max_cleanup_time: Duration,
    pub hist_retention_days: i64,
    pub restart_wait: Duration,
    pub skip_if_successful: bool,
    pub handler_on: HandlerOn,
    pub smtp: Option<SmtpConfig>,
    pub mail_on: MailOn,
    /// Shell used to run commands; `$SHELL` or `sh` when unset.
    pub shell: Option<String>,
    pub steps: Vec<Step>,
}

impl Dag {
    /// Build a [`Dag`] from its raw YAML form.
    ///
    /// Parses cron expressions and normalises steps; structural validation
    /// (dependency references, cycles) lives in [`crate::dag::validate`].
    pub fn build(raw: RawDag, location: &Path) -> Result<Self> {
        let name = match raw.name {
            Some(n) if !n.trim().is_empty() => n,
            _ => location
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dag".to_string()),
        };

        let steps = raw
            .steps
            .into_iter()
            .map(Step::build)
            .collect::<Result<Vec<_>>>()?;

        let handler_on = HandlerOn {
            success: build_handler(raw.handler_on.success, "onSuccess")?,
            failure: build_handler(raw.handler_on.failure, "onFailure")?,
            cancel: build_handler(raw.handler_on.cancel, "onCancel")?,
            exit: build_handler(raw.handler_on.exit, "onExit")?,
        };

        Ok(Self {
            name,
            location: location.to_path_buf(),
            description: raw.description,
            schedule: parse_schedules(raw.schedule)?,
            stop_schedule: parse_schedules(raw.stop_schedule)?,
            restart_schedule: parse_schedules(raw.restart_schedule)?,
            env: raw.env.into_pairs(),
            log_dir: raw.log_dir.map(PathBuf::from),
            params: split_params(raw.params.as_deref()),
            preconditions: raw.preconditions,
            max_active_runs: raw.max_active_runs.max(1),
            delay: Duration::from_secs(raw.delay),
            max_cleanup_time: Duration::from_secs(raw.max_clean_up_time),
            hist_retention_days: raw.hist_retention_days,
            restart_wait: Duration::from_secs(raw.restart_wait),
            skip_if_successful: raw.skip_if_successful,
            handler_on,
            smtp: raw.smtp,
            mail_on: raw.mail_on,
            shell: raw.shell,
            steps,
        })
    }

    /// Filesystem path of the per-run control socket.
    ///
    /// Derived from the DAG *location* (not just the name) so that two files
    /// with the same stem get distinct sockets. Stable across restarts so
    /// other processes can find a live agent.
    pub fn sock_addr(&self) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        self.location.to_string_lossy().hash(&mut hasher);
        let digest = hasher.finish();
        std::env::temp_dir().join(format!(
            "crondag-{}-{:016x}.sock",
            safe_name(&self.name),
            digest
        ))
    }

    /// The DAG name reduced to filename-safe characters.
    pub fn safe_name(&self) -> String {
        safe_name(&self.name)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Replace everything outside `[A-Za-z0-9_-]` and truncate, so DAG names can
/// appear in file and socket paths.
pub fn safe_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(50);
    out
}

fn parse_schedules(exprs: StringOrList) -> Result<Vec<CronSchedule>> {
    exprs
        .into_vec()
        .iter()
        .map(|e| CronSchedule::parse(e))
        .collect()
}

fn split_params(params: Option<&str>) -> Vec<String> {
    params
        .map(|p| p.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn build_handler(raw: Option<RawStep>, default_name: &str) -> Result<Option<Step>> {
    match raw {
        None => Ok(None),
        Some(mut raw) => {
            if raw.name.trim().is_empty() {
                raw.name = default_name.to_string();
            }
            Step::build(raw).map(Some)
        }
    }
}

/// One declarative unit of work: a command, or a sub-DAG invocation.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    /// Program to run, when `command` was given as a list or with `args`.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// The full command line as written, used for shell execution and display.
    pub cmd_with_args: String,
    pub dir: Option<PathBuf>,
    pub depends: Vec<String>,
    pub retry_policy: RetryPolicy,
    pub repeat_policy: RepeatPolicy,
    pub continue_on: ContinueOn,
    pub preconditions: Vec<Precondition>,
    /// Variable name capturing this step's stdout for downstream steps.
    pub output: Option<String>,
    pub mail_on_error: bool,
    pub sub_dag: Option<SubDag>,
    /// Signal name (e.g. "SIGINT") sent on stop instead of SIGTERM.
    pub signal_on_stop: Option<String>,
}

impl Step {
    fn build(raw: RawStep) -> Result<Self> {
        let sub_dag = raw.run.map(|run| SubDag {
            location: run,
            params: split_params(raw.params.as_deref()),
        });

        let (command, args, cmd_with_args) = match raw.command {
            Some(CommandField::Line(line)) => {
                let cmd_with_args = if raw.args.is_empty() {
                    line.clone()
                } else {
                    format!("{} {}", line, raw.args.join(" "))
                };
                (Some(line), raw.args, cmd_with_args)
            }
            Some(CommandField::Words(words)) => {
                if words.is_empty() {
                    return Err(CrondagError::CommandEmpty);
                }
                let mut args = words[1..].to_vec();
                args.extend(raw.args);
                let cmd_with_args = std::iter::once(words[0].as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ");
                (Some(words[0].clone()), args, cmd_with_args)
            }
            None => {
                if sub_dag.is_none() {
                    return Err(CrondagError::CommandEmpty);
                }
                (None, Vec::new(), String::new())
            }
        };

        Ok(Self {
            name: raw.name,
            command,
            args,
            cmd_with_args,
            dir: raw.dir.map(PathBuf::from),
            depends: raw.depends,
            retry_policy: raw.retry_policy,
            repeat_policy: raw.repeat_policy,
            continue_on: raw.continue_on,
            preconditions: raw.preconditions,
            output: raw.output,
            mail_on_error: raw.mail_on_error,
            sub_dag,
            signal_on_stop: raw.signal_on_stop,
        })
    }
}

/// Reference to another DAG file, run as a child invocation.
#[derive(Debug, Clone)]
pub struct SubDag {
    pub location: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub limit: u32,
    /// Seconds between attempts.
    #[serde(default)]
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct RepeatPolicy {
    #[serde(default)]
    pub repeat: bool,
    /// Seconds between repetitions.
    #[serde(default)]
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
    /// Report the step as `Success` when it is allowed to continue.
    #[serde(default)]
    pub mark_success: bool,
    /// Exit codes treated as success.
    #[serde(default)]
    pub exit_code: Vec<i32>,
}

/// A shell condition evaluated before running a DAG or step.
///
/// `condition` is expanded (env vars, backticks) and compared to `expected`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Precondition {
    pub condition: String,
    pub expected: String,
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOn {
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
    pub exit: Option<Step>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct MailOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub success: bool,
}

/// Top-level YAML mapping, before parsing and validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawDag {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: StringOrList,
    #[serde(default)]
    pub stop_schedule: StringOrList,
    #[serde(default)]
    pub restart_schedule: StringOrList,
    #[serde(default)]
    pub env: EnvField,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub params: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: u32,
    /// Seconds between step admissions.
    #[serde(default)]
    pub delay: u64,
    /// Seconds allowed for graceful cleanup before SIGKILL.
    #[serde(default = "default_max_cleanup", rename = "maxCleanUpTime")]
    pub max_clean_up_time: u64,
    #[serde(default = "default_hist_retention_days")]
    pub hist_retention_days: i64,
    /// Seconds to wait between stop and start on restart.
    #[serde(default)]
    pub restart_wait: u64,
    #[serde(default)]
    pub skip_if_successful: bool,
    #[serde(default)]
    pub handler_on: RawHandlerOn,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub mail_on: MailOn,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub steps: Vec<RawStep>,
}

fn default_max_active_runs() -> u32 {
    DEFAULT_MAX_ACTIVE_RUNS
}

fn default_max_cleanup() -> u64 {
    DEFAULT_MAX_CLEANUP_SECS
}

fn default_hist_retention_days() -> i64 {
    DEFAULT_HIST_RETENTION_DAYS
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawHandlerOn {
    #[serde(default)]
    pub success: Option<RawStep>,
    #[serde(default)]
    pub failure: Option<RawStep>,
    #[serde(default)]
    pub cancel: Option<RawStep>,
    #[serde(default)]
    pub exit: Option<RawStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: Option<CommandField>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub repeat_policy: RepeatPolicy,
    #[serde(default)]
    pub continue_on: ContinueOn,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub mail_on_error: bool,
    /// Path to a sub-DAG file, run as a child invocation.
    #[serde(default)]
    pub run: Option<String>,
    /// Params passed to the sub-DAG.
    #[serde(default)]
    pub params: Option<String>,
    #[serde(default)]
    pub signal_on_stop: Option<String>,
}

/// `command: echo hello` or `command: [echo, hello]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandField {
    Line(String),
    Words(Vec<String>),
}

/// A YAML field that is either a single string or a list of strings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum StringOrList {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::None => Vec::new(),
            StringOrList::One(s) => vec![s],
            StringOrList::Many(v) => v,
        }
    }
}

/// `env:` as either a mapping or a list of `KEY=VALUE` strings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum EnvField {
    #[default]
    None,
    Map(BTreeMap<String, String>),
    Pairs(Vec<String>),
}

impl EnvField {
    pub fn into_pairs(self) -> Vec<(String, String)> {
        match self {
            EnvField::None => Vec::new(),
            EnvField::Map(m) => m.into_iter().collect(),
            EnvField::Pairs(v) => v
                .into_iter()
                .filter_map(|entry| {
                    entry
                        .split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect(),
        }
    }
}
