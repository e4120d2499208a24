//! Shared builders for tests: in-memory [`Step`]s and on-disk DAG files.

use std::path::{Path, PathBuf};

use crondag::dag::model::{
    ContinueOn, Precondition, RepeatPolicy, RetryPolicy, Step,
};

/// Builder for a [`Step`] used directly against the graph scheduler.
pub struct StepBuilder {
    step: Step,
}

impl StepBuilder {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            step: Step {
                name: name.to_string(),
                command: None,
                args: Vec::new(),
                cmd_with_args: cmd.to_string(),
                dir: None,
                depends: Vec::new(),
                retry_policy: RetryPolicy::default(),
                repeat_policy: RepeatPolicy::default(),
                continue_on: ContinueOn::default(),
                preconditions: Vec::new(),
                output: None,
                mail_on_error: false,
                sub_dag: None,
                signal_on_stop: None,
            },
        }
    }

    pub fn depends(mut self, deps: &[&str]) -> Self {
        self.step.depends = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn retry(mut self, limit: u32, interval_secs: u64) -> Self {
        self.step.retry_policy = RetryPolicy {
            limit,
            interval: interval_secs,
        };
        self
    }

    pub fn continue_on(mut self, continue_on: ContinueOn) -> Self {
        self.step.continue_on = continue_on;
        self
    }

    pub fn precondition(mut self, condition: &str, expected: &str) -> Self {
        self.step.preconditions.push(Precondition {
            condition: condition.to_string(),
            expected: expected.to_string(),
        });
        self
    }

    pub fn output(mut self, var: &str) -> Self {
        self.step.output = Some(var.to_string());
        self
    }

    pub fn build(self) -> Step {
        self.step
    }
}

/// Write a DAG YAML file into `dir` and return its path.
pub fn write_dag_file(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(format!("{name}.yaml"));
    std::fs::write(&path, yaml).expect("write DAG file");
    path
}
