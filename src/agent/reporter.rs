// src/agent/reporter.rs

//! End-of-run reporting: the step summary written to the agent log, and
//! the mail hand-off for DAGs with SMTP configured.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::dag::model::Dag;
use crate::errors::Result;
use crate::graph::node::{Node, NodeState};
use crate::history::model::Status;

/// Outbound mail seam. The engine renders reports; delivery is injected.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Default mailer: records the rendered message in the log.
///
/// Deployments wire a real transport in via the [`Mailer`] trait; the
/// engine itself never speaks SMTP.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to, subject, "mail report:\n{body}");
        Ok(())
    }
}

pub struct Reporter {
    mailer: Arc<dyn Mailer>,
}

impl Reporter {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Log one line per finished step; mail on step error when the step
    /// asks for it.
    pub fn report_step(&self, dag: &Dag, node: &Node) {
        let data = node.data();
        info!(
            dag = %dag.name,
            step = %node.name(),
            state = %data.state,
            "step finished"
        );

        if data.state == NodeState::Error && node.step().mail_on_error {
            if let Some(smtp) = &dag.smtp {
                let subject = format!("[crondag] step failed: {} / {}", dag.name, node.name());
                let body = format!(
                    "step: {}\nstate: {}\nerror: {}\nlog: {}\n",
                    node.name(),
                    data.state,
                    data.error.as_deref().unwrap_or("-"),
                    data.log_file
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
                if let Err(e) = self.mailer.send(&smtp.to, &subject, &body) {
                    error!(error = %e, "failed to send step error mail");
                }
            }
        }
    }

    /// Render the end-of-run summary table and append it to the agent log.
    pub fn write_summary(&self, log_path: &Path, status: &Status, run_error: Option<&str>) {
        let summary = render_summary(status, run_error);
        info!("run summary:\n{summary}");

        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .and_then(|mut f| f.write_all(summary.as_bytes()));
        if let Err(e) = appended {
            error!(path = %log_path.display(), error = %e, "failed to append run summary");
        }
    }

    /// Mail the final report when the DAG is configured for it.
    pub fn send_report_mail(&self, dag: &Dag, status: &Status, run_error: Option<&str>) {
        let Some(smtp) = &dag.smtp else { return };

        let failed = run_error.is_some();
        let wanted = (failed && dag.mail_on.failure) || (!failed && dag.mail_on.success);
        if !wanted {
            return;
        }

        let subject = format!(
            "[crondag] {}: {} ({})",
            dag.name, status.status_text, status.request_id
        );
        let body = render_summary(status, run_error);
        if let Err(e) = self.mailer.send(&smtp.to, &subject, &body) {
            error!(error = %e, "failed to send report mail");
        }
    }
}

fn render_summary(status: &Status, run_error: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "run {} of '{}': {} (started {}, finished {})\n",
        status.request_id, status.name, status.status_text, status.started_at, status.finished_at,
    ));
    if let Some(err) = run_error {
        out.push_str(&format!("error: {err}\n"));
    }
    for node in &status.nodes {
        out.push_str(&format!(
            "  {:<24} {:<10} started={} finished={} retries={} error={}\n",
            node.name,
            node.state.to_string(),
            node.started_at,
            node.finished_at,
            node.retry_count,
            node.error.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::NodeState;
    use crate::graph::scheduler::RunStatus;
    use crate::history::model::NodeStatus;
    use std::collections::HashMap;

    #[test]
    fn summary_lists_every_node() {
        let status = Status {
            request_id: "req".to_string(),
            name: "demo".to_string(),
            status: RunStatus::Error,
            status_text: RunStatus::Error.to_string(),
            pid: None,
            started_at: "-".to_string(),
            finished_at: "-".to_string(),
            log: String::new(),
            params: Vec::new(),
            nodes: vec![
                NodeStatus {
                    name: "a".to_string(),
                    state: NodeState::Success,
                    started_at: "-".to_string(),
                    finished_at: "-".to_string(),
                    error: None,
                    retry_count: 0,
                    done_count: 1,
                    outputs: HashMap::new(),
                    log: None,
                },
                NodeStatus {
                    name: "b".to_string(),
                    state: NodeState::Error,
                    started_at: "-".to_string(),
                    finished_at: "-".to_string(),
                    error: Some("exit status 1".to_string()),
                    retry_count: 2,
                    done_count: 0,
                    outputs: HashMap::new(),
                    log: None,
                },
            ],
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        };

        let summary = render_summary(&status, Some("step 'b': exit status 1"));
        assert!(summary.contains("'demo'"));
        assert!(summary.contains("error: step 'b'"));
        assert!(summary.contains("a"));
        assert!(summary.contains("exit status 1"));
    }
}
