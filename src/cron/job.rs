// src/cron/job.rs

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info};

use crate::client::Client;
use crate::dag::model::Dag;
use crate::dag::schedule::CronSchedule;
use crate::errors::{CrondagError, Result};
use crate::graph::scheduler::RunStatus;
use crate::history::model::{parse_time, Status};

/// One scheduled firing of a DAG, with the pre-run guards that keep the
/// cron loop from double-starting or re-running finished work.
pub struct DagJob {
    dag: Arc<Dag>,
    /// The instant this job was scheduled for.
    next: DateTime<Utc>,
    schedule: CronSchedule,
    client: Arc<dyn Client>,
}

impl DagJob {
    pub fn new(
        dag: Arc<Dag>,
        next: DateTime<Utc>,
        schedule: CronSchedule,
        client: Arc<dyn Client>,
    ) -> Self {
        Self {
            dag,
            next,
            schedule,
            client,
        }
    }

    pub fn dag_name(&self) -> &str {
        &self.dag.name
    }

    /// Start the DAG unless a guard says otherwise.
    pub fn start(&self) -> Result<()> {
        let latest = self.client.get_latest_status(&self.dag)?;

        if latest.status == RunStatus::Running {
            return Err(CrondagError::JobRunning);
        }
        self.ready(&latest)?;

        info!(dag = %self.dag.name, "cron: starting DAG");
        self.client.start(&self.dag, &[])
    }

    /// Guards shared by `start`: already finished for this window, or
    /// skip-if-successful.
    fn ready(&self, latest: &Status) -> Result<()> {
        if latest.status == RunStatus::Running {
            return Err(CrondagError::JobRunning);
        }

        let Some(started) = parse_time(&latest.started_at) else {
            // Never ran (or unparsable record): nothing blocks the start.
            return Ok(());
        };

        // Minute granularity matches the cron grid.
        let started = truncate_to_minute(started);
        if started >= self.next {
            return Err(CrondagError::JobFinished);
        }

        self.skip_if_successful(latest, started)
    }

    /// `skipIfSuccessful`: at most one successful run per scheduling
    /// window `[prev, next)`.
    fn skip_if_successful(&self, latest: &Status, started: DateTime<Utc>) -> Result<()> {
        if !self.dag.skip_if_successful || latest.status != RunStatus::Success {
            return Ok(());
        }

        let prev = self.schedule.prev_before(self.next);
        if started >= prev && started < self.next {
            debug!(
                dag = %self.dag.name,
                started = %started,
                window_start = %prev,
                "already ran successfully in this window; skipping"
            );
            return Err(CrondagError::JobSuccess);
        }
        Ok(())
    }

    /// Stop the DAG if it is running.
    pub fn stop(&self) -> Result<()> {
        let latest = self.client.get_latest_status(&self.dag)?;
        if latest.status != RunStatus::Running {
            return Err(CrondagError::JobNotRunning);
        }
        info!(dag = %self.dag.name, "cron: stopping DAG");
        self.client.stop(&self.dag)
    }

    /// Restart unconditionally.
    pub fn restart(&self) -> Result<()> {
        info!(dag = %self.dag.name, "cron: restarting DAG");
        self.client.restart(&self.dag)
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}
