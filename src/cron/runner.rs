// src/cron/runner.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::cron::entry_reader::{Entry, EntryKind, EntryReader};

/// How long to sleep when no DAG has any schedule.
const IDLE_SLEEP: Duration = Duration::from_secs(60);

/// The cron loop: sleep until the earliest upcoming entry, fire every
/// entry due at that instant, re-read, repeat.
pub struct CronRunner {
    reader: Arc<EntryReader>,
}

impl CronRunner {
    pub fn new(reader: Arc<EntryReader>) -> Self {
        Self { reader }
    }

    /// Run until `stop` flips to `true`.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!("cron scheduler started");

        loop {
            if *stop.borrow() {
                break;
            }

            let now = Utc::now();
            let entries = self.reader.read(now);

            let Some(next) = entries.iter().map(|e| e.next).min() else {
                debug!("no scheduled DAGs; sleeping");
                if self.sleep_or_stop(IDLE_SLEEP, &mut stop).await {
                    break;
                }
                continue;
            };

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, ?wait, "sleeping until next entry");
            if self.sleep_or_stop(wait, &mut stop).await {
                break;
            }

            for entry in entries.into_iter().filter(|e| e.next == next) {
                invoke(entry);
            }
        }

        info!("cron scheduler stopped");
    }

    /// Returns `true` when stop was requested during the sleep.
    async fn sleep_or_stop(&self, wait: Duration, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => false,
            _ = stop.changed() => *stop.borrow(),
        }
    }
}

/// Fire one entry on the blocking pool; job errors are logged, never fatal
/// to the loop.
fn invoke(entry: Entry) {
    tokio::task::spawn_blocking(move || {
        let name = entry.job.dag_name().to_string();
        let result = match entry.kind {
            EntryKind::Start => entry.job.start(),
            EntryKind::Stop => entry.job.stop(),
            EntryKind::Restart => entry.job.restart(),
        };
        match result {
            Ok(()) => {
                debug!(dag = %name, kind = ?entry.kind, "job invoked");
            }
            Err(e) => {
                // Guard skips (already running / finished / succeeded) are
                // routine; log them at info, real failures at error.
                use crate::errors::CrondagError;
                match e {
                    CrondagError::JobRunning
                    | CrondagError::JobFinished
                    | CrondagError::JobSuccess
                    | CrondagError::JobNotRunning => {
                        info!(dag = %name, kind = ?entry.kind, reason = %e, "job skipped");
                    }
                    _ => {
                        error!(dag = %name, kind = ?entry.kind, error = %e, "job failed");
                    }
                }
            }
        }
    });
}
