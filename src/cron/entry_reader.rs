// src/cron/entry_reader.rs

//! Keeps the DAGs directory in memory and turns it into cron entries.
//!
//! The reader loads DAG *metadata* (header fields, not steps) for every
//! YAML file in the directory, applies filesystem events as upserts and
//! deletions, and falls back to a full rescan every minute in case events
//! are lost.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::cron::job::DagJob;
use crate::dag::loader::{is_yaml_file, load_metadata};
use crate::dag::model::Dag;
use crate::errors::Result;

/// Rescan period; also the watcher's safety net against missed events.
const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// What a scheduled firing should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Start,
    Stop,
    Restart,
}

/// One scheduled firing: when, what, and how.
pub struct Entry {
    pub next: DateTime<Utc>,
    pub kind: EntryKind,
    pub job: DagJob,
}

pub struct EntryReader {
    dags_dir: PathBuf,
    dags: Arc<Mutex<HashMap<String, Arc<Dag>>>>,
    client: Arc<dyn Client>,
}

/// Keeps the filesystem watcher (and its pump task) alive.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
}

impl EntryReader {
    /// Create a reader and perform the initial directory scan.
    pub fn new(dags_dir: impl Into<PathBuf>, client: Arc<dyn Client>) -> Self {
        let reader = Self {
            dags_dir: dags_dir.into(),
            dags: Arc::new(Mutex::new(HashMap::new())),
            client,
        };
        reader.rescan();
        reader
    }

    /// Compute every upcoming entry as of `now`, skipping suspended DAGs.
    pub fn read(&self, now: DateTime<Utc>) -> Vec<Entry> {
        let dags = self.dags.lock().unwrap();
        let mut entries = Vec::new();

        for dag in dags.values() {
            let id = dag
                .location
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| dag.name.clone());
            if self.client.is_suspended(&id) {
                continue;
            }

            let mut add = |schedules: &[crate::dag::schedule::CronSchedule], kind: EntryKind| {
                for schedule in schedules {
                    if let Some(next) = schedule.next_after(now) {
                        entries.push(Entry {
                            next,
                            kind,
                            job: DagJob::new(
                                dag.clone(),
                                next,
                                schedule.clone(),
                                self.client.clone(),
                            ),
                        });
                    }
                }
            };

            add(&dag.schedule, EntryKind::Start);
            add(&dag.stop_schedule, EntryKind::Stop);
            add(&dag.restart_schedule, EntryKind::Restart);
        }

        entries
    }

    /// Names of the DAG files currently known (for logging/tests).
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dags.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-read the whole directory, replacing the in-memory map.
    pub fn rescan(&self) {
        let entries = match fs::read_dir(&self.dags_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dags_dir.display(), error = %e, "failed to read DAGs directory");
                return;
            }
        };

        let mut next = HashMap::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !is_yaml_file(&path) {
                continue;
            }
            match load_metadata(&path) {
                Ok(dag) => {
                    next.insert(file_key(&path), Arc::new(dag));
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to load DAG metadata");
                }
            }
        }

        let count = next.len();
        *self.dags.lock().unwrap() = next;
        debug!(dir = %self.dags_dir.display(), count, "scanned DAGs directory");
    }

    fn apply_event(&self, path: &Path) {
        if !is_yaml_file(path) {
            return;
        }
        let key = file_key(path);

        if path.exists() {
            match load_metadata(path) {
                Ok(dag) => {
                    info!(file = %key, dag = %dag.name, "DAG added/updated");
                    self.dags.lock().unwrap().insert(key, Arc::new(dag));
                }
                Err(e) => {
                    warn!(file = %key, error = %e, "failed to load DAG");
                }
            }
        } else {
            info!(file = %key, "DAG removed");
            self.dags.lock().unwrap().remove(&key);
        }
    }

    /// Watch the DAGs directory, applying create/write events as upserts
    /// and remove/rename events as deletions. A periodic rescan covers
    /// anything the watcher misses.
    pub fn start_watching(self: &Arc<Self>) -> Result<WatcherHandle> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if let Err(e) = event_tx.send(event) {
                        eprintln!("crondag: failed to forward watch event: {e}");
                    }
                }
                Err(e) => {
                    eprintln!("crondag: file watch error: {e}");
                }
            },
            Config::default(),
        )
        .map_err(|e| anyhow::anyhow!("creating watcher: {e}"))?;

        watcher
            .watch(&self.dags_dir, RecursiveMode::NonRecursive)
            .map_err(|e| anyhow::anyhow!("watching {}: {e}", self.dags_dir.display()))?;

        info!(dir = %self.dags_dir.display(), "watching DAGs directory");

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(?event, "DAGs directory event");
                for path in event.paths {
                    reader.apply_event(&path);
                }
            }
            debug!("watch event loop finished");
        });

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESCAN_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                reader.rescan();
            }
        });

        Ok(WatcherHandle { _watcher: watcher })
    }
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
