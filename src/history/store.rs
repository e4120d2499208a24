// src/history/store.rs

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::dag::model::safe_name;
use crate::errors::{CrondagError, Result};
use crate::history::model::Status;

/// Storage seam for run history. One open session per run; reads work
/// without a session.
pub trait HistoryStore: Send + Sync {
    /// Begin a session for a new run of the DAG at `location`.
    fn open(&self, location: &Path, ts: DateTime<Utc>, req_id: &str) -> Result<()>;

    /// Persist a status snapshot into the open session.
    fn write(&self, status: &Status) -> Result<()>;

    /// End the session. Further writes fail.
    fn close(&self) -> Result<()>;

    /// Most recent persisted status for the DAG, if any.
    fn latest(&self, location: &Path) -> Result<Option<Status>>;

    /// Up to `n` most recent statuses, newest first.
    fn recent(&self, location: &Path, n: usize) -> Result<Vec<Status>>;

    /// Status of a specific historical run.
    fn find_by_request_id(&self, location: &Path, req_id: &str) -> Result<Option<Status>>;

    /// Delete run documents older than `retention_days`. Negative retention
    /// keeps everything.
    fn remove_old(&self, location: &Path, retention_days: i64) -> Result<()>;
}

/// File-backed history: one JSON document per run under
/// `<data_dir>/<safe_stem>-<location hash>/`.
///
/// File names embed a sortable timestamp, so "latest" and "recent" are
/// directory listings sorted descending.
pub struct JsonHistoryStore {
    data_dir: PathBuf,
    session: Mutex<Option<PathBuf>>,
}

impl JsonHistoryStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            session: Mutex::new(None),
        }
    }

    /// Directory holding the run documents of the DAG at `location`.
    fn dag_dir(&self, location: &Path) -> PathBuf {
        let stem = location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dag".to_string());
        let mut hasher = DefaultHasher::new();
        location.to_string_lossy().hash(&mut hasher);
        self.data_dir
            .join(format!("{}-{:016x}", safe_name(&stem), hasher.finish()))
    }

    /// Run documents sorted newest first.
    fn sorted_entries(&self, location: &Path) -> Result<Vec<PathBuf>> {
        let dir = self.dag_dir(location);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        entries.sort();
        entries.reverse();
        Ok(entries)
    }

    fn read_status(path: &Path) -> Option<Status> {
        match fs::read_to_string(path) {
            Ok(contents) => match Status::from_json(&contents) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable status document");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read status document");
                None
            }
        }
    }
}

impl HistoryStore for JsonHistoryStore {
    fn open(&self, location: &Path, ts: DateTime<Utc>, req_id: &str) -> Result<()> {
        let dir = self.dag_dir(location);
        fs::create_dir_all(&dir)?;

        let stem = location
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dag".to_string());
        let reqid8: String = req_id.chars().take(8).collect();
        let path = dir.join(format!(
            "{}.{}.{}.json",
            safe_name(&stem),
            ts.format("%Y%m%d.%H%M%S%.3f"),
            reqid8,
        ));

        debug!(path = %path.display(), "opening history session");
        *self.session.lock().unwrap() = Some(path);
        Ok(())
    }

    fn write(&self, status: &Status) -> Result<()> {
        let session = self.session.lock().unwrap();
        let Some(path) = session.as_ref() else {
            return Err(CrondagError::HistoryIo(
                "write without an open session".to_string(),
            ));
        };
        let json = status.to_json()?;
        fs::write(path, json).map_err(|e| CrondagError::HistoryIo(e.to_string()))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.session.lock().unwrap() = None;
        Ok(())
    }

    fn latest(&self, location: &Path) -> Result<Option<Status>> {
        Ok(self
            .sorted_entries(location)?
            .iter()
            .find_map(|p| Self::read_status(p)))
    }

    fn recent(&self, location: &Path, n: usize) -> Result<Vec<Status>> {
        Ok(self
            .sorted_entries(location)?
            .iter()
            .filter_map(|p| Self::read_status(p))
            .take(n)
            .collect())
    }

    fn find_by_request_id(&self, location: &Path, req_id: &str) -> Result<Option<Status>> {
        Ok(self
            .sorted_entries(location)?
            .iter()
            .filter_map(|p| Self::read_status(p))
            .find(|s| s.request_id == req_id))
    }

    fn remove_old(&self, location: &Path, retention_days: i64) -> Result<()> {
        if retention_days < 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - Duration::days(retention_days);

        for path in self.sorted_entries(location)? {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                debug!(path = %path.display(), "purging old run document");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to purge run document");
                }
            }
        }
        Ok(())
    }
}
