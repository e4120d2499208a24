// tests/cron_entries.rs

mod common;

use crate::common::builders::write_dag_file;
use crate::common::{init_tracing, with_timeout};

use std::collections::HashSet;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use crondag::client::Client;
use crondag::cron::{DagJob, EntryKind, EntryReader};
use crondag::dag::model::Dag;
use crondag::dag::schedule::CronSchedule;
use crondag::errors::{CrondagError, Result as CrondagResult};
use crondag::graph::RunStatus;
use crondag::history::model::{format_time, Status};

type TestResult = Result<(), Box<dyn Error>>;

/// Records facade calls and serves a canned latest status, so job guards
/// can be exercised without spawning processes.
#[derive(Default)]
struct FakeClient {
    latest: Mutex<Option<Status>>,
    suspended: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeClient {
    fn set_latest(&self, status: Status) {
        *self.latest.lock().unwrap() = Some(status);
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

fn canned_status(state: RunStatus, started_at: Option<chrono::DateTime<Utc>>) -> Status {
    Status {
        request_id: "fake-request".to_string(),
        name: "demo".to_string(),
        status: state,
        status_text: state.to_string(),
        pid: None,
        started_at: format_time(started_at),
        finished_at: "-".to_string(),
        log: String::new(),
        params: Vec::new(),
        nodes: Vec::new(),
        on_exit: None,
        on_success: None,
        on_failure: None,
        on_cancel: None,
    }
}

impl Client for FakeClient {
    fn get_latest_status(&self, _dag: &Dag) -> CrondagResult<Status> {
        Ok(self
            .latest
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| canned_status(RunStatus::None, None)))
    }

    fn get_current_status(&self, dag: &Dag) -> CrondagResult<Status> {
        self.get_latest_status(dag)
    }

    fn start(&self, dag: &Dag, _params: &[String]) -> CrondagResult<()> {
        self.started.lock().unwrap().push(dag.name.clone());
        Ok(())
    }

    fn stop(&self, dag: &Dag) -> CrondagResult<()> {
        self.stopped.lock().unwrap().push(dag.name.clone());
        Ok(())
    }

    fn restart(&self, dag: &Dag) -> CrondagResult<()> {
        self.started.lock().unwrap().push(dag.name.clone());
        Ok(())
    }

    fn is_suspended(&self, id: &str) -> bool {
        self.suspended.lock().unwrap().contains(id)
    }

    fn toggle_suspend(&self, id: &str, suspend: bool) -> CrondagResult<()> {
        let mut set = self.suspended.lock().unwrap();
        if suspend {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
        Ok(())
    }

    fn get_recent_history(&self, _dag: &Dag, _n: usize) -> CrondagResult<Vec<Status>> {
        Ok(Vec::new())
    }
}

const SCHEDULED_DAG: &str = "schedule: \"*/5 * * * *\"\nsteps:\n  - name: a\n    command: echo 1\n";
const UNSCHEDULED_DAG: &str = "steps:\n  - name: a\n    command: echo 1\n";

#[test]
fn reader_emits_one_entry_per_schedule() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_dag_file(tmp.path(), "every5", SCHEDULED_DAG);
    write_dag_file(tmp.path(), "manual", UNSCHEDULED_DAG);

    let client = Arc::new(FakeClient::default());
    let reader = EntryReader::new(tmp.path(), client);

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
    let entries = reader.read(now);

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Start);
    assert_eq!(
        entries[0].next,
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap()
    );
}

#[test]
fn stop_and_restart_schedules_get_their_own_entries() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_dag_file(
        tmp.path(),
        "full",
        "schedule: \"0 8 * * *\"\nstopSchedule: \"0 18 * * *\"\nrestartSchedule: \"0 12 * * *\"\nsteps:\n  - name: a\n    command: echo 1\n",
    );

    let client = Arc::new(FakeClient::default());
    let reader = EntryReader::new(tmp.path(), client);

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let entries = reader.read(now);

    let kinds: HashSet<EntryKind> = entries.iter().map(|e| e.kind).collect();
    assert_eq!(entries.len(), 3);
    assert!(kinds.contains(&EntryKind::Start));
    assert!(kinds.contains(&EntryKind::Stop));
    assert!(kinds.contains(&EntryKind::Restart));
}

#[test]
fn suspended_dags_are_skipped() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    write_dag_file(tmp.path(), "every5", SCHEDULED_DAG);

    let client = Arc::new(FakeClient::default());
    client.toggle_suspend("every5", true).unwrap();
    let reader = EntryReader::new(tmp.path(), client);

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap();
    assert!(reader.read(now).is_empty());
}

#[test]
fn rescan_reflects_added_and_removed_files() {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();

    let client = Arc::new(FakeClient::default());
    let reader = EntryReader::new(tmp.path(), client);
    assert!(reader.file_names().is_empty());

    let path = write_dag_file(tmp.path(), "late", SCHEDULED_DAG);
    reader.rescan();
    assert_eq!(reader.file_names(), vec!["late.yaml".to_string()]);

    std::fs::remove_file(path).unwrap();
    reader.rescan();
    assert!(reader.file_names().is_empty());
}

#[tokio::test]
async fn watcher_applies_changes_without_rescan() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let client = Arc::new(FakeClient::default());
        let reader = Arc::new(EntryReader::new(tmp.path(), client));
        let _watcher = reader.start_watching()?;

        write_dag_file(tmp.path(), "appeared", SCHEDULED_DAG);

        let mut waited = Duration::ZERO;
        while reader.file_names().is_empty() {
            assert!(waited < Duration::from_secs(5), "watcher never saw the file");
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += Duration::from_millis(100);
        }
        assert_eq!(reader.file_names(), vec!["appeared.yaml".to_string()]);

        std::fs::remove_file(tmp.path().join("appeared.yaml"))?;
        let mut waited = Duration::ZERO;
        while !reader.file_names().is_empty() {
            assert!(waited < Duration::from_secs(5), "watcher never saw the removal");
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += Duration::from_millis(100);
        }
        Ok(())
    })
    .await
}

fn job_with(client: Arc<FakeClient>, skip_if_successful: bool) -> DagJob {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = if skip_if_successful {
        format!("skipIfSuccessful: true\n{SCHEDULED_DAG}")
    } else {
        SCHEDULED_DAG.to_string()
    };
    let path = write_dag_file(tmp.path(), "demo", &yaml);
    let dag = Arc::new(crondag::dag::loader::load_metadata(path).unwrap());

    let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
    let next = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
    DagJob::new(dag, next, schedule, client)
}

#[test]
fn start_is_skipped_while_running() {
    init_tracing();
    let client = Arc::new(FakeClient::default());
    client.set_latest(canned_status(RunStatus::Running, Some(Utc::now())));

    let job = job_with(client.clone(), false);
    assert!(matches!(job.start(), Err(CrondagError::JobRunning)));
    assert!(client.started().is_empty());
}

#[test]
fn start_is_skipped_when_already_run_for_this_instant() {
    init_tracing();
    let client = Arc::new(FakeClient::default());
    // Started within the scheduled minute itself.
    let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 40).unwrap();
    client.set_latest(canned_status(RunStatus::Error, Some(started)));

    let job = job_with(client.clone(), false);
    assert!(matches!(job.start(), Err(CrondagError::JobFinished)));
    assert!(client.started().is_empty());
}

#[test]
fn skip_if_successful_suppresses_rerun_in_same_window() {
    init_tracing();
    let client = Arc::new(FakeClient::default());
    // Succeeded inside the current window [12:00, 12:05).
    let started = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 10).unwrap();
    client.set_latest(canned_status(RunStatus::Success, Some(started)));

    let job = job_with(client.clone(), true);
    assert!(matches!(job.start(), Err(CrondagError::JobSuccess)));
    assert!(client.started().is_empty());
}

#[test]
fn success_outside_window_does_not_suppress() {
    init_tracing();
    let client = Arc::new(FakeClient::default());
    // Succeeded in a previous window.
    let started = Utc.with_ymd_and_hms(2024, 3, 1, 11, 55, 10).unwrap();
    client.set_latest(canned_status(RunStatus::Success, Some(started)));

    let job = job_with(client.clone(), true);
    job.start().unwrap();
    assert_eq!(client.started(), vec!["demo".to_string()]);
}

#[test]
fn fresh_dag_starts() {
    init_tracing();
    let client = Arc::new(FakeClient::default());

    let job = job_with(client.clone(), false);
    job.start().unwrap();
    assert_eq!(client.started(), vec!["demo".to_string()]);
}

#[test]
fn stop_requires_a_running_dag() {
    init_tracing();
    let client = Arc::new(FakeClient::default());
    let job = job_with(client.clone(), false);
    assert!(matches!(job.stop(), Err(CrondagError::JobNotRunning)));

    client.set_latest(canned_status(RunStatus::Running, Some(Utc::now())));
    job.stop().unwrap();
    assert_eq!(*client.stopped.lock().unwrap(), vec!["demo".to_string()]);
}
