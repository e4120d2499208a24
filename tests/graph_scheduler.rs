// tests/graph_scheduler.rs

mod common;

use crate::common::builders::StepBuilder;
use crate::common::{init_tracing, with_timeout};

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crondag::dag::model::ContinueOn;
use crondag::graph::{ExecutionGraph, GraphScheduler, HandlerType, NodeState, RunStatus, SchedulerConfig};
use nix::sys::signal::Signal;

type TestResult = Result<(), Box<dyn Error>>;

fn scheduler(log_dir: std::path::PathBuf) -> GraphScheduler {
    GraphScheduler::new(SchedulerConfig {
        log_dir,
        max_active_runs: 1,
        delay: Duration::ZERO,
        dry: false,
        req_id: "test-request-id".to_string(),
        shell: None,
        on_exit: None,
        on_success: None,
        on_failure: None,
        on_cancel: None,
    })
}

fn env() -> Arc<HashMap<String, String>> {
    Arc::new(HashMap::new())
}

#[tokio::test]
async fn two_step_chain_runs_in_order_and_succeeds() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let order = tmp.path().join("order.txt");

        let steps = vec![
            StepBuilder::new("a", &format!("echo a >> {}", order.display())).build(),
            StepBuilder::new("b", &format!("echo b >> {}", order.display()))
                .depends(&["a"])
                .build(),
        ];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(sched.status(&graph), RunStatus::Success);
        assert_eq!(std::fs::read_to_string(&order)?, "a\nb\n");
        assert!(graph.finish_at() >= graph.start_at());
        Ok(())
    })
    .await
}

#[tokio::test]
async fn failure_without_continue_cancels_dependents() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let steps = vec![
            StepBuilder::new("a", "exit 1").build(),
            StepBuilder::new("b", "echo never").depends(&["a"]).build(),
        ];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        let result = sched.schedule(&graph, env(), None).await;

        assert!(result.is_err());
        assert_eq!(graph.nodes()[0].state(), NodeState::Error);
        assert_eq!(graph.nodes()[1].state(), NodeState::Cancel);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn continue_on_failure_lets_dependents_run() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let marker = tmp.path().join("b_ran");

        let steps = vec![
            StepBuilder::new("a", "exit 1")
                .continue_on(ContinueOn {
                    failure: true,
                    ..ContinueOn::default()
                })
                .build(),
            StepBuilder::new("b", &format!("touch {}", marker.display()))
                .depends(&["a"])
                .build(),
        ];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        let result = sched.schedule(&graph, env(), None).await;

        // The dependent runs, but the recorded failure still fails the run.
        assert!(result.is_err());
        assert_eq!(sched.status(&graph), RunStatus::Error);
        assert_eq!(graph.nodes()[1].state(), NodeState::Success);
        assert!(marker.exists());
        Ok(())
    })
    .await
}

#[tokio::test]
async fn mark_success_turns_failure_into_success() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let steps = vec![StepBuilder::new("a", "exit 3")
            .continue_on(ContinueOn {
                failure: true,
                mark_success: true,
                ..ContinueOn::default()
            })
            .build()];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(graph.nodes()[0].state(), NodeState::Success);
        assert_eq!(sched.status(&graph), RunStatus::Success);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn allowed_exit_codes_count_as_success() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let steps = vec![StepBuilder::new("a", "exit 42")
            .continue_on(ContinueOn {
                exit_code: vec![42],
                ..ContinueOn::default()
            })
            .build()];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(graph.nodes()[0].state(), NodeState::Success);
        assert_eq!(sched.status(&graph), RunStatus::Success);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn skipped_precondition_cascades_to_dependents() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let steps = vec![
            StepBuilder::new("a", "echo a")
                .precondition("`echo 1`", "0")
                .build(),
            StepBuilder::new("b", "echo b").depends(&["a"]).build(),
        ];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(graph.nodes()[0].state(), NodeState::Skipped);
        assert_eq!(graph.nodes()[1].state(), NodeState::Skipped);
        assert_eq!(sched.status(&graph), RunStatus::Success);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn retry_policy_reruns_failed_step() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let marker = tmp.path().join("attempted");

        // Fails on the first attempt, succeeds on the second.
        let cmd = format!(
            "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let steps = vec![StepBuilder::new("flaky", &cmd).retry(1, 0).build()];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        let data = graph.nodes()[0].data();
        assert_eq!(data.state, NodeState::Success);
        assert_eq!(data.retry_count, 1);
        assert_eq!(data.attempts, 2);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn output_variable_flows_downstream() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let sink = tmp.path().join("sink.txt");

        let steps = vec![
            StepBuilder::new("produce", "echo hello-from-a")
                .output("GREETING")
                .build(),
            StepBuilder::new("consume", &format!("echo ${{GREETING}} > {}", sink.display()))
                .depends(&["produce"])
                .build(),
        ];

        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = scheduler(tmp.path().join("logs"));
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(sched.status(&graph), RunStatus::Success);
        assert_eq!(
            graph.nodes()[0].data().outputs.get("GREETING"),
            Some(&"hello-from-a".to_string())
        );
        assert_eq!(std::fs::read_to_string(&sink)?.trim(), "hello-from-a");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn handlers_run_by_outcome_then_on_exit() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let on_success = tmp.path().join("on_success");
        let on_exit = tmp.path().join("on_exit");

        let config = SchedulerConfig {
            log_dir: tmp.path().join("logs"),
            max_active_runs: 1,
            delay: Duration::ZERO,
            dry: false,
            req_id: "test-request-id".to_string(),
            shell: None,
            on_exit: Some(StepBuilder::new("onExit", &format!("touch {}", on_exit.display())).build()),
            on_success: Some(
                StepBuilder::new("onSuccess", &format!("touch {}", on_success.display())).build(),
            ),
            on_failure: Some(StepBuilder::new("onFailure", "echo failed").build()),
            on_cancel: None,
        };

        let steps = vec![StepBuilder::new("a", "echo ok").build()];
        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = GraphScheduler::new(config);
        sched.schedule(&graph, env(), None).await?;

        assert!(on_success.exists());
        assert!(on_exit.exists());
        assert!(sched.handler_node(HandlerType::Success).is_some());
        assert!(sched.handler_node(HandlerType::Failure).is_none());
        assert_eq!(
            sched
                .handler_node(HandlerType::Exit)
                .unwrap()
                .state(),
            NodeState::Success
        );
        Ok(())
    })
    .await
}

#[tokio::test]
async fn on_failure_handler_runs_when_a_step_fails() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let on_failure = tmp.path().join("on_failure");

        let config = SchedulerConfig {
            log_dir: tmp.path().join("logs"),
            max_active_runs: 1,
            delay: Duration::ZERO,
            dry: false,
            req_id: "test-request-id".to_string(),
            shell: None,
            on_exit: None,
            on_success: None,
            on_failure: Some(
                StepBuilder::new("onFailure", &format!("touch {}", on_failure.display())).build(),
            ),
            on_cancel: None,
        };

        let steps = vec![StepBuilder::new("a", "exit 1").build()];
        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = GraphScheduler::new(config);
        let result = sched.schedule(&graph, env(), None).await;

        assert!(result.is_err());
        assert!(on_failure.exists());
        Ok(())
    })
    .await
}

#[tokio::test]
async fn signal_cancels_running_steps() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;

        let steps = vec![StepBuilder::new("slow", "sleep 30").build()];
        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = Arc::new(scheduler(tmp.path().join("logs")));

        let handle = {
            let sched = Arc::clone(&sched);
            let graph = Arc::clone(&graph);
            tokio::spawn(async move { sched.schedule(&graph, env(), None).await })
        };

        // Give the process time to start, then cancel.
        tokio::time::sleep(Duration::from_millis(500)).await;
        sched.signal(&graph, Signal::SIGTERM, false, None);

        let _ = handle.await?;
        assert_eq!(graph.nodes()[0].state(), NodeState::Cancel);
        assert_eq!(sched.status(&graph), RunStatus::Cancel);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn dry_run_executes_nothing() -> TestResult {
    with_timeout(async {
        init_tracing();
        let tmp = tempfile::tempdir()?;
        let marker = tmp.path().join("ran");

        let config = SchedulerConfig {
            log_dir: tmp.path().join("logs"),
            max_active_runs: 1,
            delay: Duration::ZERO,
            dry: true,
            req_id: "test-request-id".to_string(),
            shell: None,
            on_exit: None,
            on_success: None,
            on_failure: None,
            on_cancel: None,
        };

        let steps = vec![StepBuilder::new("a", &format!("touch {}", marker.display())).build()];
        let graph = Arc::new(ExecutionGraph::new(&steps)?);
        let sched = GraphScheduler::new(config);
        sched.schedule(&graph, env(), None).await?;

        assert_eq!(sched.status(&graph), RunStatus::Success);
        assert!(!marker.exists());
        Ok(())
    })
    .await
}
