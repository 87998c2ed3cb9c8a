//! The full engine over the SQLite backend: completion, crash/resume with
//! replay, and savepoint branching, all against a real database file.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::json;

use duramen_core::{EngineConfig, EngineError};
use duramen_infra::{SqliteEngine, open_sqlite_engine};
use duramen_types::state::Variables;
use duramen_types::step::StepOptions;
use duramen_types::workflow::{StartOptions, WorkflowStatus};

fn vars(value: serde_json::Value) -> Variables {
    value
        .as_object()
        .cloned()
        .expect("test vars must be an object")
}

async fn sqlite_engine(dir: &tempfile::TempDir) -> SqliteEngine {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
    open_sqlite_engine(&url, dir.path().join("blobs"), EngineConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_three_step_completion_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir).await;

    let outcome = engine
        .start(
            StartOptions::new("pipeline")
                .with_workflow_id("wf-sql-A")
                .with_input(vars(json!({"x": 1}))),
            |ctx| async move {
                ctx.step("a", |_| async { Ok(vars(json!({"y": 2}))) })
                    .await?;
                ctx.step("b", |_| async { Ok(vars(json!({"z": 3}))) })
                    .await?;
                ctx.step("c", |state| async move {
                    let sum = state["x"].as_i64().unwrap()
                        + state["y"].as_i64().unwrap()
                        + state["z"].as_i64().unwrap();
                    Ok(vars(json!({"sum": sum})))
                })
                .await?;
                Ok(())
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(
        outcome.state.variables,
        vars(json!({"x": 1, "y": 2, "z": 3, "sum": 6}))
    );

    let report = engine.status("wf-sql-A").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.step_number, 3);
    assert_eq!(report.event_count, 7);
}

#[tokio::test]
async fn test_crash_resume_replays_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let a_calls = Arc::new(AtomicU32::new(0));

    // First executor commits step a, then dies.
    {
        let engine = sqlite_engine(&dir).await;
        let calls = a_calls.clone();
        let crashed = engine
            .start(
                StartOptions::new("pipeline")
                    .with_workflow_id("wf-sql-B")
                    .with_input(vars(json!({"x": 1}))),
                |ctx| async move {
                    ctx.step("a", move |_| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(vars(json!({"y": 2})))
                        }
                    })
                    .await?;
                    Err(EngineError::StepExecutionFailed {
                        step_id: "simulated-crash".to_string(),
                        kind: "crash".to_string(),
                        message: "executor died".to_string(),
                    })
                },
            )
            .await;
        assert!(crashed.is_err());
    }

    // A new engine instance (fresh executor identity, same database)
    // resumes without re-running step a.
    let engine = sqlite_engine(&dir).await;
    let calls = a_calls.clone();
    let outcome = engine
        .resume("wf-sql-B", |ctx| async move {
            ctx.step("a", move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vars(json!({"y": 2})))
                }
            })
            .await?;
            ctx.step("b", |_| async { Ok(vars(json!({"z": 3}))) })
                .await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(a_calls.load(Ordering::SeqCst), 1, "step a must not re-run");
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.state.step_number, 2);
    assert_eq!(
        outcome.state.variables,
        vars(json!({"x": 1, "y": 2, "z": 3}))
    );
}

#[tokio::test]
async fn test_savepoint_branching_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir).await;

    engine
        .start(
            StartOptions::new("research").with_workflow_id("wf-sql-F"),
            |ctx| async move {
                ctx.step("a", |_| async { Ok(vars(json!({"a": 1}))) })
                    .await?;
                ctx.step_with(
                    "b",
                    StepOptions::default().with_savepoint(),
                    |_| async {
                        Ok(vars(json!({
                            "b": 2,
                            "_savepoint_metadata": {"goal_summary": "branch here"}
                        })))
                    },
                )
                .await?;
                ctx.step("c", |_| async { Ok(vars(json!({"c": 3}))) })
                    .await?;
                Ok(())
            },
        )
        .await
        .unwrap();

    let savepoints = engine.list_savepoints("wf-sql-F").await.unwrap();
    assert_eq!(savepoints.len(), 1);

    let branch_id = engine
        .time_travel("wf-sql-F", savepoints[0].savepoint_id)
        .await
        .unwrap();
    let outcome = engine
        .resume(&branch_id, |ctx| async move {
            ctx.step("d", |_| async { Ok(vars(json!({"d": 4}))) })
                .await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(outcome.state.step_number, 3);
    assert_eq!(outcome.state.variables["b"], json!(2));
    assert_eq!(outcome.state.variables["d"], json!(4));
    assert!(!outcome.state.variables.contains_key("c"));

    // Original untouched and still complete.
    let report = engine.status("wf-sql-F").await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.step_number, 3);
}
