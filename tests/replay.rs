mod common;

use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use common::{click, engine, navigate, CountingOracle};
use healrunner::browser::{BrowserError, MemorySite};
use healrunner::execution::RunStatus;
use healrunner::healing::ErrorType;
use healrunner::workflow::{Bindings, Workflow};

#[tokio::test]
async fn test_timeout_repair_replaces_position() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new().with_element("#slow", "").with_element("#done", "");
    site.delay_times("click css=#slow", Duration::from_secs(5), 1);
    let engine = engine(&site, dir.path(), 1, None);

    let workflow = Workflow::from_steps(
        "checkout",
        vec![
            navigate("open", "https://shop.test"),
            click("slow", "#slow").with_timeout_ms(100),
            click("done", "#done"),
        ],
    );
    engine.store().save(&workflow).unwrap();

    let run = engine.run("checkout", &Bindings::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.healing_applications, 1);
    assert_eq!(run.steps.len(), 3);
    assert_eq!(run.steps[1].step_id, "slow");
    assert!(run.steps[1].healed);

    let stored = engine.store().load("checkout").unwrap();
    assert_eq!(stored.steps.len(), 4);
    assert_eq!(stored.steps[2].id, "slow_heal_2");
    assert_eq!(stored.steps[2].timeout_ms, Some(200));
}

#[tokio::test]
async fn test_network_failure_is_not_healed() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new();
    site.fail_on("navigate", BrowserError::Network("connection refused".into()));
    let engine = engine(&site, dir.path(), 1, None);

    let workflow = Workflow::from_steps("status", vec![navigate("open", "https://down.test")]);
    let run = engine.run_workflow(&workflow, &Bindings::new()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.healing_applications, 0);
    assert!(run.healing_sessions.is_empty());
    assert_eq!(run.error.unwrap().error_type, ErrorType::Network);
}

#[tokio::test]
async fn test_position_is_healed_at_most_once() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new().with_element("#slow", "");
    site.delay_on("click css=#slow", Duration::from_secs(10));
    let engine = engine(&site, dir.path(), 1, None);

    let workflow = Workflow::from_steps("stuck", vec![click("slow", "#slow").with_timeout_ms(100)]);
    let run = tokio::time::timeout(Duration::from_secs(5), engine.run_workflow(&workflow, &Bindings::new()))
        .await
        .expect("run must terminate");

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.healing_applications, 1);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.error.unwrap().error_type, ErrorType::Timeout);
    assert_eq!(site.count("click css=#slow"), 2);
}

#[tokio::test]
async fn test_replay_is_repeatable() {
    let dir = tempdir().unwrap();
    let site = MemorySite::permissive();
    let engine = engine(&site, dir.path(), 1, None);
    let workflow = Workflow::from_steps(
        "browse",
        vec![
            navigate("open", "https://news.test"),
            click("story", ".headline"),
            click("back", "#back"),
        ],
    );

    let first = engine.run_workflow(&workflow, &Bindings::new()).await;
    let second = engine.run_workflow(&workflow, &Bindings::new()).await;

    assert!(first.is_success() && second.is_success());
    let ids = |run: &healrunner::execution::ExecutionRun| {
        run.steps.iter().map(|s| s.step_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn test_rejected_repair_leaves_document_untouched() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new();
    let oracle = CountingOracle::new(vec![json!({ "type": "click", "selector": "#${ghost}" })], Duration::ZERO);
    let engine = engine(&site, dir.path(), 1, Some(oracle.clone()));

    let workflow = Workflow::from_steps("signup", vec![click("join", "#join")]);
    engine.store().save(&workflow).unwrap();
    let before = engine.store().load_bytes("signup").unwrap();

    let run = engine.run("signup", &Bindings::new()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.healing_applications, 0);
    assert_eq!(oracle.calls(), 1);
    assert_eq!(engine.store().load_bytes("signup").unwrap(), before);
    let backups = dir.path().join("backups");
    assert!(!backups.exists() || std::fs::read_dir(&backups).unwrap().next().is_none());
}

#[tokio::test]
async fn test_concurrent_runs_share_one_repair() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new().with_element("#fixed", "");
    let oracle = CountingOracle::new(
        vec![json!({ "type": "click", "selector": "#fixed" })],
        Duration::from_millis(300),
    );
    let engine = engine(&site, dir.path(), 2, Some(oracle.clone()));

    let workflow = Workflow::from_steps("purchase", vec![click("buy", "#buy")]);
    engine.store().save(&workflow).unwrap();

    let batch = engine.run_batch(&workflow, vec![Bindings::new(); 2]).await.unwrap();

    assert_eq!(batch.succeeded, 2);
    assert_eq!(oracle.calls(), 1);
    assert!(batch.runs.iter().all(|run| run.healing_applications == 1));

    let stored = engine.store().load("purchase").unwrap();
    assert_eq!(stored.steps[0].id, "buy_heal_1");
    assert_eq!(stored.healing_history.len(), 1);
}

#[tokio::test]
async fn test_pool_bound_holds_under_load() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new();
    let engine = engine(&site, dir.path(), 2, None);
    let workflow = Workflow::from_steps(
        "poll",
        vec![healrunner::Step::new(
            "pause",
            healrunner::Action::Wait { state: Default::default(), duration_ms: Some(30) },
        )],
    );

    let pool_engine = engine.clone();
    let monitor = tokio::spawn(async move {
        let mut peak = 0;
        for _ in 0..200 {
            peak = peak.max(pool_engine.runner().pool().outstanding());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        peak
    });

    let batch = engine.run_batch(&workflow, vec![Bindings::new(); 8]).await.unwrap();
    let peak = monitor.await.unwrap();

    assert_eq!(batch.succeeded, 8);
    assert!(peak <= 2);
    assert!(site.launches() <= 2);
}

#[tokio::test]
async fn test_cancelled_runs_release_browsers() {
    let dir = tempdir().unwrap();
    let site = MemorySite::new();
    let engine = engine(&site, dir.path(), 2, None);
    let workflow = Workflow::from_steps(
        "forever",
        vec![healrunner::Step::new(
            "pause",
            healrunner::Action::Wait { state: Default::default(), duration_ms: Some(60_000) },
        )],
    );

    let first = engine.spawn(workflow.clone(), Bindings::new());
    let second = engine.spawn(workflow, Bindings::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_all();

    assert_eq!(first.join().await.unwrap().status, RunStatus::Cancelled);
    assert_eq!(second.join().await.unwrap().status, RunStatus::Cancelled);
    assert_eq!(engine.runner().pool().outstanding(), 0);
}
