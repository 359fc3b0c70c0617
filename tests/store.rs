//! Execution Store Integration Tests
//!
//! Tests for idempotent recording, transition validation, concurrent
//! writers and monitoring queries.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pipewright::core::{ExecutionStore, RecordOutcome, StoreError};
use pipewright::domain::{
    CreatedPayload, DefinitionRef, Event, EventType, ExecutionFilter, ExecutionStatus, Health,
    StepStatus, TransitionError,
};
use tempfile::TempDir;
use uuid::Uuid;

fn created(id: Uuid, pipeline: &str, steps: &[&str]) -> Event {
    Event::created(
        id,
        CreatedPayload {
            definition: DefinitionRef {
                id: pipeline.to_string(),
                version: 1,
            },
            pipeline_name: pipeline.to_string(),
            plan_fingerprint: "fingerprint".to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        },
    )
}

fn started(id: Uuid) -> Event {
    Event::execution(id, EventType::ExecutionStarted, "started".to_string())
}

fn step(id: Uuid, step: &str, attempt: u32, event_type: EventType) -> Event {
    Event::step(id, step, attempt, event_type, format!("{} {}", step, event_type.as_str()))
}

async fn running(store: &ExecutionStore, pipeline: &str, steps: &[&str]) -> Uuid {
    let id = Uuid::new_v4();
    store.record(&created(id, pipeline, steps)).await.unwrap();
    store.record(&started(id)).await.unwrap();
    id
}

#[tokio::test]
async fn test_record_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = ExecutionStore::open(temp.path()).await.unwrap();
    let id = running(&store, "etl", &["a"]).await;

    let start = step(id, "a", 1, EventType::StepStarted);
    assert_eq!(store.record(&start).await.unwrap(), RecordOutcome::Recorded);

    // Redelivery of the same transition, even as a fresh event object
    let redelivered = step(id, "a", 1, EventType::StepStarted);
    assert_eq!(store.record(&redelivered).await.unwrap(), RecordOutcome::Duplicate);
    assert_eq!(store.record(&start).await.unwrap(), RecordOutcome::Duplicate);

    let events = store.events(id).await.unwrap();
    assert_eq!(events.len(), 3);

    let execution = store.get(id).await.unwrap().unwrap();
    assert_eq!(execution.step("a").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_out_of_order_transition_rejected() {
    let temp = TempDir::new().unwrap();
    let store = ExecutionStore::open(temp.path()).await.unwrap();
    let id = running(&store, "etl", &["a"]).await;

    // Succeeded before Started
    let err = store
        .record(&step(id, "a", 1, EventType::StepSucceeded))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Rejected(TransitionError::InvalidStepTransition { .. })
    ));

    // Attempt numbers must advance by one from Pending
    let err = store
        .record(&step(id, "a", 2, EventType::StepStarted))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));

    // Unknown step
    let err = store
        .record(&step(id, "ghost", 1, EventType::StepStarted))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Rejected(TransitionError::UnknownStep(_))
    ));

    // Rejected transitions leave no trace
    assert_eq!(store.events(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_terminal_transition_rejected() {
    let temp = TempDir::new().unwrap();
    let store = ExecutionStore::open(temp.path()).await.unwrap();
    let id = running(&store, "etl", &["a"]).await;

    store.record(&step(id, "a", 1, EventType::StepStarted)).await.unwrap();
    store.record(&step(id, "a", 1, EventType::StepSucceeded)).await.unwrap();

    // A second terminal transition for the same attempt
    let err = store
        .record(&step(id, "a", 1, EventType::StepFailed))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));

    // Terminal steps cannot be restarted
    assert!(store.record(&step(id, "a", 2, EventType::StepStarted)).await.is_err());

    store
        .record(&Event::execution(id, EventType::ExecutionSucceeded, "done".to_string()))
        .await
        .unwrap();

    // Terminal executions are sinks
    let err = store
        .record(&Event::execution(id, EventType::ExecutionFailed, "late".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));

    let execution = store.get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.step("a").unwrap().status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_concurrent_writers_are_serialized() {
    let temp = TempDir::new().unwrap();
    let steps: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
    let step_refs: Vec<&str> = steps.iter().map(String::as_str).collect();

    // Two store handles on one root stand in for two processes
    let first = Arc::new(ExecutionStore::open(temp.path()).await.unwrap());
    let second = Arc::new(ExecutionStore::open(temp.path()).await.unwrap());
    let id = running(&first, "fan", &step_refs).await;

    let mut tasks = Vec::new();
    for (i, name) in steps.iter().enumerate() {
        let store = if i % 2 == 0 { Arc::clone(&first) } else { Arc::clone(&second) };
        let name = name.clone();
        tasks.push(tokio::spawn(async move {
            store.record(&step(id, &name, 1, EventType::StepStarted)).await.unwrap();
            store.record(&step(id, &name, 1, EventType::StepSucceeded)).await.unwrap();
            // Retried delivery
            store.record(&step(id, &name, 1, EventType::StepSucceeded)).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), RecordOutcome::Duplicate);
    }

    let events = first.events(id).await.unwrap();
    assert_eq!(events.len(), 2 + steps.len() * 2);

    let execution = second.get(id).await.unwrap().unwrap();
    assert_eq!(execution.step_counts().succeeded, steps.len());
}

#[tokio::test]
async fn test_list_filters() {
    let temp = TempDir::new().unwrap();
    let store = ExecutionStore::open(temp.path()).await.unwrap();

    let done = running(&store, "orders", &["a"]).await;
    store.record(&step(done, "a", 1, EventType::StepStarted)).await.unwrap();
    store.record(&step(done, "a", 1, EventType::StepFailed)).await.unwrap();
    store
        .record(&Event::execution(done, EventType::ExecutionFailed, "failed".to_string()))
        .await
        .unwrap();

    let active = running(&store, "orders", &["a"]).await;
    let other = running(&store, "billing", &["x"]).await;
    store.record(&Event::heartbeat(other)).await.unwrap();

    let now = Utc::now();
    let timeout = Duration::seconds(60);

    let all = store.list(&ExecutionFilter::default(), now, timeout).await.unwrap();
    assert_eq!(all.len(), 3);
    // Most recent first
    assert_eq!(all[0].id, other);

    let failed = ExecutionFilter {
        status: Some(ExecutionStatus::Failed),
        ..Default::default()
    };
    let rows = store.list(&failed, now, timeout).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, done);
    assert_eq!(rows[0].steps.failed, 1);
    assert_eq!(rows[0].health, Health::Finished);

    let orders = ExecutionFilter {
        pipeline_id: Some("orders".to_string()),
        unfinished_only: true,
        ..Default::default()
    };
    let rows = store.list(&orders, now, timeout).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, active);

    let limited = ExecutionFilter {
        limit: Some(2),
        ..Default::default()
    };
    assert_eq!(store.list(&limited, now, timeout).await.unwrap().len(), 2);

    // Seen from two minutes later, both running executions have gone quiet
    let later = now + Duration::seconds(120);
    let stalled = ExecutionFilter {
        stalled_only: true,
        ..Default::default()
    };
    let rows = store.list(&stalled, later, timeout).await.unwrap();
    let mut ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    ids.sort();
    let mut expected = vec![active, other];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(rows.iter().all(|r| r.health == Health::Stalled));

    assert!(store.list(&stalled, now, timeout).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claim_takes_over_only_stalled_executions() {
    let temp = TempDir::new().unwrap();
    let store = ExecutionStore::open(temp.path()).await.unwrap();
    let timeout = Duration::seconds(60);

    let id = running(&store, "etl", &["a"]).await;
    let now = Utc::now();

    // Just started: its scheduler is alive
    assert!(!store.claim(id, now, timeout).await.unwrap());

    // Two minutes of silence
    assert!(store.claim(id, now + Duration::seconds(120), timeout).await.unwrap());
    // The claim is itself a heartbeat, so a second claimant loses
    assert!(!store.claim(id, Utc::now(), timeout).await.unwrap());

    // A drained execution is claimable straight away
    store.record(&Event::released(id)).await.unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().summary(Utc::now(), timeout).health,
        Health::Stalled
    );
    assert!(store.claim(id, Utc::now(), timeout).await.unwrap());
    assert!(!store.get(id).await.unwrap().unwrap().released);

    // Never started: the claim starts it
    let pending = Uuid::new_v4();
    store.record(&created(pending, "etl", &["a"])).await.unwrap();
    assert!(store.claim(pending, now + Duration::seconds(120), timeout).await.unwrap());
    assert_eq!(store.get(pending).await.unwrap().unwrap().status, ExecutionStatus::Running);

    // Finished executions are never claimed
    store
        .record(&Event::execution(id, EventType::ExecutionCancelled, "cancelled".to_string()))
        .await
        .unwrap();
    assert!(!store.claim(id, now + Duration::seconds(600), timeout).await.unwrap());
}
