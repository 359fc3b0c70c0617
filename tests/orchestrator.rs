//! Orchestrator Integration Tests
//!
//! Tests for definition versioning on start, cancellation through the
//! running-execution registry, and drain/recover across restarts.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{definition, registry, source, step, Trace};
use pipewright::config::EngineSettings;
use pipewright::core::{
    DefinitionRepository, ExecutionStore, InvalidDefinition, Orchestrator, SafetyLimits, ValidationError,
};
use pipewright::domain::{ExecutionFilter, ExecutionStatus, Health, StepStatus};
use pipewright::registry::NodeRegistry;
use pipewright::sources::ConfiguredSources;
use serde_json::json;
use tempfile::TempDir;

fn settings() -> EngineSettings {
    EngineSettings {
        cancel_grace_period_seconds: 1,
        ..Default::default()
    }
}

async fn orchestrator(home: &Path, registry: NodeRegistry) -> Orchestrator {
    let store = ExecutionStore::open(home).await.unwrap();
    let definitions = DefinitionRepository::open(home.join("definitions.db")).unwrap();

    Orchestrator::new(
        Arc::new(registry),
        Arc::new(ConfiguredSources::default()),
        Arc::new(store),
        definitions,
        settings(),
        SafetyLimits::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_start_pins_definition_version() {
    let temp = TempDir::new().unwrap();
    let trace = Arc::new(Trace::default());
    let orch = orchestrator(temp.path(), registry(&trace)).await;

    let v1 = definition("numbers", vec![source("a")], &[]);
    let first = orch.start(&v1).await.unwrap();
    let again = orch.start(&v1).await.unwrap();

    let mut v2 = v1.clone();
    v2.nodes.push(step("b"));
    v2.edges = definition("numbers", vec![], &[("a", "b")]).edges;
    let second = orch.start(&v2).await.unwrap();

    let first = orch.wait(first.id()).await.unwrap();
    let again = orch.wait(again.id()).await.unwrap();
    let second = orch.wait(second.id()).await.unwrap();

    assert_eq!(first.definition.version, 1);
    assert_eq!(again.definition.version, 1);
    assert_eq!(second.definition.version, 2);
    assert_eq!(second.status, ExecutionStatus::Succeeded);
    assert_eq!(orch.definitions().list().unwrap().len(), 2);

    // Starting a stored version directly
    let old = orch.start_version("numbers", Some(1)).await.unwrap();
    let old = orch.wait(old.id()).await.unwrap();
    assert_eq!(old.steps.len(), 1);

    let summaries = orch
        .list(&ExecutionFilter {
            pipeline_id: Some("numbers".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summaries.len(), 4);
    assert!(orch.running_ids().is_empty());
}

#[tokio::test]
async fn test_invalid_definition_is_not_started() {
    let temp = TempDir::new().unwrap();
    let trace = Arc::new(Trace::default());
    let orch = orchestrator(temp.path(), registry(&trace)).await;

    let broken = definition("broken", vec![source("a"), step("b")], &[("a", "b"), ("b", "a")]);
    let err = orch.start(&broken).await.unwrap_err();

    let invalid = err.downcast_ref::<InvalidDefinition>().unwrap();
    assert_eq!(invalid.pipeline, "broken");
    assert!(invalid
        .errors
        .iter()
        .any(|e| matches!(e, ValidationError::CyclicGraph { .. })));

    // Nothing versioned, nothing recorded
    assert!(orch.definitions().list().unwrap().is_empty());
    assert!(orch.list(&ExecutionFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_through_registry() {
    let temp = TempDir::new().unwrap();
    let trace = Arc::new(Trace::default());
    let orch = orchestrator(temp.path(), registry(&trace)).await;

    let def = definition("slow", vec![source("a").with_config("sleep_ms", json!(30_000))], &[]);
    let handle = orch.start(&def).await.unwrap();
    assert_eq!(orch.running_ids(), vec![handle.id()]);

    while !trace.started("a") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(orch.cancel(handle.id()));

    let execution = orch.wait(handle.id()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.step("a").unwrap().status, StepStatus::Skipped);

    // Finished executions are no longer cancellable
    assert!(!orch.cancel(handle.id()));
    assert!(!orch.cancel(uuid::Uuid::new_v4()));
}

#[tokio::test]
async fn test_shutdown_then_recover() {
    let temp = TempDir::new().unwrap();
    let def = definition(
        "resumable",
        vec![source("a"), step("b").with_config("sleep_ms", json!(500)), step("c")],
        &[("a", "b"), ("b", "c")],
    );

    let trace = Arc::new(Trace::default());
    let id = {
        let orch = orchestrator(temp.path(), registry(&trace)).await;
        let handle = orch.start(&def).await.unwrap();
        while !trace.started("b") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.shutdown(Duration::from_millis(50)).await.unwrap();
        handle.id()
    };

    // A new process over the same home directory
    let trace = Arc::new(Trace::default());
    let orch = orchestrator(temp.path(), registry(&trace)).await;

    let interrupted = orch.get(id).await.unwrap().unwrap();
    assert_eq!(interrupted.status, ExecutionStatus::Running);

    let resumed = orch.recover().await.unwrap();
    assert_eq!(resumed, vec![id]);

    let execution = tokio::time::timeout(Duration::from_secs(10), orch.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.step("a").unwrap().attempts, 1);
    assert_eq!(execution.step("b").unwrap().attempts, 2);

    // The resumed run never re-executed the succeeded step
    assert!(!trace.started("a"));

    // Nothing left to recover
    assert!(orch.recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_leaves_live_executions_alone() {
    let temp = TempDir::new().unwrap();
    let def = definition(
        "live",
        vec![source("a"), step("slow").with_config("sleep_ms", json!(1_500))],
        &[("a", "slow")],
    );

    let owner_trace = Arc::new(Trace::default());
    let owner = orchestrator(temp.path(), registry(&owner_trace)).await;
    let handle = owner.start(&def).await.unwrap();
    while !owner_trace.started("slow") {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A second process starting up over the same home directory
    let other_trace = Arc::new(Trace::default());
    let other = orchestrator(temp.path(), registry(&other_trace)).await;

    let seen = other
        .list(&ExecutionFilter {
            unfinished_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].health, Health::Active);

    assert!(other.recover().await.unwrap().is_empty());
    assert!(other.running_ids().is_empty());
    assert!(!other_trace.started("slow"));

    // The owner finishes undisturbed
    let execution = owner.wait(handle.id()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.step("slow").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_unrecoverable_execution_is_failed() {
    let temp = TempDir::new().unwrap();
    let def = definition(
        "test_kinds_only",
        vec![source("a"), step("b").with_config("sleep_ms", json!(30_000))],
        &[("a", "b")],
    );

    let trace = Arc::new(Trace::default());
    let id = {
        let orch = orchestrator(temp.path(), registry(&trace)).await;
        let handle = orch.start(&def).await.unwrap();
        while !trace.started("b") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.shutdown(Duration::from_millis(10)).await.unwrap();
        handle.id()
    };

    // Restarted without the test kinds registered
    let builtins_only = NodeRegistry::with_builtins(&SafetyLimits::default()).build();
    let orch = orchestrator(temp.path(), builtins_only).await;

    assert!(orch.recover().await.unwrap().is_empty());

    let execution = orch.get(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("no longer validates"));
    assert_eq!(execution.step("a").unwrap().status, StepStatus::Succeeded);
    assert_eq!(execution.step("b").unwrap().status, StepStatus::Skipped);
}
