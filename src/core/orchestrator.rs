//! Process-wide registry of running executions.
//!
//! Ties the definition repository, validator, scheduler and store
//! together. On startup `recover` reloads every unfinished execution that
//! no scheduler is driving any more and resumes it; on shutdown `shutdown`
//! drains them so their last known state is persisted for the next
//! `recover`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, ResolvedConfig};
use crate::domain::{
    DefinitionRef, Event, EventType, Execution, ExecutionFilter, ExecutionStatus, ExecutionSummary, Health,
    PipelineDefinition,
};
use crate::registry::NodeRegistry;
use crate::sources::{ConfiguredSources, SourceCatalog};

use super::definitions::DefinitionRepository;
use super::plan::ExecutionPlan;
use super::runner::StepRunner;
use super::safety::SafetyLimits;
use super::scheduler::{ExecutionHandle, Scheduler};
use super::store::ExecutionStore;
use super::subscription::Subscription;
use super::validator::{ValidationError, Validator};

/// A definition was rejected before any execution was created
#[derive(Debug, Error)]
#[error("Pipeline '{pipeline}' is invalid ({} error(s))", errors.len())]
pub struct InvalidDefinition {
    pub pipeline: String,
    pub errors: Vec<ValidationError>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    registry: Arc<NodeRegistry>,
    store: Arc<ExecutionStore>,
    definitions: DefinitionRepository,
    scheduler: Scheduler,
    limits: SafetyLimits,

    /// Executions driven by this process
    running: Mutex<HashMap<Uuid, ExecutionHandle>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        sources: Arc<dyn SourceCatalog>,
        store: Arc<ExecutionStore>,
        definitions: DefinitionRepository,
        settings: EngineSettings,
        limits: SafetyLimits,
    ) -> Result<Self> {
        settings.validate()?;

        let runner = Arc::new(StepRunner::new(Arc::clone(&registry), sources, limits.clone()));
        let scheduler = Scheduler::new(Arc::clone(&store), runner, settings);

        Ok(Self {
            registry,
            store,
            definitions,
            scheduler,
            limits,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Build an orchestrator over the configured home directory
    pub async fn from_config(config: &ResolvedConfig, registry: Arc<NodeRegistry>) -> Result<Self> {
        let store = ExecutionStore::open(&config.home).await?;
        let definitions = DefinitionRepository::open(config.definitions_db())?;
        let sources = ConfiguredSources::new(config.sources.clone(), config.safety.clone());

        Self::new(
            registry,
            Arc::new(sources),
            Arc::new(store),
            definitions,
            config.engine.clone(),
            config.safety.clone(),
        )
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn definitions(&self) -> &DefinitionRepository {
        &self.definitions
    }

    pub fn settings(&self) -> &EngineSettings {
        self.scheduler.settings()
    }

    /// Check a definition against the registry; collects every error
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<ExecutionPlan, Vec<ValidationError>> {
        Validator::new(&self.registry)
            .with_limits(&self.limits)
            .validate(definition)
    }

    fn plan(&self, definition: &PipelineDefinition) -> Result<ExecutionPlan> {
        self.validate(definition).map_err(|errors| {
            InvalidDefinition {
                pipeline: definition.id.clone(),
                errors,
            }
            .into()
        })
    }

    /// Store a new definition version (or return the identical latest one)
    pub fn save_definition(&self, definition: &PipelineDefinition) -> Result<DefinitionRef> {
        self.definitions.save(definition)
    }

    /// Validate, version and start a definition
    #[instrument(skip(self, definition), fields(pipeline = %definition.id))]
    pub async fn start(&self, definition: &PipelineDefinition) -> Result<ExecutionHandle> {
        let plan = self.plan(definition)?;
        let version = self.save_definition(definition)?;
        self.launch(plan, version).await
    }

    /// Start a stored version; the latest when `version` is None
    #[instrument(skip(self))]
    pub async fn start_version(&self, pipeline_id: &str, version: Option<u32>) -> Result<ExecutionHandle> {
        let (version, definition) = match version {
            Some(v) => {
                let definition = self
                    .definitions
                    .get(pipeline_id, v)?
                    .with_context(|| format!("Definition {}@v{} not found", pipeline_id, v))?;
                (
                    DefinitionRef {
                        id: pipeline_id.to_string(),
                        version: v,
                    },
                    definition,
                )
            }
            None => self
                .definitions
                .latest(pipeline_id)?
                .with_context(|| format!("No saved definition for pipeline '{}'", pipeline_id))?,
        };

        let plan = self.plan(&definition)?;
        self.launch(plan, version).await
    }

    async fn launch(&self, plan: ExecutionPlan, version: DefinitionRef) -> Result<ExecutionHandle> {
        let handle = self.scheduler.start(Arc::new(plan), version).await?;
        self.track(handle.clone());
        Ok(handle)
    }

    fn track(&self, handle: ExecutionHandle) {
        let mut running = self.running.lock();
        running.retain(|_, h| !h.is_finished());
        running.insert(handle.id(), handle);
    }

    /// Handle of an execution running in this process
    pub fn handle(&self, id: Uuid) -> Option<ExecutionHandle> {
        self.running.lock().get(&id).cloned()
    }

    /// Ids of executions still running in this process
    pub fn running_ids(&self) -> Vec<Uuid> {
        let mut running = self.running.lock();
        running.retain(|_, h| !h.is_finished());
        let mut ids: Vec<Uuid> = running.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Request cancellation; false if the execution is not running here
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.handle(id) {
            Some(handle) if !handle.is_finished() => {
                info!(execution_id = %id, "Cancellation requested");
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Live updates of a running execution
    pub fn subscribe(&self, id: Uuid) -> Option<Subscription> {
        self.handle(id).and_then(|h| h.subscribe())
    }

    /// Wait for a running execution, or read a finished one from the store
    pub async fn wait(&self, id: Uuid) -> Result<Execution> {
        if let Some(handle) = self.handle(id) {
            return handle.wait().await;
        }
        self.get(id)
            .await?
            .with_context(|| format!("Execution not found: {}", id))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionSummary>> {
        self.store.list(filter, Utc::now(), self.heartbeat_timeout()).await
    }

    fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings().step_heartbeat_timeout_seconds as i64)
    }

    /// Resume every unfinished execution that no scheduler is driving.
    ///
    /// Only Stalled executions are taken over: ones released by a drain, or
    /// whose last heartbeat is older than `stepHeartbeatTimeoutSeconds`.
    /// Active ones belong to a live scheduler, here or in another process.
    /// Each resumes against its pinned definition version. Executions whose
    /// definition no longer validates are failed with the reason recorded.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<Uuid>> {
        let filter = ExecutionFilter {
            unfinished_only: true,
            ..Default::default()
        };
        let mut resumed = Vec::new();

        for summary in self.list(&filter).await? {
            if self.handle(summary.id).is_some_and(|h| !h.is_finished()) {
                continue;
            }
            if summary.health != Health::Stalled {
                info!(execution_id = %summary.id, "Execution is driven by a live scheduler; not recovering");
                continue;
            }
            match self.recover_one(summary.id).await {
                Ok(Some(handle)) => {
                    resumed.push(handle.id());
                    self.track(handle);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(execution_id = %summary.id, error = %format!("{:#}", e), "Failed to recover execution");
                }
            }
        }

        info!(count = resumed.len(), "Recovered executions");
        Ok(resumed)
    }

    async fn recover_one(&self, id: Uuid) -> Result<Option<ExecutionHandle>> {
        // Atomic across processes; loses if someone else claimed it first
        if !self.store.claim(id, Utc::now(), self.heartbeat_timeout()).await? {
            info!(execution_id = %id, "Execution was claimed elsewhere");
            return Ok(None);
        }
        let Some(execution) = self.store.get(id).await? else {
            return Ok(None);
        };
        if execution.is_finished() {
            return Ok(None);
        }

        let pinned = execution.definition.clone();
        let definition = match self.definitions.get(&pinned.id, pinned.version)? {
            Some(definition) => definition,
            None => {
                self.abandon(execution, format!("definition {} is no longer stored", pinned))
                    .await?;
                return Ok(None);
            }
        };

        match self.validate(&definition) {
            Ok(plan) => {
                let handle = self.scheduler.resume(Arc::new(plan), execution).await?;
                Ok(Some(handle))
            }
            Err(errors) => {
                let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                self.abandon(
                    execution,
                    format!("definition {} no longer validates: {}", pinned, reasons.join("; ")),
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Fail an execution that cannot be resumed, skipping its open steps
    async fn abandon(&self, mut execution: Execution, reason: String) -> Result<()> {
        warn!(execution_id = %execution.id, %reason, "Abandoning execution");

        let mut events = Vec::new();
        if execution.status == ExecutionStatus::Pending {
            events.push(Event::execution(execution.id, EventType::ExecutionStarted, "Recovered".to_string()));
        }
        for (step_id, step) in &execution.steps {
            if !step.status.is_terminal() {
                events.push(
                    Event::step(
                        execution.id,
                        step_id,
                        step.attempts,
                        EventType::StepSkipped,
                        format!("{} skipped", step_id),
                    )
                    .with_error("execution could not be recovered"),
                );
            }
        }
        events.push(
            Event::execution(execution.id, EventType::ExecutionFailed, "Not recoverable".to_string())
                .with_error(reason),
        );

        for event in events {
            self.store.record(&event).await?;
            execution.apply(&event)?;
        }
        Ok(())
    }

    /// Drain every running execution, waiting up to `grace` for in-flight
    /// steps. Executions stay Running in the store for the next `recover`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let handles: Vec<ExecutionHandle> = self.running.lock().drain().map(|(_, h)| h).collect();
        info!(count = handles.len(), grace_secs = grace.as_secs(), "Draining executions");

        for handle in &handles {
            handle.drain(grace);
        }
        for handle in handles {
            if let Err(e) = handle.wait().await {
                warn!(execution_id = %handle.id(), error = %e, "Execution did not drain cleanly");
            }
        }
        Ok(())
    }
}
