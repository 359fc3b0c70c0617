//! Execution scheduler.
//!
//! Drives one execution of a plan to a terminal state. A step is
//! dispatched once every dependency has succeeded; independent steps run
//! concurrently up to `maxConcurrentSteps`. Every state change goes
//! through the execution store before anything acts on it (a step is
//! recorded as started before its attempt is spawned), so a crash at any
//! point leaves a log that can be resumed.
//!
//! Failure handling:
//! - retryable failures are retried with backoff when the step declares a
//!   retry policy; otherwise, and for fatal failures, the step fails
//! - a failed step skips everything downstream of it, while independent
//!   branches keep running
//! - an attempt that stops heartbeating is aborted and re-dispatched as a
//!   new attempt, at most `defaultRetryLimit` times
//!
//! Cancellation signals every in-flight attempt and waits up to the grace
//! period. Drain stops dispatching, waits the same way, and leaves the
//! execution Running so it can be resumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::core::plan::{ExecutionPlan, InputBinding, PlannedStep};
use crate::core::runner::{AttemptContext, Heartbeat, StepError, StepInputs, StepOutput, StepRunner};
use crate::core::store::{ExecutionStore, RecordOutcome};
use crate::core::subscription::{ExecutionUpdate, Subscription};
use crate::domain::{
    CreatedPayload, DefinitionRef, Event, EventType, Execution, ExecutionStatus, StepStatus,
};

/// Shortest watchdog period, whatever the heartbeat timeout
const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(10);

/// Dispatches plans and resumes interrupted executions
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<ExecutionStore>,
    runner: Arc<StepRunner>,
    settings: EngineSettings,
}

impl Scheduler {
    pub fn new(store: Arc<ExecutionStore>, runner: Arc<StepRunner>, settings: EngineSettings) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Create an execution for `plan`, mark it Running and begin dispatch
    pub async fn start(&self, plan: Arc<ExecutionPlan>, definition: DefinitionRef) -> Result<ExecutionHandle> {
        let id = Uuid::new_v4();

        let created = Event::created(
            id,
            CreatedPayload {
                definition,
                pipeline_name: plan.pipeline_name.clone(),
                plan_fingerprint: plan.fingerprint(),
                steps: plan.order().into_iter().map(String::from).collect(),
            },
        );
        self.store
            .record(&created)
            .await
            .context("Failed to create execution record")?;
        let mut execution = Execution::from_created(&created).context("Malformed execution header")?;

        let started = Event::execution(
            id,
            EventType::ExecutionStarted,
            format!("Dispatching {} steps", plan.steps.len()),
        );
        self.store
            .record(&started)
            .await
            .context("Failed to mark execution running")?;
        execution.apply(&started)?;

        tracing::info!(
            execution_id = %id,
            pipeline = %execution.definition,
            steps = plan.steps.len(),
            "Execution started"
        );

        Ok(self.launch(plan, execution, HashMap::new()))
    }

    /// Continue an unfinished execution from its recorded state.
    ///
    /// Succeeded steps keep their persisted outputs; steps recorded as
    /// Running are dispatched again as a new attempt.
    pub async fn resume(&self, plan: Arc<ExecutionPlan>, mut execution: Execution) -> Result<ExecutionHandle> {
        if execution.is_finished() {
            anyhow::bail!("Execution {} is already {}", execution.id, execution.status);
        }

        let mut planned: Vec<&str> = plan.order();
        planned.sort_unstable();
        let recorded: Vec<&str> = execution.steps.keys().map(String::as_str).collect();
        if planned != recorded {
            anyhow::bail!(
                "Execution {} was started with steps {:?}, but the plan has {:?}",
                execution.id,
                recorded,
                planned
            );
        }
        if plan.fingerprint() != execution.plan_fingerprint {
            tracing::warn!(execution_id = %execution.id, "Plan changed since the execution started; resuming with the new plan");
        }

        if execution.status == ExecutionStatus::Pending {
            let started = Event::execution(execution.id, EventType::ExecutionStarted, "Resumed".to_string());
            self.store.record(&started).await?;
            execution.apply(&started)?;
        }

        let mut outputs = HashMap::new();
        for (step_id, step) in &execution.steps {
            let Some(artifact) = step.artifact.as_ref().filter(|_| step.status == StepStatus::Succeeded) else {
                continue;
            };
            match self.store.load_artifact(execution.id, artifact).await {
                Ok(output) => {
                    outputs.insert(step_id.clone(), output);
                }
                Err(e) => {
                    tracing::warn!(execution_id = %execution.id, step = %step_id, error = %e, "Could not reload step outputs");
                }
            }
        }

        tracing::info!(
            execution_id = %execution.id,
            reused = outputs.len(),
            "Resuming execution"
        );

        Ok(self.launch(plan, execution, outputs))
    }

    fn launch(
        &self,
        plan: Arc<ExecutionPlan>,
        execution: Execution,
        outputs: HashMap<String, StepOutput>,
    ) -> ExecutionHandle {
        let id = execution.id;
        let (updates, _) = broadcast::channel(self.settings.subscription_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let publisher = Arc::new(Mutex::new(Some(updates.clone())));
        let cancel = CancellationToken::new();
        let drain = DrainSignal::default();

        let run = RunLoop {
            plan,
            execution,
            store: Arc::clone(&self.store),
            runner: Arc::clone(&self.runner),
            settings: self.settings.clone(),
            outputs,
            in_flight: HashMap::new(),
            tasks: JoinSet::new(),
            retry_at: HashMap::new(),
            cancel: cancel.clone(),
            drain: drain.clone(),
            updates,
        };

        let span = tracing::info_span!("execution", execution_id = %id);
        let closing = Arc::clone(&publisher);
        tokio::spawn(
            async move {
                let state = match run.run().await {
                    Ok(execution) => RunState::Finished(Box::new(execution)),
                    Err(e) => {
                        tracing::error!(error = %format!("{:#}", e), "Execution loop aborted");
                        RunState::Aborted(format!("{:#}", e))
                    }
                };
                closing.lock().take();
                let _ = state_tx.send(state);
            }
            .instrument(span),
        );

        ExecutionHandle {
            id,
            cancel,
            drain,
            publisher,
            state: state_rx,
        }
    }
}

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Finished(Box<Execution>),
    Aborted(String),
}

#[derive(Debug, Clone, Default)]
struct DrainSignal {
    token: CancellationToken,
    grace: Arc<Mutex<Option<Duration>>>,
}

/// Control handle for one running execution
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: Uuid,
    cancel: CancellationToken,
    drain: DrainSignal,
    publisher: Arc<Mutex<Option<broadcast::Sender<ExecutionUpdate>>>>,
    state: watch::Receiver<RunState>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop dispatching and wait up to `grace` for in-flight attempts
    pub fn drain(&self, grace: Duration) {
        *self.drain.grace.lock() = Some(grace);
        self.drain.token.cancel();
    }

    /// Live updates, or None once the execution loop has ended
    pub fn subscribe(&self) -> Option<Subscription> {
        self.publisher
            .lock()
            .as_ref()
            .map(|tx| Subscription::new(self.id, tx.subscribe()))
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.state.borrow(), RunState::Running)
    }

    /// Wait for the execution loop to end and return the final state
    pub async fn wait(&self) -> Result<Execution> {
        let mut rx = self.state.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                RunState::Finished(execution) => return Ok(*execution),
                RunState::Aborted(reason) => anyhow::bail!("Execution {} aborted: {}", self.id, reason),
                RunState::Running => {}
            }
            if rx.changed().await.is_err() {
                anyhow::bail!("Execution {} task ended without a result", self.id);
            }
        }
    }
}

struct InFlight {
    attempt: u32,
    task: tokio::task::Id,
    abort: AbortHandle,
    heartbeat: Heartbeat,
    cancel: CancellationToken,
    started: Instant,
}

struct AttemptOutcome {
    step_id: String,
    attempt: u32,
    result: Result<StepOutput, StepError>,
    elapsed: Duration,
}

enum Wake {
    Interrupted,
    Joined(Result<AttemptOutcome, JoinError>),
    RetryDue,
    Watchdog,
}

/// State owned by one execution's dispatch loop
struct RunLoop {
    plan: Arc<ExecutionPlan>,
    execution: Execution,
    store: Arc<ExecutionStore>,
    runner: Arc<StepRunner>,
    settings: EngineSettings,

    /// Outputs of succeeded steps
    outputs: HashMap<String, StepOutput>,

    in_flight: HashMap<String, InFlight>,
    tasks: JoinSet<AttemptOutcome>,

    /// Steps waiting out a retry delay
    retry_at: HashMap<String, Instant>,

    cancel: CancellationToken,
    drain: DrainSignal,
    updates: broadcast::Sender<ExecutionUpdate>,
}

impl RunLoop {
    async fn run(mut self) -> Result<Execution> {
        let period = (self.settings.heartbeat_timeout() / 3).max(MIN_WATCHDOG_PERIOD);
        let mut watchdog = tokio::time::interval(period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }
            if self.drain.token.is_cancelled() {
                return self.finish_drained().await;
            }

            self.dispatch_ready().await?;

            if self.in_flight.is_empty() && self.retry_at.is_empty() {
                return self.finish().await;
            }

            let next_retry = self.retry_at.values().min().copied();
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Interrupted,
                _ = self.drain.token.cancelled() => Wake::Interrupted,
                Some(joined) = self.tasks.join_next() => Wake::Joined(joined),
                _ = sleep_until(next_retry) => Wake::RetryDue,
                _ = watchdog.tick() => Wake::Watchdog,
            };

            match wake {
                Wake::Interrupted => {}
                Wake::Joined(Ok(outcome)) => self.handle_outcome(outcome).await?,
                Wake::Joined(Err(join_error)) => self.handle_join_error(join_error).await?,
                Wake::RetryDue => {
                    let now = Instant::now();
                    self.retry_at.retain(|_, due| *due > now);
                }
                Wake::Watchdog => self.check_liveness().await?,
            }
        }
    }

    /// Validate, persist, apply locally, then publish
    async fn record(&mut self, event: Event) -> Result<()> {
        let outcome = self
            .store
            .record(&event)
            .await
            .with_context(|| format!("Failed to record {}", event.event_type.as_str()))?;

        if outcome == RecordOutcome::Duplicate {
            tracing::debug!(key = %event.idempotency_key, "Transition already recorded");
            return Ok(());
        }
        self.execution
            .apply(&event)
            .context("Recorded transition diverged from local state")?;

        if event.event_type != EventType::ExecutionHeartbeat {
            let step_status = event
                .step_id
                .as_deref()
                .and_then(|s| self.execution.step(s))
                .map(|s| s.status);
            let _ = self
                .updates
                .send(ExecutionUpdate::new(&event, self.execution.status, step_status));
        }
        Ok(())
    }

    fn status_of(&self, step_id: &str) -> StepStatus {
        self.execution
            .step(step_id)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    fn is_ready(&self, step: &PlannedStep) -> bool {
        if self.in_flight.contains_key(&step.id) || self.retry_at.contains_key(&step.id) {
            return false;
        }
        // Running without an attempt in flight: interrupted before a resume
        let waiting = matches!(self.status_of(&step.id), StepStatus::Pending | StepStatus::Running);
        waiting
            && step
                .depends_on
                .iter()
                .all(|dep| self.status_of(dep) == StepStatus::Succeeded)
    }

    async fn dispatch_ready(&mut self) -> Result<()> {
        let capacity = self
            .settings
            .max_concurrent_steps
            .saturating_sub(self.in_flight.len());
        if capacity == 0 {
            return Ok(());
        }

        let ready: Vec<PlannedStep> = self
            .plan
            .steps
            .iter()
            .filter(|s| self.is_ready(s))
            .take(capacity)
            .cloned()
            .collect();

        for step in ready {
            self.dispatch(step).await?;
        }
        Ok(())
    }

    fn gather_inputs(&self, step: &PlannedStep) -> Result<StepInputs, String> {
        let mut inputs = StepInputs::new();
        for (port, binding) in &step.inputs {
            if let InputBinding::Upstream { step: upstream, port: upstream_port } = binding {
                let value = self
                    .outputs
                    .get(upstream)
                    .and_then(|o| o.get(upstream_port))
                    .ok_or_else(|| format!("output {}.{} is not available", upstream, upstream_port))?;
                inputs.insert(port.clone(), value.clone());
            }
        }
        Ok(inputs)
    }

    async fn dispatch(&mut self, step: PlannedStep) -> Result<()> {
        let attempt = self.execution.step(&step.id).map(|s| s.attempts).unwrap_or(0) + 1;
        let inputs = self.gather_inputs(&step);

        self.record(Event::step(
            self.execution.id,
            &step.id,
            attempt,
            EventType::StepStarted,
            format!("Dispatching {} ({}), attempt {}", step.id, step.kind, attempt),
        ))
        .await?;
        tracing::info!(step = %step.id, attempt, "Step started");

        let heartbeat = Heartbeat::new();
        let token = self.cancel.child_token();
        let ctx = AttemptContext {
            execution_id: self.execution.id,
            attempt,
            heartbeat: heartbeat.clone(),
            cancel: token.clone(),
        };

        let step_id = step.id.clone();
        let runner = Arc::clone(&self.runner);
        let abort = self.tasks.spawn(async move {
            let started = Instant::now();
            let result = match inputs {
                Ok(inputs) => runner.run(&step, inputs, ctx).await,
                Err(missing) => Err(StepError::Fatal(missing)),
            };
            AttemptOutcome {
                step_id: step.id,
                attempt,
                result,
                elapsed: started.elapsed(),
            }
        });

        self.in_flight.insert(
            step_id,
            InFlight {
                attempt,
                task: abort.id(),
                abort,
                heartbeat,
                cancel: token,
                started: Instant::now(),
            },
        );
        Ok(())
    }

    /// Remove the in-flight entry for an outcome, unless it is stale
    fn take_in_flight(&mut self, outcome: &AttemptOutcome) -> bool {
        match self.in_flight.get(&outcome.step_id) {
            Some(f) if f.attempt == outcome.attempt => {
                self.in_flight.remove(&outcome.step_id);
                true
            }
            _ => {
                tracing::debug!(step = %outcome.step_id, attempt = outcome.attempt, "Ignoring stale attempt");
                false
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: AttemptOutcome) -> Result<()> {
        if !self.take_in_flight(&outcome) {
            return Ok(());
        }
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        match outcome.result {
            Ok(output) => self.succeed(&outcome.step_id, outcome.attempt, output, elapsed_ms).await,
            Err(StepError::Cancelled) if self.cancel.is_cancelled() => {
                self.skip(&outcome.step_id, outcome.attempt, "cancelled").await
            }
            Err(err) => {
                self.fail_attempt(&outcome.step_id, outcome.attempt, err, elapsed_ms)
                    .await
            }
        }
    }

    async fn handle_join_error(&mut self, err: JoinError) -> Result<()> {
        if err.is_cancelled() {
            // Aborted by the watchdog or by cancellation; already accounted for
            return Ok(());
        }

        let Some(step_id) = self.step_for_task(&err) else {
            return Ok(());
        };

        if let Some(f) = self.in_flight.remove(&step_id) {
            tracing::error!(step = %step_id, attempt = f.attempt, "Step attempt panicked");
            let elapsed_ms = f.started.elapsed().as_millis() as u64;
            self.fail_attempt(&step_id, f.attempt, StepError::Fatal("step panicked".to_string()), elapsed_ms)
                .await?;
        }
        Ok(())
    }

    async fn succeed(&mut self, step_id: &str, attempt: u32, output: StepOutput, elapsed_ms: u64) -> Result<()> {
        let artifact = self
            .store
            .put_artifact(self.execution.id, step_id, &output)
            .await?;
        let summary = output.summary();

        self.record(
            Event::step(
                self.execution.id,
                step_id,
                attempt,
                EventType::StepSucceeded,
                format!("{} succeeded ({})", step_id, summary),
            )
            .with_artifact(artifact, summary)
            .with_duration(elapsed_ms),
        )
        .await?;
        tracing::info!(step = %step_id, attempt, duration_ms = elapsed_ms, "Step succeeded");

        self.outputs.insert(step_id.to_string(), output);
        Ok(())
    }

    async fn skip(&mut self, step_id: &str, attempt: u32, reason: &str) -> Result<()> {
        self.retry_at.remove(step_id);
        self.record(
            Event::step(
                self.execution.id,
                step_id,
                attempt,
                EventType::StepSkipped,
                format!("{} skipped", step_id),
            )
            .with_error(reason),
        )
        .await
    }

    /// Delay before the next attempt, or None if the step must fail
    fn retry_delay(&self, step_id: &str, attempt: u32, err: &StepError) -> Option<Duration> {
        if !err.is_retryable() {
            return None;
        }
        let step = self.plan.step(step_id)?;
        let limit = self.settings.default_retry_limit;

        match (err, &step.retry) {
            (StepError::Stalled(_), policy) => (attempt <= limit).then(|| {
                policy
                    .as_ref()
                    .map(|p| p.jittered_delay(attempt))
                    .unwrap_or(Duration::ZERO)
            }),
            (_, Some(policy)) => policy
                .should_retry(attempt, limit)
                .then(|| policy.jittered_delay(attempt)),
            (_, None) => None,
        }
    }

    async fn fail_attempt(&mut self, step_id: &str, attempt: u32, err: StepError, elapsed_ms: u64) -> Result<()> {
        if let Some(delay) = self.retry_delay(step_id, attempt, &err) {
            self.record(
                Event::step(
                    self.execution.id,
                    step_id,
                    attempt,
                    EventType::StepRetrying,
                    format!("{} will retry in {}ms", step_id, delay.as_millis()),
                )
                .with_error(err.to_string())
                .with_duration(elapsed_ms),
            )
            .await?;
            tracing::warn!(step = %step_id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Step attempt failed; retrying");

            self.retry_at.insert(step_id.to_string(), Instant::now() + delay);
            return Ok(());
        }

        self.record(
            Event::step(
                self.execution.id,
                step_id,
                attempt,
                EventType::StepFailed,
                format!("{} failed", step_id),
            )
            .with_error(err.to_string())
            .with_duration(elapsed_ms),
        )
        .await?;
        tracing::warn!(step = %step_id, attempt, error = %err, "Step failed");

        self.skip_downstream(step_id).await
    }

    /// Skip every step that can no longer run because `failed` failed
    async fn skip_downstream(&mut self, failed: &str) -> Result<()> {
        let downstream: Vec<String> = self
            .plan
            .downstream_of(failed)
            .into_iter()
            .map(String::from)
            .collect();

        for step_id in downstream {
            if self.status_of(&step_id) == StepStatus::Pending && !self.in_flight.contains_key(&step_id) {
                let attempt = self.execution.step(&step_id).map(|s| s.attempts).unwrap_or(0);
                self.skip(&step_id, attempt, &format!("upstream step '{}' failed", failed))
                    .await?;
            }
        }
        Ok(())
    }

    /// Record scheduler liveness and abort attempts that stopped beating
    async fn check_liveness(&mut self) -> Result<()> {
        self.record(Event::heartbeat(self.execution.id)).await?;

        let timeout = self.settings.heartbeat_timeout();
        let stalled: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.heartbeat.since_last() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for step_id in stalled {
            let Some(f) = self.in_flight.remove(&step_id) else {
                continue;
            };
            f.cancel.cancel();
            f.abort.abort();
            tracing::warn!(step = %step_id, attempt = f.attempt, timeout_secs = timeout.as_secs(), "Step attempt stalled");

            let elapsed_ms = f.started.elapsed().as_millis() as u64;
            self.fail_attempt(&step_id, f.attempt, StepError::Stalled(timeout.as_secs()), elapsed_ms)
                .await?;
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<Execution> {
        let leftovers: Vec<(String, u32)> = self
            .execution
            .steps
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, s)| (id.clone(), s.attempts))
            .collect();
        for (step_id, attempt) in leftovers {
            self.skip(&step_id, attempt, "not reachable").await?;
        }

        let counts = self.execution.step_counts();
        let event = if counts.succeeded == self.execution.steps.len() {
            Event::execution(
                self.execution.id,
                EventType::ExecutionSucceeded,
                format!("All {} steps succeeded", counts.succeeded),
            )
        } else {
            let failed: Vec<&str> = self
                .execution
                .steps
                .iter()
                .filter(|(_, s)| s.status == StepStatus::Failed)
                .map(|(id, _)| id.as_str())
                .collect();
            Event::execution(
                self.execution.id,
                EventType::ExecutionFailed,
                format!(
                    "{} succeeded, {} failed, {} skipped",
                    counts.succeeded, counts.failed, counts.skipped
                ),
            )
            .with_error(format!("{} step(s) failed: {}", failed.len(), failed.join(", ")))
        };

        self.record(event).await?;
        tracing::info!(status = %self.execution.status, "Execution finished");
        Ok(self.execution)
    }

    fn grace(&self) -> Duration {
        self.drain
            .grace
            .lock()
            .unwrap_or_else(|| self.settings.cancel_grace_period())
    }

    async fn finish_cancelled(mut self) -> Result<Execution> {
        let grace = self.settings.cancel_grace_period();
        tracing::info!(grace_secs = grace.as_secs(), in_flight = self.in_flight.len(), "Cancelling execution");

        // Nothing new will be dispatched
        self.retry_at.clear();
        let pending: Vec<(String, u32)> = self
            .plan
            .steps
            .iter()
            .filter(|s| !self.in_flight.contains_key(&s.id))
            .filter_map(|s| self.execution.step(&s.id).map(|r| (s.id.clone(), r)))
            .filter(|(_, r)| r.status == StepStatus::Pending || r.status == StepStatus::Running)
            .map(|(id, r)| (id, r.attempts))
            .collect();
        for (step_id, attempt) in pending {
            self.skip(&step_id, attempt, "cancelled").await?;
        }

        // In-flight attempts were signalled through their child tokens
        let deadline = Instant::now() + grace;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    if !self.take_in_flight(&outcome) {
                        continue;
                    }
                    let elapsed_ms = outcome.elapsed.as_millis() as u64;
                    match outcome.result {
                        Ok(output) => self.succeed(&outcome.step_id, outcome.attempt, output, elapsed_ms).await?,
                        Err(StepError::Cancelled) => self.skip(&outcome.step_id, outcome.attempt, "cancelled").await?,
                        Err(err) => {
                            self.record_failed(&outcome.step_id, outcome.attempt, &err.to_string(), elapsed_ms)
                                .await?
                        }
                    }
                }
                Ok(Some(Err(join_error))) => {
                    if let Some(step_id) = self.step_for_task(&join_error) {
                        if let Some(f) = self.in_flight.remove(&step_id) {
                            self.record_failed(&step_id, f.attempt, "step panicked", 0).await?;
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        let stuck: Vec<(String, InFlight)> = self.in_flight.drain().collect();
        for (step_id, f) in stuck {
            f.abort.abort();
            tracing::warn!(step = %step_id, attempt = f.attempt, "Step did not stop within the grace period");
            let reason = format!("did not stop within the {}s cancellation grace period", grace.as_secs());
            let elapsed_ms = f.started.elapsed().as_millis() as u64;
            self.record_failed(&step_id, f.attempt, &reason, elapsed_ms).await?;
        }

        self.record(
            Event::execution(self.execution.id, EventType::ExecutionCancelled, "Cancelled".to_string())
                .with_error("cancelled by request"),
        )
        .await?;
        tracing::info!("Execution cancelled");
        Ok(self.execution)
    }

    async fn finish_drained(mut self) -> Result<Execution> {
        let grace = self.grace();
        tracing::info!(grace_secs = grace.as_secs(), in_flight = self.in_flight.len(), "Draining execution");

        let deadline = Instant::now() + grace;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(outcome))) => self.handle_outcome(outcome).await?,
                Ok(Some(Err(join_error))) => self.handle_join_error(join_error).await?,
                Ok(None) | Err(_) => break,
            }
        }

        // Unfinished attempts stay Running in the store and are
        // re-dispatched on resume
        for (step_id, f) in self.in_flight.drain() {
            f.abort.abort();
            tracing::warn!(step = %step_id, attempt = f.attempt, "Abandoning in-flight attempt for resume");
        }
        if !self.execution.is_finished() {
            self.record(Event::released(self.execution.id)).await?;
        }

        tracing::info!("Execution drained");
        Ok(self.execution)
    }

    fn step_for_task(&self, err: &JoinError) -> Option<String> {
        self.in_flight
            .iter()
            .find(|(_, f)| f.task == err.id())
            .map(|(id, _)| id.clone())
    }

    async fn record_failed(&mut self, step_id: &str, attempt: u32, reason: &str, elapsed_ms: u64) -> Result<()> {
        self.record(
            Event::step(
                self.execution.id,
                step_id,
                attempt,
                EventType::StepFailed,
                format!("{} failed", step_id),
            )
            .with_error(reason)
            .with_duration(elapsed_ms),
        )
        .await
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
