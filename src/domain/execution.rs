//! Execution state and reconstruction from events.
//!
//! An Execution is one run of a plan. Its state is never written directly:
//! it is derived by replaying the execution's event log, and every new
//! event is checked against the current state before it is appended.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::definition::DefinitionRef;
use super::events::{Event, EventType};

/// One run of a pipeline plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier for this execution
    pub id: Uuid,

    /// Definition version pinned at start
    pub definition: DefinitionRef,

    /// Pipeline display name
    pub pipeline_name: String,

    /// Fingerprint of the plan this execution was started with
    pub plan_fingerprint: String,

    /// Overall status
    pub status: ExecutionStatus,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// When the execution entered Running
    pub started_at: Option<DateTime<Utc>>,

    /// When the execution reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,

    /// Last scheduler liveness marker
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Drained by its scheduler and not yet picked up again
    #[serde(default)]
    pub released: bool,

    /// Terminal error summary (Failed / Cancelled)
    pub error: Option<String>,

    /// Per-step results keyed by step id
    pub steps: BTreeMap<String, StepResult>,
}

impl Execution {
    /// Reconstruct an execution from its event log.
    ///
    /// Returns None if the log is empty or does not start with
    /// `ExecutionCreated`. Events that fail validation are ignored; the
    /// store never writes them, so this only matters for hand-edited logs.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let mut execution = Self::from_created(first)?;

        for event in &events[1..] {
            if let Err(e) = execution.apply(event) {
                tracing::warn!(execution_id = %execution.id, error = %e, "Ignoring invalid event during replay");
            }
        }

        Some(execution)
    }

    /// Build the initial (Pending) state from an `ExecutionCreated` event
    pub fn from_created(event: &Event) -> Option<Self> {
        if event.event_type != EventType::ExecutionCreated {
            return None;
        }
        let header = event.created.as_ref()?;

        let steps = header
            .steps
            .iter()
            .map(|id| (id.clone(), StepResult::default()))
            .collect();

        Some(Self {
            id: event.execution_id,
            definition: header.definition.clone(),
            pipeline_name: header.pipeline_name.clone(),
            plan_fingerprint: header.plan_fingerprint.clone(),
            status: ExecutionStatus::Pending,
            created_at: event.timestamp,
            started_at: None,
            ended_at: None,
            last_heartbeat: None,
            released: false,
            error: None,
            steps,
        })
    }

    /// Check whether `event` is a legal next transition without applying it
    pub fn check(&self, event: &Event) -> Result<(), TransitionError> {
        self.clone().apply(event)
    }

    /// Validate and apply a single transition
    pub fn apply(&mut self, event: &Event) -> Result<(), TransitionError> {
        if event.execution_id != self.id {
            return Err(TransitionError::WrongExecution {
                expected: self.id,
                actual: event.execution_id,
            });
        }

        if event.event_type.is_step_level() {
            return self.apply_step(event);
        }

        let from = self.status;
        let to = match event.event_type {
            EventType::ExecutionCreated => {
                return Err(TransitionError::AlreadyCreated(self.id));
            }
            EventType::ExecutionHeartbeat => {
                if from != ExecutionStatus::Running {
                    return Err(TransitionError::NotRunning(self.id));
                }
                self.last_heartbeat = Some(event.timestamp);
                self.released = false;
                return Ok(());
            }
            EventType::ExecutionReleased => {
                if from != ExecutionStatus::Running {
                    return Err(TransitionError::NotRunning(self.id));
                }
                self.released = true;
                return Ok(());
            }
            EventType::ExecutionStarted => ExecutionStatus::Running,
            EventType::ExecutionSucceeded => ExecutionStatus::Succeeded,
            EventType::ExecutionFailed => ExecutionStatus::Failed,
            EventType::ExecutionCancelled => ExecutionStatus::Cancelled,
            _ => unreachable!("step-level events handled above"),
        };

        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidExecutionTransition { from, to });
        }

        self.status = to;
        match to {
            ExecutionStatus::Running => {
                self.started_at = Some(event.timestamp);
                self.last_heartbeat = Some(event.timestamp);
            }
            _ => {
                self.ended_at = Some(event.timestamp);
                self.error = event.error.clone();
            }
        }

        Ok(())
    }

    fn apply_step(&mut self, event: &Event) -> Result<(), TransitionError> {
        let step_id = event
            .step_id
            .as_deref()
            .ok_or(TransitionError::MissingStepId(event.event_type))?;

        if self.status != ExecutionStatus::Running {
            return Err(TransitionError::NotRunning(self.id));
        }

        let step = self
            .steps
            .get_mut(step_id)
            .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))?;

        let invalid = |step: &StepResult| TransitionError::InvalidStepTransition {
            step: step_id.to_string(),
            from: step.status,
            attempts: step.attempts,
            event: event.event_type,
            attempt: event.attempt,
        };

        match (event.event_type, step.status) {
            (EventType::StepStarted, StepStatus::Pending) if event.attempt == step.attempts + 1 => {}
            (EventType::StepStarted, StepStatus::Running) if event.attempt > step.attempts => {}
            (EventType::StepRetrying, StepStatus::Running)
            | (EventType::StepSucceeded, StepStatus::Running)
            | (EventType::StepFailed, StepStatus::Running)
                if event.attempt == step.attempts => {}
            (EventType::StepSkipped, StepStatus::Pending | StepStatus::Running) => {}
            _ => return Err(invalid(step)),
        }

        match event.event_type {
            EventType::StepStarted => {
                step.status = StepStatus::Running;
                step.attempts = event.attempt;
                step.started_at = Some(event.timestamp);
                step.ended_at = None;
                step.error = None;
            }
            EventType::StepRetrying => {
                step.status = StepStatus::Pending;
                step.error = event.error.clone();
                step.duration_ms = event.duration_ms;
            }
            EventType::StepSucceeded => {
                step.status = StepStatus::Succeeded;
                step.ended_at = Some(event.timestamp);
                step.duration_ms = event.duration_ms;
                step.artifact = event.artifact.clone();
                step.output_summary = event.output_summary.clone();
                step.error = None;
            }
            EventType::StepFailed => {
                step.status = StepStatus::Failed;
                step.ended_at = Some(event.timestamp);
                step.duration_ms = event.duration_ms;
                step.error = event.error.clone();
            }
            EventType::StepSkipped => {
                step.status = StepStatus::Skipped;
                step.ended_at = Some(event.timestamp);
                step.error = event.error.clone();
            }
            _ => unreachable!("only step-level events reach apply_step"),
        }

        Ok(())
    }

    /// Liveness as seen by monitoring.
    ///
    /// Stalled means no scheduler is driving the execution: it was
    /// released on drain, or its last heartbeat is older than the timeout.
    pub fn health(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> Health {
        if self.status.is_terminal() {
            return Health::Finished;
        }
        if self.released {
            return Health::Stalled;
        }

        let last_sign_of_life = self
            .last_heartbeat
            .or(self.started_at)
            .unwrap_or(self.created_at);

        if now - last_sign_of_life > heartbeat_timeout {
            Health::Stalled
        } else {
            Health::Active
        }
    }

    /// Whether the execution has reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get a step result by id
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }

    /// Tally step statuses
    pub fn step_counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for step in self.steps.values() {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Succeeded => counts.succeeded += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Condense into a summary row for listings
    pub fn summary(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            definition: self.definition.clone(),
            pipeline_name: self.pipeline_name.clone(),
            status: self.status,
            health: self.health(now, heartbeat_timeout),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            steps: self.step_counts(),
        }
    }
}

/// Result of one step within an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,

    /// Number of attempts dispatched so far
    pub attempts: u32,

    /// Error detail (Failed, Skipped, or the last retried attempt)
    pub error: Option<String>,

    /// Produced outputs (Succeeded only)
    pub artifact: Option<ArtifactRef>,

    /// Short description of produced outputs
    pub output_summary: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Duration of the last finished attempt
    pub duration_ms: Option<u64>,
}

/// Overall status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Legal edges of the execution state machine
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        matches!(
            (self, to),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Succeeded)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
                | (ExecutionStatus::Running, ExecutionStatus::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet dispatched, or waiting for a retry
    #[default]
    Pending,

    /// An attempt is in flight
    Running,

    /// Produced its outputs
    Succeeded,

    /// Failed after retries were exhausted (or fatally)
    Failed,

    /// Will not run (upstream failure or cancellation)
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness of an execution as surfaced to monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// In progress with a recent heartbeat
    Active,

    /// In progress, but no heartbeat within the timeout
    Stalled,

    /// Terminal
    Finished,
}

/// Per-status step tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Listing row for the monitoring surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub health: Health,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: StepCounts,
}

/// Filter for `ExecutionStore::list`
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Only executions in this status
    pub status: Option<ExecutionStatus>,

    /// Only executions of this pipeline id
    pub pipeline_id: Option<String>,

    /// Only executions whose liveness is Stalled
    pub stalled_only: bool,

    /// Unfinished executions only (Pending or Running)
    pub unfinished_only: bool,

    /// Maximum number of rows (most recent first)
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, summary: &ExecutionSummary) -> bool {
        if let Some(status) = self.status {
            if summary.status != status {
                return false;
            }
        }
        if let Some(ref pipeline_id) = self.pipeline_id {
            if &summary.definition.id != pipeline_id {
                return false;
            }
        }
        if self.stalled_only && summary.health != Health::Stalled {
            return false;
        }
        if self.unfinished_only && summary.status.is_terminal() {
            return false;
        }
        true
    }
}

/// Rejected transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Event belongs to execution {actual}, not {expected}")]
    WrongExecution { expected: Uuid, actual: Uuid },

    #[error("Execution {0} already exists")]
    AlreadyCreated(Uuid),

    #[error("Execution log must start with execution_created")]
    MissingHeader,

    #[error("Execution {0} is not running")]
    NotRunning(Uuid),

    #[error("Invalid execution transition: {from} → {to}")]
    InvalidExecutionTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("{0:?} event is missing a step id")]
    MissingStepId(EventType),

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Invalid transition for step '{step}': {event:?} (attempt {attempt}) from {from} after {attempts} attempt(s)")]
    InvalidStepTransition {
        step: String,
        from: StepStatus,
        attempts: u32,
        event: EventType,
        attempt: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::CreatedPayload;

    fn created(id: Uuid, steps: &[&str]) -> Event {
        Event::created(
            id,
            CreatedPayload {
                definition: DefinitionRef {
                    id: "etl".to_string(),
                    version: 1,
                },
                pipeline_name: "ETL".to_string(),
                plan_fingerprint: "abc".to_string(),
                steps: steps.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    fn running(steps: &[&str]) -> Execution {
        let id = Uuid::new_v4();
        let mut execution = Execution::from_created(&created(id, steps)).unwrap();
        execution
            .apply(&Event::execution(id, EventType::ExecutionStarted, String::new()))
            .unwrap();
        execution
    }

    #[test]
    fn test_execution_from_events() {
        let id = Uuid::new_v4();
        let events = vec![
            created(id, &["a"]),
            Event::execution(id, EventType::ExecutionStarted, String::new()),
            Event::step(id, "a", 1, EventType::StepStarted, String::new()),
            Event::step(id, "a", 1, EventType::StepSucceeded, String::new()).with_duration(12),
            Event::execution(id, EventType::ExecutionSucceeded, String::new()),
        ];

        let execution = Execution::from_events(&events).unwrap();

        assert_eq!(execution.id, id);
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(execution.step("a").unwrap().status, StepStatus::Succeeded);
        assert_eq!(execution.step("a").unwrap().duration_ms, Some(12));
        assert!(execution.ended_at.is_some());
    }

    #[test]
    fn test_log_must_start_with_created() {
        let id = Uuid::new_v4();
        let events = vec![Event::execution(id, EventType::ExecutionStarted, String::new())];
        assert!(Execution::from_events(&events).is_none());
    }

    #[test]
    fn test_terminal_execution_is_a_sink() {
        let mut execution = running(&["a"]);
        let id = execution.id;
        execution
            .apply(&Event::execution(id, EventType::ExecutionCancelled, String::new()))
            .unwrap();

        let result = execution.apply(&Event::execution(id, EventType::ExecutionSucceeded, String::new()));
        assert!(matches!(
            result,
            Err(TransitionError::InvalidExecutionTransition {
                from: ExecutionStatus::Cancelled,
                to: ExecutionStatus::Succeeded
            })
        ));
    }

    #[test]
    fn test_step_attempts_must_advance() {
        let mut execution = running(&["a"]);
        let id = execution.id;

        // Attempt 2 before attempt 1 is out of order
        let early = Event::step(id, "a", 2, EventType::StepStarted, String::new());
        assert!(execution.apply(&early).is_err());

        execution
            .apply(&Event::step(id, "a", 1, EventType::StepStarted, String::new()))
            .unwrap();
        execution
            .apply(&Event::step(id, "a", 1, EventType::StepRetrying, String::new()).with_error("io"))
            .unwrap();
        assert_eq!(execution.step("a").unwrap().status, StepStatus::Pending);
        assert_eq!(execution.step("a").unwrap().attempts, 1);

        // Finishing an attempt that is not the current one is rejected
        let stale = Event::step(id, "a", 1, EventType::StepSucceeded, String::new());
        assert!(execution.apply(&stale).is_err());

        execution
            .apply(&Event::step(id, "a", 2, EventType::StepStarted, String::new()))
            .unwrap();
        execution
            .apply(&Event::step(id, "a", 2, EventType::StepSucceeded, String::new()))
            .unwrap();
        assert_eq!(execution.step("a").unwrap().attempts, 2);
    }

    #[test]
    fn test_terminal_step_rejects_further_transitions() {
        let mut execution = running(&["a"]);
        let id = execution.id;
        execution
            .apply(&Event::step(id, "a", 1, EventType::StepStarted, String::new()))
            .unwrap();
        execution
            .apply(&Event::step(id, "a", 1, EventType::StepFailed, String::new()))
            .unwrap();

        let skip = Event::step(id, "a", 1, EventType::StepSkipped, String::new());
        assert!(matches!(
            execution.apply(&skip),
            Err(TransitionError::InvalidStepTransition { .. })
        ));
    }

    #[test]
    fn test_stalled_health() {
        let execution = running(&["a"]);
        let started = execution.started_at.unwrap();

        assert_eq!(
            execution.health(started + Duration::seconds(5), Duration::seconds(10)),
            Health::Active
        );
        assert_eq!(
            execution.health(started + Duration::seconds(11), Duration::seconds(10)),
            Health::Stalled
        );
    }

    #[test]
    fn test_released_execution_is_stalled_until_next_heartbeat() {
        let mut execution = running(&["a"]);
        let id = execution.id;
        let now = Utc::now();

        execution.apply(&Event::released(id)).unwrap();
        assert!(execution.released);
        assert_eq!(execution.health(now, Duration::seconds(60)), Health::Stalled);

        execution.apply(&Event::heartbeat(id)).unwrap();
        assert!(!execution.released);
        assert_eq!(execution.health(Utc::now(), Duration::seconds(60)), Health::Active);

        // Only Running executions can be released
        execution
            .apply(&Event::execution(id, EventType::ExecutionSucceeded, String::new()))
            .unwrap();
        assert_eq!(
            execution.apply(&Event::released(id)).unwrap_err(),
            TransitionError::NotRunning(id)
        );
    }

    #[test]
    fn test_filter_matching() {
        let execution = running(&["a", "b"]);
        let summary = execution.summary(Utc::now(), Duration::seconds(60));

        assert!(ExecutionFilter::default().matches(&summary));
        assert!(ExecutionFilter {
            status: Some(ExecutionStatus::Running),
            unfinished_only: true,
            ..Default::default()
        }
        .matches(&summary));
        assert!(!ExecutionFilter {
            pipeline_id: Some("other".to_string()),
            ..Default::default()
        }
        .matches(&summary));
        assert_eq!(summary.steps.pending, 2);
    }
}
