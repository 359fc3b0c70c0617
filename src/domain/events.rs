//! State transitions recorded by the execution store.
//!
//! Every change to an execution or one of its steps is an immutable event
//! appended to that execution's log. The current state is derived by
//! replaying events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactRef;
use super::definition::DefinitionRef;

/// A single state transition in an execution's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The execution this event belongs to
    pub execution_id: Uuid,

    /// Step id (None for execution-level transitions)
    pub step_id: Option<String>,

    /// Type of transition
    pub event_type: EventType,

    /// Attempt number the transition refers to (0 for execution-level)
    #[serde(default)]
    pub attempt: u32,

    /// Key format: "{execution_id}:{step|-}:{attempt}:{event_type}"
    pub idempotency_key: String,

    /// Human-readable summary (NO record contents)
    pub payload_summary: String,

    /// Time taken in milliseconds (for finished attempts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error detail for failures, skips and retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Produced outputs (StepSucceeded only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,

    /// Short description of the produced outputs (StepSucceeded only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,

    /// Execution header (ExecutionCreated only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<CreatedPayload>,
}

/// Header carried by the first event of every execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPayload {
    /// Pinned definition version
    pub definition: DefinitionRef,

    /// Pipeline display name at the pinned version
    pub pipeline_name: String,

    /// Fingerprint of the plan the execution was started with
    pub plan_fingerprint: String,

    /// Step ids in topological order
    pub steps: Vec<String>,
}

impl Event {
    fn new(
        execution_id: Uuid,
        step_id: Option<String>,
        event_type: EventType,
        attempt: u32,
        payload_summary: String,
    ) -> Self {
        let idempotency_key = transition_key(execution_id, step_id.as_deref(), attempt, event_type);
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            execution_id,
            step_id,
            event_type,
            attempt,
            idempotency_key,
            payload_summary,
            duration_ms: None,
            error: None,
            artifact: None,
            output_summary: None,
            created: None,
        }
    }

    /// The first event of an execution log
    pub fn created(execution_id: Uuid, header: CreatedPayload) -> Self {
        let summary = format!(
            "Execution created for {} ({} steps)",
            header.definition,
            header.steps.len()
        );
        let mut event = Self::new(execution_id, None, EventType::ExecutionCreated, 0, summary);
        event.created = Some(header);
        event
    }

    /// An execution-level transition
    pub fn execution(execution_id: Uuid, event_type: EventType, payload_summary: String) -> Self {
        Self::new(execution_id, None, event_type, 0, payload_summary)
    }

    /// A liveness marker; unique per timestamp so it never deduplicates
    pub fn heartbeat(execution_id: Uuid) -> Self {
        Self::marker(execution_id, EventType::ExecutionHeartbeat, "heartbeat", "Scheduler alive")
    }

    /// The scheduler stopped driving a Running execution (drain)
    pub fn released(execution_id: Uuid) -> Self {
        Self::marker(execution_id, EventType::ExecutionReleased, "released", "Released for recovery")
    }

    fn marker(execution_id: Uuid, event_type: EventType, tag: &str, summary: &str) -> Self {
        let mut event = Self::new(execution_id, None, event_type, 0, summary.to_string());
        event.idempotency_key = format!(
            "{}:{}:{}",
            execution_id,
            tag,
            event.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
        event
    }

    /// A step-level transition for the given attempt
    pub fn step(
        execution_id: Uuid,
        step_id: &str,
        attempt: u32,
        event_type: EventType,
        payload_summary: String,
    ) -> Self {
        Self::new(
            execution_id,
            Some(step_id.to_string()),
            event_type,
            attempt,
            payload_summary,
        )
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach the produced artifact and its summary
    pub fn with_artifact(mut self, artifact: ArtifactRef, summary: String) -> Self {
        self.artifact = Some(artifact);
        self.output_summary = Some(summary);
        self
    }
}

/// Build the idempotency key for a transition
pub fn transition_key(
    execution_id: Uuid,
    step_id: Option<&str>,
    attempt: u32,
    event_type: EventType,
) -> String {
    format!(
        "{}:{}:{}:{}",
        execution_id,
        step_id.unwrap_or("-"),
        attempt,
        event_type.as_str()
    )
}

/// Types of transitions that can be recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Execution record created (Pending)
    ExecutionCreated,

    /// Pending -> Running
    ExecutionStarted,

    /// Every step succeeded
    ExecutionSucceeded,

    /// All reachable steps terminal, at least one failed
    ExecutionFailed,

    /// Cancelled on request
    ExecutionCancelled,

    /// Scheduler liveness marker
    ExecutionHeartbeat,

    /// No scheduler drives the execution any more; free to recover
    ExecutionReleased,

    /// An attempt was dispatched
    StepStarted,

    /// The attempt produced its outputs
    StepSucceeded,

    /// The step failed permanently
    StepFailed,

    /// The attempt failed and another is scheduled
    StepRetrying,

    /// The step will not run (upstream failure or cancellation)
    StepSkipped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionCreated => "execution_created",
            EventType::ExecutionStarted => "execution_started",
            EventType::ExecutionSucceeded => "execution_succeeded",
            EventType::ExecutionFailed => "execution_failed",
            EventType::ExecutionCancelled => "execution_cancelled",
            EventType::ExecutionHeartbeat => "execution_heartbeat",
            EventType::ExecutionReleased => "execution_released",
            EventType::StepStarted => "step_started",
            EventType::StepSucceeded => "step_succeeded",
            EventType::StepFailed => "step_failed",
            EventType::StepRetrying => "step_retrying",
            EventType::StepSkipped => "step_skipped",
        }
    }

    /// Whether this transition targets a step
    pub fn is_step_level(&self) -> bool {
        matches!(
            self,
            EventType::StepStarted
                | EventType::StepSucceeded
                | EventType::StepFailed
                | EventType::StepRetrying
                | EventType::StepSkipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::step(
            Uuid::new_v4(),
            "extract",
            1,
            EventType::StepStarted,
            "Dispatching extract".to_string(),
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.attempt, 1);
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_transition_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let event = Event::step(id, "load", 2, EventType::StepFailed, String::new());

        assert_eq!(
            event.idempotency_key,
            "550e8400-e29b-41d4-a716-446655440000:load:2:step_failed"
        );

        let run = Event::execution(id, EventType::ExecutionStarted, String::new());
        assert_eq!(
            run.idempotency_key,
            "550e8400-e29b-41d4-a716-446655440000:-:0:execution_started"
        );
    }

    #[test]
    fn test_heartbeats_never_collide() {
        let id = Uuid::new_v4();
        let a = Event::heartbeat(id);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Event::heartbeat(id);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::step(
            Uuid::new_v4(),
            "transform",
            1,
            EventType::StepFailed,
            "Failed".to_string(),
        )
        .with_error("Connection timeout")
        .with_duration(1500);

        assert_eq!(event.error, Some("Connection timeout".to_string()));
        assert_eq!(event.duration_ms, Some(1500));
    }
}
