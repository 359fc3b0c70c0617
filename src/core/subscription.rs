//! Live update streams for running executions.
//!
//! Each running execution owns a bounded broadcast channel. Publishing
//! never waits on subscribers: a subscriber that falls behind loses the
//! oldest updates and is told how many it missed. The store remains the
//! source of truth, so a lagging subscriber can always re-read state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::{Event, EventType, ExecutionStatus, StepStatus};

/// One recorded transition, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    pub attempt: u32,

    /// Execution status after the transition
    pub execution_status: ExecutionStatus,

    /// Step status after the transition (step-level events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn new(event: &Event, execution_status: ExecutionStatus, step_status: Option<StepStatus>) -> Self {
        Self {
            execution_id: event.execution_id,
            timestamp: event.timestamp,
            event_type: event.event_type,
            step_id: event.step_id.clone(),
            attempt: event.attempt,
            execution_status,
            step_status,
            error: event.error.clone(),
        }
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Update(ExecutionUpdate),

    /// This many updates were dropped because the subscriber lagged
    Missed(u64),
}

/// Receiving end of an execution's update stream.
///
/// Dropping the subscription (or calling [`Subscription::cancel`])
/// unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    execution_id: Uuid,
    rx: broadcast::Receiver<ExecutionUpdate>,
}

impl Subscription {
    pub(crate) fn new(execution_id: Uuid, rx: broadcast::Receiver<ExecutionUpdate>) -> Self {
        Self { execution_id, rx }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Next item, or None once the execution has finished and every
    /// buffered update was delivered
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        match self.rx.recv().await {
            Ok(update) => Some(SubscriptionItem::Update(update)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(SubscriptionItem::Missed(missed)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Stop receiving updates
    pub fn cancel(self) {}
}
