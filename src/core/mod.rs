//! Core engine logic.
//!
//! This module contains:
//! - Validator: definition checks and plan construction
//! - Scheduler: dependency-driven dispatch of one execution
//! - Runner: single step attempts with timeouts and heartbeats
//! - Store: append-only execution log and artifacts
//! - Orchestrator: process-wide registry of running executions

pub mod definitions;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod runner;
pub mod safety;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod validator;

// Re-export commonly used types
pub use definitions::{DefinitionRepository, DefinitionVersion};
pub use orchestrator::{InvalidDefinition, Orchestrator};
pub use plan::{ExecutionPlan, InputBinding, PlannedStep};
pub use retry::RetryPolicy;
pub use runner::{AttemptContext, Heartbeat, StepContext, StepError, StepInputs, StepOutput, StepRunner};
pub use safety::{SafetyLimits, SafetyViolation};
pub use scheduler::{ExecutionHandle, Scheduler};
pub use store::{ExecutionStore, RecordOutcome, StoreError};
pub use subscription::{ExecutionUpdate, Subscription, SubscriptionItem};
pub use validator::{validate, PortDirection, ValidationError, Validator};
