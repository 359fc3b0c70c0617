//! Domain types for the pipewright engine.
//!
//! This module contains the core data structures:
//! - Definition: user-authored nodes and edges
//! - Events: immutable records of state transitions
//! - Execution: run state derived from events
//! - Artifact: references to step outputs

pub mod artifact;
pub mod definition;
pub mod events;
pub mod execution;

// Re-export commonly used types
pub use artifact::ArtifactRef;
pub use definition::{DefinitionRef, Edge, NodeSpec, PipelineDefinition, PortRef, PortSpec, PortType};
pub use events::{CreatedPayload, Event, EventType};
pub use execution::{
    Execution, ExecutionFilter, ExecutionStatus, ExecutionSummary, Health, StepCounts,
    StepResult, StepStatus, TransitionError,
};
