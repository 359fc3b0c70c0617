//! pipewright - Pipeline definition and execution engine
//!
//! Pipelines are graphs of typed nodes (sources, transforms and sinks)
//! connected by port-to-port edges. A definition is validated into a
//! deterministic execution plan, then run by a scheduler that dispatches
//! steps as their dependencies succeed.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every state transition is validated and appended to the execution's log
//! - Current state is derived by replaying the log
//! - Unfinished executions are resumed from the log after a restart
//!
//! # Modules
//!
//! - `registry`: Node kinds and their port/config contracts
//! - `sources`: Data source catalog for root nodes
//! - `core`: Validator, Scheduler, Step Runner, Execution Store
//! - `domain`: Data structures (definitions, events, executions)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Check a definition
//! pipewright validate pipelines/orders.yaml
//!
//! # Run it and follow progress
//! pipewright run pipelines/orders.yaml
//!
//! # Inspect executions
//! pipewright executions --status running
//! pipewright status <execution-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod registry;
pub mod sources;

// Re-export main types at crate root for convenience
pub use core::{ExecutionHandle, ExecutionPlan, Orchestrator, ValidationError};
pub use domain::{Event, EventType, Execution, ExecutionStatus, PipelineDefinition, StepStatus};
pub use registry::{NodeDescriptor, NodeKind, NodeRegistry};
