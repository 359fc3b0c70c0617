//! Step runner: executes one attempt of one step.
//!
//! The runner resolves the step's node kind (and data source, for source
//! nodes), invokes it with the upstream values bound to its input ports,
//! and enforces the attempt's timeout, cancellation and output contract.
//! Retry decisions belong to the scheduler; the runner only classifies
//! each failure as retryable or not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::plan::PlannedStep;
use crate::core::safety::SafetyLimits;
use crate::domain::PortSpec;
use crate::registry::{NodeRegistry, NodeRole};
use crate::sources::{SourceCatalog, SourceHandle};

/// Values bound to a step's input ports
pub type StepInputs = BTreeMap<String, Value>;

/// Values produced on a step's output ports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub ports: BTreeMap<String, Value>,
}

impl StepOutput {
    /// Output with a single port
    pub fn single(port: impl Into<String>, value: Value) -> Self {
        Self::default().with(port, value)
    }

    pub fn with(mut self, port: impl Into<String>, value: Value) -> Self {
        self.ports.insert(port.into(), value);
        self
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.ports.get(port)
    }

    /// Short description of the produced values (never their contents)
    pub fn summary(&self) -> String {
        if self.ports.is_empty() {
            return "no outputs".to_string();
        }

        self.ports
            .iter()
            .map(|(port, value)| {
                let shape = match value {
                    Value::Array(rows) => format!("{} records", rows.len()),
                    Value::String(s) => format!("string ({} chars)", s.chars().count()),
                    Value::Number(_) => "number".to_string(),
                    Value::Bool(_) => "bool".to_string(),
                    Value::Object(map) => format!("object ({} keys)", map.len()),
                    Value::Null => "null".to_string(),
                };
                format!("{}: {}", port, shape)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Failure of a single attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Transient failure; another attempt may succeed
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; retrying cannot help
    #[error("{0}")]
    Fatal(String),

    /// The attempt exceeded its wall-time limit
    #[error("Attempt timed out after {0}s")]
    TimedOut(u64),

    /// No heartbeat within the liveness timeout
    #[error("No heartbeat for {0}s; attempt presumed hung")]
    Stalled(u64),

    /// The execution was cancelled while the attempt was running
    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the scheduler may retry this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::Retryable(_) | StepError::TimedOut(_) | StepError::Stalled(_)
        )
    }
}

/// Liveness signal shared between an attempt and the scheduler's watchdog
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record a sign of life
    pub fn beat(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last sign of life
    pub fn since_last(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// Everything a node kind sees while executing one attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub config: BTreeMap<String, Value>,

    /// Effective output ports the attempt must produce
    pub outputs: Vec<PortSpec>,

    pub heartbeat: Heartbeat,
    pub cancel: CancellationToken,

    /// Resolved data source (source nodes with a `source_id`)
    pub source: Option<SourceHandle>,
}

impl StepContext {
    /// Required string config value
    pub fn config_str(&self, key: &str) -> Result<&str, StepError> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::Fatal(format!("config key '{}' must be a string", key)))
    }

    /// Required config value of any shape
    pub fn config_value(&self, key: &str) -> Result<&Value, StepError> {
        self.config
            .get(key)
            .ok_or_else(|| StepError::Fatal(format!("missing config key '{}'", key)))
    }
}

/// Identity and control handles of one attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub execution_id: Uuid,
    pub attempt: u32,
    pub heartbeat: Heartbeat,
    pub cancel: CancellationToken,
}

/// Executes individual step attempts
pub struct StepRunner {
    registry: Arc<NodeRegistry>,
    sources: Arc<dyn SourceCatalog>,
    limits: SafetyLimits,
}

impl StepRunner {
    pub fn new(registry: Arc<NodeRegistry>, sources: Arc<dyn SourceCatalog>, limits: SafetyLimits) -> Self {
        Self {
            registry,
            sources,
            limits,
        }
    }

    /// Run one attempt of `step` with `inputs` bound to its input ports
    #[tracing::instrument(skip_all, fields(step = %step.id, attempt = attempt.attempt))]
    pub async fn run(
        &self,
        step: &PlannedStep,
        inputs: StepInputs,
        attempt: AttemptContext,
    ) -> Result<StepOutput, StepError> {
        let kind = self
            .registry
            .get(&step.kind)
            .map_err(|e| StepError::Fatal(e.to_string()))?;

        let source = match (step.role, step.config.get("source_id").and_then(Value::as_str)) {
            (NodeRole::Source, Some(source_id)) => Some(self.sources.resolve(source_id)?),
            _ => None,
        };

        let ctx = StepContext {
            execution_id: attempt.execution_id,
            step_id: step.id.clone(),
            attempt: attempt.attempt,
            config: step.config.clone(),
            outputs: step.outputs.clone(),
            heartbeat: attempt.heartbeat.clone(),
            cancel: attempt.cancel.clone(),
            source,
        };

        attempt.heartbeat.beat();
        tracing::debug!(step = %step.id, kind = %step.kind, attempt = attempt.attempt, "Executing step");

        let execution = kind.execute(ctx, inputs);
        let output = tokio::select! {
            biased;
            _ = attempt.cancel.cancelled() => return Err(StepError::Cancelled),
            result = with_timeout(step.timeout_seconds, execution) => result?,
        };

        self.check_output(step, &output)?;
        Ok(output)
    }

    /// Outputs must cover exactly the declared ports, with matching types
    fn check_output(&self, step: &PlannedStep, output: &StepOutput) -> Result<(), StepError> {
        for port in &step.outputs {
            let value = output.get(&port.name).ok_or_else(|| {
                StepError::Fatal(format!("step did not produce output port '{}'", port.name))
            })?;
            if !port.port_type.matches_value(value) {
                return Err(StepError::Fatal(format!(
                    "output port '{}' produced a value that is not {}",
                    port.name, port.port_type
                )));
            }
        }

        if let Some(extra) = output
            .ports
            .keys()
            .find(|name| !step.outputs.iter().any(|p| &p.name == *name))
        {
            return Err(StepError::Fatal(format!("step produced undeclared output port '{}'", extra)));
        }

        let size = serde_json::to_vec(output).map(|b| b.len()).unwrap_or_default() as u64;
        self.limits
            .check_output_size(size)
            .map_err(|e| StepError::Fatal(e.to_string()))
    }
}

async fn with_timeout<F>(timeout_seconds: Option<u64>, fut: F) -> Result<StepOutput, StepError>
where
    F: std::future::Future<Output = Result<StepOutput, StepError>>,
{
    match timeout_seconds {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), fut)
            .await
            .unwrap_or(Err(StepError::TimedOut(secs))),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retryable_classification() {
        assert!(StepError::Retryable("io".into()).is_retryable());
        assert!(StepError::TimedOut(5).is_retryable());
        assert!(StepError::Stalled(60).is_retryable());
        assert!(!StepError::Fatal("bad config".into()).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }

    #[test]
    fn test_output_summary_omits_contents() {
        let output = StepOutput::single("out", json!([{ "ssn": "123" }, { "ssn": "456" }]))
            .with("count", json!(2));

        let summary = output.summary();
        assert_eq!(summary, "count: number, out: 2 records");
        assert!(!summary.contains("123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_tracks_elapsed_time() {
        let heartbeat = Heartbeat::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(heartbeat.since_last() >= Duration::from_secs(5));

        heartbeat.beat();
        assert!(heartbeat.since_last() < Duration::from_secs(1));
    }
}
