//! Shared test doubles: a configurable test kind that can fail, sleep,
//! hang without heartbeating, and records when each step runs.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pipewright::core::{SafetyLimits, StepContext, StepError, StepInputs, StepOutput};
use pipewright::domain::{Edge, NodeSpec, PipelineDefinition, PortSpec, PortType};
use pipewright::registry::{ConfigSchema, ConfigType, NodeDescriptor, NodeKind, NodeRegistry, NodeRole};
use serde_json::{json, Value};

/// What the test kinds observed
#[derive(Debug, Default)]
pub struct Trace {
    log: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Trace {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn position(&self, entry: &str) -> Option<usize> {
        self.log.lock().iter().position(|e| e == entry)
    }

    /// Whether `first` finished before `second` started
    pub fn finished_before_start(&self, first: &str, second: &str) -> bool {
        match (
            self.position(&format!("end:{}", first)),
            self.position(&format!("start:{}", second)),
        ) {
            (Some(end), Some(start)) => end < start,
            _ => false,
        }
    }

    pub fn started(&self, step: &str) -> bool {
        self.position(&format!("start:{}", step)).is_some()
    }
}

struct Running<'a> {
    trace: &'a Trace,
    step: String,
}

impl<'a> Running<'a> {
    fn enter(trace: &'a Trace, step: &str) -> Self {
        trace.log.lock().push(format!("start:{}", step));
        let now = trace.running.fetch_add(1, Ordering::SeqCst) + 1;
        trace.max_running.fetch_max(now, Ordering::SeqCst);
        Self {
            trace,
            step: step.to_string(),
        }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.trace.running.fetch_sub(1, Ordering::SeqCst);
        self.trace.log.lock().push(format!("end:{}", self.step));
    }
}

/// Scriptable node kind.
///
/// Config (all optional):
/// - `fail`: "fatal" or "retryable"
/// - `fail_attempts`: only fail while the attempt is at most this
/// - `sleep_ms`: cooperative sleep before finishing
/// - `hang_attempts`: on these attempts, sleep a minute without heartbeating
/// - `block_ms`: block the worker thread, ignoring cancellation
struct Scripted {
    kind: &'static str,
    role: NodeRole,
    trace: Arc<Trace>,
}

fn records_port(name: &str) -> PortSpec {
    PortSpec::new(name, PortType::Records)
}

fn config_u64(ctx: &StepContext, key: &str) -> Option<u64> {
    ctx.config.get(key).and_then(Value::as_u64)
}

#[async_trait]
impl NodeKind for Scripted {
    fn descriptor(&self) -> NodeDescriptor {
        let inputs = match self.role {
            NodeRole::Source => vec![],
            _ => vec![records_port("in")],
        };
        NodeDescriptor {
            kind: self.kind.to_string(),
            role: self.role,
            description: "Scriptable test kind".to_string(),
            inputs,
            outputs: vec![records_port("out")],
            config: ConfigSchema::new()
                .optional("fail", ConfigType::String, "fatal or retryable")
                .optional("fail_attempts", ConfigType::Integer, "Fail only on these attempts")
                .optional("sleep_ms", ConfigType::Integer, "Sleep before finishing")
                .optional("hang_attempts", ConfigType::Integer, "Hang on these attempts")
                .optional("block_ms", ConfigType::Integer, "Block the thread without yielding"),
        }
    }

    async fn execute(&self, ctx: StepContext, inputs: StepInputs) -> Result<StepOutput, StepError> {
        let _running = Running::enter(&self.trace, &ctx.step_id);

        if let Some(ms) = config_u64(&ctx, "block_ms") {
            std::thread::sleep(Duration::from_millis(ms));
        }

        if config_u64(&ctx, "hang_attempts").is_some_and(|n| u64::from(ctx.attempt) <= n) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        if let Some(ms) = config_u64(&ctx, "sleep_ms") {
            let step = tokio::time::sleep(Duration::from_millis(ms));
            tokio::pin!(step);
            loop {
                tokio::select! {
                    _ = &mut step => break,
                    _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => ctx.heartbeat.beat(),
                }
            }
        }

        let failing = config_u64(&ctx, "fail_attempts").map_or(true, |n| u64::from(ctx.attempt) <= n);
        match ctx.config.get("fail").and_then(Value::as_str) {
            Some("fatal") if failing => return Err(StepError::Fatal(format!("{} broke", ctx.step_id))),
            Some("retryable") if failing => {
                return Err(StepError::Retryable(format!("{} flaked on attempt {}", ctx.step_id, ctx.attempt)))
            }
            _ => {}
        }

        let mut records = match inputs.get("in") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![],
        };
        records.push(json!({ "step": ctx.step_id }));
        Ok(StepOutput::single("out", Value::Array(records)))
    }
}

/// Registry with the built-ins plus `test.source` and `test.step` kinds
pub fn registry(trace: &Arc<Trace>) -> NodeRegistry {
    let mut builder = NodeRegistry::with_builtins(&SafetyLimits::default());
    builder
        .register(Scripted {
            kind: "test.source",
            role: NodeRole::Source,
            trace: Arc::clone(trace),
        })
        .unwrap()
        .register(Scripted {
            kind: "test.step",
            role: NodeRole::Transform,
            trace: Arc::clone(trace),
        })
        .unwrap();
    builder.build()
}

pub fn source(id: &str) -> NodeSpec {
    NodeSpec::new(id, "test.source")
}

pub fn step(id: &str) -> NodeSpec {
    NodeSpec::new(id, "test.step")
}

pub fn definition(id: &str, nodes: Vec<NodeSpec>, edges: &[(&str, &str)]) -> PipelineDefinition {
    PipelineDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        nodes,
        edges: edges
            .iter()
            .map(|(from, to)| Edge::parse(&format!("{}.out", from), &format!("{}.in", to)).unwrap())
            .collect(),
    }
}
