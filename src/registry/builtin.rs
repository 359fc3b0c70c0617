//! Built-in node kinds.
//!
//! Sources produce records, transforms reshape them, sinks hand them to
//! the outside world. Every kind here is pure apart from `sink.jsonl`,
//! which writes a file, and `source.catalog`, which reads a configured
//! data source.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use super::{ConfigSchema, ConfigType, NodeDescriptor, NodeKind, NodeRole};
use crate::core::runner::{StepContext, StepError, StepInputs, StepOutput};
use crate::core::safety::SafetyLimits;
use crate::domain::{PortSpec, PortType};

/// Rows processed between heartbeats
const HEARTBEAT_EVERY: usize = 1000;

/// Every built-in kind
pub fn builtin_kinds(limits: &SafetyLimits) -> Vec<Arc<dyn NodeKind>> {
    vec![
        Arc::new(InlineSource),
        Arc::new(ValueSource),
        Arc::new(CatalogSource),
        Arc::new(Filter),
        Arc::new(Select),
        Arc::new(Union),
        Arc::new(Count),
        Arc::new(Format),
        Arc::new(Collect),
        Arc::new(JsonlSink {
            limits: limits.clone(),
        }),
    ]
}

fn descriptor(
    kind: &str,
    role: NodeRole,
    description: &str,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    config: ConfigSchema,
) -> NodeDescriptor {
    NodeDescriptor {
        kind: kind.to_string(),
        role,
        description: description.to_string(),
        inputs,
        outputs,
        config,
    }
}

/// Take a records-typed input
fn take_records(inputs: &mut StepInputs, port: &str) -> Result<Vec<Value>, StepError> {
    match inputs.remove(port) {
        Some(Value::Array(rows)) => Ok(rows),
        Some(_) => Err(StepError::Fatal(format!("input '{}' is not a list of records", port))),
        None => Err(StepError::Fatal(format!("input '{}' is not bound", port))),
    }
}

/// Beat and honour cancellation while looping over rows
fn checkpoint(ctx: &StepContext, index: usize) -> Result<(), StepError> {
    if index % HEARTBEAT_EVERY == 0 {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        ctx.heartbeat.beat();
    }
    Ok(())
}

fn records_port(name: &str) -> PortSpec {
    PortSpec::new(name, PortType::Records)
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Records embedded in the node config
struct InlineSource;

#[async_trait]
impl NodeKind for InlineSource {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "source.inline",
            NodeRole::Source,
            "Emit records embedded in the node config",
            vec![],
            vec![records_port("out")],
            ConfigSchema::new().required("records", ConfigType::Array, "Records to emit"),
        )
    }

    async fn execute(&self, ctx: StepContext, _inputs: StepInputs) -> Result<StepOutput, StepError> {
        let records = ctx.config_value("records")?.clone();
        if !PortType::Records.matches_value(&records) {
            return Err(StepError::Fatal("every inline record must be an object".to_string()));
        }
        Ok(StepOutput::single("out", records))
    }
}

/// A single constant value; declare a narrower output type to use it as
/// an int or string
struct ValueSource;

#[async_trait]
impl NodeKind for ValueSource {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "source.value",
            NodeRole::Source,
            "Emit a constant value",
            vec![],
            vec![PortSpec::new("out", PortType::Json)],
            ConfigSchema::new().required("value", ConfigType::Any, "Value to emit"),
        )
    }

    async fn execute(&self, ctx: StepContext, _inputs: StepInputs) -> Result<StepOutput, StepError> {
        Ok(StepOutput::single("out", ctx.config_value("value")?.clone()))
    }
}

/// Records read from a configured data source
struct CatalogSource;

#[async_trait]
impl NodeKind for CatalogSource {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "source.catalog",
            NodeRole::Source,
            "Read records from a configured data source",
            vec![],
            vec![records_port("out")],
            ConfigSchema::new()
                .required("source_id", ConfigType::String, "Id from the sources config section")
                .optional("limit", ConfigType::Integer, "Keep at most this many records"),
        )
    }

    async fn execute(&self, ctx: StepContext, _inputs: StepInputs) -> Result<StepOutput, StepError> {
        let source = ctx
            .source
            .as_ref()
            .ok_or_else(|| StepError::Fatal("data source was not resolved".to_string()))?;

        let mut records = source.read(&ctx.heartbeat).await?;
        if let Some(limit) = ctx.config.get("limit").and_then(Value::as_u64) {
            records.truncate(limit as usize);
        }

        Ok(StepOutput::single("out", Value::Array(records)))
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Keep records whose field equals a value
struct Filter;

#[async_trait]
impl NodeKind for Filter {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "transform.filter",
            NodeRole::Transform,
            "Keep records whose field equals a value",
            vec![records_port("in")],
            vec![records_port("out")],
            ConfigSchema::new()
                .required("field", ConfigType::String, "Field to compare")
                .required("equals", ConfigType::Any, "Value the field must equal"),
        )
    }

    async fn execute(&self, ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let field = ctx.config_str("field")?;
        let expected = ctx.config_value("equals")?;
        let rows = take_records(&mut inputs, "in")?;

        let mut kept = Vec::new();
        for (i, row) in rows.into_iter().enumerate() {
            checkpoint(&ctx, i)?;
            if row.get(field) == Some(expected) {
                kept.push(row);
            }
        }

        Ok(StepOutput::single("out", Value::Array(kept)))
    }
}

/// Project records onto a subset of fields
struct Select;

#[async_trait]
impl NodeKind for Select {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "transform.select",
            NodeRole::Transform,
            "Keep only the listed fields of each record",
            vec![records_port("in")],
            vec![records_port("out")],
            ConfigSchema::new().required("fields", ConfigType::Array, "Field names to keep"),
        )
    }

    async fn execute(&self, ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let fields: Vec<&str> = ctx
            .config_value("fields")?
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let rows = take_records(&mut inputs, "in")?;

        let mut projected = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            checkpoint(&ctx, i)?;
            let mut out = Map::new();
            for field in &fields {
                if let Some(value) = row.get(*field) {
                    out.insert(field.to_string(), value.clone());
                }
            }
            projected.push(Value::Object(out));
        }

        Ok(StepOutput::single("out", Value::Array(projected)))
    }
}

/// Concatenate two record streams
struct Union;

#[async_trait]
impl NodeKind for Union {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "transform.union",
            NodeRole::Transform,
            "Concatenate two record streams",
            vec![records_port("left"), records_port("right").optional()],
            vec![records_port("out")],
            ConfigSchema::new(),
        )
    }

    async fn execute(&self, _ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let mut rows = take_records(&mut inputs, "left")?;
        if inputs.contains_key("right") {
            rows.extend(take_records(&mut inputs, "right")?);
        }
        Ok(StepOutput::single("out", Value::Array(rows)))
    }
}

/// Number of records
struct Count;

#[async_trait]
impl NodeKind for Count {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "transform.count",
            NodeRole::Transform,
            "Count records",
            vec![records_port("in")],
            vec![PortSpec::new("out", PortType::Int)],
            ConfigSchema::new(),
        )
    }

    async fn execute(&self, _ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let rows = take_records(&mut inputs, "in")?;
        Ok(StepOutput::single("out", Value::from(rows.len() as u64)))
    }
}

/// Render a value into a string template
struct Format;

#[async_trait]
impl NodeKind for Format {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "transform.format",
            NodeRole::Transform,
            "Render the input into a template ({value} is replaced)",
            vec![PortSpec::new("value", PortType::Json)],
            vec![PortSpec::new("out", PortType::String)],
            ConfigSchema::new().required("template", ConfigType::String, "Template containing {value}"),
        )
    }

    async fn execute(&self, ctx: StepContext, inputs: StepInputs) -> Result<StepOutput, StepError> {
        let template = ctx.config_str("template")?;
        let rendered = match inputs.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(StepError::Fatal("input 'value' is not bound".to_string())),
        };
        Ok(StepOutput::single("out", Value::String(template.replace("{value}", &rendered))))
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Keep the input as the step's persisted result
struct Collect;

#[async_trait]
impl NodeKind for Collect {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "sink.collect",
            NodeRole::Sink,
            "Persist the input as the execution's result",
            vec![PortSpec::new("in", PortType::Json)],
            vec![PortSpec::new("result", PortType::Json)],
            ConfigSchema::new(),
        )
    }

    async fn execute(&self, _ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let value = inputs
            .remove("in")
            .ok_or_else(|| StepError::Fatal("input 'in' is not bound".to_string()))?;
        Ok(StepOutput::single("result", value))
    }
}

/// Write records to a JSON Lines file
struct JsonlSink {
    limits: SafetyLimits,
}

#[async_trait]
impl NodeKind for JsonlSink {
    fn descriptor(&self) -> NodeDescriptor {
        descriptor(
            "sink.jsonl",
            NodeRole::Sink,
            "Write records to a JSON Lines file",
            vec![records_port("in")],
            vec![PortSpec::new("written", PortType::Int)],
            ConfigSchema::new()
                .required("path", ConfigType::String, "Output file")
                .optional("append", ConfigType::Boolean, "Append instead of truncating"),
        )
    }

    async fn execute(&self, ctx: StepContext, mut inputs: StepInputs) -> Result<StepOutput, StepError> {
        let path = PathBuf::from(ctx.config_str("path")?);
        self.limits
            .check_path(&path)
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        let append = ctx.config.get("append").and_then(Value::as_bool).unwrap_or(false);
        let rows = take_records(&mut inputs, "in")?;

        let io_err = |e: std::io::Error| StepError::Retryable(format!("{}: {}", path.display(), e));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(io_err)?;

        for (i, row) in rows.iter().enumerate() {
            checkpoint(&ctx, i)?;
            let mut line = serde_json::to_string(row).map_err(|e| StepError::Fatal(e.to_string()))?;
            line.push('\n');
            file.write_all(line.as_bytes()).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;

        tracing::debug!(step = %ctx.step_id, path = %path.display(), rows = rows.len(), "Wrote records");
        Ok(StepOutput::single("written", Value::from(rows.len() as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::Heartbeat;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(config: Value) -> StepContext {
        let config: BTreeMap<String, Value> = serde_json::from_value(config).unwrap();
        StepContext {
            execution_id: Uuid::new_v4(),
            step_id: "step".to_string(),
            attempt: 1,
            config,
            outputs: vec![],
            heartbeat: Heartbeat::new(),
            cancel: CancellationToken::new(),
            source: None,
        }
    }

    fn inputs(pairs: &[(&str, Value)]) -> StepInputs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_filter_then_count() {
        let rows = json!([
            { "id": 1, "region": "eu" },
            { "id": 2, "region": "us" },
            { "id": 3, "region": "eu" }
        ]);

        let filtered = Filter
            .execute(
                ctx(json!({ "field": "region", "equals": "eu" })),
                inputs(&[("in", rows)]),
            )
            .await
            .unwrap();
        let kept = filtered.get("out").unwrap().clone();
        assert_eq!(kept.as_array().unwrap().len(), 2);

        let counted = Count.execute(ctx(json!({})), inputs(&[("in", kept)])).await.unwrap();
        assert_eq!(counted.get("out"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_select_projects_fields() {
        let out = Select
            .execute(
                ctx(json!({ "fields": ["id"] })),
                inputs(&[("in", json!([{ "id": 1, "secret": "x" }]))]),
            )
            .await
            .unwrap();
        assert_eq!(out.get("out"), Some(&json!([{ "id": 1 }])));
    }

    #[tokio::test]
    async fn test_union_with_optional_right() {
        let only_left = Union
            .execute(ctx(json!({})), inputs(&[("left", json!([{ "a": 1 }]))]))
            .await
            .unwrap();
        assert_eq!(only_left.get("out").unwrap().as_array().unwrap().len(), 1);

        let both = Union
            .execute(
                ctx(json!({})),
                inputs(&[("left", json!([{ "a": 1 }])), ("right", json!([{ "a": 2 }]))]),
            )
            .await
            .unwrap();
        assert_eq!(both.get("out").unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_format_renders_value() {
        let out = Format
            .execute(
                ctx(json!({ "template": "{value} orders shipped" })),
                inputs(&[("value", json!(42))]),
            )
            .await
            .unwrap();
        assert_eq!(out.get("out"), Some(&json!("42 orders shipped")));
    }

    #[tokio::test]
    async fn test_inline_source_rejects_scalars() {
        let err = InlineSource
            .execute(ctx(json!({ "records": [1, 2] })), StepInputs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_jsonl_sink_writes_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("orders.jsonl");
        let sink = JsonlSink {
            limits: SafetyLimits::default(),
        };

        let out = sink
            .execute(
                ctx(json!({ "path": path.to_string_lossy() })),
                inputs(&[("in", json!([{ "id": 1 }, { "id": 2 }]))]),
            )
            .await
            .unwrap();

        assert_eq!(out.get("written"), Some(&json!(2)));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_sink_respects_denylist() {
        let sink = JsonlSink {
            limits: SafetyLimits::default(),
        };
        let err = sink
            .execute(
                ctx(json!({ "path": "deploy/server.pem" })),
                inputs(&[("in", json!([]))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Fatal(_)));
    }
}
