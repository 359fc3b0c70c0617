//! Pipeline definitions as authored by the builder surface.
//!
//! A definition is a set of nodes (each naming a registered kind) wired
//! together by edges between named ports. Definitions are plain data: the
//! validator turns them into an [`ExecutionPlan`](crate::core::ExecutionPlan).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::retry::RetryPolicy;

/// A complete, user-authored pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Stable pipeline identifier (versions are tracked per id)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Nodes in authoring order
    pub nodes: Vec<NodeSpec>,

    /// Port-to-port wiring
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl PipelineDefinition {
    /// Load a definition from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline definition YAML")
    }

    /// Parse a definition from JSON content
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse pipeline definition JSON")
    }

    /// Get a node by id
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// SHA-256 of the canonical JSON encoding (hex, full length).
    ///
    /// Config maps are ordered, so two definitions that differ only in
    /// YAML key order hash identically.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// One unit of work in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node id (unique within a definition)
    pub id: String,

    /// Registered node kind, e.g. `transform.filter`
    pub kind: String,

    /// Kind-specific configuration, checked against the kind's schema
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Declared input ports. Empty means "use the kind's ports as-is".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PortSpec>,

    /// Declared output ports. Empty means "use the kind's ports as-is".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PortSpec>,

    /// Retry policy for explicit step failures (none = no automatic retry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Hard limit on a single attempt's wall time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl NodeSpec {
    /// Create a node with no config and the kind's default ports
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            retry: None,
            timeout_seconds: None,
        }
    }

    /// Set a configuration value
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Declare an input port
    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    /// Declare an output port
    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// A named, typed port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub port_type: PortType,

    /// Optional inputs may be left unbound
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Data types that can flow along an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    /// A sequence of JSON objects
    Records,

    /// A single integer
    Int,

    /// A single string
    String,

    /// A single boolean
    Bool,

    /// Any JSON value
    Json,
}

impl PortType {
    /// Whether a port of this type accepts a value produced as `produced`
    pub fn accepts(self, produced: PortType) -> bool {
        self == PortType::Json || self == produced
    }

    /// Whether a declared type may narrow a kind's port of type `base`
    pub fn narrows(self, base: PortType) -> bool {
        base == PortType::Json || self == base
    }

    /// Check whether a concrete JSON value conforms to this type
    pub fn matches_value(self, value: &serde_json::Value) -> bool {
        match self {
            PortType::Records => value
                .as_array()
                .map(|rows| rows.iter().all(|r| r.is_object()))
                .unwrap_or(false),
            PortType::Int => value.is_i64() || value.is_u64(),
            PortType::String => value.is_string(),
            PortType::Bool => value.is_boolean(),
            PortType::Json => true,
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortType::Records => "records",
            PortType::Int => "int",
            PortType::String => "string",
            PortType::Bool => "bool",
            PortType::Json => "json",
        };
        f.write_str(s)
    }
}

/// A directed connection from a producer port to a consumer port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: PortRef,
    pub to: PortRef,
}

impl Edge {
    pub fn new(from: PortRef, to: PortRef) -> Self {
        Self { from, to }
    }

    /// Parse both ends from `node.port` notation
    pub fn parse(from: &str, to: &str) -> Result<Self> {
        Ok(Self {
            from: PortRef::try_from(from.to_string())?,
            to: PortRef::try_from(to.to_string())?,
        })
    }
}

/// Reference to a port on a node, written `node.port`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl TryFrom<String> for PortRef {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        match value.rsplit_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => {
                Ok(Self::new(node, port))
            }
            _ => anyhow::bail!("Invalid port reference '{}': expected 'node.port'", value),
        }
    }
}

impl From<PortRef> for String {
    fn from(value: PortRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// The definition version an execution is pinned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: String,
    pub version: u32,
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}
