//! Catalog of node kinds.
//!
//! Each kind implements the [`NodeKind`] capability contract: it describes
//! its ports and config schema and knows how to execute one step. The
//! registry is assembled once at startup (built-ins plus any
//! collaborator-supplied kinds) and is immutable afterwards, so lookups
//! need no locking.

pub mod builtin;
pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::runner::{StepContext, StepError, StepInputs, StepOutput};
use crate::core::safety::SafetyLimits;
use crate::domain::PortSpec;

pub use schema::{ConfigField, ConfigSchema, ConfigType};

/// Process-wide registry, installed once
static REGISTRY: OnceLock<Arc<NodeRegistry>> = OnceLock::new();

/// Role of a node in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Reads from a data source; has no required inputs
    Source,

    /// Maps inputs to outputs
    Transform,

    /// Writes somewhere outside the engine
    Sink,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeRole::Source => "source",
            NodeRole::Transform => "transform",
            NodeRole::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// Static description of a node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Registered kind name, e.g. `transform.filter`
    pub kind: String,

    pub role: NodeRole,

    /// One-line description for listings
    pub description: String,

    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,

    /// Schema the node's config is checked against
    pub config: ConfigSchema,
}

impl NodeDescriptor {
    pub fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Capability contract every node kind implements
#[async_trait]
pub trait NodeKind: Send + Sync {
    /// Ports and config schema of this kind
    fn descriptor(&self) -> NodeDescriptor;

    /// Execute one attempt of a step.
    ///
    /// Long-running kinds should call `ctx.heartbeat.beat()` periodically
    /// and watch `ctx.cancel` so that hangs and cancellation are detected.
    async fn execute(&self, ctx: StepContext, inputs: StepInputs) -> Result<StepOutput, StepError>;
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown node kind: {0}")]
    UnknownKind(String),

    #[error("Node kind already registered: {0}")]
    DuplicateKind(String),

    #[error("The process-wide node registry is already initialized")]
    AlreadyInitialized,
}

struct RegisteredKind {
    descriptor: NodeDescriptor,
    implementation: Arc<dyn NodeKind>,
}

/// Immutable catalog of node kinds
pub struct NodeRegistry {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NodeRegistry {
    /// Start an empty registry
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::default()
    }

    /// Start a registry pre-populated with the built-in kinds
    pub fn with_builtins(limits: &SafetyLimits) -> NodeRegistryBuilder {
        let mut builder = Self::builder();
        for kind in builtin::builtin_kinds(limits) {
            builder.insert(kind);
        }
        builder
    }

    /// Describe a kind's ports and config schema
    pub fn describe(&self, kind: &str) -> Result<&NodeDescriptor, RegistryError> {
        self.kinds
            .get(kind)
            .map(|k| &k.descriptor)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))
    }

    /// Get the executable implementation of a kind
    pub fn get(&self, kind: &str) -> Result<Arc<dyn NodeKind>, RegistryError> {
        self.kinds
            .get(kind)
            .map(|k| Arc::clone(&k.implementation))
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))
    }

    /// All descriptors, ordered by kind name
    pub fn descriptors(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.kinds.values().map(|k| &k.descriptor)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Install `registry` as the process-wide registry.
    ///
    /// Must happen before the first call to [`NodeRegistry::global`].
    pub fn install(registry: NodeRegistry) -> Result<Arc<NodeRegistry>, RegistryError> {
        let registry = Arc::new(registry);
        REGISTRY
            .set(Arc::clone(&registry))
            .map_err(|_| RegistryError::AlreadyInitialized)?;
        Ok(registry)
    }

    /// The process-wide registry (built-ins with default limits unless
    /// something else was installed first)
    pub fn global() -> Arc<NodeRegistry> {
        Arc::clone(REGISTRY.get_or_init(|| {
            Arc::new(Self::with_builtins(&SafetyLimits::default()).build())
        }))
    }
}

/// Collects kinds before the registry is frozen
#[derive(Default)]
pub struct NodeRegistryBuilder {
    kinds: BTreeMap<String, RegisteredKind>,
}

impl NodeRegistryBuilder {
    /// Register a kind; names must be unique
    pub fn register<K: NodeKind + 'static>(&mut self, kind: K) -> Result<&mut Self, RegistryError> {
        self.register_arc(Arc::new(kind))
    }

    /// Register an already shared kind
    pub fn register_arc(&mut self, kind: Arc<dyn NodeKind>) -> Result<&mut Self, RegistryError> {
        let name = kind.descriptor().kind;
        if self.kinds.contains_key(&name) {
            return Err(RegistryError::DuplicateKind(name));
        }

        self.insert(kind);
        Ok(self)
    }

    fn insert(&mut self, kind: Arc<dyn NodeKind>) {
        let descriptor = kind.descriptor();
        self.kinds.insert(
            descriptor.kind.clone(),
            RegisteredKind {
                descriptor,
                implementation: kind,
            },
        );
    }

    /// Freeze the registry
    pub fn build(self) -> NodeRegistry {
        NodeRegistry { kinds: self.kinds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PortType;

    struct Noop;

    #[async_trait]
    impl NodeKind for Noop {
        fn descriptor(&self) -> NodeDescriptor {
            NodeDescriptor {
                kind: "test.noop".to_string(),
                role: NodeRole::Transform,
                description: "does nothing".to_string(),
                inputs: vec![PortSpec::new("in", PortType::Json).optional()],
                outputs: vec![],
                config: ConfigSchema::default(),
            }
        }

        async fn execute(&self, _ctx: StepContext, _inputs: StepInputs) -> Result<StepOutput, StepError> {
            Ok(StepOutput::default())
        }
    }

    #[test]
    fn test_describe_unknown_kind() {
        let registry = NodeRegistry::builder().build();
        assert_eq!(
            registry.describe("nope").unwrap_err(),
            RegistryError::UnknownKind("nope".to_string())
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut builder = NodeRegistry::builder();
        builder.register(Noop).unwrap();
        assert!(matches!(
            builder.register(Noop),
            Err(RegistryError::DuplicateKind(_))
        ));
    }

    #[test]
    fn test_builtins_are_described() {
        let registry = NodeRegistry::with_builtins(&SafetyLimits::default()).build();

        let filter = registry.describe("transform.filter").unwrap();
        assert_eq!(filter.role, NodeRole::Transform);
        assert_eq!(filter.input("in").unwrap().port_type, PortType::Records);

        let count = registry.describe("transform.count").unwrap();
        assert_eq!(count.output("out").unwrap().port_type, PortType::Int);

        assert!(registry.get("sink.collect").is_ok());
    }

    #[test]
    fn test_collaborator_kinds_extend_builtins() {
        let mut builder = NodeRegistry::with_builtins(&SafetyLimits::default());
        let before = builder.kinds.len();
        builder.register(Noop).unwrap();
        let registry = builder.build();

        assert_eq!(registry.len(), before + 1);
        assert!(registry.describe("test.noop").is_ok());
    }

    #[test]
    fn test_installed_registry_is_global() {
        let mut builder = NodeRegistry::builder();
        builder.register(Noop).unwrap();
        let installed = NodeRegistry::install(builder.build()).unwrap();

        let global = NodeRegistry::global();
        assert!(Arc::ptr_eq(&installed, &global));
        assert!(global.describe("test.noop").is_ok());

        // Frozen after the first install
        assert_eq!(
            NodeRegistry::install(NodeRegistry::builder().build()).unwrap_err(),
            RegistryError::AlreadyInitialized
        );
    }
}
