//! Graph validation: definitions in, execution plans out.
//!
//! Validation is pure and deterministic. It checks, collecting every
//! problem instead of stopping at the first:
//! - node ids are unique and every kind is registered
//! - each node's config satisfies its kind's schema, and declared ports
//!   only narrow the kind's ports
//! - edges reference existing nodes and ports
//! - the graph is acyclic
//! - every required input is bound exactly once
//! - producer and consumer port types are compatible
//!
//! Only a definition with no problems yields an [`ExecutionPlan`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::plan::{ExecutionPlan, InputBinding, PlannedStep};
use crate::core::safety::SafetyLimits;
use crate::domain::{Edge, NodeSpec, PipelineDefinition, PortRef, PortSpec, PortType};
use crate::registry::{NodeRegistry, NodeRole};

/// Port direction, for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// A structural or semantic problem in a definition
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Pipeline has no nodes")]
    EmptyPipeline,

    #[error("Pipeline has {count} nodes, more than the limit of {limit}")]
    TooManyNodes { count: usize, limit: usize },

    #[error("Duplicate node id '{node}'")]
    DuplicateNode { node: String },

    #[error("Node '{node}' uses unknown kind '{kind}'")]
    UnknownKind { node: String, kind: String },

    #[error("Node '{node}' has invalid config: {reason}")]
    InvalidConfig { node: String, reason: String },

    #[error("Edge {edge} references unknown node '{node}'")]
    UnknownNode { edge: String, node: String },

    #[error("Node '{node}' has no {direction} port '{port}'")]
    UnknownPort {
        node: String,
        port: String,
        direction: PortDirection,
    },

    #[error("Cycle detected: {}", nodes.join(" -> "))]
    CyclicGraph { nodes: Vec<String> },

    #[error("Required input '{node}.{port}' is not connected")]
    UnboundInput { node: String, port: String },

    #[error("Input '{node}.{port}' is connected more than once ({})", sources.join(", "))]
    MultiplyBoundInput {
        node: String,
        port: String,
        sources: Vec<String>,
    },

    #[error("Type mismatch: {from} produces {from_type} but {to} expects {to_type}")]
    TypeMismatch {
        from: PortRef,
        from_type: PortType,
        to: PortRef,
        to_type: PortType,
    },
}

impl ValidationError {
    /// Node ids the error refers to
    pub fn nodes(&self) -> Vec<&str> {
        match self {
            ValidationError::EmptyPipeline | ValidationError::TooManyNodes { .. } => vec![],
            ValidationError::DuplicateNode { node }
            | ValidationError::UnknownKind { node, .. }
            | ValidationError::InvalidConfig { node, .. }
            | ValidationError::UnknownNode { node, .. }
            | ValidationError::UnknownPort { node, .. }
            | ValidationError::UnboundInput { node, .. }
            | ValidationError::MultiplyBoundInput { node, .. } => vec![node.as_str()],
            ValidationError::CyclicGraph { nodes } => nodes.iter().map(String::as_str).collect(),
            ValidationError::TypeMismatch { from, to, .. } => vec![from.node.as_str(), to.node.as_str()],
        }
    }
}

/// A node whose kind resolved, with its effective ports
struct ResolvedNode<'d> {
    spec: &'d NodeSpec,
    role: NodeRole,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
}

impl ResolvedNode<'_> {
    fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == name)
    }

    fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

/// Validate a definition against a registry with default limits
pub fn validate(
    definition: &PipelineDefinition,
    registry: &NodeRegistry,
) -> Result<ExecutionPlan, Vec<ValidationError>> {
    Validator::new(registry).validate(definition)
}

/// Validates definitions against a registry
pub struct Validator<'r> {
    registry: &'r NodeRegistry,
    limits: Option<&'r SafetyLimits>,
}

impl<'r> Validator<'r> {
    pub fn new(registry: &'r NodeRegistry) -> Self {
        Self {
            registry,
            limits: None,
        }
    }

    /// Also enforce the node-count limit
    pub fn with_limits(mut self, limits: &'r SafetyLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Validate `definition`, returning every problem found
    pub fn validate(&self, definition: &PipelineDefinition) -> Result<ExecutionPlan, Vec<ValidationError>> {
        let mut errors = Vec::new();

        if definition.nodes.is_empty() {
            return Err(vec![ValidationError::EmptyPipeline]);
        }
        if let Some(limits) = self.limits {
            if limits.check_node_count(definition.nodes.len()).is_err() {
                errors.push(ValidationError::TooManyNodes {
                    count: definition.nodes.len(),
                    limit: limits.max_nodes,
                });
            }
        }

        // Node ids (first occurrence wins) and kinds
        let mut known: BTreeSet<&str> = BTreeSet::new();
        let mut resolved: BTreeMap<&str, ResolvedNode<'_>> = BTreeMap::new();
        for node in &definition.nodes {
            if !known.insert(node.id.as_str()) {
                errors.push(ValidationError::DuplicateNode { node: node.id.clone() });
                continue;
            }
            if let Some(r) = self.resolve_node(node, &mut errors) {
                resolved.insert(node.id.as_str(), r);
            }
        }

        // Edges: node and port references
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> =
            known.iter().map(|id| (*id, BTreeSet::new())).collect();
        let mut wired: Vec<&Edge> = Vec::new();
        for edge in &definition.edges {
            let label = format!("{} -> {}", edge.from, edge.to);
            let mut nodes_exist = true;
            for end in [&edge.from, &edge.to] {
                if !known.contains(end.node.as_str()) {
                    nodes_exist = false;
                    errors.push(ValidationError::UnknownNode {
                        edge: label.clone(),
                        node: end.node.clone(),
                    });
                }
            }
            if !nodes_exist {
                continue;
            }

            adjacency
                .entry(edge.from.node.as_str())
                .or_default()
                .insert(edge.to.node.as_str());

            let (Some(producer), Some(consumer)) = (
                resolved.get(edge.from.node.as_str()),
                resolved.get(edge.to.node.as_str()),
            ) else {
                continue;
            };

            let mut ports_exist = true;
            if producer.output(&edge.from.port).is_none() {
                ports_exist = false;
                errors.push(ValidationError::UnknownPort {
                    node: edge.from.node.clone(),
                    port: edge.from.port.clone(),
                    direction: PortDirection::Output,
                });
            }
            if consumer.input(&edge.to.port).is_none() {
                ports_exist = false;
                errors.push(ValidationError::UnknownPort {
                    node: edge.to.node.clone(),
                    port: edge.to.port.clone(),
                    direction: PortDirection::Input,
                });
            }
            if ports_exist {
                wired.push(edge);
            }
        }

        // Acyclicity
        for cycle in find_cycles(&adjacency) {
            errors.push(ValidationError::CyclicGraph { nodes: cycle });
        }

        // Input bindings
        let mut bindings: HashMap<(&str, &str), Vec<&Edge>> = HashMap::new();
        for edge in &wired {
            bindings
                .entry((edge.to.node.as_str(), edge.to.port.as_str()))
                .or_default()
                .push(edge);
        }
        for (id, node) in &resolved {
            for port in &node.inputs {
                let bound = bindings
                    .get(&(*id, port.name.as_str()))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                match bound.len() {
                    0 if !port.optional => errors.push(ValidationError::UnboundInput {
                        node: id.to_string(),
                        port: port.name.clone(),
                    }),
                    0 | 1 => {}
                    _ => errors.push(ValidationError::MultiplyBoundInput {
                        node: id.to_string(),
                        port: port.name.clone(),
                        sources: bound.iter().map(|e| e.from.to_string()).collect(),
                    }),
                }
            }
        }

        // Type compatibility
        for edge in &wired {
            let (Some(produced), Some(expected)) = (
                resolved[edge.from.node.as_str()].output(&edge.from.port),
                resolved[edge.to.node.as_str()].input(&edge.to.port),
            ) else {
                continue;
            };
            if !expected.port_type.accepts(produced.port_type) {
                errors.push(ValidationError::TypeMismatch {
                    from: edge.from.clone(),
                    from_type: produced.port_type,
                    to: edge.to.clone(),
                    to_type: expected.port_type,
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(build_plan(definition, &resolved, &adjacency, &wired))
    }

    fn resolve_node<'d>(&self, node: &'d NodeSpec, errors: &mut Vec<ValidationError>) -> Option<ResolvedNode<'d>> {
        let descriptor = match self.registry.describe(&node.kind) {
            Ok(d) => d,
            Err(_) => {
                errors.push(ValidationError::UnknownKind {
                    node: node.id.clone(),
                    kind: node.kind.clone(),
                });
                return None;
            }
        };

        let retry_problems = node.retry.iter().flat_map(|r| r.problems());
        for reason in descriptor.config.check(&node.config).into_iter().chain(retry_problems) {
            errors.push(ValidationError::InvalidConfig {
                node: node.id.clone(),
                reason,
            });
        }

        let inputs = effective_ports(node, &descriptor.kind, PortDirection::Input, &descriptor.inputs, &node.inputs, errors);
        let outputs = effective_ports(node, &descriptor.kind, PortDirection::Output, &descriptor.outputs, &node.outputs, errors);

        Some(ResolvedNode {
            spec: node,
            role: descriptor.role,
            inputs,
            outputs,
        })
    }
}

/// Apply a node's port declarations on top of its kind's ports.
///
/// Declarations may narrow a `json` port to a concrete type, or make an
/// optional input required; anything else is a config error.
fn effective_ports(
    node: &NodeSpec,
    kind: &str,
    direction: PortDirection,
    base: &[PortSpec],
    declared: &[PortSpec],
    errors: &mut Vec<ValidationError>,
) -> Vec<PortSpec> {
    let mut ports = base.to_vec();

    for decl in declared {
        match ports.iter_mut().find(|p| p.name == decl.name) {
            Some(port) if decl.port_type.narrows(port.port_type) => {
                port.port_type = decl.port_type;
                port.optional = port.optional && decl.optional;
            }
            Some(port) => errors.push(ValidationError::InvalidConfig {
                node: node.id.clone(),
                reason: format!(
                    "declared {} port '{}' as {}, but kind '{}' has it as {}",
                    direction, decl.name, decl.port_type, kind, port.port_type
                ),
            }),
            None => errors.push(ValidationError::InvalidConfig {
                node: node.id.clone(),
                reason: format!("kind '{}' has no {} port '{}'", kind, direction, decl.name),
            }),
        }
    }

    ports
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Every distinct cycle reachable by depth-first search from the nodes in
/// id order
fn find_cycles(adjacency: &BTreeMap<&str, BTreeSet<&str>>) -> Vec<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        adjacency: &BTreeMap<&'a str, BTreeSet<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
        seen: &mut BTreeSet<Vec<String>>,
    ) {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        for next in adjacency.get(node).into_iter().flatten() {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| n == next).unwrap_or(0);
                    let cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();

                    let mut key = cycle.clone();
                    key.sort();
                    if seen.insert(key) {
                        let mut closed = cycle;
                        closed.push(next.to_string());
                        cycles.push(closed);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(*next, adjacency, marks, stack, cycles, seen),
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    let mut cycles = Vec::new();
    let mut seen = BTreeSet::new();

    for node in adjacency.keys() {
        if !marks.contains_key(node) {
            visit(*node, adjacency, &mut marks, &mut stack, &mut cycles, &mut seen);
        }
    }

    cycles
}

/// Topologically order a valid graph (Kahn's algorithm, smallest id first)
fn build_plan(
    definition: &PipelineDefinition,
    resolved: &BTreeMap<&str, ResolvedNode<'_>>,
    adjacency: &BTreeMap<&str, BTreeSet<&str>>,
    wired: &[&Edge],
) -> ExecutionPlan {
    let mut upstream: BTreeMap<&str, BTreeSet<&str>> =
        adjacency.keys().map(|id| (*id, BTreeSet::new())).collect();
    for (from, targets) in adjacency {
        for to in targets {
            upstream.entry(*to).or_default().insert(*from);
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = upstream.iter().map(|(id, deps)| (*id, deps.len())).collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(resolved.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for next in adjacency.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*next);
                }
            }
        }
    }

    let steps = order
        .iter()
        .enumerate()
        .filter_map(|(rank, id)| {
            let node = resolved.get(id)?;
            let inputs = node
                .inputs
                .iter()
                .map(|port| {
                    let binding = wired
                        .iter()
                        .find(|e| e.to.node == *id && e.to.port == port.name)
                        .map(|e| InputBinding::Upstream {
                            step: e.from.node.clone(),
                            port: e.from.port.clone(),
                        })
                        .unwrap_or(InputBinding::Unbound);
                    (port.name.clone(), binding)
                })
                .collect();

            Some(PlannedStep {
                id: id.to_string(),
                kind: node.spec.kind.clone(),
                role: node.role,
                rank,
                config: node.spec.config.clone(),
                inputs,
                outputs: node.outputs.clone(),
                depends_on: upstream
                    .get(id)
                    .map(|deps| deps.iter().map(|d| d.to_string()).collect())
                    .unwrap_or_default(),
                dependents: adjacency
                    .get(id)
                    .map(|deps| deps.iter().map(|d| d.to_string()).collect())
                    .unwrap_or_default(),
                retry: node.spec.retry.clone(),
                timeout_seconds: node.spec.timeout_seconds,
            })
        })
        .collect();

    ExecutionPlan {
        pipeline_id: definition.id.clone(),
        pipeline_name: definition.name.clone(),
        definition_hash: definition.content_hash(),
        steps,
    }
}
