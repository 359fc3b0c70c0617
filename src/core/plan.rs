//! Execution plans produced by the validator.
//!
//! A plan is the validated, immutable form of a definition: steps are in
//! topological order, every input is bound to exactly one upstream output
//! (or left unbound when optional), and each step knows its direct
//! dependencies and dependents. Plans serialize deterministically, so the
//! same definition against the same registry always yields the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::retry::RetryPolicy;
use crate::domain::PortSpec;
use crate::registry::NodeRole;

/// A validated, topologically ordered plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Pipeline id of the source definition
    pub pipeline_id: String,

    /// Pipeline display name
    pub pipeline_name: String,

    /// Content hash of the source definition
    pub definition_hash: String,

    /// Steps in topological order (ties broken by id)
    pub steps: Vec<PlannedStep>,
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub id: String,
    pub kind: String,
    pub role: NodeRole,

    /// Position in the topological order
    pub rank: usize,

    pub config: BTreeMap<String, Value>,

    /// Binding for every effective input port
    pub inputs: BTreeMap<String, InputBinding>,

    /// Effective output ports
    pub outputs: Vec<PortSpec>,

    /// Steps that must succeed before this one is dispatched
    pub depends_on: BTreeSet<String>,

    /// Steps that consume this step's outputs
    pub dependents: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Where an input port gets its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "binding")]
pub enum InputBinding {
    /// Output port of an upstream step
    Upstream { step: String, port: String },

    /// Optional port left unconnected
    Unbound,
}

impl ExecutionPlan {
    /// Step ids in execution order
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn step(&self, id: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Canonical JSON encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// SHA-256 of the canonical encoding (hex)
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes());
        hex::encode(hasher.finalize())
    }

    /// Every step reachable downstream of `id`, in plan order
    pub fn downstream_of(&self, id: &str) -> Vec<&str> {
        let mut reached = BTreeSet::new();
        let mut frontier: Vec<&str> = vec![id];

        while let Some(current) = frontier.pop() {
            if let Some(step) = self.step(current) {
                for dependent in &step.dependents {
                    if reached.insert(dependent.as_str()) {
                        frontier.push(dependent.as_str());
                    }
                }
            }
        }

        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|s| reached.contains(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, rank: usize, deps: &[&str], dependents: &[&str]) -> PlannedStep {
        PlannedStep {
            id: id.to_string(),
            kind: "test".to_string(),
            role: NodeRole::Transform,
            rank,
            config: BTreeMap::new(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            dependents: dependents.iter().map(|s| s.to_string()).collect(),
            retry: None,
            timeout_seconds: None,
        }
    }

    fn diamond() -> ExecutionPlan {
        ExecutionPlan {
            pipeline_id: "p".to_string(),
            pipeline_name: "P".to_string(),
            definition_hash: "h".to_string(),
            steps: vec![
                step("a", 0, &[], &["b", "c"]),
                step("b", 1, &["a"], &["d"]),
                step("c", 2, &["a"], &["d"]),
                step("d", 3, &["b", "c"], &[]),
            ],
        }
    }

    #[test]
    fn test_downstream_closure() {
        let plan = diamond();
        assert_eq!(plan.downstream_of("a"), vec!["b", "c", "d"]);
        assert_eq!(plan.downstream_of("b"), vec!["d"]);
        assert!(plan.downstream_of("d").is_empty());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let plan = diamond();
        assert_eq!(plan.fingerprint(), diamond().fingerprint());

        let mut changed = diamond();
        changed.steps[1].timeout_seconds = Some(5);
        assert_ne!(plan.fingerprint(), changed.fingerprint());
    }
}
