//! Safety limits applied while validating and executing pipelines.
//!
//! Guards against runaway definitions and accidental data exposure:
//! - Number of nodes per definition
//! - Size of step outputs and source payloads
//! - Denylist patterns for file sources and sinks (to avoid touching secrets)

use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of nodes per definition (default: 200)
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Maximum serialized size of one step's outputs (default: 10MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Maximum size of a file or HTTP source payload (default: 10MB)
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,

    /// Glob patterns for paths that sources and sinks must not touch
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_nodes() -> usize {
    200
}
fn default_max_output_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_max_source_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            max_output_bytes: default_max_output_bytes(),
            max_source_bytes: default_max_source_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Reject paths on the denylist
    pub fn check_path(&self, path: &Path) -> Result<(), SafetyViolation> {
        let path_str = path.to_string_lossy();
        if self.is_denylisted(&path_str) {
            return Err(SafetyViolation::DenylistMatch {
                path: path_str.to_string(),
            });
        }
        Ok(())
    }

    /// Check a definition's node count
    pub fn check_node_count(&self, count: usize) -> Result<(), SafetyViolation> {
        if count > self.max_nodes {
            return Err(SafetyViolation::MaxNodes {
                actual: count,
                limit: self.max_nodes,
            });
        }
        Ok(())
    }

    /// Check the serialized size of a step's outputs
    pub fn check_output_size(&self, bytes: u64) -> Result<(), SafetyViolation> {
        if bytes > self.max_output_bytes {
            return Err(SafetyViolation::MaxOutputBytes {
                actual: bytes,
                limit: self.max_output_bytes,
            });
        }
        Ok(())
    }

    /// Check the size of a source payload
    pub fn check_source_size(&self, bytes: u64) -> Result<(), SafetyViolation> {
        if bytes > self.max_source_bytes {
            return Err(SafetyViolation::MaxSourceBytes {
                actual: bytes,
                limit: self.max_source_bytes,
            });
        }
        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Maximum nodes exceeded: {actual} > {limit}")]
    MaxNodes { actual: usize, limit: usize },

    #[error("Maximum output bytes exceeded: {actual} > {limit}")]
    MaxOutputBytes { actual: u64, limit: u64 },

    #[error("Maximum source bytes exceeded: {actual} > {limit}")]
    MaxSourceBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_nodes, 200);
        assert_eq!(limits.max_output_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_denylist_matching() {
        let limits = SafetyLimits::default();

        assert!(limits.is_denylisted(".env"));
        assert!(limits.is_denylisted(".env.local"));
        assert!(limits.is_denylisted("config/secrets.json"));
        assert!(limits.is_denylisted("keys/server.key"));

        assert!(!limits.is_denylisted("data/orders.jsonl"));
        assert!(limits.check_path(Path::new("out/report.json")).is_ok());
        assert!(matches!(
            limits.check_path(Path::new("certs/server.pem")),
            Err(SafetyViolation::DenylistMatch { .. })
        ));
    }

    #[test]
    fn test_size_limits() {
        let limits = SafetyLimits {
            max_nodes: 3,
            max_output_bytes: 100,
            ..Default::default()
        };

        assert!(limits.check_node_count(3).is_ok());
        assert_eq!(
            limits.check_node_count(4),
            Err(SafetyViolation::MaxNodes { actual: 4, limit: 3 })
        );
        assert!(limits.check_output_size(100).is_ok());
        assert!(limits.check_output_size(101).is_err());
    }
}
