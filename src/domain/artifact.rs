//! References to outputs produced by pipeline steps.
//!
//! Step outputs are written next to the execution log; records only hold
//! an opaque reference so the event log stays small.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to the outputs a step produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Step that produced the artifact
    pub step_id: String,

    /// Location relative to the execution directory
    pub location: String,

    /// SHA-256 of the stored bytes (hex)
    pub sha256: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// When the artifact was written
    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Create a reference for bytes already written at `location`
    pub fn new(step_id: impl Into<String>, location: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            step_id: step_id.into(),
            location: location.into(),
            sha256: crate::core::store::digest(bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        }
    }
}
