//! Data sources that source nodes read from.
//!
//! Sources are named in the `sources:` section of the config file and
//! referenced from a node's `source_id` config key. A source resolves to
//! a [`SourceHandle`] which reads the source's records on demand:
//! - `inline`: records embedded in the config
//! - `file`: a local JSON array or JSON Lines file
//! - `http`: a JSON document fetched with a GET request

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::runner::{Heartbeat, StepError};
use crate::core::safety::SafetyLimits;

/// Source errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unknown data source: {0}")]
    NotFound(String),

    #[error("Data source '{id}' rejected: {reason}")]
    Denied { id: String, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP source returned status {status}")]
    Status { status: u16 },

    #[error("Data source '{id}' is malformed: {reason}")]
    Parse { id: String, reason: String },
}

impl SourceError {
    /// Whether re-reading later might succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Io { .. } | SourceError::Http(_) => true,
            SourceError::Status { status } => *status == 429 || *status >= 500,
            SourceError::NotFound(_) | SourceError::Denied { .. } | SourceError::Parse { .. } => false,
        }
    }
}

impl From<SourceError> for StepError {
    fn from(err: SourceError) -> Self {
        if err.is_transient() {
            StepError::Retryable(err.to_string())
        } else {
            StepError::Fatal(err.to_string())
        }
    }
}

/// File encodings understood by file sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Json,
    Jsonl,
}

/// How to reach a data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Inline {
        records: Vec<Value>,
    },
    File {
        path: PathBuf,
        /// Defaults by extension (`.jsonl` / `.ndjson` are JSON Lines)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<FileFormat>,
    },
    Http {
        url: String,
        /// JSON pointer to the records array inside the response
        #[serde(default, skip_serializing_if = "Option::is_none")]
        records_pointer: Option<String>,
        #[serde(default = "default_http_timeout")]
        timeout_seconds: u64,
    },
}

fn default_http_timeout() -> u64 {
    30
}

/// A resolved source, ready to be read
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub id: String,
    descriptor: SourceDescriptor,
    client: reqwest::Client,
    limits: SafetyLimits,
}

impl SourceHandle {
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Read every record of the source
    pub async fn read(&self, heartbeat: &Heartbeat) -> Result<Vec<Value>, SourceError> {
        let records = match &self.descriptor {
            SourceDescriptor::Inline { records } => records.clone(),
            SourceDescriptor::File { path, format } => {
                let io = |source| SourceError::Io {
                    path: path.clone(),
                    source,
                };
                let len = tokio::fs::metadata(path).await.map_err(io)?.len();
                self.check_size(len)?;

                let content = tokio::fs::read_to_string(path).await.map_err(io)?;
                // Grown since the metadata check
                self.check_size(content.len() as u64)?;
                heartbeat.beat();
                self.parse_file(path, *format, &content)?
            }
            SourceDescriptor::Http {
                url,
                records_pointer,
                timeout_seconds,
            } => {
                let mut response = self
                    .client
                    .get(url)
                    .timeout(Duration::from_secs(*timeout_seconds))
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Status {
                        status: status.as_u16(),
                    });
                }

                if let Some(len) = response.content_length() {
                    self.check_size(len)?;
                }
                let mut bytes = Vec::new();
                while let Some(chunk) = response.chunk().await? {
                    bytes.extend_from_slice(&chunk);
                    self.check_size(bytes.len() as u64)?;
                    heartbeat.beat();
                }

                let body: Value = serde_json::from_slice(&bytes).map_err(|e| self.parse_error(e))?;
                let target = match records_pointer {
                    Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| SourceError::Parse {
                        id: self.id.clone(),
                        reason: format!("response has nothing at '{}'", pointer),
                    })?,
                    None => body,
                };
                self.into_records(target)?
            }
        };

        if let Some(index) = records.iter().position(|r| !r.is_object()) {
            return Err(SourceError::Parse {
                id: self.id.clone(),
                reason: format!("record {} is not an object", index),
            });
        }

        Ok(records)
    }

    fn parse_file(&self, path: &Path, format: Option<FileFormat>, content: &str) -> Result<Vec<Value>, SourceError> {
        let format = format.unwrap_or_else(|| match path.extension().and_then(|e| e.to_str()) {
            Some("jsonl") | Some("ndjson") => FileFormat::Jsonl,
            _ => FileFormat::Json,
        });

        match format {
            FileFormat::Json => {
                let value: Value = serde_json::from_str(content).map_err(|e| self.parse_error(e))?;
                self.into_records(value)
            }
            FileFormat::Jsonl => content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str(line).map_err(|e| self.parse_error(e)))
                .collect(),
        }
    }

    fn into_records(&self, value: Value) -> Result<Vec<Value>, SourceError> {
        match value {
            Value::Array(rows) => Ok(rows),
            other => Err(SourceError::Parse {
                id: self.id.clone(),
                reason: format!("expected an array of records, got {}", shape(&other)),
            }),
        }
    }

    fn check_size(&self, len: u64) -> Result<(), SourceError> {
        self.limits
            .check_source_size(len)
            .map_err(|e| SourceError::Denied {
                id: self.id.clone(),
                reason: e.to_string(),
            })
    }

    fn parse_error(&self, err: serde_json::Error) -> SourceError {
        SourceError::Parse {
            id: self.id.clone(),
            reason: err.to_string(),
        }
    }
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Resolves `source_id` references
pub trait SourceCatalog: Send + Sync {
    fn resolve(&self, source_id: &str) -> Result<SourceHandle, SourceError>;

    /// Known source ids, sorted
    fn ids(&self) -> Vec<String>;
}

/// Catalog backed by the `sources:` config section
#[derive(Debug, Clone, Default)]
pub struct ConfiguredSources {
    sources: BTreeMap<String, SourceDescriptor>,
    limits: SafetyLimits,
    client: reqwest::Client,
}

impl ConfiguredSources {
    pub fn new(sources: BTreeMap<String, SourceDescriptor>, limits: SafetyLimits) -> Self {
        Self {
            sources,
            limits,
            client: reqwest::Client::new(),
        }
    }

    /// Add or replace a source
    pub fn insert(&mut self, id: impl Into<String>, descriptor: SourceDescriptor) {
        self.sources.insert(id.into(), descriptor);
    }
}

impl SourceCatalog for ConfiguredSources {
    fn resolve(&self, source_id: &str) -> Result<SourceHandle, SourceError> {
        let descriptor = self
            .sources
            .get(source_id)
            .ok_or_else(|| SourceError::NotFound(source_id.to_string()))?;

        if let SourceDescriptor::File { path, .. } = descriptor {
            self.limits.check_path(path).map_err(|e| SourceError::Denied {
                id: source_id.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(SourceHandle {
            id: source_id.to_string(),
            descriptor: descriptor.clone(),
            client: self.client.clone(),
            limits: self.limits.clone(),
        })
    }

    fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}
