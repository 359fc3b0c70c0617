//! Durable execution store with file-based persistence.
//!
//! Each execution owns a directory holding an append-only event log
//! (newline-delimited JSON) and the artifacts its steps produced:
//!
//! ```text
//! <root>/executions/<execution_id>/events.jsonl
//! <root>/executions/<execution_id>/artifacts/<step>.json
//! ```
//!
//! `record` is the only way state changes. It brings the replayed state up
//! to date, rejects transitions the state machine does not allow, ignores
//! transitions whose idempotency key is already present, and fsyncs before
//! returning. Replayed state is cached per execution and only the bytes
//! appended since (by this or another process) are read on the next write.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::runner::StepOutput;
use crate::domain::{
    ArtifactRef, Event, EventType, Execution, ExecutionFilter, ExecutionStatus, ExecutionSummary, Health,
    TransitionError,
};

const EVENTS_FILE: &str = "events.jsonl";
const ARTIFACTS_DIR: &str = "artifacts";

/// SHA-256 of `bytes` (hex)
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// What `record` did with a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Appended to the log
    Recorded,

    /// A transition with the same idempotency key was already recorded
    Duplicate,
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Rejected(#[from] TransitionError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt event log {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File-based store for every execution
pub struct ExecutionStore {
    root: PathBuf,

    /// Serializes writers within this process (the file lock covers
    /// others) and holds each log's replayed state
    logs: Mutex<HashMap<Uuid, LogState>>,
}

/// Replayed state of one event log, valid for its first `len` bytes
#[derive(Debug, Default)]
struct LogState {
    len: u64,
    lines: usize,
    events: usize,
    keys: HashSet<String>,
    execution: Option<Execution>,
}

impl LogState {
    fn observe(&mut self, event: &Event) {
        self.events += 1;
        self.keys.insert(event.idempotency_key.clone());
        match &mut self.execution {
            Some(execution) => {
                if let Err(e) = execution.apply(event) {
                    tracing::warn!(execution_id = %execution.id, error = %e, "Ignoring invalid event during replay");
                }
            }
            None if self.events == 1 => self.execution = Execution::from_created(event),
            None => {}
        }
    }
}

impl ExecutionStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let executions = root.join("executions");
        tokio::fs::create_dir_all(&executions)
            .await
            .with_context(|| format!("Failed to create store directory: {}", executions.display()))?;

        Ok(Self {
            root,
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one execution
    pub fn execution_dir(&self, id: Uuid) -> PathBuf {
        self.root.join("executions").join(id.to_string())
    }

    fn events_path(&self, id: Uuid) -> PathBuf {
        self.execution_dir(id).join(EVENTS_FILE)
    }

    /// Validate and durably append one transition
    pub async fn record(&self, event: &Event) -> Result<RecordOutcome, StoreError> {
        let event = event.clone();
        let outcome = self.append(event.execution_id, move |_| Some(event)).await?;
        Ok(outcome.unwrap_or(RecordOutcome::Duplicate))
    }

    /// Take over an execution that no scheduler is driving.
    ///
    /// Under the log lock, checks that the execution is unfinished and
    /// Stalled at `now`, then records a liveness marker (the start
    /// transition for a Pending execution) so that no other process can
    /// claim it as well. Returns false if the execution is finished, still
    /// driven by someone, or does not exist.
    pub async fn claim(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        heartbeat_timeout: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let outcome = self
            .append(id, move |execution| {
                let execution = execution?;
                if execution.is_finished() || execution.health(now, heartbeat_timeout) != Health::Stalled {
                    return None;
                }
                Some(match execution.status {
                    ExecutionStatus::Pending => {
                        Event::execution(id, EventType::ExecutionStarted, "Claimed for recovery".to_string())
                    }
                    _ => Event::heartbeat(id),
                })
            })
            .await?;
        Ok(outcome == Some(RecordOutcome::Recorded))
    }

    /// Append the event `decide` picks given the current state, if any
    async fn append<F>(&self, id: Uuid, decide: F) -> Result<Option<RecordOutcome>, StoreError>
    where
        F: FnOnce(Option<&Execution>) -> Option<Event> + Send + 'static,
    {
        let mut logs = self.logs.lock().await;

        let path = self.events_path(id);
        let cached = logs.remove(&id);
        let (outcome, state) = tokio::task::spawn_blocking(move || append_checked(&path, cached, decide))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;

        logs.insert(id, state);
        Ok(outcome)
    }

    /// Every recorded transition of an execution, in order
    pub async fn events(&self, id: Uuid) -> Result<Vec<Event>, StoreError> {
        let path = self.events_path(id);
        tokio::task::spawn_blocking(move || read_locked(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Current state of an execution, if it exists
    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let events = self.events(id).await?;
        Ok(Execution::from_events(&events))
    }

    /// Ids of every execution in the store
    pub async fn ids(&self) -> Result<Vec<Uuid>> {
        let dir = self.root.join("executions");
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read store directory: {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Summaries of executions matching `filter`, most recent first
    pub async fn list(
        &self,
        filter: &ExecutionFilter,
        now: DateTime<Utc>,
        heartbeat_timeout: chrono::Duration,
    ) -> Result<Vec<ExecutionSummary>> {
        let mut summaries = Vec::new();

        for id in self.ids().await? {
            let execution = match self.get(id).await {
                Ok(Some(execution)) => execution,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(execution_id = %id, error = %e, "Skipping unreadable execution");
                    continue;
                }
            };

            let summary = execution.summary(now, heartbeat_timeout);
            if filter.matches(&summary) {
                summaries.push(summary);
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }

        Ok(summaries)
    }

    /// Persist a step's outputs and return the reference to record
    pub async fn put_artifact(&self, execution_id: Uuid, step_id: &str, output: &StepOutput) -> Result<ArtifactRef> {
        let dir = self.execution_dir(execution_id).join(ARTIFACTS_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifacts directory: {}", dir.display()))?;

        let file_name = artifact_file_name(step_id);
        let bytes = serde_json::to_vec_pretty(output).context("Failed to serialize step output")?;

        // Write-then-rename so a crash never leaves a torn artifact
        let final_path = dir.join(&file_name);
        let tmp_path = dir.join(format!("{}.tmp", file_name));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .with_context(|| format!("Failed to write artifact: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move artifact into place: {}", final_path.display()))?;

        Ok(ArtifactRef::new(
            step_id,
            format!("{}/{}", ARTIFACTS_DIR, file_name),
            &bytes,
        ))
    }

    /// Load and verify a step's persisted outputs
    pub async fn load_artifact(&self, execution_id: Uuid, artifact: &ArtifactRef) -> Result<StepOutput> {
        let path = self.execution_dir(execution_id).join(&artifact.location);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", path.display()))?;

        if digest(&bytes) != artifact.sha256 {
            anyhow::bail!("Artifact checksum mismatch: {}", path.display());
        }

        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse artifact: {}", path.display()))
    }
}

/// Step ids become file names; keep them to a safe alphabet
fn artifact_file_name(step_id: &str) -> String {
    let safe: String = step_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    format!("{}-{}.json", safe, &digest(step_id.as_bytes())[..8])
}

fn parse_events(path: &Path, file: &File) -> Result<Vec<Event>, StoreError> {
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(StoreError::io(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        events.push(event);
    }
    Ok(events)
}

fn read_locked(path: &Path) -> Result<Vec<Event>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path)(e)),
    };

    file.lock_shared().map_err(StoreError::io(path))?;
    let events = parse_events(path, &file);
    let _ = FileExt::unlock(&file);
    events
}

fn append_checked<F>(
    path: &Path,
    cached: Option<LogState>,
    decide: F,
) -> Result<(Option<RecordOutcome>, LogState), StoreError>
where
    F: FnOnce(Option<&Execution>) -> Option<Event>,
{
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(StoreError::io(dir))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(StoreError::io(path))?;

    file.lock_exclusive().map_err(StoreError::io(path))?;
    let result = catch_up(path, &file, cached).and_then(|mut state| {
        let outcome = match decide(state.execution.as_ref()) {
            Some(event) => Some(validate_and_append(path, &file, &mut state, &event)?),
            None => None,
        };
        Ok((outcome, state))
    });
    let _ = FileExt::unlock(&file);
    result
}

/// Replay whatever was appended since `cached` was taken
fn catch_up(path: &Path, file: &File, cached: Option<LogState>) -> Result<LogState, StoreError> {
    let len = file.metadata().map_err(StoreError::io(path))?.len();
    let mut state = match cached {
        Some(state) if state.len <= len => state,
        _ => LogState::default(),
    };
    if state.len == len {
        return Ok(state);
    }

    let mut reader = file;
    reader.seek(SeekFrom::Start(state.len)).map_err(StoreError::io(path))?;
    for line in BufReader::new(reader).lines() {
        state.lines += 1;
        let line = line.map_err(StoreError::io(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            line: state.lines,
            source,
        })?;
        state.observe(&event);
    }
    state.len = len;
    Ok(state)
}

fn validate_and_append(path: &Path, file: &File, state: &mut LogState, event: &Event) -> Result<RecordOutcome, StoreError> {
    if state.keys.contains(&event.idempotency_key) {
        tracing::debug!(key = %event.idempotency_key, "Transition already recorded");
        return Ok(RecordOutcome::Duplicate);
    }

    match &state.execution {
        Some(execution) => execution.check(event)?,
        None if state.events == 0 => {
            if event.event_type != EventType::ExecutionCreated || Execution::from_created(event).is_none() {
                return Err(TransitionError::MissingHeader.into());
            }
        }
        None => return Err(TransitionError::MissingHeader.into()),
    }

    let mut line = serde_json::to_string(event)?;
    line.push('\n');

    let mut writer = file;
    writer.write_all(line.as_bytes()).map_err(StoreError::io(path))?;
    writer.flush().map_err(StoreError::io(path))?;
    file.sync_data().map_err(StoreError::io(path))?;

    state.len += line.len() as u64;
    state.lines += 1;
    state.observe(event);
    Ok(RecordOutcome::Recorded)
}
