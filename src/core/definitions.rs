//! Versioned pipeline definitions backed by SQLite.
//!
//! Every save of a changed definition creates a new immutable version.
//! Saving content identical to the latest version returns that version,
//! so repeated `run` invocations of the same file do not pile up versions.
//! Executions pin the `(id, version)` they started with.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::domain::{DefinitionRef, PipelineDefinition};

/// One stored version, without its body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionVersion {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub content_hash: String,
    pub saved_at: DateTime<Utc>,
}

/// SQLite-backed definition repository
pub struct DefinitionRepository {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for DefinitionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionRepository").finish_non_exhaustive()
    }
}

impl DefinitionRepository {
    /// Open or create the repository at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open definition database: {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        Self::init(conn)
    }

    /// In-memory repository (tests, one-shot validation)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS definitions (
                id           TEXT    NOT NULL,
                version      INTEGER NOT NULL,
                name         TEXT    NOT NULL,
                content_hash TEXT    NOT NULL,
                body         TEXT    NOT NULL,
                saved_at     TEXT    NOT NULL,
                PRIMARY KEY (id, version)
            );",
        )
        .context("Failed to initialize definition schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save a definition, returning the version it is stored under
    pub fn save(&self, definition: &PipelineDefinition) -> Result<DefinitionRef> {
        let hash = definition.content_hash();
        let body = serde_json::to_string(definition).context("Failed to serialize definition")?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let latest: Option<(u32, String)> = tx
            .query_row(
                "SELECT version, content_hash FROM definitions
                 WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                params![definition.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query latest definition version")?;

        let version = match latest {
            Some((version, latest_hash)) if latest_hash == hash => {
                return Ok(DefinitionRef {
                    id: definition.id.clone(),
                    version,
                });
            }
            Some((version, _)) => version + 1,
            None => 1,
        };

        tx.execute(
            "INSERT INTO definitions (id, version, name, content_hash, body, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                definition.id,
                version,
                definition.name,
                hash,
                body,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to insert definition version")?;
        tx.commit().context("Failed to commit definition version")?;

        tracing::info!(pipeline = %definition.id, version, "Saved definition version");
        Ok(DefinitionRef {
            id: definition.id.clone(),
            version,
        })
    }

    /// Load a specific version
    pub fn get(&self, id: &str, version: u32) -> Result<Option<PipelineDefinition>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM definitions WHERE id = ?1 AND version = ?2",
                params![id, version],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query definition")?;

        body.map(|b| PipelineDefinition::from_json(&b)).transpose()
    }

    /// Load the latest version
    pub fn latest(&self, id: &str) -> Result<Option<(DefinitionRef, PipelineDefinition)>> {
        let conn = self.conn.lock();
        let row: Option<(u32, String)> = conn
            .query_row(
                "SELECT version, body FROM definitions
                 WHERE id = ?1 ORDER BY version DESC LIMIT 1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query latest definition")?;

        row.map(|(version, body)| {
            let definition = PipelineDefinition::from_json(&body)?;
            Ok((
                DefinitionRef {
                    id: id.to_string(),
                    version,
                },
                definition,
            ))
        })
        .transpose()
    }

    /// Every stored version, ordered by id then version
    pub fn list(&self) -> Result<Vec<DefinitionVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, version, name, content_hash, saved_at FROM definitions ORDER BY id, version")
            .context("Failed to prepare definition listing")?;

        let rows = stmt
            .query_map([], |row| {
                let saved_at: String = row.get(4)?;
                Ok(DefinitionVersion {
                    id: row.get(0)?,
                    version: row.get(1)?,
                    name: row.get(2)?,
                    content_hash: row.get(3)?,
                    saved_at: DateTime::parse_from_rfc3339(&saved_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                })
            })
            .context("Failed to list definitions")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read definition row")
    }
}
