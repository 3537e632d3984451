use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{EntityStore, TaskLedger};
use crate::model::{
    Edge, EdgeKind, GenerationTask, MediaMetadata, Snippet, SnippetGenerationUpdate, TaskStatus,
    TaskTransition, VersionSnapshot,
};

const DB_FILE_NAME: &str = "canvas.db";

const TASK_COLUMNS: &str = "id, external_task_id, user_id, source_snippet_id, project_id,
    output_snippet_id, provider, model, prompt, request_params_json, status, result,
    media_key, media_metadata_json, error_message, created_at, updated_at";

const SNIPPET_COLUMNS: &str = "id, project_id, user_id, text, position_x, position_y,
    video_generation_status, video_generation_task_id, video_generation_error, media_key,
    media_metadata_json, created_from, version, created_at, updated_at";

/// SQLite-backed ledger and canvas store sharing one database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for canvas db: {}",
                data_dir.display()
            )
        })?;

        let store = Self {
            db_path: data_dir.join(DB_FILE_NAME),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS generation_tasks (
                    id TEXT PRIMARY KEY,
                    external_task_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    source_snippet_id TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    output_snippet_id TEXT,
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    request_params_json TEXT NOT NULL,
                    status TEXT NOT NULL,
                    result TEXT,
                    media_key TEXT,
                    media_metadata_json TEXT,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS idx_generation_tasks_external_task_id
                    ON generation_tasks(external_task_id);
                 CREATE TABLE IF NOT EXISTS snippets (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    text TEXT NOT NULL,
                    position_x REAL NOT NULL,
                    position_y REAL NOT NULL,
                    video_generation_status TEXT,
                    video_generation_task_id TEXT,
                    video_generation_error TEXT,
                    media_key TEXT,
                    media_metadata_json TEXT,
                    created_from TEXT,
                    version INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_snippets_created_from ON snippets(created_from);
                 CREATE TABLE IF NOT EXISTS snippet_versions (
                    snippet_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    snapshot_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (snippet_id, version)
                 );
                 CREATE TABLE IF NOT EXISTS connections (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    source_snippet_id TEXT NOT NULL,
                    target_snippet_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    metadata_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_connections_source
                    ON connections(source_snippet_id);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize canvas schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open canvas db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set canvas db busy timeout")?;
        op(&conn)
    }

    fn query_task(&self, column: &str, value: &str) -> Result<Option<GenerationTask>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM generation_tasks WHERE {column} = ?1");
            conn.query_row(&sql, params![value], task_from_row)
                .optional()
                .with_context(|| format!("failed to load generation task by {column}={value}"))
        })
    }
}

impl TaskLedger for SqliteStore {
    fn find_by_external_id(&self, external_task_id: &str) -> Result<Option<GenerationTask>> {
        self.query_task("external_task_id", external_task_id)
    }

    fn get_task(&self, id: &str) -> Result<Option<GenerationTask>> {
        self.query_task("id", id)
    }

    fn insert_task(&self, task: &GenerationTask) -> Result<()> {
        let request_params_json = serde_json::to_string(&task.request_params)
            .context("failed to serialize task request params")?;
        let media_metadata_json = encode_optional_json(task.media_metadata.as_ref())
            .context("failed to serialize task media metadata")?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO generation_tasks (
                    id, external_task_id, user_id, source_snippet_id, project_id,
                    output_snippet_id, provider, model, prompt, request_params_json, status,
                    result, media_key, media_metadata_json, error_message, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    task.id,
                    task.external_task_id,
                    task.user_id,
                    task.source_snippet_id,
                    task.project_id,
                    task.output_snippet_id,
                    task.provider,
                    task.model,
                    task.prompt,
                    request_params_json,
                    task.status.as_str(),
                    task.result,
                    task.media_key,
                    media_metadata_json,
                    task.error_message,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert generation task {}", task.id))?;
            Ok(())
        })
    }

    fn apply_transition(&self, id: &str, transition: &TaskTransition) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        let status = transition.status().as_str();

        let affected = self.with_connection(|conn| {
            let affected = match transition {
                TaskTransition::Processing => conn.execute(
                    "UPDATE generation_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status, updated_at, id],
                ),
                TaskTransition::Complete {
                    media,
                    output_snippet_id,
                } => {
                    let metadata_json = serde_json::to_string(&media.metadata)
                        .context("failed to serialize task media metadata")?;
                    conn.execute(
                        "UPDATE generation_tasks SET
                            status = ?1,
                            result = ?2,
                            media_key = ?2,
                            media_metadata_json = ?3,
                            output_snippet_id = COALESCE(?4, output_snippet_id),
                            error_message = NULL,
                            updated_at = ?5
                         WHERE id = ?6",
                        params![
                            status,
                            media.key,
                            metadata_json,
                            output_snippet_id,
                            updated_at,
                            id
                        ],
                    )
                }
                TaskTransition::Failed { error } => conn.execute(
                    "UPDATE generation_tasks SET status = ?1, error_message = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![status, error, updated_at, id],
                ),
            };
            affected.with_context(|| format!("failed to mark generation task {id} {status}"))
        })?;

        if affected == 0 {
            bail!("generation task {id} not found while marking it {status}");
        }
        Ok(())
    }
}

impl EntityStore for SqliteStore {
    fn get_snippet(&self, id: &str) -> Result<Option<Snippet>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {SNIPPET_COLUMNS} FROM snippets WHERE id = ?1");
            conn.query_row(&sql, params![id], snippet_from_row)
                .optional()
                .with_context(|| format!("failed to load snippet {id}"))
        })
    }

    fn insert_snippet(&self, snippet: &Snippet) -> Result<()> {
        let media_metadata_json = encode_optional_json(snippet.media_metadata.as_ref())
            .context("failed to serialize snippet media metadata")?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO snippets (
                    id, project_id, user_id, text, position_x, position_y,
                    video_generation_status, video_generation_task_id, video_generation_error,
                    media_key, media_metadata_json, created_from, version, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    snippet.id,
                    snippet.project_id,
                    snippet.user_id,
                    snippet.text,
                    snippet.position_x,
                    snippet.position_y,
                    snippet.video_generation_status.map(TaskStatus::as_str),
                    snippet.video_generation_task_id,
                    snippet.video_generation_error,
                    snippet.media_key,
                    media_metadata_json,
                    snippet.created_from,
                    snippet.version,
                    snippet.created_at.to_rfc3339(),
                    snippet.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert snippet {}", snippet.id))?;
            Ok(())
        })
    }

    fn update_snippet_generation(&self, id: &str, update: &SnippetGenerationUpdate) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        let media_key = update.media.as_ref().map(|media| media.key.clone());
        let media_metadata_json =
            encode_optional_json(update.media.as_ref().map(|media| &media.metadata))
                .context("failed to serialize snippet media metadata")?;

        let affected = self.with_connection(|conn| {
            conn.execute(
                "UPDATE snippets SET
                    video_generation_status = ?1,
                    video_generation_task_id = ?2,
                    video_generation_error = ?3,
                    media_key = COALESCE(?4, media_key),
                    media_metadata_json = COALESCE(?5, media_metadata_json),
                    updated_at = ?6
                 WHERE id = ?7",
                params![
                    update.status.as_str(),
                    update.task_id,
                    update.error,
                    media_key,
                    media_metadata_json,
                    updated_at,
                    id
                ],
            )
            .with_context(|| format!("failed to update generation state of snippet {id}"))
        })?;

        if affected == 0 {
            bail!("snippet {id} not found while marking it {}", update.status);
        }
        Ok(())
    }

    fn insert_version(&self, version: &VersionSnapshot) -> Result<()> {
        let snapshot_json =
            serde_json::to_string(&version.snapshot).context("failed to serialize snapshot")?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO snippet_versions (snippet_id, version, snapshot_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    version.snippet_id,
                    version.version,
                    snapshot_json,
                    version.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert version {} of snippet {}",
                    version.version, version.snippet_id
                )
            })?;
            Ok(())
        })
    }

    fn insert_edge(&self, edge: &Edge) -> Result<()> {
        let metadata_json =
            serde_json::to_string(&edge.metadata).context("failed to serialize edge metadata")?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO connections (
                    id, project_id, source_snippet_id, target_snippet_id, kind, metadata_json,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.id,
                    edge.project_id,
                    edge.source_snippet_id,
                    edge.target_snippet_id,
                    edge.kind.as_str(),
                    metadata_json,
                    edge.created_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert connection {}", edge.id))?;
            Ok(())
        })
    }

    fn edges_from(&self, source_snippet_id: &str) -> Result<Vec<Edge>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, project_id, source_snippet_id, target_snippet_id, kind,
                        metadata_json, created_at
                 FROM connections
                 WHERE source_snippet_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let edges = stmt
                .query_map(params![source_snippet_id], edge_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to list connections from {source_snippet_id}"))?;
            Ok(edges)
        })
    }

    fn snippets_created_from(&self, source_snippet_id: &str) -> Result<Vec<Snippet>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {SNIPPET_COLUMNS} FROM snippets WHERE created_from = ?1
                 ORDER BY created_at ASC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let snippets = stmt
                .query_map(params![source_snippet_id], snippet_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to list snippets derived from {source_snippet_id}"))?;
            Ok(snippets)
        })
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<GenerationTask> {
    let status_raw: String = row.get(10)?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(10, format!("unknown persisted status: {status_raw}")))?;

    Ok(GenerationTask {
        id: row.get(0)?,
        external_task_id: row.get(1)?,
        user_id: row.get(2)?,
        source_snippet_id: row.get(3)?,
        project_id: row.get(4)?,
        output_snippet_id: row.get(5)?,
        provider: row.get(6)?,
        model: row.get(7)?,
        prompt: row.get(8)?,
        request_params: decode_json_column(row, 9)?,
        status,
        result: row.get(11)?,
        media_key: row.get(12)?,
        media_metadata: decode_optional_metadata(row, 13)?,
        error_message: row.get(14)?,
        created_at: timestamp_column(row, 15)?,
        updated_at: timestamp_column(row, 16)?,
    })
}

fn snippet_from_row(row: &Row<'_>) -> rusqlite::Result<Snippet> {
    let status = match row.get::<_, Option<String>>(6)? {
        Some(raw) => Some(
            TaskStatus::parse(&raw)
                .ok_or_else(|| conversion_error(6, format!("unknown snippet status: {raw}")))?,
        ),
        None => None,
    };

    Ok(Snippet {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        text: row.get(3)?,
        position_x: row.get(4)?,
        position_y: row.get(5)?,
        video_generation_status: status,
        video_generation_task_id: row.get(7)?,
        video_generation_error: row.get(8)?,
        media_key: row.get(9)?,
        media_metadata: decode_optional_metadata(row, 10)?,
        created_from: row.get(11)?,
        version: row.get(12)?,
        created_at: timestamp_column(row, 13)?,
        updated_at: timestamp_column(row, 14)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    let kind_raw: String = row.get(4)?;
    let kind = EdgeKind::parse(&kind_raw)
        .ok_or_else(|| conversion_error(4, format!("unknown connection kind: {kind_raw}")))?;

    Ok(Edge {
        id: row.get(0)?,
        project_id: row.get(1)?,
        source_snippet_id: row.get(2)?,
        target_snippet_id: row.get(3)?,
        kind,
        metadata: decode_json_column(row, 5)?,
        created_at: timestamp_column(row, 6)?,
    })
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn timestamp_column(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, format!("invalid RFC3339 timestamp {raw}: {e}")))
}

fn decode_json_column(row: &Row<'_>, column: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(column, e.to_string()))
}

fn decode_optional_metadata(
    row: &Row<'_>,
    column: usize,
) -> rusqlite::Result<Option<MediaMetadata>> {
    match row.get::<_, Option<String>>(column)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_error(column, e.to_string())),
        None => Ok(None),
    }
}

fn encode_optional_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    match value {
        Some(value) => Ok(Some(serde_json::to_string(value)?)),
        None => Ok(None),
    }
}
