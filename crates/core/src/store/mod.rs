//! Durable collaborators the callback pipeline reads and writes.

mod objects;
mod sqlite;

use anyhow::Result;

use crate::model::{
    Edge, GenerationTask, Snippet, SnippetGenerationUpdate, TaskTransition, VersionSnapshot,
};

pub use objects::FsObjectStore;
pub use sqlite::SqliteStore;

/// Append-only ledger of generation tasks.
pub trait TaskLedger: Send + Sync {
    fn find_by_external_id(&self, external_task_id: &str) -> Result<Option<GenerationTask>>;
    fn get_task(&self, id: &str) -> Result<Option<GenerationTask>>;
    fn insert_task(&self, task: &GenerationTask) -> Result<()>;
    fn apply_transition(&self, id: &str, transition: &TaskTransition) -> Result<()>;
}

/// Canvas snippets, their version snapshots, and their outgoing connections.
pub trait EntityStore: Send + Sync {
    fn get_snippet(&self, id: &str) -> Result<Option<Snippet>>;
    fn insert_snippet(&self, snippet: &Snippet) -> Result<()>;
    fn update_snippet_generation(&self, id: &str, update: &SnippetGenerationUpdate) -> Result<()>;
    fn insert_version(&self, version: &VersionSnapshot) -> Result<()>;
    fn insert_edge(&self, edge: &Edge) -> Result<()>;
    fn edges_from(&self, source_snippet_id: &str) -> Result<Vec<Edge>>;
    fn snippets_created_from(&self, source_snippet_id: &str) -> Result<Vec<Snippet>>;
}

/// Binary blob storage under caller-chosen keys.
pub trait ObjectStore: Send + Sync {
    /// Persist `bytes` under `key` and return the key the object can be retrieved by.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;
}
