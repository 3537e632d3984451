//! Applies callback outcomes across the task ledger and the canvas.
//!
//! Every write here is independent. There is no transaction spanning the ledger and the
//! canvas store, so each path orders its writes such that the media reference is recorded
//! somewhere durable even when an intermediate write fails.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{
    Edge, EdgeKind, GenerationTask, Snippet, SnippetGenerationUpdate, StoredMedia, TaskStatus,
    TaskTransition, VersionSnapshot,
};
use crate::store::{EntityStore, TaskLedger};

const EDGE_ASSET_TYPE: &str = "video";

/// A non-fatal sub-step failure attached to an otherwise successful outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", content = "error", rename_all = "snake_case")]
pub enum ReconcileWarning {
    SourceSnippetMissing(String),
    DerivedSnippet(String),
    VersionSnapshot(String),
    Edge(String),
}

impl fmt::Display for ReconcileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileWarning::SourceSnippetMissing(id) => write!(f, "source snippet {id} not found"),
            ReconcileWarning::DerivedSnippet(err) => {
                write!(f, "failed to create derived snippet: {err}")
            }
            ReconcileWarning::VersionSnapshot(err) => {
                write!(f, "failed to snapshot derived snippet: {err}")
            }
            ReconcileWarning::Edge(err) => write!(f, "failed to link derived snippet: {err}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuccessOutcome {
    pub derived_snippet_id: Option<String>,
    pub edge_id: Option<String>,
    pub warnings: Vec<ReconcileWarning>,
}

#[derive(Clone)]
pub struct StateReconciler {
    ledger: Arc<dyn TaskLedger>,
    entities: Arc<dyn EntityStore>,
    provider_name: String,
    derived_offset_x: f64,
}

impl StateReconciler {
    pub fn new(
        ledger: Arc<dyn TaskLedger>,
        entities: Arc<dyn EntityStore>,
        provider_name: impl Into<String>,
        derived_offset_x: f64,
    ) -> Self {
        Self {
            ledger,
            entities,
            provider_name: provider_name.into(),
            derived_offset_x,
        }
    }

    /// Materialize the derived snippet and edge, then mark source and task COMPLETE.
    ///
    /// Derivation and linking failures are reported as warnings. Failures marking the
    /// source or the task propagate.
    pub fn succeed(&self, task: &GenerationTask, media: &StoredMedia) -> Result<SuccessOutcome> {
        let mut outcome = SuccessOutcome::default();
        let source = self.load_source(task, &mut outcome.warnings)?;

        if let Some(source) = &source {
            match self.create_derived_snippet(task, source, media) {
                Ok(derived) => {
                    if let Err(err) = self.snapshot(&derived) {
                        outcome
                            .warnings
                            .push(ReconcileWarning::VersionSnapshot(format!("{err:#}")));
                    }
                    match self.link(task, source, &derived) {
                        Ok(edge_id) => outcome.edge_id = Some(edge_id),
                        Err(err) => outcome.warnings.push(ReconcileWarning::Edge(format!("{err:#}"))),
                    }
                    outcome.derived_snippet_id = Some(derived.id);
                }
                Err(err) => outcome
                    .warnings
                    .push(ReconcileWarning::DerivedSnippet(format!("{err:#}"))),
            }

            let source_media = match outcome.derived_snippet_id {
                Some(_) => None,
                None => Some(media.clone()),
            };
            self.entities.update_snippet_generation(
                &source.id,
                &SnippetGenerationUpdate {
                    status: TaskStatus::Complete,
                    task_id: task.external_task_id.clone(),
                    error: None,
                    media: source_media,
                },
            )?;
        }

        self.ledger.apply_transition(
            &task.id,
            &TaskTransition::Complete {
                media: media.clone(),
                output_snippet_id: outcome.derived_snippet_id.clone(),
            },
        )?;

        for warning in &outcome.warnings {
            warn!(task_id = %task.id, warning = %warning, "generation completed with warning");
        }
        info!(
            task_id = %task.id,
            external_task_id = %task.external_task_id,
            derived_snippet_id = outcome.derived_snippet_id.as_deref().unwrap_or(""),
            media_key = %media.key,
            "generation task completed"
        );
        Ok(outcome)
    }

    pub fn fail(&self, task: &GenerationTask, error: &str) -> Result<()> {
        let mut warnings = Vec::new();
        if let Some(source) = self.load_source(task, &mut warnings)? {
            self.entities.update_snippet_generation(
                &source.id,
                &SnippetGenerationUpdate {
                    status: TaskStatus::Failed,
                    task_id: task.external_task_id.clone(),
                    error: Some(error.to_string()),
                    media: None,
                },
            )?;
        }

        self.ledger.apply_transition(
            &task.id,
            &TaskTransition::Failed {
                error: error.to_string(),
            },
        )?;

        info!(task_id = %task.id, error, "generation task failed");
        Ok(())
    }

    pub fn mark_processing(&self, task: &GenerationTask) -> Result<()> {
        let mut warnings = Vec::new();
        if let Some(source) = self.load_source(task, &mut warnings)? {
            self.entities.update_snippet_generation(
                &source.id,
                &SnippetGenerationUpdate {
                    status: TaskStatus::Processing,
                    task_id: task.external_task_id.clone(),
                    error: None,
                    media: None,
                },
            )?;
        }

        self.ledger
            .apply_transition(&task.id, &TaskTransition::Processing)?;
        Ok(())
    }

    fn load_source(
        &self,
        task: &GenerationTask,
        warnings: &mut Vec<ReconcileWarning>,
    ) -> Result<Option<Snippet>> {
        let source = self.entities.get_snippet(&task.source_snippet_id)?;
        if source.is_none() {
            warn!(
                task_id = %task.id,
                source_snippet_id = %task.source_snippet_id,
                "source snippet for generation task no longer exists"
            );
            warnings.push(ReconcileWarning::SourceSnippetMissing(
                task.source_snippet_id.clone(),
            ));
        }
        Ok(source)
    }

    fn create_derived_snippet(
        &self,
        task: &GenerationTask,
        source: &Snippet,
        media: &StoredMedia,
    ) -> Result<Snippet> {
        let now = Utc::now();
        let derived = Snippet {
            id: Uuid::new_v4().to_string(),
            project_id: source.project_id.clone(),
            user_id: source.user_id.clone(),
            text: source.text.clone(),
            position_x: source.position_x + self.derived_offset_x,
            position_y: source.position_y,
            video_generation_status: Some(TaskStatus::Complete),
            video_generation_task_id: Some(task.external_task_id.clone()),
            video_generation_error: None,
            media_key: Some(media.key.clone()),
            media_metadata: Some(media.metadata.clone()),
            created_from: Some(source.id.clone()),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.entities.insert_snippet(&derived)?;
        Ok(derived)
    }

    fn snapshot(&self, derived: &Snippet) -> Result<()> {
        self.entities.insert_version(&VersionSnapshot {
            snippet_id: derived.id.clone(),
            version: derived.version,
            snapshot: serde_json::to_value(derived)?,
            created_at: derived.created_at,
        })
    }

    fn link(&self, task: &GenerationTask, source: &Snippet, derived: &Snippet) -> Result<String> {
        let edge = Edge {
            id: Uuid::new_v4().to_string(),
            project_id: source.project_id.clone(),
            source_snippet_id: source.id.clone(),
            target_snippet_id: derived.id.clone(),
            kind: EdgeKind::References,
            metadata: serde_json::json!({
                "provider": self.provider_name,
                "asset_type": EDGE_ASSET_TYPE,
                "task_id": task.external_task_id,
            }),
            created_at: Utc::now(),
        };
        self.entities.insert_edge(&edge)?;
        Ok(edge.id)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::bail;

    use super::*;
    use crate::store::SqliteStore;

    /// Delegates to a real store but refuses selected canvas writes.
    pub struct FlakyEntityStore {
        pub inner: SqliteStore,
        pub fail_snippet_insert: bool,
        pub fail_edge_insert: bool,
    }

    impl EntityStore for FlakyEntityStore {
        fn get_snippet(&self, id: &str) -> Result<Option<Snippet>> {
            self.inner.get_snippet(id)
        }

        fn insert_snippet(&self, snippet: &Snippet) -> Result<()> {
            if self.fail_snippet_insert {
                bail!("snippet table unavailable");
            }
            self.inner.insert_snippet(snippet)
        }

        fn update_snippet_generation(
            &self,
            id: &str,
            update: &SnippetGenerationUpdate,
        ) -> Result<()> {
            self.inner.update_snippet_generation(id, update)
        }

        fn insert_version(&self, version: &VersionSnapshot) -> Result<()> {
            self.inner.insert_version(version)
        }

        fn insert_edge(&self, edge: &Edge) -> Result<()> {
            if self.fail_edge_insert {
                bail!("connection table unavailable");
            }
            self.inner.insert_edge(edge)
        }

        fn edges_from(&self, source_snippet_id: &str) -> Result<Vec<Edge>> {
            self.inner.edges_from(source_snippet_id)
        }

        fn snippets_created_from(&self, source_snippet_id: &str) -> Result<Vec<Snippet>> {
            self.inner.snippets_created_from(source_snippet_id)
        }
    }
}
