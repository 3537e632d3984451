use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::model::GenerationTask;
use crate::store::TaskLedger;

/// Maps a provider task id onto the ledger record that issued it.
#[derive(Clone)]
pub struct TaskCorrelator {
    ledger: Arc<dyn TaskLedger>,
}

impl TaskCorrelator {
    pub fn new(ledger: Arc<dyn TaskLedger>) -> Self {
        Self { ledger }
    }

    /// `Ok(None)` means the id is not tracked here; callers acknowledge and move on.
    pub fn find_by_external_id(&self, external_task_id: &str) -> Result<Option<GenerationTask>> {
        let task = self.ledger.find_by_external_id(external_task_id)?;
        if task.is_none() {
            debug!(external_task_id, "no generation task matches callback task id");
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use crate::store::SqliteStore;
    use chrono::Utc;

    #[test]
    fn unknown_id_is_none_and_known_id_resolves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(dir.path()).expect("store"));
        let correlator = TaskCorrelator::new(store.clone());

        assert!(correlator.find_by_external_id("ext-404").unwrap().is_none());

        let now = Utc::now();
        store
            .insert_task(&GenerationTask {
                id: "task-1".to_string(),
                external_task_id: "ext-1".to_string(),
                user_id: "u".to_string(),
                source_snippet_id: "s".to_string(),
                project_id: "p".to_string(),
                output_snippet_id: None,
                provider: "vidu".to_string(),
                model: "vidu-q1".to_string(),
                prompt: "prompt".to_string(),
                request_params: serde_json::json!({}),
                status: TaskStatus::Pending,
                result: None,
                media_key: None,
                media_metadata: None,
                error_message: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let task = correlator.find_by_external_id("ext-1").unwrap().expect("task");
        assert_eq!(task.id, "task-1");
    }
}
