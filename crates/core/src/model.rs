//! Ledger and canvas records touched by the callback pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TaskStatus::Pending),
            "PROCESSING" => Some(TaskStatus::Processing),
            "COMPLETE" => Some(TaskStatus::Complete),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asynchronous generation job, from issuance to terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationTask {
    pub id: String,
    pub external_task_id: String,
    pub user_id: String,
    pub source_snippet_id: String,
    pub project_id: String,
    pub output_snippet_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub request_params: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub media_key: Option<String>,
    pub media_metadata: Option<MediaMetadata>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaMetadata {
    pub duration: f64,
    pub resolution: String,
    pub aspect_ratio: String,
    pub style: String,
    pub seed: Option<i64>,
    pub movement_amplitude: String,
    pub size_bytes: u64,
    pub content_type: String,
}

/// A durably stored media object and what is known about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMedia {
    pub key: String,
    pub metadata: MediaMetadata,
}

/// A canvas snippet. Source snippets mirror generation progress; derived snippets are
/// materialized from a finished generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snippet {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub text: String,
    pub position_x: f64,
    pub position_y: f64,
    pub video_generation_status: Option<TaskStatus>,
    pub video_generation_task_id: Option<String>,
    pub video_generation_error: Option<String>,
    pub media_key: Option<String>,
    pub media_metadata: Option<MediaMetadata>,
    pub created_from: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionSnapshot {
    pub snippet_id: String,
    pub version: i64,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    References,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::References => "references",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "references" => Some(EdgeKind::References),
            _ => None,
        }
    }
}

/// Directed canvas connection between two snippets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub id: String,
    pub project_id: String,
    pub source_snippet_id: String,
    pub target_snippet_id: String,
    pub kind: EdgeKind,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Ledger write applied by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Processing,
    Complete {
        media: StoredMedia,
        output_snippet_id: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl TaskTransition {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskTransition::Processing => TaskStatus::Processing,
            TaskTransition::Complete { .. } => TaskStatus::Complete,
            TaskTransition::Failed { .. } => TaskStatus::Failed,
        }
    }
}

/// Mirrored generation fields written onto a source snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct SnippetGenerationUpdate {
    pub status: TaskStatus,
    pub task_id: String,
    pub error: Option<String>,
    pub media: Option<StoredMedia>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_string_forms_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Complete,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::json!(status.as_str())
            );
        }
        assert_eq!(TaskStatus::parse("complete"), None);
    }

    #[test]
    fn only_complete_and_failed_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
