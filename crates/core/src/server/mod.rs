use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::callback::request::{mount_paths, normalize_path};
use crate::callback::{CallbackDispatcher, CallbackError};
use crate::config::{resolve_relative_to, AppConfig};
use crate::correlator::TaskCorrelator;
use crate::ingest::{HttpMediaFetcher, MediaFetcher, MediaIngestor};
use crate::model::{GenerationTask, MediaMetadata, TaskStatus};
use crate::reconcile::StateReconciler;
use crate::secrets::{secret_store_from_config, SecretProvider, SecretStore};
use crate::store::{EntityStore, FsObjectStore, ObjectStore, SqliteStore, TaskLedger};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    data_dir: PathBuf,
    ledger: Arc<dyn TaskLedger>,
    dispatcher: Arc<CallbackDispatcher>,
}

/// Storage, network, and secret backends the callback pipeline runs against.
pub struct Collaborators {
    pub ledger: Arc<dyn TaskLedger>,
    pub entities: Arc<dyn EntityStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub secrets: Arc<dyn SecretStore>,
}

impl AppState {
    pub fn new(config: AppConfig, data_dir: PathBuf, collaborators: Collaborators) -> Self {
        let Collaborators {
            ledger,
            entities,
            objects,
            fetcher,
            secrets,
        } = collaborators;

        let secrets = Arc::new(SecretProvider::new(secrets, config.provider.name.clone()));
        let reconciler = StateReconciler::new(
            Arc::clone(&ledger),
            entities,
            config.provider.name.clone(),
            config.canvas.derived_offset_x,
        );
        let dispatcher = CallbackDispatcher::new(
            config.webhook.clone(),
            secrets,
            TaskCorrelator::new(Arc::clone(&ledger)),
            MediaIngestor::new(fetcher, objects),
            reconciler,
        );

        Self {
            inner: Arc::new(AppStateInner {
                config,
                data_dir,
                ledger,
                dispatcher: Arc::new(dispatcher),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn data_dir(&self) -> &StdPath {
        &self.inner.data_dir
    }

    /// Mount path of the callback route, normalized to a single leading slash.
    pub fn webhook_path(&self) -> String {
        normalize_path(&self.inner.config.webhook.path, &[])
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: String,
    pub external_task_id: String,
    pub status: TaskStatus,
    pub provider: String,
    pub model: String,
    pub source_snippet_id: String,
    pub output_snippet_id: Option<String>,
    pub media_key: Option<String>,
    pub media_metadata: Option<MediaMetadata>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn app_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/tasks/{task_id}", get(get_task))
        .route("/api/{*path}", any(api_route_not_found));
    for path in mount_paths(&state.config().webhook) {
        router = router.route(&path, any(receive_callback));
    }

    router.layer(CorsLayer::permissive()).with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn receive_callback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let dispatcher = Arc::clone(&state.inner.dispatcher);
    let ack = tokio::spawn(async move { dispatcher.dispatch(method, uri, headers, body).await })
        .await
        .map_err(|e| {
            error!(error = %e, "callback task aborted");
            AppError::Internal(format!("callback task join error: {e}"))
        })??;

    Ok((
        ack.status,
        Json(MessageResponse {
            message: ack.message,
        }),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state
        .inner
        .ledger
        .find_by_external_id(&task_id)
        .map_err(|err| {
            error!(error = %format!("{err:#}"), task_id, "failed to load generation task");
            AppError::from(err)
        })?
        .ok_or_else(|| AppError::NotFound(format!("task not found: {task_id}")))?;

    Ok(Json(task_to_response(task)))
}

fn task_to_response(task: GenerationTask) -> TaskResponse {
    TaskResponse {
        id: task.id,
        external_task_id: task.external_task_id,
        status: task.status,
        provider: task.provider,
        model: task.model,
        source_snippet_id: task.source_snippet_id,
        output_snippet_id: task.output_snippet_id,
        media_key: task.media_key,
        media_metadata: task.media_metadata,
        error_message: task.error_message,
        created_at: task.created_at,
        updated_at: task.updated_at,
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    MethodNotAllowed(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::MethodNotAllowed(msg) => {
                let body = Json(ErrorResponse { error: msg });
                return (
                    StatusCode::METHOD_NOT_ALLOWED,
                    [(header::ALLOW, "POST")],
                    body,
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            // Detail is logged where the error is raised; callers only see a generic body.
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<CallbackError> for AppError {
    fn from(err: CallbackError) -> Self {
        match err {
            CallbackError::MethodNotAllowed => {
                AppError::MethodNotAllowed("method not allowed".to_string())
            }
            CallbackError::Unauthorized(_) => AppError::Unauthorized("invalid signature".to_string()),
            CallbackError::BadRequest(msg) => AppError::BadRequest(msg),
            CallbackError::Internal(err) => AppError::from(err),
        }
    }
}

/// Build application state backed by the SQLite canvas db, the filesystem object store, and
/// the configured secret source under `data_dir`.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> Result<AppState> {
    let store = Arc::new(SqliteStore::new(&data_dir)?);
    let objects_dir = resolve_relative_to(&data_dir, &config.media.objects_dir);
    let objects = Arc::new(FsObjectStore::new(objects_dir)?);
    let fetcher = Arc::new(HttpMediaFetcher::new(&config.media)?);
    let secrets = secret_store_from_config(&config.secrets.source, &data_dir);

    info!(
        db_path = %store.db_path().display(),
        objects_dir = %objects.root().display(),
        webhook_path = %config.webhook.path,
        provider = %config.provider.name,
        "Initialized callback pipeline"
    );

    let collaborators = Collaborators {
        ledger: store.clone(),
        entities: store,
        objects,
        fetcher,
        secrets,
    };
    Ok(AppState::new(config, data_dir, collaborators))
}
