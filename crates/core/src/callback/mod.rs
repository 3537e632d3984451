//! Provider callback handling: authenticate, validate, correlate, reconcile.

pub mod payload;
pub mod request;

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::correlator::TaskCorrelator;
use crate::ingest::{parse_media_url, MediaIngestor};
use crate::logging::PAYLOAD_DIAGNOSTICS_TARGET;
use crate::model::{GenerationTask, TaskStatus};
use crate::reconcile::StateReconciler;
use crate::secrets::SecretProvider;
use crate::signature::{
    SignatureVerifier, VerifyFailure, ALGORITHM_HEADER, EXPECTED_ALGORITHM, SIGNATURE_HEADER,
    SIGNED_HEADERS_HEADER,
};
use payload::{parse_callback, CallbackEvent, CallbackState};
use request::{decode_body, CanonicalRequest};

const NO_MEDIA_URL_MESSAGE: &str = "provider reported success without a usable media URL";

/// Accepted callback and the status it is answered with (200 or 202).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackAck {
    pub status: StatusCode,
    pub message: String,
}

impl CallbackAck {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            message: message.into(),
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum CallbackError {
    MethodNotAllowed,
    Unauthorized(VerifyFailure),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackError::MethodNotAllowed => f.write_str("method not allowed"),
            CallbackError::Unauthorized(reason) => write!(f, "unauthorized: {reason}"),
            CallbackError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            CallbackError::Internal(err) => write!(f, "internal error: {err:#}"),
        }
    }
}

impl From<anyhow::Error> for CallbackError {
    fn from(err: anyhow::Error) -> Self {
        CallbackError::Internal(err)
    }
}

pub struct CallbackDispatcher {
    webhook: WebhookConfig,
    verifier: SignatureVerifier,
    secrets: Arc<SecretProvider>,
    correlator: TaskCorrelator,
    ingestor: MediaIngestor,
    reconciler: StateReconciler,
}

impl CallbackDispatcher {
    pub fn new(
        webhook: WebhookConfig,
        secrets: Arc<SecretProvider>,
        correlator: TaskCorrelator,
        ingestor: MediaIngestor,
        reconciler: StateReconciler,
    ) -> Self {
        let verifier = SignatureVerifier::new(webhook.signing_tag.clone(), webhook.tolerance_ms);
        Self {
            webhook,
            verifier,
            secrets,
            correlator,
            ingestor,
            reconciler,
        }
    }

    /// Handle one inbound callback. Infrastructure failures are logged here and surface as
    /// [`CallbackError::Internal`]; the caller only needs to map the variant to a status.
    pub async fn dispatch(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<CallbackAck, CallbackError> {
        let result = self.handle(method, uri, headers, body).await;
        match &result {
            Ok(ack) => debug!(status = ack.status.as_u16(), message = %ack.message, "callback handled"),
            Err(CallbackError::Internal(err)) => {
                error!(error = %format!("{err:#}"), "callback processing failed")
            }
            Err(other) => debug!(error = %other, "callback rejected"),
        }
        result
    }

    async fn handle(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<CallbackAck, CallbackError> {
        if method != Method::POST {
            return Err(CallbackError::MethodNotAllowed);
        }

        let request = CanonicalRequest::from_parts(method, &uri, headers, &self.webhook);
        if let Some(algorithm) = request.header(ALGORITHM_HEADER) {
            if !algorithm.trim().eq_ignore_ascii_case(EXPECTED_ALGORITHM) {
                warn!(algorithm, "callback declares unexpected signature algorithm");
            }
        }

        let secret = self
            .secrets
            .get()
            .await
            .context("failed to load provider signing secret")?;
        if let Err(reason) = self.verifier.verify(
            &secret,
            &request.signing_parts(),
            request.header(SIGNATURE_HEADER),
            request.header(SIGNED_HEADERS_HEADER),
        ) {
            warn!(
                reason = %reason,
                path = %request.path,
                "rejected callback with invalid signature"
            );
            return Err(CallbackError::Unauthorized(reason));
        }

        let body = decode_body(&request.headers, &body)
            .map_err(|err| CallbackError::BadRequest(format!("{err:#}")))?;
        let event = parse_callback(&body).map_err(|err| {
            debug!(
                target: PAYLOAD_DIAGNOSTICS_TARGET,
                body = %String::from_utf8_lossy(&body),
                error = %err,
                "rejected callback payload"
            );
            CallbackError::BadRequest(err.to_string())
        })?;

        let Some(task) = self.correlator.find_by_external_id(&event.task_id)? else {
            info!(external_task_id = %event.task_id, state = %event.raw_state, "ignoring callback for unknown task");
            return Ok(CallbackAck::ignored("task not recognized; callback ignored"));
        };

        info!(
            task_id = %task.id,
            external_task_id = %task.external_task_id,
            state = %event.raw_state,
            current_status = %task.status,
            "received generation callback"
        );

        match event.state {
            CallbackState::Success => self.on_success(&task, &event).await,
            CallbackState::Failure => {
                let message = event.failure_message();
                self.reconciler.fail(&task, &message)?;
                Ok(CallbackAck::ok(format!("video generation failed: {message}")))
            }
            CallbackState::Interim => {
                if task.status.is_terminal() {
                    info!(task_id = %task.id, status = %task.status, "ignoring interim callback for finished task");
                    return Ok(CallbackAck::ok(format!(
                        "task already {}; interim callback ignored",
                        task.status
                    )));
                }
                self.reconciler.mark_processing(&task)?;
                Ok(CallbackAck::ok(format!(
                    "video generation in progress (state: {})",
                    event.raw_state
                )))
            }
        }
    }

    async fn on_success(
        &self,
        task: &GenerationTask,
        event: &CallbackEvent,
    ) -> Result<CallbackAck, CallbackError> {
        // A completed task always has its media recorded, with or without a derived snippet.
        if task.status == TaskStatus::Complete && task.media_key.is_some() {
            info!(task_id = %task.id, "ignoring duplicate success callback");
            return Ok(CallbackAck::ok("task already complete; duplicate callback ignored"));
        }

        let Some(raw_url) = event.first_media_url() else {
            self.reconciler.fail(task, NO_MEDIA_URL_MESSAGE)?;
            return Err(CallbackError::BadRequest(NO_MEDIA_URL_MESSAGE.to_string()));
        };
        let url = match parse_media_url(raw_url) {
            Ok(url) => url,
            Err(err) => {
                let message = format!("{err:#}");
                self.reconciler.fail(task, &message)?;
                return Err(CallbackError::BadRequest(message));
            }
        };

        let media = match self.ingestor.ingest(task, &url).await {
            Ok(media) => media,
            Err(err) => {
                let message = format!("media ingestion failed: {err:#}");
                if let Err(mark_err) = self.reconciler.fail(task, &message) {
                    warn!(task_id = %task.id, error = %format!("{mark_err:#}"), "failed to record ingestion failure");
                }
                return Err(CallbackError::Internal(err));
            }
        };

        let outcome = self.reconciler.succeed(task, &media)?;
        let message = match outcome.warnings.len() {
            0 => "video generation completed".to_string(),
            n => format!("video generation completed with {n} warning(s)"),
        };
        Ok(CallbackAck::ok(message))
    }
}
