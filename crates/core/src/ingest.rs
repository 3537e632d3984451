use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use url::Url;

use crate::config::MediaConfig;
use crate::model::{GenerationTask, MediaMetadata, StoredMedia};
use crate::store::ObjectStore;

const DEFAULT_MEDIA_EXTENSION: &str = "mp4";
const DEFAULT_CONTENT_TYPE: &str = "video/mp4";
const DEFAULT_DURATION_SECS: f64 = 4.0;
const DEFAULT_RESOLUTION: &str = "720p";
const DEFAULT_ASPECT_RATIO: &str = "16:9";
const DEFAULT_STYLE: &str = "general";
const DEFAULT_MOVEMENT_AMPLITUDE: &str = "auto";

#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedMedia>;
}

/// Single-attempt HTTP(S) fetcher that buffers the whole body in memory.
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpMediaFetcher {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build HTTP client for media fetcher")?;

        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedMedia> {
        let redacted_url = redacted_url_for_display(url);
        let mut response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|_| anyhow!("failed to start download from {redacted_url}"))?;

        if !response.status().is_success() {
            bail!(
                "download request returned HTTP {} for {}",
                response.status().as_u16(),
                redacted_url
            );
        }

        if let Some(announced) = response.content_length() {
            if announced > self.max_bytes {
                bail!(
                    "media at {redacted_url} announces {announced} bytes, over the {} byte limit",
                    self.max_bytes
                );
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|_| anyhow!("failed while reading HTTP body from {redacted_url}"))?
        {
            if bytes.len() as u64 + chunk.len() as u64 > self.max_bytes {
                bail!(
                    "media at {redacted_url} exceeds the {} byte limit",
                    self.max_bytes
                );
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(url = %redacted_url, size_bytes = bytes.len(), "downloaded media");
        Ok(FetchedMedia {
            bytes,
            content_type,
        })
    }
}

/// Downloads a finished generation's media and persists it in the object store.
#[derive(Clone)]
pub struct MediaIngestor {
    fetcher: Arc<dyn MediaFetcher>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaIngestor {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { fetcher, objects }
    }

    pub async fn ingest(&self, task: &GenerationTask, url: &Url) -> Result<StoredMedia> {
        self.ingest_at(task, url, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        task: &GenerationTask,
        url: &Url,
        now: DateTime<Utc>,
    ) -> Result<StoredMedia> {
        let fetched = self.fetcher.fetch(url).await?;

        let extension = extension_from_url(url).unwrap_or_else(|| DEFAULT_MEDIA_EXTENSION.into());
        let key = media_storage_key(task, now, &extension);
        let content_type = resolve_content_type(fetched.content_type.as_deref(), &extension);
        let size_bytes = fetched.bytes.len() as u64;

        let objects = Arc::clone(&self.objects);
        let put_key = key.clone();
        let stored_key = tokio::task::spawn_blocking(move || objects.put(&put_key, &fetched.bytes))
            .await
            .map_err(|e| anyhow!("object store task join error: {e}"))?
            .with_context(|| format!("failed to persist media for task {}", task.id))?;

        info!(
            task_id = %task.id,
            object_key = %stored_key,
            size_bytes,
            url = %redacted_url_for_display(url),
            "ingested generated media"
        );

        Ok(StoredMedia {
            key: stored_key,
            metadata: build_media_metadata(&task.request_params, size_bytes, content_type),
        })
    }
}

/// Accept only absolute http/https URLs. Errors never echo the query string.
pub fn parse_media_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw.trim()).with_context(|| {
        format!(
            "invalid media URL: {}",
            crate::logging::redact_sensitive_text(raw)
        )
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => {
            let redacted = redacted_url_for_display(&parsed);
            bail!("unsupported media URL scheme '{scheme}' for '{redacted}' (expected http/https)")
        }
    }
}

pub fn media_storage_key(task: &GenerationTask, now: DateTime<Utc>, extension: &str) -> String {
    format!(
        "projects/{}/snippets/{}/videos/{}.{}",
        task.project_id,
        task.source_snippet_id,
        now.timestamp_millis(),
        extension
    )
}

/// Overlay the original request parameters onto defaults. Both snake_case and camelCase
/// parameter names are honoured.
pub fn build_media_metadata(
    request_params: &serde_json::Value,
    size_bytes: u64,
    content_type: String,
) -> MediaMetadata {
    MediaMetadata {
        duration: param(request_params, &["duration"])
            .and_then(value_as_f64)
            .unwrap_or(DEFAULT_DURATION_SECS),
        resolution: param_string(request_params, &["resolution"])
            .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string()),
        aspect_ratio: param_string(request_params, &["aspect_ratio", "aspectRatio"])
            .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
        style: param_string(request_params, &["style"])
            .unwrap_or_else(|| DEFAULT_STYLE.to_string()),
        seed: param(request_params, &["seed"]).and_then(value_as_i64),
        movement_amplitude: param_string(
            request_params,
            &["movement_amplitude", "movementAmplitude"],
        )
        .unwrap_or_else(|| DEFAULT_MOVEMENT_AMPLITUDE.to_string()),
        size_bytes,
        content_type,
    }
}

fn param<'a>(params: &'a serde_json::Value, names: &[&str]) -> Option<&'a serde_json::Value> {
    names
        .iter()
        .find_map(|name| params.get(*name))
        .filter(|value| !value.is_null())
}

fn param_string(params: &serde_json::Value, names: &[&str]) -> Option<String> {
    match param(params, names)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn resolve_content_type(header: Option<&str>, extension: &str) -> String {
    let from_header = header
        .and_then(|raw| raw.split(';').next())
        .map(str::trim)
        .filter(|mime| !mime.is_empty() && *mime != "application/octet-stream");
    if let Some(mime) = from_header {
        return mime.to_string();
    }

    mime_guess::from_ext(extension)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

fn extension_from_url(url: &Url) -> Option<String> {
    let ext = Path::new(url.path()).extension()?.to_str()?;
    let mut cleaned = String::with_capacity(ext.len());
    for ch in ext.chars() {
        if ch.is_ascii_alphanumeric() {
            cleaned.push(ch.to_ascii_lowercase());
        }
    }

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn redacted_url_for_display(url: &Url) -> String {
    let mut redacted = url.clone();
    if redacted.query().is_some() {
        redacted.set_query(Some("<redacted>"));
    }
    redacted.to_string()
}
