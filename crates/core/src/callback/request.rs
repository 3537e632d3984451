//! Reconstructs the request the provider actually signed.
//!
//! Gateways in front of the service may add a stage segment to the path, rewrite it into a
//! route template, or move the original URI into a forwarding header. All of that is folded
//! here into one [`CanonicalRequest`]; nothing downstream looks at the raw request shape.

use anyhow::{bail, Context, Result};
use axum::http::{HeaderMap, Method, Uri};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::WebhookConfig;
use crate::signature::SigningParts;

const ORIGINAL_URI_HEADERS: [&str; 2] = ["x-original-uri", "x-forwarded-uri"];
const FORWARDED_PREFIX_HEADER: &str = "x-forwarded-prefix";
const BODY_ENCODING_HEADERS: [&str; 2] = ["content-transfer-encoding", "x-body-encoding"];

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
}

impl CanonicalRequest {
    pub fn from_parts(method: Method, uri: &Uri, headers: HeaderMap, webhook: &WebhookConfig) -> Self {
        let (path, query) = resolve_path_and_query(uri, &headers, webhook);
        Self {
            method,
            path,
            query,
            headers,
        }
    }

    pub fn signing_parts(&self) -> SigningParts<'_> {
        SigningParts {
            method: self.method.as_str(),
            path: &self.path,
            query: &self.query,
            headers: &self.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn resolve_path_and_query(uri: &Uri, headers: &HeaderMap, webhook: &WebhookConfig) -> (String, String) {
    let uri_query = uri.query().unwrap_or_default().to_string();

    if let Some(canonical) = webhook
        .canonical_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        return (normalize_path(canonical, &[]), uri_query);
    }

    let original = ORIGINAL_URI_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let (raw_path, query) = match original {
        Some(original) => match original.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (original.to_string(), uri_query),
        },
        None => {
            let prefix = headers
                .get(FORWARDED_PREFIX_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .unwrap_or_default();
            (format!("{prefix}{}", uri.path()), uri_query)
        }
    };

    let path = if raw_path.contains('{') {
        normalize_path(&webhook.path, &[])
    } else {
        normalize_path(&raw_path, &webhook.stage_prefixes)
    };
    (path, query)
}

/// Every request path the callback route must answer: the mount path, the mount path behind
/// each configured stage segment, and trailing-slash forms of both. Segments that would turn
/// into route parameters are skipped.
pub fn mount_paths(webhook: &WebhookConfig) -> Vec<String> {
    let base = normalize_path(&webhook.path, &[]);
    let mut roots = vec![base.clone()];
    for prefix in &webhook.stage_prefixes {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(['{', '}', '*', '/']) {
            continue;
        }
        roots.push(normalize_path(&format!("/{prefix}{base}"), &[]));
    }

    let mut paths = Vec::with_capacity(roots.len() * 2);
    for root in roots {
        let slashed = format!("{root}/");
        for path in [root, slashed] {
            if path != "//" && !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Collapse repeated slashes, drop one leading stage segment and any trailing slash.
pub fn normalize_path(raw: &str, stage_prefixes: &[String]) -> String {
    let mut segments: Vec<&str> = raw.split('/').filter(|segment| !segment.is_empty()).collect();

    if let Some(first) = segments.first() {
        let is_stage = stage_prefixes
            .iter()
            .map(|prefix| prefix.trim_matches('/'))
            .any(|prefix| !prefix.is_empty() && prefix == *first);
        if is_stage && segments.len() > 1 {
            segments.remove(0);
        }
    }

    format!("/{}", segments.join("/"))
}

/// Undo a transport encoding applied by the hosting layer. Plain bodies pass through.
pub fn decode_body(headers: &HeaderMap, raw: &[u8]) -> Result<Vec<u8>> {
    let base64_encoded = BODY_ENCODING_HEADERS.iter().any(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("base64"))
    });
    if !base64_encoded {
        return Ok(raw.to_vec());
    }

    let text = std::str::from_utf8(raw).context("base64 body is not valid UTF-8")?;
    let compact: String = text.chars().filter(|ch| !ch.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        bail!("base64 body is empty");
    }
    STANDARD
        .decode(compact.as_bytes())
        .context("body is not valid base64")
}
