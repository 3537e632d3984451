//! HMAC request signing as practised by the video provider.
//!
//! The provider signs `METHOD\nPATH\nQUERY\n<tag>\nDATE\n` followed by one `Name:Value\n` line
//! for every header named in `X-HMAC-SIGNED-HEADERS`, in the order listed there. The MAC is
//! HMAC-SHA256 keyed by the shared secret and transmitted base64-encoded in
//! `X-HMAC-SIGNATURE`.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::logging::SIGNATURE_DIAGNOSTICS_TARGET;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hmac-signature";
pub const SIGNED_HEADERS_HEADER: &str = "x-hmac-signed-headers";
pub const ALGORITHM_HEADER: &str = "x-hmac-algorithm";
pub const EXPECTED_ALGORITHM: &str = "hmac-sha256";
pub const DATE_HEADER: &str = "date";

/// Why a request failed authentication. `Display` renders the stable reason code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    MissingSignature,
    MissingSignedHeaders,
    MissingDateHeader,
    InvalidDateHeader,
    TimestampOutOfRange,
    MissingHeader(String),
    SignatureMismatch,
}

impl VerifyFailure {
    pub fn code(&self) -> String {
        match self {
            VerifyFailure::MissingSignature => "missing_signature".to_string(),
            VerifyFailure::MissingSignedHeaders => "missing_signed_headers".to_string(),
            VerifyFailure::MissingDateHeader => "missing_date_header".to_string(),
            VerifyFailure::InvalidDateHeader => "invalid_date_header".to_string(),
            VerifyFailure::TimestampOutOfRange => "timestamp_out_of_range".to_string(),
            VerifyFailure::MissingHeader(name) => format!("missing_header_{name}"),
            VerifyFailure::SignatureMismatch => "signature_mismatch".to_string(),
        }
    }
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl std::error::Error for VerifyFailure {}

/// The request as the provider saw it when signing.
#[derive(Debug, Clone, Copy)]
pub struct SigningParts<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
}

#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    signing_tag: String,
    tolerance_ms: u64,
}

impl SignatureVerifier {
    pub fn new(signing_tag: impl Into<String>, tolerance_ms: u64) -> Self {
        Self {
            signing_tag: signing_tag.into(),
            tolerance_ms,
        }
    }

    pub fn verify(
        &self,
        secret: &str,
        parts: &SigningParts<'_>,
        provided_signature: Option<&str>,
        signed_header_names: Option<&str>,
    ) -> std::result::Result<(), VerifyFailure> {
        self.verify_at(
            Utc::now(),
            secret,
            parts,
            provided_signature,
            signed_header_names,
        )
    }

    pub fn verify_at(
        &self,
        now: DateTime<Utc>,
        secret: &str,
        parts: &SigningParts<'_>,
        provided_signature: Option<&str>,
        signed_header_names: Option<&str>,
    ) -> std::result::Result<(), VerifyFailure> {
        let provided = provided_signature
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(VerifyFailure::MissingSignature)?;
        let signed_headers = signed_header_names
            .map(split_signed_header_names)
            .filter(|names| !names.is_empty())
            .ok_or(VerifyFailure::MissingSignedHeaders)?;
        let unsigned = unsigned_replay_guards(&signed_headers);
        if !unsigned.is_empty() {
            warn!(
                signed_headers = %signed_headers.join(";"),
                missing = %unsigned.join(","),
                "callback signature does not cover its replay guards"
            );
        }

        let date_raw = header_str(parts.headers, DATE_HEADER).ok_or(VerifyFailure::MissingDateHeader)?;
        let date = parse_http_date(date_raw).ok_or(VerifyFailure::InvalidDateHeader)?;
        let skew_ms = (now - date).num_milliseconds().unsigned_abs();
        if skew_ms > self.tolerance_ms {
            debug!(
                target: SIGNATURE_DIAGNOSTICS_TARGET,
                date = date_raw,
                skew_ms,
                tolerance_ms = self.tolerance_ms,
                "callback date outside tolerance window"
            );
            return Err(VerifyFailure::TimestampOutOfRange);
        }

        let signing_string =
            canonical_signing_string(&self.signing_tag, parts, date_raw, &signed_headers)?;
        let expected = compute_signature(secret, &signing_string).map_err(|err| {
            debug!(target: SIGNATURE_DIAGNOSTICS_TARGET, error = %err, "failed to compute expected signature");
            VerifyFailure::SignatureMismatch
        })?;

        if signatures_match(&expected, provided) {
            return Ok(());
        }

        debug!(
            target: SIGNATURE_DIAGNOSTICS_TARGET,
            signing_string = ?signing_string,
            expected = %expected,
            provided = %provided,
            "callback signature mismatch"
        );
        Err(VerifyFailure::SignatureMismatch)
    }
}

/// Compute the base64 signature a provider would send for `parts`. The `Date` header must
/// already be present in `parts.headers`.
pub fn sign(
    secret: &str,
    signing_tag: &str,
    parts: &SigningParts<'_>,
    signed_header_names: &[&str],
) -> Result<String> {
    let date = header_str(parts.headers, DATE_HEADER).context("request has no Date header")?;
    let names = signed_header_names
        .iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    let signing_string = canonical_signing_string(signing_tag, parts, date, &names)
        .map_err(|failure| anyhow!("cannot sign request: {failure}"))?;
    compute_signature(secret, &signing_string)
}

pub fn canonical_signing_string(
    signing_tag: &str,
    parts: &SigningParts<'_>,
    date: &str,
    signed_header_names: &[String],
) -> std::result::Result<String, VerifyFailure> {
    let mut out = format!(
        "{}\n{}\n{}\n{}\n{}\n",
        parts.method.to_ascii_uppercase(),
        parts.path,
        parts.query,
        signing_tag,
        date
    );

    for name in signed_header_names {
        let value = header_str(parts.headers, name)
            .ok_or_else(|| VerifyFailure::MissingHeader(name.to_ascii_lowercase()))?;
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out)
}

pub fn split_signed_header_names(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Replay guards the provider is expected to sign but left out of `X-HMAC-SIGNED-HEADERS`:
/// `date`, and any header carrying a nonce.
pub fn unsigned_replay_guards(signed_header_names: &[String]) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !signed_header_names
        .iter()
        .any(|name| name.eq_ignore_ascii_case(DATE_HEADER))
    {
        missing.push(DATE_HEADER);
    }
    if !signed_header_names
        .iter()
        .any(|name| name.to_ascii_lowercase().contains("nonce"))
    {
        missing.push("nonce");
    }
    missing
}

/// Parse an HTTP `Date` value. RFC 2822 (which covers IMF-fixdate) first, RFC 3339 as a
/// fallback for providers that send ISO timestamps.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn format_http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn compute_signature(secret: &str, signing_string: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("failed to initialize hmac"))?;
    mac.update(signing_string.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn signatures_match(expected_b64: &str, provided_b64: &str) -> bool {
    let Ok(expected) = STANDARD.decode(expected_b64) else {
        return false;
    };
    let Ok(provided) = STANDARD.decode(provided_b64) else {
        return false;
    };
    if expected.len() != provided.len() {
        return false;
    }
    bool::from(expected.ct_eq(&provided))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::{Duration, TimeZone};

    const SECRET: &str = "shared-secret";
    const SIGNED: &str = "Date;X-Nonce";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    fn headers_with_date(date: DateTime<Utc>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "date",
            HeaderValue::from_str(&format_http_date(date)).unwrap(),
        );
        headers.insert("x-nonce", HeaderValue::from_static("n-123"));
        headers
    }

    fn parts<'a>(headers: &'a HeaderMap, query: &'a str) -> SigningParts<'a> {
        SigningParts {
            method: "POST",
            path: "/webhooks/vidu",
            query,
            headers,
        }
    }

    fn sign_for(headers: &HeaderMap) -> String {
        sign(SECRET, "vidu", &parts(headers, ""), &["Date", "X-Nonce"]).unwrap()
    }

    #[test]
    fn signature_over_transmitted_request_is_valid() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now() - Duration::seconds(30));
        let signature = sign_for(&headers);

        let result = verifier.verify_at(
            now(),
            SECRET,
            &parts(&headers, ""),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn signature_over_different_date_is_mismatch() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let signed_headers = headers_with_date(now() - Duration::seconds(60));
        let signature = sign_for(&signed_headers);

        let presented = headers_with_date(now() - Duration::seconds(10));
        let result = verifier.verify_at(
            now(),
            SECRET,
            &parts(&presented, ""),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(result, Err(VerifyFailure::SignatureMismatch));
    }

    #[test]
    fn stale_date_is_rejected_even_with_valid_signature() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now() - Duration::milliseconds(300_001));
        let signature = sign_for(&headers);

        let result = verifier.verify_at(
            now(),
            SECRET,
            &parts(&headers, ""),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(result, Err(VerifyFailure::TimestampOutOfRange));
    }

    #[test]
    fn future_date_beyond_tolerance_is_rejected() {
        let verifier = SignatureVerifier::new("vidu", 1_000);
        let headers = headers_with_date(now() + Duration::seconds(5));
        let signature = sign_for(&headers);

        let result = verifier.verify_at(
            now(),
            SECRET,
            &parts(&headers, ""),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(result, Err(VerifyFailure::TimestampOutOfRange));
    }

    #[test]
    fn missing_inputs_report_specific_codes() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now());

        let missing_sig =
            verifier.verify_at(now(), SECRET, &parts(&headers, ""), None, Some(SIGNED));
        assert_eq!(missing_sig.unwrap_err().code(), "missing_signature");

        let missing_list =
            verifier.verify_at(now(), SECRET, &parts(&headers, ""), Some("abc"), Some(" ; "));
        assert_eq!(missing_list.unwrap_err().code(), "missing_signed_headers");

        let empty = HeaderMap::new();
        let missing_date =
            verifier.verify_at(now(), SECRET, &parts(&empty, ""), Some("abc"), Some(SIGNED));
        assert_eq!(missing_date.unwrap_err().code(), "missing_date_header");

        let mut bad_date = HeaderMap::new();
        bad_date.insert("date", HeaderValue::from_static("yesterday-ish"));
        let invalid =
            verifier.verify_at(now(), SECRET, &parts(&bad_date, ""), Some("abc"), Some(SIGNED));
        assert_eq!(invalid.unwrap_err().code(), "invalid_date_header");
    }

    #[test]
    fn listed_header_absent_from_request_is_reported_by_name() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now());

        let result = verifier.verify_at(
            now(),
            SECRET,
            &parts(&headers, ""),
            Some("abc"),
            Some("Date;X-Request-Nonce"),
        );
        assert_eq!(result.unwrap_err().code(), "missing_header_x-request-nonce");
    }

    #[test]
    fn tampered_query_or_wrong_secret_is_mismatch() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now());
        let signature = sign_for(&headers);

        let tampered = verifier.verify_at(
            now(),
            SECRET,
            &parts(&headers, "extra=1"),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(tampered, Err(VerifyFailure::SignatureMismatch));

        let wrong_secret = verifier.verify_at(
            now(),
            "other-secret",
            &parts(&headers, ""),
            Some(&signature),
            Some(SIGNED),
        );
        assert_eq!(wrong_secret, Err(VerifyFailure::SignatureMismatch));
    }

    #[test]
    fn malformed_or_short_signature_is_mismatch() {
        let verifier = SignatureVerifier::new("vidu", 300_000);
        let headers = headers_with_date(now());

        for provided in ["not base64 !!", "c2hvcnQ="] {
            let result = verifier.verify_at(
                now(),
                SECRET,
                &parts(&headers, ""),
                Some(provided),
                Some(SIGNED),
            );
            assert_eq!(result, Err(VerifyFailure::SignatureMismatch), "{provided}");
        }
    }

    #[test]
    fn signing_string_follows_listed_header_order() {
        let headers = headers_with_date(now());
        let date = format_http_date(now());
        let names = split_signed_header_names("X-Nonce; Date");

        let signing_string =
            canonical_signing_string("vidu", &parts(&headers, "a=1"), &date, &names).unwrap();
        assert_eq!(
            signing_string,
            format!("POST\n/webhooks/vidu\na=1\nvidu\n{date}\nX-Nonce:n-123\nDate:{date}\n")
        );
    }

    #[test]
    fn replay_guard_coverage_is_checked_case_insensitively() {
        let names = split_signed_header_names("DATE; X-Nonce");
        assert!(unsigned_replay_guards(&names).is_empty());

        let date_only = split_signed_header_names("Date");
        assert_eq!(unsigned_replay_guards(&date_only), vec!["nonce"]);

        let nonce_only = split_signed_header_names("x-request-nonce");
        assert_eq!(unsigned_replay_guards(&nonce_only), vec!["date"]);
    }

    #[test]
    fn signature_without_signed_date_still_verifies() {
        let headers = headers_with_date(now());
        let request = parts(&headers, "");
        let signature = sign(SECRET, "vidu", &request, &["X-Nonce"]).unwrap();
        let verifier = SignatureVerifier::new("vidu", 300_000);
        assert_eq!(
            verifier.verify_at(now(), SECRET, &request, Some(&signature), Some("X-Nonce")),
            Ok(())
        );
    }

    #[test]
    fn http_date_parses_imf_fixdate_and_rfc3339() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        assert_eq!(
            parse_http_date("Wed, 04 Mar 2026 12:00:00 GMT"),
            Some(expected)
        );
        assert_eq!(parse_http_date("2026-03-04T12:00:00Z"), Some(expected));
        assert_eq!(parse_http_date(""), None);
    }
}
