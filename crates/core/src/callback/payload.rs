use std::fmt;

use serde::Deserialize;
use serde_json::Value;

const SUCCESS_STATES: [&str; 5] = ["succeed", "success", "succeeded", "completed", "complete"];
const FAILURE_STATES: [&str; 3] = ["failed", "failure", "error"];

/// Provider-reported state folded into the three outcomes the pipeline acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    Success,
    Failure,
    Interim,
}

impl CallbackState {
    pub fn normalize(raw: &str) -> Self {
        let state = raw.trim().to_ascii_lowercase();
        if SUCCESS_STATES.contains(&state.as_str()) {
            CallbackState::Success
        } else if FAILURE_STATES.contains(&state.as_str()) {
            CallbackState::Failure
        } else {
            CallbackState::Interim
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TaskIdValue {
    Text(String),
    Number(serde_json::Number),
}

impl TaskIdValue {
    fn into_id(self) -> Option<String> {
        let id = match self {
            TaskIdValue::Text(text) => text.trim().to_string(),
            TaskIdValue::Number(number) => number.to_string(),
        };
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Creation {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCallbackBody {
    task_id: Option<TaskIdValue>,
    id: Option<TaskIdValue>,
    state: Option<String>,
    status: Option<String>,
    #[serde(default)]
    creations: Option<Vec<Creation>>,
    err_code: Option<Value>,
    error: Option<Value>,
    credits: Option<Value>,
    bgm: Option<Value>,
    off_peak: Option<Value>,
}

/// A validated provider callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackEvent {
    pub task_id: String,
    pub raw_state: String,
    pub state: CallbackState,
    pub creations: Vec<Creation>,
    pub error_code: Option<String>,
    pub credits: Option<Value>,
    pub bgm: Option<Value>,
    pub off_peak: Option<Value>,
}

impl CallbackEvent {
    /// First creation carrying a non-blank URL; metadata-only entries are skipped.
    pub fn first_media_url(&self) -> Option<&str> {
        self.creations
            .iter()
            .filter_map(|creation| creation.url.as_deref())
            .map(str::trim)
            .find(|url| !url.is_empty())
    }

    pub fn failure_message(&self) -> String {
        self.error_code
            .clone()
            .unwrap_or_else(|| format!("video generation failed (state: {})", self.raw_state))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    InvalidJson(String),
    MissingTaskId,
    MissingState,
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::InvalidJson(err) => write!(f, "invalid callback payload: {err}"),
            PayloadError::MissingTaskId => f.write_str("callback payload has no task_id or id"),
            PayloadError::MissingState => f.write_str("callback payload has no state or status"),
        }
    }
}

impl std::error::Error for PayloadError {}

pub fn parse_callback(body: &[u8]) -> Result<CallbackEvent, PayloadError> {
    let raw: RawCallbackBody =
        serde_json::from_slice(body).map_err(|err| PayloadError::InvalidJson(err.to_string()))?;

    let task_id = raw
        .task_id
        .and_then(TaskIdValue::into_id)
        .or_else(|| raw.id.and_then(TaskIdValue::into_id))
        .ok_or(PayloadError::MissingTaskId)?;

    let raw_state = [raw.state, raw.status]
        .into_iter()
        .flatten()
        .map(|state| state.trim().to_string())
        .find(|state| !state.is_empty())
        .ok_or(PayloadError::MissingState)?;

    let error_code = [raw.err_code, raw.error]
        .into_iter()
        .flatten()
        .find_map(error_text);

    Ok(CallbackEvent {
        task_id,
        state: CallbackState::normalize(&raw_state),
        raw_state,
        creations: raw.creations.unwrap_or_default(),
        error_code,
        credits: raw.credits,
        bgm: raw.bgm,
        off_peak: raw.off_peak,
    })
}

fn error_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Object(ref map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_normalization_is_case_insensitive() {
        for raw in ["succeed", "SUCCESS", " Completed ", "succeeded"] {
            assert_eq!(CallbackState::normalize(raw), CallbackState::Success, "{raw}");
        }
        for raw in ["failed", "Error", "FAILURE"] {
            assert_eq!(CallbackState::normalize(raw), CallbackState::Failure, "{raw}");
        }
        for raw in ["processing", "queueing", "created", ""] {
            assert_eq!(CallbackState::normalize(raw), CallbackState::Interim, "{raw}");
        }
    }

    #[test]
    fn id_and_status_aliases_are_accepted() {
        let event = parse_callback(br#"{"id": 8812, "status": "processing"}"#).unwrap();
        assert_eq!(event.task_id, "8812");
        assert_eq!(event.raw_state, "processing");
        assert_eq!(event.state, CallbackState::Interim);
    }

    #[test]
    fn required_fields_are_enforced() {
        assert_eq!(
            parse_callback(br#"{"state": "succeed"}"#),
            Err(PayloadError::MissingTaskId)
        );
        assert_eq!(
            parse_callback(br#"{"task_id": "t1"}"#),
            Err(PayloadError::MissingState)
        );
        assert!(matches!(
            parse_callback(b"not json"),
            Err(PayloadError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_callback(br#"{"task_id": "t1", "state": "succeed", "creations": "x"}"#),
            Err(PayloadError::InvalidJson(_))
        ));
    }

    #[test]
    fn first_media_url_skips_metadata_only_creations() {
        let event = parse_callback(
            br#"{"task_id":"t1","state":"succeed","creations":[
                {"id":"c0","cover_url":"https://host/cover.jpg"},
                {"id":"c1","url":"  "},
                {"id":"c2","url":"https://host/video.mp4"}
            ],"credits":4,"off_peak":false}"#,
        )
        .unwrap();
        assert_eq!(event.first_media_url(), Some("https://host/video.mp4"));
        assert_eq!(event.credits, Some(serde_json::json!(4)));

        let empty = parse_callback(br#"{"task_id":"t1","state":"succeed","creations":[]}"#)
            .unwrap();
        assert_eq!(empty.first_media_url(), None);
    }

    #[test]
    fn failure_message_prefers_err_code_then_error() {
        let coded =
            parse_callback(br#"{"task_id":"t1","state":"failed","err_code":"E1","error":"x"}"#)
                .unwrap();
        assert_eq!(coded.failure_message(), "E1");

        let error_only =
            parse_callback(br#"{"task_id":"t1","state":"failed","error":"quota exceeded"}"#)
                .unwrap();
        assert_eq!(error_only.failure_message(), "quota exceeded");

        let bare = parse_callback(br#"{"task_id":"t1","state":"failed"}"#).unwrap();
        assert_eq!(
            bare.failure_message(),
            "video generation failed (state: failed)"
        );
    }
}
