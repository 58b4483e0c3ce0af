//! Parsing the hook event JSON published on the broker topic.
//!
//! Every message is an independent JSON object. Unknown fields are ignored
//! and optional sections default to absent, so older and newer publishers
//! decode through the same path.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use hookscope_core::{
    metadata_keys, DomainError, EventId, HookCategory, HookEvent, SessionId, Severity,
};
use serde::Deserialize;
use thiserror::Error;

/// Maximum characters kept when logging an undecodable payload.
pub const PREVIEW_CHARS: usize = 200;

/// Maximum characters of free text copied into an event message.
const MESSAGE_CHARS: usize = 500;

/// Errors raised while decoding one message.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload was not valid JSON or did not match the schema
    #[error("Invalid hook event JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON was well-formed but a field failed validation
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Raw hook event JSON structure from the publisher.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHookMessage {
    pub id: String,
    pub hook_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub core: Option<RawCore>,
    #[serde(default)]
    pub payload: Option<RawPayload>,
    #[serde(default)]
    pub context: Option<RawContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCore {
    #[serde(default)]
    pub status: Option<String>,
    /// Some publishers emit fractional milliseconds.
    #[serde(default)]
    pub execution_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_response: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    /// Everything else the publisher attached.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawContext {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_status: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
}

/// Decodes one broker payload into a [`HookEvent`].
///
/// `now` is the receipt time; future-dated events are clamped to it.
pub fn decode_hook_event(payload: &[u8], now: DateTime<Utc>) -> Result<HookEvent, DecodeError> {
    let raw: RawHookMessage = serde_json::from_slice(payload)?;
    Ok(raw.to_hook_event(now)?)
}

/// Returns at most [`PREVIEW_CHARS`] characters of a payload for logging.
pub fn preview(payload: &[u8]) -> String {
    truncate_chars(&String::from_utf8_lossy(payload), PREVIEW_CHARS)
}

impl RawHookMessage {
    /// Converts the raw JSON data into a domain event.
    ///
    /// # Errors
    ///
    /// - `DomainError::MissingField` if `id` or `hook_type` is empty
    /// - `DomainError::ParseError` if `timestamp` is not ISO-8601
    pub fn to_hook_event(&self, now: DateTime<Utc>) -> Result<HookEvent, DomainError> {
        if self.id.trim().is_empty() {
            return Err(DomainError::missing("id"));
        }
        if self.hook_type.trim().is_empty() {
            return Err(DomainError::missing("hook_type"));
        }
        let timestamp = parse_timestamp(&self.timestamp)?;

        let category = HookCategory::from_hook_type(&self.hook_type);
        let core = self.core.clone().unwrap_or_default();
        let payload = self.payload.clone().unwrap_or_default();
        let context = self.context.clone().unwrap_or_default();

        let severity = derive_severity(&core, &payload);
        let execution_time_ms = core
            .execution_time_ms
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms.round() as u64);
        let session_id = self
            .session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(SessionId::new);

        let mut builder = HookEvent::builder(EventId::new(self.id.as_str()), category.clone(), timestamp)
            .title(derive_title(&category, &payload, severity))
            .message(derive_message(&category, &payload, session_id.as_ref(), &context))
            .source(context.platform.clone().unwrap_or_else(|| "claude-code".to_string()))
            .severity(severity)
            .session_id(session_id)
            .sequence(self.sequence)
            .execution_time_ms(execution_time_ms);

        let optional = [
            (metadata_keys::STATUS, core.status.as_deref()),
            (metadata_keys::TOOL_NAME, payload.tool_name.as_deref()),
            (metadata_keys::PLATFORM, context.platform.as_deref()),
            (metadata_keys::GIT_BRANCH, context.git_branch.as_deref()),
            (metadata_keys::GIT_STATUS, context.git_status.as_deref()),
            (metadata_keys::PROJECT_TYPE, context.project_type.as_deref()),
        ];
        for (key, value) in optional {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                builder = builder.metadata(key, value);
            }
        }
        for (key, value) in &payload.extra {
            if let Some(scalar) = scalar_to_string(value) {
                builder = builder.metadata(format!("payload.{key}"), scalar);
            }
        }

        Ok(builder.build().clamped_to(now))
    }
}

/// Parses ISO-8601, accepting a missing offset as UTC.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DomainError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DomainError::parse("timestamp", format!("{value:?}: {e}")))
}

fn derive_severity(core: &RawCore, payload: &RawPayload) -> Severity {
    let from_status = core
        .status
        .as_deref()
        .map(Severity::from_status)
        .unwrap_or_default();

    let tool_failed = payload
        .tool_response
        .as_ref()
        .map(|response| {
            response.get("is_error").and_then(|v| v.as_bool()) == Some(true)
                || response.get("error").is_some_and(|v| !v.is_null())
        })
        .unwrap_or(false);

    if tool_failed {
        from_status.max(Severity::Error)
    } else {
        from_status
    }
}

fn derive_title(category: &HookCategory, payload: &RawPayload, severity: Severity) -> String {
    let tool = payload.tool_name.as_deref().unwrap_or("tool");
    match category {
        HookCategory::SessionStart => "Session Started".to_string(),
        HookCategory::UserPrompt => "Prompt Submitted".to_string(),
        HookCategory::PreTool => format!("Running {tool}"),
        HookCategory::PostTool if severity >= Severity::Error => format!("{tool} Failed"),
        HookCategory::PostTool => format!("{tool} Completed"),
        HookCategory::Notification => "Notification".to_string(),
        HookCategory::Stop => "Session Stopped".to_string(),
        HookCategory::SubAgentStop => "Sub-agent Stopped".to_string(),
        HookCategory::PreCompact => "Compacting Context".to_string(),
        HookCategory::Legacy(name) => name.clone(),
    }
}

fn derive_message(
    category: &HookCategory,
    payload: &RawPayload,
    session_id: Option<&SessionId>,
    context: &RawContext,
) -> String {
    if let Some(message) = payload.message.as_deref().filter(|m| !m.is_empty()) {
        return truncate_chars(message, MESSAGE_CHARS);
    }

    let text = match category {
        HookCategory::UserPrompt => payload.prompt.clone().unwrap_or_default(),
        HookCategory::PreTool | HookCategory::PostTool => payload
            .tool_input
            .as_ref()
            .and_then(summarize_tool_input)
            .unwrap_or_default(),
        HookCategory::SessionStart => {
            let session = session_id.map(SessionId::short).unwrap_or("unknown");
            match (&context.project_type, &context.git_branch) {
                (Some(project), Some(branch)) => format!("{session} ({project} on {branch})"),
                (Some(project), None) => format!("{session} ({project})"),
                (None, Some(branch)) => format!("{session} (on {branch})"),
                (None, None) => session.to_string(),
            }
        }
        _ => String::new(),
    };
    truncate_chars(&text, MESSAGE_CHARS)
}

/// Picks the most descriptive argument out of a tool input object.
fn summarize_tool_input(input: &serde_json::Value) -> Option<String> {
    const KEYS: [&str; 6] = ["command", "file_path", "pattern", "url", "query", "description"];
    KEYS.iter()
        .find_map(|key| input.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", text.get(..idx).unwrap_or(text)),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn test_decode_full_post_tool_event() {
        let json = r#"{
            "id": "evt-100",
            "hook_type": "post_tool_use",
            "timestamp": "2025-01-15T11:59:30Z",
            "session_id": "8e11bfb5-7dc2-432b-9206-928fa5c35731",
            "sequence": 12,
            "core": { "status": "success", "execution_time_ms": 84.6 },
            "payload": {
                "tool_name": "Bash",
                "tool_input": { "command": "cargo fmt" },
                "tool_response": { "stdout": "" },
                "cwd": "/repo"
            },
            "context": { "platform": "darwin", "git_branch": "main" },
            "unexpected": true
        }"#;

        let event = decode_hook_event(json.as_bytes(), now()).unwrap();

        assert_eq!(event.id().as_str(), "evt-100");
        assert_eq!(event.category(), &HookCategory::PostTool);
        assert_eq!(event.title(), "Bash Completed");
        assert_eq!(event.message(), "cargo fmt");
        assert_eq!(event.source(), "darwin");
        assert_eq!(event.severity(), Severity::Info);
        assert_eq!(event.sequence(), Some(12));
        assert_eq!(event.execution_time_ms(), Some(85));
        assert_eq!(
            event.session_id().map(SessionId::as_str),
            Some("8e11bfb5-7dc2-432b-9206-928fa5c35731")
        );
        assert_eq!(event.metadata_value("git_branch"), Some("main"));
        assert_eq!(event.metadata_value("tool_name"), Some("Bash"));
        assert_eq!(event.metadata_value("payload.cwd"), Some("/repo"));
    }

    #[test]
    fn test_decode_minimal_event() {
        let json = r#"{"id":"a","hook_type":"stop_hook","timestamp":"2025-01-15T11:00:00Z"}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(event.category(), &HookCategory::Stop);
        assert_eq!(event.session_id(), None);
        assert_eq!(event.source(), "claude-code");
        assert!(event.message().is_empty());
    }

    #[test]
    fn test_decode_unknown_hook_type_goes_to_legacy() {
        let json = r#"{"id":"b","hook_type":"PermissionRequest","timestamp":"2025-01-15T11:00:00Z",
                       "payload":{"message":"needs approval"}}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(
            event.category(),
            &HookCategory::Legacy("PermissionRequest".to_string())
        );
        assert_eq!(event.title(), "PermissionRequest");
        assert_eq!(event.message(), "needs approval");
    }

    #[test]
    fn test_failed_tool_response_raises_severity() {
        let json = r#"{"id":"c","hook_type":"post_tool_use","timestamp":"2025-01-15T11:00:00Z",
                       "payload":{"tool_name":"Edit","tool_response":{"is_error":true}}}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(event.severity(), Severity::Error);
        assert_eq!(event.title(), "Edit Failed");
    }

    #[test]
    fn test_future_timestamp_is_clamped() {
        let json = r#"{"id":"d","hook_type":"notification","timestamp":"2030-01-01T00:00:00Z"}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(event.timestamp(), now());
    }

    #[test]
    fn test_timestamp_without_offset_is_utc() {
        let json = r#"{"id":"e","hook_type":"pre_compact","timestamp":"2025-01-15T10:00:00.250"}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(
            event.timestamp(),
            Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).single().unwrap()
                + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let json = r#"{"id":"f","hook_type":"stop_hook","timestamp":"yesterday"}"#;
        let err = decode_hook_event(json.as_bytes(), now()).unwrap_err();
        assert!(matches!(err, DecodeError::Domain(DomainError::ParseError { .. })));
    }

    #[test]
    fn test_empty_id_rejected() {
        let json = r#"{"id":" ","hook_type":"stop_hook","timestamp":"2025-01-15T11:00:00Z"}"#;
        let err = decode_hook_event(json.as_bytes(), now()).unwrap_err();
        assert!(matches!(err, DecodeError::Domain(DomainError::MissingField { .. })));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = decode_hook_event(b"{not json", now()).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(PREVIEW_CHARS + 50);
        let shown = preview(long.as_bytes());
        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 1);
        assert!(shown.ends_with('…'));
        assert_eq!(preview(b"short"), "short");
    }

    #[test]
    fn test_session_start_message_includes_context() {
        let json = r#"{"id":"g","hook_type":"session_start","timestamp":"2025-01-15T11:00:00Z",
                       "session_id":"abcdef123456",
                       "context":{"platform":"linux","project_type":"rust","git_branch":"dev"}}"#;
        let event = decode_hook_event(json.as_bytes(), now()).unwrap();
        assert_eq!(event.title(), "Session Started");
        assert_eq!(event.message(), "abcdef12 (rust on dev)");
    }
}
