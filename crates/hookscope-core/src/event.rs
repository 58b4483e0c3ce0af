//! Hook event entity and its value objects.

use crate::HookCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Opaque unique identifier of a hook event.
///
/// Assigned by the publisher. The cache and the durable store key on it,
/// so redelivered events collapse into a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new EventId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id carries no characters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of the Claude Code session that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Severity
// ============================================================================

/// Ordered severity of an event: `Info < Warning < Error < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Stable numeric rank, used as the durable representation.
    pub fn rank(self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
            Self::Critical => 3,
        }
    }

    /// Inverse of [`Severity::rank`]; out-of-range values map to `None`.
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::Info),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            3 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Maps a publisher `core.status` string onto a severity.
    pub fn from_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "critical" | "fatal" => Self::Critical,
            "error" | "failed" | "failure" => Self::Error,
            "warning" | "warn" | "blocked" | "denied" => Self::Warning,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Hook Event
// ============================================================================

/// Well-known metadata keys.
pub mod metadata_keys {
    pub const SESSION_ID: &str = "session_id";
    pub const SEQUENCE: &str = "sequence";
    pub const EXECUTION_TIME_MS: &str = "execution_time_ms";
    pub const STATUS: &str = "status";
    pub const TOOL_NAME: &str = "tool_name";
    pub const PLATFORM: &str = "platform";
    pub const GIT_BRANCH: &str = "git_branch";
    pub const GIT_STATUS: &str = "git_status";
    pub const PROJECT_TYPE: &str = "project_type";
}

/// One observed step of a Claude Code run.
///
/// Immutable once decoded: every "change" produces a new value. The open
/// `metadata` map is kept for wire compatibility, while the keys the core
/// actually reads are projected into typed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    id: EventId,
    category: HookCategory,
    title: String,
    message: String,
    timestamp: DateTime<Utc>,
    source: String,
    severity: Severity,
    session_id: Option<SessionId>,
    sequence: Option<i64>,
    execution_time_ms: Option<u64>,
    metadata: BTreeMap<String, String>,
}

impl HookEvent {
    /// Starts building an event with the mandatory fields.
    pub fn builder(
        id: impl Into<EventId>,
        category: HookCategory,
        timestamp: DateTime<Utc>,
    ) -> HookEventBuilder {
        HookEventBuilder::new(id.into(), category, timestamp)
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn category(&self) -> &HookCategory {
        &self.category
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Origination timestamp (UTC).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Source label, e.g. the publishing platform.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn sequence(&self) -> Option<i64> {
        self.sequence
    }

    pub fn execution_time_ms(&self) -> Option<u64> {
        self.execution_time_ms
    }

    /// The full open metadata map, typed keys included.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Looks up a single metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns a copy whose timestamp is no later than `now`.
    ///
    /// Publisher clocks drift; the cache never holds future-dated events.
    #[must_use]
    pub fn clamped_to(self, now: DateTime<Utc>) -> Self {
        if self.timestamp <= now {
            return self;
        }
        Self {
            timestamp: now,
            ..self
        }
    }

    /// Age of the event relative to `now` (zero for future timestamps).
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        let age = now.signed_duration_since(self.timestamp);
        if age < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            age
        }
    }
}

/// Builder for [`HookEvent`].
///
/// Typed projections (session id, sequence, execution time) are mirrored
/// into the metadata map on `build()` so both views agree.
#[derive(Debug, Clone)]
pub struct HookEventBuilder {
    event: HookEvent,
}

impl HookEventBuilder {
    fn new(id: EventId, category: HookCategory, timestamp: DateTime<Utc>) -> Self {
        Self {
            event: HookEvent {
                id,
                title: category.to_string(),
                category,
                message: String::new(),
                timestamp,
                source: String::from("claude-code"),
                severity: Severity::Info,
                session_id: None,
                sequence: None,
                execution_time_ms: None,
                metadata: BTreeMap::new(),
            },
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.event.title = title.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = message.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.event.source = source.into();
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.event.severity = severity;
        self
    }

    pub fn session_id(mut self, session_id: Option<SessionId>) -> Self {
        self.event.session_id = session_id;
        self
    }

    pub fn sequence(mut self, sequence: Option<i64>) -> Self {
        self.event.sequence = sequence;
        self
    }

    pub fn execution_time_ms(mut self, execution_time_ms: Option<u64>) -> Self {
        self.event.execution_time_ms = execution_time_ms;
        self
    }

    /// Adds one metadata entry. Typed keys are re-projected on `build()`.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.event.metadata.insert(key.into(), value.into());
        self
    }

    /// Finalizes the event.
    ///
    /// Typed fields win over the same keys in the map; typed fields left
    /// unset are recovered from the map when it carries a parseable value.
    pub fn build(self) -> HookEvent {
        let mut event = self.event;

        if event.session_id.is_none() {
            event.session_id = event
                .metadata
                .get(metadata_keys::SESSION_ID)
                .filter(|s| !s.is_empty())
                .map(|s| SessionId::new(s.as_str()));
        }
        if event.sequence.is_none() {
            event.sequence = event
                .metadata
                .get(metadata_keys::SEQUENCE)
                .and_then(|s| s.parse().ok());
        }
        if event.execution_time_ms.is_none() {
            event.execution_time_ms = event
                .metadata
                .get(metadata_keys::EXECUTION_TIME_MS)
                .and_then(|s| s.parse().ok());
        }

        if let Some(session_id) = &event.session_id {
            event
                .metadata
                .insert(metadata_keys::SESSION_ID.to_string(), session_id.to_string());
        }
        if let Some(sequence) = event.sequence {
            event
                .metadata
                .insert(metadata_keys::SEQUENCE.to_string(), sequence.to_string());
        }
        if let Some(ms) = event.execution_time_ms {
            event
                .metadata
                .insert(metadata_keys::EXECUTION_TIME_MS.to_string(), ms.to_string());
        }

        event
    }
}
