//! Hook categories published by the Claude Code hook scripts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a hook event.
///
/// The closed set mirrors the `hook_type` values the publisher emits.
/// Anything else lands in [`HookCategory::Legacy`] so older publishers
/// keep flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookCategory {
    /// A new Claude Code session started
    SessionStart,

    /// The user submitted a prompt
    UserPrompt,

    /// Before a tool is executed
    PreTool,

    /// After a tool completes execution
    PostTool,

    /// Notification event (informational)
    Notification,

    /// The main agent stopped
    Stop,

    /// A sub-agent stopped
    SubAgentStop,

    /// Context compaction is about to run
    PreCompact,

    /// Free-form bucket for unrecognized hook types
    Legacy(String),
}

impl HookCategory {
    /// Parses from the wire `hook_type` string.
    ///
    /// Never fails: unknown names become [`HookCategory::Legacy`].
    pub fn from_hook_type(name: &str) -> Self {
        match name {
            "session_start" => Self::SessionStart,
            "user_prompt_submit" => Self::UserPrompt,
            "pre_tool_use" => Self::PreTool,
            "post_tool_use" => Self::PostTool,
            "notification" => Self::Notification,
            "stop_hook" => Self::Stop,
            "sub_agent_stop_hook" => Self::SubAgentStop,
            "pre_compact" => Self::PreCompact,
            other => Self::Legacy(other.to_string()),
        }
    }

    /// Returns the wire `hook_type` string for this category.
    pub fn as_hook_type(&self) -> &str {
        match self {
            Self::SessionStart => "session_start",
            Self::UserPrompt => "user_prompt_submit",
            Self::PreTool => "pre_tool_use",
            Self::PostTool => "post_tool_use",
            Self::Notification => "notification",
            Self::Stop => "stop_hook",
            Self::SubAgentStop => "sub_agent_stop_hook",
            Self::PreCompact => "pre_compact",
            Self::Legacy(name) => name,
        }
    }

    /// Returns true for events bracketing a tool invocation.
    pub fn is_tool_event(&self) -> bool {
        matches!(self, Self::PreTool | Self::PostTool)
    }

    /// Returns true for events that end an agent run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::SubAgentStop)
    }

    /// Returns true if this came from an unrecognized hook type.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

impl fmt::Display for HookCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStart => write!(f, "Session Start"),
            Self::UserPrompt => write!(f, "User Prompt"),
            Self::PreTool => write!(f, "Pre Tool"),
            Self::PostTool => write!(f, "Post Tool"),
            Self::Notification => write!(f, "Notification"),
            Self::Stop => write!(f, "Stop"),
            Self::SubAgentStop => write!(f, "Sub-agent Stop"),
            Self::PreCompact => write!(f, "Pre Compact"),
            Self::Legacy(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_type_parsing() {
        assert_eq!(
            HookCategory::from_hook_type("post_tool_use"),
            HookCategory::PostTool
        );
        assert_eq!(
            HookCategory::from_hook_type("sub_agent_stop_hook"),
            HookCategory::SubAgentStop
        );
        assert_eq!(
            HookCategory::from_hook_type("PreToolUse"),
            HookCategory::Legacy("PreToolUse".to_string())
        );
    }

    #[test]
    fn test_hook_type_name_is_stable() {
        for name in [
            "session_start",
            "user_prompt_submit",
            "pre_tool_use",
            "post_tool_use",
            "notification",
            "stop_hook",
            "sub_agent_stop_hook",
            "pre_compact",
            "custom_thing",
        ] {
            assert_eq!(HookCategory::from_hook_type(name).as_hook_type(), name);
        }
    }

    #[test]
    fn test_hook_category_classification() {
        assert!(HookCategory::PreTool.is_tool_event());
        assert!(HookCategory::PostTool.is_tool_event());
        assert!(!HookCategory::Stop.is_tool_event());
        assert!(HookCategory::SubAgentStop.is_terminal());
        assert!(HookCategory::Legacy("x".into()).is_legacy());
    }
}
