use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::tension::{Thresholds, classify_zone};

// ── Hook protocol ───────────────────────────────────────────────

/// Host hook events. PascalCase host names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    #[serde(alias = "PreToolUse")]
    PreToolUse,
    #[serde(alias = "PostToolUse")]
    PostToolUse,
    /// Assistant turn finished; only the stuck check runs.
    #[serde(alias = "PostResponse")]
    PostResponse,
    #[serde(alias = "SessionStart")]
    SessionStart,
    /// Session finished; the recorder summarizes it.
    #[serde(alias = "SessionEnd")]
    SessionEnd,
    /// Any event the guard has no policy for.
    #[default]
    #[serde(other)]
    Other,
}

/// One hook invocation as sent by the host on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookContext {
    #[serde(default, alias = "hook_event_name")]
    pub event: HookEvent,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    /// Hosts send either plain text or a structured object here.
    #[serde(default, alias = "tool_response", deserialize_with = "text_or_json")]
    pub tool_result: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "working_directory")]
    pub cwd: Option<String>,
}

impl HookContext {
    pub fn new(event: HookEvent) -> Self {
        Self {
            event,
            ..Self::default()
        }
    }

    /// Session scope for memory lookups; `None` when the host sent none.
    pub fn session(&self) -> Option<&str> {
        Some(self.session_id.as_str()).filter(|s| !s.is_empty())
    }
}

fn text_or_json<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Decision returned to the host on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub allow: bool,
    pub block: bool,
    pub message: Option<String>,
    pub additional_context: Option<String>,
    /// Whether this step is worth remembering. Internal, never serialized.
    #[serde(skip)]
    pub record_node: bool,
}

impl Default for HookResult {
    fn default() -> Self {
        Self::allow()
    }
}

impl HookResult {
    /// Plain pass-through.
    pub fn allow() -> Self {
        Self {
            allow: true,
            block: false,
            message: None,
            additional_context: None,
            record_node: false,
        }
    }

    /// Allow with an informational message.
    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::allow()
        }
    }

    /// Refuse the tool call.
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allow: false,
            block: true,
            message: Some(message.into()),
            additional_context: None,
            record_node: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.additional_context = Some(context.into());
        self
    }

    pub fn recording(mut self) -> Self {
        self.record_node = true;
        self
    }
}

// ── Semantic memory ─────────────────────────────────────────────

/// Direction of reasoning at a recorded step, inferred from the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReasoningDirection {
    /// Moving toward a conclusion.
    #[default]
    #[serde(rename = "->")]
    Convergent,
    /// Backtracking or exploring alternatives.
    #[serde(rename = "<-")]
    Divergent,
    /// Iterating on the same step.
    #[serde(rename = "<>")]
    Recursive,
}

impl ReasoningDirection {
    /// No exit code or 0 converges, 1 diverges, anything else recurses.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            None | Some(0) => Self::Convergent,
            Some(1) => Self::Divergent,
            Some(_) => Self::Recursive,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Convergent => "->",
            Self::Divergent => "<-",
            Self::Recursive => "<>",
        }
    }
}

impl fmt::Display for ReasoningDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Execution details kept alongside a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetadata {
    pub exit_code: Option<i32>,
    pub working_directory: Option<String>,
}

/// A recorded step of agent activity. Immutable once appended.
///
/// Convergent steps chain through `parent_id`, so a session reads as a tree
/// whose trunk is the work that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticNode {
    pub id: Uuid,
    #[serde(default)]
    pub session_id: String,
    pub topic: String,
    #[serde(default)]
    pub insight: String,
    /// ΔS of this step against the session trajectory before it.
    #[serde(default)]
    pub delta_s: f32,
    #[serde(default)]
    pub lambda_observe: ReasoningDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub source_tool: String,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl SemanticNode {
    pub fn new(
        session_id: impl Into<String>,
        topic: impl Into<String>,
        source_tool: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            topic: topic.into(),
            insight: String::new(),
            delta_s: 0.0,
            lambda_observe: ReasoningDirection::default(),
            parent_id: None,
            embedding: None,
            created_at: Utc::now(),
            source_tool: source_tool.into(),
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_insight(mut self, insight: impl Into<String>) -> Self {
        self.insight = insight.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_delta_s(mut self, delta_s: f32) -> Self {
        self.delta_s = delta_s;
        self
    }

    pub fn with_direction(mut self, direction: ReasoningDirection) -> Self {
        self.lambda_observe = direction;
        self
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn zone(&self, thresholds: &Thresholds) -> Zone {
        classify_zone(self.delta_s, thresholds)
    }
}

// ── Zones ───────────────────────────────────────────────────────

/// Knowledge boundary zone derived from ΔS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Well-known territory.
    Safe,
    /// Moving between concepts.
    Transitional,
    /// Approaching unknown territory.
    Risk,
    /// High fabrication risk.
    Danger,
}

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::Safe, Zone::Transitional, Zone::Risk, Zone::Danger];
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Safe => write!(f, "safe"),
            Zone::Transitional => write!(f, "transitional"),
            Zone::Risk => write!(f, "risk"),
            Zone::Danger => write!(f, "danger"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snake_case_event() {
        let ctx: HookContext = serde_json::from_str(
            r#"{"event":"pre_tool_use","tool_name":"Read","session_id":"s1"}"#,
        )
        .unwrap();
        assert_eq!(ctx.event, HookEvent::PreToolUse);
        assert_eq!(ctx.tool_name.as_deref(), Some("Read"));
        assert_eq!(ctx.session(), Some("s1"));
    }

    #[test]
    fn parses_host_aliases() {
        let ctx: HookContext = serde_json::from_str(
            r#"{"hook_event_name":"PostToolUse","tool_response":{"ok":true},"cwd":"/p"}"#,
        )
        .unwrap();
        assert_eq!(ctx.event, HookEvent::PostToolUse);
        assert_eq!(ctx.tool_result.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(ctx.cwd.as_deref(), Some("/p"));
        assert_eq!(ctx.session(), None);
    }

    #[test]
    fn unknown_event_is_other() {
        let ctx: HookContext = serde_json::from_str(r#"{"event":"Notification"}"#).unwrap();
        assert_eq!(ctx.event, HookEvent::Other);
    }

    #[test]
    fn parses_session_events() {
        let start: HookContext =
            serde_json::from_str(r#"{"hook_event_name":"SessionStart","session_id":"s"}"#).unwrap();
        assert_eq!(start.event, HookEvent::SessionStart);
        let end: HookContext = serde_json::from_str(r#"{"event":"session_end"}"#).unwrap();
        assert_eq!(end.event, HookEvent::SessionEnd);
    }

    #[test]
    fn direction_follows_exit_code() {
        assert_eq!(ReasoningDirection::from_exit_code(None), ReasoningDirection::Convergent);
        assert_eq!(ReasoningDirection::from_exit_code(Some(0)), ReasoningDirection::Convergent);
        assert_eq!(ReasoningDirection::from_exit_code(Some(1)), ReasoningDirection::Divergent);
        assert_eq!(ReasoningDirection::from_exit_code(Some(127)), ReasoningDirection::Recursive);
        assert_eq!(
            serde_json::to_value(ReasoningDirection::Divergent).unwrap(),
            serde_json::json!("<-")
        );
    }

    #[test]
    fn records_without_new_fields_still_parse() {
        let node: SemanticNode = serde_json::from_str(
            r#"{"id":"6f9619ff-8b86-d011-b42d-00c04fc964ff","topic":"Read: a.rs",
                "created_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(node.delta_s, 0.0);
        assert_eq!(node.lambda_observe, ReasoningDirection::Convergent);
        assert_eq!(node.parent_id, None);
        assert_eq!(node.metadata, NodeMetadata::default());
        assert_eq!(node.zone(&Thresholds::default()), Zone::Safe);
    }

    #[test]
    fn result_serializes_without_record_flag() {
        let json = serde_json::to_value(HookResult::notice("hi").recording()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "allow": true,
                "block": false,
                "message": "hi",
                "additional_context": null
            })
        );
    }

    #[test]
    fn deny_blocks() {
        let r = HookResult::deny("stop");
        assert!(!r.allow);
        assert!(r.block);
    }

    #[test]
    fn node_omits_missing_embedding() {
        let node = SemanticNode::new("s", "Read: a.rs", "Read");
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("embedding").is_none());
        let back: SemanticNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn zone_display() {
        assert_eq!(Zone::Transitional.to_string(), "transitional");
    }
}
