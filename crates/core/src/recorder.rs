//! Post-action recording: every tool call becomes a node in semantic memory.

use std::sync::Arc;

use driftguard_embed::Embedder;
use serde::Serialize;
use serde_json::Value;

use crate::error::GuardResult;
use crate::memory::{SemanticMemory, ZoneSummary};
use crate::tension::{Thresholds, compute_trajectory, semantic_tension};
use crate::types::{HookContext, HookEvent, NodeMetadata, ReasoningDirection, SemanticNode, Zone};

const MAX_INSIGHT_CHARS: usize = 200;
const MAX_TOPIC_ARG_CHARS: usize = 50;
const MIN_INSIGHT_CHARS: usize = 10;
const DEFAULT_TRAJECTORY_WINDOW: usize = 5;

const TRIVIAL_TOOLS: &[&str] = &["echo", "pwd", "whoami"];

/// Totals for one finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub node_count: usize,
    pub zone_summary: ZoneSummary,
}

impl SessionSummary {
    pub fn describe(&self) -> String {
        let zones: Vec<String> = Zone::ALL
            .iter()
            .map(|z| format!("{z} {}", self.zone_summary.get(*z)))
            .collect();
        format!(
            "Session {}: {} nodes ({})",
            self.session_id,
            self.node_count,
            zones.join(", ")
        )
    }
}

pub struct Recorder {
    memory: SemanticMemory,
    embedder: Arc<dyn Embedder>,
    skip_trivial: bool,
    trajectory_window: usize,
    thresholds: Thresholds,
}

impl Recorder {
    pub fn new(memory: SemanticMemory, embedder: Arc<dyn Embedder>, skip_trivial: bool) -> Self {
        Self {
            memory,
            embedder,
            skip_trivial,
            trajectory_window: DEFAULT_TRAJECTORY_WINDOW,
            thresholds: Thresholds::default(),
        }
    }

    /// Recent nodes averaged into the trajectory a new node is measured against.
    pub fn with_trajectory_window(mut self, window: usize) -> Self {
        self.trajectory_window = window.max(1);
        self
    }

    /// Zone boundaries used in session summaries.
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Record a finished tool call. Returns the stored node, or `None` when
    /// the event was skipped or could not be persisted. Never fails.
    pub async fn record(&self, ctx: &HookContext) -> Option<SemanticNode> {
        if ctx.event != HookEvent::PostToolUse {
            return None;
        }

        let topic = extract_topic(ctx);
        let insight = extract_insight(ctx);
        if self.skip_trivial && is_trivial(ctx, &insight) {
            tracing::debug!(topic = %topic, "skipping trivial event");
            return None;
        }

        let tool = ctx.tool_name.as_deref().unwrap_or("unknown");
        let parent = self
            .memory
            .last_convergent(&ctx.session_id)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "parent lookup failed, recording a root node");
                None
            });
        let mut node = SemanticNode::new(ctx.session_id.clone(), topic, tool)
            .with_insight(insight)
            .with_direction(ReasoningDirection::from_exit_code(ctx.exit_code))
            .with_parent(parent)
            .with_metadata(NodeMetadata {
                exit_code: ctx.exit_code,
                working_directory: ctx.cwd.clone(),
            });

        let text = format!("{}: {}", node.topic, node.insight);
        match self.embedder.embed(&text).await {
            Ok(embedding) => {
                node.delta_s = self.tension(ctx.session(), &embedding);
                node = node.with_embedding(embedding);
            }
            Err(e) => {
                tracing::warn!(error = %e, topic = %node.topic, "embedding failed, storing node without vector");
            }
        }

        if let Err(e) = self.memory.append(&node) {
            tracing::warn!(error = %e, topic = %node.topic, "failed to record node");
            return None;
        }
        if let Err(e) = self.memory.enforce_retention() {
            tracing::warn!(error = %e, "retention compaction failed");
        }

        tracing::debug!(
            id = %node.id,
            topic = %node.topic,
            delta_s = node.delta_s,
            direction = %node.lambda_observe,
            "recorded node"
        );
        Some(node)
    }

    /// ΔS of `embedding` against the trajectory of the session so far; 0
    /// when there is no comparable history.
    fn tension(&self, session: Option<&str>, embedding: &[f32]) -> f32 {
        let recent = match self.memory.get_recent(self.trajectory_window, session, true) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "trajectory unreadable, recording ΔS=0");
                return 0.0;
            }
        };
        let embeddings: Vec<&[f32]> = recent
            .iter()
            .filter_map(|n| n.embedding.as_deref())
            .collect();
        match compute_trajectory(&embeddings) {
            Some(trajectory) if trajectory.len() == embedding.len() => {
                semantic_tension(embedding, &trajectory)
            }
            _ => 0.0,
        }
    }

    /// Note the start of a session. Returns how many nodes it already has,
    /// non-zero when the host resumes a session.
    pub fn start_session(&self, session_id: &str) -> usize {
        match self.memory.session_nodes(session_id) {
            Ok(nodes) => {
                tracing::info!(session = session_id, resumed = nodes.len(), "session started");
                nodes.len()
            }
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "session history unreadable");
                0
            }
        }
    }

    /// Node count and zone distribution of a finished session.
    pub fn end_session(&self, session_id: &str) -> GuardResult<SessionSummary> {
        let tree = self
            .memory
            .export_tree(Some(session_id), usize::MAX, &self.thresholds)?;
        let summary = SessionSummary {
            session_id: session_id.to_owned(),
            node_count: tree.node_count,
            zone_summary: tree.zone_summary,
        };
        tracing::info!(
            session = session_id,
            nodes = summary.node_count,
            risk = summary.zone_summary.risk,
            danger = summary.zone_summary.danger,
            "session ended"
        );
        Ok(summary)
    }
}

/// `"<tool>: <identifier>"` using the first of `file_path`, `path`,
/// `command` or `query` in the tool input; just the tool name otherwise.
pub fn extract_topic(ctx: &HookContext) -> String {
    let tool = ctx.tool_name.as_deref().unwrap_or("unknown");
    let Some(Value::Object(input)) = &ctx.tool_input else {
        return tool.to_string();
    };

    for (key, capped) in [
        ("file_path", false),
        ("path", false),
        ("command", true),
        ("query", true),
    ] {
        if let Some(value) = input.get(key) {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let ident = if capped {
                raw.chars().take(MAX_TOPIC_ARG_CHARS).collect()
            } else {
                raw
            };
            return format!("{tool}: {ident}");
        }
    }
    tool.to_string()
}

/// Compressed tool result: long outputs keep their first two and last two
/// lines, and are capped at 200 characters plus an ellipsis.
pub fn extract_insight(ctx: &HookContext) -> String {
    let result = match ctx.tool_result.as_deref() {
        Some(r) if !r.is_empty() => r,
        _ => return format!("Executed {}", ctx.tool_name.as_deref().unwrap_or("unknown")),
    };
    if result.chars().count() <= MAX_INSIGHT_CHARS {
        return result.to_string();
    }

    let lines: Vec<&str> = result.split('\n').collect();
    if lines.len() > 5 {
        let mut kept = lines[..2].to_vec();
        kept.push("...");
        kept.extend_from_slice(&lines[lines.len() - 2..]);
        let joined = kept.join("\n");
        if joined.chars().count() <= MAX_INSIGHT_CHARS {
            return joined;
        }
        return cap(&joined);
    }
    cap(result)
}

fn cap(s: &str) -> String {
    let mut out: String = s.chars().take(MAX_INSIGHT_CHARS).collect();
    out.push_str("...");
    out
}

/// Low-value events: shell no-ops, or a tiny successful result.
pub fn is_trivial(ctx: &HookContext, insight: &str) -> bool {
    if insight.chars().count() < MIN_INSIGHT_CHARS && ctx.exit_code == Some(0) {
        return true;
    }
    ctx.tool_name
        .as_deref()
        .is_some_and(|t| TRIVIAL_TOOLS.contains(&t.to_lowercase().as_str()))
}
