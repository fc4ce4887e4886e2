//! Knowledge-boundary check run before each tool call.
//!
//! The pending action is embedded and compared with the mean embedding of
//! the session's recent nodes. The resulting ΔS picks a zone, and the zone
//! picks the decision. Every failure on the way fails open.

use std::sync::Arc;

use driftguard_embed::Embedder;

use crate::config::{DriftCfg, GuardCfg};
use crate::memory::SemanticMemory;
use crate::tension::{Thresholds, classify_zone, compute_trajectory, renormalize, semantic_tension};
use crate::types::{HookContext, HookEvent, HookResult, Zone};

const MAX_INPUT_CHARS: usize = 500;
const MAX_PROMPT_CHARS: usize = 300;

const RISK_BRIDGES: usize = 2;
const DANGER_BRIDGES: usize = 3;

/// Pre-action drift guard. Holds no per-call state; everything it knows
/// about the past comes from semantic memory.
pub struct SemanticGuard {
    memory: SemanticMemory,
    embedder: Arc<dyn Embedder>,
    thresholds: Thresholds,
    config: GuardCfg,
    bridge_min_similarity: f32,
}

impl SemanticGuard {
    pub fn new(memory: SemanticMemory, embedder: Arc<dyn Embedder>, cfg: &DriftCfg) -> Self {
        Self {
            memory,
            embedder,
            thresholds: cfg.thresholds,
            config: cfg.guard.clone(),
            bridge_min_similarity: cfg.bridge.min_similarity,
        }
    }

    pub fn memory(&self) -> &SemanticMemory {
        &self.memory
    }

    pub async fn check(&self, ctx: &HookContext) -> HookResult {
        if ctx.event != HookEvent::PreToolUse {
            return HookResult::allow();
        }
        let text = build_context_text(ctx);
        if text.is_empty() {
            return HookResult::allow();
        }

        let current = match self.embedder.embed(&text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, transient = e.is_transient(), "embedding failed, skipping ΔS check");
                return HookResult::notice(format!(
                    "Embedding unavailable ({e}) - proceeding without ΔS check"
                ));
            }
        };

        let recent = match self
            .memory
            .get_recent(self.config.trajectory_window, ctx.session(), true)
        {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(error = %e, "semantic memory unreadable, skipping ΔS check");
                return HookResult::allow();
            }
        };
        let embeddings: Vec<&[f32]> = recent
            .iter()
            .filter_map(|n| n.embedding.as_deref())
            .collect();
        if embeddings.is_empty() {
            return HookResult::notice("No trajectory history - proceeding without ΔS check");
        }

        let Some(mut trajectory) = compute_trajectory(&embeddings) else {
            tracing::warn!(nodes = embeddings.len(), "recent embeddings differ in dimension");
            return HookResult::allow();
        };
        if trajectory.len() != current.len() {
            tracing::warn!(
                current = current.len(),
                trajectory = trajectory.len(),
                "embedding dimension changed, skipping ΔS check"
            );
            return HookResult::allow();
        }
        if self.config.renormalize_trajectory {
            renormalize(&mut trajectory);
        }

        let delta_s = semantic_tension(&current, &trajectory);
        let zone = classify_zone(delta_s, &self.thresholds);
        tracing::info!(
            tool = ctx.tool_name.as_deref().unwrap_or_default(),
            session = %ctx.session_id,
            delta_s,
            %zone,
            window = embeddings.len(),
            "semantic tension"
        );

        self.decide(ctx, &text, delta_s, zone).await
    }

    async fn decide(&self, ctx: &HookContext, text: &str, delta_s: f32, zone: Zone) -> HookResult {
        match zone {
            Zone::Safe => HookResult::allow(),

            Zone::Transitional => {
                HookResult::notice(format!("ΔS={delta_s:.3} (transitional zone)")).recording()
            }

            Zone::Risk => {
                let result = HookResult::notice(format!(
                    "ΔS={delta_s:.3} (risk zone) - approaching unknown territory"
                ))
                .recording();
                let tool = match ctx.tool_name.as_deref() {
                    Some(t) if self.config.inject_bridge_context => t,
                    _ => return result,
                };
                let bridges = self.bridges(text, tool, RISK_BRIDGES).await;
                if bridges.is_empty() {
                    result
                } else {
                    result.with_context(format!(
                        "Consider connecting through these related concepts: {}",
                        bridges.join(", ")
                    ))
                }
            }

            Zone::Danger if !self.config.block_in_danger => HookResult::notice(format!(
                "ΔS={delta_s:.3} (danger zone) - high hallucination risk. Proceed with caution."
            ))
            .with_context(
                "WARNING: You're entering unfamiliar territory with no clear connection to \
                 prior context. Consider asking for clarification or explicitly noting uncertainty.",
            )
            .recording(),

            Zone::Danger => {
                let tool = ctx.tool_name.as_deref().unwrap_or("unknown");
                let bridges = self.bridges(text, tool, DANGER_BRIDGES).await;
                if bridges.is_empty() {
                    tracing::warn!(tool, delta_s, "blocking: no bridge to known territory");
                    HookResult::deny(format!(
                        "BLOCKED: ΔS={delta_s:.3} (danger zone) - no bridge to known territory. \
                         Request clarification."
                    ))
                } else {
                    HookResult::notice(format!(
                        "ΔS={delta_s:.3} (danger zone) - high hallucination risk, but bridge found"
                    ))
                    .with_context(format!(
                        "CAUTION: You're entering unfamiliar territory. Consider grounding through: {}",
                        bridges.join(", ")
                    ))
                    .recording()
                }
            }
        }
    }

    async fn bridges(&self, current: &str, target: &str, top_k: usize) -> Vec<String> {
        self.memory
            .find_bridge(
                self.embedder.as_ref(),
                current,
                target,
                top_k,
                self.bridge_min_similarity,
            )
            .await
            .into_iter()
            .map(|n| n.topic)
            .collect()
    }
}

/// `Tool: X | Input: ... | Prompt: ...`, each part length-capped to bound
/// embedding cost. Empty when the context carries none of them.
pub fn build_context_text(ctx: &HookContext) -> String {
    let mut parts = Vec::new();

    if let Some(tool) = ctx.tool_name.as_deref().filter(|t| !t.is_empty()) {
        parts.push(format!("Tool: {tool}"));
    }

    let input = match &ctx.tool_input {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    if let Some(input) = input.filter(|s| !s.is_empty()) {
        match truncate_chars(&input, MAX_INPUT_CHARS) {
            Some(cut) => parts.push(format!("Input: {cut}...")),
            None => parts.push(format!("Input: {input}")),
        }
    }

    if let Some(prompt) = ctx.prompt.as_deref().filter(|p| !p.is_empty()) {
        let prompt = truncate_chars(prompt, MAX_PROMPT_CHARS).unwrap_or(prompt);
        parts.push(format!("Prompt: {prompt}"));
    }

    parts.join(" | ")
}

/// Prefix of at most `max` chars, or `None` when `s` already fits.
fn truncate_chars(s: &str, max: usize) -> Option<&str> {
    s.char_indices().nth(max).map(|(idx, _)| &s[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SemanticNode;
    use driftguard_embed::EmbedError;
    use driftguard_embed::provider::{MockEmbedder, TimeoutEmbedder};
    use std::time::Duration;
    use tempfile::TempDir;

    const SESSION: &str = "s1";

    fn memory_with(dir: &TempDir, nodes: &[(&str, &str, Vec<f32>)]) -> SemanticMemory {
        let memory = SemanticMemory::open(dir.path().join("memory.jsonl"), 100);
        for (session, topic, emb) in nodes {
            let node = SemanticNode::new(*session, *topic, "Read").with_embedding(emb.clone());
            memory.append(&node).unwrap();
        }
        memory
    }

    fn trajectory(dir: &TempDir) -> SemanticMemory {
        memory_with(
            dir,
            &[
                (SESSION, "Read: a.rs", vec![1.0, 0.0, 0.0]),
                (SESSION, "Read: b.rs", vec![1.0, 0.0, 0.0]),
                (SESSION, "Read: c.rs", vec![1.0, 0.0, 0.0]),
            ],
        )
    }

    fn pre_tool(tool: &str) -> HookContext {
        let mut ctx = HookContext::new(HookEvent::PreToolUse);
        ctx.session_id = SESSION.into();
        ctx.tool_name = Some(tool.into());
        ctx.tool_input = Some(serde_json::json!({"command": "cargo check"}));
        ctx
    }

    fn guard(memory: SemanticMemory, embedder: impl Embedder + 'static, block: bool) -> SemanticGuard {
        let mut cfg = DriftCfg::default();
        cfg.guard.block_in_danger = block;
        SemanticGuard::new(memory, Arc::new(embedder), &cfg)
    }

    #[test]
    fn context_text_joins_parts() {
        let mut ctx = pre_tool("Bash");
        ctx.prompt = Some("build it".into());
        assert_eq!(
            build_context_text(&ctx),
            r#"Tool: Bash | Input: {"command":"cargo check"} | Prompt: build it"#
        );
        assert_eq!(build_context_text(&HookContext::new(HookEvent::PreToolUse)), "");
    }

    #[test]
    fn context_text_truncates_on_char_boundaries() {
        let mut ctx = HookContext::new(HookEvent::PreToolUse);
        ctx.tool_input = Some(serde_json::Value::String("é".repeat(600)));
        ctx.prompt = Some("ü".repeat(400));
        let text = build_context_text(&ctx);
        let expected = format!("Input: {}... | Prompt: {}", "é".repeat(500), "ü".repeat(300));
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn other_events_pass_through() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.0, 1.0, 0.0]), true);
        let mut ctx = pre_tool("Bash");
        ctx.event = HookEvent::PostToolUse;
        assert_eq!(g.check(&ctx).await, HookResult::allow());
    }

    #[tokio::test]
    async fn zero_tension_stays_safe_and_unrecorded() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![1.0, 0.0, 0.0]), true);
        for _ in 0..3 {
            let r = g.check(&pre_tool("Read")).await;
            assert!(r.allow);
            assert!(!r.block);
            assert!(!r.record_node);
            assert!(r.message.is_none());
        }
    }

    #[tokio::test]
    async fn empty_memory_fails_open() {
        let dir = TempDir::new().unwrap();
        let g = guard(memory_with(&dir, &[]), MockEmbedder::new(vec![1.0, 0.0]), true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && !r.record_node);
        assert!(r.message.unwrap().contains("No trajectory history"));
    }

    #[tokio::test]
    async fn other_sessions_do_not_form_the_trajectory() {
        let dir = TempDir::new().unwrap();
        let memory = memory_with(&dir, &[("elsewhere", "Read: x.rs", vec![1.0, 0.0, 0.0])]);
        let g = guard(memory, MockEmbedder::new(vec![0.0, 1.0, 0.0]), true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block);
        assert!(r.message.unwrap().contains("No trajectory history"));
    }

    #[tokio::test]
    async fn provider_timeout_fails_open() {
        let dir = TempDir::new().unwrap();
        let slow = MockEmbedder::new(vec![0.0, 1.0, 0.0]).with_delay(Duration::from_secs(5));
        let g = guard(
            trajectory(&dir),
            TimeoutEmbedder::new(slow, Duration::from_millis(20)),
            true,
        );
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && !r.record_node);
        assert!(r.message.unwrap().contains("Embedding unavailable"));
    }

    #[tokio::test]
    async fn provider_error_fails_open() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::failing(EmbedError::RateLimited), true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && !r.record_node);
    }

    #[tokio::test]
    async fn dimension_change_fails_open() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.0, 1.0]), true);
        assert_eq!(g.check(&pre_tool("Bash")).await, HookResult::allow());
    }

    #[tokio::test]
    async fn transitional_records_and_reports() {
        let dir = TempDir::new().unwrap();
        // cos = 0.5, ΔS = 0.5
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.5, 0.866_025, 0.0]), true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && r.record_node);
        assert_eq!(r.message.as_deref(), Some("ΔS=0.500 (transitional zone)"));
        assert!(r.additional_context.is_none());
    }

    #[tokio::test]
    async fn risk_offers_bridges() {
        let dir = TempDir::new().unwrap();
        let memory = memory_with(
            &dir,
            &[
                ("other", "Read: bridge.rs", vec![0.1, 0.49, 0.5]),
                (SESSION, "Read: a.rs", vec![1.0, 0.0, 0.0]),
                (SESSION, "Read: b.rs", vec![1.0, 0.0, 0.0]),
            ],
        );
        // cos = 0.2, ΔS = 0.8
        let embedder = MockEmbedder::new(vec![0.2, 0.98, 0.0]).with("Bash", vec![0.0, 0.0, 1.0]);
        let g = guard(memory, embedder, false);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && r.record_node);
        assert!(r.message.unwrap().contains("risk zone"));
        assert_eq!(
            r.additional_context.as_deref(),
            Some("Consider connecting through these related concepts: Read: bridge.rs")
        );
    }

    #[tokio::test]
    async fn risk_without_bridges_has_no_context() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.2, 0.98, 0.0]), false);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && r.record_node);
        assert!(r.additional_context.is_none());
    }

    #[tokio::test]
    async fn danger_warns_when_blocking_disabled() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.0, 1.0, 0.0]), false);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && r.record_node);
        assert!(r.message.unwrap().contains("danger zone"));
        assert!(r.additional_context.unwrap().starts_with("WARNING"));
    }

    #[tokio::test]
    async fn danger_blocks_without_bridge() {
        let dir = TempDir::new().unwrap();
        let g = guard(trajectory(&dir), MockEmbedder::new(vec![0.0, 1.0, 0.0]), true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(!r.allow && r.block);
        assert!(r.message.unwrap().starts_with("BLOCKED"));
    }

    #[tokio::test]
    async fn danger_bridge_softens_block() {
        let dir = TempDir::new().unwrap();
        let memory = memory_with(
            &dir,
            &[
                ("other", "Grep: config loader", vec![0.0, 0.707, 0.707]),
                (SESSION, "Read: a.rs", vec![1.0, 0.0, 0.0]),
            ],
        );
        let embedder = MockEmbedder::new(vec![0.0, 1.0, 0.0]).with("Bash", vec![0.0, 0.0, 1.0]);
        let g = guard(memory, embedder, true);
        let r = g.check(&pre_tool("Bash")).await;
        assert!(r.allow && !r.block && r.record_node);
        assert!(r.message.unwrap().contains("bridge found"));
        assert!(r.additional_context.unwrap().contains("Grep: config loader"));
    }
}
