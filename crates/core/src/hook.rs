//! Hook dispatch: one host event in, one decision out.
//!
//! [`HookRuntime`] owns the guards for a single project. It is built fresh
//! for every invocation, so nothing leaks between calls except through the
//! memory and history files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use driftguard_embed::Embedder;
use driftguard_embed::cache::CachedEmbedder;
use driftguard_embed::hashed::HashEmbedder;
use driftguard_embed::http;
use driftguard_embed::provider::TimeoutEmbedder;

use crate::config::{DriftCfg, EmbeddingCfg};
use crate::guard::{SemanticGuard, StuckConfig, StuckDetector};
use crate::memory::SemanticMemory;
use crate::recorder::Recorder;
use crate::types::{HookContext, HookEvent, HookResult};

pub struct HookRuntime {
    guard: Option<SemanticGuard>,
    stuck: Option<StuckDetector>,
    recorder: Option<Recorder>,
}

impl HookRuntime {
    pub fn new(
        guard: Option<SemanticGuard>,
        stuck: Option<StuckDetector>,
        recorder: Option<Recorder>,
    ) -> Self {
        Self {
            guard,
            stuck,
            recorder,
        }
    }

    /// Wire every component for `project` from `cfg`. Without a usable
    /// embedding provider the drift guard and recorder are left out and
    /// only stuck detection runs.
    pub fn from_config(cfg: &DriftCfg, project: &Path) -> Self {
        let embedder = build_embedder(&cfg.embedding);
        let memory = SemanticMemory::open(cfg.memory_path(project), cfg.memory.max_nodes);

        let guard = embedder
            .clone()
            .map(|e| SemanticGuard::new(memory.clone(), e, cfg));
        let recorder = embedder.map(|e| {
            Recorder::new(memory, e, cfg.memory.skip_trivial)
                .with_trajectory_window(cfg.guard.trajectory_window)
                .with_thresholds(cfg.thresholds)
        });
        let stuck = cfg.stuck_detection.enabled.then(|| {
            StuckDetector::new(StuckConfig::from_cfg(
                &cfg.stuck_detection,
                cfg.history_path(project),
            ))
        });

        Self::new(guard, stuck, recorder)
    }

    pub async fn handle(&self, ctx: &HookContext) -> HookResult {
        tracing::debug!(event = ?ctx.event, tool = ?ctx.tool_name, session = %ctx.session_id, "hook event");
        match ctx.event {
            HookEvent::PreToolUse => match &self.guard {
                Some(guard) => guard.check(ctx).await,
                None => HookResult::notice(
                    "Embedding provider not configured - proceeding without ΔS check",
                ),
            },
            HookEvent::PostToolUse => {
                let mut result = self.check_stuck(ctx);
                let Some(recorder) = &self.recorder else {
                    return result;
                };
                if let Some(node) = recorder.record(ctx).await {
                    result.record_node = true;
                    if result.message.is_none() {
                        result.message = Some(format!(
                            "Recorded: {} (ΔS={:.3}, {})",
                            node.topic, node.delta_s, node.lambda_observe
                        ));
                    }
                }
                result
            }
            HookEvent::PostResponse => self.check_stuck(ctx),
            HookEvent::SessionStart => {
                if let Some(recorder) = &self.recorder {
                    recorder.start_session(&ctx.session_id);
                }
                HookResult::allow()
            }
            HookEvent::SessionEnd => match &self.recorder {
                Some(recorder) => match recorder.end_session(&ctx.session_id) {
                    Ok(summary) => HookResult::notice(summary.describe()),
                    Err(e) => {
                        tracing::warn!(error = %e, "session summary unavailable");
                        HookResult::allow()
                    }
                },
                None => HookResult::allow(),
            },
            HookEvent::Other => HookResult::allow(),
        }
    }

    fn check_stuck(&self, ctx: &HookContext) -> HookResult {
        self.stuck
            .as_ref()
            .map_or_else(HookResult::allow, |s| s.check_hook(ctx))
    }
}

/// Decision used whenever the guard itself fails. The host is never
/// blocked by a guard malfunction.
pub fn fail_open(reason: &str) -> HookResult {
    tracing::error!(reason, "guard failed, allowing");
    HookResult::allow()
}

/// Provider from config, wrapped in the embedding cache and the call timeout.
/// `None` when the provider is unknown or has no credentials.
pub fn build_embedder(cfg: &EmbeddingCfg) -> Option<Arc<dyn Embedder>> {
    match cfg.provider.to_lowercase().as_str() {
        "local" | "hash" => Some(wrap(HashEmbedder::new(cfg.dimensions), cfg)),
        "openai" | "voyage" | "http" => match http::from_env(&cfg.model, cfg.base_url.clone()) {
            Some(provider) => Some(wrap(provider, cfg)),
            None => {
                tracing::warn!(
                    model = %cfg.model,
                    "no embedding API key (DRIFTGUARD_EMBED_API_KEY / OPENAI_API_KEY), drift guard disabled"
                );
                None
            }
        },
        other => {
            tracing::warn!(provider = other, "unknown embedding provider, drift guard disabled");
            None
        }
    }
}

fn wrap<E: Embedder + 'static>(inner: E, cfg: &EmbeddingCfg) -> Arc<dyn Embedder> {
    let cached = CachedEmbedder::new(inner, cfg.cache_size);
    Arc::new(TimeoutEmbedder::new(
        cached,
        Duration::from_millis(cfg.timeout_ms),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftguard_embed::provider::MockEmbedder;
    use tempfile::TempDir;

    const RESULT_TEXT: &str = "Compiling the workspace failed: unresolved import in the \
        recorder module, unresolved import in the guard module, rerun compiler.";

    fn local_cfg() -> DriftCfg {
        let mut cfg = DriftCfg::default();
        cfg.embedding.provider = "local".into();
        cfg
    }

    fn post(result: &str) -> HookContext {
        let mut ctx = HookContext::new(HookEvent::PostToolUse);
        ctx.session_id = "s1".into();
        ctx.tool_name = Some("Bash".into());
        ctx.tool_input = Some(serde_json::json!({"command": "cargo build"}));
        ctx.tool_result = Some(result.into());
        ctx.exit_code = Some(1);
        ctx
    }

    #[test]
    fn builds_local_embedder() {
        let e = build_embedder(&local_cfg().embedding).unwrap();
        assert_eq!(e.name(), "local");
        assert_eq!(e.dimensions(), 256);
    }

    #[test]
    fn unknown_provider_has_no_embedder() {
        let mut cfg = EmbeddingCfg::default();
        cfg.provider = "carrier-pigeon".into();
        assert!(build_embedder(&cfg).is_none());
    }

    #[tokio::test]
    async fn other_events_allow() {
        let dir = TempDir::new().unwrap();
        let rt = HookRuntime::from_config(&local_cfg(), dir.path());
        let r = rt.handle(&HookContext::new(HookEvent::Other)).await;
        assert_eq!(r, HookResult::allow());
    }

    #[tokio::test]
    async fn missing_guard_fails_open() {
        let rt = HookRuntime::new(None, None, None);
        let r = rt.handle(&HookContext::new(HookEvent::PreToolUse)).await;
        assert!(r.allow && !r.block);
        assert!(r.message.is_some());
    }

    #[tokio::test]
    async fn post_tool_use_records_and_detects_loops() {
        let dir = TempDir::new().unwrap();
        let cfg = local_cfg();
        let rt = HookRuntime::from_config(&cfg, dir.path());

        let first = rt.handle(&post(RESULT_TEXT)).await;
        assert!(first.record_node);
        assert!(first.additional_context.is_none());
        assert_eq!(
            first.message.as_deref(),
            Some("Recorded: Bash: cargo build (ΔS=0.000, <-)")
        );
        rt.handle(&post(RESULT_TEXT)).await;
        let third = rt.handle(&post(RESULT_TEXT)).await;
        assert!(third.allow && !third.block);
        assert!(third.additional_context.unwrap().contains("<stuck-detection>"));

        let memory = SemanticMemory::open(cfg.memory_path(dir.path()), 100);
        assert_eq!(memory.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn post_response_only_checks_stuck() {
        let dir = TempDir::new().unwrap();
        let cfg = local_cfg();
        let rt = HookRuntime::from_config(&cfg, dir.path());
        let mut ctx = post(RESULT_TEXT);
        ctx.event = HookEvent::PostResponse;
        for _ in 0..3 {
            assert!(!rt.handle(&ctx).await.record_node);
        }
        let memory = SemanticMemory::open(cfg.memory_path(dir.path()), 100);
        assert_eq!(memory.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_stuck_detection_never_nudges() {
        let dir = TempDir::new().unwrap();
        let mut cfg = local_cfg();
        cfg.stuck_detection.enabled = false;
        let rt = HookRuntime::from_config(&cfg, dir.path());
        for _ in 0..4 {
            assert!(rt.handle(&post(RESULT_TEXT)).await.additional_context.is_none());
        }
    }

    #[tokio::test]
    async fn session_end_summarizes_recorded_nodes() {
        let dir = TempDir::new().unwrap();
        let rt = HookRuntime::from_config(&local_cfg(), dir.path());

        let mut start = HookContext::new(HookEvent::SessionStart);
        start.session_id = "s1".into();
        assert_eq!(rt.handle(&start).await, HookResult::allow());

        rt.handle(&post(RESULT_TEXT)).await;
        let mut end = HookContext::new(HookEvent::SessionEnd);
        end.session_id = "s1".into();
        let r = rt.handle(&end).await;
        assert!(r.allow && !r.block);
        assert!(r.message.unwrap().starts_with("Session s1: 1 nodes (safe 1"));
    }

    #[tokio::test]
    async fn session_events_without_recorder_allow() {
        let rt = HookRuntime::new(None, None, None);
        for event in [HookEvent::SessionStart, HookEvent::SessionEnd] {
            assert_eq!(rt.handle(&HookContext::new(event)).await, HookResult::allow());
        }
    }

    #[tokio::test]
    async fn recorded_steps_form_the_trajectory() {
        let dir = TempDir::new().unwrap();
        let cfg = DriftCfg::default();
        let memory = SemanticMemory::open(cfg.memory_path(dir.path()), 100);
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(vec![1.0, 0.0]));
        let rt = HookRuntime::new(
            Some(SemanticGuard::new(memory.clone(), embedder.clone(), &cfg)),
            None,
            Some(Recorder::new(memory, embedder, true)),
        );

        let mut pre = HookContext::new(HookEvent::PreToolUse);
        pre.session_id = "s1".into();
        pre.tool_name = Some("Bash".into());
        let before = rt.handle(&pre).await;
        assert!(before.message.unwrap().contains("No trajectory history"));

        rt.handle(&post(RESULT_TEXT)).await;
        let after = rt.handle(&pre).await;
        assert_eq!(after, HookResult::allow());
    }
}
