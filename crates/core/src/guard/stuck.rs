//! Lexical stuck-loop detection.
//!
//! Each turn's text is reduced to a topic signature: its five most frequent
//! significant words, sorted and comma-joined. When the last few signatures
//! keep matching (Jaccard similarity), the agent is going in circles and
//! gets a nudge to change approach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::StuckCfg;
use crate::error::GuardResult;
use crate::persist;
use crate::types::{HookContext, HookResult};

/// Shorter texts carry too little signal to fingerprint.
pub const MIN_SIGNATURE_TEXT_LEN: usize = 50;

/// Words kept in a signature.
const SIGNATURE_TERMS: usize = 5;

/// Tokens this short are never significant.
const MIN_TERM_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can",
    "need", "dare", "ought", "used", "to", "of", "in", "for", "on", "with", "at", "by", "from",
    "as", "into", "through", "during", "before", "after", "above", "below", "between", "out",
    "off", "over", "under", "again", "further", "then", "once", "here", "there", "when", "where",
    "why", "how", "all", "both", "each", "few", "more", "most", "other", "some", "such", "no",
    "nor", "not", "only", "own", "same", "so", "than", "too", "very", "just", "don", "now",
    "and", "but", "or", "if", "while", "that", "this", "it", "i", "you", "we", "they", "he",
    "she", "my", "your", "his", "her", "its", "our", "their", "what", "which", "who", "whom",
    "okay", "yes", "thanks", "thank", "please", "sorry", "hello", "hi", "hey", "sure", "right",
    "well", "also", "still", "already", "done", "going", "want", "like", "know", "think", "make",
    "take", "get", "see", "come", "look", "use", "find", "give", "tell", "work",
];

/// Fingerprint `text` as its top five significant words, sorted and
/// comma-joined. `None` when the text is shorter than
/// [`MIN_SIGNATURE_TEXT_LEN`] characters or fewer than `min_words`
/// significant words survive. Never returns an empty signature.
pub fn extract_topic_signature(text: &str, min_words: usize) -> Option<String> {
    if text.chars().count() < MIN_SIGNATURE_TEXT_LEN {
        return None;
    }

    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();

    // Frequency in first-seen order so ties rank deterministically.
    let mut order: Vec<&str> = Vec::new();
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for word in normalized.split_whitespace() {
        if word.chars().count() < MIN_TERM_LEN || STOP_WORDS.contains(&word) {
            continue;
        }
        let count = freq.entry(word).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }

    let mut ranked: Vec<(&str, usize)> = order.into_iter().map(|w| (w, freq[w])).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let mut top: Vec<&str> = ranked
        .into_iter()
        .take(SIGNATURE_TERMS)
        .map(|(w, _)| w)
        .collect();
    top.sort_unstable();

    if top.is_empty() || top.len() < min_words {
        return None;
    }
    Some(top.join(","))
}

/// Jaccard similarity of the comma-separated term sets.
///
/// Identical inputs score 1.0, including two empty strings: each splits
/// into the one-element set `{""}`.
pub fn jaccard_similarity(sig1: &str, sig2: &str) -> f32 {
    let a: HashSet<&str> = sig1.split(',').collect();
    let b: HashSet<&str> = sig2.split(',').collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

/// Guidance injected when a loop is detected.
pub fn build_nudge(signature: &str, user_name: Option<&str>) -> String {
    let terms = signature.split(',').collect::<Vec<_>>().join(", ");
    let greeting = match user_name {
        Some(name) => format!("{name} is waiting on you, and the last turns covered the same ground.\n"),
        None => String::new(),
    };
    let who = user_name.unwrap_or("the user");
    format!(
        "<stuck-detection>\n\
         {greeting}\
         SELF-REFLECTION: the recent turns keep circling the same topic.\n\
         - Repeated terms: {terms}\n\
         - Likely pattern: restating progress or retrying an approach that is not working\n\
         \n\
         CHANGE APPROACH:\n\
         1. Stop and ask {who} one direct question about what they need\n\
         2. Wait for an answer instead of volunteering another update\n\
         3. If you must continue, try a different strategy than the last attempts\n\
         4. Do not repeat the same status information unless asked\n\
         </stuck-detection>"
    )
}

/// One remembered turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckHistoryEntry {
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a stuck check.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckResult {
    pub stuck: bool,
    pub signature: Option<String>,
    pub nudge: Option<String>,
    /// Matching turns in the window, the current one included.
    pub similar_count: usize,
}

impl StuckResult {
    fn clear(signature: Option<String>) -> Self {
        Self {
            stuck: false,
            signature,
            nudge: None,
            similar_count: 0,
        }
    }
}

/// Resolved stuck-detection settings.
#[derive(Debug, Clone)]
pub struct StuckConfig {
    pub history_path: PathBuf,
    pub max_history: usize,
    pub stuck_threshold: usize,
    pub similarity_threshold: f32,
    pub min_significant_words: usize,
    pub user_name: Option<String>,
}

impl StuckConfig {
    pub fn new(history_path: impl Into<PathBuf>) -> Self {
        Self::from_cfg(&StuckCfg::default(), history_path)
    }

    pub fn from_cfg(cfg: &StuckCfg, history_path: impl Into<PathBuf>) -> Self {
        Self {
            history_path: history_path.into(),
            max_history: cfg.max_history.max(cfg.stuck_threshold),
            stuck_threshold: cfg.stuck_threshold.max(2),
            similarity_threshold: cfg.similarity_threshold,
            min_significant_words: cfg.min_significant_words,
            user_name: cfg.user_name.clone(),
        }
    }
}

/// Read the rolling history. Missing or unreadable files read as empty.
pub fn load_history(path: &Path) -> Vec<StuckHistoryEntry> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "stuck history unreadable");
            }
            return Vec::new();
        }
    };
    serde_json::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "stuck history malformed, starting fresh");
        Vec::new()
    })
}

/// Overwrite the history with an empty list. Idempotent.
pub fn reset_stuck_history(path: &Path) -> GuardResult<()> {
    persist::write_json_atomic(path, &Vec::<StuckHistoryEntry>::new())
}

/// Stuck-loop detector bound to one history file.
#[derive(Debug, Clone)]
pub struct StuckDetector {
    config: StuckConfig,
}

impl StuckDetector {
    pub fn new(config: StuckConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StuckConfig {
        &self.config
    }

    /// Check `text` against recent turns and remember it.
    ///
    /// Text without a signature leaves the history untouched. Persistence
    /// failures are logged; the result is still returned.
    pub fn check(&self, text: &str) -> StuckResult {
        let cfg = &self.config;
        let Some(signature) = extract_topic_signature(text, cfg.min_significant_words) else {
            return StuckResult::clear(None);
        };

        let mut history = load_history(&cfg.history_path);

        let window = cfg.stuck_threshold.saturating_sub(1);
        let matches = history
            .iter()
            .rev()
            .take(window)
            .filter(|e| jaccard_similarity(&signature, &e.signature) >= cfg.similarity_threshold)
            .count();
        let similar_count = matches + 1;
        let stuck = similar_count >= cfg.stuck_threshold;

        history.push(StuckHistoryEntry {
            signature: signature.clone(),
            timestamp: Utc::now(),
        });
        if history.len() > cfg.max_history {
            history.drain(..history.len() - cfg.max_history);
        }
        if let Err(e) = persist::write_json_atomic(&cfg.history_path, &history) {
            tracing::warn!(error = %e, "failed to persist stuck history");
        }

        if stuck {
            tracing::info!(signature = %signature, similar_count, "stuck loop detected");
            let nudge = build_nudge(&signature, cfg.user_name.as_deref());
            StuckResult {
                stuck: true,
                signature: Some(signature),
                nudge: Some(nudge),
                similar_count,
            }
        } else {
            StuckResult {
                similar_count,
                ..StuckResult::clear(Some(signature))
            }
        }
    }

    /// Hook adapter: checks the tool result, else the prompt.
    pub fn check_hook(&self, ctx: &HookContext) -> HookResult {
        let text = [ctx.tool_result.as_deref(), ctx.prompt.as_deref()]
            .into_iter()
            .flatten()
            .find(|t| !t.is_empty());
        let Some(text) = text else {
            return HookResult::allow();
        };
        let result = self.check(text);
        match result.nudge {
            Some(nudge) if result.stuck => HookResult::notice(format!(
                "Stuck loop detected ({} similar turns)",
                result.similar_count
            ))
            .with_context(nudge),
            _ => HookResult::allow(),
        }
    }

    pub fn reset(&self) -> GuardResult<()> {
        reset_stuck_history(&self.config.history_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HookEvent;
    use tempfile::TempDir;

    const CONFIG_TEXT: &str = "The semantic hooks module provides configuration for embeddings \
        and semantic tension tracking with OpenAI integration features.";
    const TRAITS_TEXT: &str = "Rust programming includes traits, generics, and lifetime \
        managers for building maintainable applications with clean code.";
    const DATABASE_TEXT: &str = "Database design involves normalization, indexing strategies, and \
        query optimization for performance in production systems.";

    fn detector(dir: &TempDir, threshold: usize) -> StuckDetector {
        let cfg = StuckCfg {
            stuck_threshold: threshold,
            ..StuckCfg::default()
        };
        StuckDetector::new(StuckConfig::from_cfg(&cfg, dir.path().join("stuck-history.json")))
    }

    #[test]
    fn short_text_has_no_signature() {
        assert_eq!(extract_topic_signature("hello world", 2), None);
        assert_eq!(extract_topic_signature(&"a".repeat(49), 2), None);
        assert_eq!(extract_topic_signature("", 2), None);
    }

    #[test]
    fn stop_words_only_has_no_signature() {
        let text = format!("{} the and but or if then when where what", "a".repeat(50));
        // The run of "a" is one significant token; min_words=2 rejects it.
        assert_eq!(extract_topic_signature(&text, 2), None);
    }

    #[test]
    fn signature_keeps_top_terms_sorted() {
        let sig = extract_topic_signature(CONFIG_TEXT, 2).unwrap();
        let words: Vec<&str> = sig.split(',').collect();
        assert!(words.len() <= SIGNATURE_TERMS);
        assert!(words.contains(&"semantic"));
        assert!(!words.contains(&"the") && !words.contains(&"and"));
        let mut sorted = words.clone();
        sorted.sort_unstable();
        assert_eq!(words, sorted);
    }

    #[test]
    fn signature_ranks_by_frequency() {
        let text = "cache cache cache cache eviction eviction eviction policy policy \
                    latency latency throughput memory";
        let sig = extract_topic_signature(text, 2).unwrap();
        assert_eq!(sig, "cache,eviction,latency,policy,throughput");
    }

    #[test]
    fn signature_ignores_word_order() {
        let a = "parser lexer tokens grammar parser lexer tokens grammar ambiguity";
        let b = "ambiguity grammar tokens lexer parser grammar tokens lexer parser";
        assert_eq!(extract_topic_signature(a, 2), extract_topic_signature(b, 2));
    }

    #[test]
    fn zero_min_words_still_never_empty() {
        let text = "the and but or if then when where what ".repeat(3);
        assert_eq!(extract_topic_signature(&text, 0), None);
    }

    #[test]
    fn jaccard_identity_and_disjoint() {
        let sig = "apple,banana,cherry";
        assert_eq!(jaccard_similarity(sig, sig), 1.0);
        assert_eq!(jaccard_similarity(sig, "dog,elephant,frog"), 0.0);
        assert_eq!(jaccard_similarity(sig, "apple,banana,date"), 0.5);
    }

    #[test]
    fn jaccard_at_default_threshold() {
        // 3 shared terms over a union of 5.
        assert_eq!(jaccard_similarity("alpha,beta,gamma,delta", "alpha,beta,gamma,omega"), 0.6);
        assert_eq!(jaccard_similarity("alpha,beta,gamma", "alpha,beta,gamma,delta,omega"), 0.6);
    }

    #[test]
    fn similarity_equal_to_threshold_counts_as_match() {
        let text = "cache cache cache cache eviction eviction eviction policy policy \
                    latency latency throughput memory";
        assert_eq!(
            extract_topic_signature(text, 2).as_deref(),
            Some("cache,eviction,latency,policy,throughput")
        );

        let seeded = |dir: &TempDir, previous: &str| {
            let det = detector(dir, 2);
            assert_eq!(det.config().similarity_threshold, 0.6);
            let entry = StuckHistoryEntry {
                signature: previous.into(),
                timestamp: Utc::now(),
            };
            persist::write_json_atomic(&det.config().history_path, &vec![entry]).unwrap();
            det
        };

        let at = TempDir::new().unwrap();
        let r = seeded(&at, "cache,eviction,latency").check(text);
        assert!(r.stuck);
        assert_eq!(r.similar_count, 2);

        let below = TempDir::new().unwrap();
        assert!(!seeded(&below, "cache,eviction,latency,parser").check(text).stuck);
    }

    #[test]
    fn jaccard_of_two_empty_strings_is_one() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }

    #[test]
    fn third_repeat_is_stuck() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 3);

        let first = det.check(CONFIG_TEXT);
        assert!(!first.stuck);
        assert!(first.signature.is_some());
        assert!(!det.check(CONFIG_TEXT).stuck);

        let third = det.check(CONFIG_TEXT);
        assert!(third.stuck);
        assert_eq!(third.similar_count, 3);
        let nudge = third.nudge.unwrap();
        assert!(nudge.starts_with("<stuck-detection>"));
        assert!(nudge.ends_with("</stuck-detection>"));
        for term in third.signature.unwrap().split(',') {
            assert!(nudge.contains(term));
        }
    }

    #[test]
    fn different_topics_never_stuck() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 3);
        for text in [CONFIG_TEXT, TRAITS_TEXT, DATABASE_TEXT] {
            assert!(!det.check(text).stuck);
        }
    }

    #[test]
    fn interrupted_repetition_is_not_stuck() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 3);
        det.check(CONFIG_TEXT);
        det.check(TRAITS_TEXT);
        assert!(!det.check(CONFIG_TEXT).stuck);
    }

    #[test]
    fn unsignable_text_leaves_history_untouched() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 3);
        det.check(CONFIG_TEXT);
        let before = load_history(&det.config().history_path);

        let r = det.check("too short");
        assert!(!r.stuck);
        assert!(r.signature.is_none());
        assert_eq!(load_history(&det.config().history_path), before);
    }

    #[test]
    fn history_is_bounded() {
        let dir = TempDir::new().unwrap();
        let cfg = StuckCfg {
            max_history: 4,
            ..StuckCfg::default()
        };
        let det = StuckDetector::new(StuckConfig::from_cfg(&cfg, dir.path().join("h.json")));
        for _ in 0..9 {
            det.check(TRAITS_TEXT);
        }
        assert_eq!(load_history(&det.config().history_path).len(), 4);
    }

    #[test]
    fn reset_empties_history() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 3);
        det.check(CONFIG_TEXT);
        det.check(CONFIG_TEXT);
        det.reset().unwrap();
        det.reset().unwrap();
        let raw = std::fs::read_to_string(&det.config().history_path).unwrap();
        let parsed: Vec<StuckHistoryEntry> = serde_json::from_str(&raw).unwrap();
        assert!(parsed.is_empty());
        assert!(!det.check(CONFIG_TEXT).stuck);
    }

    #[test]
    fn corrupt_history_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 2);
        std::fs::write(&det.config().history_path, "{ not json").unwrap();
        assert!(!det.check(CONFIG_TEXT).stuck);
        assert!(det.check(CONFIG_TEXT).stuck);
    }

    #[test]
    fn nudge_personalizes_when_named() {
        let named = build_nudge("alpha,beta", Some("Ada"));
        assert!(named.contains("Ada"));
        assert!(named.contains("alpha, beta"));
        let anonymous = build_nudge("alpha,beta", None);
        assert!(anonymous.contains("the user"));
    }

    #[test]
    fn hook_adapter_injects_nudge() {
        let dir = TempDir::new().unwrap();
        let det = detector(&dir, 2);
        let mut ctx = HookContext::new(HookEvent::PostResponse);
        assert_eq!(det.check_hook(&ctx), HookResult::allow());

        ctx.tool_result = Some(String::new());
        ctx.prompt = Some(CONFIG_TEXT.into());
        assert_eq!(det.check_hook(&ctx), HookResult::allow());
        let r = det.check_hook(&ctx);
        assert!(r.allow && !r.block);
        assert_eq!(r.message.as_deref(), Some("Stuck loop detected (2 similar turns)"));
        assert!(r.additional_context.unwrap().contains("<stuck-detection>"));
    }
}
