use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

use crate::error::{GuardError, GuardResult};
use crate::tension::Thresholds;

/// Per-project state directory.
pub const STATE_DIR: &str = ".driftguard";

/// All driftguard parameters, loaded from `<project>/.driftguard/config.yaml`.
/// Every key is optional; missing keys take the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftCfg {
    pub thresholds: Thresholds,
    pub guard: GuardCfg,
    pub embedding: EmbeddingCfg,
    pub bridge: BridgeCfg,
    pub memory: MemoryCfg,
    pub stuck_detection: StuckCfg,
    pub logging: LoggingCfg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardCfg {
    /// Block in the danger zone when no bridge exists. Default: warn only.
    pub block_in_danger: bool,
    pub inject_bridge_context: bool,
    /// Number of recent nodes averaged into the trajectory.
    pub trajectory_window: usize,
    pub renormalize_trajectory: bool,
}

impl Default for GuardCfg {
    fn default() -> Self {
        Self {
            block_in_danger: false,
            inject_bridge_context: true,
            trajectory_window: 5,
            renormalize_trajectory: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingCfg {
    /// `openai` (any OpenAI-compatible endpoint) or `local`.
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub cache_size: usize,
    /// Vector width of the `local` provider.
    pub dimensions: usize,
}

impl Default for EmbeddingCfg {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            base_url: None,
            timeout_ms: 2000,
            cache_size: 1000,
            dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeCfg {
    /// Minimum cosine similarity to the midpoint for a bridge candidate.
    pub min_similarity: f32,
}

impl Default for BridgeCfg {
    fn default() -> Self {
        Self { min_similarity: 0.3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCfg {
    pub path: Option<String>,
    /// Retention bound; older nodes are compacted away.
    pub max_nodes: usize,
    /// Skip echo/pwd-style events with no informational value.
    pub skip_trivial: bool,
}

impl Default for MemoryCfg {
    fn default() -> Self {
        Self {
            path: None,
            max_nodes: 10_000,
            skip_trivial: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckCfg {
    pub enabled: bool,
    pub history_path: Option<String>,
    pub max_history: usize,
    /// Similar consecutive turns (current one included) that count as stuck.
    pub stuck_threshold: usize,
    /// Jaccard similarity at or above which two signatures match.
    pub similarity_threshold: f32,
    pub min_significant_words: usize,
    pub user_name: Option<String>,
}

impl Default for StuckCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            history_path: None,
            max_history: 10,
            stuck_threshold: 3,
            similarity_threshold: 0.6,
            min_significant_words: 2,
            user_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingCfg {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingCfg {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl DriftCfg {
    /// Default config file location for a project.
    pub fn default_path(project: &Path) -> PathBuf {
        project.join(STATE_DIR).join("config.yaml")
    }

    /// Parse a YAML document section by section. A section that does not
    /// deserialize falls back to its defaults with a warning; the others
    /// are kept. Fails only on broken YAML or a non-mapping document.
    pub fn from_yaml(text: &str) -> GuardResult<(Self, Vec<String>)> {
        if text.trim().is_empty() {
            return Ok((Self::default(), Vec::new()));
        }
        let mut root = match serde_yaml::from_str::<Value>(text)? {
            Value::Null => return Ok((Self::default(), Vec::new())),
            Value::Mapping(m) => m,
            other => {
                return Err(GuardError::InvalidConfig(format!(
                    "expected a mapping of sections, got {}",
                    value_kind(&other)
                )));
            }
        };

        let mut warnings = Vec::new();
        let mut cfg = Self {
            thresholds: section(&mut root, "thresholds", &mut warnings),
            guard: section(&mut root, "guard", &mut warnings),
            embedding: section(&mut root, "embedding", &mut warnings),
            bridge: section(&mut root, "bridge", &mut warnings),
            memory: section(&mut root, "memory", &mut warnings),
            stuck_detection: section(&mut root, "stuck_detection", &mut warnings),
            logging: section(&mut root, "logging", &mut warnings),
        };
        for (key, _) in &root {
            let key = key.as_str().map_or_else(|| format!("{key:?}"), str::to_owned);
            warnings.push(format!("unknown config section `{key}` ignored"));
        }
        warnings.extend(cfg.validate());
        Ok((cfg, warnings))
    }

    /// Load from `path`. A missing file yields defaults without warnings.
    pub fn load(path: &Path) -> GuardResult<(Self, Vec<String>)> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Self::default(), Vec::new())),
            Err(e) => Err(GuardError::io(path, e)),
        }
    }

    /// Load from `path`, falling back to defaults on any error. Never fails.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok((cfg, warnings)) => {
                for w in &warnings {
                    tracing::warn!(path = %path.display(), "{w}");
                }
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "config unreadable, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Reset each invalid section to its default. Returns one warning per repair.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.thresholds.is_valid() {
            warnings.push(format!(
                "thresholds must satisfy 0 <= safe < transitional < risk <= 1 (got {}/{}/{}); using defaults",
                self.thresholds.safe, self.thresholds.transitional, self.thresholds.risk
            ));
            self.thresholds = Thresholds::default();
        }

        if self.guard.trajectory_window == 0 {
            warnings.push("guard.trajectory_window must be at least 1; using 5".into());
            self.guard.trajectory_window = GuardCfg::default().trajectory_window;
        }

        if self.embedding.timeout_ms == 0 {
            warnings.push("embedding.timeout_ms must be positive; using 2000".into());
            self.embedding.timeout_ms = EmbeddingCfg::default().timeout_ms;
        }
        if self.embedding.dimensions == 0 {
            warnings.push("embedding.dimensions must be positive; using 256".into());
            self.embedding.dimensions = EmbeddingCfg::default().dimensions;
        }

        let sim = self.bridge.min_similarity;
        if !sim.is_finite() || !(-1.0..=1.0).contains(&sim) {
            warnings.push(format!("bridge.min_similarity {sim} outside [-1, 1]; using 0.3"));
            self.bridge = BridgeCfg::default();
        }

        if self.memory.max_nodes == 0 {
            warnings.push("memory.max_nodes must be at least 1; using 10000".into());
            self.memory.max_nodes = MemoryCfg::default().max_nodes;
        }

        let stuck = &mut self.stuck_detection;
        if stuck.stuck_threshold < 2 {
            warnings.push(format!(
                "stuck_detection.stuck_threshold {} below 2; using 3",
                stuck.stuck_threshold
            ));
            stuck.stuck_threshold = StuckCfg::default().stuck_threshold;
        }
        let sim = stuck.similarity_threshold;
        if !sim.is_finite() || !(0.0..=1.0).contains(&sim) {
            warnings.push(format!(
                "stuck_detection.similarity_threshold {sim} outside [0, 1]; using 0.6"
            ));
            stuck.similarity_threshold = StuckCfg::default().similarity_threshold;
        }
        if stuck.max_history < stuck.stuck_threshold {
            warnings.push(format!(
                "stuck_detection.max_history {} below stuck_threshold; raised to {}",
                stuck.max_history, stuck.stuck_threshold
            ));
            stuck.max_history = stuck.stuck_threshold;
        }

        warnings
    }

    /// Semantic memory file for `project`.
    pub fn memory_path(&self, project: &Path) -> PathBuf {
        resolve(self.memory.path.as_deref(), project, "memory.jsonl")
    }

    /// Stuck history file for `project`.
    pub fn history_path(&self, project: &Path) -> PathBuf {
        resolve(
            self.stuck_detection.history_path.as_deref(),
            project,
            "stuck-history.json",
        )
    }
}

/// Take `key` out of `root` and deserialize it, or fall back to defaults.
fn section<T: DeserializeOwned + Default>(
    root: &mut Mapping,
    key: &str,
    warnings: &mut Vec<String>,
) -> T {
    match root.remove(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_yaml::from_value(value).unwrap_or_else(|e| {
            warnings.push(format!("{key}: {e}; using defaults for this section"));
            T::default()
        }),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Configured path (tilde-expanded, relative to `project`) or the default
/// file inside the project's state directory.
fn resolve(configured: Option<&str>, project: &Path, default_name: &str) -> PathBuf {
    match configured {
        Some(p) => {
            let p = expand_tilde(p);
            if p.is_absolute() { p } else { project.join(p) }
        }
        None => project.join(STATE_DIR).join(default_name),
    }
}

/// Expand a leading `~` to `$HOME`. Left unchanged when `HOME` is unset.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let rest = path.trim_start_matches('~').trim_start_matches('/');
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
