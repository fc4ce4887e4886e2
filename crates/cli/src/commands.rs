use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use driftguard_core::config::DriftCfg;
use driftguard_core::guard::stuck::{load_history, reset_stuck_history};
use driftguard_core::hook::{HookRuntime, build_embedder, fail_open};
use driftguard_core::memory::{SemanticMemory, ZoneSummary};
use driftguard_core::{HookContext, HookResult, SemanticNode, Zone, persist};
use driftguard_embed::Embedder;

use crate::logging;

/// Global flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub config: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

/// Effective configuration for one project.
struct Loaded {
    project: PathBuf,
    config_path: PathBuf,
    cfg: DriftCfg,
}

impl Scope {
    /// `--project`, else the hook's working directory, else the process cwd.
    fn project_dir(&self, hint: Option<&str>) -> PathBuf {
        if let Some(p) = &self.project {
            return p.clone();
        }
        if let Some(h) = hint.filter(|h| !h.is_empty()) {
            return PathBuf::from(h);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Load config and start logging. Config problems are logged once the
    /// subscriber is up and never abort the command.
    fn load(&self, hint: Option<&str>) -> Loaded {
        let project = self.project_dir(hint);
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| DriftCfg::default_path(&project));

        let (cfg, warnings) = match DriftCfg::load(&config_path) {
            Ok(loaded) => loaded,
            Err(e) => (
                DriftCfg::default(),
                vec![format!("config unreadable ({e}), using defaults")],
            ),
        };
        if let Err(e) = logging::init(&cfg.logging) {
            eprintln!("driftguard: logging disabled: {e:#}");
        }
        for w in &warnings {
            tracing::warn!(path = %config_path.display(), "{w}");
        }

        Loaded {
            project,
            config_path,
            cfg,
        }
    }
}

/// Read one event from stdin, decide, write one result to stdout.
/// Every policy outcome, malformed input included, exits successfully.
pub async fn hook(scope: &Scope) -> anyhow::Result<()> {
    let mut input = String::new();
    let parsed = match std::io::stdin().read_to_string(&mut input) {
        Ok(_) => serde_json::from_str::<HookContext>(&input).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let hint = parsed.as_ref().ok().and_then(|ctx| ctx.cwd.clone());
    let loaded = scope.load(hint.as_deref());

    let result = match parsed {
        Err(e) => fail_open(&format!("malformed hook input: {e}")),
        Ok(ctx) => {
            let runtime = HookRuntime::from_config(&loaded.cfg, &loaded.project);
            // A panic inside the guard surfaces as a JoinError, not a crash.
            match tokio::spawn(async move { runtime.handle(&ctx).await }).await {
                Ok(result) => result,
                Err(e) => fail_open(&format!("hook task failed: {e}")),
            }
        }
    };

    tracing::debug!(
        allow = result.allow,
        block = result.block,
        msg = ?result.message,
        "hook result"
    );
    emit(&result)
}

fn emit(result: &HookResult) -> anyhow::Result<()> {
    let json = serde_json::to_string(result)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{json}").context("writing hook result to stdout")?;
    out.flush().context("flushing stdout")?;
    Ok(())
}

pub fn reset_stuck(scope: &Scope) -> anyhow::Result<()> {
    let loaded = scope.load(None);
    let path = loaded.cfg.history_path(&loaded.project);
    reset_stuck_history(&path)
        .with_context(|| format!("resetting stuck history at {}", path.display()))?;
    tracing::info!(path = %path.display(), "stuck history reset");
    println!("Stuck history cleared: {}", path.display());
    Ok(())
}

pub fn tree(
    scope: &Scope,
    session: Option<&str>,
    zone: Option<Zone>,
    limit: usize,
    export: Option<&str>,
) -> anyhow::Result<()> {
    let loaded = scope.load(None);
    let thresholds = loaded.cfg.thresholds;
    let memory = open_memory(&loaded);

    if let Some(file) = export {
        let tree = memory
            .export_tree(session, limit, &thresholds)
            .with_context(|| format!("reading {}", memory.path().display()))?;
        if file == "-" {
            println!("{}", serde_json::to_string_pretty(&tree)?);
        } else {
            let path = Path::new(file);
            persist::write_json_atomic(path, &tree)
                .with_context(|| format!("exporting to {}", path.display()))?;
            println!("Exported {} nodes to {}", tree.node_count, path.display());
        }
        return Ok(());
    }

    let mut nodes = match zone {
        Some(zone) => memory.get_by_zone(zone, &thresholds, limit),
        None => memory.get_recent(limit, session, false),
    }
    .with_context(|| format!("reading {}", memory.path().display()))?;
    if let (Some(_), Some(s)) = (zone, session) {
        nodes.retain(|n| n.session_id == s);
    }
    if nodes.is_empty() {
        println!("No recorded nodes in {}", memory.path().display());
        return Ok(());
    }

    nodes.reverse();
    println!("Recent semantic nodes ({})", nodes.len());
    for node in &nodes {
        print_node(node, node.zone(&thresholds));
    }
    let summary: ZoneSummary = nodes.iter().map(|n| n.zone(&thresholds)).collect();
    let counts: Vec<String> = Zone::ALL
        .iter()
        .map(|z| format!("{z} {}", summary.get(*z)))
        .collect();
    println!("\n{}", counts.join(" | "));
    Ok(())
}

fn print_node(node: &SemanticNode, zone: Zone) {
    let insight = node.insight.lines().next().unwrap_or_default();
    let mut short: String = insight.chars().take(80).collect();
    if insight.chars().count() > 80 {
        short.push_str("...");
    }
    let tag = format!("[{zone}]");
    println!("\n{tag:<14} {}", node.topic);
    println!(
        "   ΔS={:.3} | {} | {}",
        node.delta_s, node.lambda_observe, node.source_tool
    );
    if !short.is_empty() {
        println!("   {short}");
    }
    println!(
        "   {}  session {}",
        node.created_at.format("%Y-%m-%d %H:%M:%S"),
        node.session_id
    );
}

pub fn status(scope: &Scope) -> anyhow::Result<()> {
    let loaded = scope.load(None);
    let cfg = &loaded.cfg;
    let memory = open_memory(&loaded);
    let history = cfg.history_path(&loaded.project);

    let config_state = if loaded.config_path.exists() {
        "found"
    } else {
        "missing, using defaults"
    };
    let provider = build_embedder(&cfg.embedding)
        .map(|e| format!("{} ({} dims)", e.name(), e.dimensions()))
        .unwrap_or_else(|| "unavailable, drift guard disabled".into());
    let nodes = match memory.count() {
        Ok(n) => n.to_string(),
        Err(e) => format!("unreadable: {e}"),
    };

    println!("project:   {}", loaded.project.display());
    println!("config:    {} ({config_state})", loaded.config_path.display());
    println!("embedder:  {provider}");
    println!("memory:    {} ({nodes} nodes)", memory.path().display());
    println!(
        "stuck:     {} ({} entries, {})",
        history.display(),
        load_history(&history).len(),
        if cfg.stuck_detection.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

pub fn config(scope: &Scope, show: bool) -> anyhow::Result<()> {
    let loaded = scope.load(None);
    if show {
        print!("{}", serde_yaml::to_string(&loaded.cfg)?);
    } else {
        println!("{}", loaded.config_path.display());
    }
    Ok(())
}

fn open_memory(loaded: &Loaded) -> SemanticMemory {
    SemanticMemory::open(
        loaded.cfg.memory_path(&loaded.project),
        loaded.cfg.memory.max_nodes,
    )
}
