use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use driftguard_core::config::{LoggingCfg, expand_tilde};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// JSON logs to `logging.file` when set, else stderr. Stdout carries the
/// hook protocol and never receives log lines.
///
/// `RUST_LOG` overrides `logging.level`.
pub fn init(cfg: &LoggingCfg) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match cfg.file.as_deref() {
        Some(path) => {
            let path = expand_tilde(path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_writer(Mutex::new(file)))
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .try_init()?;
        }
    }
    Ok(())
}
