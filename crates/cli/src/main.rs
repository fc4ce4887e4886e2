mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use driftguard_core::Zone;

use commands::Scope;

#[derive(Debug, Parser)]
#[command(
    name = "driftguard",
    version,
    about = "Semantic drift and stuck-loop guard for agent tool hooks"
)]
struct Cli {
    /// Config file (default: <project>/.driftguard/config.yaml)
    #[arg(long, global = true, env = "DRIFTGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Project directory (default: the hook's cwd, else the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read one hook event as JSON from stdin and print the decision
    Hook,
    /// Clear the stuck-loop history
    ResetStuck,
    /// List or export recorded nodes
    Tree {
        #[arg(long)]
        session: Option<String>,
        /// Only nodes whose recorded ΔS falls in this zone
        #[arg(long, value_enum)]
        zone: Option<ZoneArg>,
        /// Most recent nodes to show when no session is given
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Write the tree as JSON to FILE, or to stdout with `-`
        #[arg(long, value_name = "FILE")]
        export: Option<String>,
    },
    /// Show resolved paths and store sizes
    Status,
    /// Print the config path, or the effective config with --show
    Config {
        #[arg(long)]
        show: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ZoneArg {
    Safe,
    Transitional,
    Risk,
    Danger,
}

impl From<ZoneArg> for Zone {
    fn from(arg: ZoneArg) -> Self {
        match arg {
            ZoneArg::Safe => Zone::Safe,
            ZoneArg::Transitional => Zone::Transitional,
            ZoneArg::Risk => Zone::Risk,
            ZoneArg::Danger => Zone::Danger,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let scope = Scope {
        config: cli.config,
        project: cli.project,
    };

    match cli.command {
        Command::Hook => commands::hook(&scope).await,
        Command::ResetStuck => commands::reset_stuck(&scope),
        Command::Tree {
            session,
            zone,
            limit,
            export,
        } => commands::tree(
            &scope,
            session.as_deref(),
            zone.map(Zone::from),
            limit,
            export.as_deref(),
        ),
        Command::Status => commands::status(&scope),
        Command::Config { show } => commands::config(&scope, show),
    }
}
