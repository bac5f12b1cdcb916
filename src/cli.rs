use std::path::PathBuf;

use clap::{Parser, Subcommand};

use agent_updater::update::ScriptDialect;

#[derive(Parser, Debug)]
#[command(version, about = "agent self-update orchestrator")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Use system-wide config (/etc/agent-updater/updater.toml)
    #[arg(long, global = true, conflicts_with = "config")]
    pub system: bool,

    #[command(subcommand)]
    pub sub: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Hand a staged, verified binary to a detached update script
    Apply {
        /// Downloaded replacement executable
        #[arg(long)]
        artifact: PathBuf,

        /// Version of the replacement
        #[arg(long = "version")]
        target_version: String,

        /// Executable to replace (defaults to this binary)
        #[arg(long)]
        exe: Option<PathBuf>,

        /// Running version; older or equal targets are refused
        #[arg(long)]
        current_version: Option<String>,

        /// Skip the version check
        #[arg(long)]
        force: bool,

        /// Swap and verify from this process instead of a script
        #[arg(long)]
        direct: bool,
    },
    /// Restore the previous executable from its backup
    Rollback {
        /// Executable to restore (defaults to this binary)
        #[arg(long)]
        exe: Option<PathBuf>,

        /// Stop, restore and start from this process instead of a script
        #[arg(long)]
        direct: bool,
    },
    /// Print the update script without launching it
    Render {
        #[arg(long)]
        artifact: PathBuf,

        #[arg(long = "version")]
        target_version: String,

        #[arg(long)]
        exe: Option<PathBuf>,

        #[arg(long, value_enum)]
        dialect: Option<ScriptDialect>,
    },
    /// Probe the managed service (Exit 0 = running, 1 = otherwise)
    Status,
    /// Report the result of the last update script
    Outcome,
}
