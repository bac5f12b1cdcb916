mod cli;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use agent_updater::config::{self, UpdaterConfig};
use agent_updater::control::{CommandServiceControl, ServiceControl, ServiceRunState, SystemServiceControl};
use agent_updater::health::HealthProber;
use agent_updater::update::plan::{self, UpdatePlan};
use agent_updater::update::status::JsonFileReporter;
use agent_updater::update::{Orchestrator, ScriptDialect, ScriptGenerator, StagedArtifact, UpdateOutcome};

fn main() {
    // Initialize logger with custom format
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();

    if let Err(e) = real_main() {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let args = cli::Args::parse();

    let cfg_path = match args.config {
        Some(path) => PathBuf::from(path),
        None => config::default_config_path(args.system)?,
    };
    let cfg = UpdaterConfig::load_or_init(&cfg_path)?;
    info!("Using config from: {}", cfg_path.display());

    match args.sub {
        cli::Cmd::Apply {
            artifact,
            target_version,
            exe,
            current_version,
            force,
            direct,
        } => handle_apply(&cfg, artifact, target_version, exe, current_version, force, direct),
        cli::Cmd::Rollback { exe, direct } => handle_rollback(&cfg, exe, direct),
        cli::Cmd::Render {
            artifact,
            target_version,
            exe,
            dialect,
        } => handle_render(&cfg, &artifact, &target_version, exe, dialect),
        cli::Cmd::Status => handle_status(&cfg),
        cli::Cmd::Outcome => handle_outcome(&cfg),
    }
}

fn resolve_exe(exe: Option<PathBuf>) -> Result<PathBuf> {
    match exe {
        Some(path) => std::path::absolute(&path)
            .with_context(|| format!("Failed to resolve {}", path.display())),
        None => plan::current_executable().context("Failed to resolve current executable"),
    }
}

fn service_control(cfg: &UpdaterConfig) -> Box<dyn ServiceControl> {
    match &cfg.service_commands {
        Some(commands) => Box::new(CommandServiceControl::new(commands.clone())),
        None => Box::new(SystemServiceControl),
    }
}

fn handle_apply(
    cfg: &UpdaterConfig,
    artifact: PathBuf,
    target_version: String,
    exe: Option<PathBuf>,
    current_version: Option<String>,
    force: bool,
    direct: bool,
) -> Result<()> {
    let exe = resolve_exe(exe)?;
    let artifact = std::path::absolute(&artifact)
        .with_context(|| format!("Failed to resolve {}", artifact.display()))?;

    let gate = if force { None } else { current_version };
    let orch = Orchestrator::from_config(cfg, gate);
    let source = StagedArtifact::new(artifact, target_version.clone());

    if direct {
        let control = service_control(cfg);
        match orch.update_in_place(&source, &exe, control.as_ref())? {
            UpdateOutcome::Success => {
                println!("Updated {} to v{target_version}", exe.display());
                return Ok(());
            }
            UpdateOutcome::RolledBack => {
                anyhow::bail!("v{target_version} did not reach running; previous version restored")
            }
            UpdateOutcome::FailedUnrecoverable => {
                anyhow::bail!("update to v{target_version} failed and {} is down", cfg.service_name)
            }
        }
    }

    let handoff = orch.update_from(&source, &exe)?;

    println!(
        "Update to v{} handed off ({})",
        handoff.target_version.as_deref().unwrap_or("?"),
        handoff.launch
    );
    println!("Script log: {}", handoff.log_path.display());
    Ok(())
}

fn handle_rollback(cfg: &UpdaterConfig, exe: Option<PathBuf>, direct: bool) -> Result<()> {
    let exe = resolve_exe(exe)?;
    let orch = Orchestrator::from_config(cfg, None);

    if direct {
        let control = service_control(cfg);
        let outcome = orch.rollback_in_place(&exe, control.as_ref())?;
        if outcome != UpdateOutcome::RolledBack {
            anyhow::bail!("{} restored but did not reach running", cfg.service_name);
        }
        println!("Rolled back {}", exe.display());
        return Ok(());
    }

    let handoff = orch.rollback(&exe)?;
    println!("Rollback handed off ({})", handoff.launch);
    println!("Script log: {}", handoff.log_path.display());
    Ok(())
}

fn handle_render(
    cfg: &UpdaterConfig,
    artifact: &Path,
    target_version: &str,
    exe: Option<PathBuf>,
    dialect: Option<ScriptDialect>,
) -> Result<()> {
    let dialect = dialect.unwrap_or_else(ScriptDialect::native);
    let exe = resolve_exe(exe)?;
    let artifact = std::path::absolute(artifact)
        .with_context(|| format!("Failed to resolve {}", artifact.display()))?;

    let plan = UpdatePlan::new(
        exe,
        artifact,
        target_version,
        cfg.log_path(),
        &cfg.service_name,
        dialect,
    )?;
    let script = ScriptGenerator::new(cfg.script_settings(dialect)).update(&plan)?;
    print!("{}", script.text);
    Ok(())
}

/// Exit 0 = running, 1 = otherwise
fn handle_status(cfg: &UpdaterConfig) -> Result<()> {
    let control = service_control(cfg);
    let prober = HealthProber::new(control.as_ref(), cfg.probe_timeout(), cfg.probe_interval());
    let state = prober.probe(&cfg.service_name);
    println!("{} is {state}", cfg.service_name);

    match JsonFileReporter::read(&cfg.status_path()) {
        Ok(Some(last)) => println!(
            "last update: {} ({}%) {} at {}",
            last.state,
            last.percent,
            last.message,
            last.at.to_rfc3339()
        ),
        Ok(None) => {}
        Err(e) => eprintln!("Error reading status file: {e:#}"),
    }

    if state != ServiceRunState::Running {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_outcome(cfg: &UpdaterConfig) -> Result<()> {
    let orch = Orchestrator::from_config(cfg, None);
    if let Some(script) = orch.pending_script() {
        println!("Update script still running: {}", script.display());
        return Ok(());
    }

    match orch.report_previous_outcome() {
        Some(verdict) => println!("Previous update: {verdict}"),
        None => println!("No update result to report"),
    }
    Ok(())
}
