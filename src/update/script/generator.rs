//! Builds the update and rollback templates from a plan and renders them.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::render::{ScriptDialect, render};
use super::template::{Command, Label, ScriptTemplate, Section, Step};
use crate::config::ServiceCommands;
use crate::update::error::TemplateError;
use crate::update::outcome;
use crate::update::plan::{RollbackPlan, UpdatePlan};

/// Timing and service commands embedded in generated scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    pub dialect: ScriptDialect,
    /// Templates with a `{service}` placeholder
    pub commands: ServiceCommands,
    /// Time given to the agent to finish reporting before it is stopped
    pub grace_period_secs: u32,
    pub stop_wait_secs: u32,
    pub start_wait_secs: u32,
}

impl ScriptSettings {
    pub fn new(dialect: ScriptDialect) -> Self {
        Self {
            dialect,
            commands: ServiceCommands::for_dialect(dialect),
            grace_period_secs: 3,
            stop_wait_secs: 2,
            start_wait_secs: 3,
        }
    }
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self::new(ScriptDialect::native())
    }
}

/// A rendered script and where it goes. Written once, never modified after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub dialect: ScriptDialect,
    pub path: PathBuf,
    pub log_path: PathBuf,
    pub text: String,
}

impl GeneratedScript {
    /// Write the script atomically next to its final location.
    pub fn write(&self) -> io::Result<()> {
        let dir = self.path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "script path has no parent directory")
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.text.as_bytes())?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file().set_permissions(fs::Permissions::from_mode(0o755))?;
        }

        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Best-effort removal after a failed launch.
    pub fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove unlaunched script {}: {e}", self.path.display());
        }
    }
}

pub struct ScriptGenerator {
    settings: ScriptSettings,
}

impl ScriptGenerator {
    pub fn new(settings: ScriptSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ScriptSettings {
        &self.settings
    }

    /// Build, check and render the full update script for `plan`.
    pub fn update(&self, plan: &UpdatePlan) -> Result<GeneratedScript, TemplateError> {
        let template = self.update_template(plan);
        self.finish(&template, plan.service_name(), plan.script_path(), plan.log_path())
    }

    /// Build, check and render the rollback-only script for `plan`.
    pub fn rollback(&self, plan: &RollbackPlan) -> Result<GeneratedScript, TemplateError> {
        let template = self.rollback_template(plan);
        self.finish(&template, plan.service_name(), plan.script_path(), plan.log_path())
    }

    fn finish(
        &self,
        template: &ScriptTemplate,
        service: &str,
        script_path: &Path,
        log_path: &Path,
    ) -> Result<GeneratedScript, TemplateError> {
        let paths = template.check_recovery()?;
        log::debug!("script template has {} execution paths", paths.len());

        let commands = self.settings.commands.for_service(service);
        Ok(GeneratedScript {
            dialect: self.settings.dialect,
            path: script_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            text: render(template, self.settings.dialect, &commands),
        })
    }

    pub fn update_template(&self, plan: &UpdatePlan) -> ScriptTemplate {
        let s = &self.settings;
        let version = plan.target_version();
        let current = plan.current_executable().to_path_buf();
        let backup = plan.backup_path().to_path_buf();
        let artifact = plan.downloaded_artifact().to_path_buf();

        let mut main = vec![
            Step::log(format!("Starting update to v{version}")),
            Step::log(format!("Current executable: {}", current.display())),
            Step::log(format!("New executable: {}", artifact.display())),
        ];
        main.extend(grace_steps(s.grace_period_secs));
        main.extend(stop_steps(s.stop_wait_secs));
        main.extend([
            Step::log("Removing stale backup"),
            Step::on_failure(
                Command::DeleteIfExists(backup.clone()),
                vec![
                    Step::log("Failed to remove stale backup"),
                    Step::Goto(Label::RestartOld),
                ],
            ),
            Step::log("Stale backup removed"),
            Step::log("Backing up current executable"),
            Step::on_failure(
                Command::Move {
                    from: current.clone(),
                    to: backup.clone(),
                },
                vec![
                    Step::log("Failed to back up current executable"),
                    Step::Goto(Label::RestartOld),
                ],
            ),
            Step::log("Backup created"),
            Step::log("Moving new executable into place"),
            Step::on_failure(
                Command::Move {
                    from: artifact,
                    to: current.clone(),
                },
                vec![
                    Step::log("Failed to move new executable into place"),
                    Step::Goto(Label::Rollback),
                ],
            ),
            Step::log("New executable in place"),
            Step::log("Starting service"),
            Step::Run(Command::StartService),
            Step::log("Start command issued"),
            Step::Sleep(s.start_wait_secs),
            Step::log("Checking service health"),
            Step::on_failure(
                Command::QueryRunning,
                vec![
                    Step::log(format!("Service did not reach running with v{version}")),
                    Step::Goto(Label::Rollback),
                ],
            ),
            Step::log(format!("Service is running v{version}")),
            Step::log("Removing backup"),
            Step::Run(Command::DeleteIfExists(backup.clone())),
            Step::log("Backup removed"),
            Step::log(outcome::success_line(version)),
            Step::Goto(Label::Cleanup),
        ]);

        ScriptTemplate::new(
            plan.log_path(),
            vec![
                Section::main(main),
                Section::labeled(
                    Label::Rollback,
                    rollback_steps(
                        &current,
                        &backup,
                        s.stop_wait_secs,
                        outcome::rolled_back_line(version),
                    ),
                ),
                Section::labeled(Label::RestartOld, restart_steps(outcome::restarted_line(version))),
                Section::labeled(Label::Cleanup, cleanup_steps(plan.script_path())),
            ],
        )
    }

    pub fn rollback_template(&self, plan: &RollbackPlan) -> ScriptTemplate {
        let s = &self.settings;
        let mut rollback = grace_steps(s.grace_period_secs);
        rollback.extend(rollback_steps(
            plan.current_executable(),
            plan.backup_path(),
            s.stop_wait_secs,
            outcome::MANUAL_ROLLBACK_LINE.to_string(),
        ));

        ScriptTemplate::new(
            plan.log_path(),
            vec![
                Section::main(vec![Step::log("Starting manual rollback")]),
                Section::labeled(Label::Rollback, rollback),
                Section::labeled(
                    Label::RestartOld,
                    restart_steps(outcome::MANUAL_RESTART_LINE.to_string()),
                ),
                Section::labeled(Label::Cleanup, cleanup_steps(plan.script_path())),
            ],
        )
    }
}

fn grace_steps(secs: u32) -> Vec<Step> {
    vec![
        Step::log(format!("Waiting {secs}s before stopping service")),
        Step::Sleep(secs),
        Step::log("Wait finished"),
    ]
}

/// Stop unless already stopped; the closing line covers both cases.
fn stop_steps(wait_secs: u32) -> Vec<Step> {
    vec![
        Step::log("Checking service state"),
        Step::on_failure(
            Command::QueryStopped,
            vec![
                Step::log("Stopping service"),
                Step::Run(Command::StopService),
                Step::Sleep(wait_secs),
            ],
        ),
        Step::log("Service stopped"),
    ]
}

fn rollback_steps(current: &Path, backup: &Path, stop_wait_secs: u32, done: String) -> Vec<Step> {
    let mut steps = vec![Step::log("Rolling back to previous executable")];
    steps.extend(stop_steps(stop_wait_secs));
    steps.extend([
        Step::log("Removing failed executable"),
        Step::Run(Command::DeleteIfExists(current.to_path_buf())),
        Step::log("Failed executable removed"),
        Step::log("Restoring backup"),
        Step::on_failure(
            Command::Move {
                from: backup.to_path_buf(),
                to: current.to_path_buf(),
            },
            vec![
                Step::log("Failed to restore backup"),
                Step::Goto(Label::RestartOld),
            ],
        ),
        Step::log(done),
    ]);
    steps
}

// The outcome line closes the section so it is the last line in the log.
fn restart_steps(done: String) -> Vec<Step> {
    vec![
        Step::log(outcome::RESTARTING_LINE),
        Step::Run(Command::StartService),
        Step::log(done),
    ]
}

// Silent, so the outcome line stays last in the log.
fn cleanup_steps(script_path: &Path) -> Vec<Step> {
    vec![Step::Run(Command::RemoveSelf(script_path.to_path_buf()))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::script::analysis::Event;

    struct Fixture {
        _dir: tempfile::TempDir,
        plan: UpdatePlan,
        rollback: RollbackPlan,
    }

    fn fixture(dialect: ScriptDialect) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("agent");
        let artifact = dir.path().join("agent.download");
        fs::write(&exe, b"old").unwrap();
        fs::write(&artifact, b"new").unwrap();
        let log = dir.path().join("agent-update.log");

        let plan = UpdatePlan::new(&exe, &artifact, "3.1.0", &log, "agent", dialect).unwrap();
        let rollback = RollbackPlan::new(&exe, &log, "agent", dialect).unwrap();
        Fixture {
            _dir: dir,
            plan,
            rollback,
        }
    }

    fn generator(dialect: ScriptDialect) -> ScriptGenerator {
        ScriptGenerator::new(ScriptSettings::new(dialect))
    }

    #[test]
    fn every_update_path_restarts_the_service_and_cleans_up() {
        let f = fixture(ScriptDialect::Posix);
        let paths = generator(ScriptDialect::Posix)
            .update_template(&f.plan)
            .check_recovery()
            .unwrap();

        // already-stopped x {backup fails, install fails, probe fails, success}
        // plus the restore failure inside each rollback
        assert!(paths.len() >= 8);
        for path in &paths {
            assert!(!path.leaves_service_stopped(), "{path}");
            assert!(path.ends_with_cleanup(), "{path}");
            if path.contains(Event::SwapFailed) {
                assert!(
                    path.contains(Event::Entered(Label::Rollback))
                        || path.contains(Event::Entered(Label::RestartOld)),
                    "{path}"
                );
            }
        }
    }

    #[test]
    fn success_path_skips_recovery_sections() {
        let f = fixture(ScriptDialect::Posix);
        let paths = generator(ScriptDialect::Posix)
            .update_template(&f.plan)
            .execution_paths()
            .unwrap();

        assert_eq!(
            paths[0].events(),
            [Event::Started, Event::Entered(Label::Cleanup), Event::RemovedSelf]
        );
    }

    #[test]
    fn rollback_template_is_a_subset_of_the_update_recovery() {
        let f = fixture(ScriptDialect::Posix);
        let g = generator(ScriptDialect::Posix);
        let template = g.rollback_template(&f.rollback);
        template.check_recovery().unwrap();

        assert!(template.steps().all(|step| !matches!(
            step,
            Step::Run(Command::Move { .. }) | Step::Run(Command::QueryRunning)
        )));
        let moves: Vec<_> = template
            .steps()
            .filter_map(|step| match step {
                Step::OnFailure {
                    command: Command::Move { from, to },
                    ..
                } => Some((from.clone(), to.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            moves,
            [(f.rollback.backup_path().to_path_buf(), f.rollback.current_executable().to_path_buf())]
        );
    }

    #[test]
    fn outcome_lines_are_the_last_logged_lines() {
        let f = fixture(ScriptDialect::Batch);
        let script = generator(ScriptDialect::Batch).update(&f.plan).unwrap();

        let echoes: Vec<&str> = script
            .text
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("echo "))
            .collect();
        assert!(echoes.iter().any(|l| l.contains("Update to v3.1.0 successful")));
        assert!(echoes.last().unwrap().contains("Restarted previous version after failed update to v3.1.0"));

        let rolled_back = echoes
            .iter()
            .position(|l| l.contains("Rolled back failed update to v3.1.0"))
            .unwrap();
        // restart-old logs its start before the closing line
        assert!(echoes[rolled_back + 1].contains("Starting previous version"));
        assert_eq!(rolled_back + 3, echoes.len());
    }

    #[test]
    fn batch_script_embeds_windows_service_commands() {
        let f = fixture(ScriptDialect::Batch);
        let script = generator(ScriptDialect::Batch).update(&f.plan).unwrap();

        assert!(script.text.starts_with("@echo off\r\nsetlocal\r\n"));
        assert!(script.text.contains("sc query \"agent\" | find \"STOPPED\" > nul\r\nif %errorlevel% neq 0 (\r\n"));
        assert!(script.text.contains("net start \"agent\" > nul 2>&1"));
        assert!(script.text.contains("\r\n:rollback\r\n"));
        assert!(script.text.contains("goto :restart_old"));
        assert!(!script.text.contains("{service}"));
        assert_eq!(script.path, f.plan.script_path());
    }

    #[test]
    fn generation_is_deterministic() {
        let f = fixture(ScriptDialect::Posix);
        let g = generator(ScriptDialect::Posix);
        assert_eq!(g.update(&f.plan).unwrap(), g.update(&f.plan).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn written_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture(ScriptDialect::Posix);
        let script = generator(ScriptDialect::Posix).update(&f.plan).unwrap();
        script.write().unwrap();

        assert_eq!(fs::read_to_string(&script.path).unwrap(), script.text);
        let mode = fs::metadata(&script.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        script.discard();
        assert!(!script.path.exists());
    }
}
