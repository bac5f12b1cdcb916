//! Update orchestrator
//!
//! Owns one update (or rollback) attempt at a time. Everything up to the
//! script launch happens synchronously and changes nothing in the
//! installation; after a successful launch the script has sole authority and
//! the result is read back from its log on the next start.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::artifact::{ArtifactSource, VerifiedArtifact};
use super::error::{PlanError, UpdateError};
use super::outcome::{self, ScriptVerdict};
use super::plan::{self, RollbackPlan, UpdatePlan};
use super::protection::{ProtectionToggle, default_protection};
use super::runner::{DetachedRunner, LaunchHandle, Launcher};
use super::script::{GeneratedScript, ScriptDialect, ScriptGenerator, ScriptSettings};
use super::status::{
    JsonFileReporter, LogReporter, StatusReporter, StatusUpdate, UpdateOutcome, UpdateState,
};
use super::swap::{SwapExecutor, prepare_artifact};
use super::version;
use crate::config::UpdaterConfig;
use crate::control::{ServiceControl, ServiceRunState};
use crate::health::HealthProber;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub service_name: String,
    /// Holds the script, its log and the archived previous log
    pub state_dir: PathBuf,
    /// Version of the running agent, used to refuse downgrades
    pub current_version: Option<String>,
    pub allow_downgrade: bool,
    pub script: ScriptSettings,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &UpdaterConfig, dialect: ScriptDialect) -> Self {
        Self {
            service_name: cfg.service_name.clone(),
            state_dir: cfg.state_dir(),
            current_version: None,
            allow_downgrade: false,
            script: cfg.script_settings(dialect),
            probe_timeout: cfg.probe_timeout(),
            probe_interval: cfg.probe_interval(),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("{}-update.log", self.service_name))
    }
}

/// Returned once the script has been handed off. The attempt's outcome is
/// not known yet.
#[derive(Debug, Clone)]
pub struct Handoff {
    /// `None` for a rollback
    pub target_version: Option<String>,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub launch: LaunchHandle,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    generator: ScriptGenerator,
    launcher: Box<dyn Launcher>,
    protection: Box<dyn ProtectionToggle>,
    reporter: Box<dyn StatusReporter>,
    in_flight: AtomicBool,
    status: Mutex<StatusUpdate>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        launcher: Box<dyn Launcher>,
        protection: Box<dyn ProtectionToggle>,
        reporter: Box<dyn StatusReporter>,
    ) -> Self {
        let generator = ScriptGenerator::new(settings.script.clone());
        Self {
            settings,
            generator,
            launcher,
            protection,
            reporter,
            in_flight: AtomicBool::new(false),
            status: Mutex::new(StatusUpdate::idle()),
        }
    }

    /// Native dialect, configured launcher and platform protection; status
    /// goes to the log and the configured JSON file.
    pub fn from_config(cfg: &UpdaterConfig, current_version: Option<String>) -> Self {
        let dialect = ScriptDialect::native();
        let mut settings = OrchestratorSettings::from_config(cfg, dialect);
        settings.current_version = current_version;

        let reporters: Vec<Box<dyn StatusReporter>> = vec![
            Box::new(LogReporter),
            Box::new(JsonFileReporter::new(cfg.status_path())),
        ];

        Self::new(
            settings,
            Box::new(DetachedRunner::new(cfg.launch_strategy(), cfg.task_name.clone())),
            default_protection(),
            Box::new(reporters),
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn state(&self) -> UpdateState {
        self.status().state
    }

    pub fn status(&self) -> StatusUpdate {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Claim the single in-flight slot. This is the only place the flag is
    /// set; it is cleared only when an attempt fails before handoff or a
    /// direct rollback completes.
    pub fn try_begin_update(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    fn publish(&self, update: StatusUpdate) {
        {
            let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            *current = update.clone();
        }
        self.reporter.report(&update);
    }

    /// Fetch from `source`, then install as [`apply`](Self::apply) does.
    pub fn update_from(&self, source: &dyn ArtifactSource, current_exe: &Path) -> Result<Handoff, UpdateError> {
        if !self.try_begin_update() {
            return Err(UpdateError::AlreadyInProgress);
        }

        self.publish(StatusUpdate::new(UpdateState::Downloading, "Fetching update...", 0));
        let artifact = match source.fetch() {
            Ok(artifact) => artifact,
            Err(e) => return self.settle(None, Err(e.into())),
        };

        let result = self.install(&artifact, current_exe);
        self.settle(Some(&artifact.version), result)
    }

    /// Hand a verified artifact to a detached update script.
    pub fn apply(&self, artifact: VerifiedArtifact, current_exe: &Path) -> Result<Handoff, UpdateError> {
        if !self.try_begin_update() {
            return Err(UpdateError::AlreadyInProgress);
        }

        let result = self.install(&artifact, current_exe);
        self.settle(Some(&artifact.version), result)
    }

    /// Report a pre-handoff failure and free the slot.
    fn settle(&self, version: Option<&str>, result: Result<Handoff, UpdateError>) -> Result<Handoff, UpdateError> {
        if let Err(e) = &result {
            log::error!("Update failed before handoff: {e}");
            let mut update = StatusUpdate::finished(UpdateOutcome::FailedUnrecoverable, format!("Update failed: {e}"));
            if let Some(version) = version {
                update = update.with_version(version);
            }
            self.publish(update);
            self.release();
        }
        result
    }

    fn install(&self, artifact: &VerifiedArtifact, current_exe: &Path) -> Result<Handoff, UpdateError> {
        let target = artifact.version.as_str();
        self.publish(StatusUpdate::new(UpdateState::Installing, "Installing update...", 50).with_version(target));

        self.check_version(target)?;
        self.ensure_no_pending_script()?;

        self.ensure_state_dir()?;
        let plan = UpdatePlan::new(
            current_exe,
            &artifact.path,
            target,
            self.settings.log_path(),
            &self.settings.service_name,
            self.settings.script.dialect,
        )?;

        self.disable_protections(plan.current_executable());
        prepare_artifact(plan.downloaded_artifact()).map_err(|source| UpdateError::Prepare {
            path: plan.downloaded_artifact().to_path_buf(),
            source,
        })?;

        let script = self.generator.update(&plan)?;
        let launch = self.hand_off(&script)?;

        self.publish(
            StatusUpdate::new(
                UpdateState::Installing,
                format!("Update to v{target} handed off, service will restart"),
                100,
            )
            .with_version(target),
        );

        Ok(Handoff {
            target_version: Some(target.to_string()),
            script_path: script.path,
            log_path: script.log_path,
            launch,
        })
    }

    /// Restore the backup through a detached rollback-only script.
    pub fn rollback(&self, current_exe: &Path) -> Result<Handoff, UpdateError> {
        if !self.try_begin_update() {
            return Err(UpdateError::AlreadyInProgress);
        }
        let result = self.scripted_rollback(current_exe);
        self.settle(None, result)
    }

    fn scripted_rollback(&self, current_exe: &Path) -> Result<Handoff, UpdateError> {
        self.publish(StatusUpdate::new(UpdateState::Installing, "Rolling back to previous version...", 50));
        self.ensure_no_pending_script()?;

        let swap = SwapExecutor::new(current_exe);
        if !swap.has_backup() {
            return Err(PlanError::NoBackup(swap.backup().to_path_buf()).into());
        }

        self.ensure_state_dir()?;
        let plan = RollbackPlan::new(
            current_exe,
            self.settings.log_path(),
            &self.settings.service_name,
            self.settings.script.dialect,
        )?;

        self.disable_protections(plan.current_executable());
        let script = self.generator.rollback(&plan)?;
        let launch = self.hand_off(&script)?;

        self.publish(StatusUpdate::new(
            UpdateState::Installing,
            "Rollback handed off, service will restart",
            100,
        ));

        Ok(Handoff {
            target_version: None,
            script_path: script.path,
            log_path: script.log_path,
            launch,
        })
    }

    /// Fetch from `source` and install in this process: stop, wait for
    /// stopped, swap, start, wait for running. A service that does not come
    /// up is rolled back the same way.
    ///
    /// Like [`rollback_in_place`](Self::rollback_in_place), only usable from
    /// outside the managed service.
    pub fn update_in_place(
        &self,
        source: &dyn ArtifactSource,
        current_exe: &Path,
        control: &dyn ServiceControl,
    ) -> Result<UpdateOutcome, UpdateError> {
        if !self.try_begin_update() {
            return Err(UpdateError::AlreadyInProgress);
        }

        self.publish(StatusUpdate::new(UpdateState::Downloading, "Fetching update...", 0));
        let (version, result) = match source.fetch() {
            Ok(artifact) => {
                let result = self.direct_install(&artifact, current_exe, control);
                (Some(artifact.version), result)
            }
            Err(e) => (None, Err(e.into())),
        };

        let target = version.as_deref().unwrap_or("?");
        let update = match &result {
            Ok(UpdateOutcome::Success) => StatusUpdate::finished(UpdateOutcome::Success, format!("Updated to v{target}")),
            Ok(outcome @ UpdateOutcome::RolledBack) => {
                StatusUpdate::finished(*outcome, format!("Update to v{target} failed, previous version restored"))
            }
            Ok(outcome) => StatusUpdate::finished(*outcome, format!("Update to v{target} failed and the service is down")),
            Err(e) => {
                log::error!("Direct update failed: {e}");
                StatusUpdate::finished(UpdateOutcome::FailedUnrecoverable, format!("Update failed: {e}"))
            }
        };
        self.publish(match version.as_deref() {
            Some(v) => update.with_version(v),
            None => update,
        });

        self.release();
        result
    }

    fn direct_install(
        &self,
        artifact: &VerifiedArtifact,
        current_exe: &Path,
        control: &dyn ServiceControl,
    ) -> Result<UpdateOutcome, UpdateError> {
        let target = artifact.version.as_str();
        let service = self.settings.service_name.as_str();
        self.check_version(target)?;
        self.ensure_no_pending_script()?;

        let plan = UpdatePlan::new(
            current_exe,
            &artifact.path,
            target,
            self.settings.log_path(),
            service,
            self.settings.script.dialect,
        )?;
        self.disable_protections(plan.current_executable());
        prepare_artifact(plan.downloaded_artifact()).map_err(|source| UpdateError::Prepare {
            path: plan.downloaded_artifact().to_path_buf(),
            source,
        })?;

        let swap = SwapExecutor::for_plan(&plan);
        let prober = HealthProber::new(control, self.settings.probe_timeout, self.settings.probe_interval);

        self.publish(StatusUpdate::new(UpdateState::Installing, "Installing update...", 25).with_version(target));
        stop_and_wait(control, &prober, service)?;

        if let Err(e) = swap.install(plan.downloaded_artifact()) {
            restart(control, service);
            return Err(e.into());
        }

        self.publish(StatusUpdate::new(UpdateState::Installing, format!("Starting v{target}"), 75).with_version(target));
        if let Err(e) = control.start(service) {
            log::warn!("Failed to start {service}: {e:#}");
        }

        if prober.wait_for(service, ServiceRunState::Running) {
            if let Err(e) = swap.discard_backup() {
                log::warn!("Failed to remove backup {}: {e}", swap.backup().display());
            }
            return Ok(UpdateOutcome::Success);
        }

        log::warn!("{service} did not reach running with v{target}, rolling back");
        stop_and_wait(control, &prober, service)?;
        if let Err(e) = swap.restore() {
            restart(control, service);
            return Err(e.into());
        }
        restart(control, service);

        if prober.wait_for(service, ServiceRunState::Running) {
            Ok(UpdateOutcome::RolledBack)
        } else {
            Ok(UpdateOutcome::FailedUnrecoverable)
        }
    }

    /// Restore the backup from this process: stop, wait for stopped, restore,
    /// start, wait for running.
    ///
    /// Only usable from outside the managed service, since stopping the
    /// service would otherwise stop the caller.
    pub fn rollback_in_place(&self, current_exe: &Path, control: &dyn ServiceControl) -> Result<UpdateOutcome, UpdateError> {
        if !self.try_begin_update() {
            return Err(UpdateError::AlreadyInProgress);
        }

        let result = self.direct_rollback(current_exe, control);
        match &result {
            Ok(outcome) => {
                let message = match outcome {
                    UpdateOutcome::RolledBack => "Rolled back to previous version",
                    _ => "Rolled back, but the service did not come back up",
                };
                self.publish(StatusUpdate::finished(*outcome, message));
            }
            Err(e) => {
                log::error!("Direct rollback failed: {e}");
                self.publish(StatusUpdate::finished(
                    UpdateOutcome::FailedUnrecoverable,
                    format!("Rollback failed: {e}"),
                ));
            }
        }
        self.release();
        result
    }

    fn direct_rollback(&self, current_exe: &Path, control: &dyn ServiceControl) -> Result<UpdateOutcome, UpdateError> {
        let service = self.settings.service_name.as_str();
        self.ensure_no_pending_script()?;
        let swap = SwapExecutor::new(current_exe);
        if !swap.has_backup() {
            return Err(PlanError::NoBackup(swap.backup().to_path_buf()).into());
        }

        self.publish(StatusUpdate::new(UpdateState::Installing, "Rolling back to previous version...", 25));
        let prober = HealthProber::new(control, self.settings.probe_timeout, self.settings.probe_interval);
        stop_and_wait(control, &prober, service)?;

        if let Err(e) = swap.restore() {
            restart(control, service);
            return Err(e.into());
        }

        self.publish(StatusUpdate::new(UpdateState::Installing, "Starting previous version", 75));
        if let Err(e) = control.start(service) {
            log::warn!("Failed to start {service}: {e:#}");
        }

        if prober.wait_for(service, ServiceRunState::Running) {
            Ok(UpdateOutcome::RolledBack)
        } else {
            Ok(UpdateOutcome::FailedUnrecoverable)
        }
    }

    /// Read the last script's log and report its outcome once.
    ///
    /// Returns `None` when there is nothing to report, or while a script is
    /// still present in the state directory (it removes itself last). The
    /// log is archived to `<log>.prev` after reporting.
    pub fn report_previous_outcome(&self) -> Option<ScriptVerdict> {
        let log_path = self.settings.log_path();
        if let Some(script) = self.pending_script() {
            log::info!("Update script {} has not finished yet", script.display());
            return None;
        }

        let verdict = match outcome::read_verdict(&log_path) {
            Ok(Some(verdict)) => verdict,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read {}: {e}", log_path.display());
                return None;
            }
        };

        self.publish(StatusUpdate::new(UpdateState::Verifying, "Checking previous update result", 0));

        let message = match &verdict {
            ScriptVerdict::Updated { version } => format!("Updated to v{version}"),
            ScriptVerdict::RolledBack { version } => {
                format!("Update to v{version} failed, previous version restored")
            }
            ScriptVerdict::RestartedOld { version } => {
                format!("Update to v{version} did not complete, previous version restarted")
            }
            ScriptVerdict::ManualRollback => "Rolled back to previous version".to_string(),
            ScriptVerdict::Incomplete { last_line } => format!(
                "Update script stopped early (last step: {})",
                last_line.as_deref().unwrap_or("none")
            ),
        };

        let mut update = StatusUpdate::finished(verdict.outcome(), message);
        if let Some(version) = verdict.version() {
            update = update.with_version(version);
        }
        self.publish(update);

        if let Err(e) = archive(&log_path) {
            log::warn!("Failed to archive {}: {e}", log_path.display());
        }
        Some(verdict)
    }

    /// An update or rollback script that has not removed itself yet.
    pub fn pending_script(&self) -> Option<PathBuf> {
        let service = &self.settings.service_name;
        let dialect = self.settings.script.dialect;
        [
            plan::update_script_name(service, dialect),
            plan::rollback_script_name(service, dialect),
        ]
        .into_iter()
        .map(|name| self.settings.state_dir.join(name))
        .find(|path| path.exists())
    }

    fn check_version(&self, target: &str) -> Result<(), UpdateError> {
        if let Some(current) = &self.settings.current_version
            && !self.settings.allow_downgrade
            && !version::is_newer(current, target)
        {
            return Err(UpdateError::NotNewer {
                current: current.clone(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// A script left by this or another instance owns the executable until it
    /// removes itself.
    fn ensure_no_pending_script(&self) -> Result<(), UpdateError> {
        match self.pending_script() {
            Some(script) => Err(UpdateError::ScriptPending(script)),
            None => Ok(()),
        }
    }

    fn ensure_state_dir(&self) -> Result<(), UpdateError> {
        let dir = &self.settings.state_dir;
        fs::create_dir_all(dir).map_err(|source| UpdateError::StateDir {
            path: dir.clone(),
            source,
        })
    }

    fn disable_protections(&self, current_exe: &Path) {
        let install_dir = current_exe.parent().unwrap_or(current_exe);
        if let Err(e) = self
            .protection
            .disable_protections(install_dir, &self.settings.service_name)
        {
            log::warn!("Failed to disable protections on {}: {e}", install_dir.display());
        }
    }

    /// Write the script, rotate the old log and launch. The script is
    /// removed again if the launch fails.
    fn hand_off(&self, script: &GeneratedScript) -> Result<LaunchHandle, UpdateError> {
        script.write().map_err(|source| UpdateError::WriteScript {
            path: script.path.clone(),
            source,
        })?;

        if let Err(e) = archive(&script.log_path) {
            log::warn!("Failed to rotate {}: {e}", script.log_path.display());
        }

        match self.launcher.launch(script) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                script.discard();
                Err(e.into())
            }
        }
    }
}

fn stop_and_wait(control: &dyn ServiceControl, prober: &HealthProber<'_>, service: &str) -> Result<(), UpdateError> {
    if prober.probe(service) == ServiceRunState::Stopped {
        return Ok(());
    }

    log::info!("Stopping {service}");
    control
        .stop(service)
        .map_err(|e| UpdateError::Service(format!("{e:#}")))?;
    if !prober.wait_for(service, ServiceRunState::Stopped) {
        restart(control, service);
        return Err(UpdateError::Service(format!("{service} did not stop")));
    }
    Ok(())
}

fn restart(control: &dyn ServiceControl, service: &str) {
    if let Err(e) = control.start(service) {
        log::error!("Failed to restart {service}: {e:#}");
    }
}

/// Move `path` to `<path>.prev`, replacing an older archive.
fn archive(path: &Path) -> io::Result<()> {
    let mut prev = path.as_os_str().to_owned();
    prev.push(".prev");
    match fs::rename(path, PathBuf::from(prev)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::artifact::StagedArtifact;
    use crate::update::error::{ArtifactError, LaunchError};
    use crate::update::runner::LaunchStrategy;
    use crate::update::status::ChannelReporter;
    use crossbeam_channel::Receiver;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct RecordingLauncher {
        launched: Arc<Mutex<Vec<GeneratedScript>>>,
        fail: bool,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, script: &GeneratedScript) -> Result<LaunchHandle, LaunchError> {
            if self.fail {
                return Err(LaunchError::NotFound("schtasks"));
            }
            self.launched.lock().unwrap().push(script.clone());
            Ok(LaunchHandle {
                strategy: LaunchStrategy::DetachedProcess,
                pid: Some(4242),
                task_name: None,
            })
        }
    }

    struct Install {
        dir: tempfile::TempDir,
        exe: PathBuf,
        artifact: PathBuf,
    }

    impl Install {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let exe = dir.path().join("agent");
            let artifact = dir.path().join("agent.download");
            fs::write(&exe, b"old build").unwrap();
            fs::write(&artifact, b"new build").unwrap();
            Self { dir, exe, artifact }
        }

        fn state_dir(&self) -> PathBuf {
            self.dir.path().join("state")
        }

        fn artifact(&self, version: &str) -> VerifiedArtifact {
            VerifiedArtifact {
                path: self.artifact.clone(),
                version: version.into(),
            }
        }
    }

    fn orchestrator(install: &Install, launcher: RecordingLauncher) -> (Orchestrator, Receiver<StatusUpdate>) {
        let (reporter, rx) = ChannelReporter::bounded(64);
        let settings = OrchestratorSettings {
            service_name: "agent".into(),
            state_dir: install.state_dir(),
            current_version: Some("1.0.0".into()),
            allow_downgrade: false,
            script: ScriptSettings::new(ScriptDialect::Posix),
            probe_timeout: Duration::from_millis(50),
            probe_interval: Duration::from_millis(1),
        };
        let orch = Orchestrator::new(
            settings,
            Box::new(launcher),
            Box::new(crate::update::protection::NoProtection),
            Box::new(reporter),
        );
        (orch, rx)
    }

    fn scripts_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "sh"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn successful_handoff_keeps_installing_and_the_slot() {
        let install = Install::new();
        let launcher = RecordingLauncher::default();
        let (orch, rx) = orchestrator(&install, launcher.clone());

        let handoff = orch.apply(install.artifact("1.1.0"), &install.exe).unwrap();
        assert_eq!(handoff.target_version.as_deref(), Some("1.1.0"));
        assert_eq!(handoff.launch.pid, Some(4242));
        assert!(handoff.script_path.exists());

        assert_eq!(orch.state(), UpdateState::Installing);
        assert!(orch.status().message.contains("handed off"));
        assert!(orch.is_in_flight());

        // nothing in the installation moved
        assert_eq!(fs::read(&install.exe).unwrap(), b"old build");
        assert_eq!(fs::read(&install.artifact).unwrap(), b"new build");

        let states: Vec<_> = rx.try_iter().map(|u| u.state).collect();
        assert_eq!(states, [UpdateState::Installing, UpdateState::Installing]);
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }

    #[test]
    fn second_update_while_installing_is_rejected() {
        let install = Install::new();
        let launcher = RecordingLauncher::default();
        let (orch, _rx) = orchestrator(&install, launcher.clone());

        orch.apply(install.artifact("1.1.0"), &install.exe).unwrap();
        let before = orch.status();

        let err = orch.apply(install.artifact("1.2.0"), &install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::AlreadyInProgress));
        assert!(matches!(orch.rollback(&install.exe), Err(UpdateError::AlreadyInProgress)));

        assert_eq!(orch.status(), before);
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(scripts_in(&install.state_dir()).len(), 1);
    }

    #[test]
    fn only_one_caller_wins_the_slot() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        let orch = Arc::new(orch);
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orch = Arc::clone(&orch);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if orch.try_begin_update() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn launch_failure_is_reported_and_releases_the_slot() {
        let install = Install::new();
        let launcher = RecordingLauncher {
            fail: true,
            ..Default::default()
        };
        let (orch, _rx) = orchestrator(&install, launcher);

        let err = orch.apply(install.artifact("1.1.0"), &install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::Launch(_)));

        let status = orch.status();
        assert_eq!(status.state, UpdateState::Failed);
        assert_eq!(status.outcome, Some(UpdateOutcome::FailedUnrecoverable));
        assert_eq!(status.target_version.as_deref(), Some("1.1.0"));

        assert!(scripts_in(&install.state_dir()).is_empty());
        assert_eq!(fs::read(&install.exe).unwrap(), b"old build");
        assert!(orch.try_begin_update());
    }

    #[test]
    fn older_target_is_refused_before_any_script_exists() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());

        let err = orch.apply(install.artifact("0.9.5"), &install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::NotNewer { .. }));
        assert!(scripts_in(&install.state_dir()).is_empty());
        assert!(!orch.is_in_flight());
    }

    #[test]
    fn missing_staged_artifact_fails_the_attempt() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());

        let source = StagedArtifact::new(install.dir.path().join("nope"), "1.1.0");
        let err = orch.update_from(&source, &install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::Artifact(ArtifactError::Missing(_))));
        assert_eq!(orch.state(), UpdateState::Failed);

        // a later attempt with a real artifact goes through
        let source = StagedArtifact::new(&install.artifact, "1.1.0");
        orch.update_from(&source, &install.exe).unwrap();
    }

    #[test]
    fn previous_log_is_rotated_on_handoff() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        fs::create_dir_all(install.state_dir()).unwrap();
        let log = orch.settings().log_path();
        fs::write(&log, "[t] Update to v0.9.0 successful\n").unwrap();

        orch.apply(install.artifact("1.1.0"), &install.exe).unwrap();
        assert!(!log.exists());
        assert!(install.state_dir().join("agent-update.log.prev").exists());
    }

    #[test]
    fn scripted_rollback_requires_a_backup() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());

        let err = orch.rollback(&install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::Plan(PlanError::NoBackup(_))));
        assert!(!orch.is_in_flight());

        fs::write(plan::backup_path_for(&install.exe), b"older build").unwrap();
        let handoff = orch.rollback(&install.exe).unwrap();
        assert_eq!(handoff.target_version, None);
        assert!(handoff.script_path.ends_with("agent-rollback.sh"));
    }

    #[test]
    fn previous_outcome_is_reported_once() {
        let install = Install::new();
        let (orch, rx) = orchestrator(&install, RecordingLauncher::default());
        fs::create_dir_all(install.state_dir()).unwrap();
        let log = orch.settings().log_path();
        fs::write(
            &log,
            "[2026-10-05 10:00:00] Starting service\n[2026-10-05 10:00:03] Update to v1.1.0 successful\n",
        )
        .unwrap();

        let verdict = orch.report_previous_outcome().unwrap();
        assert_eq!(verdict, ScriptVerdict::Updated { version: "1.1.0".into() });
        assert_eq!(orch.state(), UpdateState::Succeeded);

        let states: Vec<_> = rx.try_iter().map(|u| u.state).collect();
        assert_eq!(states, [UpdateState::Verifying, UpdateState::Succeeded]);

        assert!(!log.exists());
        assert!(orch.report_previous_outcome().is_none());
    }

    #[test]
    fn running_script_defers_the_report() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        fs::create_dir_all(install.state_dir()).unwrap();
        let log = orch.settings().log_path();
        fs::write(&log, "[t] Starting service\n").unwrap();
        fs::write(install.state_dir().join("agent-update.sh"), "#!/bin/sh\n").unwrap();

        assert!(orch.report_previous_outcome().is_none());
        assert!(log.exists());
        assert_eq!(orch.state(), UpdateState::Idle);
    }

    /// Tracks a single service whose state follows start/stop immediately.
    struct FakeService {
        state: Mutex<ServiceRunState>,
        start_works: bool,
    }

    impl ServiceControl for FakeService {
        fn query(&self, _service: &str) -> anyhow::Result<ServiceRunState> {
            Ok(*self.state.lock().unwrap())
        }

        fn start(&self, _service: &str) -> anyhow::Result<()> {
            if self.start_works {
                *self.state.lock().unwrap() = ServiceRunState::Running;
            }
            Ok(())
        }

        fn stop(&self, _service: &str) -> anyhow::Result<()> {
            *self.state.lock().unwrap() = ServiceRunState::Stopped;
            Ok(())
        }
    }

    #[test]
    fn direct_rollback_restores_and_restarts() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        fs::write(plan::backup_path_for(&install.exe), b"older build").unwrap();
        let service = FakeService {
            state: Mutex::new(ServiceRunState::Running),
            start_works: true,
        };

        let outcome = orch.rollback_in_place(&install.exe, &service).unwrap();
        assert_eq!(outcome, UpdateOutcome::RolledBack);
        assert_eq!(fs::read(&install.exe).unwrap(), b"older build");
        assert_eq!(*service.state.lock().unwrap(), ServiceRunState::Running);
        assert_eq!(orch.state(), UpdateState::RolledBack);
        assert!(!orch.is_in_flight());
    }

    #[test]
    fn direct_rollback_reports_a_service_that_stays_down() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        fs::write(plan::backup_path_for(&install.exe), b"older build").unwrap();
        let service = FakeService {
            state: Mutex::new(ServiceRunState::Running),
            start_works: false,
        };

        let outcome = orch.rollback_in_place(&install.exe, &service).unwrap();
        assert_eq!(outcome, UpdateOutcome::FailedUnrecoverable);
        assert_eq!(orch.state(), UpdateState::Failed);
    }

    #[test]
    fn script_left_by_another_instance_blocks_every_attempt() {
        let install = Install::new();
        let launcher = RecordingLauncher::default();
        let (first, _rx) = orchestrator(&install, launcher.clone());
        first.apply(install.artifact("1.1.0"), &install.exe).unwrap();

        let (second, _rx) = orchestrator(&install, launcher.clone());
        let err = second.apply(install.artifact("1.2.0"), &install.exe).unwrap_err();
        assert!(matches!(err, UpdateError::ScriptPending(ref p) if p.ends_with("agent-update.sh")));
        assert!(!second.is_in_flight());
        assert_eq!(second.state(), UpdateState::Failed);

        fs::write(plan::backup_path_for(&install.exe), b"older build").unwrap();
        assert!(matches!(second.rollback(&install.exe), Err(UpdateError::ScriptPending(_))));

        let service = FakeService {
            state: Mutex::new(ServiceRunState::Running),
            start_works: true,
        };
        assert!(matches!(
            second.rollback_in_place(&install.exe, &service),
            Err(UpdateError::ScriptPending(_))
        ));

        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(scripts_in(&install.state_dir()).len(), 1);
        assert_eq!(fs::read(&install.exe).unwrap(), b"old build");
    }

    #[test]
    fn direct_update_installs_and_drops_the_backup() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        let service = FakeService {
            state: Mutex::new(ServiceRunState::Running),
            start_works: true,
        };

        let source = StagedArtifact::new(&install.artifact, "1.1.0");
        let outcome = orch.update_in_place(&source, &install.exe, &service).unwrap();
        assert_eq!(outcome, UpdateOutcome::Success);
        assert_eq!(fs::read(&install.exe).unwrap(), b"new build");
        assert!(!install.artifact.exists());
        assert!(!plan::backup_path_for(&install.exe).exists());

        let status = orch.status();
        assert_eq!(status.state, UpdateState::Succeeded);
        assert_eq!(status.target_version.as_deref(), Some("1.1.0"));
        assert!(!orch.is_in_flight());
    }

    /// Only reaches running when the installed file holds `accepts`.
    struct PickyService {
        exe: PathBuf,
        accepts: &'static [u8],
        state: Mutex<ServiceRunState>,
        starts: AtomicUsize,
    }

    impl ServiceControl for PickyService {
        fn query(&self, _service: &str) -> anyhow::Result<ServiceRunState> {
            Ok(*self.state.lock().unwrap())
        }

        fn start(&self, _service: &str) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if fs::read(&self.exe).is_ok_and(|bytes| bytes == self.accepts) {
                *self.state.lock().unwrap() = ServiceRunState::Running;
            }
            Ok(())
        }

        fn stop(&self, _service: &str) -> anyhow::Result<()> {
            *self.state.lock().unwrap() = ServiceRunState::Stopped;
            Ok(())
        }
    }

    #[test]
    fn direct_update_that_never_starts_is_rolled_back() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        let service = PickyService {
            exe: install.exe.clone(),
            accepts: b"old build",
            state: Mutex::new(ServiceRunState::Running),
            starts: AtomicUsize::new(0),
        };

        let source = StagedArtifact::new(&install.artifact, "1.1.0");
        let outcome = orch.update_in_place(&source, &install.exe, &service).unwrap();
        assert_eq!(outcome, UpdateOutcome::RolledBack);
        assert_eq!(fs::read(&install.exe).unwrap(), b"old build");
        assert!(!plan::backup_path_for(&install.exe).exists());
        assert_eq!(*service.state.lock().unwrap(), ServiceRunState::Running);
        assert_eq!(service.starts.load(Ordering::SeqCst), 2);
        assert_eq!(orch.state(), UpdateState::RolledBack);
    }

    #[test]
    fn direct_update_refuses_an_older_target_without_stopping() {
        let install = Install::new();
        let (orch, _rx) = orchestrator(&install, RecordingLauncher::default());
        let service = FakeService {
            state: Mutex::new(ServiceRunState::Running),
            start_works: true,
        };

        let source = StagedArtifact::new(&install.artifact, "0.9.0");
        let err = orch.update_in_place(&source, &install.exe, &service).unwrap_err();
        assert!(matches!(err, UpdateError::NotNewer { .. }));
        assert_eq!(*service.state.lock().unwrap(), ServiceRunState::Running);
        assert_eq!(fs::read(&install.exe).unwrap(), b"old build");
        assert_eq!(orch.state(), UpdateState::Failed);
    }
}
