//! Update progress reporting

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Downloading,
    Installing,
    /// Reading the previous attempt's result after restart
    Verifying,
    Succeeded,
    RolledBack,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Succeeded | UpdateState::RolledBack | UpdateState::Failed)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateState::Idle => "idle",
            UpdateState::Downloading => "downloading",
            UpdateState::Installing => "installing",
            UpdateState::Verifying => "verifying",
            UpdateState::Succeeded => "succeeded",
            UpdateState::RolledBack => "rolled_back",
            UpdateState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final result of one attempt, reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Success,
    RolledBack,
    FailedUnrecoverable,
}

impl UpdateOutcome {
    pub fn state(self) -> UpdateState {
        match self {
            UpdateOutcome::Success => UpdateState::Succeeded,
            UpdateOutcome::RolledBack => UpdateState::RolledBack,
            UpdateOutcome::FailedUnrecoverable => UpdateState::Failed,
        }
    }
}

/// Snapshot published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: UpdateState,
    pub message: String,
    pub percent: u8, // 0 to 100
    pub target_version: Option<String>,
    pub outcome: Option<UpdateOutcome>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(state: UpdateState, message: impl Into<String>, percent: u8) -> Self {
        Self {
            state,
            message: message.into(),
            percent: percent.min(100),
            target_version: None,
            outcome: None,
            at: Utc::now(),
        }
    }

    pub fn idle() -> Self {
        Self::new(UpdateState::Idle, "", 0)
    }

    /// Terminal update carrying `outcome`
    pub fn finished(outcome: UpdateOutcome, message: impl Into<String>) -> Self {
        let percent = match outcome {
            UpdateOutcome::Success => 100,
            _ => 0,
        };
        Self {
            outcome: Some(outcome),
            ..Self::new(outcome.state(), message, percent)
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.target_version = Some(version.into());
        self
    }
}

pub trait StatusReporter: Send + Sync {
    fn report(&self, update: &StatusUpdate);
}

/// Writes each update to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, update: &StatusUpdate) {
        let version = update.target_version.as_deref().unwrap_or("-");
        match update.outcome {
            Some(UpdateOutcome::FailedUnrecoverable) => {
                log::error!("[update {version}] {}: {}", update.state, update.message)
            }
            Some(UpdateOutcome::RolledBack) => {
                log::warn!("[update {version}] {}: {}", update.state, update.message)
            }
            _ => log::info!(
                "[update {version}] {} {}%: {}",
                update.state,
                update.percent,
                update.message
            ),
        }
    }
}

/// Keeps the latest update in a JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileReporter {
    path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(path: &Path) -> anyhow::Result<Option<StatusUpdate>> {
        use anyhow::Context;

        match std::fs::read(path) {
            Ok(bytes) => {
                let update = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse status file {}", path.display()))?;
                Ok(Some(update))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read status file {}", path.display())),
        }
    }

    fn write(&self, update: &StatusUpdate) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("status file has no parent directory"))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, update)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl StatusReporter for JsonFileReporter {
    fn report(&self, update: &StatusUpdate) {
        if let Err(e) = self.write(update) {
            log::warn!("Failed to write status file {}: {e:#}", self.path.display());
        }
    }
}

/// Forwards updates to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: Sender<StatusUpdate>,
}

impl ChannelReporter {
    pub fn new(tx: Sender<StatusUpdate>) -> Self {
        Self { tx }
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<StatusUpdate>) {
        let (tx, rx) = bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl StatusReporter for ChannelReporter {
    fn report(&self, update: &StatusUpdate) {
        match self.tx.try_send(update.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::debug!("status channel full, dropping update"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl StatusReporter for Vec<Box<dyn StatusReporter>> {
    fn report(&self, update: &StatusUpdate) {
        for reporter in self {
            reporter.report(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped() {
        assert_eq!(StatusUpdate::new(UpdateState::Installing, "x", 250).percent, 100);
    }

    #[test]
    fn finished_update_maps_outcome_to_state() {
        let done = StatusUpdate::finished(UpdateOutcome::RolledBack, "restored").with_version("1.2.0");
        assert_eq!(done.state, UpdateState::RolledBack);
        assert_eq!(done.outcome, Some(UpdateOutcome::RolledBack));
        assert!(done.state.is_terminal());
        assert_eq!(StatusUpdate::finished(UpdateOutcome::Success, "ok").percent, 100);
    }

    #[test]
    fn json_reporter_replaces_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = JsonFileReporter::new(dir.path().join("status").join("update.json"));

        reporter.report(&StatusUpdate::new(UpdateState::Installing, "Installing update...", 50));
        reporter.report(&StatusUpdate::finished(UpdateOutcome::FailedUnrecoverable, "boom").with_version("2.0.0"));

        let stored = JsonFileReporter::read(reporter.path()).unwrap().unwrap();
        assert_eq!(stored.state, UpdateState::Failed);
        assert_eq!(stored.target_version.as_deref(), Some("2.0.0"));

        let raw = std::fs::read_to_string(reporter.path()).unwrap();
        assert!(raw.contains("\"failed_unrecoverable\""));
    }

    #[test]
    fn channel_reporter_drops_when_full() {
        let (reporter, rx) = ChannelReporter::bounded(1);
        reporter.report(&StatusUpdate::new(UpdateState::Downloading, "a", 0));
        reporter.report(&StatusUpdate::new(UpdateState::Installing, "b", 50));

        assert_eq!(rx.try_recv().unwrap().message, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reporter_list_fans_out() {
        let (first, rx1) = ChannelReporter::bounded(4);
        let (second, rx2) = ChannelReporter::bounded(4);
        let all: Vec<Box<dyn StatusReporter>> = vec![Box::new(first), Box::new(second)];

        all.report(&StatusUpdate::idle());
        assert_eq!(rx1.len(), 1);
        assert_eq!(rx2.len(), 1);
    }
}
