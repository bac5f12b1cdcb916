use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// An [`UpdatePlan`](super::UpdatePlan) or rollback plan could not be built.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{field} must be an absolute path: {path}")]
    NotAbsolute { field: &'static str, path: PathBuf },

    #[error("{field} contains a character no script can quote (\", newline or NUL): {path:?}")]
    UnquotablePath { field: &'static str, path: PathBuf },

    #[error("{field} has no parent directory: {path}")]
    NoParent { field: &'static str, path: PathBuf },

    #[error("invalid service name {0:?}: only [A-Za-z0-9_.@-] is allowed")]
    InvalidServiceName(String),

    #[error("invalid version {0:?}: only [0-9A-Za-z.+-] is allowed")]
    InvalidVersion(String),

    #[error("artifact and current executable are the same file: {0}")]
    ArtifactIsCurrent(PathBuf),

    #[error("{path} is not on the same volume as {current}")]
    CrossVolume { path: PathBuf, current: PathBuf },

    #[error("no backup to roll back to at {0}")]
    NoBackup(PathBuf),

    #[error("failed to inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A script template failed static path analysis.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("goto to undefined section {0}")]
    UnknownLabel(&'static str),

    #[error("section {0} is declared twice")]
    DuplicateLabel(&'static str),

    #[error("section {0} has no label")]
    UnlabeledSection(usize),

    #[error("failure blocks cannot be nested")]
    NestedFailureBlock,

    #[error("goto {label} jumps backwards from section {from}")]
    BackwardJump {
        label: &'static str,
        from: &'static str,
    },

    #[error("path stops the service without starting it again: {path}")]
    StopWithoutStart { path: String },

    #[error("swap failure does not reach rollback or restart-old: {path}")]
    UnrecoveredSwapFailure { path: String },

    #[error("path ends without removing the script: {path}")]
    MissingCleanup { path: String },
}

/// The detached runner could not hand the script off.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch strategy {0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("required program not found: {0}")]
    NotFound(&'static str),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} did not report a created process: {output}")]
    NoProcess { program: String, output: String },
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    Missing(PathBuf),

    #[error("artifact is not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("artifact is empty: {0}")]
    Empty(PathBuf),

    #[error("failed to read artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: &'static str,
        status: ExitStatus,
    },
}

/// In-process swap failures. Each variant leaves the files as described.
#[derive(Debug, Error)]
pub enum SwapError {
    /// Nothing moved
    #[error("failed to back up {current} to {backup}: {source}")]
    Backup {
        current: PathBuf,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backup was moved back into place
    #[error("failed to install {artifact} as {current}: {source}")]
    Install {
        artifact: PathBuf,
        current: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to restore {backup} to {current}: {source}")]
    Restore {
        backup: PathBuf,
        current: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no backup present at {0}")]
    NoBackup(PathBuf),
}

/// Synchronous failure of an update or rollback request.
///
/// Nothing in the installation has been changed when one of these is returned.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an update is already in progress")]
    AlreadyInProgress,

    /// A script from an earlier attempt has not removed itself yet
    #[error("update script {0} is still pending; remove it if no update is running")]
    ScriptPending(PathBuf),

    #[error("version {target} is not newer than the running version {current}")]
    NotNewer { current: String, target: String },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error("failed to create state directory {path}: {source}")]
    StateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write script {path}: {source}")]
    WriteScript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare artifact {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to launch update script: {0}")]
    Launch(#[from] LaunchError),

    #[error("service control failed: {0}")]
    Service(String),
}
