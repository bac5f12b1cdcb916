//! Validated, immutable description of one update or rollback attempt.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use super::error::PlanError;
use super::script::ScriptDialect;

/// Suffix appended to the current executable's file name for its backup.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Everything the generated script needs, fixed at construction.
///
/// All paths are absolute and free of characters no script dialect can quote;
/// the artifact and the backup live on the same volume as the executable so
/// every move in the script is a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    current_executable: PathBuf,
    downloaded_artifact: PathBuf,
    backup_path: PathBuf,
    target_version: String,
    log_path: PathBuf,
    script_path: PathBuf,
    service_name: String,
}

impl UpdatePlan {
    pub fn new(
        current_executable: impl Into<PathBuf>,
        downloaded_artifact: impl Into<PathBuf>,
        target_version: impl Into<String>,
        log_path: impl Into<PathBuf>,
        service_name: impl Into<String>,
        dialect: ScriptDialect,
    ) -> Result<Self, PlanError> {
        let current_executable = current_executable.into();
        let downloaded_artifact = downloaded_artifact.into();
        let target_version = target_version.into();
        let log_path = log_path.into();
        let service_name = service_name.into();

        check_path("current executable", &current_executable)?;
        check_path("downloaded artifact", &downloaded_artifact)?;
        check_path("log path", &log_path)?;
        check_service_name(&service_name)?;
        check_version(&target_version)?;

        if downloaded_artifact == current_executable {
            return Err(PlanError::ArtifactIsCurrent(downloaded_artifact));
        }

        let backup_path = backup_path_for(&current_executable);
        check_same_volume(&downloaded_artifact, &current_executable)?;

        let script_path = sibling(&log_path, update_script_name(&service_name, dialect))?;

        Ok(Self {
            current_executable,
            downloaded_artifact,
            backup_path,
            target_version,
            log_path,
            script_path,
            service_name,
        })
    }

    pub fn current_executable(&self) -> &Path {
        &self.current_executable
    }

    pub fn downloaded_artifact(&self) -> &Path {
        &self.downloaded_artifact
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn target_version(&self) -> &str {
        &self.target_version
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Plan for restoring the backup over the current executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    current_executable: PathBuf,
    backup_path: PathBuf,
    log_path: PathBuf,
    script_path: PathBuf,
    service_name: String,
}

impl RollbackPlan {
    pub fn new(
        current_executable: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        service_name: impl Into<String>,
        dialect: ScriptDialect,
    ) -> Result<Self, PlanError> {
        let current_executable = current_executable.into();
        let log_path = log_path.into();
        let service_name = service_name.into();

        check_path("current executable", &current_executable)?;
        check_path("log path", &log_path)?;
        check_service_name(&service_name)?;

        let backup_path = backup_path_for(&current_executable);
        let script_path = sibling(&log_path, rollback_script_name(&service_name, dialect))?;

        Ok(Self {
            current_executable,
            backup_path,
            log_path,
            script_path,
            service_name,
        })
    }

    pub fn current_executable(&self) -> &Path {
        &self.current_executable
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// `<current>.bak`, next to the current executable.
pub fn backup_path_for(current_executable: &Path) -> PathBuf {
    let mut name = OsString::from(current_executable.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

pub fn update_script_name(service: &str, dialect: ScriptDialect) -> String {
    format!("{service}-update.{}", dialect.extension())
}

pub fn rollback_script_name(service: &str, dialect: ScriptDialect) -> String {
    format!("{service}-rollback.{}", dialect.extension())
}

/// Resolved path of the running executable.
pub fn current_executable() -> io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let resolved = exe.canonicalize()?;
    Ok(strip_verbatim(resolved))
}

// cmd.exe cannot move files addressed through `\\?\` paths.
#[cfg(windows)]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    let stripped = path
        .to_str()
        .and_then(|text| text.strip_prefix(r"\\?\"))
        .filter(|rest| rest.as_bytes().get(1) == Some(&b':'))
        .map(PathBuf::from);
    stripped.unwrap_or(path)
}

#[cfg(not(windows))]
fn strip_verbatim(path: PathBuf) -> PathBuf {
    path
}

fn sibling(path: &Path, file_name: String) -> Result<PathBuf, PlanError> {
    let parent = path.parent().ok_or_else(|| PlanError::NoParent {
        field: "log path",
        path: path.to_path_buf(),
    })?;
    Ok(parent.join(file_name))
}

fn check_path(field: &'static str, path: &Path) -> Result<(), PlanError> {
    if !path.is_absolute() {
        return Err(PlanError::NotAbsolute {
            field,
            path: path.to_path_buf(),
        });
    }

    let text = path.to_string_lossy();
    if text.chars().any(|c| matches!(c, '"' | '\n' | '\r' | '\0')) {
        return Err(PlanError::UnquotablePath {
            field,
            path: path.to_path_buf(),
        });
    }

    if path.parent().is_none() || path.file_name().is_none() {
        return Err(PlanError::NoParent {
            field,
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

fn check_service_name(name: &str) -> Result<(), PlanError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'));
    if !valid {
        return Err(PlanError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

fn check_version(version: &str) -> Result<(), PlanError> {
    let valid = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'));
    if !valid {
        return Err(PlanError::InvalidVersion(version.to_string()));
    }
    Ok(())
}

/// The artifact is compared against the directory that will hold it.
#[cfg(unix)]
fn check_same_volume(artifact: &Path, current: &Path) -> Result<(), PlanError> {
    use std::os::unix::fs::MetadataExt;

    let inspect = |path: &Path| {
        std::fs::metadata(path).map_err(|source| PlanError::Inspect {
            path: path.to_path_buf(),
            source,
        })
    };

    let install_dir = current.parent().unwrap_or(current);
    if inspect(artifact)?.dev() != inspect(install_dir)?.dev() {
        return Err(PlanError::CrossVolume {
            path: artifact.to_path_buf(),
            current: current.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(windows)]
fn check_same_volume(artifact: &Path, current: &Path) -> Result<(), PlanError> {
    use std::path::Component;

    let volume = |path: &Path| match path.components().next() {
        Some(Component::Prefix(prefix)) => Some(prefix.as_os_str().to_ascii_uppercase()),
        _ => None,
    };

    if volume(artifact) != volume(current) {
        return Err(PlanError::CrossVolume {
            path: artifact.to_path_buf(),
            current: current.to_path_buf(),
        });
    }
    Ok(())
}
