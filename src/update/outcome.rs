//! Outcome lines written by the script and their interpretation after restart.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use super::status::UpdateOutcome;

const UPDATED_PREFIX: &str = "Update to v";
const UPDATED_SUFFIX: &str = " successful";
const ROLLED_BACK_PREFIX: &str = "Rolled back failed update to v";
const RESTARTED_PREFIX: &str = "Restarted previous version after failed update to v";

/// Logged by the restart-old section before its start command
pub const RESTARTING_LINE: &str = "Starting previous version";
pub const MANUAL_ROLLBACK_LINE: &str = "Rolled back to previous version";
pub const MANUAL_RESTART_LINE: &str = "Restarted previous version after manual rollback";

pub fn success_line(version: &str) -> String {
    format!("{UPDATED_PREFIX}{version}{UPDATED_SUFFIX}")
}

pub fn rolled_back_line(version: &str) -> String {
    format!("{ROLLED_BACK_PREFIX}{version}")
}

pub fn restarted_line(version: &str) -> String {
    format!("{RESTARTED_PREFIX}{version}")
}

/// What a finished script log says happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptVerdict {
    Updated { version: String },
    /// Backup restored, previous version restarted
    RolledBack { version: String },
    /// The swap never completed; the previous version was restarted as is
    RestartedOld { version: String },
    ManualRollback,
    /// The log ends on something other than an outcome line
    Incomplete { last_line: Option<String> },
}

impl ScriptVerdict {
    pub fn outcome(&self) -> UpdateOutcome {
        match self {
            ScriptVerdict::Updated { .. } => UpdateOutcome::Success,
            ScriptVerdict::RolledBack { .. }
            | ScriptVerdict::RestartedOld { .. }
            | ScriptVerdict::ManualRollback => UpdateOutcome::RolledBack,
            ScriptVerdict::Incomplete { .. } => UpdateOutcome::FailedUnrecoverable,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            ScriptVerdict::Updated { version }
            | ScriptVerdict::RolledBack { version }
            | ScriptVerdict::RestartedOld { version } => Some(version),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptVerdict::Updated { version } => write!(f, "updated to v{version}"),
            ScriptVerdict::RolledBack { version } => {
                write!(f, "update to v{version} rolled back")
            }
            ScriptVerdict::RestartedOld { version } => {
                write!(f, "update to v{version} aborted, previous version restarted")
            }
            ScriptVerdict::ManualRollback => f.write_str("rolled back to previous version"),
            ScriptVerdict::Incomplete { last_line: Some(line) } => {
                write!(f, "incomplete (last line: {line})")
            }
            ScriptVerdict::Incomplete { last_line: None } => f.write_str("incomplete (empty log)"),
        }
    }
}

/// Interpret the last lines of a script log.
pub fn parse_verdict(log: &str) -> ScriptVerdict {
    let mut lines = log
        .lines()
        .map(strip_timestamp)
        .filter(|line| !line.is_empty())
        .rev();

    let Some(last) = lines.next() else {
        return ScriptVerdict::Incomplete { last_line: None };
    };

    if let Some(version) = last
        .strip_prefix(UPDATED_PREFIX)
        .and_then(|rest| rest.strip_suffix(UPDATED_SUFFIX))
    {
        return ScriptVerdict::Updated {
            version: version.to_string(),
        };
    }

    if let Some(version) = last.strip_prefix(RESTARTED_PREFIX) {
        let version = version.to_string();
        let rolled_back = lines
            .find(|line| *line != RESTARTING_LINE)
            .is_some_and(|previous| previous == rolled_back_line(&version));
        return if rolled_back {
            ScriptVerdict::RolledBack { version }
        } else {
            ScriptVerdict::RestartedOld { version }
        };
    }

    if last == MANUAL_RESTART_LINE {
        return ScriptVerdict::ManualRollback;
    }

    ScriptVerdict::Incomplete {
        last_line: Some(last.to_string()),
    }
}

/// Read and interpret a script log. `Ok(None)` when there is no log.
pub fn read_verdict(log_path: &Path) -> io::Result<Option<ScriptVerdict>> {
    match fs::read(log_path) {
        Ok(bytes) => Ok(Some(parse_verdict(&String::from_utf8_lossy(&bytes)))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drop the leading `[timestamp] ` and trailing whitespace.
fn strip_timestamp(line: &str) -> &str {
    let line = line.trim_end();
    match line.strip_prefix('[').and_then(|rest| rest.split_once("] ")) {
        Some((_, message)) => message,
        None => line,
    }
}
