//! Dialect-independent description of an update script.
//!
//! A template is a list of sections made of steps. The renderer turns it into
//! batch or POSIX sh text; [`analysis`](super::analysis) enumerates its
//! execution paths before it is handed out.

use std::fmt;
use std::path::PathBuf;

/// A reference to a shell variable together with the number of interpreter
/// passes it must survive before being expanded.
///
/// Depth 0 is expanded by the script itself. Each extra level doubles the
/// batch `%` delimiters or adds a level of backslash escaping in sh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarRef {
    pub name: &'static str,
    pub depth: u8,
}

impl VarRef {
    /// The only variable the script defines itself.
    pub const LOG_FILE: VarRef = VarRef::new("LOG_FILE", 0);
    pub const BATCH_DATE: VarRef = VarRef::new("date", 0);
    pub const BATCH_TIME: VarRef = VarRef::new("time", 0);
    pub const BATCH_ERRORLEVEL: VarRef = VarRef::new("errorlevel", 0);

    pub const fn new(name: &'static str, depth: u8) -> Self {
        Self { name, depth }
    }

    /// The same variable, escaped for one more pass.
    pub const fn nested(self) -> Self {
        Self {
            name: self.name,
            depth: self.depth + 1,
        }
    }
}

/// One piece of a rendered line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Interpreter syntax, emitted verbatim
    Syntax(String),
    /// A quoted string literal (paths)
    Literal(String),
    /// Free text printed by a log line
    Echo(String),
    Var(VarRef),
    /// `name = value` with the value as a literal
    Assign { name: &'static str, value: String },
}

impl Fragment {
    pub fn syntax(text: impl Into<String>) -> Self {
        Fragment::Syntax(text.into())
    }

    pub fn literal(path: &std::path::Path) -> Self {
        Fragment::Literal(path.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Rollback,
    RestartOld,
    Cleanup,
}

impl Label {
    pub fn name(self) -> &'static str {
        match self {
            Label::Rollback => "rollback",
            Label::RestartOld => "restart_old",
            Label::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An action with an exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Succeeds when the service is stopped
    QueryStopped,
    /// Succeeds when the service is running
    QueryRunning,
    StopService,
    StartService,
    Move { from: PathBuf, to: PathBuf },
    DeleteIfExists(PathBuf),
    /// Delete the script file; always the last command on a path
    RemoveSelf(PathBuf),
}

impl Command {
    pub fn is_move(&self) -> bool {
        matches!(self, Command::Move { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Append a timestamped line to the log
    Log(String),
    Sleep(u32),
    Run(Command),
    /// Run `command`; when it fails, run `then`. No nesting.
    OnFailure { command: Command, then: Vec<Step> },
    /// Transfer control to a later section. Never returns.
    Goto(Label),
}

impl Step {
    pub fn log(message: impl Into<String>) -> Self {
        Step::Log(message.into())
    }

    pub fn on_failure(command: Command, then: Vec<Step>) -> Self {
        Step::OnFailure { command, then }
    }
}

/// A run of steps. Control falls through to the next section at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub label: Option<Label>,
    pub steps: Vec<Step>,
}

impl Section {
    pub fn main(steps: Vec<Step>) -> Self {
        Self { label: None, steps }
    }

    pub fn labeled(label: Label, steps: Vec<Step>) -> Self {
        Self {
            label: Some(label),
            steps,
        }
    }
}

/// A complete script: the log file it appends to and its sections in order.
///
/// Only the first section may be unlabeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTemplate {
    pub log_file: PathBuf,
    pub sections: Vec<Section>,
}

impl ScriptTemplate {
    pub fn new(log_file: impl Into<PathBuf>, sections: Vec<Section>) -> Self {
        Self {
            log_file: log_file.into(),
            sections,
        }
    }

    pub fn section(&self, label: Label) -> Option<&Section> {
        self.sections.iter().find(|s| s.label == Some(label))
    }

    /// Every step in order, including those inside failure blocks.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.sections.iter().flat_map(|s| s.steps.iter()).flat_map(|step| {
            let inner: &[Step] = match step {
                Step::OnFailure { then, .. } => then,
                _ => &[],
            };
            std::iter::once(step).chain(inner.iter())
        })
    }
}
