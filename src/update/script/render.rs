//! Batch and POSIX sh renderers for [`ScriptTemplate`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::template::{Command, Fragment, Label, ScriptTemplate, Section, Step, VarRef};
use crate::config::ServiceCommands;

/// Interpreter the script is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScriptDialect {
    /// Windows `cmd.exe`
    Batch,
    /// `/bin/sh`
    Posix,
}

impl ScriptDialect {
    pub fn native() -> Self {
        if cfg!(windows) {
            ScriptDialect::Batch
        } else {
            ScriptDialect::Posix
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScriptDialect::Batch => "bat",
            ScriptDialect::Posix => "sh",
        }
    }

    fn newline(self) -> &'static str {
        match self {
            ScriptDialect::Batch => "\r\n",
            ScriptDialect::Posix => "\n",
        }
    }
}

impl fmt::Display for ScriptDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptDialect::Batch => "batch",
            ScriptDialect::Posix => "posix",
        })
    }
}

/// Render `template` for `dialect`.
///
/// `commands` must already have the service name substituted.
pub fn render(template: &ScriptTemplate, dialect: ScriptDialect, commands: &ServiceCommands) -> String {
    let mut writer = Writer {
        dialect,
        commands,
        out: String::new(),
        indent: 0,
    };
    match dialect {
        ScriptDialect::Batch => writer.batch(template),
        ScriptDialect::Posix => writer.posix(template),
    }
    writer.out
}

/// Text of a single fragment in `dialect`.
pub fn render_fragment(fragment: &Fragment, dialect: ScriptDialect) -> String {
    match (dialect, fragment) {
        (_, Fragment::Syntax(text)) => text.clone(),
        (_, Fragment::Var(var)) => render_var(*var, dialect),

        (ScriptDialect::Batch, Fragment::Literal(text)) => format!("\"{}\"", text.replace('%', "%%")),
        (ScriptDialect::Batch, Fragment::Echo(text)) => batch_echo(text),
        (ScriptDialect::Batch, Fragment::Assign { name, value }) => {
            format!("set \"{name}={}\"", value.replace('%', "%%"))
        }

        (ScriptDialect::Posix, Fragment::Literal(text) | Fragment::Echo(text)) => sh_quote(text),
        (ScriptDialect::Posix, Fragment::Assign { name, value }) => format!("{name}={}", sh_quote(value)),
    }
}

fn render_var(var: VarRef, dialect: ScriptDialect) -> String {
    let passes = 1usize << var.depth;
    match dialect {
        ScriptDialect::Batch => {
            let delim = "%".repeat(passes);
            format!("{delim}{}{delim}", var.name)
        }
        ScriptDialect::Posix => format!("{}${{{}}}", "\\".repeat(passes - 1), var.name),
    }
}

fn batch_echo(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%%"),
            '^' | '&' | '|' | '<' | '>' | '(' | ')' => {
                out.push('^');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

struct Writer<'a> {
    dialect: ScriptDialect,
    commands: &'a ServiceCommands,
    out: String,
    indent: usize,
}

impl Writer<'_> {
    fn line(&mut self, fragments: &[Fragment]) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        for fragment in fragments {
            self.out.push_str(&render_fragment(fragment, self.dialect));
        }
        self.out.push_str(self.dialect.newline());
    }

    fn syntax(&mut self, text: impl Into<String>) {
        self.line(&[Fragment::syntax(text)]);
    }

    fn header(&mut self, template: &ScriptTemplate) {
        let assign = Fragment::Assign {
            name: VarRef::LOG_FILE.name,
            value: template.log_file.to_string_lossy().into_owned(),
        };
        match self.dialect {
            ScriptDialect::Batch => {
                self.syntax("@echo off");
                self.syntax("setlocal");
            }
            ScriptDialect::Posix => self.syntax("#!/bin/sh"),
        }
        self.line(&[assign]);
    }

    fn batch(&mut self, template: &ScriptTemplate) {
        self.header(template);
        for section in &template.sections {
            if let Some(label) = section.label {
                self.syntax(format!(":{label}"));
            }
            self.steps(&section.steps);
        }
    }

    /// Labeled sections become functions; the unlabeled first section is the
    /// main body. Each section ends by calling the next one, the last exits.
    fn posix(&mut self, template: &ScriptTemplate) {
        self.header(template);

        let sections = &template.sections;
        for (index, section) in sections.iter().enumerate() {
            let Some(label) = section.label else { continue };
            self.out.push('\n');
            self.syntax(format!("{label}() {{"));
            self.indent += 1;
            self.steps(&section.steps);
            self.posix_fallthrough(section, sections.get(index + 1));
            self.indent -= 1;
            self.syntax("}");
        }

        self.out.push('\n');
        match sections.first() {
            Some(main) if main.label.is_none() => {
                self.steps(&main.steps);
                self.posix_fallthrough(main, sections.get(1));
            }
            Some(first) => {
                if let Some(label) = first.label {
                    self.syntax(label.name());
                }
            }
            None => self.syntax("exit 0"),
        }
    }

    fn posix_fallthrough(&mut self, section: &Section, next: Option<&Section>) {
        if matches!(section.steps.last(), Some(Step::Goto(_))) {
            return;
        }
        match next.and_then(|s| s.label) {
            Some(label) => self.syntax(label.name()),
            None => self.syntax("exit 0"),
        }
    }

    fn steps(&mut self, steps: &[Step]) {
        for step in steps {
            self.step(step);
        }
    }

    fn step(&mut self, step: &Step) {
        match step {
            Step::Log(message) => {
                let line = self.log_line(message);
                self.line(&line);
            }
            Step::Sleep(secs) => match self.dialect {
                ScriptDialect::Batch => self.syntax(format!("timeout /t {secs} /nobreak > nul")),
                ScriptDialect::Posix => self.syntax(format!("sleep {secs}")),
            },
            Step::Run(command) => {
                let line = self.command(command);
                self.line(&line);
            }
            Step::OnFailure { command, then } => self.on_failure(command, then),
            Step::Goto(label) => self.goto(*label),
        }
    }

    fn on_failure(&mut self, command: &Command, then: &[Step]) {
        let command = self.command(command);
        match self.dialect {
            ScriptDialect::Batch => {
                self.line(&command);
                self.line(&[
                    Fragment::syntax("if "),
                    Fragment::Var(VarRef::BATCH_ERRORLEVEL),
                    Fragment::syntax(" neq 0 ("),
                ]);
                self.indent += 1;
                self.steps(then);
                self.indent -= 1;
                self.syntax(")");
            }
            ScriptDialect::Posix => {
                let mut head = vec![Fragment::syntax("if ! ")];
                head.extend(command);
                head.push(Fragment::syntax("; then"));
                self.line(&head);
                self.indent += 1;
                if then.is_empty() {
                    self.syntax(":");
                }
                self.steps(then);
                self.indent -= 1;
                self.syntax("fi");
            }
        }
    }

    fn goto(&mut self, label: Label) {
        match self.dialect {
            ScriptDialect::Batch => self.syntax(format!("goto :{label}")),
            ScriptDialect::Posix => self.syntax(label.name()),
        }
    }

    fn log_line(&self, message: &str) -> Vec<Fragment> {
        let mut line = match self.dialect {
            ScriptDialect::Batch => vec![
                Fragment::syntax("echo ["),
                Fragment::Var(VarRef::BATCH_DATE),
                Fragment::syntax(" "),
                Fragment::Var(VarRef::BATCH_TIME),
                Fragment::syntax("] "),
            ],
            ScriptDialect::Posix => vec![Fragment::syntax(
                "printf '%s %s\\n' \"[$(date '+%Y-%m-%d %H:%M:%S')]\" ",
            )],
        };
        line.extend([
            Fragment::Echo(message.to_string()),
            Fragment::syntax(" >> \""),
            Fragment::Var(VarRef::LOG_FILE),
            Fragment::syntax("\""),
        ]);
        line
    }

    fn command(&self, command: &Command) -> Vec<Fragment> {
        let batch = self.dialect == ScriptDialect::Batch;
        match command {
            Command::QueryStopped => vec![Fragment::syntax(&self.commands.query_stopped)],
            Command::QueryRunning => vec![Fragment::syntax(&self.commands.query_running)],
            Command::StopService => vec![Fragment::syntax(&self.commands.stop)],
            Command::StartService => vec![Fragment::syntax(&self.commands.start)],
            Command::Move { from, to } if batch => vec![
                Fragment::syntax("move /y "),
                Fragment::literal(from),
                Fragment::syntax(" "),
                Fragment::literal(to),
                Fragment::syntax(" > nul"),
            ],
            Command::Move { from, to } => vec![
                Fragment::syntax("mv -f "),
                Fragment::literal(from),
                Fragment::syntax(" "),
                Fragment::literal(to),
            ],
            // fails when anything is left at the path, a directory included
            Command::DeleteIfExists(path) if batch => vec![
                Fragment::syntax("if exist "),
                Fragment::Literal(format!("{}\\*", path.to_string_lossy())),
                Fragment::syntax(" (cmd /c exit 1) else (del /f /q "),
                Fragment::literal(path),
                Fragment::syntax(" 2>nul & if exist "),
                Fragment::literal(path),
                Fragment::syntax(" (cmd /c exit 1) else (cmd /c exit 0))"),
            ],
            // grouped so a leading `!` negates the whole check
            Command::DeleteIfExists(path) => vec![
                Fragment::syntax("{ rm -f "),
                Fragment::literal(path),
                Fragment::syntax(" && [ ! -e "),
                Fragment::literal(path),
                Fragment::syntax(" ]; }"),
            ],
            // the parenthesised goto lets cmd finish the line after the file is gone
            Command::RemoveSelf(path) if batch => vec![
                Fragment::syntax("(goto) 2>nul & del /f /q "),
                Fragment::literal(path),
            ],
            Command::RemoveSelf(path) => vec![Fragment::syntax("rm -f "), Fragment::literal(path)],
        }
    }
}
