//! Static enumeration of every execution path through a [`ScriptTemplate`].
//!
//! The template is flattened into a small instruction list where every
//! branch and jump moves forward, so the walk always terminates. A path is
//! the sequence of service and swap events along one route from the first
//! instruction to the end of the script.

use std::fmt;

use super::template::{Command, Label, ScriptTemplate, Step};
use crate::update::error::TemplateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Stopped,
    Started,
    /// The failure branch of a move was taken
    SwapFailed,
    Entered(Label),
    RemovedSelf,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Stopped => f.write_str("stop"),
            Event::Started => f.write_str("start"),
            Event::SwapFailed => f.write_str("swap-failed"),
            Event::Entered(label) => write!(f, ":{label}"),
            Event::RemovedSelf => f.write_str("remove-self"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPath {
    events: Vec<Event>,
}

impl ExecutionPath {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn contains(&self, event: Event) -> bool {
        self.events.contains(&event)
    }

    /// The last stop has no start after it.
    pub fn leaves_service_stopped(&self) -> bool {
        match self.events.iter().rposition(|e| *e == Event::Stopped) {
            Some(stop) => !self.events[stop + 1..].contains(&Event::Started),
            None => false,
        }
    }

    /// Some swap failure is not followed by the rollback or restart-old section.
    pub fn has_unrecovered_swap_failure(&self) -> bool {
        self.events.iter().enumerate().any(|(i, e)| {
            *e == Event::SwapFailed
                && !self.events[i + 1..].iter().any(|later| {
                    matches!(later, Event::Entered(Label::Rollback | Label::RestartOld))
                })
        })
    }

    pub fn ends_with_cleanup(&self) -> bool {
        self.events.last() == Some(&Event::RemovedSelf)
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.events.is_empty() {
            return f.write_str("(no events)");
        }
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{event}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Instr {
    Event(Event),
    /// The success branch continues at the target; failure falls through
    Fork(usize),
    Jump(usize),
}

struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    fn compile(template: &ScriptTemplate) -> Result<Self, TemplateError> {
        let mut instrs = Vec::new();
        let mut starts: Vec<(Label, usize, usize)> = Vec::new();
        let mut gotos: Vec<(usize, Label, usize)> = Vec::new();

        for (index, section) in template.sections.iter().enumerate() {
            match section.label {
                Some(label) => {
                    if starts.iter().any(|(l, _, _)| *l == label) {
                        return Err(TemplateError::DuplicateLabel(label.name()));
                    }
                    starts.push((label, index, instrs.len()));
                    instrs.push(Instr::Event(Event::Entered(label)));
                }
                None if index > 0 => return Err(TemplateError::UnlabeledSection(index)),
                None => {}
            }

            for step in &section.steps {
                compile_step(step, index, false, &mut instrs, &mut gotos)?;
            }
        }

        let section_name = |index: usize| {
            template.sections[index]
                .label
                .map(Label::name)
                .unwrap_or("main")
        };

        for (at, label, from) in gotos {
            let (_, target_index, target_pc) = starts
                .iter()
                .find(|(l, _, _)| *l == label)
                .copied()
                .ok_or(TemplateError::UnknownLabel(label.name()))?;
            if target_index <= from {
                return Err(TemplateError::BackwardJump {
                    label: label.name(),
                    from: section_name(from),
                });
            }
            instrs[at] = Instr::Jump(target_pc);
        }

        Ok(Self { instrs })
    }

    fn walk(&self, mut pc: usize, trace: &mut Vec<Event>, out: &mut Vec<ExecutionPath>) {
        let mark = trace.len();
        loop {
            match self.instrs.get(pc) {
                None => {
                    out.push(ExecutionPath {
                        events: trace.clone(),
                    });
                    break;
                }
                Some(Instr::Event(event)) => {
                    trace.push(*event);
                    pc += 1;
                }
                Some(Instr::Fork(success)) => {
                    self.walk(*success, trace, out);
                    pc += 1;
                }
                Some(Instr::Jump(target)) => pc = *target,
            }
        }
        trace.truncate(mark);
    }
}

fn compile_step(
    step: &Step,
    section: usize,
    nested: bool,
    instrs: &mut Vec<Instr>,
    gotos: &mut Vec<(usize, Label, usize)>,
) -> Result<(), TemplateError> {
    match step {
        Step::Log(_) | Step::Sleep(_) => {}
        Step::Run(command) => {
            push_command(command, instrs);
            if command.is_move() {
                // an unchecked move continues either way
                let after = instrs.len() + 2;
                instrs.push(Instr::Fork(after));
                instrs.push(Instr::Event(Event::SwapFailed));
            }
        }
        Step::OnFailure { command, then } => {
            if nested {
                return Err(TemplateError::NestedFailureBlock);
            }
            push_command(command, instrs);
            let fork = instrs.len();
            instrs.push(Instr::Fork(0));
            if command.is_move() {
                instrs.push(Instr::Event(Event::SwapFailed));
            }
            for inner in then {
                compile_step(inner, section, true, instrs, gotos)?;
            }
            instrs[fork] = Instr::Fork(instrs.len());
        }
        Step::Goto(label) => {
            gotos.push((instrs.len(), *label, section));
            instrs.push(Instr::Jump(usize::MAX));
        }
    }
    Ok(())
}

fn push_command(command: &Command, instrs: &mut Vec<Instr>) {
    let event = match command {
        Command::StopService => Event::Stopped,
        Command::StartService => Event::Started,
        Command::RemoveSelf(_) => Event::RemovedSelf,
        _ => return,
    };
    instrs.push(Instr::Event(event));
}

impl ScriptTemplate {
    /// All paths through the template, success branches first.
    pub fn execution_paths(&self) -> Result<Vec<ExecutionPath>, TemplateError> {
        let program = Program::compile(self)?;
        let mut paths = Vec::new();
        program.walk(0, &mut Vec::new(), &mut paths);
        Ok(paths)
    }

    /// Reject the template unless every path restarts a stopped service,
    /// recovers from every swap failure and ends by removing the script.
    pub fn check_recovery(&self) -> Result<Vec<ExecutionPath>, TemplateError> {
        let paths = self.execution_paths()?;
        for path in &paths {
            if path.leaves_service_stopped() {
                return Err(TemplateError::StopWithoutStart {
                    path: path.to_string(),
                });
            }
            if path.has_unrecovered_swap_failure() {
                return Err(TemplateError::UnrecoveredSwapFailure {
                    path: path.to_string(),
                });
            }
            if !path.ends_with_cleanup() {
                return Err(TemplateError::MissingCleanup {
                    path: path.to_string(),
                });
            }
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::script::template::Section;

    fn remove_self() -> Step {
        Step::Run(Command::RemoveSelf("/tmp/s.sh".into()))
    }

    fn mv() -> Command {
        Command::Move {
            from: "/a".into(),
            to: "/b".into(),
        }
    }

    #[test]
    fn query_branch_yields_two_paths() {
        let template = ScriptTemplate::new(
            "/tmp/s.log",
            vec![Section::main(vec![
                Step::on_failure(
                    Command::QueryStopped,
                    vec![Step::Run(Command::StopService), Step::Run(Command::StartService)],
                ),
                remove_self(),
            ])],
        );

        let paths = template.check_recovery().unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].events(), [Event::RemovedSelf]);
        assert_eq!(
            paths[1].events(),
            [Event::Stopped, Event::Started, Event::RemovedSelf]
        );
    }

    #[test]
    fn swap_failure_jumping_straight_to_cleanup_is_rejected() {
        let template = ScriptTemplate::new(
            "/tmp/s.log",
            vec![
                Section::main(vec![Step::on_failure(mv(), vec![Step::Goto(Label::Cleanup)])]),
                Section::labeled(Label::Cleanup, vec![remove_self()]),
            ],
        );

        let err = template.check_recovery().unwrap_err();
        assert!(matches!(err, TemplateError::UnrecoveredSwapFailure { .. }), "{err}");
    }

    #[test]
    fn swap_failure_must_reach_recovery() {
        let template = ScriptTemplate::new(
            "/tmp/s.log",
            vec![
                Section::main(vec![
                    Step::Run(Command::StopService),
                    Step::on_failure(mv(), vec![Step::Goto(Label::RestartOld)]),
                    Step::Run(Command::StartService),
                    Step::Goto(Label::Cleanup),
                ]),
                Section::labeled(Label::RestartOld, vec![Step::Run(Command::StartService)]),
                Section::labeled(Label::Cleanup, vec![remove_self()]),
            ],
        );

        let paths = template.check_recovery().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[1].contains(Event::SwapFailed));
        assert!(paths[1].contains(Event::Entered(Label::RestartOld)));
    }

    #[test]
    fn stopped_service_left_down_is_reported() {
        let template = ScriptTemplate::new(
            "/tmp/s.log",
            vec![Section::main(vec![
                Step::Run(Command::StartService),
                Step::Run(Command::StopService),
                remove_self(),
            ])],
        );

        let err = template.check_recovery().unwrap_err();
        assert!(matches!(err, TemplateError::StopWithoutStart { .. }));
        assert!(err.to_string().contains("start -> stop -> remove-self"));
    }

    #[test]
    fn missing_cleanup_is_reported() {
        let template = ScriptTemplate::new("/tmp/s.log", vec![Section::main(vec![Step::log("hi")])]);
        assert!(matches!(
            template.check_recovery(),
            Err(TemplateError::MissingCleanup { .. })
        ));
    }

    #[test]
    fn backward_and_unknown_jumps_are_rejected() {
        let backward = ScriptTemplate::new(
            "/tmp/s.log",
            vec![
                Section::main(vec![]),
                Section::labeled(Label::Rollback, vec![]),
                Section::labeled(Label::Cleanup, vec![Step::Goto(Label::Rollback)]),
            ],
        );
        assert!(matches!(
            backward.execution_paths(),
            Err(TemplateError::BackwardJump { label: "rollback", from: "cleanup" })
        ));

        let unknown = ScriptTemplate::new(
            "/tmp/s.log",
            vec![Section::main(vec![Step::Goto(Label::RestartOld)])],
        );
        assert!(matches!(
            unknown.execution_paths(),
            Err(TemplateError::UnknownLabel("restart_old"))
        ));
    }

    #[test]
    fn structural_mistakes_are_rejected() {
        let nested = ScriptTemplate::new(
            "/tmp/s.log",
            vec![Section::main(vec![Step::on_failure(
                Command::QueryRunning,
                vec![Step::on_failure(Command::QueryStopped, vec![])],
            )])],
        );
        assert!(matches!(
            nested.execution_paths(),
            Err(TemplateError::NestedFailureBlock)
        ));

        let unlabeled = ScriptTemplate::new(
            "/tmp/s.log",
            vec![Section::main(vec![]), Section::main(vec![])],
        );
        assert!(matches!(
            unlabeled.execution_paths(),
            Err(TemplateError::UnlabeledSection(1))
        ));
    }
}
