//! Update script generation
//!
//! Scripts are built as structured [`ScriptTemplate`]s, checked for
//! recovery on every execution path, then rendered for the target
//! interpreter with every path embedded as an escaped literal.

pub mod analysis;
pub mod generator;
pub mod render;
pub mod template;

pub use analysis::{Event, ExecutionPath};
pub use generator::{GeneratedScript, ScriptGenerator, ScriptSettings};
pub use render::{ScriptDialect, render, render_fragment};
pub use template::{Command, Fragment, Label, ScriptTemplate, Section, Step, VarRef};
