//! Self-update of the agent executable
//!
//! The agent cannot replace its own file while it runs, and the service
//! manager will kill it once the swap starts. So an update is planned and
//! checked here, then rendered into a script that a detached process runs to
//! completion: stop, back up, swap, start, verify, and roll back on any
//! failure. The script's log is the record of what happened.

pub mod artifact;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod plan;
pub mod protection;
pub mod runner;
pub mod script;
pub mod status;
pub mod swap;
pub mod version;

pub use artifact::{ArtifactSource, StagedArtifact, VerifiedArtifact};
pub use error::{
    ArtifactError, LaunchError, PlanError, ProtectionError, SwapError, TemplateError, UpdateError,
};
pub use orchestrator::{Handoff, Orchestrator, OrchestratorSettings};
pub use outcome::ScriptVerdict;
pub use plan::{RollbackPlan, UpdatePlan};
pub use protection::{AclReset, NoProtection, ProtectionToggle};
pub use runner::{DetachedRunner, LaunchHandle, LaunchStrategy, Launcher};
pub use script::{GeneratedScript, ScriptDialect, ScriptGenerator, ScriptSettings};
pub use status::{StatusReporter, StatusUpdate, UpdateOutcome, UpdateState};
pub use swap::SwapExecutor;
