mod background;
pub mod subagent;
mod workbench;

pub use background::{
    CodeTaskRunner, DEFAULT_MAX_CONCURRENT, Orchestrator, OrchestratorError,
    OrchestratorErrorKind, ProgressReporter, TaskContext, TaskOutcome, TaskOutput, TaskReport,
    TaskRunner, TaskSnapshot, TaskState,
};
pub use subagent::{RoleConfig, RoleRegistry, RoleSummary};
pub use workbench::{PRIMARY_SESSION, StepContext, ToolCatalog, Workbench};
