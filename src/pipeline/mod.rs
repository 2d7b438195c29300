pub mod artifacts;
pub mod context;
pub mod executor;
pub mod state;
pub mod steps;

pub use artifacts::RunDirectory;
pub use context::ExecutionContext;
pub use executor::{ActiveWorkflow, PipelineExecutor};
pub use state::{
    Failure, FailureInput, FailureStats, FailureStatus, PipelineState, TaskExecution, TaskStatus,
};
