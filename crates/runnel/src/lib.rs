//! Runnel: execution orchestration for an embedded interpreter
//!
//! Runnel runs untrusted programs in an interpreter that lives on its own
//! worker thread. It ships code and stdin lines to the worker, streams output
//! back, enforces a wall-clock limit by destroying and respawning the worker,
//! and re-imports a watched set of modules before every run.

mod config;
mod context;
mod error;
mod interpreter;
mod orchestrator;
mod run;
mod vfs;
mod watched;

pub mod harness;
pub mod reload;

pub use config::{DEFAULT_SUPPRESSED_MESSAGES, OrchestratorConfig, PackageSpec};
pub use context::{ContextId, Host};
pub use error::{
    ChannelError, ExecutionError, InitializationError, InterpreterError, OrchestratorError,
};
pub use interpreter::{Interpreter, InterpreterFactory};
pub use orchestrator::{Event, Orchestrator, OrchestratorBuilder, Phase, Snapshot};
pub use run::{RunOutcome, RunRequest, RunResult};
pub use vfs::{FsError, MemoryFs};
pub use watched::WatchedModules;
