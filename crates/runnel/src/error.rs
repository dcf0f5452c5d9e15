//! Error types for every layer of the orchestrator

use std::sync::Arc;

use thiserror::Error;

use crate::vfs::FsError;

/// Errors reported by an interpreter implementation
#[derive(Debug, Clone, Error)]
pub enum InterpreterError {
    /// The interpreter could not be constructed
    #[error("interpreter bootstrap failed: {0}")]
    Boot(String),
    /// A package could not be loaded or installed
    #[error("package installation failed: {0}")]
    Package(String),
}

/// Errors raised while a program executes inside the context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The program raised; the message is already formatted by the interpreter
    #[error("{0}")]
    Raised(String),
    /// The program read more lines than were supplied
    #[error("EOFError: Input value is empty")]
    InputExhausted,
    /// The context was destroyed while the program was running
    #[error("execution context was destroyed")]
    Killed,
    /// A run reached a context that has not been initialized
    #[error("interpreter is not loaded")]
    Uninitialized,
}

/// Errors from the transport between the orchestrator and the context
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The context was destroyed before the call settled
    #[error("execution context was destroyed")]
    Destroyed,
    /// The worker went away without answering
    #[error("execution context disconnected")]
    Disconnected,
    /// The worker thread could not be started
    #[error("failed to start execution context: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Spawn(Arc::new(err))
    }
}

/// Errors that fail an initialization
///
/// Cloneable so that every caller waiting on the same initialization sees the
/// same failure.
#[derive(Debug, Clone, Error)]
pub enum InitializationError {
    /// The interpreter could not boot
    #[error("failed to boot interpreter: {0}")]
    Boot(#[source] InterpreterError),
    /// Loading the prebuilt packages failed
    #[error("failed to load native packages: {0}")]
    NativePackages(#[source] InterpreterError),
    /// Installing the dynamic packages failed
    #[error("failed to install dynamic packages: {0}")]
    DynamicPackages(#[source] InterpreterError),
    /// The context already holds an interpreter
    #[error("execution context is already initialized")]
    AlreadyInitialized,
    /// Transport failure during initialization
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors returned by [`Orchestrator`](crate::Orchestrator) operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// `run` was called while no interpreter is ready
    #[error("interpreter is not loaded yet")]
    NotReady,
    /// `run` was called while another run is in flight
    #[error("a run is already in progress")]
    Busy,
    /// There is no execution context to talk to
    #[error("no execution context")]
    NoContext,
    /// The orchestrator was built outside a Tokio runtime
    #[error("no Tokio runtime available: {0}")]
    Runtime(String),
    /// Initialization failed
    #[error(transparent)]
    Init(#[from] InitializationError),
    /// A filesystem call failed inside the context
    #[error(transparent)]
    Fs(#[from] FsError),
    /// Transport failure
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
