//! The embedded interpreter, as seen by an execution context.
//!
//! Interpreters are created and driven on the context's own thread. Async
//! methods are driven there with a local executor, so implementations must
//! not rely on a Tokio reactor being present.

use async_trait::async_trait;

use crate::context::Host;
use crate::error::{ExecutionError, InterpreterError};

/// An interpreter instance owned by one execution context.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl Interpreter for Echo {
///     fn version(&self) -> String {
///         "echo-1".to_string()
///     }
///
///     fn run(&mut self, source: &str, host: &mut Host<'_>) -> Result<(), ExecutionError> {
///         for line in source.lines() {
///             host.write_line(line)?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Interpreter: Send {
    /// Version string reported once initialization completes.
    fn version(&self) -> String;

    /// Name of the native package that provides dynamic installs, if any.
    ///
    /// It is loaded with [`load_packages`](Self::load_packages) right before
    /// [`install_packages`](Self::install_packages) runs.
    fn package_installer(&self) -> Option<&str> {
        None
    }

    /// Load prebuilt packages.
    async fn load_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        unsupported(packages)
    }

    /// Fetch and install packages at runtime.
    async fn install_packages(&mut self, packages: &[String]) -> Result<(), InterpreterError> {
        unsupported(packages)
    }

    /// Messages printed outside a run, such as boot banners.
    ///
    /// Drained after boot and after each package step and streamed to the
    /// orchestrator like program output.
    fn drain_messages(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Execute `source` to completion.
    ///
    /// All I/O goes through `host`. Errors returned here fail the run and are
    /// reported as a traceback; the interpreter stays usable for later runs.
    fn run(&mut self, source: &str, host: &mut Host<'_>) -> Result<(), ExecutionError>;
}

fn unsupported(packages: &[String]) -> Result<(), InterpreterError> {
    if packages.is_empty() {
        Ok(())
    } else {
        Err(InterpreterError::Package(format!(
            "package loading is not supported: {}",
            packages.join(", ")
        )))
    }
}

/// Creates interpreters for new execution contexts.
#[async_trait]
pub trait InterpreterFactory: Send + Sync {
    /// Construct an interpreter with process-style arguments.
    async fn boot(&self, args: &[String]) -> Result<Box<dyn Interpreter>, InterpreterError>;
}

/// Blanket implementation for plain constructors.
///
/// ```rust,ignore
/// Orchestrator::builder(|_args: &[String]| Ok(Box::new(Echo) as Box<dyn Interpreter>));
/// ```
#[async_trait]
impl<F> InterpreterFactory for F
where
    F: Fn(&[String]) -> Result<Box<dyn Interpreter>, InterpreterError> + Send + Sync,
{
    async fn boot(&self, args: &[String]) -> Result<Box<dyn Interpreter>, InterpreterError> {
        self(args)
    }
}
