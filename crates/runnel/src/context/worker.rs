//! The thread that owns an interpreter and serves requests for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bridge::Host;
use super::rpc::{ContextEvent, ContextId, Request};
use crate::config::PackageSpec;
use crate::error::{ExecutionError, InitializationError};
use crate::interpreter::{Interpreter, InterpreterFactory};
use crate::vfs::MemoryFs;

pub(crate) struct Worker {
    id: ContextId,
    factory: Arc<dyn InterpreterFactory>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<ContextEvent>,
    fs: MemoryFs,
    interpreter: Option<Box<dyn Interpreter>>,
}

impl Worker {
    pub(crate) fn new(
        id: ContextId,
        factory: Arc<dyn InterpreterFactory>,
        kill: CancellationToken,
        events: mpsc::UnboundedSender<ContextEvent>,
    ) -> Self {
        Self {
            id,
            factory,
            kill,
            events,
            fs: MemoryFs::new(),
            interpreter: None,
        }
    }

    /// Serve requests until the context is destroyed or every handle is gone.
    pub(crate) fn serve(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = requests.blocking_recv() {
            if self.kill.is_cancelled() {
                break;
            }
            self.handle(request);
        }
        debug!(context = %self.id, "execution context stopped");
    }

    // Send failures mean the caller stopped waiting; the response is dropped.
    fn handle(&mut self, request: Request) {
        match request {
            Request::Init {
                packages,
                args,
                respond,
            } => {
                let _ = respond.send(self.init(packages, &args));
            }
            Request::Run {
                source,
                input,
                respond,
            } => {
                let _ = respond.send(self.run(&source, input));
            }
            Request::ReadFile { path, respond } => {
                let _ = respond.send(self.fs.read_to_string(&path));
            }
            Request::WriteFile {
                path,
                contents,
                respond,
            } => {
                let _ = respond.send(self.fs.write(&path, contents));
            }
            Request::Mkdir { path, respond } => {
                let _ = respond.send(self.fs.mkdir(&path));
            }
            Request::Rmdir { path, respond } => {
                let _ = respond.send(self.fs.rmdir(&path));
            }
        }
    }

    /// Boot the interpreter and install packages. Returns the boot time.
    fn init(
        &mut self,
        packages: PackageSpec,
        args: &[String],
    ) -> Result<Duration, InitializationError> {
        if self.interpreter.is_some() {
            return Err(InitializationError::AlreadyInitialized);
        }

        info!(context = %self.id, ?args, "booting interpreter");
        let started = Instant::now();
        let mut interpreter = block_on(self.factory.boot(args)).map_err(InitializationError::Boot)?;
        let boot_time = started.elapsed();
        self.forward_messages(interpreter.as_mut());

        // Native packages first: the dynamic installer may itself be one.
        if !packages.native.is_empty() {
            debug!(context = %self.id, packages = ?packages.native, "loading native packages");
            block_on(interpreter.load_packages(&packages.native))
                .map_err(InitializationError::NativePackages)?;
            self.forward_messages(interpreter.as_mut());
        }
        if !packages.dynamic.is_empty() {
            if let Some(installer) = interpreter.package_installer().map(str::to_string) {
                block_on(interpreter.load_packages(&[installer]))
                    .map_err(InitializationError::DynamicPackages)?;
            }
            debug!(context = %self.id, packages = ?packages.dynamic, "installing dynamic packages");
            block_on(interpreter.install_packages(&packages.dynamic))
                .map_err(InitializationError::DynamicPackages)?;
            self.forward_messages(interpreter.as_mut());
        }

        let version = interpreter.version();
        info!(context = %self.id, %version, ?boot_time, "interpreter ready");
        self.interpreter = Some(interpreter);
        let _ = self.events.send(ContextEvent::Ready { version });
        Ok(boot_time)
    }

    fn run(&mut self, source: &str, input: Vec<String>) -> Result<String, ExecutionError> {
        let interpreter = self
            .interpreter
            .as_mut()
            .ok_or(ExecutionError::Uninitialized)?;

        let mut host = Host::new(input, &mut self.fs, self.kill.clone(), self.events.clone());
        let result = interpreter.run(source, &mut host);
        let transcript = host.into_transcript();

        if let Err(err) = &result {
            if *err == ExecutionError::Killed {
                debug!(context = %self.id, "run aborted by destroy");
            } else {
                debug!(context = %self.id, error = %err, "run raised");
            }
        }
        result.map(|()| transcript)
    }

    fn forward_messages(&self, interpreter: &mut dyn Interpreter) {
        for line in interpreter.drain_messages() {
            let _ = self.events.send(ContextEvent::Output(line));
        }
    }
}
