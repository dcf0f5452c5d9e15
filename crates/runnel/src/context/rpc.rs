//! Request/response transport between the orchestrator and a context.
//!
//! Each request carries its own oneshot responder. Output produced while a
//! request is being served travels back over a separate event channel, so the
//! caller can observe it before the response arrives. Destruction is out of
//! band: cancelling the kill token fails every outstanding call immediately.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::worker::Worker;
use crate::config::PackageSpec;
use crate::error::{ChannelError, ExecutionError, InitializationError};
use crate::interpreter::InterpreterFactory;
use crate::vfs::FsError;

/// Generation number of an execution context.
///
/// Every spawn gets a fresh id, so results from a destroyed context can be
/// told apart from those of its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw generation number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Messages the context pushes while serving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContextEvent {
    /// One line of interpreter output
    Output(String),
    /// Initialization finished; carries the interpreter version
    Ready { version: String },
}

pub(crate) enum Request {
    Init {
        packages: PackageSpec,
        args: Vec<String>,
        respond: oneshot::Sender<Result<Duration, InitializationError>>,
    },
    Run {
        source: String,
        input: Vec<String>,
        respond: oneshot::Sender<Result<String, ExecutionError>>,
    },
    ReadFile {
        path: String,
        respond: oneshot::Sender<Result<String, FsError>>,
    },
    WriteFile {
        path: String,
        contents: String,
        respond: oneshot::Sender<Result<(), FsError>>,
    },
    Mkdir {
        path: String,
        respond: oneshot::Sender<Result<(), FsError>>,
    },
    Rmdir {
        path: String,
        respond: oneshot::Sender<Result<(), FsError>>,
    },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init { packages, args, .. } => f
                .debug_struct("Init")
                .field("packages", packages)
                .field("args", args)
                .finish_non_exhaustive(),
            Self::Run { input, .. } => f
                .debug_struct("Run")
                .field("input_lines", &input.len())
                .finish_non_exhaustive(),
            Self::ReadFile { path, .. } => f.debug_struct("ReadFile").field("path", path).finish(),
            Self::WriteFile { path, .. } => {
                f.debug_struct("WriteFile").field("path", path).finish_non_exhaustive()
            }
            Self::Mkdir { path, .. } => f.debug_struct("Mkdir").field("path", path).finish(),
            Self::Rmdir { path, .. } => f.debug_struct("Rmdir").field("path", path).finish(),
        }
    }
}

/// Orchestrator-side handle to one live context.
#[derive(Clone)]
pub(crate) struct ContextHandle {
    id: ContextId,
    requests: mpsc::UnboundedSender<Request>,
    events: Arc<Mutex<mpsc::UnboundedReceiver<ContextEvent>>>,
    kill: CancellationToken,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("destroyed", &self.kill.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ContextHandle {
    /// Start a worker thread for a new context.
    pub(crate) fn spawn(
        id: ContextId,
        factory: Arc<dyn InterpreterFactory>,
    ) -> Result<Self, ChannelError> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();

        let worker = Worker::new(id, factory, kill.clone(), events_tx);
        std::thread::Builder::new()
            .name(format!("runnel-{id}"))
            .spawn(move || worker.serve(requests_rx))?;

        debug!(context = %id, "spawned execution context");
        Ok(Self {
            id,
            requests: requests_tx,
            events: Arc::new(Mutex::new(events_rx)),
            kill,
        })
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    /// Destroy the context. Outstanding calls fail with
    /// [`ChannelError::Destroyed`]; later calls fail the same way.
    pub(crate) fn destroy(&self) {
        if !self.kill.is_cancelled() {
            debug!(context = %self.id, "destroying execution context");
            self.kill.cancel();
        }
    }

    pub(crate) async fn init<F>(
        &self,
        packages: PackageSpec,
        args: Vec<String>,
        on_event: F,
    ) -> Result<Result<Duration, InitializationError>, ChannelError>
    where
        F: FnMut(ContextEvent) + Send,
    {
        self.call_streaming(
            |respond| Request::Init {
                packages,
                args,
                respond,
            },
            on_event,
        )
        .await
    }

    pub(crate) async fn run<F>(
        &self,
        source: String,
        input: Vec<String>,
        on_event: F,
    ) -> Result<Result<String, ExecutionError>, ChannelError>
    where
        F: FnMut(ContextEvent) + Send,
    {
        self.call_streaming(
            |respond| Request::Run {
                source,
                input,
                respond,
            },
            on_event,
        )
        .await
    }

    pub(crate) async fn read_file(&self, path: &str) -> Result<Result<String, FsError>, ChannelError> {
        let path = path.to_string();
        self.call(|respond| Request::ReadFile { path, respond }).await
    }

    pub(crate) async fn write_file(
        &self,
        path: &str,
        contents: &str,
    ) -> Result<Result<(), FsError>, ChannelError> {
        let (path, contents) = (path.to_string(), contents.to_string());
        self.call(|respond| Request::WriteFile {
            path,
            contents,
            respond,
        })
        .await
    }

    pub(crate) async fn mkdir(&self, path: &str) -> Result<Result<(), FsError>, ChannelError> {
        let path = path.to_string();
        self.call(|respond| Request::Mkdir { path, respond }).await
    }

    pub(crate) async fn rmdir(&self, path: &str) -> Result<Result<(), FsError>, ChannelError> {
        let path = path.to_string();
        self.call(|respond| Request::Rmdir { path, respond }).await
    }

    fn send<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<oneshot::Receiver<T>, ChannelError> {
        if self.kill.is_cancelled() {
            return Err(ChannelError::Destroyed);
        }
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| ChannelError::Disconnected)?;
        Ok(rx)
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ChannelError> {
        let response = self.send(request)?;
        tokio::select! {
            biased;
            _ = self.kill.cancelled() => Err(ChannelError::Destroyed),
            result = response => result.map_err(|_| ChannelError::Disconnected),
        }
    }

    /// Like [`call`](Self::call), but forwards every event the context emits
    /// until the response arrives.
    async fn call_streaming<T, F>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
        mut on_event: F,
    ) -> Result<T, ChannelError>
    where
        F: FnMut(ContextEvent) + Send,
    {
        let mut events = self.events.lock().await;
        let mut response = self.send(request)?;

        let result = loop {
            tokio::select! {
                biased;
                _ = self.kill.cancelled() => return Err(ChannelError::Destroyed),
                Some(event) = events.recv() => on_event(event),
                result = &mut response => break result.map_err(|_| ChannelError::Disconnected),
            }
        };
        // Events sent before the response are already queued.
        while let Ok(event) = events.try_recv() {
            on_event(event);
        }
        result
    }
}
