//! The control unit that owns one execution context at a time.
//!
//! The orchestrator spawns and initializes contexts, sequences runs against
//! them, enforces the time limit by replacing the context, and keeps the
//! observable state (stdout, stderr, readiness, timings) up to date. State is
//! published as a [`Snapshot`] on a watch channel after every change, and
//! notable moments are broadcast as [`Event`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! NoContext -> Spawning -> Initializing -> Ready <-> Running
//!     ^                                      |          |
//!     +---------- terminate / interrupt -----+----------+
//! ```
//!
//! Interrupting goes back to `Spawning` with a fresh context. Results from a
//! context that has since been replaced are ignored.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::{OrchestratorConfig, PackageSpec};
use crate::context::{ContextEvent, ContextHandle, ContextId};
use crate::error::{ChannelError, ExecutionError, InitializationError, OrchestratorError};
use crate::harness;
use crate::interpreter::InterpreterFactory;
use crate::run::{RunOutcome, RunRequest, RunResult};
use crate::watched::WatchedModules;

const EVENT_CAPACITY: usize = 256;

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// Where the orchestrator is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No context exists
    #[default]
    NoContext,
    /// A context exists but initialization has not started, or it failed
    Spawning,
    /// The interpreter is booting and installing packages
    Initializing,
    /// Ready to accept a run
    Ready,
    /// A run is in flight
    Running,
}

/// Observable state, republished after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Lifecycle phase
    pub phase: Phase,
    /// The live context, if any
    pub context: Option<ContextId>,
    /// Output of the current or last run, lines joined with `\n`; a run that
    /// printed nothing shows a lone newline
    pub stdout: String,
    /// Traceback or timeout message; empty unless the last run failed
    pub stderr: String,
    /// A run is in flight
    pub running: bool,
    /// A run can be dispatched now
    pub ready: bool,
    /// Initialization is in progress
    pub loading: bool,
    /// The last run hit the time limit
    pub timed_out: bool,
    /// A request is queued until the interpreter is ready
    pub pending: bool,
    /// Interpreter version, once initialized
    pub version: Option<String>,
    /// Why the last initialization of the live context failed
    pub init_error: Option<String>,
    /// Interpreter boot time of the live context
    pub init_elapsed: Option<Duration>,
    /// Duration of the last completed run
    pub last_run_elapsed: Option<Duration>,
}

/// Notable moments, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A line of interpreter output was recorded
    Output(String),
    /// A context finished initializing
    Ready {
        /// The context that became ready
        context: ContextId,
        /// Interpreter version
        version: String,
    },
    /// A run returned from the context
    RunFinished {
        /// The context the run executed in
        context: ContextId,
        /// Wall-clock duration
        elapsed: Duration,
        /// Whether the run failed
        failed: bool,
    },
    /// A run hit the time limit and its context was replaced
    TimedOut {
        /// The context that was destroyed
        context: ContextId,
        /// The configured limit
        limit: Duration,
    },
    /// The context was replaced on request
    Interrupted {
        /// The replacement context
        context: ContextId,
    },
    /// The context was destroyed and not replaced
    Terminated {
        /// The destroyed context
        context: ContextId,
    },
}

/// A request waiting for the interpreter to become ready.
struct PendingRun {
    request: RunRequest,
    on_output: Option<Callback>,
}

#[derive(Default)]
struct State {
    context: Option<ContextHandle>,
    next_id: u64,
    loading: bool,
    running: bool,
    version: Option<String>,
    /// Arguments the live context is initialized with
    args: Vec<String>,
    stdout: Vec<String>,
    stderr: Option<String>,
    timed_out: bool,
    pending: Option<PendingRun>,
    init_elapsed: Option<Duration>,
    init_error: Option<InitializationError>,
    last_run: Option<Duration>,
}

impl State {
    fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(ContextHandle::id)
    }

    fn is_ready(&self) -> bool {
        self.context.is_some() && !self.loading && self.version.is_some()
    }

    fn phase(&self) -> Phase {
        if self.context.is_none() {
            Phase::NoContext
        } else if self.running {
            Phase::Running
        } else if self.loading {
            Phase::Initializing
        } else if self.version.is_some() {
            Phase::Ready
        } else {
            Phase::Spawning
        }
    }

    /// Recorded run output. A run that printed nothing still ends with the
    /// harness's blank line, which renders as a lone newline.
    fn stdout_text(&self) -> String {
        match self.stdout.as_slice() {
            [] => String::new(),
            [only] if only.is_empty() => "\n".to_string(),
            lines => lines.join("\n"),
        }
    }

    fn clear_output(&mut self) {
        self.stdout.clear();
        self.stderr = None;
        self.timed_out = false;
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase(),
            context: self.context_id(),
            stdout: self.stdout_text(),
            stderr: self.stderr.clone().unwrap_or_default(),
            running: self.running,
            ready: self.is_ready(),
            loading: self.loading,
            timed_out: self.timed_out,
            pending: self.pending.is_some(),
            version: self.version.clone(),
            init_error: self.init_error.as_ref().map(ToString::to_string),
            init_elapsed: self.init_elapsed,
            last_run_elapsed: self.last_run,
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    factory: Arc<dyn InterpreterFactory>,
    runtime: Handle,
    watched: WatchedModules,
    state: Mutex<State>,
    snapshot: watch::Sender<Snapshot>,
    events: broadcast::Sender<Event>,
    on_output: Option<Callback>,
    on_ready: Option<Callback>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(context) = state.context.take() {
            context.destroy();
        }
    }
}

/// Drives an embedded interpreter in an isolated execution context.
///
/// Cloning yields another handle to the same orchestrator.
///
/// # Example
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::builder(factory)
///     .timeout(Duration::from_secs(5))
///     .build()?;
/// orchestrator.initialize().await?;
///
/// let outcome = orchestrator
///     .run(RunRequest::new("print(input())").input(["hello"]))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    factory: Arc<dyn InterpreterFactory>,
    config: OrchestratorConfig,
    watched: WatchedModules,
    on_output: Option<Callback>,
    on_ready: Option<Callback>,
    runtime: Option<Handle>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("watched", &self.watched)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    fn new(factory: Arc<dyn InterpreterFactory>) -> Self {
        Self {
            factory,
            config: OrchestratorConfig::default(),
            watched: WatchedModules::new(),
            on_output: None,
            on_ready: None,
            runtime: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Packages installed into every context.
    pub fn packages(mut self, packages: PackageSpec) -> Self {
        self.config.packages = packages;
        self
    }

    /// Per-run time limit. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Defer spawning the context until the first run.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.config.lazy = lazy;
        self
    }

    /// Destroy the context after every finished run.
    pub fn terminate_on_completion(mut self, terminate: bool) -> Self {
        self.config.terminate_on_completion = terminate;
        self
    }

    /// Interpreter arguments for contexts spawned before any run sets them.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Share a watched-module set with another component.
    pub fn watched_modules(mut self, watched: WatchedModules) -> Self {
        self.watched = watched;
        self
    }

    /// Called with every unsuppressed output line. Lines printed during
    /// initialization are passed here and to the event stream but are not
    /// part of any run's stdout.
    pub fn on_output<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_output = Some(Arc::new(callback));
        self
    }

    /// Called with the interpreter version whenever a context becomes ready.
    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    /// Runtime that background initialization is scheduled on. Defaults to
    /// the runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the orchestrator. Unless lazy, this spawns the first context
    /// and schedules its initialization.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| OrchestratorError::Runtime(e.to_string()))?,
        };
        let state = State {
            args: self.config.args.clone(),
            ..Default::default()
        };
        let (snapshot, _) = watch::channel(state.snapshot());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let lazy = self.config.lazy;

        let orchestrator = Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                factory: self.factory,
                runtime,
                watched: self.watched,
                state: Mutex::new(state),
                snapshot,
                events,
                on_output: self.on_output,
                on_ready: self.on_ready,
            }),
        };
        if !lazy {
            orchestrator.spawn()?;
        }
        Ok(orchestrator)
    }
}

enum InitStep {
    Done(Duration),
    Join(ContextId),
    Start {
        context: ContextHandle,
        args: Vec<String>,
    },
}

enum RunStep {
    Dispatch(RunRequest, Option<Callback>),
    Respawn,
    Wait,
    NotReady,
}

impl Orchestrator {
    /// Start building an orchestrator around `factory`.
    pub fn builder<F>(factory: F) -> OrchestratorBuilder
    where
        F: InterpreterFactory + 'static,
    {
        OrchestratorBuilder::new(Arc::new(factory))
    }

    /// Build an orchestrator from a configuration document.
    pub fn new<F>(factory: F, config: OrchestratorConfig) -> Result<Self, OrchestratorError>
    where
        F: InterpreterFactory + 'static,
    {
        Self::builder(factory).config(config).build()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Apply `f` to the state and publish the resulting snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.inner.snapshot.send_replace(state.snapshot());
        result
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// The configuration this orchestrator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Current observable state.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Receiver for the event stream.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Whether a run can be dispatched now.
    pub fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// The live context, if any.
    pub fn context_id(&self) -> Option<ContextId> {
        self.lock().context_id()
    }

    /// Handle to the watched-module set.
    pub fn watched_modules(&self) -> &WatchedModules {
        &self.inner.watched
    }

    /// Re-import `modules` before every run.
    pub fn watch_modules<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.watched.watch(modules);
    }

    /// Stop re-importing `modules`.
    pub fn unwatch_modules<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.watched.unwatch(modules);
    }

    /// Replace the context with a fresh one and schedule its initialization.
    ///
    /// Any existing context is destroyed first; a run in flight on it
    /// settles as [`RunOutcome::Interrupted`].
    pub fn spawn(&self) -> Result<ContextId, OrchestratorError> {
        let id = self.update(|state| self.replace_context(state))?;
        self.schedule_initialization(id);
        Ok(id)
    }

    /// Destroy the live context, if any, and start a fresh one in its place.
    fn replace_context(&self, state: &mut State) -> Result<ContextId, ChannelError> {
        if let Some(old) = state.context.take() {
            old.destroy();
        }
        state.loading = false;
        state.running = false;
        state.version = None;
        state.init_elapsed = None;
        state.init_error = None;

        state.next_id += 1;
        let id = ContextId::new(state.next_id);
        let context = ContextHandle::spawn(id, Arc::clone(&self.inner.factory))?;
        state.context = Some(context);
        info!(context = %id, "spawned execution context");
        Ok(id)
    }

    fn schedule_initialization(&self, id: ContextId) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            if this.context_id() != Some(id) {
                return;
            }
            if let Err(err) = this.initialize().await {
                error!(context = %id, error = %err, "initialization failed");
            }
        });
    }

    /// Initialize the live context and return the interpreter boot time.
    ///
    /// If an initialization of the same context is already in progress, this
    /// waits for it instead of starting another. A ready context returns
    /// immediately. Failures are not retried.
    pub async fn initialize(&self) -> Result<Duration, OrchestratorError> {
        let step = self.update(|state| {
            let Some(context) = state.context.clone() else {
                return Err(OrchestratorError::NoContext);
            };
            if state.is_ready() {
                return Ok(InitStep::Done(state.init_elapsed.unwrap_or_default()));
            }
            if state.loading {
                return Ok(InitStep::Join(context.id()));
            }
            if let Some(err) = &state.init_error {
                return Err(err.clone().into());
            }
            state.loading = true;
            Ok(InitStep::Start {
                context,
                args: state.args.clone(),
            })
        })?;

        let (context, args) = match step {
            InitStep::Done(elapsed) => return Ok(elapsed),
            InitStep::Join(id) => return self.join_initialization(id).await,
            InitStep::Start { context, args } => (context, args),
        };

        let id = context.id();
        let packages = self.inner.config.packages.clone();
        info!(context = %id, ?packages, ?args, "initializing interpreter");

        let result = match context
            .init(packages, args, |event| self.handle_event(id, event, None))
            .await
        {
            Ok(Ok(elapsed)) => Ok(elapsed),
            Ok(Err(err)) => Err(err),
            Err(err) => Err(InitializationError::Channel(err)),
        };

        let settled = self.update(|state| {
            if state.context_id() != Some(id) {
                return None;
            }
            state.loading = false;
            match &result {
                Ok(elapsed) => {
                    state.init_elapsed = Some(*elapsed);
                    Some(state.pending.is_some())
                }
                Err(err) => {
                    state.init_error = Some(err.clone());
                    if state.pending.take().is_some() {
                        warn!(context = %id, "dropping queued run after failed initialization");
                    }
                    Some(false)
                }
            }
        });

        let Some(has_pending) = settled else {
            debug!(context = %id, "discarding initialization of a replaced context");
            return Err(ChannelError::Destroyed.into());
        };
        let elapsed = result?;
        info!(context = %id, ?elapsed, "interpreter initialized");

        if has_pending {
            self.dispatch_pending();
        }
        Ok(elapsed)
    }

    async fn join_initialization(&self, id: ContextId) -> Result<Duration, OrchestratorError> {
        debug!(context = %id, "waiting for initialization in progress");
        let mut updates = self.subscribe();
        let snapshot = updates
            .wait_for(|s| !s.loading || s.context != Some(id))
            .await
            .map_err(|_| ChannelError::Disconnected)?
            .clone();

        if snapshot.context != Some(id) {
            return Err(ChannelError::Destroyed.into());
        }
        if snapshot.ready {
            return Ok(snapshot.init_elapsed.unwrap_or_default());
        }
        Err(self.init_failure().unwrap_or(OrchestratorError::NotReady))
    }

    /// The recorded initialization failure of the live context.
    fn init_failure(&self) -> Option<OrchestratorError> {
        self.lock().init_error.clone().map(Into::into)
    }

    /// Wait until the live context is ready.
    ///
    /// Fails if there is no context, if its initialization fails, or if it
    /// is terminated while waiting.
    pub async fn wait_ready(&self) -> Result<(), OrchestratorError> {
        let mut updates = self.subscribe();
        let snapshot = updates
            .wait_for(|s| s.ready || s.init_error.is_some() || s.context.is_none())
            .await
            .map_err(|_| ChannelError::Disconnected)?
            .clone();

        if snapshot.ready {
            Ok(())
        } else if snapshot.init_error.is_some() {
            Err(self.init_failure().unwrap_or(OrchestratorError::NotReady))
        } else {
            Err(OrchestratorError::NoContext)
        }
    }

    /// Run a program. See [`run_with`](Self::run_with).
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, OrchestratorError> {
        self.run_request(request, None).await
    }

    /// Run a program, calling `on_output` with each output line and with the
    /// timeout message if the time limit is hit.
    ///
    /// Prior stdout, stderr and the timeout flag are cleared first. In lazy
    /// mode, or when the request's arguments differ from those the context
    /// was initialized with, the request is queued, a context is spawned if
    /// needed, and [`RunOutcome::Queued`] is returned; the request runs once
    /// the context is ready. Otherwise the context must be ready.
    pub async fn run_with<F>(
        &self,
        request: RunRequest,
        on_output: F,
    ) -> Result<RunOutcome, OrchestratorError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.run_request(request, Some(Arc::new(on_output))).await
    }

    async fn run_request(
        &self,
        request: RunRequest,
        on_output: Option<Callback>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let lazy = self.inner.config.lazy;
        let step = self.update(|state| {
            if state.running {
                return Err(OrchestratorError::Busy);
            }
            state.clear_output();

            if !request.args.is_empty() && request.args != state.args {
                state.args = request.args.clone();
                state.pending = Some(PendingRun { request, on_output });
                return Ok(RunStep::Respawn);
            }
            if state.is_ready() {
                return Ok(RunStep::Dispatch(request, on_output));
            }
            if !lazy {
                return Ok(RunStep::NotReady);
            }
            state.pending = Some(PendingRun { request, on_output });
            if state.context.is_none() || state.init_error.is_some() {
                Ok(RunStep::Respawn)
            } else {
                Ok(RunStep::Wait)
            }
        })?;

        match step {
            RunStep::Dispatch(request, on_output) => self.dispatch(request, on_output).await,
            RunStep::Respawn => {
                debug!("queued run until a new context is ready");
                self.spawn()?;
                Ok(RunOutcome::Queued)
            }
            RunStep::Wait => {
                debug!("queued run until initialization finishes");
                Ok(RunOutcome::Queued)
            }
            RunStep::NotReady => Err(OrchestratorError::NotReady),
        }
    }

    /// Dispatch the queued run, if any, on the runtime.
    fn dispatch_pending(&self) {
        let this = self.clone();
        self.inner.runtime.spawn(async move {
            // Taking the request and marking it in flight is one state change.
            let started = this.update(|state| {
                let pending = state.pending.take()?;
                Some(begin_run(state).map(|context| (context, pending)))
            });
            match started {
                None => {}
                Some(Err(err)) => warn!(error = %err, "queued run could not be dispatched"),
                Some(Ok((context, pending))) => {
                    let outcome = this
                        .execute_run(context, pending.request, pending.on_output)
                        .await;
                    debug!(?outcome, "queued run finished");
                }
            }
        });
    }

    async fn dispatch(
        &self,
        request: RunRequest,
        on_output: Option<Callback>,
    ) -> Result<RunOutcome, OrchestratorError> {
        let context = self.update(begin_run)?;
        Ok(self.execute_run(context, request, on_output).await)
    }

    /// Run `request` on a context already marked as running.
    async fn execute_run(
        &self,
        context: ContextHandle,
        request: RunRequest,
        on_output: Option<Callback>,
    ) -> RunOutcome {
        let id = context.id();
        let _guard = RunGuard {
            orchestrator: self,
            context: id,
        };
        let source = harness::wrap(&request.code, request.preamble.as_deref());
        info!(context = %id, input_lines = request.input.len(), "dispatching run");

        let started = Instant::now();
        let execution = self.execute(&context, source, request.input, on_output.as_ref());
        let settled = match self.inner.config.time_limit() {
            Some(limit) => tokio::select! {
                settled = execution => settled,
                () = tokio::time::sleep(limit) => {
                    return self.time_out(id, limit, on_output.as_ref());
                }
            },
            None => execution.await,
        };

        let outcome = self.settle(id, settled, started.elapsed());
        if self.inner.config.terminate_on_completion
            && matches!(outcome, RunOutcome::Completed(_) | RunOutcome::Failed(_))
        {
            self.terminate();
        }
        outcome
    }

    /// Reload watched modules, then run the wrapped program.
    async fn execute(
        &self,
        context: &ContextHandle,
        source: String,
        input: Vec<String>,
        on_output: Option<&Callback>,
    ) -> Result<Result<String, ExecutionError>, ChannelError> {
        let id = context.id();
        if let Some(script) = self.inner.watched.reload_script() {
            debug!(context = %id, modules = ?self.inner.watched.snapshot(), "reloading watched modules");
            let reloaded = context
                .run(script, Vec::new(), |event| self.handle_event(id, event, on_output))
                .await?;
            if let Err(err) = reloaded {
                return Ok(Err(err));
            }
        }
        context
            .run(source, input, |event| self.handle_event(id, event, on_output))
            .await
    }

    fn settle(
        &self,
        id: ContextId,
        settled: Result<Result<String, ExecutionError>, ChannelError>,
        elapsed: Duration,
    ) -> RunOutcome {
        let outcome = self.update(|state| {
            if state.context_id() != Some(id) {
                return None;
            }
            state.running = false;
            state.last_run = Some(elapsed);

            let message = match settled {
                Ok(Ok(transcript)) => {
                    return Some(RunOutcome::Completed(RunResult {
                        stdout: state.stdout_text(),
                        stderr: None,
                        elapsed,
                        transcript: Some(transcript),
                    }));
                }
                Ok(Err(err)) => err.to_string(),
                Err(err) => err.to_string(),
            };
            let stderr = format!("Traceback (most recent call last):\n{message}");
            state.stdout.clear();
            state.stderr = Some(stderr.clone());
            Some(RunOutcome::Failed(RunResult {
                stdout: String::new(),
                stderr: Some(stderr),
                elapsed,
                transcript: None,
            }))
        });

        let Some(outcome) = outcome else {
            debug!(context = %id, "discarding result from a replaced context");
            return RunOutcome::Interrupted;
        };
        let failed = matches!(outcome, RunOutcome::Failed(_));
        info!(context = %id, ?elapsed, failed, "run finished");
        self.emit(Event::RunFinished {
            context: id,
            elapsed,
            failed,
        });
        outcome
    }

    fn time_out(
        &self,
        id: ContextId,
        limit: Duration,
        on_output: Option<&Callback>,
    ) -> RunOutcome {
        if self.context_id() != Some(id) {
            return RunOutcome::Interrupted;
        }
        warn!(context = %id, ?limit, "run timed out, replacing execution context");

        let message = format!(
            "Execution timed out. Reached limit of {} ms.",
            limit.as_millis()
        );
        let replaced = self.update(|state| {
            let replaced = self.replace_context(state);
            state.stdout.clear();
            state.stderr = Some(message.clone());
            state.timed_out = true;
            replaced
        });
        match replaced {
            Ok(next) => self.schedule_initialization(next),
            Err(err) => error!(error = %err, "failed to replace timed out execution context"),
        }
        if let Some(callback) = on_output {
            callback(&message);
        }
        self.emit(Event::TimedOut { context: id, limit });
        RunOutcome::TimedOut { limit }
    }

    fn handle_event(&self, id: ContextId, event: ContextEvent, on_output: Option<&Callback>) {
        match event {
            ContextEvent::Output(line) => {
                if self.inner.config.is_suppressed(&line) {
                    return;
                }
                // Output outside a run (boot and package messages) is only
                // forwarded, never recorded as run output.
                let recorded = self.update(|state| {
                    let current = state.context_id() == Some(id);
                    if current && state.running {
                        state.stdout.push(line.clone());
                    }
                    current
                });
                if !recorded {
                    return;
                }
                if let Some(callback) = &self.inner.on_output {
                    callback(&line);
                }
                if let Some(callback) = on_output {
                    callback(&line);
                }
                self.emit(Event::Output(line));
            }
            ContextEvent::Ready { version } => {
                let recorded = self.update(|state| {
                    let current = state.context_id() == Some(id);
                    if current {
                        state.version = Some(version.clone());
                    }
                    current
                });
                if !recorded {
                    return;
                }
                debug!(context = %id, %version, "interpreter reported ready");
                if let Some(callback) = &self.inner.on_ready {
                    callback(&version);
                }
                self.emit(Event::Ready {
                    context: id,
                    version,
                });
            }
        }
    }

    /// Destroy the context, clear output and pending work, and spawn a
    /// replacement. Safe to call whether or not a run is in flight.
    pub fn interrupt(&self) -> Result<ContextId, OrchestratorError> {
        info!("interrupting execution");
        let id = self.update(|state| {
            state.clear_output();
            state.pending = None;
            self.replace_context(state)
        })?;
        self.schedule_initialization(id);
        self.emit(Event::Interrupted { context: id });
        Ok(id)
    }

    /// Destroy the context without replacing it.
    ///
    /// Output of the last run stays observable. A later lazy run spawns a
    /// new context; otherwise call [`spawn`](Self::spawn).
    pub fn terminate(&self) {
        let destroyed = self.update(|state| {
            let context = state.context.take()?;
            context.destroy();
            state.loading = false;
            state.running = false;
            state.version = None;
            state.pending = None;
            Some(context.id())
        });
        if let Some(id) = destroyed {
            info!(context = %id, "terminated execution context");
            self.emit(Event::Terminated { context: id });
        }
    }

    fn context(&self) -> Result<ContextHandle, OrchestratorError> {
        self.lock().context.clone().ok_or(OrchestratorError::NoContext)
    }

    /// Read a UTF-8 file from the context's filesystem.
    pub async fn read_file(&self, path: &str) -> Result<String, OrchestratorError> {
        Ok(self.context()?.read_file(path).await??)
    }

    /// Create or replace a file in the context's filesystem.
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<(), OrchestratorError> {
        Ok(self.context()?.write_file(path, contents).await??)
    }

    /// Create a directory in the context's filesystem.
    pub async fn mkdir(&self, path: &str) -> Result<(), OrchestratorError> {
        Ok(self.context()?.mkdir(path).await??)
    }

    /// Remove an empty directory from the context's filesystem.
    pub async fn rmdir(&self, path: &str) -> Result<(), OrchestratorError> {
        Ok(self.context()?.rmdir(path).await??)
    }
}

/// Mark a run as in flight on the live context.
fn begin_run(state: &mut State) -> Result<ContextHandle, OrchestratorError> {
    if state.running {
        return Err(OrchestratorError::Busy);
    }
    if !state.is_ready() {
        return Err(OrchestratorError::NotReady);
    }
    let context = state.context.clone().ok_or(OrchestratorError::NoContext)?;
    state.running = true;
    state.clear_output();
    Ok(context)
}

/// Clears the in-flight flag however a dispatch ends.
struct RunGuard<'a> {
    orchestrator: &'a Orchestrator,
    context: ContextId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.update(|state| {
            if state.context_id() == Some(self.context) {
                state.running = false;
            }
        });
    }
}
