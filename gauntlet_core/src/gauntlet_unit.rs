//! Execution units: isolated, message-driven workers.
//!
//! A unit runs a [`UnitProgram`] on a dedicated worker thread with its own
//! single-threaded runtime. The supervisor and the unit share nothing
//! mutable; they talk over two channels.
//!
//! ```text
//!        Supervisor                                 Unit (worker thread)
//!  ┌──────────────────────┐   UnitCommand    ┌──────────────────────────┐
//!  │ ExecutionUnit handle │ ───────────────► │ router ─► inbox Mailbox  │
//!  │  post_message()      │                  │        └► pending deps   │
//!  │  add_listener() ◄─┐  │   UnitSignal     │                          │
//!  │  supervise task ──┘  │ ◄─────────────── │ program (bootstrap, run) │
//!  └──────────────────────┘                  └──────────────────────────┘
//! ```
//!
//! # Handshake
//!
//! Before it signals ready, a unit may ask for dependencies by logical
//! path. Each request suspends until the supervisor's single reply for
//! that path arrives. Calling [`UnitBootstrap::ready`] revokes the unit's
//! request capability; independently, the supervisor's [`Handshake`]
//! refuses any later request and kills the unit. Neither side trusts the
//! other to enforce this alone.

use crate::gauntlet_protocol::{Inbound, Outbound};
use crate::mailbox::{ListenerId, Mailbox, Subscription};

use async_trait::async_trait;
use gauntlet_env::{CodeLoader, EnvError, GauntletContext, ModuleSource, UnitId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Errors raised by execution units and their supervisor.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The unit broke the handshake rules (fatal to the unit)
    #[error("protocol violation by unit {unit}: {reason}")]
    ProtocolViolation { unit: UnitId, reason: String },

    /// Loading or channel failure from the environment layer
    #[error(transparent)]
    Env(#[from] EnvError),

    /// The unit is gone (crashed, terminated or never became ready)
    #[error("unit {unit} disconnected: {reason}")]
    Disconnected { unit: UnitId, reason: String },

    /// The program running inside the unit failed
    #[error("unit program failed: {0}")]
    Program(String),

    /// The worker thread could not be started
    #[error("failed to start worker: {0}")]
    Spawn(String),
}

impl UnitError {
    pub fn violation(unit: UnitId, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            unit,
            reason: reason.into(),
        }
    }
}

/// Lifecycle of a unit as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Bootstrapping and loading dependencies
    Starting,

    /// Ready signal received; dependency requests are now refused
    Ready,

    /// Program returned normally
    Exited,

    /// Terminated on request
    Terminated,

    /// Crashed, faulted or violated the protocol
    Failed(String),
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Exited | UnitStatus::Terminated | UnitStatus::Failed(_))
    }
}

// =============================================================================
// CHANNEL MESSAGES
// =============================================================================

/// Supervisor -> unit.
#[derive(Debug)]
pub(crate) enum UnitCommand {
    Dependency(ModuleSource),
    DependencyFailed { path: String, reason: String },
    Message(Inbound),
    Terminate,
}

/// Unit -> supervisor.
#[derive(Debug)]
pub(crate) enum UnitSignal {
    RequireDependency { unit: UnitId, path: String },
    Ready { unit: UnitId },
    Message(Outbound),
    Exited(UnitExit),
}

/// How the program inside a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitExit {
    Clean,
    Terminated,
    Failed(String),
}

// =============================================================================
// PROGRAM SIDE
// =============================================================================

/// The entry point executed inside a unit.
///
/// Implementations load what they need through `boot`, call
/// [`UnitBootstrap::ready`], then serve inbound messages from the returned
/// [`UnitScope`] until they decide to exit.
#[async_trait]
pub trait UnitProgram: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn run(&self, boot: UnitBootstrap) -> Result<(), UnitError>;
}

type PendingReplies = Arc<Mutex<HashMap<String, VecDeque<oneshot::Sender<Result<ModuleSource, EnvError>>>>>>;

/// Unit-side dependency request capability.
///
/// Cloneable so helper code can hold it, but every clone shares one
/// revocation flag: once the unit is ready, all of them refuse.
#[derive(Clone)]
pub struct DependencyCapability {
    unit: UnitId,
    signals: mpsc::UnboundedSender<UnitSignal>,
    pending: PendingReplies,
    revoked: Arc<AtomicBool>,
}

impl DependencyCapability {
    fn new(unit: UnitId, signals: mpsc::UnboundedSender<UnitSignal>) -> Self {
        Self {
            unit,
            signals,
            pending: Arc::new(Mutex::new(HashMap::new())),
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CodeLoader for DependencyCapability {
    async fn load(&self, path: &str) -> Result<ModuleSource, EnvError> {
        if self.is_revoked() {
            return Err(EnvError::CapabilityRevoked(path.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(tx);

        self.signals
            .send(UnitSignal::RequireDependency {
                unit: self.unit,
                path: path.to_string(),
            })
            .map_err(|_| EnvError::closed("supervisor"))?;

        rx.await.map_err(|_| EnvError::closed("dependency reply"))?
    }
}

fn resolve_pending(pending: &PendingReplies, path: &str, reply: Result<ModuleSource, EnvError>) {
    let waiter = pending
        .lock()
        .unwrap()
        .get_mut(path)
        .and_then(|queue| queue.pop_front());
    match waiter {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => warn!(%path, "Unsolicited dependency reply ignored"),
    }
}

/// What a program sees before it signals ready.
pub struct UnitBootstrap {
    id: UnitId,
    capability: DependencyCapability,
    modules: Vec<ModuleSource>,
    inbox: Mailbox<Inbound>,
    signals: mpsc::UnboundedSender<UnitSignal>,
}

impl UnitBootstrap {
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Modules loaded so far, in load order.
    pub fn modules(&self) -> &[ModuleSource] {
        &self.modules
    }

    /// A clone of the request capability (revoked together with this one).
    pub fn capability(&self) -> DependencyCapability {
        self.capability.clone()
    }

    /// Requests a dependency and records it in [`modules`](Self::modules).
    pub async fn require(&mut self, path: &str) -> Result<&ModuleSource, UnitError> {
        let module = self.capability.load(path).await?;
        debug!(unit = %self.id, %path, bytes = module.size(), "Dependency loaded");
        self.modules.push(module);
        Ok(&self.modules[self.modules.len() - 1])
    }

    /// Revokes the request capability and signals ready.
    pub fn ready(self) -> UnitScope {
        self.capability.revoke();
        let _ = self.signals.send(UnitSignal::Ready { unit: self.id });
        UnitScope {
            id: self.id,
            modules: self.modules,
            inbox: self.inbox,
            signals: self.signals,
        }
    }
}

/// What a program sees after it signalled ready.
pub struct UnitScope {
    id: UnitId,
    modules: Vec<ModuleSource>,
    inbox: Mailbox<Inbound>,
    signals: mpsc::UnboundedSender<UnitSignal>,
}

impl UnitScope {
    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn modules(&self) -> &[ModuleSource] {
        &self.modules
    }

    /// Attaches an inbound listener. The first one receives everything the
    /// supervisor posted before it attached.
    pub fn add_listener(&self) -> Subscription<Inbound> {
        self.inbox.add_listener()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inbox.remove_listener(id)
    }

    /// Sends a message to the supervisor's listeners.
    pub fn post(&self, msg: Outbound) -> Result<(), UnitError> {
        self.signals
            .send(UnitSignal::Message(msg))
            .map_err(|_| UnitError::Env(EnvError::closed("supervisor")))
    }

    /// Sends a raw dependency request, bypassing the revoked capability.
    #[cfg(test)]
    pub(crate) fn forge_dependency_request(&self, path: &str) {
        let _ = self.signals.send(UnitSignal::RequireDependency {
            unit: self.id,
            path: path.to_string(),
        });
    }
}

// =============================================================================
// WORKER THREAD
// =============================================================================

/// One unit lifetime's worth of work for a worker thread.
pub(crate) struct UnitJob {
    id: UnitId,
    program: Arc<dyn UnitProgram>,
    initial_dependencies: Vec<String>,
    commands: mpsc::UnboundedReceiver<UnitCommand>,
    signals: mpsc::UnboundedSender<UnitSignal>,
}

/// A worker thread that hosts one unit at a time.
///
/// Dropping the handle closes the job queue and lets the thread exit.
pub(crate) struct Worker {
    name: String,
    jobs: std_mpsc::Sender<UnitJob>,
}

impl Worker {
    pub(crate) fn spawn(name: String) -> Result<Self, UnitError> {
        let (jobs, queue) = std_mpsc::channel::<UnitJob>();
        let thread_name = name.clone();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker = %thread_name, "Failed to build unit runtime: {e}");
                        return;
                    }
                };
                while let Ok(job) = queue.recv() {
                    runtime.block_on(host_unit(job));
                }
                debug!(worker = %thread_name, "Worker shut down");
            })
            .map_err(|e| UnitError::Spawn(e.to_string()))?;
        Ok(Self { name, jobs })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: UnitJob) -> Result<(), UnitError> {
        self.jobs
            .send(job)
            .map_err(|_| UnitError::Spawn(format!("worker {} is gone", self.name)))
    }
}

/// Runs one unit lifetime on the current worker runtime.
async fn host_unit(job: UnitJob) {
    let UnitJob {
        id,
        program,
        initial_dependencies,
        mut commands,
        signals,
    } = job;

    let inbox: Mailbox<Inbound> = Mailbox::new();
    let capability = DependencyCapability::new(id, signals.clone());

    let router_inbox = inbox.clone();
    let pending = Arc::clone(&capability.pending);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let router = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                UnitCommand::Dependency(source) => {
                    let path = source.path.clone();
                    resolve_pending(&pending, &path, Ok(source));
                }
                UnitCommand::DependencyFailed { path, reason } => {
                    let err = EnvError::LoadFailed {
                        path: path.clone(),
                        reason,
                    };
                    resolve_pending(&pending, &path, Err(err));
                }
                UnitCommand::Message(msg) => {
                    router_inbox.deliver(msg);
                }
                UnitCommand::Terminate => break,
            }
        }
        router_inbox.close();
        let _ = stop_tx.send(());
    });

    let boot = UnitBootstrap {
        id,
        capability,
        modules: Vec::new(),
        inbox,
        signals: signals.clone(),
    };
    let program_task = tokio::spawn(async move {
        let mut boot = boot;
        for path in &initial_dependencies {
            boot.require(path).await?;
        }
        program.run(boot).await
    });
    let abort = program_task.abort_handle();

    let exit = tokio::select! {
        joined = program_task => match joined {
            Ok(Ok(())) => UnitExit::Clean,
            Ok(Err(e)) => UnitExit::Failed(e.to_string()),
            Err(e) if e.is_panic() => UnitExit::Failed(panic_message(e.into_panic())),
            Err(_) => UnitExit::Terminated,
        },
        _ = stop_rx => {
            abort.abort();
            UnitExit::Terminated
        }
    };

    router.abort();
    let _ = signals.send(UnitSignal::Exited(exit));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// =============================================================================
// SUPERVISOR SIDE
// =============================================================================

/// Supervisor-side handshake rules for one unit.
#[derive(Debug, Clone)]
pub struct Handshake {
    unit: UnitId,
    ready: bool,
    served: usize,
}

impl Handshake {
    pub fn new(unit: UnitId) -> Self {
        Self {
            unit,
            ready: false,
            served: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of dependency requests authorized so far.
    pub fn served(&self) -> usize {
        self.served
    }

    /// Checks a dependency request. Late or foreign requests are violations.
    pub fn authorize(&mut self, unit: UnitId, path: &str) -> Result<(), UnitError> {
        if unit != self.unit {
            return Err(UnitError::violation(
                self.unit,
                format!("dependency request for {path} carried foreign identity {unit}"),
            ));
        }
        if self.ready {
            return Err(UnitError::violation(
                self.unit,
                format!("dependency request for {path} after ready"),
            ));
        }
        self.served += 1;
        Ok(())
    }

    /// Records the ready signal. A repeated or foreign signal is a violation.
    pub fn mark_ready(&mut self, unit: UnitId) -> Result<(), UnitError> {
        if unit != self.unit || self.ready {
            return Err(UnitError::violation(self.unit, "unexpected ready signal"));
        }
        self.ready = true;
        Ok(())
    }
}

/// Supervisor handle to a running unit.
pub struct ExecutionUnit {
    id: UnitId,
    program: String,
    commands: mpsc::UnboundedSender<UnitCommand>,
    outbox: Mailbox<Outbound>,
    status: watch::Receiver<UnitStatus>,
    worker: Option<Worker>,
}

impl ExecutionUnit {
    /// Spawns a unit on a fresh worker thread.
    pub fn spawn<C: GauntletContext>(
        ctx: &C,
        loader: Arc<dyn CodeLoader>,
        program: Arc<dyn UnitProgram>,
        initial_dependencies: Vec<String>,
    ) -> Result<Self, UnitError> {
        let worker = Worker::spawn(format!("gauntlet-unit-{}", program.name()))?;
        Self::launch(ctx, worker, loader, program, initial_dependencies)
    }

    /// Starts a new unit lifetime on an existing worker.
    pub(crate) fn launch<C: GauntletContext>(
        ctx: &C,
        worker: Worker,
        loader: Arc<dyn CodeLoader>,
        program: Arc<dyn UnitProgram>,
        initial_dependencies: Vec<String>,
    ) -> Result<Self, UnitError> {
        let id = UnitId::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let name = program.name().to_string();

        worker.submit(UnitJob {
            id,
            program,
            initial_dependencies,
            commands: command_rx,
            signals: signal_tx,
        })?;

        let outbox = Mailbox::new();
        let (status_tx, status_rx) = watch::channel(UnitStatus::Starting);
        ctx.spawn(
            &format!("supervise-{id}"),
            supervise(id, signal_rx, command_tx.clone(), loader, outbox.clone(), status_tx),
        );

        debug!(unit = %id, program = %name, worker = %worker.name(), "Unit launched");
        Ok(Self {
            id,
            program: name,
            commands: command_tx,
            outbox,
            status: status_rx,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn status(&self) -> UnitStatus {
        self.status.borrow().clone()
    }

    /// Attaches a listener for outbound messages. The first listener also
    /// receives anything the unit sent before it attached.
    pub fn add_listener(&self) -> Subscription<Outbound> {
        self.outbox.add_listener()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.outbox.remove_listener(id)
    }

    /// Posts a message to the unit. Messages keep their send order.
    pub fn post_message(&self, msg: Inbound) -> Result<(), UnitError> {
        if self.status().is_terminal() {
            return Err(self.disconnected());
        }
        self.commands
            .send(UnitCommand::Message(msg))
            .map_err(|_| self.disconnected())
    }

    /// Hard-terminates the unit. Callers should post `TaskEnded` first.
    pub fn terminate(&self) {
        let _ = self.commands.send(UnitCommand::Terminate);
    }

    /// Waits until the unit signals ready.
    pub async fn wait_ready(&mut self) -> Result<(), UnitError> {
        let waited = self
            .status
            .wait_for(|s| *s == UnitStatus::Ready || s.is_terminal())
            .await
            .map(|s| s.clone());
        let status = waited.map_err(|_| self.disconnected())?;
        match status {
            UnitStatus::Ready => Ok(()),
            UnitStatus::Failed(reason) => Err(UnitError::Disconnected {
                unit: self.id,
                reason,
            }),
            _ => Err(self.disconnected()),
        }
    }

    /// Waits until the unit has exited for any reason.
    pub async fn wait_exit(&mut self) -> UnitStatus {
        let waited = self
            .status
            .wait_for(UnitStatus::is_terminal)
            .await
            .map(|s| s.clone());
        waited.unwrap_or_else(|_| self.status())
    }

    pub(crate) fn take_worker(&mut self) -> Option<Worker> {
        self.worker.take()
    }

    fn disconnected(&self) -> UnitError {
        let reason = match self.status() {
            UnitStatus::Failed(reason) => reason,
            other => format!("{other:?}"),
        };
        UnitError::Disconnected {
            unit: self.id,
            reason,
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        // Harmless when the program already exited; stops a leaked unit otherwise.
        let _ = self.commands.send(UnitCommand::Terminate);
    }
}

/// Supervises one unit lifetime: serves the handshake, forwards outbound
/// messages, and turns abnormal exits into a synthetic `Disconnected`.
async fn supervise(
    id: UnitId,
    mut signals: mpsc::UnboundedReceiver<UnitSignal>,
    commands: mpsc::UnboundedSender<UnitCommand>,
    loader: Arc<dyn CodeLoader>,
    outbox: Mailbox<Outbound>,
    status: watch::Sender<UnitStatus>,
) {
    let mut handshake = Handshake::new(id);
    let mut failed = false;

    let fail = |reason: String| {
        outbox.deliver(Outbound::Disconnected {
            reason: reason.clone(),
        });
        status.send_replace(UnitStatus::Failed(reason));
    };

    while let Some(signal) = signals.recv().await {
        match signal {
            UnitSignal::RequireDependency { unit, path } => {
                if failed {
                    continue;
                }
                if let Err(violation) = handshake.authorize(unit, &path) {
                    error!(unit = %id, %path, "{violation}");
                    let _ = commands.send(UnitCommand::Terminate);
                    failed = true;
                    fail(violation.to_string());
                    continue;
                }
                let reply = match loader.load(&path).await {
                    Ok(source) => UnitCommand::Dependency(source),
                    Err(e) => {
                        warn!(unit = %id, %path, "Dependency unavailable: {e}");
                        UnitCommand::DependencyFailed {
                            path,
                            reason: e.to_string(),
                        }
                    }
                };
                let _ = commands.send(reply);
            }
            UnitSignal::Ready { unit } => {
                if failed {
                    continue;
                }
                match handshake.mark_ready(unit) {
                    Ok(()) => {
                        debug!(unit = %id, dependencies = handshake.served(), "Unit ready");
                        status.send_replace(UnitStatus::Ready);
                    }
                    Err(violation) => {
                        error!(unit = %id, "{violation}");
                        let _ = commands.send(UnitCommand::Terminate);
                        failed = true;
                        fail(violation.to_string());
                    }
                }
            }
            UnitSignal::Message(msg) => {
                if !failed {
                    outbox.deliver(msg);
                }
            }
            UnitSignal::Exited(exit) => {
                if !failed {
                    match exit {
                        UnitExit::Clean => {
                            status.send_replace(UnitStatus::Exited);
                        }
                        UnitExit::Terminated => {
                            status.send_replace(UnitStatus::Terminated);
                        }
                        UnitExit::Failed(reason) => {
                            error!(unit = %id, "Unit crashed: {reason}");
                            fail(reason);
                        }
                    }
                }
                break;
            }
        }
    }

    if !status.borrow().is_terminal() {
        // Signal channel closed without an exit report: the worker died.
        fail("worker vanished".to_string());
    }
    outbox.close();
    info!(unit = %id, status = ?*status.borrow(), "Unit finished");
}
