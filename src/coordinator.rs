//! Compilation coordinator.
//!
//! The coordinator owns one isolate boundary and admits at most one compile
//! request at a time. Every accepted request takes the next generation; a
//! newer request supersedes the pending one, and [`Coordinator::cancel`]
//! discards it. Discarding never stops the work already running in the
//! isolate: its late events carry a stale generation and are dropped.
//!
//! # States
//!
//! ```text
//!                 initialize()          compile()
//!  Uninitialized ─────────────▶ Idle ◀──────────▶ Compiling
//!                                ▲   result/cancel    │
//!                  initialize()  │                    │ fault
//!                                └──── Faulted ◀──────┘
//! ```
//!
//! The watchdog deadline runs from the moment the isolate reports it started
//! a request, so time spent queued behind superseded work is not charged to
//! the newer request. A superseded request that hangs still faults the
//! boundary.
//!
//! A fault (isolate crash, broken channel, watchdog deadline) can happen in
//! any initialized state and settles the pending request with
//! [`CompileError::IsolateFault`]. Only re-provisioning via
//! [`Coordinator::initialize`] leaves `Faulted`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::config::CoordinatorConfig;
use crate::decoder::OutputFormat;
use crate::error::{CompileError, CoordinatorError, Result};
use crate::image::{ImageInfo, ImageLoader, ImageSource};
use crate::isolate::protocol::{FailureKind, HostMessage, IsolateMessage};
use crate::isolate::{Boundary, EventReceiver, IsolateLauncher};
use crate::result::{CompilationResult, collect_diagnostics};
use crate::sandbox::StreamKind;

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Uninitialized,
    Idle,
    Compiling,
    Faulted,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Idle => write!(f, "idle"),
            Self::Compiling => write!(f, "compiling"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

type Settle = oneshot::Sender<std::result::Result<CompilationResult, CompileError>>;

/// The single in-flight request.
struct PendingSlot {
    generation: u64,
    format: OutputFormat,
    accepted: Instant,
    settle: Settle,
}

/// Deadline timer of the request the isolate is running, which may
/// already have been discarded on the host.
struct Watchdog {
    id: u64,
    timer: AbortHandle,
}

/// The live boundary. `epoch` tells its events apart from those of a
/// boundary that has already been torn down.
struct ActiveBoundary {
    epoch: u64,
    boundary: Boundary,
    runtime: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Faulted,
}

struct Inner {
    phase: Phase,
    generation: u64,
    pending: Option<PendingSlot>,
    boundary: Option<ActiveBoundary>,
    watchdog: Option<Watchdog>,
    next_epoch: u64,
    info_lines: Vec<String>,
    error_lines: Vec<String>,
    last_fault: Option<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            generation: 0,
            pending: None,
            boundary: None,
            watchdog: None,
            next_epoch: 0,
            info_lines: Vec::new(),
            error_lines: Vec::new(),
            last_fault: None,
        }
    }

    fn state(&self) -> CoordinatorState {
        match self.phase {
            Phase::Uninitialized => CoordinatorState::Uninitialized,
            Phase::Faulted => CoordinatorState::Faulted,
            Phase::Ready if self.pending.is_some() => CoordinatorState::Compiling,
            Phase::Ready => CoordinatorState::Idle,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.boundary.as_ref().is_some_and(|b| b.epoch == epoch)
    }

    fn disarm(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.timer.abort();
        }
    }

    /// Tear the boundary down and settle the pending request.
    fn fault(&mut self, reason: String) {
        tracing::warn!(
            generation = self.generation,
            pending = self.pending.is_some(),
            reason = %reason,
            "Isolate boundary faulted"
        );
        self.disarm();
        if let Some(active) = self.boundary.take() {
            active.boundary.kill();
        }
        if let Some(slot) = self.pending.take() {
            let _ = slot.settle.send(Err(CompileError::IsolateFault(reason.clone())));
        }
        self.phase = Phase::Faulted;
        self.last_fault = Some(reason);
    }

    /// Build the outcome of the pending request from its terminal event.
    fn assemble(
        &mut self,
        slot: &PendingSlot,
        success: bool,
        output: Option<Vec<u8>>,
        error: Option<String>,
        failure: Option<FailureKind>,
        elapsed: Duration,
    ) -> std::result::Result<CompilationResult, CompileError> {
        let info_lines = std::mem::take(&mut self.info_lines);
        let error_lines = std::mem::take(&mut self.error_lines);

        if failure == Some(FailureKind::Provision) {
            return Err(CompileError::IsolateFault(
                error.unwrap_or_else(|| "sandbox provisioning failed".to_string()),
            ));
        }

        let mut result = CompilationResult {
            generation: slot.generation,
            success,
            output,
            format: slot.format,
            diagnostics: Vec::new(),
            info_lines,
            error_lines,
            elapsed,
        };

        if !success {
            result.diagnostics = collect_diagnostics(&result.error_lines, error.as_deref(), false);
            return Err(CompileError::CompileFailed(Box::new(result)));
        }

        if result.output.is_none() {
            result.success = false;
            result.diagnostics = collect_diagnostics(
                &result.error_lines,
                Some("compiler reported success but wrote no output"),
                false,
            );
            return Err(CompileError::NoOutputProduced(Box::new(result)));
        }

        result.diagnostics = collect_diagnostics(&result.error_lines, None, true);
        Ok(result)
    }
}

struct Shared {
    loader: ImageLoader,
    launcher: Arc<dyn IsolateLauncher>,
    config: CoordinatorConfig,
    /// Serializes initialization; never taken by compile/cancel.
    init: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one event. Returns `false` once `epoch` is no longer live.
    fn on_message(self: &Arc<Self>, epoch: u64, message: IsolateMessage) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(epoch) {
            return false;
        }

        match message {
            IsolateMessage::Ready => {
                tracing::debug!(epoch, "Ignoring repeated ready");
            }
            IsolateMessage::Error { error } => {
                inner.fault(error);
                return false;
            }
            IsolateMessage::Started { id } => {
                inner.disarm();
                if let Some(deadline) = self.config.compile_deadline
                    && let Some(active) = &inner.boundary
                {
                    let shared = Arc::downgrade(self);
                    let timer = active.runtime.spawn(async move {
                        tokio::time::sleep(deadline).await;
                        if let Some(shared) = shared.upgrade() {
                            shared.on_deadline(epoch, id, deadline);
                        }
                    });
                    inner.watchdog = Some(Watchdog {
                        id,
                        timer: timer.abort_handle(),
                    });
                }
            }
            IsolateMessage::Stream { id, channel, text } => {
                if id != inner.generation {
                    tracing::debug!(id, generation = inner.generation, "Discarding stale output line");
                } else {
                    match channel {
                        StreamKind::Info => inner.info_lines.push(text),
                        StreamKind::Error => inner.error_lines.push(text),
                    }
                }
            }
            IsolateMessage::Result {
                id,
                success,
                output,
                error,
                failure,
                elapsed_millis,
            } => {
                if inner.watchdog.as_ref().is_some_and(|w| w.id == id) {
                    inner.disarm();
                }
                let slot = match inner.pending.take() {
                    Some(slot) if slot.generation == id && id == inner.generation => slot,
                    other => {
                        inner.pending = other;
                        tracing::debug!(id, generation = inner.generation, "Discarding stale result");
                        return true;
                    }
                };
                tracing::debug!(
                    generation = id,
                    success,
                    isolate_millis = elapsed_millis,
                    host_millis = slot.accepted.elapsed().as_millis() as u64,
                    "Request finished"
                );
                let elapsed = Duration::from_millis(elapsed_millis);
                let outcome = inner.assemble(&slot, success, output, error, failure, elapsed);
                let _ = slot.settle.send(outcome);
            }
        }
        true
    }

    fn on_closed(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.is_current(epoch) {
            inner.fault("Isolate closed its event channel".to_string());
        }
    }

    fn on_deadline(&self, epoch: u64, id: u64, deadline: Duration) {
        let mut inner = self.lock();
        let still_running = inner.watchdog.as_ref().is_some_and(|w| w.id == id);
        if still_running && inner.is_current(epoch) {
            inner.fault(format!(
                "Request {} exceeded the compile deadline of {}s",
                id,
                deadline.as_secs_f64()
            ));
        }
    }
}

/// Deliver a boundary's events to the coordinator in arrival order.
async fn pump(shared: Weak<Shared>, epoch: u64, mut events: EventReceiver) {
    while let Some(message) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.on_message(epoch, message) {
            return;
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.on_closed(epoch);
    }
}

/// A pending compile. Resolves exactly once.
#[must_use = "a ticket does nothing unless awaited"]
#[derive(Debug)]
pub struct CompileTicket {
    generation: u64,
    outcome: oneshot::Receiver<std::result::Result<CompilationResult, CompileError>>,
}

impl CompileTicket {
    /// Generation the request was accepted under.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Future for CompileTicket {
    type Output = std::result::Result<CompilationResult, CompileError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(CompileError::IsolateFault(
                    "coordinator dropped the request".to_string(),
                ))
            })
        })
    }
}

/// One compile session: a memoized image and the boundary serving it.
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn ImageSource>,
        launcher: Arc<dyn IsolateLauncher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                loader: ImageLoader::new(source),
                launcher,
                config,
                init: tokio::sync::Mutex::new(()),
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Load the image and bring up a ready boundary.
    ///
    /// Idempotent; concurrent callers share one initialization. From
    /// `Faulted` this launches a fresh boundary on the already loaded image.
    pub async fn initialize(&self) -> Result<()> {
        let _init = self.shared.init.lock().await;
        if self.shared.lock().phase == Phase::Ready {
            return Ok(());
        }

        let image = self.shared.loader.load().await?;
        let mut handle = self.shared.launcher.launch(&image)?;
        if let Err(e) = handle.wait_ready(self.shared.config.ready_timeout).await {
            let (boundary, _) = handle.into_parts();
            boundary.kill();
            tracing::warn!(error = %e, "Isolate failed to start");
            return Err(e);
        }
        let (boundary, events) = handle.into_parts();
        let runtime = Handle::current();

        let epoch = {
            let mut inner = self.shared.lock();
            inner.next_epoch += 1;
            let epoch = inner.next_epoch;
            inner.boundary = Some(ActiveBoundary {
                epoch,
                boundary,
                runtime: runtime.clone(),
            });
            inner.phase = Phase::Ready;
            epoch
        };
        runtime.spawn(pump(Arc::downgrade(&self.shared), epoch, events));

        let info = image.info();
        tracing::info!(
            epoch,
            digest = %info.digest,
            fonts = image.fonts().len(),
            "Coordinator ready"
        );
        Ok(())
    }

    /// Compile `source` in the default format.
    pub fn compile(&self, source: impl Into<String>) -> Result<CompileTicket> {
        self.submit(source.into(), self.shared.config.default_format)
    }

    /// Compile `source` in `format`. Shares the single pending slot with
    /// [`Coordinator::compile`].
    pub fn export_variant(
        &self,
        source: impl Into<String>,
        format: OutputFormat,
    ) -> Result<CompileTicket> {
        self.submit(source.into(), format)
    }

    fn submit(&self, source: String, format: OutputFormat) -> Result<CompileTicket> {
        let mut inner = self.shared.lock();
        if inner.phase != Phase::Ready || inner.boundary.is_none() {
            return Err(CoordinatorError::NotReady);
        }

        inner.generation += 1;
        let generation = inner.generation;

        if let Some(previous) = inner.pending.take() {
            tracing::debug!(
                superseded = previous.generation,
                generation,
                "Superseding pending request"
            );
            let _ = previous.settle.send(Err(CompileError::Superseded {
                generation: previous.generation,
            }));
        }
        inner.info_lines.clear();
        inner.error_lines.clear();

        let (settle, outcome) = oneshot::channel();
        inner.pending = Some(PendingSlot {
            generation,
            format,
            accepted: Instant::now(),
            settle,
        });

        let sent = inner
            .boundary
            .as_ref()
            .is_some_and(|active| active.boundary.send(HostMessage::compile(generation, source, format)));
        if sent {
            tracing::debug!(generation, format = %format, "Accepted compile request");
        } else {
            // Settles the slot just installed
            inner.fault("Isolate stopped accepting requests".to_string());
        }

        Ok(CompileTicket {
            generation,
            outcome,
        })
    }

    /// Discard the pending request, if any. Running isolate work continues.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        let Some(slot) = inner.pending.take() else {
            return;
        };
        inner.generation += 1;
        tracing::debug!(
            cancelled = slot.generation,
            generation = inner.generation,
            "Cancelled pending request"
        );
        let _ = slot.settle.send(Err(CompileError::Cancelled {
            generation: slot.generation,
        }));
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().phase == Phase::Ready
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.lock().state()
    }

    /// Current generation; 0 before the first request.
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Reason of the most recent fault.
    pub fn last_fault(&self) -> Option<String> {
        self.shared.lock().last_fault.clone()
    }

    /// The loaded image, once initialization has loaded it.
    pub fn image(&self) -> Option<ImageInfo> {
        self.shared.loader.get().map(|image| image.info())
    }

    /// Number of image fetches performed by this session.
    pub fn load_count(&self) -> usize {
        self.shared.loader.load_count()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Close the boundary and settle any pending request.
    ///
    /// The loaded image is kept; a later `initialize()` launches a new boundary.
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        inner.disarm();
        if let Some(active) = inner.boundary.take() {
            active.boundary.close();
        }
        if let Some(slot) = inner.pending.take() {
            let _ = slot.settle.send(Err(CompileError::IsolateFault(
                "coordinator shut down".to_string(),
            )));
        }
        if inner.phase != Phase::Uninitialized {
            tracing::info!(generation = inner.generation, "Coordinator shut down");
        }
        inner.phase = Phase::Uninitialized;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Coordinator")
            .field("state", &inner.state())
            .field("generation", &inner.generation)
            .field("loader", &self.shared.loader)
            .finish()
    }
}
