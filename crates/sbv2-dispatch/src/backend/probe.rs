//! Backend probing
//!
//! A probe answers "can this backend run here?" by actually bringing its
//! runtime up, without ever letting a failure escape as a panic or a fatal
//! error. Every failure path ends in [`ProbeResult::Unavailable`].
//!
//! Native resources acquired during a probe are owned by a [`RuntimeGuard`]
//! whose `Drop` calls `shutdown()` exactly once. A probe that fails after
//! initialization, times out, or is cancelled therefore still tears down what
//! it acquired, even when the blocking worker finishes after the caller has
//! stopped waiting.

use super::plugin::{BackendRuntime, CapabilityContext, ExecutionMode};
use super::{BackendDescriptor, BackendInfo};
use crate::error::{DispatchError, DispatchResult, ProbeStage, UnavailableReason};
use crate::handle::BoundBackend;
use crate::types::ModelAssets;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Runtime guard
// ============================================================================

/// Owns an initialized runtime and shuts it down exactly once.
pub(crate) struct RuntimeGuard {
    backend: String,
    runtime: Box<dyn BackendRuntime>,
    shut_down: bool,
}

impl RuntimeGuard {
    fn new(backend: &str, runtime: Box<dyn BackendRuntime>) -> Self {
        Self {
            backend: backend.to_string(),
            runtime,
            shut_down: false,
        }
    }

    pub(crate) fn runtime(&self) -> &dyn BackendRuntime {
        self.runtime.as_ref()
    }

    pub(crate) fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        // Runs from Drop; a panic here must not escalate into an abort.
        let runtime = &mut self.runtime;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runtime.shutdown())) {
            tracing::error!(
                backend = %self.backend,
                panic = %panic_message(payload.as_ref()),
                "backend shutdown panicked"
            );
            return;
        }
        tracing::debug!(backend = %self.backend, "backend runtime shut down");
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Probe result
// ============================================================================

/// A backend whose runtime initialized and passed warm-up.
///
/// Dropping it without loading a model shuts the runtime down.
pub struct ProbedBackend {
    info: BackendInfo,
    runtime: RuntimeGuard,
}

impl ProbedBackend {
    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.runtime.runtime().execution_mode()
    }

    /// Load the model on this backend. On failure the runtime is torn down
    /// before the reason is returned.
    pub(crate) fn load_blocking(self, assets: &ModelAssets) -> Result<BoundBackend, UnavailableReason> {
        let runtime = self.runtime.runtime();
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| runtime.load_model(assets)));
        match loaded {
            Ok(Ok(model)) => Ok(BoundBackend::new(self.info, model, self.runtime)),
            Ok(Err(e)) => Err(UnavailableReason::new(&self.info.name, ProbeStage::Load, e.to_string())),
            Err(payload) => Err(UnavailableReason::new(
                &self.info.name,
                ProbeStage::Panic,
                format!("load_model panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

impl std::fmt::Debug for ProbedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbedBackend").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Outcome of one probe attempt
#[derive(Debug)]
pub enum ProbeResult {
    Available(ProbedBackend),
    Unavailable(UnavailableReason),
}

impl ProbeResult {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeResult::Available(_))
    }
}

// ============================================================================
// Probe
// ============================================================================

/// Runs capability checks and initialization for one descriptor at a time.
#[derive(Debug, Clone)]
pub struct BackendProbe {
    timeout: Duration,
}

impl BackendProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe on the current thread. Blocking; never panics.
    pub fn probe_blocking(descriptor: &BackendDescriptor, ctx: &CapabilityContext) -> ProbeResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| bring_up(descriptor, ctx)));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err((ProbeStage::Panic, panic_message(payload.as_ref()))),
        };
        match result {
            Ok(runtime) => ProbeResult::Available(ProbedBackend {
                info: BackendInfo::from(descriptor),
                runtime,
            }),
            Err((stage, message)) => {
                ProbeResult::Unavailable(UnavailableReason::new(descriptor.name(), stage, message))
            }
        }
    }

    /// Probe on the blocking pool with this probe's deadline.
    ///
    /// Returns `Err(Cancelled)` only when `cancel` fires; every backend
    /// failure, including a timeout, is an `Ok(Unavailable)`.
    pub async fn probe(
        &self,
        descriptor: &BackendDescriptor,
        ctx: CapabilityContext,
        cancel: &CancellationToken,
    ) -> DispatchResult<ProbeResult> {
        let owned = descriptor.clone();
        let name = descriptor.name().to_string();
        let started = Instant::now();

        let outcome = run_on_worker(
            move || Self::probe_blocking(&owned, &ctx),
            self.timeout,
            cancel,
        )
        .await;

        let result = match outcome {
            WorkerOutcome::Done(result) => result,
            WorkerOutcome::TimedOut => ProbeResult::Unavailable(UnavailableReason::new(
                &name,
                ProbeStage::Timeout,
                format!("no response within {} ms", self.timeout.as_millis()),
            )),
            WorkerOutcome::Lost => ProbeResult::Unavailable(UnavailableReason::new(
                &name,
                ProbeStage::Panic,
                "probe worker terminated unexpectedly",
            )),
            WorkerOutcome::Cancelled => {
                tracing::info!(backend = %name, "probe cancelled");
                return Err(DispatchError::Cancelled);
            }
        };

        match &result {
            ProbeResult::Available(_) => tracing::info!(
                backend = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "backend available"
            ),
            ProbeResult::Unavailable(reason) => tracing::warn!(
                backend = %name,
                stage = %reason.stage,
                reason = %reason.message,
                "backend unavailable"
            ),
        }
        Ok(result)
    }
}

/// capability check → initialize → warm-up.
///
/// The guard is created before warm-up so that a failing or panicking
/// warm-up still shuts the runtime down.
fn bring_up(
    descriptor: &BackendDescriptor,
    ctx: &CapabilityContext,
) -> Result<RuntimeGuard, (ProbeStage, String)> {
    descriptor
        .capability_check(ctx)
        .map_err(|e| (ProbeStage::Capability, e.to_string()))?;

    let runtime = descriptor
        .plugin()
        .initialize(ctx)
        .map_err(|e| (ProbeStage::Initialize, e.to_string()))?;
    let guard = RuntimeGuard::new(descriptor.name(), runtime);

    guard
        .runtime()
        .warm_up()
        .map_err(|e| (ProbeStage::WarmUp, e.to_string()))?;

    Ok(guard)
}

// ============================================================================
// Blocking worker with deadline and cancellation
// ============================================================================

pub(crate) enum WorkerOutcome<T> {
    Done(T),
    TimedOut,
    Cancelled,
    /// The worker died without reporting (panic outside the contained section)
    Lost,
}

/// Run `work` on tokio's blocking pool and wait for it, bounded by `timeout`
/// and `cancel`.
///
/// If the caller stops waiting, the worker's result is dropped wherever it
/// ends up, so `T`'s `Drop` is the teardown path.
pub(crate) async fn run_on_worker<T, F>(
    work: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> WorkerOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let output = work();
        if let Err(abandoned) = tx.send(output) {
            tracing::debug!("caller stopped waiting; releasing worker result");
            drop(abandoned);
        }
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => WorkerOutcome::Cancelled,
        waited = tokio::time::timeout(timeout, rx) => match waited {
            Ok(Ok(output)) => WorkerOutcome::Done(output),
            Ok(Err(_)) => WorkerOutcome::Lost,
            Err(_) => WorkerOutcome::TimedOut,
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
