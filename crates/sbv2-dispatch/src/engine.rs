//! Dispatch engine
//!
//! Walks the registry in effective priority order, probes each candidate,
//! loads the model on the first one that comes up and hands back a
//! [`ModelHandle`] bound to it. Selection runs once per engine: the outcome,
//! success or aggregated failure, is cached and every later caller observes
//! the same value. Only a cancelled selection is retried.
//!
//! ```text
//!  select_and_load ──▶ candidates ──▶ probe ──▶ load ──▶ ModelHandle
//!                          ▲            │         │
//!                          └── next ◀───┴─────────┘  (recorded as UnavailableReason)
//! ```

use crate::backend::BackendDescriptor;
use crate::backend::plugin::CapabilityContext;
use crate::backend::probe::{BackendProbe, ProbeResult, ProbedBackend, WorkerOutcome, run_on_worker};
use crate::backend::registry::{BackendRegistry, global_registry};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult, ProbeStage, UnavailableReason};
use crate::handle::{BoundBackend, ModelHandle};
use crate::hardware::HostCapabilities;
use crate::types::{ModelAssets, ModelConfig};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Cached outcome of the first completed selection
struct Selection {
    model_id: String,
    outcome: DispatchResult<ModelHandle>,
}

/// Selects one backend per engine and binds a model to it.
///
/// Engines share nothing mutable. Two engines over the same registry and
/// host make the same choice; a failure in one never affects the other.
pub struct DispatchEngine {
    registry: Arc<BackendRegistry>,
    config: DispatchConfig,
    host: Arc<HostCapabilities>,
    probe: BackendProbe,
    selection: Mutex<Option<Selection>>,
    /// Written once, when selection succeeds
    active: OnceLock<ModelHandle>,
    probe_runs: AtomicUsize,
}

impl DispatchEngine {
    /// Engine over `registry`, using the detected host capabilities.
    ///
    /// # Blocking
    /// The first call in a process runs host detection, which may spawn
    /// `nvidia-smi`. From async code, call [`HostCapabilities::detect_cached`]
    /// inside `spawn_blocking` first, or use [`with_host`](Self::with_host).
    pub fn new(registry: Arc<BackendRegistry>, config: DispatchConfig) -> Self {
        Self::with_host(registry, config, HostCapabilities::detect_cached())
    }

    /// Engine with an explicit host snapshot.
    pub fn with_host(
        registry: Arc<BackendRegistry>,
        config: DispatchConfig,
        host: Arc<HostCapabilities>,
    ) -> Self {
        let probe = BackendProbe::new(config.probe_timeout());
        Self {
            registry,
            config,
            host,
            probe,
            selection: Mutex::new(None),
            active: OnceLock::new(),
            probe_runs: AtomicUsize::new(0),
        }
    }

    /// Engine over the process-wide registry.
    ///
    /// # Blocking
    /// Same as [`new`](Self::new).
    pub fn from_global(config: DispatchConfig) -> Self {
        Self::new(global_registry(), config)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &Arc<HostCapabilities> {
        &self.host
    }

    /// How many selection sequences this engine has started
    pub fn probe_runs(&self) -> usize {
        self.probe_runs.load(Ordering::SeqCst)
    }

    /// Handle from a successful selection, if any.
    ///
    /// Never waits on an in-progress selection.
    pub fn current_handle(&self) -> Option<ModelHandle> {
        self.active.get().cloned()
    }

    /// Name of the backend serving this engine, if one was selected.
    pub fn active_backend(&self) -> Option<String> {
        self.current_handle().map(|h| h.backend().name.clone())
    }

    /// Registered descriptors with `priority_overrides` applied.
    ///
    /// Stable: equal effective priorities keep registry order.
    pub fn candidate_order(&self) -> Vec<(&BackendDescriptor, i32)> {
        let mut ordered: Vec<(usize, &BackendDescriptor, i32)> = self
            .registry
            .candidates()
            .enumerate()
            .map(|(idx, d)| (idx, d, self.config.effective_priority(d.name(), d.priority())))
            .collect();
        ordered.sort_by_key(|(idx, _, priority)| (*priority, *idx));
        ordered.into_iter().map(|(_, d, p)| (d, p)).collect()
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Select a backend and load `model` on it.
    pub async fn select_and_load(&self, model: ModelConfig) -> DispatchResult<ModelHandle> {
        self.select_and_load_with_cancel(model, CancellationToken::new())
            .await
    }

    /// Like [`select_and_load`](Self::select_and_load), abandoning the
    /// selection when `cancel` fires.
    ///
    /// A cancelled selection is not cached; the next call starts over.
    /// Whatever the abandoned workers acquired is still shut down when they
    /// finish.
    ///
    /// # Errors
    /// - `NoBackendAvailable`: every candidate failed; one reason per candidate
    /// - `ModelMismatch`: this engine already selected for another model
    /// - `ModelSource`: model bytes could not be read
    /// - `Cancelled`: `cancel` fired before selection completed
    pub async fn select_and_load_with_cancel(
        &self,
        model: ModelConfig,
        cancel: CancellationToken,
    ) -> DispatchResult<ModelHandle> {
        let mut slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            guard = self.selection.lock() => guard,
        };

        if let Some(selection) = slot.as_ref() {
            if selection.model_id != model.model_id {
                return Err(DispatchError::ModelMismatch {
                    selected: selection.model_id.clone(),
                    requested: model.model_id,
                });
            }
            tracing::debug!(model = %model.model_id, "reusing cached selection");
            return selection.outcome.clone();
        }

        let model_id = model.model_id.clone();
        let outcome = self.run_selection(model, &cancel).await;
        match &outcome {
            Err(DispatchError::Cancelled) => return outcome,
            Ok(handle) => {
                let _ = self.active.set(handle.clone());
            }
            Err(_) => {}
        }
        *slot = Some(Selection {
            model_id,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run_selection(
        &self,
        model: ModelConfig,
        cancel: &CancellationToken,
    ) -> DispatchResult<ModelHandle> {
        self.probe_runs.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let model_id = model.model_id.clone();

        let assets = match run_on_worker(
            move || model.read_assets(),
            self.config.load_timeout(),
            cancel,
        )
        .await
        {
            WorkerOutcome::Done(assets) => Arc::new(assets?),
            WorkerOutcome::Cancelled => return Err(DispatchError::Cancelled),
            WorkerOutcome::TimedOut => {
                return Err(DispatchError::ModelSource(format!(
                    "reading model '{model_id}' took longer than {} ms",
                    self.config.load_timeout().as_millis()
                )));
            }
            WorkerOutcome::Lost => {
                return Err(DispatchError::ModelSource(format!(
                    "reading model '{model_id}' failed unexpectedly"
                )));
            }
        };

        let candidates = self.candidate_order();
        tracing::info!(
            model = %model_id,
            candidates = candidates.len(),
            "starting backend selection"
        );

        let mut reasons = Vec::with_capacity(candidates.len());
        for (descriptor, priority) in candidates {
            if let Some(why) = self.config.exclusion_reason(descriptor.name()) {
                tracing::debug!(backend = %descriptor.name(), reason = %why, "backend excluded");
                reasons.push(UnavailableReason::new(descriptor.name(), ProbeStage::Disabled, why));
                continue;
            }

            let probed = match self.probe.probe(descriptor, self.context(descriptor), cancel).await? {
                ProbeResult::Available(probed) => probed,
                ProbeResult::Unavailable(reason) => {
                    reasons.push(reason);
                    continue;
                }
            };

            match self.load(probed, &assets, cancel).await? {
                Ok(bound) => {
                    let handle = ModelHandle::new(&model_id, bound, reasons);
                    tracing::info!(
                        backend = %descriptor.name(),
                        priority,
                        model = %model_id,
                        skipped = handle.skipped_backends().len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "backend selected"
                    );
                    return Ok(handle);
                }
                Err(reason) => {
                    tracing::warn!(
                        backend = %descriptor.name(),
                        stage = %reason.stage,
                        reason = %reason.message,
                        "model load failed; trying next backend"
                    );
                    reasons.push(reason);
                }
            }
        }

        tracing::error!(
            model = %model_id,
            tried = reasons.len(),
            "no backend available"
        );
        Err(DispatchError::NoBackendAvailable { reasons })
    }

    /// Load on the blocking pool. The outer `Err` is cancellation only.
    async fn load(
        &self,
        probed: ProbedBackend,
        assets: &Arc<ModelAssets>,
        cancel: &CancellationToken,
    ) -> DispatchResult<Result<BoundBackend, UnavailableReason>> {
        let name = probed.info().name.clone();
        let assets = assets.clone();
        let timeout = self.config.load_timeout();

        match run_on_worker(move || probed.load_blocking(&assets), timeout, cancel).await {
            WorkerOutcome::Done(result) => Ok(result),
            WorkerOutcome::Cancelled => {
                tracing::info!(backend = %name, "model load cancelled");
                Err(DispatchError::Cancelled)
            }
            WorkerOutcome::TimedOut => Ok(Err(UnavailableReason::new(
                name,
                ProbeStage::Timeout,
                format!("model load did not finish within {} ms", timeout.as_millis()),
            ))),
            WorkerOutcome::Lost => Ok(Err(UnavailableReason::new(
                name,
                ProbeStage::Panic,
                "load worker terminated unexpectedly",
            ))),
        }
    }

    fn context(&self, descriptor: &BackendDescriptor) -> CapabilityContext {
        CapabilityContext {
            backend: descriptor.name().to_string(),
            host: self.host.clone(),
            device_id: self.config.device_id,
            num_threads: self.config.num_threads,
        }
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("backends", &self.registry.names())
            .field("config", &self.config)
            .field("probe_runs", &self.probe_runs())
            .finish_non_exhaustive()
    }
}
