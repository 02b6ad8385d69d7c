//! Model handles
//!
//! A [`ModelHandle`] is the only way to reach a loaded model once selection
//! is over. It is permanently bound to the backend that loaded the model;
//! clones share the same binding and `release()` on any clone releases it for
//! all of them.

use crate::backend::BackendInfo;
use crate::backend::plugin::{ExecutionMode, LoadedModel};
use crate::backend::probe::{RuntimeGuard, panic_message};
use crate::error::{DispatchError, DispatchResult, RuntimeError, UnavailableReason};
use crate::types::{ModelSource, SynthesisOutput, SynthesisRequest, VoiceFormat};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// A loaded model together with the runtime that owns it.
pub(crate) struct BoundBackend {
    info: BackendInfo,
    mode: ExecutionMode,
    // Declaration order is drop order: the model goes before its runtime shuts down.
    model: Box<dyn LoadedModel>,
    _runtime: RuntimeGuard,
}

impl BoundBackend {
    pub(crate) fn new(info: BackendInfo, model: Box<dyn LoadedModel>, runtime: RuntimeGuard) -> Self {
        let mode = runtime.runtime().execution_mode();
        Self {
            info,
            mode,
            model,
            _runtime: runtime,
        }
    }
}

impl std::fmt::Debug for BoundBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundBackend")
            .field("info", &self.info)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

struct HandleInner {
    info: BackendInfo,
    model_id: String,
    mode: ExecutionMode,
    skipped: Vec<UnavailableReason>,
    bound: RwLock<Option<BoundBackend>>,
    // Held around calls into runtimes with a single submission queue
    submission: Mutex<()>,
}

/// Live handle to a model bound to exactly one backend.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

impl ModelHandle {
    pub(crate) fn new(
        model_id: impl Into<String>,
        bound: BoundBackend,
        skipped: Vec<UnavailableReason>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                info: bound.info.clone(),
                model_id: model_id.into(),
                mode: bound.mode,
                skipped,
                bound: RwLock::new(Some(bound)),
                submission: Mutex::new(()),
            }),
        }
    }

    /// The backend serving this handle
    pub fn backend(&self) -> &BackendInfo {
        &self.inner.info
    }

    pub fn model_id(&self) -> &str {
        &self.inner.model_id
    }

    /// Candidates tried before this backend and why each was passed over
    pub fn skipped_backends(&self) -> &[UnavailableReason] {
        &self.inner.skipped
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    pub fn is_released(&self) -> bool {
        self.inner.bound.read().is_none()
    }

    /// Whether both handles refer to the same bound backend instance
    pub fn same_instance(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------------
    // Inference
    // ------------------------------------------------------------------------

    /// Synthesize on the current thread. Blocking.
    pub fn infer_blocking(&self, request: &SynthesisRequest) -> DispatchResult<SynthesisOutput> {
        if self.is_released() {
            return Err(self.released());
        }
        request.validate()?;

        let started = Instant::now();
        let audio = self.with_model("infer", |model| model.infer(request))?;
        let elapsed = started.elapsed();

        tracing::debug!(
            backend = %self.inner.info.name,
            ident = %request.ident,
            text_len = request.text.len(),
            audio_bytes = audio.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "synthesis complete"
        );

        Ok(SynthesisOutput {
            audio,
            backend: self.inner.info.name.clone(),
            elapsed,
        })
    }

    /// Synthesize on tokio's blocking pool.
    pub async fn infer(&self, request: SynthesisRequest) -> DispatchResult<SynthesisOutput> {
        if self.is_released() {
            return Err(self.released());
        }
        let handle = self.clone();
        self.join(tokio::task::spawn_blocking(move || handle.infer_blocking(&request)))
            .await
    }

    // ------------------------------------------------------------------------
    // Voices
    // ------------------------------------------------------------------------

    /// Register a voice package under `ident`. Blocking.
    pub fn load_voice_blocking(
        &self,
        ident: &str,
        voice: &ModelSource,
        format: VoiceFormat,
    ) -> DispatchResult<()> {
        if self.is_released() {
            return Err(self.released());
        }
        if ident.is_empty() {
            return Err(DispatchError::InvalidRequest("voice ident must not be empty".into()));
        }
        let bytes = voice.read()?;
        self.with_model("load_voice", |model| model.load_voice(ident, &bytes, format))?;
        tracing::info!(
            backend = %self.inner.info.name,
            ident = %ident,
            voice_format = ?format,
            bytes = bytes.len(),
            "voice loaded"
        );
        Ok(())
    }

    /// Register a voice package on tokio's blocking pool.
    pub async fn load_voice(
        &self,
        ident: impl Into<String>,
        voice: ModelSource,
        format: VoiceFormat,
    ) -> DispatchResult<()> {
        if self.is_released() {
            return Err(self.released());
        }
        let handle = self.clone();
        let ident = ident.into();
        self.join(tokio::task::spawn_blocking(move || {
            handle.load_voice_blocking(&ident, &voice, format)
        }))
        .await
    }

    /// Drop the voice registered under `ident`; `Ok(false)` if there was none.
    pub fn unload_voice(&self, ident: &str) -> DispatchResult<bool> {
        self.with_model("unload_voice", |model| Ok(model.unload_voice(ident)))
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    /// Drop the model and shut the backend runtime down.
    ///
    /// Waits for in-flight calls on this handle to finish. Idempotent: later
    /// calls are no-ops, and the runtime is shut down exactly once.
    pub fn release(&self) {
        let taken = self.inner.bound.write().take();
        match taken {
            Some(bound) => {
                drop(bound);
                tracing::info!(
                    backend = %self.inner.info.name,
                    model = %self.inner.model_id,
                    "model handle released"
                );
            }
            None => tracing::debug!(
                backend = %self.inner.info.name,
                "model handle already released"
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn released(&self) -> DispatchError {
        DispatchError::HandleReleased {
            backend: self.inner.info.name.clone(),
        }
    }

    fn runtime_failure(&self, source: RuntimeError) -> DispatchError {
        DispatchError::BackendRuntimeFailure {
            backend: self.inner.info.name.clone(),
            source,
        }
    }

    /// Run `f` against the bound model, honoring the runtime's execution
    /// mode and containing panics.
    fn with_model<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&dyn LoadedModel) -> Result<T, RuntimeError>,
    ) -> DispatchResult<T> {
        let guard = self.inner.bound.read();
        let Some(bound) = guard.as_ref() else {
            return Err(self.released());
        };

        let _serial = match self.inner.mode {
            ExecutionMode::Serialized => Some(self.inner.submission.lock()),
            ExecutionMode::Concurrent => None,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| f(bound.model.as_ref()))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => {
                tracing::warn!(
                    backend = %self.inner.info.name,
                    op,
                    error = %source,
                    "backend call failed"
                );
                Err(self.runtime_failure(source))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    backend = %self.inner.info.name,
                    op,
                    panic = %message,
                    "backend panicked"
                );
                Err(self.runtime_failure(RuntimeError::Panicked(message)))
            }
        }
    }

    async fn join<T>(&self, task: tokio::task::JoinHandle<DispatchResult<T>>) -> DispatchResult<T> {
        match task.await {
            Ok(result) => result,
            Err(e) => Err(self.runtime_failure(RuntimeError::Panicked(e.to_string()))),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("backend", &self.inner.info.name)
            .field("model_id", &self.inner.model_id)
            .field("mode", &self.inner.mode)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendDescriptor;
    use crate::backend::plugin::{BackendPlugin, BackendRuntime, CapabilityContext};
    use crate::backend::probe::{BackendProbe, ProbeResult};
    use crate::error::{InitError, LoadError};
    use crate::hardware::HostCapabilities;
    use crate::types::ModelAssets;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        infers: AtomicUsize,
        shutdowns: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct Plugin {
        mode: ExecutionMode,
        counters: Arc<Counters>,
    }

    struct Runtime {
        mode: ExecutionMode,
        counters: Arc<Counters>,
    }

    struct Model {
        counters: Arc<Counters>,
        voices: parking_lot::Mutex<HashSet<String>>,
    }

    impl BackendPlugin for Plugin {
        fn initialize(&self, _ctx: &CapabilityContext) -> Result<Box<dyn BackendRuntime>, InitError> {
            Ok(Box::new(Runtime {
                mode: self.mode,
                counters: self.counters.clone(),
            }))
        }
    }

    impl BackendRuntime for Runtime {
        fn execution_mode(&self) -> ExecutionMode {
            self.mode
        }

        fn load_model(&self, _assets: &ModelAssets) -> Result<Box<dyn LoadedModel>, LoadError> {
            Ok(Box::new(Model {
                counters: self.counters.clone(),
                voices: parking_lot::Mutex::new(HashSet::new()),
            }))
        }

        fn shutdown(&mut self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl LoadedModel for Model {
        fn infer(&self, request: &SynthesisRequest) -> Result<Vec<u8>, RuntimeError> {
            self.counters.infers.fetch_add(1, Ordering::SeqCst);
            let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

            match request.text.as_str() {
                "panic" => panic!("kernel fault"),
                "bad" => Err(RuntimeError::InvalidInput("unsupported phoneme".into())),
                _ if !self.voices.lock().contains(&request.ident) => {
                    Err(RuntimeError::InvalidInput(format!("unknown voice {}", request.ident)))
                }
                text => Ok(text.as_bytes().to_vec()),
            }
        }

        fn load_voice(&self, ident: &str, _voice: &[u8], _format: VoiceFormat) -> Result<(), RuntimeError> {
            self.voices.lock().insert(ident.to_string());
            Ok(())
        }

        fn unload_voice(&self, ident: &str) -> bool {
            self.voices.lock().remove(ident)
        }
    }

    fn handle(mode: ExecutionMode) -> (ModelHandle, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let descriptor = BackendDescriptor::new(
            "cpu",
            3,
            Arc::new(Plugin {
                mode,
                counters: counters.clone(),
            }),
        );
        let ctx = CapabilityContext {
            backend: "cpu".into(),
            host: Arc::new(HostCapabilities::cpu_only()),
            device_id: 0,
            num_threads: None,
        };
        let ProbeResult::Available(probed) = BackendProbe::probe_blocking(&descriptor, &ctx) else {
            panic!("expected available");
        };
        let assets = ModelAssets {
            model_id: "jvnv".into(),
            bert_model: Arc::from(b"bert".to_vec()),
            tokenizer: Arc::from(b"tok".to_vec()),
            max_loaded_models: None,
        };
        let bound = probed.load_blocking(&assets).unwrap();
        let handle = ModelHandle::new("jvnv", bound, vec![]);
        handle
            .load_voice_blocking("v", &ModelSource::bytes(b"voice".to_vec()), VoiceFormat::Sbv2File)
            .unwrap();
        (handle, counters)
    }

    #[test]
    fn test_infer_reports_serving_backend() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        let out = h.infer_blocking(&SynthesisRequest::new("hello", "v")).unwrap();
        assert_eq!(out.audio, b"hello");
        assert_eq!(out.backend, "cpu");
        assert_eq!(h.model_id(), "jvnv");
    }

    #[test]
    fn test_release_twice_shuts_down_once() {
        let (h, counters) = handle(ExecutionMode::Concurrent);
        h.release();
        h.release();
        assert!(h.is_released());
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_infer_after_release_never_touches_backend() {
        let (h, counters) = handle(ExecutionMode::Concurrent);
        h.release();
        let err = h.infer_blocking(&SynthesisRequest::new("hello", "v")).unwrap_err();
        assert!(matches!(err, DispatchError::HandleReleased { ref backend } if backend == "cpu"));
        assert_eq!(counters.infers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_through_clone_affects_all() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        let other = h.clone();
        assert!(h.same_instance(&other));
        other.release();
        assert!(h.is_released());
        assert!(matches!(h.unload_voice("v"), Err(DispatchError::HandleReleased { .. })));
    }

    #[test]
    fn test_drop_of_last_clone_shuts_down() {
        let (h, counters) = handle(ExecutionMode::Concurrent);
        let clone = h.clone();
        drop(h);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_runtime_error_surfaces() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        let err = h.infer_blocking(&SynthesisRequest::new("bad", "v")).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::BackendRuntimeFailure { source: RuntimeError::InvalidInput(_), .. }
        ));
        // The handle stays usable after a data-dependent failure.
        assert!(h.infer_blocking(&SynthesisRequest::new("ok", "v")).is_ok());
    }

    #[test]
    fn test_backend_panic_contained() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        let err = h.infer_blocking(&SynthesisRequest::new("panic", "v")).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::BackendRuntimeFailure { source: RuntimeError::Panicked(ref m), .. } if m.contains("kernel fault")
        ));
    }

    #[test]
    fn test_invalid_request_rejected_before_backend() {
        let (h, counters) = handle(ExecutionMode::Concurrent);
        let err = h.infer_blocking(&SynthesisRequest::new("", "v")).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
        assert_eq!(counters.infers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_voice_lifecycle() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        assert!(h.infer_blocking(&SynthesisRequest::new("hi", "other")).is_err());
        h.load_voice_blocking("other", &ModelSource::bytes(vec![1, 2]), VoiceFormat::Aivmx)
            .unwrap();
        assert!(h.infer_blocking(&SynthesisRequest::new("hi", "other")).is_ok());
        assert!(h.unload_voice("other").unwrap());
        assert!(!h.unload_voice("other").unwrap());
    }

    #[test]
    fn test_serialized_runtime_never_overlaps() {
        let (h, counters) = handle(ExecutionMode::Serialized);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let h = h.clone();
                s.spawn(move || h.infer_blocking(&SynthesisRequest::new("x", "v")).unwrap());
            }
        });
        assert_eq!(counters.infers.load(Ordering::SeqCst), 4);
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_runtime_runs_in_parallel() {
        let (h, counters) = handle(ExecutionMode::Concurrent);
        let barrier = std::sync::Barrier::new(4);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let h = h.clone();
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    h.infer_blocking(&SynthesisRequest::new("x", "v")).unwrap()
                });
            }
        });
        assert!(counters.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_async_infer_and_voice() {
        let (h, _) = handle(ExecutionMode::Concurrent);
        h.load_voice("async", ModelSource::bytes(vec![0]), VoiceFormat::Sbv2File)
            .await
            .unwrap();
        let out = h.infer(SynthesisRequest::new("async hi", "async")).await.unwrap();
        assert_eq!(out.audio, b"async hi");
        h.release();
        assert!(matches!(
            h.infer(SynthesisRequest::new("x", "async")).await,
            Err(DispatchError::HandleReleased { .. })
        ));
    }
}
