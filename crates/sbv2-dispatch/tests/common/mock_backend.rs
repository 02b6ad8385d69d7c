//! Mock backend plugin for `sbv2-dispatch` integration tests.
//!
//! [`MockBackend`] implements the whole plugin contract
//! ([`BackendPlugin`] → [`BackendRuntime`] → [`LoadedModel`]) and can be told
//! to fail or hang at any stage. It records every call so tests can assert
//! on what the engine actually did, not just on what it returned.
//!
//! | Goal | Mechanism |
//! |------|-----------|
//! | Deterministic | Failure stage fixed at build time |
//! | Observable | `inits()`, `shutdowns()`, `infers()`, `max_in_flight()` |
//! | Thread-safe | Counters are atomics behind one `Arc` |
//!
//! # Example
//!
//! ```rust,ignore
//! let cuda = MockBackend::builder("cuda").fail_init("libcudart.so.12 not found").build();
//! let descriptor = cuda.descriptor(0);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sbv2_dispatch::{
    BackendDescriptor, BackendKind, BackendPlugin, BackendRuntime, CapabilityContext,
    ExecutionMode, InitError, LoadError, LoadedModel, ModelAssets, RuntimeError,
    SynthesisRequest, VoiceFormat,
};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Stage at which the mock gives up
#[derive(Debug, Clone)]
pub enum Failure {
    Capability(InitError),
    Init(InitError),
    InitPanic(String),
    WarmUp(InitError),
    Load(String),
}

#[derive(Debug, Default)]
struct Counters {
    capability_checks: AtomicUsize,
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
    loads: AtomicUsize,
    infers: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct Shared {
    name: String,
    failure: Option<Failure>,
    init_delay: Option<Duration>,
    load_delay: Option<Duration>,
    infer_delay: Duration,
    mode: ExecutionMode,
    infer_error: Option<RuntimeError>,
    counters: Counters,
    seen_contexts: Mutex<Vec<CapabilityContext>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct MockBackendBuilder {
    name: String,
    failure: Option<Failure>,
    init_delay: Option<Duration>,
    load_delay: Option<Duration>,
    infer_delay: Duration,
    mode: ExecutionMode,
    infer_error: Option<RuntimeError>,
}

impl MockBackendBuilder {
    pub fn fail_capability(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Capability(InitError::UnsupportedHardware(
            message.to_string(),
        )));
        self
    }

    pub fn fail_init(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Init(InitError::MissingRuntime(message.to_string())));
        self
    }

    pub fn missing_driver(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Init(InitError::MissingDriver(message.to_string())));
        self
    }

    pub fn panic_on_init(mut self, message: &str) -> Self {
        self.failure = Some(Failure::InitPanic(message.to_string()));
        self
    }

    pub fn fail_warm_up(mut self, message: &str) -> Self {
        self.failure = Some(Failure::WarmUp(InitError::Failed(message.to_string())));
        self
    }

    pub fn fail_load(mut self, message: &str) -> Self {
        self.failure = Some(Failure::Load(message.to_string()));
        self
    }

    /// Sleep inside `initialize` before succeeding (or failing)
    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Sleep inside `load_model` before succeeding (or failing)
    pub fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Sleep inside every `infer` call
    pub fn infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.mode = ExecutionMode::Serialized;
        self
    }

    /// Every `infer` call returns this error
    pub fn infer_error(mut self, error: RuntimeError) -> Self {
        self.infer_error = Some(error);
        self
    }

    pub fn build(self) -> MockBackend {
        MockBackend {
            shared: Arc::new(Shared {
                name: self.name,
                failure: self.failure,
                init_delay: self.init_delay,
                load_delay: self.load_delay,
                infer_delay: self.infer_delay,
                mode: self.mode,
                infer_error: self.infer_error,
                counters: Counters::default(),
                seen_contexts: Mutex::new(Vec::new()),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin
// ─────────────────────────────────────────────────────────────────────────────

/// Configurable stand-in for a hardware backend.
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn builder(name: &str) -> MockBackendBuilder {
        MockBackendBuilder {
            name: name.to_string(),
            failure: None,
            init_delay: None,
            load_delay: None,
            infer_delay: Duration::ZERO,
            mode: ExecutionMode::Concurrent,
            infer_error: None,
        }
    }

    /// A plain descriptor with the mock's name and `priority`
    pub fn descriptor(&self, priority: i32) -> BackendDescriptor {
        BackendDescriptor::new(self.shared.name.clone(), priority, Arc::new(self.clone()))
    }

    /// A built-in descriptor gated by `kind`'s host requirement
    pub fn builtin(&self, kind: BackendKind) -> BackendDescriptor {
        BackendDescriptor::builtin(kind, Arc::new(self.clone()))
    }

    pub fn capability_checks(&self) -> usize {
        self.shared.counters.capability_checks.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.shared.counters.inits.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shared.counters.shutdowns.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.shared.counters.loads.load(Ordering::SeqCst)
    }

    pub fn infers(&self) -> usize {
        self.shared.counters.infers.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every context passed to `initialize`, in call order
    pub fn seen_contexts(&self) -> Vec<CapabilityContext> {
        self.shared.seen_contexts.lock().unwrap().clone()
    }
}

impl BackendPlugin for MockBackend {
    fn capability_check(&self, _ctx: &CapabilityContext) -> Result<(), InitError> {
        self.shared
            .counters
            .capability_checks
            .fetch_add(1, Ordering::SeqCst);
        match &self.shared.failure {
            Some(Failure::Capability(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    fn initialize(&self, ctx: &CapabilityContext) -> Result<Box<dyn BackendRuntime>, InitError> {
        self.shared.counters.inits.fetch_add(1, Ordering::SeqCst);
        self.shared.seen_contexts.lock().unwrap().push(ctx.clone());
        if let Some(delay) = self.shared.init_delay {
            std::thread::sleep(delay);
        }
        match &self.shared.failure {
            Some(Failure::Init(e)) => return Err(e.clone()),
            Some(Failure::InitPanic(message)) => panic!("{message}"),
            _ => {}
        }
        Ok(Box::new(MockRuntime {
            shared: self.shared.clone(),
        }))
    }
}

struct MockRuntime {
    shared: Arc<Shared>,
}

impl BackendRuntime for MockRuntime {
    fn execution_mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    fn warm_up(&self) -> Result<(), InitError> {
        match &self.shared.failure {
            Some(Failure::WarmUp(e)) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    fn load_model(&self, assets: &ModelAssets) -> Result<Box<dyn LoadedModel>, LoadError> {
        self.shared.counters.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.shared.load_delay {
            std::thread::sleep(delay);
        }
        if let Some(Failure::Load(message)) = &self.shared.failure {
            return Err(LoadError(message.clone()));
        }
        Ok(Box::new(MockModel {
            shared: self.shared.clone(),
            model_id: assets.model_id.clone(),
            voices: Mutex::new(HashSet::new()),
        }))
    }

    fn shutdown(&mut self) {
        self.shared.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockModel {
    shared: Arc<Shared>,
    model_id: String,
    voices: Mutex<HashSet<String>>,
}

impl LoadedModel for MockModel {
    /// Returns `"<backend>:<model>:<ident>:<text>"` as bytes.
    fn infer(&self, request: &SynthesisRequest) -> Result<Vec<u8>, RuntimeError> {
        let counters = &self.shared.counters;
        counters.infers.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.shared.infer_delay.is_zero() {
            std::thread::sleep(self.shared.infer_delay);
        }
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = &self.shared.infer_error {
            return Err(e.clone());
        }
        if !self.voices.lock().unwrap().contains(&request.ident) {
            return Err(RuntimeError::InvalidInput(format!(
                "voice '{}' is not loaded",
                request.ident
            )));
        }
        Ok(format!(
            "{}:{}:{}:{}",
            self.shared.name, self.model_id, request.ident, request.text
        )
        .into_bytes())
    }

    fn load_voice(&self, ident: &str, voice: &[u8], _format: VoiceFormat) -> Result<(), RuntimeError> {
        if voice.is_empty() {
            return Err(RuntimeError::InvalidInput("empty voice package".into()));
        }
        self.voices.lock().unwrap().insert(ident.to_string());
        Ok(())
    }

    fn unload_voice(&self, ident: &str) -> bool {
        self.voices.lock().unwrap().remove(ident)
    }
}
