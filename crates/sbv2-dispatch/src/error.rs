//! Error types for backend dispatch
//!
//! Errors are split by who owns them:
//! - [`InitError`] and [`LoadError`] are raised by backend plugins during
//!   selection and never reach the caller directly; they are folded into an
//!   [`UnavailableReason`].
//! - [`RuntimeError`] is raised by a loaded model after selection.
//! - [`DispatchError`] is the only error type callers of the engine and of
//!   [`ModelHandle`](crate::ModelHandle) observe.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Plugin-side errors
// ============================================================================

/// Failure to bring a backend runtime up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    /// Kernel driver or device node is missing
    #[error("driver not found: {0}")]
    MissingDriver(String),

    /// Host CPU/GPU lacks a required feature (instruction set, compute capability)
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    /// Shared runtime library (CUDA toolkit, DirectML.dll, ...) could not be loaded
    #[error("runtime library missing: {0}")]
    MissingRuntime(String),

    /// Any other initialization failure
    #[error("initialization failed: {0}")]
    Failed(String),
}

/// Failure to load model weights into an initialized runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("model load failed: {0}")]
pub struct LoadError(pub String);

/// Failure of a loaded model while serving a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The request was rejected by the backend (unknown voice, bad style id, ...)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backend failed while executing the request
    #[error("execution failed: {0}")]
    Execution(String),

    /// The backend does not implement the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Backend code panicked; the panic was contained at the dispatch boundary
    #[error("backend panicked: {0}")]
    Panicked(String),
}

// ============================================================================
// Probe reasons
// ============================================================================

/// Where in the selection sequence a candidate dropped out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStage {
    /// Excluded by configuration (`disabled_backends` or `backend_override`)
    Disabled,
    /// Host requirement or plugin capability check failed
    Capability,
    /// `BackendPlugin::initialize` failed
    Initialize,
    /// `BackendRuntime::warm_up` failed after initialization
    WarmUp,
    /// `BackendRuntime::load_model` failed
    Load,
    /// The probe or load did not finish before its deadline
    Timeout,
    /// Plugin code panicked
    Panic,
}

impl std::fmt::Display for ProbeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeStage::Disabled => "disabled",
            ProbeStage::Capability => "capability",
            ProbeStage::Initialize => "initialize",
            ProbeStage::WarmUp => "warm-up",
            ProbeStage::Load => "load",
            ProbeStage::Timeout => "timeout",
            ProbeStage::Panic => "panic",
        };
        write!(f, "{s}")
    }
}

/// Why a single candidate backend could not serve a selection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableReason {
    /// Backend name as registered
    pub backend: String,
    /// Stage that failed
    pub stage: ProbeStage,
    /// Human-readable cause
    pub message: String,
}

impl UnavailableReason {
    pub fn new(backend: impl Into<String>, stage: ProbeStage, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.backend, self.stage, self.message)
    }
}

// ============================================================================
// Caller-facing error
// ============================================================================

/// Errors surfaced by [`DispatchEngine`](crate::DispatchEngine) and
/// [`ModelHandle`](crate::ModelHandle).
///
/// `Clone` so that every caller racing on the same engine receives the same
/// value for a shared selection failure.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// Every candidate backend failed; one reason per candidate, in priority order
    #[error("no backend available: {}", format_reasons(.reasons))]
    NoBackendAvailable { reasons: Vec<UnavailableReason> },

    /// The selected backend failed while serving a request
    #[error("backend '{backend}' failed at runtime: {source}")]
    BackendRuntimeFailure {
        backend: String,
        #[source]
        source: RuntimeError,
    },

    /// The handle was released before this call
    #[error("model handle for backend '{backend}' has been released")]
    HandleReleased { backend: String },

    /// The caller cancelled selection before it completed
    #[error("backend selection was cancelled")]
    Cancelled,

    /// The request failed validation before dispatch
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Model or voice bytes could not be read
    #[error("model source error: {0}")]
    ModelSource(String),

    /// The engine already selected a backend for a different model
    #[error("engine already serves model '{selected}', cannot load '{requested}'")]
    ModelMismatch { selected: String, requested: String },

    /// A descriptor with the same name is already registered
    #[error("backend '{0}' is already registered")]
    DuplicateBackend(String),
}

impl DispatchError {
    /// Per-backend reasons when selection failed, empty otherwise.
    pub fn reasons(&self) -> &[UnavailableReason] {
        match self {
            DispatchError::NoBackendAvailable { reasons } => reasons,
            _ => &[],
        }
    }
}

fn format_reasons(reasons: &[UnavailableReason]) -> String {
    if reasons.is_empty() {
        return "no backends registered".to_string();
    }
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;
