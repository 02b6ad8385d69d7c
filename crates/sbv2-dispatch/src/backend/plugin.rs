//! Backend plugin contract
//!
//! Every backend variant (CPU, CUDA, DirectML, CoreML, or anything else)
//! implements the same three traits, so the engine never needs to know which
//! one it is driving:
//!
//! ```text
//! BackendPlugin ──initialize──▶ BackendRuntime ──load_model──▶ LoadedModel
//!                                    │                              │
//!                                 shutdown                   infer / voices
//! ```
//!
//! All methods are blocking. The engine calls them from tokio's blocking
//! pool, never from an async worker.
//!
//! # Example
//!
//! ```rust,ignore
//! struct OrtCpu;
//!
//! impl BackendPlugin for OrtCpu {
//!     fn initialize(&self, ctx: &CapabilityContext) -> Result<Box<dyn BackendRuntime>, InitError> {
//!         let env = ort::init().commit().map_err(|e| InitError::MissingRuntime(e.to_string()))?;
//!         Ok(Box::new(OrtRuntime::new(env, ctx.num_threads)))
//!     }
//! }
//! ```

use crate::error::{InitError, LoadError, RuntimeError};
use crate::hardware::HostCapabilities;
use crate::types::{ModelAssets, SynthesisRequest, VoiceFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Everything a plugin may consult while checking or initializing.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Name the backend is registered under
    pub backend: String,
    /// Host snapshot shared by all probes of an engine
    pub host: Arc<HostCapabilities>,
    /// Accelerator ordinal to bind to
    pub device_id: u32,
    /// Intra-op thread count for CPU execution; `None` lets the backend decide
    pub num_threads: Option<usize>,
}

/// How a runtime tolerates concurrent inference calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// `infer` may be called from several threads at once
    #[default]
    Concurrent,
    /// The runtime has a single submission queue; calls are serialized per handle
    Serialized,
}

/// Factory for a backend runtime. Registered once, probed many times.
pub trait BackendPlugin: Send + Sync {
    /// Cheap availability check run before `initialize`.
    ///
    /// The built-in host requirement of the descriptor has already passed
    /// when this is called.
    fn capability_check(&self, ctx: &CapabilityContext) -> Result<(), InitError> {
        let _ = ctx;
        Ok(())
    }

    /// Bring the runtime up. Must release anything it acquired before
    /// returning an error.
    fn initialize(&self, ctx: &CapabilityContext) -> Result<Box<dyn BackendRuntime>, InitError>;
}

/// An initialized backend, able to load models.
pub trait BackendRuntime: Send + Sync {
    /// Concurrency contract of models loaded into this runtime
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Concurrent
    }

    /// Post-initialization self test (allocate a scratch buffer, run a tiny
    /// kernel). A failure here tears the runtime down through `shutdown`.
    fn warm_up(&self) -> Result<(), InitError> {
        Ok(())
    }

    /// Load model weights
    fn load_model(&self, assets: &ModelAssets) -> Result<Box<dyn LoadedModel>, LoadError>;

    /// Release native resources. Called exactly once, after every model
    /// loaded from this runtime has been dropped.
    fn shutdown(&mut self);
}

/// A model resident on one backend.
pub trait LoadedModel: Send + Sync {
    /// Synthesize speech; returns encoded audio
    fn infer(&self, request: &SynthesisRequest) -> Result<Vec<u8>, RuntimeError>;

    /// Make a voice available under `ident`
    fn load_voice(&self, ident: &str, voice: &[u8], format: VoiceFormat) -> Result<(), RuntimeError> {
        let _ = (voice, format);
        Err(RuntimeError::Unsupported(format!("load_voice({ident})")))
    }

    /// Drop the voice registered under `ident`; returns whether it existed
    fn unload_voice(&self, ident: &str) -> bool {
        let _ = ident;
        false
    }
}
