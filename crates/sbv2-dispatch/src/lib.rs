//! # sbv2-dispatch
//!
//! Backend selection and dispatch for Style-Bert-VITS2 text-to-speech
//! inference.
//!
//! The same model can run on several accelerators. This crate probes them
//! in priority order, binds the model to the first one that actually comes
//! up and routes every later call through a [`ModelHandle`] tied to it:
//! **CUDA** → **CoreML** → **DirectML** → **CPU**
//!
//! | Backend    | Requirement                                 |
//! |------------|---------------------------------------------|
//! | `cuda`     | NVIDIA device (`/dev/nvidia0`, `nvidia-smi`) |
//! | `coreml`   | macOS                                       |
//! | `directml` | Windows with `d3d12.dll`                    |
//! | `cpu`      | none                                        |
//!
//! Inference kernels are not part of this crate; each backend is a
//! [`BackendPlugin`] supplied by the caller.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sbv2_dispatch::{
//!     BackendDescriptor, BackendKind, BackendRegistry, DispatchConfig, DispatchEngine,
//!     ModelConfig, SynthesisRequest,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = BackendRegistry::new()
//!         .with(BackendDescriptor::builtin(BackendKind::Cuda, Arc::new(OrtCuda)))?
//!         .with(BackendDescriptor::builtin(BackendKind::Cpu, Arc::new(OrtCpu)))?;
//!
//!     let engine = DispatchEngine::new(Arc::new(registry), DispatchConfig::load(None)?);
//!     let model = ModelConfig::from_paths("jvnv", "deberta.onnx", "tokenizer.json");
//!     let handle = engine.select_and_load(model).await?;
//!     println!("serving on {}", handle.backend().name);
//!
//!     let out = handle.infer(SynthesisRequest::new("こんにちは", "tsukuyomi")).await?;
//!     std::fs::write("out.wav", out.audio)?;
//!     handle.release();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod hardware;
pub mod types;

pub use backend::plugin::{
    BackendPlugin, BackendRuntime, CapabilityContext, ExecutionMode, LoadedModel,
};
pub use backend::probe::{BackendProbe, ProbeResult, ProbedBackend};
pub use backend::registry::{BackendRegistry, global_registry, init_global_registry};
pub use backend::{BackendDescriptor, BackendInfo, BackendKind};
pub use config::{ConfigError, DispatchConfig};
pub use engine::DispatchEngine;
pub use error::{
    DispatchError, DispatchResult, InitError, LoadError, ProbeStage, RuntimeError,
    UnavailableReason,
};
pub use handle::ModelHandle;
pub use hardware::{CudaDevice, HostCapabilities, HostOs};
pub use types::{
    ModelAssets, ModelConfig, ModelSource, SynthesisOutput, SynthesisRequest, SynthesizeOptions,
    VoiceFormat,
};
