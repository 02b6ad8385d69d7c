//! Request, model and voice types shared by every backend.
//!
//! These shapes are the uniform contract: a backend may differ in speed and
//! floating-point rounding, never in what it accepts or returns.

use crate::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where model bytes come from
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Bytes already in memory
    Bytes(Arc<[u8]>),
    /// A file read on the blocking pool during selection
    Path(PathBuf),
}

impl ModelSource {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ModelSource::Bytes(Arc::from(bytes.into()))
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        ModelSource::Path(path.into())
    }

    /// Read the source into memory. Blocking for [`ModelSource::Path`].
    pub(crate) fn read(&self) -> DispatchResult<Arc<[u8]>> {
        match self {
            ModelSource::Bytes(bytes) => Ok(bytes.clone()),
            ModelSource::Path(path) => std::fs::read(path)
                .map(Arc::from)
                .map_err(|e| DispatchError::ModelSource(format!("{}: {e}", path.display()))),
        }
    }
}

/// Configuration for one model load request.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Identifier of the model; an engine serves exactly one
    pub model_id: String,
    /// BERT feature extractor weights
    pub bert_model: ModelSource,
    /// Tokenizer definition
    pub tokenizer: ModelSource,
    /// Upper bound on voices kept loaded at once; `None` means unbounded
    pub max_loaded_models: Option<usize>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>, bert_model: ModelSource, tokenizer: ModelSource) -> Self {
        Self {
            model_id: model_id.into(),
            bert_model,
            tokenizer,
            max_loaded_models: None,
        }
    }

    /// Build a config from files on disk
    pub fn from_paths(
        model_id: impl Into<String>,
        bert_model_path: impl Into<PathBuf>,
        tokenizer_path: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            model_id,
            ModelSource::path(bert_model_path),
            ModelSource::path(tokenizer_path),
        )
    }

    /// Limit how many voices the backend keeps resident
    pub fn with_max_loaded_models(mut self, max: usize) -> Result<Self, &'static str> {
        if max == 0 {
            return Err("max_loaded_models must be > 0");
        }
        self.max_loaded_models = Some(max);
        Ok(self)
    }

    /// Materialize all sources. Blocking.
    pub(crate) fn read_assets(&self) -> DispatchResult<ModelAssets> {
        Ok(ModelAssets {
            model_id: self.model_id.clone(),
            bert_model: self.bert_model.read()?,
            tokenizer: self.tokenizer.read()?,
            max_loaded_models: self.max_loaded_models,
        })
    }
}

/// In-memory model payload handed to [`BackendRuntime::load_model`](crate::BackendRuntime::load_model).
///
/// Byte buffers are reference counted so a retry on the next candidate does
/// not copy the weights again.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub model_id: String,
    pub bert_model: Arc<[u8]>,
    pub tokenizer: Arc<[u8]>,
    pub max_loaded_models: Option<usize>,
}

/// Voice package formats understood by backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceFormat {
    /// `.sbv2` archive (zstd-compressed tar with model and style vectors)
    Sbv2File,
    /// `.aivmx` ONNX model with embedded style vectors
    Aivmx,
}

impl VoiceFormat {
    /// Guess the format from a file extension
    pub fn from_extension(path: &std::path::Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "sbv2" => Some(VoiceFormat::Sbv2File),
            "aivmx" => Some(VoiceFormat::Aivmx),
            _ => None,
        }
    }
}

/// Per-request synthesis knobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesizeOptions {
    /// Mix between stochastic and deterministic duration predictors (0.0..=1.0)
    pub sdp_ratio: f32,
    /// Speech speed multiplier; larger is slower
    pub length_scale: f32,
}

impl Default for SynthesizeOptions {
    fn default() -> Self {
        Self {
            sdp_ratio: 0.0,
            length_scale: 1.0,
        }
    }
}

/// One synthesis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Identifier of a voice previously loaded with `load_voice`
    pub ident: String,
    pub style_id: i32,
    pub speaker_id: i64,
    #[serde(default)]
    pub options: SynthesizeOptions,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, ident: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ident: ident.into(),
            style_id: 0,
            speaker_id: 0,
            options: SynthesizeOptions::default(),
        }
    }

    pub fn with_style(mut self, style_id: i32) -> Self {
        self.style_id = style_id;
        self
    }

    pub fn with_speaker(mut self, speaker_id: i64) -> Self {
        self.speaker_id = speaker_id;
        self
    }

    pub fn with_options(mut self, options: SynthesizeOptions) -> Self {
        self.options = options;
        self
    }

    /// Backend-independent validation, run before any backend access
    pub fn validate(&self) -> DispatchResult<()> {
        if self.text.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("text must not be empty".into()));
        }
        if self.ident.is_empty() {
            return Err(DispatchError::InvalidRequest("voice ident must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.options.sdp_ratio) {
            return Err(DispatchError::InvalidRequest(
                "sdp_ratio must be between 0.0 and 1.0".into(),
            ));
        }
        if !(self.options.length_scale.is_finite() && self.options.length_scale > 0.0) {
            return Err(DispatchError::InvalidRequest(
                "length_scale must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a synthesis call
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    /// Encoded audio exactly as produced by the backend
    pub audio: Vec<u8>,
    /// Name of the backend that served the request
    pub backend: String,
    /// Wall time spent inside the backend
    pub elapsed: Duration,
}
