//! Dispatch configuration
//!
//! [`DispatchConfig`] can be built in code with validating builder methods,
//! or loaded from a TOML/JSON/YAML file layered under `SBV2_DISPATCH_*`
//! environment variables:
//!
//! ```toml
//! probe_timeout_ms = 10000
//! disabled_backends = ["directml"]
//! backend_override = "cpu"
//!
//! [priority_overrides]
//! coreml = 5
//! ```
//!
//! `${VAR}` references inside files are substituted before parsing.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Environment variable prefix, e.g. `SBV2_DISPATCH_PROBE_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "SBV2_DISPATCH";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Selection and runtime settings for a [`DispatchEngine`](crate::DispatchEngine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for one backend probe (capability check + initialize + warm-up)
    pub probe_timeout_ms: u64,

    /// Deadline for reading model sources and for one model load
    pub load_timeout_ms: u64,

    /// Backends never probed; they are reported with stage `disabled`
    pub disabled_backends: Vec<String>,

    /// Per-backend priority replacing the registered one (lower = preferred)
    pub priority_overrides: BTreeMap<String, i32>,

    /// Probe only this backend; every other candidate is reported as disabled
    pub backend_override: Option<String>,

    /// Accelerator ordinal passed to plugins
    pub device_id: u32,

    /// CPU thread count passed to plugins. If None, the backend decides.
    pub num_threads: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 30_000,
            load_timeout_ms: 120_000,
            disabled_backends: Vec::new(),
            priority_overrides: BTreeMap::new(),
            backend_override: None,
            device_id: 0,
            num_threads: None,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Result<Self, &'static str> {
        let millis = timeout.as_millis();
        if millis == 0 {
            return Err("probe_timeout must be at least 1 ms");
        }
        self.probe_timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        Ok(self)
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Result<Self, &'static str> {
        let millis = timeout.as_millis();
        if millis == 0 {
            return Err("load_timeout must be at least 1 ms");
        }
        self.load_timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        Ok(self)
    }

    /// Never probe `backend`
    pub fn disable(mut self, backend: impl Into<String>) -> Self {
        let backend = backend.into();
        if !self.disabled_backends.contains(&backend) {
            self.disabled_backends.push(backend);
        }
        self
    }

    /// Replace the registered priority of `backend`
    pub fn with_priority(mut self, backend: impl Into<String>, priority: i32) -> Self {
        self.priority_overrides.insert(backend.into(), priority);
        self
    }

    /// Force a single backend
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend_override = Some(backend.into());
        self
    }

    pub fn with_device(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn with_num_threads(mut self, threads: usize) -> Result<Self, &'static str> {
        if threads == 0 {
            return Err("num_threads must be > 0");
        }
        self.num_threads = Some(threads);
        Ok(self)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Priority used for ordering `backend`
    pub fn effective_priority(&self, backend: &str, registered: i32) -> i32 {
        self.priority_overrides
            .get(backend)
            .copied()
            .unwrap_or(registered)
    }

    /// Why configuration keeps `backend` from being probed, if it does.
    pub fn exclusion_reason(&self, backend: &str) -> Option<String> {
        if self.disabled_backends.iter().any(|b| b == backend) {
            return Some("disabled by configuration".to_string());
        }
        match &self.backend_override {
            Some(forced) if forced != backend => {
                Some(format!("backend_override selects '{forced}'"))
            }
            _ => None,
        }
    }

    /// Reject settings that can never produce a working engine
    pub fn validate(&self) -> ConfigResult<()> {
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".into()));
        }
        if self.load_timeout_ms == 0 {
            return Err(ConfigError::Invalid("load_timeout_ms must be > 0".into()));
        }
        if self.num_threads == Some(0) {
            return Err(ConfigError::Invalid("num_threads must be > 0".into()));
        }
        if let Some(forced) = &self.backend_override {
            if self.disabled_backends.contains(forced) {
                return Err(ConfigError::Invalid(format!(
                    "backend_override '{forced}' is also listed in disabled_backends"
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Parse configuration from a string of the given format. No environment layering.
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        let config = Cfg::builder()
            .add_source(File::from_str(&substitute_env_vars(content), format))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        finish(config)
    }

    /// Load defaults, then `path` (if given), then `SBV2_DISPATCH_*` variables.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_with_env(path, None)
    }

    /// [`load`](Self::load) with an explicit environment map instead of the
    /// process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> ConfigResult<Self> {
        let mut builder = Cfg::builder();

        if let Some(path) = path {
            let format = detect_format(path)?;
            let content = std::fs::read_to_string(path)?;
            builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("disabled_backends")
                .try_parsing(true)
                .source(env),
        );

        let config = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let loaded = finish(config)?;

        tracing::debug!(
            path = ?path,
            probe_timeout_ms = loaded.probe_timeout_ms,
            disabled = ?loaded.disabled_backends,
            backend_override = ?loaded.backend_override,
            "dispatch configuration loaded"
        );
        Ok(loaded)
    }
}

fn finish(config: Cfg) -> ConfigResult<DispatchConfig> {
    let parsed: DispatchConfig = config
        .try_deserialize()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    parsed.validate()?;
    Ok(parsed)
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced variable pattern is valid")
});

/// Replace `${VAR}` with the value of environment variable `VAR`.
/// Unset variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    BRACED_VAR
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

// ============================================================================
// Tests
// ============================================================================
