//! Backend descriptors, plugin contract, registry and probing.

pub mod plugin;
pub mod probe;
pub mod registry;

use crate::error::InitError;
use crate::hardware::HostCapabilities;
use plugin::{BackendPlugin, CapabilityContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The accelerator families the dispatch core knows how to gate.
///
/// Default priorities prefer dedicated accelerators over the CPU:
/// **CUDA** → **CoreML** → **DirectML** → **CPU**.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum BackendKind {
    /// NVIDIA CUDA
    Cuda,
    /// Apple CoreML (Neural Engine / Metal)
    CoreMl,
    /// Microsoft DirectML on Direct3D 12
    DirectMl,
    /// CPU-only, always available
    Cpu,
}

impl BackendKind {
    /// All kinds in default priority order
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Cuda,
        BackendKind::CoreMl,
        BackendKind::DirectMl,
        BackendKind::Cpu,
    ];

    /// Registry name used when a descriptor is built with [`BackendDescriptor::builtin`]
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Cuda => "cuda",
            BackendKind::CoreMl => "coreml",
            BackendKind::DirectMl => "directml",
            BackendKind::Cpu => "cpu",
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            BackendKind::Cuda => 0,
            BackendKind::CoreMl => 1,
            BackendKind::DirectMl => 2,
            BackendKind::Cpu => 3,
        }
    }

    /// Check the host against this kind's hardware/driver requirement.
    pub fn host_requirement(&self, host: &HostCapabilities) -> Result<(), InitError> {
        match self {
            BackendKind::Cuda if host.cuda.is_none() => Err(InitError::MissingDriver(
                "no NVIDIA CUDA device detected".into(),
            )),
            BackendKind::CoreMl if !host.coreml => Err(InitError::UnsupportedHardware(format!(
                "CoreML requires macOS, host is {}",
                host.os
            ))),
            BackendKind::DirectMl if !host.direct3d12 => Err(InitError::MissingRuntime(
                "DirectML requires Windows with a Direct3D 12 runtime".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Cuda => write!(f, "CUDA"),
            BackendKind::CoreMl => write!(f, "CoreML"),
            BackendKind::DirectMl => write!(f, "DirectML"),
            BackendKind::Cpu => write!(f, "CPU"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(BackendKind::Cuda),
            "coreml" => Ok(BackendKind::CoreMl),
            "directml" | "dml" => Ok(BackendKind::DirectMl),
            "cpu" => Ok(BackendKind::Cpu),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Static metadata for one backend variant plus the plugin implementing it.
///
/// Immutable once registered; cloning shares the plugin.
#[derive(Clone)]
pub struct BackendDescriptor {
    name: String,
    priority: i32,
    kind: Option<BackendKind>,
    plugin: Arc<dyn BackendPlugin>,
}

impl BackendDescriptor {
    /// A descriptor with no built-in host requirement; the plugin's own
    /// `capability_check` is the only gate.
    pub fn new(name: impl Into<String>, priority: i32, plugin: Arc<dyn BackendPlugin>) -> Self {
        Self {
            name: name.into(),
            priority,
            kind: None,
            plugin,
        }
    }

    /// A descriptor for a known accelerator family, gated by
    /// [`BackendKind::host_requirement`] and using its default name and priority.
    pub fn builtin(kind: BackendKind, plugin: Arc<dyn BackendPlugin>) -> Self {
        Self {
            name: kind.name().to_string(),
            priority: kind.default_priority(),
            kind: Some(kind),
            plugin,
        }
    }

    /// Override the priority (lower = preferred)
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn kind(&self) -> Option<BackendKind> {
        self.kind
    }

    pub fn plugin(&self) -> &Arc<dyn BackendPlugin> {
        &self.plugin
    }

    /// Host requirement of the kind (if any), then the plugin's own check.
    pub fn capability_check(&self, ctx: &CapabilityContext) -> Result<(), InitError> {
        if let Some(kind) = self.kind {
            kind.host_requirement(&ctx.host)?;
        }
        self.plugin.capability_check(ctx)
    }
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Identity of the backend a handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub priority: i32,
    pub kind: Option<BackendKind>,
}

impl From<&BackendDescriptor> for BackendInfo {
    fn from(d: &BackendDescriptor) -> Self {
        Self {
            name: d.name.clone(),
            priority: d.priority,
            kind: d.kind,
        }
    }
}
