//! Host capability detection
//!
//! Produces a read-only [`HostCapabilities`] snapshot consumed by backend
//! capability checks. Detection uses filesystem probes and process checks
//! rather than linking to GPU libraries, so the dispatch core stays free of
//! accelerator dependencies regardless of which backends are registered.
//!
//! The snapshot is taken once per process by [`HostCapabilities::detect_cached`];
//! engines share it through an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Operating system family of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    Linux,
    Windows,
    MacOs,
    Other(String),
}

impl HostOs {
    fn current() -> Self {
        match std::env::consts::OS {
            "linux" => HostOs::Linux,
            "windows" => HostOs::Windows,
            "macos" => HostOs::MacOs,
            other => HostOs::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for HostOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostOs::Linux => write!(f, "linux"),
            HostOs::Windows => write!(f, "windows"),
            HostOs::MacOs => write!(f, "macos"),
            HostOs::Other(name) => write!(f, "{name}"),
        }
    }
}

/// NVIDIA device information gathered during detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CudaDevice {
    /// VRAM of the first device in bytes (0 when `nvidia-smi` could not report it)
    pub vram_bytes: u64,
}

/// Snapshot of the host environment relevant to backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub os: HostOs,
    /// CPU architecture as reported by `std::env::consts::ARCH`
    pub arch: String,
    /// Present when an NVIDIA CUDA device was found
    pub cuda: Option<CudaDevice>,
    /// Direct3D 12 runtime present (prerequisite for DirectML)
    pub direct3d12: bool,
    /// CoreML framework present (any macOS host)
    pub coreml: bool,
    /// Total system RAM in bytes
    pub total_ram_bytes: u64,
    /// Available system RAM in bytes at detection time
    pub available_ram_bytes: u64,
    /// Number of logical CPU cores
    pub cpu_cores: usize,
}

static DETECTED: OnceLock<Arc<HostCapabilities>> = OnceLock::new();

impl HostCapabilities {
    /// Detect the host environment.
    ///
    /// Runs synchronously and may spawn `nvidia-smi`; call from a blocking
    /// context or `spawn_blocking`.
    pub fn detect() -> Self {
        let os = HostOs::current();

        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let host = Self {
            cuda: detect_cuda(&os),
            direct3d12: detect_direct3d12(&os),
            coreml: os == HostOs::MacOs,
            os,
            arch: std::env::consts::ARCH.to_string(),
            total_ram_bytes: sys.total_memory(),
            available_ram_bytes: sys.available_memory(),
            cpu_cores: num_cpus(),
        };

        tracing::debug!(
            os = %host.os,
            arch = %host.arch,
            cuda = host.cuda.is_some(),
            direct3d12 = host.direct3d12,
            coreml = host.coreml,
            "host capabilities detected"
        );
        host
    }

    /// Process-wide cached snapshot. The first call runs [`detect`](Self::detect).
    pub fn detect_cached() -> Arc<Self> {
        DETECTED.get_or_init(|| Arc::new(Self::detect())).clone()
    }

    /// A host with only a CPU: no accelerators of any kind.
    ///
    /// Useful for forcing a CPU-only environment in tests and in
    /// deployments where accelerator probing must be skipped.
    pub fn cpu_only() -> Self {
        Self {
            os: HostOs::Linux,
            arch: "x86_64".to_string(),
            cuda: None,
            direct3d12: false,
            coreml: false,
            total_ram_bytes: 8 * 1024 * 1024 * 1024,
            available_ram_bytes: 4 * 1024 * 1024 * 1024,
            cpu_cores: 4,
        }
    }

    /// Mark an NVIDIA device as present
    pub fn with_cuda(mut self, vram_bytes: u64) -> Self {
        self.cuda = Some(CudaDevice { vram_bytes });
        self
    }

    /// Present as a Windows host with a Direct3D 12 runtime
    pub fn with_direct3d12(mut self) -> Self {
        self.os = HostOs::Windows;
        self.direct3d12 = true;
        self
    }

    /// Present as a macOS host with CoreML
    pub fn with_coreml(mut self) -> Self {
        self.os = HostOs::MacOs;
        self.coreml = true;
        self
    }
}

// ============================================================================
// Detection helpers
// ============================================================================

/// Returns device info if an NVIDIA GPU usable for CUDA is present.
///
/// On Linux the `/dev/nvidia0` device node must exist (kernel module loaded).
/// `nvidia-smi` is then queried for VRAM; a failing `nvidia-smi` still
/// reports the device with unknown VRAM.
fn detect_cuda(os: &HostOs) -> Option<CudaDevice> {
    match os {
        HostOs::Linux => {
            if !Path::new("/dev/nvidia0").exists() {
                return None;
            }
            Some(CudaDevice {
                vram_bytes: query_nvidia_vram().unwrap_or(0),
            })
        }
        HostOs::Windows => query_nvidia_vram().map(|vram_bytes| CudaDevice { vram_bytes }),
        _ => None,
    }
}

fn query_nvidia_vram() -> Option<u64> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    // nvidia-smi reports MiB
    let mib: u64 = stdout.trim().lines().next()?.trim().parse().ok()?;
    Some(mib * 1024 * 1024)
}

/// DirectML ships with Windows 10 1903+ on top of Direct3D 12.
fn detect_direct3d12(os: &HostOs) -> bool {
    if *os != HostOs::Windows {
        return false;
    }
    let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
    let system32 = Path::new(&system_root).join("System32");
    system32.join("d3d12.dll").exists() || system32.join("DirectML.dll").exists()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Tests
// ============================================================================
