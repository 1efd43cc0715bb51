//! Accelerator adapter discovery.
//!
//! An [`AcceleratorHost`] answers two questions: does this host expose a
//! compute-acceleration interface at all, and can an adapter be negotiated
//! through it. [`SystemHost`] answers them for the machine we run on by looking
//! for GPU device nodes, asking the CUDA driver first when built with the
//! `cuda` feature.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Accelerated backend unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A negotiated hardware adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Adapter name (device node or driver-reported name).
    pub name: String,

    /// Backend family, e.g. "cuda" or "drm".
    pub backend: String,
}

/// A host that may offer accelerated compute.
#[async_trait]
pub trait AcceleratorHost: Send + Sync {
    /// Whether the host exposes an acceleration interface at all.
    fn has_interface(&self) -> bool;

    /// Negotiate an adapter. `Ok(None)` means the interface exists but offered nothing.
    async fn request_adapter(&self) -> Result<Option<AdapterInfo>, ProbeError>;
}

/// The machine this process runs on.
#[derive(Debug, Clone)]
pub struct SystemHost {
    dev_root: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::with_dev_root("/dev")
    }
}

impl SystemHost {
    /// Probe device nodes under `dev_root` instead of `/dev`.
    pub fn with_dev_root(dev_root: impl Into<PathBuf>) -> Self {
        Self {
            dev_root: dev_root.into(),
        }
    }

    fn dri_dir(&self) -> PathBuf {
        self.dev_root.join("dri")
    }

    fn nvidia_node(&self) -> PathBuf {
        self.dev_root.join("nvidia0")
    }
}

/// First DRM render node in `dir`, if any.
fn first_render_node(dir: &Path) -> Result<Option<String>, ProbeError> {
    let mut nodes: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("renderD"))
        .collect();
    nodes.sort();
    Ok(nodes.into_iter().next())
}

#[async_trait]
impl AcceleratorHost for SystemHost {
    fn has_interface(&self) -> bool {
        self.dri_dir().is_dir() || self.nvidia_node().exists() || cuda_driver_present()
    }

    async fn request_adapter(&self) -> Result<Option<AdapterInfo>, ProbeError> {
        // A CUDA driver failure still leaves the device nodes to try.
        #[cfg(feature = "cuda")]
        match request_cuda_adapter() {
            Ok(Some(adapter)) => return Ok(Some(adapter)),
            Ok(None) => debug!("CUDA driver reports no devices"),
            Err(e) => debug!("CUDA driver unavailable: {e}"),
        }

        if self.nvidia_node().exists() {
            return Ok(Some(AdapterInfo {
                name: self.nvidia_node().display().to_string(),
                backend: "nvidia".to_string(),
            }));
        }

        let dir = self.dri_dir();
        if !dir.is_dir() {
            return Ok(None);
        }
        let node = tokio::task::spawn_blocking(move || first_render_node(&dir))
            .await
            .map_err(|e| ProbeError::CapabilityUnavailable(e.to_string()))??;
        debug!(node = ?node, "Scanned DRM render nodes");

        Ok(node.map(|name| AdapterInfo {
            name,
            backend: "drm".to_string(),
        }))
    }
}

#[cfg(feature = "cuda")]
fn cuda_driver_present() -> bool {
    cudarc::driver::result::init().is_ok()
}

#[cfg(not(feature = "cuda"))]
fn cuda_driver_present() -> bool {
    false
}

#[cfg(feature = "cuda")]
fn request_cuda_adapter() -> Result<Option<AdapterInfo>, ProbeError> {
    use cudarc::driver::result;

    result::init().map_err(|e| ProbeError::CapabilityUnavailable(e.to_string()))?;
    let count = result::device::get_count()
        .map_err(|e| ProbeError::CapabilityUnavailable(e.to_string()))?;
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(AdapterInfo {
        name: "cuda:0".to_string(),
        backend: "cuda".to_string(),
    }))
}
