//! Buffer manager configuration.
//!
//! Defaults suit a client process on a system without dma-buf sync support.
//! Every field can be overridden programmatically or from the environment:
//!
//! | Variable | Field | Values |
//! |---|---|---|
//! | `BUFMGR_COHERENCY` | `coherency` | `auto`, `hardware-fence`, `software` |
//! | `BUFMGR_ROLE` | `role` | `display-server`, `client` |
//! | `BUFMGR_DEVICE` | `device_path` | path to a DRM node |
//! | `BUFMGR_STORE` | `store_path` | path of the coherency store file |
//! | `BUFMGR_STORE_CAPACITY` | `store_capacity` | slot count |

use crate::coherency::{CoherencyMode, DEFAULT_CAPACITY};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Kernel switch that reports dma-buf sync (hardware fence) support.
pub const DMABUF_SYNC_PARAM: &str = "/sys/module/dmabuf_sync/parameters/enabled";

/// Primary DRM node, used by the display server.
pub const PRIMARY_NODE: &str = "/dev/dri/card0";

/// Render DRM node, preferred by clients.
pub const RENDER_NODE: &str = "/dev/dri/renderD128";

/// Requested coherency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoherencySetting {
    /// Use hardware fences when the kernel supports them.
    #[default]
    Auto,
    /// Force hardware-fence mode.
    HardwareFence,
    /// Force software cache tracking.
    SoftwareTracked,
}

impl CoherencySetting {
    /// Resolve against the running kernel.
    pub fn resolve(&self) -> CoherencyMode {
        self.resolve_with(Path::new(DMABUF_SYNC_PARAM))
    }

    /// Resolve `Auto` by reading `param` instead of the sysfs default.
    pub fn resolve_with(&self, param: &Path) -> CoherencyMode {
        match self {
            CoherencySetting::HardwareFence => CoherencyMode::HardwareFence,
            CoherencySetting::SoftwareTracked => CoherencyMode::SoftwareTracked,
            CoherencySetting::Auto => match std::fs::read(param) {
                Ok(contents) if contents.first() == Some(&b'1') => CoherencyMode::HardwareFence,
                Ok(_) => CoherencyMode::SoftwareTracked,
                Err(e) => {
                    tracing::debug!(path = %param.display(), "dma-buf sync unavailable: {}", e);
                    CoherencyMode::SoftwareTracked
                }
            },
        }
    }
}

impl std::str::FromStr for CoherencySetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CoherencySetting::Auto),
            "hardware-fence" | "hardware" | "fence" => Ok(CoherencySetting::HardwareFence),
            "software" | "software-tracked" => Ok(CoherencySetting::SoftwareTracked),
            other => Err(Error::InvalidArgument(format!(
                "unknown coherency mode '{other}'"
            ))),
        }
    }
}

/// Whether this process owns the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    /// The privileged process driving the display (DRM master).
    DisplayServer,
    /// Any other process.
    #[default]
    Client,
}

impl std::str::FromStr for ProcessRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "display-server" | "server" | "master" => Ok(ProcessRole::DisplayServer),
            "client" => Ok(ProcessRole::Client),
            other => Err(Error::InvalidArgument(format!("unknown process role '{other}'"))),
        }
    }
}

/// Configuration for a [`BufferManager`](crate::manager::BufferManager).
///
/// # Example
///
/// ```rust,ignore
/// use bufmgr::config::{BufMgrConfig, CoherencySetting};
///
/// let config = BufMgrConfig::from_env()?
///     .with_coherency(CoherencySetting::SoftwareTracked);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufMgrConfig {
    /// Coherency mode request.
    pub coherency: CoherencySetting,
    /// Process role, which picks the default DRM node.
    pub role: ProcessRole,
    /// Explicit DRM node; overrides the role default.
    pub device_path: Option<PathBuf>,
    /// Coherency store file; `None` means a private anonymous store.
    pub store_path: Option<PathBuf>,
    /// Slot count used when the store is created.
    pub store_capacity: u32,
}

impl Default for BufMgrConfig {
    fn default() -> Self {
        Self {
            coherency: CoherencySetting::Auto,
            role: ProcessRole::Client,
            device_path: None,
            store_path: None,
            store_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl BufMgrConfig {
    /// Defaults overridden by `BUFMGR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup("BUFMGR_COHERENCY") {
            config.coherency = value.parse()?;
        }
        if let Some(value) = lookup("BUFMGR_ROLE") {
            config.role = value.parse()?;
        }
        if let Some(value) = lookup("BUFMGR_DEVICE").filter(|v| !v.is_empty()) {
            config.device_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("BUFMGR_STORE").filter(|v| !v.is_empty()) {
            config.store_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("BUFMGR_STORE_CAPACITY") {
            config.store_capacity = value.trim().parse().map_err(|e| {
                Error::InvalidArgument(format!("BUFMGR_STORE_CAPACITY '{value}': {e}"))
            })?;
            if config.store_capacity == 0 {
                return Err(Error::InvalidArgument(
                    "BUFMGR_STORE_CAPACITY must be > 0".into(),
                ));
            }
        }

        Ok(config)
    }

    /// Set the coherency mode request.
    pub fn with_coherency(mut self, coherency: CoherencySetting) -> Self {
        self.coherency = coherency;
        self
    }

    /// Set the process role.
    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }

    /// Use a specific DRM node.
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_path = Some(path.into());
        self
    }

    /// Use a file-backed coherency store.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Set the store capacity.
    pub fn with_store_capacity(mut self, capacity: u32) -> Self {
        self.store_capacity = capacity;
        self
    }

    /// The DRM node to open.
    pub fn resolve_device_path(&self) -> PathBuf {
        if let Some(path) = &self.device_path {
            return path.clone();
        }
        match self.role {
            ProcessRole::DisplayServer => PathBuf::from(PRIMARY_NODE),
            ProcessRole::Client if Path::new(RENDER_NODE).exists() => PathBuf::from(RENDER_NODE),
            ProcessRole::Client => PathBuf::from(PRIMARY_NODE),
        }
    }
}
