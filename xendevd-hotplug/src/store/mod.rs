//! Configuration store access.
//!
//! The store is the hierarchical key-value service shared with the
//! toolstack. Every backend device owns a directory (its base path) holding
//! one flat key per attribute:
//!
//! ```text
//! backend/vbd/3/51712/
//!   ├── type              phy | file
//!   ├── params            /var/lib/images/disk0.img
//!   ├── mode              r | w
//!   ├── node              /dev/loop3          (file-backed only)
//!   ├── physical-device   7:3                 (hex major:minor)
//!   ├── hotplug-status    connected | error
//!   └── hotplug-error     <message>
//! ```

mod xenstore;

use async_trait::async_trait;

use crate::error::Result;

pub use xenstore::{XenStore, DEFAULT_XENSTORED_SOCKET};

/// Key names under a device's base path.
pub mod keys {
    pub const BRIDGE: &str = "bridge";
    pub const TYPE: &str = "type";
    pub const PARAMS: &str = "params";
    pub const MODE: &str = "mode";
    pub const NODE: &str = "node";
    pub const PHYSICAL_DEVICE: &str = "physical-device";
    pub const HOTPLUG_STATUS: &str = "hotplug-status";
    pub const HOTPLUG_ERROR: &str = "hotplug-error";
}

/// Store connection capability.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. A missing key is `Ok(None)`.
    async fn read(&self, path: &str) -> Result<Option<String>>;

    /// Write a key, creating it if needed.
    async fn write(&self, path: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key succeeds.
    async fn remove(&self, path: &str) -> Result<()>;
}

/// Join a device base path and a key name.
pub fn key_path(base_path: &str, key: &str) -> String {
    format!("{}/{}", base_path.trim_end_matches('/'), key)
}
