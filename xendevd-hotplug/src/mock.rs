//! In-memory capabilities for testing and development.
//!
//! These simulate the store, the host network stack and the loop
//! subsystem without requiring xenstored or root privileges. Useful for:
//! - Unit and integration testing of the hotplug handlers
//! - Exercising the protocol server without touching real loop devices

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HotplugError, Result};
use crate::identity::{block_device_number, DeviceIdentity};
use crate::loopdev::{LoopBinding, LoopDevices, LoopMode};
use crate::network::NetworkOps;
use crate::store::Store;

/// Major number of loop devices.
pub const LOOP_MAJOR: u32 = 7;

fn poisoned() -> HotplugError {
    HotplugError::Store("Lock poisoned".to_string())
}

fn os_error(context: impl Into<String>, errno: i32) -> HotplugError {
    HotplugError::resource(context, std::io::Error::from_raw_os_error(errno))
}

/// Store held in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key.
    pub fn insert(&self, path: &str, value: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(path.to_string(), value.to_string());
        }
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.entries.read().ok()?.get(path).cloned()
    }

    pub fn remove_key(&self, path: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(path);
        }
    }

    /// All keys under `prefix`.
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(path).cloned())
    }

    async fn write(&self, path: &str, value: &str) -> Result<()> {
        debug!(path = %path, value = %value, "Mock store write");
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(path);
        Ok(())
    }
}

/// A call made against [`MockNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCall {
    AddToBridge(String, String),
    RemoveFromBridge(String, String),
    Up(String),
    Down(String),
}

#[derive(Debug, Default)]
struct NetworkState {
    calls: Vec<NetworkCall>,
    members: BTreeSet<(String, String)>,
    up: BTreeSet<String>,
    fail_errno: Option<i32>,
}

/// Network stack that records calls and tracks link and bridge state.
#[derive(Debug, Default)]
pub struct MockNetwork {
    state: RwLock<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with `errno`.
    pub fn fail_with(&self, errno: i32) {
        if let Ok(mut state) = self.state.write() {
            state.fail_errno = Some(errno);
        }
    }

    pub fn calls(&self) -> Vec<NetworkCall> {
        self.state.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn is_up(&self, iface: &str) -> bool {
        self.state.read().map(|s| s.up.contains(iface)).unwrap_or(false)
    }

    pub fn is_bridge_member(&self, bridge: &str, iface: &str) -> bool {
        self.state
            .read()
            .map(|s| s.members.contains(&(bridge.to_string(), iface.to_string())))
            .unwrap_or(false)
    }

    fn apply(&self, call: NetworkCall) -> Result<()> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.calls.push(call.clone());

        if let Some(errno) = state.fail_errno {
            return Err(os_error(format!("{:?}", call), errno));
        }

        match call {
            NetworkCall::AddToBridge(bridge, iface) => {
                state.members.insert((bridge, iface));
            }
            NetworkCall::RemoveFromBridge(bridge, iface) => {
                if !state.members.remove(&(bridge.clone(), iface.clone())) {
                    return Err(os_error(format!("{} is not a port of {}", iface, bridge), libc::EINVAL));
                }
            }
            NetworkCall::Up(iface) => {
                state.up.insert(iface);
            }
            NetworkCall::Down(iface) => {
                state.up.remove(&iface);
            }
        }
        Ok(())
    }
}

impl NetworkOps for MockNetwork {
    fn bridge_add_interface(&self, bridge: &str, iface: &str) -> Result<()> {
        self.apply(NetworkCall::AddToBridge(bridge.to_string(), iface.to_string()))
    }

    fn bridge_remove_interface(&self, bridge: &str, iface: &str) -> Result<()> {
        self.apply(NetworkCall::RemoveFromBridge(bridge.to_string(), iface.to_string()))
    }

    fn set_interface_up(&self, iface: &str) -> Result<()> {
        self.apply(NetworkCall::Up(iface.to_string()))
    }

    fn set_interface_down(&self, iface: &str) -> Result<()> {
        self.apply(NetworkCall::Down(iface.to_string()))
    }
}

#[derive(Debug, Default)]
struct LoopState {
    bound: BTreeMap<u32, LoopBinding>,
    block_devices: BTreeMap<PathBuf, (u32, u32)>,
}

/// Loop subsystem with a fixed number of devices `/dev/loop0..N`.
///
/// Also answers identity queries the way the kernel would for those
/// devices and for any extra block devices registered with
/// [`MockLoopDevices::add_block_device`]. Other paths are stat'ed.
#[derive(Debug)]
pub struct MockLoopDevices {
    count: u32,
    state: RwLock<LoopState>,
}

impl MockLoopDevices {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            state: RwLock::new(LoopState::default()),
        }
    }

    /// Register a non-loop block device node.
    pub fn add_block_device(&self, node: impl Into<PathBuf>, major: u32, minor: u32) {
        if let Ok(mut state) = self.state.write() {
            state.block_devices.insert(node.into(), (major, minor));
        }
    }

    pub fn binding_of(&self, device: &Path) -> Option<LoopBinding> {
        let minor = self.loop_minor(device)?;
        self.state.read().ok()?.bound.get(&minor).cloned()
    }

    pub fn bound_count(&self) -> usize {
        self.state.read().map(|s| s.bound.len()).unwrap_or(0)
    }

    fn loop_minor(&self, device: &Path) -> Option<u32> {
        let minor: u32 = device.to_str()?.strip_prefix("/dev/loop")?.parse().ok()?;
        (minor < self.count).then_some(minor)
    }

    fn require_loop(&self, device: &Path) -> Result<u32> {
        self.loop_minor(device)
            .ok_or_else(|| os_error(format!("Failed to open {}", device.display()), libc::ENOENT))
    }
}

impl LoopDevices for MockLoopDevices {
    fn next_available_device(&self) -> Result<PathBuf> {
        let state = self.state.read().map_err(|_| poisoned())?;
        (0..self.count)
            .find(|minor| !state.bound.contains_key(minor))
            .map(|minor| PathBuf::from(format!("/dev/loop{}", minor)))
            .ok_or_else(|| os_error("Failed to allocate loop device", libc::ENOSPC))
    }

    fn bind(&self, device: &Path, file: &Path, mode: LoopMode) -> Result<LoopBinding> {
        let minor = self.require_loop(device)?;
        if !file.exists() {
            return Err(os_error(format!("Failed to open {}", file.display()), libc::ENOENT));
        }

        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.bound.contains_key(&minor) {
            return Err(os_error(
                format!("Failed to bind {} to {}", device.display(), file.display()),
                libc::EBUSY,
            ));
        }

        let binding = LoopBinding {
            device: device.to_path_buf(),
            file: file.to_path_buf(),
            mode,
        };
        state.bound.insert(minor, binding.clone());
        Ok(binding)
    }

    fn unbind(&self, device: &Path) -> Result<()> {
        let minor = self.require_loop(device)?;
        let mut state = self.state.write().map_err(|_| poisoned())?;
        state
            .bound
            .remove(&minor)
            .map(|_| ())
            .ok_or_else(|| os_error(format!("Failed to unbind {}", device.display()), libc::ENXIO))
    }
}

impl DeviceIdentity for MockLoopDevices {
    fn device_number(&self, node: &Path) -> Result<(u32, u32)> {
        if let Some(minor) = self.loop_minor(node) {
            return Ok((LOOP_MAJOR, minor));
        }
        let state = self.state.read().map_err(|_| poisoned())?;
        match state.block_devices.get(node) {
            Some(devno) => Ok(*devno),
            None => block_device_number(node),
        }
    }

    fn resolve(&self, major: u32, minor: u32) -> Result<PathBuf> {
        if major == LOOP_MAJOR && minor < self.count {
            return Ok(PathBuf::from(format!("/dev/loop{}", minor)));
        }
        let state = self.state.read().map_err(|_| poisoned())?;
        state
            .block_devices
            .iter()
            .find(|(_, devno)| **devno == (major, minor))
            .map(|(node, _)| node.clone())
            .ok_or(HotplugError::DeviceNotFound { major, minor })
    }

    fn backing_file(&self, major: u32, minor: u32) -> Result<Option<PathBuf>> {
        if major != LOOP_MAJOR {
            return Ok(None);
        }
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.bound.get(&minor).map(|b| b.file.clone()))
    }
}
