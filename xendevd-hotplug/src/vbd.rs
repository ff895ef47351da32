//! Virtual block device hotplug.
//!
//! Publishes the physical backing of a store-backed VBD: `phy` devices are
//! published as they are, `file` devices are first bound to a free loop
//! device whose node is recorded under `node` so that offline can find it
//! again without local state.
//!
//! Every failure converges on one reporting step (`hotplug-error` then
//! `hotplug-status = error`). Success is signalled by `physical-device`
//! with no `hotplug-error`; no `connected` status is written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{HotplugError, Result};
use crate::identity::{require_regular_file, DeviceIdentity};
use crate::loopdev::{LoopDevices, LoopMode};
use crate::source::{HotplugStatus, StatusSink, StoreDevice};
use crate::store::keys;

/// Default store key holding the toolstack origin tag.
pub const DEFAULT_ORIGIN_KEY: &str = "toolstack";

/// Which device records this daemon acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipGate {
    pub key: String,
    /// Required origin tag. `None` admits every record.
    pub tag: Option<String>,
}

impl OwnershipGate {
    pub fn open() -> Self {
        Self {
            key: DEFAULT_ORIGIN_KEY.to_string(),
            tag: None,
        }
    }

    pub fn requiring(key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tag: Some(tag.into()),
        }
    }

    fn admits(&self, record: &DeviceRecord) -> bool {
        match &self.tag {
            None => true,
            Some(tag) => record.origin.as_deref() == Some(tag.as_str()),
        }
    }
}

impl Default for OwnershipGate {
    fn default() -> Self {
        Self::open()
    }
}

/// A VBD's store record, read fresh for every action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub subtype: Option<String>,
    pub params: Option<String>,
    pub mode: Option<String>,
    pub origin: Option<String>,
    pub node: Option<String>,
}

impl DeviceRecord {
    pub async fn read(device: &StoreDevice, origin_key: &str) -> Result<Self> {
        Ok(Self {
            subtype: device.read(keys::TYPE).await?,
            params: device.read(keys::PARAMS).await?,
            mode: device.read(keys::MODE).await?,
            origin: device.read(origin_key).await?,
            node: device.read(keys::NODE).await?,
        })
    }

    fn subtype(&self) -> Result<&str> {
        required(self.subtype.as_deref(), keys::TYPE)
    }

    fn params(&self) -> Result<&Path> {
        required(self.params.as_deref(), keys::PARAMS).map(Path::new)
    }

    fn mode(&self) -> LoopMode {
        LoopMode::from_tag(self.mode.as_deref().unwrap_or_default())
    }
}

fn required<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HotplugError::Configuration(format!("Unable to read {} from xenstore", key)))
}

fn not_implemented(subtype: &str) -> HotplugError {
    HotplugError::NotImplemented(format!("vbd type '{}'", subtype))
}

/// VBD online/offline handler.
#[derive(Clone)]
pub struct VbdHotplug {
    loops: Arc<dyn LoopDevices>,
    identity: Arc<dyn DeviceIdentity>,
    gate: OwnershipGate,
}

impl VbdHotplug {
    pub fn new(loops: Arc<dyn LoopDevices>, identity: Arc<dyn DeviceIdentity>, gate: OwnershipGate) -> Self {
        Self { loops, identity, gate }
    }

    /// Publish the device's physical backing.
    ///
    /// The returned error is only ever a failure to talk to the store.
    #[instrument(skip_all, fields(xb_path = %device.base_path()))]
    pub async fn online(&self, device: &StoreDevice) -> Result<()> {
        let record = match DeviceRecord::read(device, &self.gate.key).await {
            Ok(record) => record,
            Err(e) => return self.fail(device, e).await,
        };
        if !self.gate.admits(&record) {
            debug!(origin = ?record.origin, "Device not owned by this toolstack, ignoring");
            return Ok(());
        }

        match self.publish(device, &record).await {
            Ok(()) => {
                info!("Block device online");
                // A published device with no status keys is success; clear
                // whatever an earlier failed attempt left behind.
                device.remove(keys::HOTPLUG_STATUS).await?;
                device.remove(keys::HOTPLUG_ERROR).await
            }
            Err(e) => self.fail(device, e).await,
        }
    }

    /// Release what online acquired.
    #[instrument(skip_all, fields(xb_path = %device.base_path()))]
    pub async fn offline(&self, device: &StoreDevice) -> Result<()> {
        let record = match DeviceRecord::read(device, &self.gate.key).await {
            Ok(record) => record,
            Err(e) => return self.fail(device, e).await,
        };
        if !self.gate.admits(&record) {
            debug!(origin = ?record.origin, "Device not owned by this toolstack, ignoring");
            return Ok(());
        }

        match self.retract(device, &record).await {
            Ok(()) => {
                info!("Block device offline");
                Ok(())
            }
            Err(e) => self.fail(device, e).await,
        }
    }

    async fn publish(&self, device: &StoreDevice, record: &DeviceRecord) -> Result<()> {
        match record.subtype()? {
            "phy" => self.publish_physical(device, record.params()?).await,
            "file" => {
                let file = record.params()?;
                require_regular_file(file)?;

                let loop_device = self.loops.next_available_device()?;
                let binding = self.loops.bind(&loop_device, file, record.mode())?;
                device.write(keys::NODE, &binding.device.to_string_lossy()).await?;

                self.publish_physical(device, &binding.device).await
            }
            other => Err(not_implemented(other)),
        }
    }

    async fn publish_physical(&self, device: &StoreDevice, node: &Path) -> Result<()> {
        let (major, minor) = self.identity.device_number(node)?;
        let physical = format!("{:x}:{:x}", major, minor);
        debug!(node = %node.display(), physical = %physical, "Publishing physical device");
        device.write(keys::PHYSICAL_DEVICE, &physical).await
    }

    async fn retract(&self, device: &StoreDevice, record: &DeviceRecord) -> Result<()> {
        match record.subtype()? {
            "phy" => Ok(()),
            "file" => {
                let node = PathBuf::from(required(record.node.as_deref(), keys::NODE)?);
                self.identity.device_number(&node)?;
                self.loops.unbind(&node)?;
                device.remove(keys::NODE).await
            }
            other => Err(not_implemented(other)),
        }
    }

    async fn fail(&self, device: &StoreDevice, err: HotplugError) -> Result<()> {
        warn!(error = %err, "Block device hotplug failed");
        device.report(&HotplugStatus::error(err.to_string())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryStore, MockLoopDevices};

    const XB_PATH: &str = "backend/vbd/3/51712";

    fn setup(free: u32, gate: OwnershipGate) -> (Arc<MemoryStore>, Arc<MockLoopDevices>, StoreDevice, VbdHotplug) {
        let store = Arc::new(MemoryStore::new());
        let loops = Arc::new(MockLoopDevices::new(free));
        let device = StoreDevice::new(store.clone(), XB_PATH);
        let vbd = VbdHotplug::new(loops.clone(), loops.clone(), gate);
        (store, loops, device, vbd)
    }

    fn key(name: &str) -> String {
        format!("{}/{}", XB_PATH, name)
    }

    #[tokio::test]
    async fn test_file_online_binds_loop_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let (store, loops, device, vbd) = setup(2, OwnershipGate::open());
        store.insert(&key("type"), "file");
        store.insert(&key("params"), image.to_str().unwrap());
        store.insert(&key("mode"), "r");

        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("node")).as_deref(), Some("/dev/loop0"));
        assert_eq!(store.get(&key("physical-device")).as_deref(), Some("7:0"));
        assert_eq!(store.get(&key("hotplug-error")), None);
        assert_eq!(store.get(&key("hotplug-status")), None);
        assert_eq!(loops.binding_of(Path::new("/dev/loop0")).unwrap().mode, LoopMode::ReadOnly);
    }

    #[tokio::test]
    async fn test_file_online_without_free_loop_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.img");
        std::fs::write(&image, b"").unwrap();

        let (store, _loops, device, vbd) = setup(0, OwnershipGate::open());
        store.insert(&key("type"), "file");
        store.insert(&key("params"), image.to_str().unwrap());
        store.insert(&key("mode"), "r");

        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        let message = store.get(&key("hotplug-error")).unwrap();
        assert!(message.contains("allocate loop device"), "{}", message);
        assert_eq!(store.get(&key("node")), None);
        assert_eq!(store.get(&key("physical-device")), None);
    }

    #[tokio::test]
    async fn test_phy_online_requires_block_device() {
        let dir = tempfile::tempdir().unwrap();
        let not_block = dir.path().join("disk.img");
        std::fs::write(&not_block, b"").unwrap();

        let (store, loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "phy");
        store.insert(&key("params"), not_block.to_str().unwrap());

        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        assert_eq!(
            store.get(&key("hotplug-error")),
            Some(format!("{} is not a block device.", not_block.display()))
        );

        loops.add_block_device("/dev/xvda", 202, 0);
        store.insert(&key("params"), "/dev/xvda");
        vbd.online(&device).await.unwrap();
        assert_eq!(store.get(&key("physical-device")).as_deref(), Some("ca:0"));
        assert_eq!(store.get(&key("hotplug-error")), None);
        assert_eq!(store.get(&key("hotplug-status")), None);
    }

    #[tokio::test]
    async fn test_file_online_retry_clears_failure() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");

        let (store, _loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "file");
        store.insert(&key("params"), image.to_str().unwrap());

        vbd.online(&device).await.unwrap();
        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        assert_eq!(
            store.get(&key("hotplug-error")),
            Some(format!("{} does not exist.", image.display()))
        );

        std::fs::write(&image, b"").unwrap();
        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("physical-device")).as_deref(), Some("7:0"));
        assert_eq!(store.get(&key("hotplug-status")), None);
        assert_eq!(store.get(&key("hotplug-error")), None);
    }

    #[tokio::test]
    async fn test_unsupported_subtype() {
        let (store, _loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "nbd");
        store.insert(&key("params"), "nbd://host/export");

        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        assert_eq!(store.get(&key("hotplug-error")).as_deref(), Some("vbd type 'nbd' not implemented"));

        store.remove_key(&key("hotplug-status"));
        vbd.offline(&device).await.unwrap();
        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_missing_params() {
        let (store, _loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "file");

        vbd.online(&device).await.unwrap();

        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        assert_eq!(
            store.get(&key("hotplug-error")).as_deref(),
            Some("Unable to read params from xenstore")
        );
    }

    #[tokio::test]
    async fn test_ownership_gate() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.img");
        std::fs::write(&image, b"").unwrap();

        let (store, loops, device, vbd) = setup(1, OwnershipGate::requiring("toolstack", "xapi"));
        store.insert(&key("type"), "file");
        store.insert(&key("params"), image.to_str().unwrap());

        vbd.online(&device).await.unwrap();
        assert_eq!(store.get(&key("node")), None);
        assert_eq!(store.get(&key("hotplug-status")), None);

        store.insert(&key("toolstack"), "xl");
        vbd.online(&device).await.unwrap();
        assert_eq!(store.get(&key("node")), None);

        store.insert(&key("toolstack"), "xapi");
        vbd.online(&device).await.unwrap();
        assert_eq!(store.get(&key("node")).as_deref(), Some("/dev/loop0"));
        assert!(loops.binding_of(Path::new("/dev/loop0")).is_some());
    }

    #[tokio::test]
    async fn test_file_offline_unbinds() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.img");
        std::fs::write(&image, b"").unwrap();

        let (store, loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "file");
        store.insert(&key("params"), image.to_str().unwrap());
        store.insert(&key("mode"), "w");

        vbd.online(&device).await.unwrap();
        assert_eq!(loops.backing_file(7, 0).unwrap(), Some(image.clone()));

        vbd.offline(&device).await.unwrap();
        assert_eq!(loops.backing_file(7, 0).unwrap(), None);
        assert_eq!(store.get(&key("node")), None);
        assert_eq!(store.get(&key("hotplug-status")), None);
    }

    #[tokio::test]
    async fn test_file_offline_without_node() {
        let (store, _loops, device, vbd) = setup(1, OwnershipGate::open());
        store.insert(&key("type"), "file");
        store.insert(&key("params"), "/tmp/a.img");

        vbd.offline(&device).await.unwrap();

        assert_eq!(store.get(&key("hotplug-status")).as_deref(), Some("error"));
        assert_eq!(store.get(&key("hotplug-error")).as_deref(), Some("Unable to read node from xenstore"));
    }
}
