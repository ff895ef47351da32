//! # xendevd hotplug
//!
//! Host-side handling of Xen backend devices.
//!
//! ## Architecture
//!
//! ```text
//!  kernel uevent ──► HotplugEvent ──► classify() ──► Operation
//!                                                       │
//!                              ┌────────────────────────┴──────┐
//!                              ▼                               ▼
//!                        VifHotplug                       VbdHotplug
//!                     (NetworkOps + source)       (LoopDevices + DeviceIdentity)
//!                              │                               │
//!                              └──────────► Store ◄────────────┘
//!                                 hotplug-status / hotplug-error
//! ```
//!
//! Every host capability (store, network, loop devices, device identity)
//! is a trait with a real implementation and an in-memory one in [`mock`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xendevd_hotplug::{IoctlNetwork, StoreDevice, VifHotplug, XenStore};
//!
//! let store = Arc::new(XenStore::connect("/var/run/xenstored/socket").await?);
//! let vif = VifHotplug::new(Arc::new(IoctlNetwork::new()));
//! vif.online(&StoreDevice::new(store, "backend/vif/3/0"), Some("vif3.0")).await?;
//! ```

pub mod classify;
pub mod error;
pub mod event;
pub mod identity;
pub mod loopdev;
pub mod mock;
pub mod network;
pub mod router;
pub mod source;
pub mod store;
pub mod vbd;
pub mod vif;

pub use classify::{classify, Operation, Transition, DIRECT_BACKEND, STORE_BACKEND};
pub use error::{HotplugError, Result};
pub use event::HotplugEvent;
pub use identity::{block_device_number, require_regular_file, DeviceIdentity, DeviceResolver};
pub use loopdev::{LoopBinding, LoopDeviceManager, LoopDevices, LoopMode, DEFAULT_LOOP_CONTROL};
pub use network::{IoctlNetwork, NetworkOps};
pub use router::HotplugRouter;
pub use source::{AttributeSource, EventAttributes, HotplugStatus, StatusSink, StoreDevice};
pub use store::{Store, XenStore, DEFAULT_XENSTORED_SOCKET};
pub use vbd::{DeviceRecord, OwnershipGate, VbdHotplug, DEFAULT_ORIGIN_KEY};
pub use vif::VifHotplug;
