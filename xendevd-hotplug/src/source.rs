//! Where a device's attributes come from and where its outcome goes.
//!
//! Store-backend devices read their attributes from, and report status to,
//! their directory in the configuration store. Direct-attribute devices
//! carry everything in the hotplug event itself and have no store entry,
//! so their outcome is only logged.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::Result;
use crate::store::{key_path, keys, Store};

/// Message used when a failure carries no description of its own.
const GENERIC_FAILURE: &str = "hotplug operation failed";

/// Terminal outcome of an online/offline attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugStatus {
    Connected,
    Error(String),
}

impl HotplugStatus {
    /// Build an error status, never with an empty message.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            Self::Error(GENERIC_FAILURE.to_string())
        } else {
            Self::Error(message)
        }
    }
}

/// Lookup of a device attribute by name.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Option<String>>;
}

/// Destination for a device's terminal status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, status: &HotplugStatus) -> Result<()>;
}

/// A device directory in the configuration store.
#[derive(Clone)]
pub struct StoreDevice {
    store: Arc<dyn Store>,
    base_path: String,
}

impl StoreDevice {
    pub fn new(store: Arc<dyn Store>, base_path: impl Into<String>) -> Self {
        Self {
            store,
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub async fn read(&self, key: &str) -> Result<Option<String>> {
        self.store.read(&key_path(&self.base_path, key)).await
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.store.write(&key_path(&self.base_path, key), value).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.remove(&key_path(&self.base_path, key)).await
    }
}

#[async_trait]
impl AttributeSource for StoreDevice {
    async fn lookup(&self, name: &str) -> Result<Option<String>> {
        self.read(name).await
    }
}

#[async_trait]
impl StatusSink for StoreDevice {
    /// The toolstack watches `hotplug-status`, so it is always written
    /// last: the error key is already in place (or gone) when it fires.
    async fn report(&self, status: &HotplugStatus) -> Result<()> {
        match status {
            HotplugStatus::Connected => {
                self.remove(keys::HOTPLUG_ERROR).await?;
                self.write(keys::HOTPLUG_STATUS, "connected").await
            }
            HotplugStatus::Error(message) => {
                let message = if message.trim().is_empty() { GENERIC_FAILURE } else { message.as_str() };
                self.write(keys::HOTPLUG_ERROR, message).await?;
                self.write(keys::HOTPLUG_STATUS, "error").await
            }
        }
    }
}

/// Attributes delivered directly with a hotplug event.
#[derive(Debug, Clone, Default)]
pub struct EventAttributes {
    device: String,
    attributes: BTreeMap<String, String>,
}

impl EventAttributes {
    pub fn new(device: impl Into<String>, attributes: BTreeMap<String, String>) -> Self {
        Self {
            device: device.into(),
            attributes,
        }
    }
}

#[async_trait]
impl AttributeSource for EventAttributes {
    async fn lookup(&self, name: &str) -> Result<Option<String>> {
        Ok(self.attributes.get(name).cloned())
    }
}

#[async_trait]
impl StatusSink for EventAttributes {
    async fn report(&self, status: &HotplugStatus) -> Result<()> {
        match status {
            HotplugStatus::Connected => info!(device = %self.device, "hotplug-status: connected"),
            HotplugStatus::Error(message) => {
                error!(device = %self.device, error = %message, "hotplug-status: error")
            }
        }
        Ok(())
    }
}
