//! Routing of classified operations to their handlers.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::classify::{Operation, Transition};
use crate::error::Result;
use crate::event::VIF;
use crate::source::{EventAttributes, StoreDevice};
use crate::store::Store;
use crate::vbd::VbdHotplug;
use crate::vif::VifHotplug;

/// Runs one operation to completion against the matching handler.
#[derive(Clone)]
pub struct HotplugRouter {
    store: Arc<dyn Store>,
    vif: VifHotplug,
    vbd: VbdHotplug,
}

impl HotplugRouter {
    pub fn new(store: Arc<dyn Store>, vif: VifHotplug, vbd: VbdHotplug) -> Self {
        Self { store, vif, vbd }
    }

    /// Handle one operation.
    ///
    /// Device failures end up in the device's status; an error here means
    /// the outcome could not be reported.
    #[instrument(skip_all, fields(transition = ?operation.transition()))]
    pub async fn route(&self, operation: Operation) -> Result<()> {
        match operation {
            Operation::VifStore { transition, xb_path, vif } => {
                debug!(xb_path = %xb_path, "Store-backed vif");
                let device = StoreDevice::new(self.store.clone(), xb_path);
                match transition {
                    Transition::Online => self.vif.online(&device, vif.as_deref()).await,
                    Transition::Offline => self.vif.offline(&device, vif.as_deref()).await,
                }
            }
            Operation::VbdStore { transition, xb_path } => {
                debug!(xb_path = %xb_path, "Store-backed vbd");
                let device = StoreDevice::new(self.store.clone(), xb_path);
                match transition {
                    Transition::Online => self.vbd.online(&device).await,
                    Transition::Offline => self.vbd.offline(&device).await,
                }
            }
            Operation::VifDirect { transition, device, attributes } => {
                debug!(device = %device, "Direct vif");
                let vif = attributes.get(VIF).cloned();
                let source = EventAttributes::new(device, attributes);
                match transition {
                    Transition::Online => self.vif.online(&source, vif.as_deref()).await,
                    Transition::Offline => self.vif.offline(&source, vif.as_deref()).await,
                }
            }
        }
    }
}
