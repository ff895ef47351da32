//! Virtual network interface hotplug.
//!
//! Online attaches the interface to its bridge and then brings it up;
//! offline brings it down and then detaches it. A failing step stops the
//! sequence and is reported; steps that already succeeded are left in
//! place.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::classify::Transition;
use crate::error::{HotplugError, Result};
use crate::event::BRIDGE;
use crate::network::NetworkOps;
use crate::source::{AttributeSource, HotplugStatus, StatusSink};

/// VIF online/offline handler.
#[derive(Clone)]
pub struct VifHotplug {
    network: Arc<dyn NetworkOps>,
}

impl VifHotplug {
    pub fn new(network: Arc<dyn NetworkOps>) -> Self {
        Self { network }
    }

    /// Attach `vif` to its bridge and bring it up.
    ///
    /// The returned error is only ever a failure to report the outcome.
    pub async fn online<D>(&self, device: &D, vif: Option<&str>) -> Result<()>
    where
        D: AttributeSource + StatusSink + ?Sized,
    {
        self.apply(Transition::Online, device, vif).await.map(|_| ())
    }

    /// Bring `vif` down and detach it from its bridge.
    ///
    /// Success leaves the status untouched; failure is reported.
    pub async fn offline<D>(&self, device: &D, vif: Option<&str>) -> Result<()>
    where
        D: AttributeSource + StatusSink + ?Sized,
    {
        self.apply(Transition::Offline, device, vif).await.map(|_| ())
    }

    /// Run one transition and report it.
    ///
    /// Yields the failure that was reported, if any, for callers that
    /// surface it themselves (such as a one-shot helper's exit code).
    #[instrument(skip(self, device))]
    pub async fn apply<D>(
        &self,
        transition: Transition,
        device: &D,
        vif: Option<&str>,
    ) -> Result<Option<HotplugError>>
    where
        D: AttributeSource + StatusSink + ?Sized,
    {
        let outcome = match transition {
            Transition::Online => self.attach(device, vif).await,
            Transition::Offline => self.detach(device, vif).await,
        };

        match (transition, outcome) {
            (Transition::Online, Ok(())) => {
                info!("Interface online");
                device.report(&HotplugStatus::Connected).await?;
                Ok(None)
            }
            (Transition::Offline, Ok(())) => {
                info!("Interface offline");
                Ok(None)
            }
            (transition, Err(e)) => {
                warn!(error = %e, ?transition, "Interface hotplug failed");
                device.report(&HotplugStatus::error(e.to_string())).await?;
                Ok(Some(e))
            }
        }
    }

    async fn attach<D>(&self, device: &D, vif: Option<&str>) -> Result<()>
    where
        D: AttributeSource + ?Sized,
    {
        let vif = require_vif(vif)?;
        let bridge = lookup_bridge(device).await?;

        self.network.bridge_add_interface(&bridge, vif)?;
        self.network.set_interface_up(vif)
    }

    async fn detach<D>(&self, device: &D, vif: Option<&str>) -> Result<()>
    where
        D: AttributeSource + ?Sized,
    {
        let vif = require_vif(vif)?;
        let bridge = lookup_bridge(device).await?;

        self.network.set_interface_down(vif)?;
        self.network.bridge_remove_interface(&bridge, vif)
    }
}

fn require_vif(vif: Option<&str>) -> Result<&str> {
    vif.filter(|v| !v.is_empty())
        .ok_or_else(|| HotplugError::Configuration("Unable to read interface name from event".to_string()))
}

async fn lookup_bridge<D>(device: &D) -> Result<String>
where
    D: AttributeSource + ?Sized,
{
    device
        .lookup(BRIDGE)
        .await?
        .filter(|b| !b.is_empty())
        .ok_or_else(|| HotplugError::Configuration("Unable to read bridge".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryStore, MockNetwork, NetworkCall};
    use crate::source::{EventAttributes, StoreDevice};
    use std::collections::BTreeMap;

    const XB_PATH: &str = "backend/vif/3/0";

    fn setup() -> (Arc<MemoryStore>, Arc<MockNetwork>, StoreDevice, VifHotplug) {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let device = StoreDevice::new(store.clone(), XB_PATH);
        let vif = VifHotplug::new(network.clone());
        (store, network, device, vif)
    }

    #[tokio::test]
    async fn test_online_attaches_then_raises() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");
        store.insert("backend/vif/3/0/hotplug-error", "stale");

        vif.online(&device, Some("vif3.0")).await.unwrap();

        assert_eq!(
            network.calls(),
            vec![
                NetworkCall::AddToBridge("xenbr0".into(), "vif3.0".into()),
                NetworkCall::Up("vif3.0".into()),
            ]
        );
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("connected"));
        assert_eq!(store.get("backend/vif/3/0/hotplug-error"), None);
    }

    #[tokio::test]
    async fn test_online_missing_bridge() {
        let (store, network, device, vif) = setup();

        vif.online(&device, Some("vif3.0")).await.unwrap();

        assert!(network.calls().is_empty());
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("error"));
        assert_eq!(store.get("backend/vif/3/0/hotplug-error").as_deref(), Some("Unable to read bridge"));
    }

    #[tokio::test]
    async fn test_online_stops_at_first_failure() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");
        network.fail_with(libc::ENODEV);

        vif.online(&device, Some("vif3.0")).await.unwrap();

        assert_eq!(network.calls(), vec![NetworkCall::AddToBridge("xenbr0".into(), "vif3.0".into())]);
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("error"));
        assert!(!store.get("backend/vif/3/0/hotplug-error").unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_offline_reverses_online() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");

        vif.online(&device, Some("vif3.0")).await.unwrap();
        vif.offline(&device, Some("vif3.0")).await.unwrap();

        assert_eq!(
            network.calls()[2..],
            [
                NetworkCall::Down("vif3.0".into()),
                NetworkCall::RemoveFromBridge("xenbr0".into(), "vif3.0".into()),
            ]
        );
        assert!(!network.is_up("vif3.0"));
        assert!(!network.is_bridge_member("xenbr0", "vif3.0"));
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("connected"));
    }

    #[tokio::test]
    async fn test_offline_stops_after_failed_down() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");
        vif.online(&device, Some("vif3.0")).await.unwrap();
        network.fail_with(libc::ENODEV);

        vif.offline(&device, Some("vif3.0")).await.unwrap();

        assert_eq!(network.calls()[2..], [NetworkCall::Down("vif3.0".into())]);
        assert!(network.is_bridge_member("xenbr0", "vif3.0"));
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("error"));
        assert!(!store.get("backend/vif/3/0/hotplug-error").unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_offline_reports_failed_detach() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");

        // Never attached, so removal from the bridge fails after the link is down.
        vif.offline(&device, Some("vif3.0")).await.unwrap();

        assert_eq!(
            network.calls(),
            vec![
                NetworkCall::Down("vif3.0".into()),
                NetworkCall::RemoveFromBridge("xenbr0".into(), "vif3.0".into()),
            ]
        );
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("error"));
        let message = store.get("backend/vif/3/0/hotplug-error").unwrap();
        assert!(message.contains("vif3.0 is not a port of xenbr0"), "{}", message);
    }

    #[tokio::test]
    async fn test_offline_missing_interface_name() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");

        vif.offline(&device, None).await.unwrap();

        assert!(network.calls().is_empty());
        assert_eq!(
            store.get("backend/vif/3/0/hotplug-error").as_deref(),
            Some("Unable to read interface name from event")
        );
        assert_eq!(store.get("backend/vif/3/0/hotplug-status").as_deref(), Some("error"));
    }

    fn direct(bridge: Option<&str>) -> EventAttributes {
        let mut attributes = BTreeMap::new();
        if let Some(bridge) = bridge {
            attributes.insert(BRIDGE.to_string(), bridge.to_string());
        }
        EventAttributes::new("vif-5-0", attributes)
    }

    #[tokio::test]
    async fn test_direct_online_and_offline() {
        let (_store, network, _device, vif) = setup();
        let device = direct(Some("xenbr1"));

        vif.online(&device, Some("vif5.0")).await.unwrap();
        assert!(network.is_up("vif5.0"));
        assert!(network.is_bridge_member("xenbr1", "vif5.0"));

        vif.offline(&device, Some("vif5.0")).await.unwrap();
        assert!(!network.is_up("vif5.0"));
        assert!(!network.is_bridge_member("xenbr1", "vif5.0"));
    }

    #[tokio::test]
    async fn test_direct_failures_are_reported_not_returned() {
        let (_store, network, _device, vif) = setup();

        vif.online(&direct(None), Some("vif5.0")).await.unwrap();
        assert!(network.calls().is_empty());

        network.fail_with(libc::EPERM);
        vif.offline(&direct(Some("xenbr1")), Some("vif5.0")).await.unwrap();
        assert_eq!(network.calls(), vec![NetworkCall::Down("vif5.0".into())]);

        let status = HotplugStatus::error("");
        assert_eq!(status, HotplugStatus::Error("hotplug operation failed".into()));
        direct(None).report(&status).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_returns_reported_failure() {
        let (store, network, device, vif) = setup();
        store.insert("backend/vif/3/0/bridge", "xenbr0");

        let outcome = vif.apply(Transition::Online, &device, Some("vif3.0")).await.unwrap();
        assert!(outcome.is_none());

        network.fail_with(libc::ENODEV);
        let err = vif
            .apply(Transition::Offline, &device, Some("vif3.0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.errno(), libc::ENODEV);
        assert_eq!(store.get("backend/vif/3/0/hotplug-error"), Some(err.to_string()));
    }
}
