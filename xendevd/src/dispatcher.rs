//! Event loop and process-lifetime resources.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, instrument, warn};

use xendevd_hotplug::{
    classify, DeviceResolver, HotplugEvent, HotplugRouter, IoctlNetwork, LoopDeviceManager,
    VbdHotplug, VifHotplug, XenStore,
};

use crate::config::Config;
use crate::protocol_server::{DeviceService, ProtocolServer};
use crate::uevent::UeventSource;

/// Handles opened once at startup and released together at shutdown.
pub struct Resources {
    pub router: HotplugRouter,
    pub uevents: UeventSource,
    pub server: ProtocolServer,
}

impl Resources {
    /// Acquire every process-lifetime resource. Any failure is fatal.
    pub async fn acquire(config: &Config) -> Result<Self> {
        let store = Arc::new(XenStore::connect(&config.store.socket_path).await?);

        let loops = Arc::new(
            LoopDeviceManager::open_with_devfs(&config.loop_control.path, &config.devices.devfs_root)
                .context("Failed to open loop controller")?,
        );
        let resolver = Arc::new(DeviceResolver::new(
            &config.devices.sysfs_root,
            &config.devices.devfs_root,
        ));

        let uevents = UeventSource::open().context("Failed to open uevent socket")?;

        let server = ProtocolServer::bind(
            &config.protocol.socket_path,
            DeviceService::new(loops.clone(), resolver.clone()),
        )?;

        let router = HotplugRouter::new(
            store,
            VifHotplug::new(Arc::new(IoctlNetwork::new())),
            VbdHotplug::new(loops, resolver, config.vbd.gate()),
        );

        Ok(Self {
            router,
            uevents,
            server,
        })
    }
}

/// Single-threaded dispatcher over the uevent source and the protocol
/// listener. Each event or connection is handled to completion before
/// the next wait.
pub struct Dispatcher {
    resources: Resources,
}

impl Dispatcher {
    pub fn new(resources: Resources) -> Self {
        Self { resources }
    }

    /// Run until SIGTERM or SIGINT.
    pub async fn run(self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        let Resources {
            router,
            uevents,
            server,
        } = &self.resources;

        info!(socket = %server.path().display(), "Dispatcher running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                event = uevents.recv() => match event {
                    Ok(Some(event)) => dispatch_event(router, event).await,
                    Ok(None) => {}
                    // ENOBUFS: the kernel dropped events while we were busy.
                    Err(e) => warn!(error = %e, "Failed to receive uevent"),
                },
                conn = server.accept() => match conn {
                    Ok(stream) => server.handle(stream).await,
                    Err(e) => warn!(error = %e, "Failed to accept protocol connection"),
                },
            }
        }

        Ok(())
    }
}

/// Classify one event and run its operation, if any.
#[instrument(skip_all, fields(devname = %event.devname, action = %event.action))]
pub async fn dispatch_event(router: &HotplugRouter, event: HotplugEvent) {
    let Some(operation) = classify(&event) else {
        debug!(subsystem = %event.subsystem, "Ignoring event");
        return;
    };

    if let Err(e) = router.route(operation).await {
        error!(error = %e, "Failed to report hotplug outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use xendevd_hotplug::mock::{MemoryStore, MockLoopDevices, MockNetwork};
    use xendevd_hotplug::OwnershipGate;

    fn router(store: &Arc<MemoryStore>, network: &Arc<MockNetwork>) -> HotplugRouter {
        let loops = Arc::new(MockLoopDevices::new(1));
        HotplugRouter::new(
            store.clone(),
            VifHotplug::new(network.clone()),
            VbdHotplug::new(loops.clone(), loops, OwnershipGate::open()),
        )
    }

    fn event(subsystem: &str, devname: &str, action: &str, attrs: &[(&str, &str)]) -> HotplugEvent {
        HotplugEvent {
            subsystem: subsystem.to_string(),
            devname: devname.to_string(),
            action: action.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn test_vif_event_is_routed() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        store.insert("backend/vif/1/0/bridge", "xenbr0");

        dispatch_event(
            &router(&store, &network),
            event(
                "xen-backend",
                "vif-1-0",
                "online",
                &[("XENBUS_PATH", "backend/vif/1/0"), ("vif", "vif1.0")],
            ),
        )
        .await;

        assert!(network.is_bridge_member("xenbr0", "vif1.0"));
        assert_eq!(store.get("backend/vif/1/0/hotplug-status").as_deref(), Some("connected"));
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());

        dispatch_event(&router(&store, &network), event("block", "loop0", "change", &[])).await;

        assert!(network.calls().is_empty());
        assert!(store.keys_under("").is_empty());
    }
}
