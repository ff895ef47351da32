//! Classification of hotplug events into typed operations.

use std::collections::BTreeMap;

use crate::event::{HotplugEvent, VIF, XENBUS_PATH};

/// Subsystem of backend devices whose attributes live in the store.
pub const STORE_BACKEND: &str = "xen-backend";
/// Subsystem of backend devices that carry their attributes in the event.
pub const DIRECT_BACKEND: &str = "xen-noxs-backend";

const VIF_PREFIX: &str = "vif-";
const VBD_PREFIX: &str = "vbd-";

/// Direction of a hotplug transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Online,
    Offline,
}

/// A recognized hotplug action, carrying what its handler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Store-backed network interface.
    VifStore {
        transition: Transition,
        xb_path: String,
        vif: Option<String>,
    },
    /// Store-backed block device.
    VbdStore {
        transition: Transition,
        xb_path: String,
    },
    /// Network interface described entirely by the event.
    VifDirect {
        transition: Transition,
        device: String,
        attributes: BTreeMap<String, String>,
    },
}

impl Operation {
    pub fn transition(&self) -> Transition {
        match self {
            Operation::VifStore { transition, .. }
            | Operation::VbdStore { transition, .. }
            | Operation::VifDirect { transition, .. } => *transition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Store,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Vif,
    Vbd,
}

/// Map an event to an operation, or `None` when it is not ours.
///
/// Recognized combinations: store-backed vif online/offline, store-backed
/// vbd add/remove, direct vif online/offline. Store-backed events without
/// a `XENBUS_PATH` have nowhere to report to and are ignored as well.
pub fn classify(event: &HotplugEvent) -> Option<Operation> {
    let backend = match event.subsystem.as_str() {
        STORE_BACKEND => Backend::Store,
        DIRECT_BACKEND => Backend::Direct,
        _ => return None,
    };

    let kind = if event.devname.starts_with(VIF_PREFIX) {
        Kind::Vif
    } else if event.devname.starts_with(VBD_PREFIX) {
        Kind::Vbd
    } else {
        return None;
    };

    let transition = match (kind, event.action.as_str()) {
        (Kind::Vif, "online") | (Kind::Vbd, "add") => Transition::Online,
        (Kind::Vif, "offline") | (Kind::Vbd, "remove") => Transition::Offline,
        _ => return None,
    };

    match (backend, kind) {
        (Backend::Store, Kind::Vif) => Some(Operation::VifStore {
            transition,
            xb_path: event.attribute(XENBUS_PATH)?.to_string(),
            vif: event.attribute(VIF).map(str::to_string),
        }),
        (Backend::Store, Kind::Vbd) => Some(Operation::VbdStore {
            transition,
            xb_path: event.attribute(XENBUS_PATH)?.to_string(),
        }),
        (Backend::Direct, Kind::Vif) => Some(Operation::VifDirect {
            transition,
            device: event.devname.clone(),
            attributes: event.attributes.clone(),
        }),
        (Backend::Direct, Kind::Vbd) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(subsystem: &str, devname: &str, action: &str) -> HotplugEvent {
        let mut attributes = BTreeMap::new();
        attributes.insert(XENBUS_PATH.to_string(), format!("backend/{}", devname));
        attributes.insert(VIF.to_string(), "vif3.0".to_string());
        HotplugEvent {
            subsystem: subsystem.to_string(),
            devname: devname.to_string(),
            action: action.to_string(),
            attributes,
        }
    }

    #[test]
    fn test_valid_combinations() {
        assert_eq!(
            classify(&event(STORE_BACKEND, "vif-3-0", "online")),
            Some(Operation::VifStore {
                transition: Transition::Online,
                xb_path: "backend/vif-3-0".to_string(),
                vif: Some("vif3.0".to_string()),
            })
        );
        assert_eq!(
            classify(&event(STORE_BACKEND, "vbd-3-51712", "remove")),
            Some(Operation::VbdStore {
                transition: Transition::Offline,
                xb_path: "backend/vbd-3-51712".to_string(),
            })
        );
        let direct = classify(&event(DIRECT_BACKEND, "vif-3-0", "offline")).unwrap();
        assert!(matches!(direct, Operation::VifDirect { ref device, .. } if device == "vif-3-0"));
        assert_eq!(direct.transition(), Transition::Offline);
    }

    #[test]
    fn test_ignored_combinations() {
        let ignored = [
            event(STORE_BACKEND, "vif-3-0", "add"),
            event(STORE_BACKEND, "vif-3-0", "change"),
            event(STORE_BACKEND, "vbd-3-51712", "online"),
            event(DIRECT_BACKEND, "vbd-3-51712", "add"),
            event("block", "vif-3-0", "online"),
            event(STORE_BACKEND, "console-3-0", "online"),
        ];
        for e in &ignored {
            assert_eq!(classify(e), None, "{:?}", e);
        }

        let mut no_path = event(STORE_BACKEND, "vbd-3-51712", "add");
        no_path.attributes.remove(XENBUS_PATH);
        assert_eq!(classify(&no_path), None);
    }

    #[test]
    fn test_deterministic() {
        let e = event(STORE_BACKEND, "vif-3-0", "online");
        assert_eq!(classify(&e), classify(&e));
    }
}
