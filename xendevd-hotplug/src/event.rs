//! Kernel hotplug events.

use std::collections::BTreeMap;

/// Attribute carrying the store base path of a backend device.
pub const XENBUS_PATH: &str = "XENBUS_PATH";
/// Attribute carrying the network interface name.
pub const VIF: &str = "vif";
/// Attribute carrying the bridge name for direct-attribute devices.
pub const BRIDGE: &str = "bridge";

/// One kernel hotplug notification, consumed within a dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HotplugEvent {
    pub subsystem: String,
    pub devname: String,
    pub action: String,
    pub attributes: BTreeMap<String, String>,
}

impl HotplugEvent {
    /// Parse a kernel uevent datagram.
    ///
    /// The kernel sends `action@devpath` followed by NUL-separated
    /// `KEY=VALUE` pairs. Messages rebroadcast by udev start with
    /// `libudev` and are not accepted, nor is anything without an
    /// action or device path.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let mut fields = buf.split(|b| *b == 0).filter(|f| !f.is_empty());

        let header = std::str::from_utf8(fields.next()?).ok()?;
        let (header_action, header_path) = header.split_once('@')?;

        let mut attributes = BTreeMap::new();
        for field in fields {
            let Ok(field) = std::str::from_utf8(field) else {
                continue;
            };
            if let Some((key, value)) = field.split_once('=') {
                attributes.insert(key.to_string(), value.to_string());
            }
        }

        let action = attributes
            .get("ACTION")
            .cloned()
            .unwrap_or_else(|| header_action.to_string());
        let devpath = attributes
            .get("DEVPATH")
            .map(String::as_str)
            .unwrap_or(header_path);
        let devname = devpath.rsplit('/').next().unwrap_or_default().to_string();
        let subsystem = attributes.get("SUBSYSTEM").cloned().unwrap_or_default();

        if action.is_empty() || devname.is_empty() {
            return None;
        }

        Some(Self {
            subsystem,
            devname,
            action,
            attributes,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}
