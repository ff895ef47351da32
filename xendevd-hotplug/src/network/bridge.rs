//! Linux bridge membership.

use std::os::fd::AsRawFd;

use tracing::debug;

use super::{annotate, control_socket, interface_index, IfReq};
use crate::error::{HotplugError, Result};

const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const SIOCBRDELIF: libc::c_ulong = 0x89a3;

/// Enslave `iface` to `bridge`.
pub(super) fn add_interface(bridge: &str, iface: &str) -> Result<()> {
    bridge_ioctl(SIOCBRADDIF, bridge, iface)
        .map_err(|e| annotate(e, format!("Failed to add {} to bridge {}", iface, bridge)))?;
    debug!(bridge = %bridge, iface = %iface, "Interface added to bridge");
    Ok(())
}

/// Release `iface` from `bridge`.
pub(super) fn remove_interface(bridge: &str, iface: &str) -> Result<()> {
    bridge_ioctl(SIOCBRDELIF, bridge, iface)
        .map_err(|e| annotate(e, format!("Failed to remove {} from bridge {}", iface, bridge)))?;
    debug!(bridge = %bridge, iface = %iface, "Interface removed from bridge");
    Ok(())
}

fn bridge_ioctl(request: libc::c_ulong, bridge: &str, iface: &str) -> Result<()> {
    let ifindex = interface_index(iface)?;
    let sock = control_socket()?;

    let mut req = IfReq::new(bridge)?;
    req.data.ifindex = ifindex;

    // SAFETY: req is a properly sized ifreq living for the whole call.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), request as _, &mut req as *mut IfReq) };
    if ret < 0 {
        return Err(HotplugError::last_os_error("bridge ioctl"));
    }
    Ok(())
}
