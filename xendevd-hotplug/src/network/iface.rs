//! Administrative link state.

use std::os::fd::AsRawFd;

use tracing::debug;

use super::{annotate, control_socket, IfReq};
use crate::error::{HotplugError, Result};

pub(super) fn set_up(iface: &str) -> Result<()> {
    update_flags(iface, |flags| flags | libc::IFF_UP as libc::c_short)
        .map_err(|e| annotate(e, format!("Failed to bring {} up", iface)))?;
    debug!(iface = %iface, "Interface up");
    Ok(())
}

pub(super) fn set_down(iface: &str) -> Result<()> {
    update_flags(iface, |flags| flags & !(libc::IFF_UP as libc::c_short))
        .map_err(|e| annotate(e, format!("Failed to bring {} down", iface)))?;
    debug!(iface = %iface, "Interface down");
    Ok(())
}

/// Read-modify-write of the interface flags.
fn update_flags(iface: &str, update: impl FnOnce(libc::c_short) -> libc::c_short) -> Result<()> {
    let sock = control_socket()?;
    let mut req = IfReq::new(iface)?;

    // SAFETY: req is a properly sized ifreq living for the whole call.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req as *mut IfReq) };
    if ret < 0 {
        return Err(HotplugError::last_os_error("SIOCGIFFLAGS"));
    }

    // SAFETY: SIOCGIFFLAGS filled the flags member.
    let flags = unsafe { req.data.flags };
    req.data.flags = update(flags);

    // SAFETY: as above.
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &mut req as *mut IfReq) };
    if ret < 0 {
        return Err(HotplugError::last_os_error("SIOCSIFFLAGS"));
    }
    Ok(())
}
