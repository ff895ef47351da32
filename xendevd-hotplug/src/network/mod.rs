//! Host network operations used by VIF hotplug.
//!
//! This module provides:
//! - The [`NetworkOps`] capability consumed by VIF hotplug
//! - [`IoctlNetwork`], its implementation on top of the classic
//!   `SIOC*` interface and bridge ioctls

mod bridge;
mod iface;

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::{HotplugError, Result};

/// Administrative link and bridge-membership operations.
pub trait NetworkOps: Send + Sync {
    /// Enslave `iface` to `bridge`.
    fn bridge_add_interface(&self, bridge: &str, iface: &str) -> Result<()>;

    /// Release `iface` from `bridge`.
    fn bridge_remove_interface(&self, bridge: &str, iface: &str) -> Result<()>;

    /// Set `IFF_UP` on `iface`.
    fn set_interface_up(&self, iface: &str) -> Result<()>;

    /// Clear `IFF_UP` on `iface`.
    fn set_interface_down(&self, iface: &str) -> Result<()>;
}

/// [`NetworkOps`] through ioctls on a throwaway local socket.
#[derive(Debug, Clone, Default)]
pub struct IoctlNetwork;

impl IoctlNetwork {
    pub fn new() -> Self {
        Self
    }
}

impl NetworkOps for IoctlNetwork {
    fn bridge_add_interface(&self, bridge: &str, iface: &str) -> Result<()> {
        bridge::add_interface(bridge, iface)
    }

    fn bridge_remove_interface(&self, bridge: &str, iface: &str) -> Result<()> {
        bridge::remove_interface(bridge, iface)
    }

    fn set_interface_up(&self, iface: &str) -> Result<()> {
        iface::set_up(iface)
    }

    fn set_interface_down(&self, iface: &str) -> Result<()> {
        iface::set_down(iface)
    }
}

/// `struct ifreq` restricted to the members used here.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

#[repr(C)]
union IfReqData {
    flags: libc::c_short,
    ifindex: libc::c_int,
    _pad: [u8; 24],
}

impl IfReq {
    fn new(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
            return Err(HotplugError::Validation(format!("Invalid interface name '{}'", name)));
        }

        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            data: IfReqData { _pad: [0; 24] },
        };
        for (dst, src) in req.name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(req)
    }
}

/// Socket used only as an ioctl target.
fn control_socket() -> Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the descriptor is owned immediately.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(HotplugError::last_os_error("Failed to open control socket"));
    }
    // SAFETY: fd is a freshly created, valid descriptor not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn interface_index(name: &str) -> Result<libc::c_int> {
    let c_name = CString::new(name)
        .map_err(|_| HotplugError::Validation(format!("Invalid interface name '{}'", name)))?;

    // SAFETY: c_name is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(HotplugError::resource(
            format!("Interface {} not found", name),
            std::io::Error::from_raw_os_error(libc::ENODEV),
        ));
    }
    Ok(index as libc::c_int)
}

/// Replace the bare ioctl name with what was being attempted.
fn annotate(err: HotplugError, context: String) -> HotplugError {
    match err {
        HotplugError::Resource { source, .. } => HotplugError::resource(context, source),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name_limits() {
        assert!(IfReq::new("vif3.0").is_ok());
        assert!(IfReq::new("").is_err());
        assert!(IfReq::new("a-very-long-interface").is_err());
    }

    #[test]
    fn test_ifreq_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn test_missing_interface() {
        let err = interface_index("xdd-missing0").unwrap_err();
        assert_eq!(err.errno(), libc::ENODEV);
    }
}
