//! Loop device allocation and binding.
//!
//! A loop device exposes a regular file as a block device. Allocation asks
//! `/dev/loop-control` for the next free minor; binding associates the
//! device node with an open backing file and sets the read-only flag to
//! match the requested mode.
//!
//! xendevd assumes it is the only allocator on the host: between
//! [`LoopDevices::next_available_device`] and [`LoopDevices::bind`] another
//! process could claim the same device, in which case `bind` fails with
//! `EBUSY` and the failure is reported like any other.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::error::{HotplugError, Result};

/// Default loop control device.
pub const DEFAULT_LOOP_CONTROL: &str = "/dev/loop-control";

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn zeroed() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// Access mode of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    ReadWrite,
    ReadOnly,
}

impl LoopMode {
    /// Parse a store or protocol mode tag.
    ///
    /// Only `r`/`ro` select read-only; everything else, including an empty
    /// tag, binds read-write.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim_matches(|c: char| c == '\0' || c.is_whitespace()) {
            "r" | "ro" => Self::ReadOnly,
            _ => Self::ReadWrite,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadWrite => "w",
            Self::ReadOnly => "r",
        }
    }
}

/// A loop device bound to a backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    pub device: PathBuf,
    pub file: PathBuf,
    pub mode: LoopMode,
}

/// Loop device capability.
pub trait LoopDevices: Send + Sync {
    /// Path of a currently free loop device.
    fn next_available_device(&self) -> Result<PathBuf>;

    /// Bind `device` to `file` with the given access mode.
    fn bind(&self, device: &Path, file: &Path, mode: LoopMode) -> Result<LoopBinding>;

    /// Dissociate `device` from its backing file.
    fn unbind(&self, device: &Path) -> Result<()>;
}

/// Handle on the host's loop control device.
pub struct LoopDeviceManager {
    control: File,
    devfs_root: PathBuf,
}

impl LoopDeviceManager {
    /// Open the loop controller. Held for the process lifetime.
    pub fn open(control_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_devfs(control_path, "/dev")
    }

    /// Open the loop controller, naming devices under `devfs_root`.
    pub fn open_with_devfs(control_path: impl AsRef<Path>, devfs_root: impl Into<PathBuf>) -> Result<Self> {
        let control_path = control_path.as_ref();
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(control_path)
            .map_err(|e| HotplugError::resource(format!("Failed to open {}", control_path.display()), e))?;

        info!(path = %control_path.display(), "Loop controller opened");

        Ok(Self {
            control,
            devfs_root: devfs_root.into(),
        })
    }
}

impl LoopDevices for LoopDeviceManager {
    #[instrument(skip(self))]
    fn next_available_device(&self) -> Result<PathBuf> {
        // SAFETY: LOOP_CTL_GET_FREE takes no argument.
        let devnum = unsafe { libc::ioctl(self.control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if devnum < 0 {
            return Err(HotplugError::last_os_error("Failed to allocate loop device"));
        }

        let device = self.devfs_root.join(format!("loop{}", devnum));
        debug!(device = %device.display(), "Free loop device");
        Ok(device)
    }

    #[instrument(skip_all, fields(device = %device.display(), file = %file.display(), mode = mode.as_str()))]
    fn bind(&self, device: &Path, file: &Path, mode: LoopMode) -> Result<LoopBinding> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| HotplugError::resource(format!("Failed to open {}", device.display()), e))?;

        let backing = OpenOptions::new()
            .read(true)
            .write(mode == LoopMode::ReadWrite)
            .open(file)
            .map_err(|e| HotplugError::resource(format!("Failed to open {}", file.display()), e))?;

        // SAFETY: both descriptors are open for the duration of the call.
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd()) };
        if ret < 0 {
            return Err(HotplugError::last_os_error(format!(
                "Failed to bind {} to {}",
                device.display(),
                file.display()
            )));
        }

        let attached = AttachedGuard { dev: &dev, device };
        set_read_only(&dev, mode == LoopMode::ReadOnly).map_err(|e| {
            HotplugError::resource(format!("Failed to set mode on {}", device.display()), e)
        })?;
        attached.keep();

        info!("Loop device bound");

        Ok(LoopBinding {
            device: device.to_path_buf(),
            file: file.to_path_buf(),
            mode,
        })
    }

    #[instrument(skip_all, fields(device = %device.display()))]
    fn unbind(&self, device: &Path) -> Result<()> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| HotplugError::resource(format!("Failed to open {}", device.display()), e))?;

        // SAFETY: LOOP_CLR_FD takes no pointer argument.
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        if ret < 0 {
            return Err(HotplugError::last_os_error(format!("Failed to unbind {}", device.display())));
        }

        info!("Loop device unbound");
        Ok(())
    }
}

fn set_read_only(dev: &File, read_only: bool) -> std::io::Result<()> {
    let mut info = LoopInfo64::zeroed();

    // SAFETY: info is a correctly laid out loop_info64.
    let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_GET_STATUS64 as _, &mut info as *mut LoopInfo64) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    if read_only {
        info.lo_flags |= LO_FLAGS_READ_ONLY;
    } else {
        info.lo_flags &= !LO_FLAGS_READ_ONLY;
    }

    // SAFETY: as above.
    let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_SET_STATUS64 as _, &info as *const LoopInfo64) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Clears a fresh association unless the remaining bind steps succeed.
struct AttachedGuard<'a> {
    dev: &'a File,
    device: &'a Path,
}

impl AttachedGuard<'_> {
    fn keep(self) {
        std::mem::forget(self);
    }
}

impl Drop for AttachedGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: LOOP_CLR_FD takes no pointer argument.
        let ret = unsafe { libc::ioctl(self.dev.as_raw_fd(), LOOP_CLR_FD as _, 0) };
        if ret < 0 {
            warn!(
                device = %self.device.display(),
                error = %std::io::Error::last_os_error(),
                "Failed to release partially bound loop device"
            );
        }
    }
}
