//! Device identity resolution.
//!
//! Maps a device number to its node under `/dev` using the kernel's sysfs
//! enumeration (`/sys/dev/block/<major>:<minor>`), and the other way round
//! by stat'ing a node.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{HotplugError, Result};

/// Block device identity capability.
pub trait DeviceIdentity: Send + Sync {
    /// Device number of the block special file at `node`.
    fn device_number(&self, node: &Path) -> Result<(u32, u32)>;

    /// Device node for a device number.
    fn resolve(&self, major: u32, minor: u32) -> Result<PathBuf>;

    /// Backing file of a loop device, `None` if the device is not loop-backed.
    fn backing_file(&self, major: u32, minor: u32) -> Result<Option<PathBuf>>;
}

/// [`DeviceIdentity`] backed by sysfs and devfs.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    sysfs_root: PathBuf,
    devfs_root: PathBuf,
}

impl DeviceResolver {
    pub fn new(sysfs_root: impl Into<PathBuf>, devfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            devfs_root: devfs_root.into(),
        }
    }

    fn sysfs_dir(&self, major: u32, minor: u32) -> PathBuf {
        self.sysfs_root
            .join("dev/block")
            .join(format!("{}:{}", major, minor))
    }
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::new("/sys", "/dev")
    }
}

impl DeviceIdentity for DeviceResolver {
    fn device_number(&self, node: &Path) -> Result<(u32, u32)> {
        block_device_number(node)
    }

    fn resolve(&self, major: u32, minor: u32) -> Result<PathBuf> {
        let uevent = self.sysfs_dir(major, minor).join("uevent");
        let content = fs::read_to_string(&uevent).map_err(|e| {
            debug!(path = %uevent.display(), error = %e, "Device not enumerated");
            HotplugError::DeviceNotFound { major, minor }
        })?;

        let devname = content
            .lines()
            .find_map(|line| line.strip_prefix("DEVNAME="))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(HotplugError::DeviceNotFound { major, minor })?;

        Ok(self.devfs_root.join(devname))
    }

    fn backing_file(&self, major: u32, minor: u32) -> Result<Option<PathBuf>> {
        let path = self.sysfs_dir(major, minor).join("loop/backing_file");
        match fs::read_to_string(&path) {
            Ok(content) => {
                let file = content.trim_end_matches('\n');
                if file.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(PathBuf::from(file)))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HotplugError::resource(format!("Failed to read {}", path.display()), e)),
        }
    }
}

/// Device number of a block special file.
pub fn block_device_number(path: &Path) -> Result<(u32, u32)> {
    let meta = stat(path)?;
    if !meta.file_type().is_block_device() {
        return Err(HotplugError::Validation(format!(
            "{} is not a block device.",
            path.display()
        )));
    }

    let rdev = meta.rdev();
    Ok((
        nix::sys::stat::major(rdev) as u32,
        nix::sys::stat::minor(rdev) as u32,
    ))
}

/// Fail unless `path` is an existing regular file.
pub fn require_regular_file(path: &Path) -> Result<()> {
    if !stat(path)?.file_type().is_file() {
        return Err(HotplugError::Validation(format!(
            "{} is not a regular file.",
            path.display()
        )));
    }
    Ok(())
}

fn stat(path: &Path) -> Result<Metadata> {
    fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => HotplugError::NotFound(path.to_path_buf()),
        _ => HotplugError::resource(format!("stat({})", path.display()), e),
    })
}
