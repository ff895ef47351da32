//! Error types for hotplug handling and device management.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while handling a hotplug event or device request.
#[derive(Error, Debug)]
pub enum HotplugError {
    /// A required attribute or store key is missing.
    #[error("{0}")]
    Configuration(String),

    /// A path does not have the expected file type.
    #[error("{0}")]
    Validation(String),

    /// An underlying system call or ioctl failed.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A path named by a device record or request does not exist.
    #[error("{} does not exist.", .0.display())]
    NotFound(PathBuf),

    /// Recognized but unsupported device subtype.
    #[error("{0} not implemented")]
    NotImplemented(String),

    /// No device node is known for this device number.
    #[error("No device node for {major}:{minor}")]
    DeviceNotFound { major: u32, minor: u32 },

    /// The configuration store rejected a request or the connection broke.
    #[error("Store error: {0}")]
    Store(String),
}

impl HotplugError {
    /// Wrap an OS error with a description of what was being attempted.
    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// Wrap the current `errno`.
    pub fn last_os_error(context: impl Into<String>) -> Self {
        Self::resource(context, std::io::Error::last_os_error())
    }

    /// OS error code surfaced to protocol clients.
    pub fn errno(&self) -> i32 {
        match self {
            HotplugError::Resource { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            HotplugError::Configuration(_) | HotplugError::Validation(_) => libc::EINVAL,
            HotplugError::NotFound(_) => libc::ENOENT,
            HotplugError::NotImplemented(_) => libc::ENOSYS,
            HotplugError::DeviceNotFound { .. } => libc::ENODEV,
            HotplugError::Store(_) => libc::EIO,
        }
    }
}

/// Result type alias for hotplug operations.
pub type Result<T> = std::result::Result<T, HotplugError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let err = HotplugError::resource(
            "Failed to open /dev/loop3",
            std::io::Error::from_raw_os_error(libc::EBUSY),
        );
        assert_eq!(err.errno(), libc::EBUSY);
        assert_eq!(HotplugError::NotImplemented("vbd type 'nbd'".into()).errno(), libc::ENOSYS);
        assert_eq!(HotplugError::DeviceNotFound { major: 7, minor: 9 }.errno(), libc::ENODEV);
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = HotplugError::NotImplemented("vbd type 'nbd'".into());
        assert_eq!(err.to_string(), "vbd type 'nbd' not implemented");

        let err = HotplugError::NotFound(PathBuf::from("/tmp/a.img"));
        assert_eq!(err.to_string(), "/tmp/a.img does not exist.");
        assert_eq!(err.errno(), libc::ENOENT);

        let err = HotplugError::resource(
            "Failed to allocate loop device",
            std::io::Error::from_raw_os_error(libc::ENODEV),
        );
        assert!(err.to_string().starts_with("Failed to allocate loop device: "));
    }
}
