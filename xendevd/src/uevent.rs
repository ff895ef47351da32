//! Kernel uevent source.
//!
//! Listens on the `NETLINK_KOBJECT_UEVENT` multicast group the kernel
//! broadcasts device events on, registered with the tokio reactor.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace};

use xendevd_hotplug::HotplugEvent;

/// Kernel (not udev) event group.
const KERNEL_GROUP: u32 = 1;

const RECV_BUF_LEN: usize = 8192;

/// Netlink socket receiving kernel uevents.
pub struct UeventSource {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSource {
    /// Open and bind the netlink socket.
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the descriptor is owned immediately.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created descriptor not owned elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_GROUP;

        // SAFETY: addr is a valid sockaddr_nl and the length matches it.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!("Listening for kernel uevents");
        Ok(Self { fd: AsyncFd::new(fd)? })
    }

    /// Wait for and read one datagram.
    ///
    /// Returns `None` for datagrams that are not kernel uevents: messages
    /// from user space senders and anything that does not parse.
    /// Cancel safe: nothing is consumed until the socket is readable.
    pub async fn recv(&self) -> io::Result<Option<HotplugEvent>> {
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|fd| recv_from_kernel(fd.get_ref(), &mut buf)) {
                Ok(Ok(Some(len))) => {
                    trace!(len, "uevent datagram");
                    return Ok(HotplugEvent::parse(&buf[..len]));
                }
                Ok(Ok(None)) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// `recvfrom(2)`, keeping only datagrams sent by the kernel (port 0).
fn recv_from_kernel(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
    let mut sender: libc::sockaddr_nl = unsafe { mem::zeroed() };
    let mut sender_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

    // SAFETY: buf and sender are valid for writes of the given lengths.
    let n = unsafe {
        libc::recvfrom(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut sender as *mut libc::sockaddr_nl as *mut libc::sockaddr,
            &mut sender_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    if sender.nl_pid != 0 {
        debug!(pid = sender.nl_pid, "Dropping uevent from user space");
        return Ok(None);
    }
    Ok(Some(n as usize))
}
