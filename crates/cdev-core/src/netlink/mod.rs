//! `NETLINK_KOBJECT_UEVENT` transport.
//!
//! Two logical channels share the netlink family: multicast group 1 carries
//! raw kernel uevents, group 2 carries the libudev-format rebroadcast. The
//! host daemon listens on one of them (configurable) and the container
//! agent sends its rebroadcasts to the udev group of its own network
//! namespace.

mod message;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    bind, sendto, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

pub use message::{
    UeventMessage, UeventParseError, LIBUDEV_HEADER_SIZE, LIBUDEV_MAGIC, LIBUDEV_PREFIX,
};

/// Uevent multicast groups. The numeric value doubles as the netlink group
/// bitmask, exactly as libudev uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventGroup {
    /// Group 1: raw kernel uevents.
    Kernel = 1,
    /// Group 2: the libudev-format rebroadcast.
    Udev = 2,
}

impl UeventGroup {
    /// Group bitmask for binding and sending.
    #[must_use]
    pub const fn mask(self) -> u32 {
        self as u32
    }
}

/// Receive buffer: at least 2048 bytes of uevent payload plus ancillary
/// headroom; kernel uevents are capped well below this.
const RECV_BUF_SIZE: usize = 8192;

fn errno_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// An async uevent netlink socket.
#[derive(Debug)]
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    /// Open a socket subscribed to `group`. Sets `SO_PASSCRED` so peers
    /// can't spoof kernel-origin messages unnoticed.
    pub fn open(group: UeventGroup) -> io::Result<Self> {
        Self::open_mask(group.mask())
    }

    /// Open a send-only socket (no group subscription).
    pub fn open_unbound() -> io::Result<Self> {
        Self::open_mask(0)
    }

    fn open_mask(groups: u32) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(errno_io)?;
        setsockopt(&fd, sockopt::PassCred, &true).map_err(errno_io)?;
        // The kernel assigns the pid.
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, groups)).map_err(errno_io)?;

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    /// Receive one datagram.
    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let mut buf = vec![0u8; RECV_BUF_SIZE];
                let len = nix::sys::socket::recv(
                    inner.get_ref().as_raw_fd(),
                    &mut buf,
                    MsgFlags::empty(),
                )
                .map_err(errno_io)?;
                buf.truncate(len);
                Ok(buf)
            });
            match result {
                Ok(res) => return res,
                Err(_would_block) => {}
            }
        }
    }

    /// Multicast a datagram to `group`. `ECONNREFUSED` means nobody is
    /// subscribed to the group and is not an error.
    pub async fn send(&self, buf: &[u8], group: UeventGroup) -> io::Result<()> {
        let dest = NetlinkAddr::new(0, group.mask());
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                match sendto(
                    inner.get_ref().as_raw_fd(),
                    buf,
                    &dest,
                    MsgFlags::empty(),
                ) {
                    Ok(_) | Err(Errno::ECONNREFUSED) => Ok(()),
                    Err(err) => Err(errno_io(err)),
                }
            });
            match result {
                Ok(res) => return res,
                Err(_would_block) => {}
            }
        }
    }
}
