//! Udev control socket endpoint.
//!
//! Speaks the wire format of the standard admin tool over a
//! `SOCK_SEQPACKET` Unix socket (normally `<runtime>/control`, or a
//! socket-activation fd). Only `RELOAD` and `EXIT` act on the agent; the
//! queue- and worker-related types exist solely so the tool gets a
//! well-behaved peer, and are logged and ignored.
//!
//! Only uid 0 peers are served. The socket is bound only when a usable
//! path or activation fd exists; otherwise the agent simply runs without a
//! control endpoint.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use cdev_core::control::{ControlMessage, ControlMsgType, CTRL_WIRE_SIZE};
use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, getsockopt, listen, setsockopt, socket, sockopt, AddressFamily, Backlog,
    MsgFlags, SockFlag, SockType, UnixAddr,
};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// What the control endpoint asks of the agent's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Reload the client rules.
    Reload,
    /// Shut the agent down.
    Exit,
}

fn errno_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// The listening control socket.
pub struct ControlSocket {
    fd: AsyncFd<OwnedFd>,
    cleanup: Option<PathBuf>,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file from a previous
    /// instance.
    pub fn bind_at(path: &Path) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(errno_io)?;
        setsockopt(&fd, sockopt::PassCred, &true).map_err(errno_io)?;

        let addr = UnixAddr::new(path).map_err(errno_io)?;
        match bind(fd.as_raw_fd(), &addr) {
            Ok(()) => {}
            Err(Errno::EADDRINUSE) => {
                std::fs::remove_file(path)?;
                bind(fd.as_raw_fd(), &addr).map_err(errno_io)?;
            }
            Err(err) => return Err(errno_io(err)),
        }
        listen(&fd, Backlog::new(1).map_err(errno_io)?).map_err(errno_io)?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            cleanup: Some(path.to_path_buf()),
        })
    }

    /// Adopt a listening socket passed by socket activation.
    #[allow(unsafe_code)]
    pub fn from_activation_fd(fd: RawFd) -> io::Result<Self> {
        use std::os::fd::FromRawFd;

        // SAFETY: the activation fd belongs to this process per the
        // socket-activation contract (LISTEN_PID was checked by the
        // caller); nothing else owns it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        setsockopt(&owned, sockopt::PassCred, &true).map_err(errno_io)?;
        Ok(Self {
            fd: AsyncFd::new(owned)?,
            cleanup: None,
        })
    }

    async fn accept(&self) -> io::Result<OwnedFd> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                accept4(
                    inner.get_ref().as_raw_fd(),
                    SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                )
                .map(owned_from_accept)
                .map_err(errno_io)
            }) {
                Ok(result) => return result,
                Err(_would_block) => {}
            }
        }
    }

    /// Accept-and-serve loop. Each connection runs as its own task;
    /// requests flow to the agent through `tx`.
    pub async fn run(
        self,
        tx: mpsc::Sender<ControlRequest>,
        mut shutdown: watch::Receiver<Option<String>>,
    ) {
        loop {
            let conn = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(%err, "control accept failed");
                        break;
                    }
                },
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(conn, &tx).await {
                    info!(%err, "control connection error");
                }
            });
        }

        if let Some(path) = self.cleanup {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[allow(unsafe_code)]
fn owned_from_accept(raw: RawFd) -> OwnedFd {
    use std::os::fd::FromRawFd;
    // SAFETY: accept4 just returned this descriptor; we are its sole owner.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

/// Serve one admin-tool connection until it closes.
async fn serve_connection(conn: OwnedFd, tx: &mpsc::Sender<ControlRequest>) -> io::Result<()> {
    let creds = getsockopt(&conn, sockopt::PeerCredentials).map_err(errno_io)?;
    if creds.uid() != 0 {
        error!(uid = creds.uid(), "sender uid > 0, messages ignored");
        return Ok(());
    }

    let afd = AsyncFd::new(conn)?;
    loop {
        let record = recv_record(&afd).await?;
        let Some(record) = record else {
            return Ok(());
        };

        let msg = match ControlMessage::parse(&record) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "unparsable control message");
                continue;
            }
        };
        dispatch(&msg, tx).await;
    }
}

async fn recv_record(afd: &AsyncFd<OwnedFd>) -> io::Result<Option<Vec<u8>>> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            let mut buf = vec![0u8; CTRL_WIRE_SIZE];
            let len = nix::sys::socket::recv(
                inner.get_ref().as_raw_fd(),
                &mut buf,
                MsgFlags::empty(),
            )
            .map_err(errno_io)?;
            buf.truncate(len);
            Ok(buf)
        }) {
            Ok(Ok(buf)) if buf.is_empty() => return Ok(None),
            Ok(Ok(buf)) => return Ok(Some(buf)),
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => {}
        }
    }
}

async fn dispatch(msg: &ControlMessage, tx: &mpsc::Sender<ControlRequest>) {
    match msg.msg_type {
        ControlMsgType::SetLogLevel => {
            info!(level = msg.intval(), "ignoring SET_LOG_LEVEL");
        }
        ControlMsgType::StopExecQueue => info!("ignoring STOP_EXEC_QUEUE (no exec queue)"),
        ControlMsgType::StartExecQueue => info!("ignoring START_EXEC_QUEUE (no exec queue)"),
        ControlMsgType::Reload => {
            info!("rules reload requested");
            let _ = tx.send(ControlRequest::Reload).await;
        }
        ControlMsgType::SetEnv => {
            info!(entry = %msg.buf_str(), "ignoring SET_ENV");
        }
        ControlMsgType::SetChildrenMax => {
            info!(max = msg.intval(), "ignoring SET_CHILDREN_MAX (no worker pool)");
        }
        ControlMsgType::Ping => info!(version = %msg.version_str(), "control ping"),
        ControlMsgType::Exit => {
            info!("exit requested over control socket");
            let _ = tx.send(ControlRequest::Exit).await;
        }
        ControlMsgType::Unknown(code) => {
            warn!(code, "unknown control message type");
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::socket::connect;
    use nix::unistd::write as nix_write;

    use super::*;

    fn connect_seqpacket(path: &Path) -> OwnedFd {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .unwrap();
        let addr = UnixAddr::new(path).unwrap();
        connect(fd.as_raw_fd(), &addr).unwrap();
        fd
    }

    #[tokio::test]
    async fn exit_and_reload_reach_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let sock = ControlSocket::bind_at(&path).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(None);
        tokio::spawn(sock.run(tx, shutdown_rx));

        let conn = tokio::task::spawn_blocking(move || {
            let conn = connect_seqpacket(&path);
            let reload = ControlMessage::new(ControlMsgType::Reload).pack();
            nix_write(&conn, &reload).unwrap();
            let exit = ControlMessage::new(ControlMsgType::Exit).pack();
            nix_write(&conn, &exit).unwrap();
            conn
        })
        .await
        .unwrap();

        if nix::unistd::Uid::effective().is_root() {
            assert_eq!(rx.recv().await, Some(ControlRequest::Reload));
            assert_eq!(rx.recv().await, Some(ControlRequest::Exit));
        } else {
            // Non-root peers are ignored wholesale.
            let outcome =
                tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
            assert!(outcome.is_err(), "non-root messages must be dropped");
        }
        drop(conn);
    }

    #[tokio::test]
    async fn stale_socket_files_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let first = ControlSocket::bind_at(&path).unwrap();
        drop(first);
        // The file is still there; a rebind must succeed anyway.
        assert!(path.exists());
        let _second = ControlSocket::bind_at(&path).unwrap();
    }
}
