//! cdevd - the host-side daemon of the cdev hotplug fabric.
//!
//! Observes kernel uevents and per-container policy, and forwards filtered
//! events to container agents over a Unix stream socket. One task accepts
//! agents, one listens on netlink; everything runs on a single-threaded
//! cooperative runtime so per-connection ordering needs no locks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cdev_core::{runtime, systemd, DeviceRegistry, UeventSocket};
use clap::Parser;
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cdev_daemon::router::Router;

/// cdevd - device-management hotplug router for container environments
#[derive(Parser, Debug)]
#[command(name = "cdevd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the Unix socket container agents connect to
    #[arg(long, default_value = "cdev.control")]
    socket_path: PathBuf,

    /// Directory holding per-container filter rules (<name>.rules)
    #[arg(long, default_value = "containers.d")]
    container_rules_dir: PathBuf,

    /// Listen on the kernel uevent channel instead of the udev one
    #[arg(long)]
    kernel_events: bool,

    /// Adopt the listening socket from systemd socket activation
    #[arg(long)]
    systemd: bool,

    /// sysfs mount point
    #[arg(long, default_value = "/sys")]
    sys_root: PathBuf,

    /// Runtime state directory
    #[arg(long, default_value = cdev_core::device::DEFAULT_RUNTIME_DIR)]
    runtime_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build runtime");
            std::process::exit(-1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => {}
        Err(err) => {
            error!("{err:#}");
            std::process::exit(exit_code(&err));
        }
    }
}

/// Map a fatal error to the process exit code: the negated OS errno when
/// one is in the chain, -1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .find_map(std::io::Error::raw_os_error)
        .map_or(-1, |errno| -errno)
}

async fn run(args: Args) -> Result<()> {
    let registry = Arc::new(DeviceRegistry::new(&args.sys_root));
    registry
        .enable_persistent_registry(&args.runtime_dir)
        .with_context(|| format!("cannot set up runtime dir {}", args.runtime_dir.display()))?;

    let (listener, bound_path) = open_listener(&args)?;

    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();
    runtime::spawn_signal_task(shutdown_tx);

    let router = Router::new(
        Arc::clone(&registry),
        args.container_rules_dir.clone(),
        args.kernel_events,
        shutdown_rx.clone(),
    );

    let uevent_socket =
        UeventSocket::open(router.upstream_group()).context("cannot open uevent netlink socket")?;

    info!(
        socket = %args.socket_path.display(),
        rules = %args.container_rules_dir.display(),
        upstream = ?router.upstream_group(),
        "cdevd started (pid {})",
        std::process::id()
    );

    let netlink_task = tokio::spawn(Arc::clone(&router).run_netlink(uevent_socket));
    let accept_task = tokio::spawn(Arc::clone(&router).run_accept(listener));

    let mut shutdown = shutdown_rx;
    shutdown.changed().await.ok();
    let reason = shutdown.borrow().clone().unwrap_or_default();
    info!(reason, "shutting down");

    // Both tasks observe the same shutdown channel; the accept task awaits
    // its clients before returning.
    if let Err(err) = netlink_task.await {
        warn!(%err, "netlink task failed");
    }
    if let Err(err) = accept_task.await {
        warn!(%err, "accept task failed");
    }

    if let Some(path) = bound_path {
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), %err, "could not unlink socket");
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Bind the agent listener, or adopt it from systemd. Returns the path to
/// unlink on shutdown when we created the socket file ourselves.
fn open_listener(args: &Args) -> Result<(UnixListener, Option<PathBuf>)> {
    if args.systemd {
        if let Some(fd) = systemd::activation_fd() {
            info!(fd, "using systemd-provided listener");
            return Ok((adopt_listener(fd)?, None));
        }
        warn!("--systemd given but no socket was passed, binding normally");
    }

    let listener = match UnixListener::bind(&args.socket_path) {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            // A previous instance left its socket file behind.
            std::fs::remove_file(&args.socket_path)
                .with_context(|| format!("cannot remove stale {}", args.socket_path.display()))?;
            UnixListener::bind(&args.socket_path)?
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("cannot bind {}", args.socket_path.display())))
        }
    };
    Ok((listener, Some(args.socket_path.clone())))
}

#[allow(unsafe_code)]
fn adopt_listener(fd: std::os::fd::RawFd) -> Result<UnixListener> {
    use std::os::fd::FromRawFd;

    // SAFETY: fd 3 belongs to this process per the socket-activation
    // contract (LISTEN_PID was checked); nothing else owns it.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .context("cannot make activation fd non-blocking")?;
    UnixListener::from_std(std_listener).context("cannot adopt activation fd")
}

