//! cdev-agent - the container-side daemon of the cdev hotplug fabric.
//!
//! Connects to the host's `cdevd`, receives filtered uevents, applies
//! container-local rules, materializes device nodes under the container's
//! `/dev`, and rebroadcasts events on the container's own uevent netlink
//! channel. Runs until the host goes away, a signal arrives, the admin
//! tool sends `EXIT`, or a one-shot replay (`--boot-only`/`--shutdown`)
//! completes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cdev_agent::{Agent, BulkRequest, ControlSocket};
use cdev_core::{runtime, systemd, DeviceRegistry, UeventSocket};
use clap::Parser;
use nix::errno::Errno;
use nix::unistd::Uid;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// cdev-agent - in-container device node manager
#[derive(Parser, Debug)]
#[command(name = "cdev-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Container name announced to the host
    #[arg(long)]
    name: String,

    /// Request a replay of current devices as `add` after connecting
    #[arg(long)]
    boot: bool,

    /// Like --boot, but exit once the replay completes
    #[arg(long)]
    boot_only: bool,

    /// Request a replay of current devices as `remove`, then exit
    #[arg(long)]
    shutdown: bool,

    /// Path of the host's Unix socket
    #[arg(long, default_value = "cdev.control")]
    socket_path: PathBuf,

    /// Directory holding client rules files
    #[arg(long, default_value = "rules.d")]
    rules_dir: PathBuf,

    /// Adopt the udev control socket from systemd socket activation
    #[arg(long)]
    systemd: bool,

    /// Evaluate rules but change nothing on disk
    #[arg(long)]
    dry: bool,

    /// The container's /dev
    #[arg(long, default_value = "/dev")]
    dev_root: PathBuf,

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

    if args.systemd && (args.boot_only || args.shutdown) {
        error!("--systemd cannot be combined with --boot-only or --shutdown");
        std::process::exit(-(Errno::EINVAL as i32));
    }
    if !Uid::effective().is_root() {
        error!("cdev-agent must run as root to manage device nodes");
        std::process::exit(-(Errno::EPERM as i32));
    }

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
    if !args.dry {
        registry
            .enable_persistent_registry(&args.runtime_dir)
            .with_context(|| {
                format!("cannot set up runtime dir {}", args.runtime_dir.display())
            })?;
    }

    let (shutdown_tx, shutdown_rx) = runtime::shutdown_channel();
    runtime::spawn_signal_task(shutdown_tx);

    // The control endpoint only exists when there is something to bind:
    // an activation fd, or the runtime directory of a non-dry run.
    let (control_tx, control_rx) = mpsc::channel(4);
    let control_socket = if args.systemd {
        match systemd::activation_fd() {
            Some(fd) => Some(ControlSocket::from_activation_fd(fd)?),
            None => {
                warn!("--systemd given but no socket was passed");
                None
            }
        }
    } else if args.dry {
        None
    } else {
        match ControlSocket::bind_at(&args.runtime_dir.join("control")) {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(%err, "control socket unavailable, running without it");
                None
            }
        }
    };
    if let Some(socket) = control_socket {
        tokio::spawn(socket.run(control_tx, shutdown_rx.clone()));
    }

    let netlink = UeventSocket::open_unbound().context("cannot open uevent netlink socket")?;

    let stream = UnixStream::connect(&args.socket_path)
        .await
        .with_context(|| format!("cannot connect to {}", args.socket_path.display()))?;
    info!(socket = %args.socket_path.display(), "connected to host");

    let (bulk, finish_after_bulk) = if args.boot_only {
        (Some(BulkRequest::Boot), true)
    } else if args.shutdown {
        (Some(BulkRequest::Shutdown), true)
    } else if args.boot {
        (Some(BulkRequest::Boot), false)
    } else {
        (None, false)
    };

    let agent = Agent::new(
        registry,
        args.rules_dir.clone(),
        args.dev_root.clone(),
        args.dry,
        netlink,
        bulk,
        finish_after_bulk,
    );
    agent
        .run(stream, &args.name, control_rx, shutdown_rx)
        .await?;

    info!("agent finished");
    Ok(())
}
