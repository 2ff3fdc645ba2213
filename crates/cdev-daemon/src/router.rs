//! The host-side event router.
//!
//! One accept loop spawns a task per connecting agent; each client runs a
//! `Handshake → Ready → Closing` state machine. A global netlink listener
//! fans every uevent out to all ready clients through the filter pipeline
//! ([`Router::handle_uevent`]), which runs the client's per-container
//! ruleset under a wall-clock budget and then performs the side effects the
//! surviving context requests: cgroup arbitration, `SYNC` state forwarding,
//! the `UEVENT` itself, and an optional secondary emit.
//!
//! Everything runs on a single-threaded cooperative scheduler. Events for
//! a device reach clients in netlink arrival order, and messages on one
//! connection are never reordered.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cdev_core::device::make_sync_buffer;
use cdev_core::proto::{command, encode_sync, Message, MessageCodec};
use cdev_core::rules::{self, Dialect, EmitOption, RuleContext, RuleSet};
use cdev_core::runtime::{ShutdownRx, HANDSHAKE_TIMEOUT};
use cdev_core::{DeviceRegistry, EventSource, SharedDevice, UeventGroup, UeventMessage, UeventSocket};
use futures::StreamExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::cgroups::{arbitrate, ManagerRegistry};
use crate::client::{Client, WorkItem};

/// Wall-clock budget for one ruleset evaluation.
const RULE_TIMEOUT: Duration = Duration::from_secs(2);

/// The host router.
pub struct Router {
    registry: Arc<DeviceRegistry>,
    clients: std::sync::Mutex<Vec<Arc<Client>>>,
    container_rules_dir: PathBuf,
    cgroups: ManagerRegistry,
    /// Source tag for live netlink events.
    upstream: EventSource,
    next_id: AtomicU64,
    shutdown: ShutdownRx,
}

impl Router {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        container_rules_dir: PathBuf,
        kernel_events: bool,
        shutdown: ShutdownRx,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            clients: std::sync::Mutex::new(Vec::new()),
            container_rules_dir,
            cgroups: ManagerRegistry::default(),
            upstream: if kernel_events {
                EventSource::Kernel
            } else {
                EventSource::Udev
            },
            next_id: AtomicU64::new(0),
            shutdown,
        })
    }

    /// The netlink group matching the configured upstream source.
    pub fn upstream_group(&self) -> UeventGroup {
        match self.upstream {
            EventSource::Kernel => UeventGroup::Kernel,
            _ => UeventGroup::Udev,
        }
    }

    fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remove_client(&self, id: u64) {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|c| c.id != id);
    }

    /// Accept loop. Exits on shutdown, then waits for every per-client
    /// task; their failures are logged, never propagated.
    pub async fn run_accept(self: Arc<Self>, listener: UnixListener) {
        let mut shutdown = self.shutdown.clone();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let router = Arc::clone(&self);
                        tasks.spawn(async move { router.serve_client(stream).await });
                    }
                    Err(err) => {
                        error!(%err, "accept failed");
                    }
                },
            }
        }

        drop(listener);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "client task failed");
            }
        }
        info!("all clients finished");
    }

    /// Serve one connection through the full client state machine.
    pub async fn serve_client(self: Arc<Self>, stream: UnixStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, MessageCodec::new());
        let writer = FramedWrite::new(write_half, MessageCodec::new());
        let (client, mut queue_rx) = Client::new(id, writer);

        info!(id, "agent connected");
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&client));

        if self.handshake(&client, &mut reader).await {
            self.ready_loop(&client, &mut reader, &mut queue_rx).await;
        }

        self.remove_client(id);
        info!(id, name = %client.name(), "agent gone");
    }

    /// Handshake state: probe with `HELLO`, expect `hello <name>` within
    /// [`HANDSHAKE_TIMEOUT`]. Returns whether the client reached Ready.
    async fn handshake(
        &self,
        client: &Arc<Client>,
        reader: &mut FramedRead<tokio::net::unix::OwnedReadHalf, MessageCodec>,
    ) -> bool {
        if let Err(err) = client.send(Message::empty(command::HELLO)).await {
            info!(id = client.id, %err, "failed to greet agent");
            return false;
        }

        let mut shutdown = self.shutdown.clone();
        let reply = tokio::select! {
            _ = shutdown.changed() => None,
            reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next()) => match reply {
                Ok(Some(Ok(msg))) => Some(msg),
                Ok(Some(Err(err))) => {
                    info!(id = client.id, %err, "handshake read failed");
                    None
                }
                Ok(None) => None,
                Err(_elapsed) => {
                    warn!(id = client.id, "agent did not identify itself in time");
                    None
                }
            },
        };

        let Some(msg) = reply else {
            let _ = client.send(Message::new(command::BYE, "handshake timeout")).await;
            return false;
        };

        if msg.command != command::CLIENT_HELLO {
            warn!(id = client.id, command = %msg.command, "expected hello");
            let _ = client.send(Message::new(command::BYE, "protocol violation")).await;
            return false;
        }

        let name = msg.data_str().into_owned();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            warn!(id = client.id, name, "refusing unusable container name");
            let _ = client.send(Message::new(command::BYE, "bad name")).await;
            return false;
        }

        client.set_name(&name);
        client.set_ruleset(self.load_ruleset(&name));
        client.set_ready();
        info!(id = client.id, name, "agent ready");
        true
    }

    /// Load `<container_rules_dir>/<name>.rules`, falling back to the
    /// lowercased name. A missing or unparsable file leaves the client
    /// without a ruleset: every event passes with default forwarding.
    fn load_ruleset(&self, name: &str) -> Option<Arc<RuleSet>> {
        let mut path = self.container_rules_dir.join(format!("{name}.rules"));
        if !path.exists() {
            path = self
                .container_rules_dir
                .join(format!("{}.rules", name.to_lowercase()));
        }
        if !path.exists() {
            warn!(name, "no filter rules for container, forwarding everything");
            return None;
        }
        match rules::parse_file(&path, Dialect::Filter) {
            Ok(ruleset) => {
                info!(name, rules = ruleset.len(), path = %path.display(), "loaded filter rules");
                Some(Arc::new(ruleset))
            }
            Err(err) => {
                error!(name, %err, "could not load filter rules, forwarding everything");
                None
            }
        }
    }

    /// Ready state: concurrently service inbound messages, the deferred
    /// work queue, and program shutdown.
    async fn ready_loop(
        &self,
        client: &Arc<Client>,
        reader: &mut FramedRead<tokio::net::unix::OwnedReadHalf, MessageCodec>,
        queue_rx: &mut mpsc::UnboundedReceiver<WorkItem>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                inbound = reader.next() => match inbound {
                    Some(Ok(msg)) => {
                        if self.dispatch_inbound(client, msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        info!(id = client.id, %err, "agent stream error");
                        break;
                    }
                    None => {
                        info!(id = client.id, "agent closed the connection");
                        break;
                    }
                },
                item = queue_rx.recv() => {
                    if let Some(item) = item {
                        self.service_work_item(client, item).await;
                    }
                },
                _ = shutdown.changed() => {
                    let reason = shutdown
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "shutting down".into());
                    let _ = client.send(Message::new(command::BYE, reason)).await;
                    break;
                },
            }
        }
    }

    /// Handle one client-originated command.
    async fn dispatch_inbound(&self, client: &Arc<Client>, msg: Message) -> ControlFlow<()> {
        match msg.command.as_str() {
            command::CLIENT_BYE => {
                info!(id = client.id, reason = %msg.data_str(), "agent says bye");
                let _ = client.send(Message::new(command::BYE, "ACK")).await;
                ControlFlow::Break(())
            }
            command::CLIENT_BOOT => {
                self.replay(client, "boot", "add").await;
                ControlFlow::Continue(())
            }
            command::CLIENT_SHUTDOWN => {
                self.replay(client, "shutdown", "remove").await;
                ControlFlow::Continue(())
            }
            command::CLIENT_DRY_RUN => {
                info!(id = client.id, "agent runs dry");
                client.set_dry_run();
                ControlFlow::Continue(())
            }
            command::CLIENT_ECHO => {
                let _ = client.send(Message::new(command::ECHO, msg.data)).await;
                ControlFlow::Continue(())
            }
            other => {
                warn!(id = client.id, command = %other, "unknown command");
                ControlFlow::Continue(())
            }
        }
    }

    async fn service_work_item(&self, client: &Arc<Client>, item: WorkItem) {
        match item {
            WorkItem::SendUeventRaw(buffer) => {
                if let Err(err) = client.send(Message::new(command::UEVENT, buffer)).await {
                    info!(id = client.id, %err, "deferred uevent send failed");
                }
            }
            WorkItem::HandleUevent {
                device,
                action,
                event,
                source,
            } => {
                self.handle_uevent(client, &device, &action, event.as_ref(), source)
                    .await;
            }
        }
    }

    /// Bulk replay: walk every device below `<sys>/devices` top-down and
    /// push each through the filter pipeline, bracketed by
    /// `BEGINCMD`/`ENDCMD`.
    async fn replay(&self, client: &Arc<Client>, cmd: &str, action: &str) {
        info!(id = client.id, name = %client.name(), cmd, "bulk replay");
        if let Err(err) = client
            .send(Message::new(command::BEGINCMD, cmd.to_string()))
            .await
        {
            info!(id = client.id, %err, "replay bracket send failed");
            return;
        }

        let mut paths = Vec::new();
        walk_devices(&self.registry.sys_root().join("devices"), &mut paths);

        for path in paths {
            let Some(device) = self.registry.lookup_or_create(&path) else {
                continue;
            };
            self.handle_uevent(client, &device, action, None, EventSource::Sys)
                .await;
        }

        let _ = client
            .send(Message::new(command::ENDCMD, cmd.to_string()))
            .await;
    }

    /// The filter pipeline: evaluate the client's ruleset over the event,
    /// then perform cgroup arbitration, state forwarding, the `UEVENT`
    /// send, and any requested secondary emit.
    pub async fn handle_uevent(
        &self,
        client: &Arc<Client>,
        device: &SharedDevice,
        action: &str,
        event: Option<&UeventMessage>,
        source: EventSource,
    ) {
        if !client.is_ready() {
            return;
        }

        let mut ctx = RuleContext::new(Arc::clone(device), action, source);
        if let Some(ruleset) = client.ruleset() {
            let evaluation = ruleset.apply(&mut ctx, &self.registry);
            if tokio::time::timeout(RULE_TIMEOUT, evaluation).await.is_err() {
                warn!(
                    name = %client.name(),
                    ruleset = %ruleset.name,
                    "rule execution timed out, continuing with partial context"
                );
            }
        }

        if !ctx.result {
            debug!(name = %client.name(), devpath = %lock_read(device).devpath(), "event dropped");
            return;
        }

        // Cgroup arbitration.
        if !ctx.cgroups.is_empty()
            && (action == "add" || action == "remove")
            && !client.is_dry_run()
        {
            let container = client.name();
            let dev = lock_read(device);
            for controller in &ctx.cgroups {
                arbitrate(&self.cgroups, controller, &container, &dev, action == "add");
            }
        }

        // State forwarding.
        let selector = ctx.forward_selector();
        if action != "remove" && !selector.is_empty() {
            let sync = {
                let dev = lock_read(device);
                dev.id_filename()
                    .map(|_| (dev.devpath().to_string(), make_sync_buffer(&dev, selector)))
            };
            if let Some((devpath, buffer)) = sync {
                let payload = encode_sync(&devpath, selector, &buffer);
                if let Err(err) = client.send(Message::new(command::SYNC, payload)).await {
                    info!(id = client.id, %err, "sync send failed");
                    return;
                }
            }
        }

        // The event itself.
        let buffer = event_buffer(&ctx, device, action, event);
        if let Err(err) = client.send(Message::new(command::UEVENT, buffer)).await {
            info!(id = client.id, %err, "uevent send failed");
            return;
        }

        // Secondary emit.
        if let Some(emit) = ctx.emit.take() {
            let noenv = emit.options.contains(&EmitOption::NoEnv);
            let buffer = match emit.what.as_deref() {
                None | Some("" | ".") => {
                    if noenv {
                        UeventMessage::from_device(&lock_read(device), &emit.action, false).pack()
                    } else if let Some(event) = event {
                        event.clone_for_action(&emit.action).pack()
                    } else {
                        UeventMessage::from_device(&lock_read(device), &emit.action, true).pack()
                    }
                }
                Some(subpath) => {
                    let syspath = lock_read(device).syspath().join(subpath);
                    match self.registry.lookup_or_create(&syspath) {
                        Some(other) => {
                            UeventMessage::from_device(&lock_read(&other), &emit.action, !noenv)
                                .pack()
                        }
                        None => {
                            warn!(path = %syspath.display(), "emit target is not a device");
                            return;
                        }
                    }
                }
            };

            if emit.options.contains(&EmitOption::Queue) {
                client.enqueue(WorkItem::SendUeventRaw(buffer));
            } else if let Err(err) = client.send(Message::new(command::UEVENT, buffer)).await {
                info!(id = client.id, %err, "emit send failed");
            }
        }
    }

    /// Global netlink listener: parse, resolve, fan out in arrival order,
    /// and retire removed devices from the registry.
    pub async fn run_netlink(self: Arc<Self>, socket: UeventSocket) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let datagram = tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv() => match received {
                    Ok(datagram) => datagram,
                    Err(err) => {
                        error!(%err, "netlink receive failed");
                        break;
                    }
                },
            };

            let mut msg = match UeventMessage::parse(&datagram) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(%err, "unparsable uevent");
                    continue;
                }
            };

            let Some(device) = self.registry.insert_from_props(&msg.properties) else {
                warn!(devpath = %msg.devpath, "uevent for an unresolvable device");
                continue;
            };
            if msg.needs_bloom {
                msg.fill_bloom_from_device(&lock_read(&device));
            }

            let action = msg.action.clone();
            for client in self.snapshot_clients() {
                self.handle_uevent(&client, &device, &action, Some(&msg), self.upstream)
                    .await;
            }

            if action == "remove" {
                let syspath = lock_read(&device).syspath().to_path_buf();
                self.registry.invalidate(&syspath);
            }
        }
    }
}

/// Choose the wire bytes for the primary event. When the raw event is at
/// hand but the environment is not forwarded, the buffer is rebuilt from
/// the device's bare kernel properties.
fn event_buffer(
    ctx: &RuleContext,
    device: &SharedDevice,
    action: &str,
    event: Option<&UeventMessage>,
) -> Bytes {
    let with_env = ctx.forward_selector().env;
    match event {
        Some(_) if !with_env => {
            UeventMessage::from_device(&lock_read(device), action, false).pack()
        }
        Some(event) => event.wire_bytes(),
        None => UeventMessage::from_device(&lock_read(device), action, with_env).pack(),
    }
}

/// Read-lock a shared device (the scheduler is single-threaded; the lock
/// is never contended).
fn lock_read(device: &SharedDevice) -> std::sync::RwLockReadGuard<'_, cdev_core::Device> {
    device.read().unwrap_or_else(|e| e.into_inner())
}

/// Collect every directory below `root` that carries a `uevent` file,
/// parents before children. Symlinked directories are not followed; the
/// sysfs devices tree reaches everything through real directories.
fn walk_devices(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .collect();
    dirs.sort();

    for dir in dirs {
        if dir.join("uevent").is_file() {
            out.push(dir.clone());
        }
        walk_devices(&dir, out);
    }
}
