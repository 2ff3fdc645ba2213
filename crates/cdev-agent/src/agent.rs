//! The container agent's protocol loop.
//!
//! Startup: connect to the host socket, await `HELLO`, identify with
//! `hello <name>`, optionally declare `dry_run` and request a bulk replay.
//! Then every host message is dispatched until the connection closes, the
//! bulk replay finishes (in `--boot-only`/`--shutdown` runs), a control
//! request asks for exit, or a signal arrives.
//!
//! Each `UEVENT` runs the client rules, flushes modified device state,
//! materializes or removes the device node, and finally rebroadcasts the
//! raw buffer on the container's udev netlink group so in-container
//! libudev consumers see a normal udev world.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cdev_core::device::{store_sync_buffer, DeviceRegistry};
use cdev_core::proto::{command, parse_sync, Message, MessageCodec};
use cdev_core::rules::{self, Dialect, EventSource, RuleContext, RuleSet};
use cdev_core::runtime::{ShutdownRx, HANDSHAKE_TIMEOUT};
use cdev_core::{UeventGroup, UeventMessage, UeventSocket};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::control::ControlRequest;
use crate::nodes;

type HostLink = Framed<UnixStream, MessageCodec>;

/// Which bulk replay to request after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRequest {
    /// Replay current devices as `add`.
    Boot,
    /// Replay current devices as `remove`.
    Shutdown,
}

/// The container agent.
pub struct Agent {
    registry: Arc<DeviceRegistry>,
    presets: Vec<RuleSet>,
    rules_dir: PathBuf,
    dev_root: PathBuf,
    dry: bool,
    netlink: UeventSocket,
    bulk: Option<BulkRequest>,
    /// Complete the program when the bulk replay's `ENDCMD` arrives
    /// (`--boot-only` / `--shutdown`).
    finish_after_bulk: bool,
}

impl Agent {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        rules_dir: PathBuf,
        dev_root: PathBuf,
        dry: bool,
        netlink: UeventSocket,
        bulk: Option<BulkRequest>,
        finish_after_bulk: bool,
    ) -> Self {
        let presets = rules::load_rules_dir(&rules_dir, Dialect::Client);
        info!(files = presets.len(), dir = %rules_dir.display(), "loaded client rules");
        Self {
            registry,
            presets,
            rules_dir,
            dev_root,
            dry,
            netlink,
            bulk,
            finish_after_bulk,
        }
    }

    /// Run the full agent lifecycle over an established host connection.
    pub async fn run(
        mut self,
        stream: UnixStream,
        name: &str,
        mut control_rx: mpsc::Receiver<ControlRequest>,
        mut shutdown: ShutdownRx,
    ) -> Result<()> {
        let mut host = Framed::new(stream, MessageCodec::new());

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, host.next()).await {
            Ok(Some(Ok(msg))) if msg.command == command::HELLO => {}
            Ok(Some(Ok(msg))) => {
                let _ = host
                    .send(Message::new(command::CLIENT_BYE, "protocol violation"))
                    .await;
                bail!("host sent {} instead of HELLO", msg.command);
            }
            Ok(Some(Err(err))) => return Err(err).context("handshake read failed"),
            Ok(None) => bail!("host closed the connection during handshake"),
            Err(_elapsed) => {
                let _ = host
                    .send(Message::new(command::CLIENT_BYE, "handshake timeout"))
                    .await;
                bail!("host did not greet us in time");
            }
        }

        host.send(Message::new(command::CLIENT_HELLO, name.to_string()))
            .await
            .context("hello send failed")?;
        if self.dry {
            host.send(Message::empty(command::CLIENT_DRY_RUN))
                .await
                .context("dry_run send failed")?;
        }

        match self.bulk {
            Some(BulkRequest::Boot) => {
                host.send(Message::empty(command::CLIENT_BOOT)).await?;
            }
            Some(BulkRequest::Shutdown) => {
                host.send(Message::empty(command::CLIENT_SHUTDOWN)).await?;
            }
            None => {}
        }

        info!(name, dry = self.dry, "agent running");

        loop {
            tokio::select! {
                inbound = host.next() => match inbound {
                    Some(Ok(msg)) => {
                        if self.dispatch(&mut host, msg).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        info!(%err, "host stream error");
                        break;
                    }
                    None => {
                        info!("host connection closed");
                        break;
                    }
                },
                request = control_rx.recv() => match request {
                    Some(ControlRequest::Reload) => self.reload_rules(),
                    Some(ControlRequest::Exit) => {
                        let _ = host
                            .send(Message::new(command::CLIENT_BYE, "control exit"))
                            .await;
                        break;
                    }
                    None => {}
                },
                _ = shutdown.changed() => {
                    let reason = shutdown
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "shutting down".into());
                    let _ = host.send(Message::new(command::CLIENT_BYE, reason)).await;
                    break;
                },
            }
        }

        Ok(())
    }

    /// Handle one host message.
    async fn dispatch(&mut self, host: &mut HostLink, msg: Message) -> ControlFlow<()> {
        match msg.command.as_str() {
            command::UEVENT => {
                self.handle_uevent(&msg.data).await;
                ControlFlow::Continue(())
            }
            command::SYNC => {
                self.handle_sync(&msg.data);
                ControlFlow::Continue(())
            }
            command::BEGINCMD => {
                debug!(cmd = %msg.data_str(), "bulk replay begins");
                ControlFlow::Continue(())
            }
            command::ENDCMD => {
                info!(cmd = %msg.data_str(), "bulk replay finished");
                if self.finish_after_bulk {
                    let _ = host
                        .send(Message::new(command::CLIENT_BYE, "replay done"))
                        .await;
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
            command::BYE => {
                info!(reason = %msg.data_str(), "host says bye");
                let _ = host.send(Message::empty(command::CLIENT_BYE)).await;
                ControlFlow::Break(())
            }
            command::ECHO => {
                info!(payload = %msg.data_str(), "echo reply");
                ControlFlow::Continue(())
            }
            other => {
                warn!(command = %other, "unknown command");
                ControlFlow::Continue(())
            }
        }
    }

    /// One forwarded event: client rules, state flush, node
    /// materialization, rebroadcast.
    async fn handle_uevent(&mut self, data: &[u8]) {
        let msg = match UeventMessage::parse(data) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "unparsable forwarded uevent");
                return;
            }
        };
        let Some(device) = self.registry.insert_from_props(&msg.properties) else {
            warn!(devpath = %msg.devpath, "uevent for an unresolvable device");
            return;
        };

        debug!(action = %msg.action, devpath = %msg.devpath, "handling uevent");

        let mut ctx = RuleContext::new(Arc::clone(&device), msg.action.as_str(), EventSource::Udev);
        // One ruleset going wrong must not drop the event; evaluation is
        // infallible and each file was vetted at parse time, so applying
        // them one by one is all the isolation needed.
        for preset in &self.presets {
            preset.apply(&mut ctx, &self.registry).await;
        }

        if !self.dry {
            for modified in &ctx.modified {
                let dev = modified.read().unwrap_or_else(|e| e.into_inner());
                if let Err(err) = self.registry.flush(&dev) {
                    warn!(devpath = dev.devpath(), %err, "device state flush failed");
                }
            }

            {
                let dev = device.read().unwrap_or_else(|e| e.into_inner());
                match msg.action.as_str() {
                    "add" => nodes::create_node(&self.dev_root, &dev, &ctx),
                    "remove" => nodes::remove_node(&self.dev_root, &dev),
                    _ => {}
                }
            }
        }

        // Rebroadcast for in-container libudev consumers; nobody listening
        // is fine.
        if let Err(err) = self.netlink.send(data, UeventGroup::Udev).await {
            warn!(%err, "uevent rebroadcast failed");
        }

        if msg.action == "remove" {
            let syspath = {
                let dev = device.read().unwrap_or_else(|e| e.into_inner());
                dev.syspath().to_path_buf()
            };
            self.registry.invalidate(&syspath);
        }
    }

    /// Cross-boundary state carry: merge the selected components into the
    /// device and persist them.
    fn handle_sync(&self, data: &[u8]) {
        let (devpath, selector, buffer) = match parse_sync(data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%err, "malformed SYNC payload");
                return;
            }
        };
        let Some(device) = self.registry.lookup_or_create_devpath(&devpath) else {
            warn!(devpath, "SYNC for an unknown device");
            return;
        };

        let mut dev = device.write().unwrap_or_else(|e| e.into_inner());
        store_sync_buffer(&mut dev, selector, &buffer);
        debug!(devpath, %selector, "stored sync state");

        if !self.dry {
            if let Err(err) = self.registry.flush(&dev) {
                warn!(devpath = dev.devpath(), %err, "device state flush failed");
            }
        }
    }

    fn reload_rules(&mut self) {
        self.presets = rules::load_rules_dir(&self.rules_dir, Dialect::Client);
        info!(files = self.presets.len(), "client rules reloaded");
    }
}
