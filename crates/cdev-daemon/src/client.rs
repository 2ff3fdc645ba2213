//! Host-side record of one connected container agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cdev_core::proto::{Message, MessageCodec, ProtocolError};
use cdev_core::rules::RuleSet;
use cdev_core::{EventSource, SharedDevice, UeventMessage};
use futures::SinkExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedWrite;

/// Deferred outbound work, serviced by the client's ready loop.
pub enum WorkItem {
    /// Emit `UEVENT <buffer>`.
    SendUeventRaw(Bytes),
    /// Re-enter the filter pipeline (reserved for future fan-in).
    #[allow(dead_code)]
    HandleUevent {
        device: SharedDevice,
        action: String,
        event: Option<UeventMessage>,
        source: EventSource,
    },
}

/// One connected agent: identity, flags, compiled ruleset, framed writer
/// and the deferred work queue.
///
/// Events are written by whichever task produced them (netlink fan-out or
/// the client's own loop); the writer mutex keeps frames whole, and the
/// single-threaded scheduler keeps them in arrival order.
pub struct Client {
    pub id: u64,
    name: std::sync::Mutex<Option<String>>,
    ready: AtomicBool,
    dry_run: AtomicBool,
    ruleset: std::sync::Mutex<Option<Arc<RuleSet>>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    queue_tx: mpsc::UnboundedSender<WorkItem>,
}

impl Client {
    /// Create the record plus the receive half of its work queue.
    pub fn new(
        id: u64,
        writer: FramedWrite<OwnedWriteHalf, MessageCodec>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkItem>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            id,
            name: std::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
            dry_run: AtomicBool::new(false),
            ruleset: std::sync::Mutex::new(None),
            writer: Mutex::new(writer),
            queue_tx,
        });
        (client, queue_rx)
    }

    /// Container name from the handshake; placeholder before it.
    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| format!("<client-{}>", self.id))
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub fn set_dry_run(&self) {
        self.dry_run.store(true, Ordering::Relaxed);
    }

    pub fn ruleset(&self) -> Option<Arc<RuleSet>> {
        self.ruleset
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_ruleset(&self, ruleset: Option<Arc<RuleSet>>) {
        *self.ruleset.lock().unwrap_or_else(|e| e.into_inner()) = ruleset;
    }

    /// Write one framed message. Errors surface to the caller, which
    /// treats them as a broken peer, not a daemon failure.
    pub async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        self.writer.lock().await.send(msg).await
    }

    /// Defer an item to the client's work queue. Returns false when the
    /// client is already gone.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        self.queue_tx.send(item).is_ok()
    }
}
