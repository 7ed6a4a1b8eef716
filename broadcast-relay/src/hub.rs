//! Connection registry and broadcast fan-out.
//!
//! The hub is shared between every connection task as an `Arc<Hub>`. Each
//! connection's open, message and close events run on that connection's own
//! task, possibly on different worker threads, so the registry lives behind a
//! mutex. Broadcasts copy the recipient list while holding the lock and send
//! after releasing it; a concurrent deregistration can therefore never touch
//! the set being iterated.
//!
//! Sends never block. Every channel owns an unbounded outbound queue that a
//! forwarder task drains into the socket, so one slow peer only grows its own
//! queue and never delays delivery to the others.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

pub type ChannelId = u64;

/// Opaque message relayed between clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Receiving half of a channel's outbound queue.
pub type Mailbox = mpsc::UnboundedReceiver<Payload>;

/// Returned by [`ChannelHandle::send`] when the remote end is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unreachable(pub ChannelId);

impl std::fmt::Display for Unreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel {} is unreachable", self.0)
    }
}

impl std::error::Error for Unreachable {}

/// Handle to one connected client. Cloning it is cheap; all clones refer to
/// the same outbound queue.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Payload>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId) -> (Self, Mailbox) {
        let (outbound, mailbox) = mpsc::unbounded_channel();
        (Self { id, outbound }, mailbox)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queues `payload` for delivery. Fails once the mailbox has been dropped.
    pub fn send(&self, payload: Payload) -> Result<(), Unreachable> {
        self.outbound.send(payload).map_err(|_| Unreachable(self.id))
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

/// Outcome of a single [`Hub::broadcast`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Hub {
    channels: Mutex<HashMap<ChannelId, ChannelHandle>>,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ChannelId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh channel identity with its outbound queue. The
    /// channel is not a broadcast target until it is registered.
    pub fn open_channel(&self) -> (ChannelHandle, Mailbox) {
        ChannelHandle::new(self.next_id())
    }

    pub async fn register(&self, channel: ChannelHandle) {
        let mut channels = self.channels.lock().await;
        channels.insert(channel.id(), channel);
    }

    /// Removes the channel if present. Returns `false` when it was already
    /// gone, which happens when a failed send pruned it before its close
    /// notification arrived.
    pub async fn deregister(&self, id: ChannelId) -> bool {
        let mut channels = self.channels.lock().await;
        channels.remove(&id).is_some()
    }

    /// Sends `payload` to every registered channel except `sender`.
    pub async fn broadcast(&self, sender: ChannelId, payload: Payload) -> BroadcastReport {
        let recipients = self.snapshot_except(sender).await;

        let mut report = BroadcastReport::default();
        let mut unreachable = Vec::new();
        for recipient in recipients {
            match recipient.send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!(channel_id = recipient.id(), %err, "dropping unreachable recipient");
                    report.dropped += 1;
                    unreachable.push(recipient.id());
                }
            }
        }

        if !unreachable.is_empty() {
            let mut channels = self.channels.lock().await;
            for id in unreachable {
                channels.remove(&id);
            }
        }

        report
    }

    async fn snapshot_except(&self, sender: ChannelId) -> Vec<ChannelHandle> {
        let channels = self.channels.lock().await;
        channels
            .values()
            .filter(|channel| channel.id() != sender)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, id: ChannelId) -> bool {
        self.channels.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        let channels = self.channels.lock().await;
        let mut ids: Vec<_> = channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Empties the registry and returns how many channels were dropped.
    /// Dropping the handles ends every forwarder once its queue drains.
    pub async fn close_all(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let closed = channels.len();
        channels.clear();
        closed
    }
}
