//! Inbound network events, outbound UI notifications, and the bounded queue
//! that carries network events to a single dispatcher thread.
//!
//! The network layer produces [`NetworkEvent`]s from its own threads and
//! submits them through an [`EventSender`]. The dispatcher hands them to the
//! managers one at a time, so handlers never run concurrently with each other
//! and events from one peer are applied in arrival order.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{
    Contact, Message, MessageKind, Presence, PublicKey, Receipt, SessionHandle, Transfer,
    TransferId,
};

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of the UI broadcast channel. Slow subscribers lag and lose the
/// oldest notifications rather than blocking the managers.
pub const UI_CHANNEL_CAPACITY: usize = 256;

/// Something the network layer observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    FriendRequest {
        public_key: PublicKey,
        message: String,
    },
    FriendAccepted {
        public_key: PublicKey,
        handle: SessionHandle,
    },
    /// A known peer came back under a new handle.
    SessionAssigned {
        public_key: PublicKey,
        handle: SessionHandle,
    },
    PresenceChanged {
        handle: SessionHandle,
        presence: Presence,
    },
    NameChanged {
        handle: SessionHandle,
        name: String,
    },
    StatusMessageChanged {
        handle: SessionHandle,
        status_message: String,
    },
    MessageReceived {
        handle: SessionHandle,
        kind: MessageKind,
        content: String,
    },
    DeliveryReceipt {
        handle: SessionHandle,
        receipt: Receipt,
    },
    FileOffer {
        handle: SessionHandle,
        file_name: String,
        size: u64,
    },
    PeerAcceptedFile {
        transfer: TransferId,
    },
    ChunkProgress {
        transfer: TransferId,
        bytes: u64,
    },
    TransferFailed {
        transfer: TransferId,
        reason: String,
    },
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkEvent::FriendRequest { .. } => "friend_request",
            NetworkEvent::FriendAccepted { .. } => "friend_accepted",
            NetworkEvent::SessionAssigned { .. } => "session_assigned",
            NetworkEvent::PresenceChanged { .. } => "presence_changed",
            NetworkEvent::NameChanged { .. } => "name_changed",
            NetworkEvent::StatusMessageChanged { .. } => "status_message_changed",
            NetworkEvent::MessageReceived { .. } => "message_received",
            NetworkEvent::DeliveryReceipt { .. } => "delivery_receipt",
            NetworkEvent::FileOffer { .. } => "file_offer",
            NetworkEvent::PeerAcceptedFile { .. } => "peer_accepted_file",
            NetworkEvent::ChunkProgress { .. } => "chunk_progress",
            NetworkEvent::TransferFailed { .. } => "transfer_failed",
        }
    }
}

/// Notifications for the UI, emitted only after the change is persisted.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    ContactUpdated {
        contact: Contact,
    },
    FriendRequestReceived {
        public_key: PublicKey,
        message: String,
    },
    MessageReceived {
        message: Message,
    },
    MessageDelivered {
        uuid: Uuid,
        delivered_at: Option<u64>,
    },
    TransferUpdated {
        transfer: Transfer,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("event queue is full")]
    Full,
    #[error("event queue is shut down")]
    Closed,
}

enum Envelope {
    Event(NetworkEvent),
    Stop,
}

/// Producer side of an [`EventQueue`]. Cheap to clone; one per network thread.
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<Envelope>,
}

impl EventSender {
    /// Enqueue `event`, waiting for room if the queue is full.
    pub fn submit(&self, event: NetworkEvent) -> Result<(), QueueError> {
        self.tx
            .send(Envelope::Event(event))
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueue `event` without waiting.
    pub fn try_submit(&self, event: NetworkEvent) -> Result<(), QueueError> {
        self.tx
            .try_send(Envelope::Event(event))
            .map_err(|e| match e {
                TrySendError::Full(_) => QueueError::Full,
                TrySendError::Disconnected(_) => QueueError::Closed,
            })
    }
}

/// Bounded FIFO of network events drained by one dispatcher thread.
pub struct EventQueue {
    tx: SyncSender<Envelope>,
    worker: Option<JoinHandle<()>>,
}

impl EventQueue {
    /// Spawn the dispatcher. `handler` sees every submitted event in order.
    pub fn start<F>(capacity: usize, handler: F) -> std::io::Result<Self>
    where
        F: FnMut(NetworkEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("parley-events".into())
            .spawn(move || dispatch_loop(rx, handler))?;
        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Process everything already queued, then stop the dispatcher. Events
    /// submitted afterwards fail with [`QueueError::Closed`].
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        // Fails only if the dispatcher already exited.
        let _ = self.tx.send(Envelope::Stop);
        if worker.join().is_err() {
            warn!("event dispatcher panicked");
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop<F>(rx: Receiver<Envelope>, mut handler: F)
where
    F: FnMut(NetworkEvent),
{
    for envelope in rx.iter() {
        match envelope {
            Envelope::Event(event) => handler(event),
            Envelope::Stop => break,
        }
    }
    debug!("event dispatcher stopped");
    // Dropping `rx` here makes later submits fail with Closed.
}
