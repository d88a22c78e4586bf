//! The seam to the peer-to-peer layer.
//!
//! The managers never talk to the wire protocol directly. They call the
//! [`Network`] capability through [`NetworkClient`], which runs every call on
//! a worker thread and gives up after a timeout, so a stalled peer cannot
//! block a manager (or the lock it holds) indefinitely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::model::{MessageKind, PeerAddress, PublicKey, Receipt, SessionHandle, TransferId};

pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("peer is offline")]
    Offline,
    #[error("network call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected by network layer: {0}")]
    Rejected(String),
    #[error("network unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileControl {
    Pause,
    Resume,
    Cancel,
}

/// Outbound capabilities of the peer-to-peer layer.
pub trait Network: Send + Sync {
    /// Send a friend request; returns the handle assigned to the new peer.
    fn request_friend(&self, address: &PeerAddress, message: &str)
        -> Result<SessionHandle, NetworkError>;

    /// Accept an incoming friend request.
    fn accept_friend(&self, public_key: &PublicKey) -> Result<SessionHandle, NetworkError>;

    fn send_message(
        &self,
        handle: SessionHandle,
        kind: MessageKind,
        content: &str,
    ) -> Result<Receipt, NetworkError>;

    fn offer_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        file_name: &str,
        size: u64,
    ) -> Result<(), NetworkError>;

    fn accept_file(&self, handle: SessionHandle, transfer: TransferId) -> Result<(), NetworkError>;

    fn control_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        control: FileControl,
    ) -> Result<(), NetworkError>;
}

/// A network that is never connected. Used by tooling that only reads the
/// store, and as the initial state before the P2P layer comes up.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineNetwork;

impl Network for OfflineNetwork {
    fn request_friend(&self, _: &PeerAddress, _: &str) -> Result<SessionHandle, NetworkError> {
        Err(NetworkError::Offline)
    }

    fn accept_friend(&self, _: &PublicKey) -> Result<SessionHandle, NetworkError> {
        Err(NetworkError::Offline)
    }

    fn send_message(&self, _: SessionHandle, _: MessageKind, _: &str) -> Result<Receipt, NetworkError> {
        Err(NetworkError::Offline)
    }

    fn offer_file(&self, _: SessionHandle, _: TransferId, _: &str, _: u64) -> Result<(), NetworkError> {
        Err(NetworkError::Offline)
    }

    fn accept_file(&self, _: SessionHandle, _: TransferId) -> Result<(), NetworkError> {
        Err(NetworkError::Offline)
    }

    fn control_file(&self, _: SessionHandle, _: TransferId, _: FileControl) -> Result<(), NetworkError> {
        Err(NetworkError::Offline)
    }
}

/// Run `f` against `network` on a worker thread, waiting at most `timeout`.
///
/// On timeout the worker is left to finish on its own; its result is
/// discarded.
pub fn bounded_call<T, F>(
    network: &Arc<dyn Network>,
    timeout: Duration,
    op: &'static str,
    f: F,
) -> Result<T, NetworkError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Network) -> Result<T, NetworkError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let network = Arc::clone(network);
    thread::Builder::new()
        .name(format!("parley-net-{op}"))
        .spawn(move || {
            // The receiver is gone if the caller already timed out.
            let _ = tx.send(f(network.as_ref()));
        })
        .map_err(|e| NetworkError::Unavailable(format!("failed to spawn worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(op, timeout_ms = timeout.as_millis() as u64, "network call timed out");
            Err(NetworkError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            warn!(op, "network worker exited without a result");
            Err(NetworkError::Unavailable(format!("{op} worker panicked")))
        }
    }
}

/// Shared handle the managers use to reach the network with a bounded
/// timeout. The timeout can be changed at runtime by a settings reload.
pub struct NetworkClient {
    inner: Arc<dyn Network>,
    timeout_ms: AtomicU64,
}

impl NetworkClient {
    pub fn new(inner: Arc<dyn Network>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn offline() -> Self {
        Self::new(Arc::new(OfflineNetwork), DEFAULT_NETWORK_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, NetworkError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Network) -> Result<T, NetworkError> + Send + 'static,
    {
        bounded_call(&self.inner, self.timeout(), op, f)
    }

    pub fn request_friend(
        &self,
        address: PeerAddress,
        message: String,
    ) -> Result<SessionHandle, NetworkError> {
        self.call("request-friend", move |net| net.request_friend(&address, &message))
    }

    pub fn accept_friend(&self, public_key: PublicKey) -> Result<SessionHandle, NetworkError> {
        self.call("accept-friend", move |net| net.accept_friend(&public_key))
    }

    pub fn send_message(
        &self,
        handle: SessionHandle,
        kind: MessageKind,
        content: String,
    ) -> Result<Receipt, NetworkError> {
        self.call("send-message", move |net| net.send_message(handle, kind, &content))
    }

    pub fn offer_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        file_name: String,
        size: u64,
    ) -> Result<(), NetworkError> {
        self.call("offer-file", move |net| {
            net.offer_file(handle, transfer, &file_name, size)
        })
    }

    pub fn accept_file(&self, handle: SessionHandle, transfer: TransferId) -> Result<(), NetworkError> {
        self.call("accept-file", move |net| net.accept_file(handle, transfer))
    }

    pub fn control_file(
        &self,
        handle: SessionHandle,
        transfer: TransferId,
        control: FileControl,
    ) -> Result<(), NetworkError> {
        self.call("control-file", move |net| {
            net.control_file(handle, transfer, control)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scriptable network double shared by the manager unit tests.

    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct ScriptedNetwork {
        pub offline: AtomicBool,
        pub hang: AtomicBool,
        pub next_handle: AtomicU32,
        pub next_receipt: AtomicU32,
        pub sent: Mutex<Vec<(SessionHandle, MessageKind, String)>>,
        pub offers: Mutex<Vec<(SessionHandle, TransferId, String, u64)>>,
        pub controls: Mutex<Vec<(SessionHandle, TransferId, FileControl)>>,
        pub friend_requests: Mutex<Vec<(PublicKey, String)>>,
    }

    impl ScriptedNetwork {
        pub fn new() -> Arc<Self> {
            let net = Self::default();
            net.next_handle.store(100, Ordering::SeqCst);
            net.next_receipt.store(1, Ordering::SeqCst);
            Arc::new(net)
        }

        fn gate(&self) -> Result<(), NetworkError> {
            if self.hang.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(30));
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Offline);
            }
            Ok(())
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Network for ScriptedNetwork {
        fn request_friend(
            &self,
            address: &PeerAddress,
            message: &str,
        ) -> Result<SessionHandle, NetworkError> {
            self.gate()?;
            self.friend_requests
                .lock()
                .unwrap()
                .push((address.public_key, message.to_string()));
            Ok(SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn accept_friend(&self, _: &PublicKey) -> Result<SessionHandle, NetworkError> {
            self.gate()?;
            Ok(SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn send_message(
            &self,
            handle: SessionHandle,
            kind: MessageKind,
            content: &str,
        ) -> Result<Receipt, NetworkError> {
            self.gate()?;
            self.sent
                .lock()
                .unwrap()
                .push((handle, kind, content.to_string()));
            Ok(Receipt(self.next_receipt.fetch_add(1, Ordering::SeqCst)))
        }

        fn offer_file(
            &self,
            handle: SessionHandle,
            transfer: TransferId,
            file_name: &str,
            size: u64,
        ) -> Result<(), NetworkError> {
            self.gate()?;
            self.offers
                .lock()
                .unwrap()
                .push((handle, transfer, file_name.to_string(), size));
            Ok(())
        }

        fn accept_file(&self, _: SessionHandle, _: TransferId) -> Result<(), NetworkError> {
            self.gate()
        }

        fn control_file(
            &self,
            handle: SessionHandle,
            transfer: TransferId,
            control: FileControl,
        ) -> Result<(), NetworkError> {
            self.gate()?;
            self.controls
                .lock()
                .unwrap()
                .push((handle, transfer, control));
            Ok(())
        }
    }

    pub fn client(net: &Arc<ScriptedNetwork>) -> Arc<NetworkClient> {
        let dyn_net: Arc<dyn Network> = net.clone();
        Arc::new(NetworkClient::new(dyn_net, Duration::from_secs(2)))
    }
}
