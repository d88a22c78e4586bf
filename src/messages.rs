//! Per-peer message log.
//!
//! Messages are appended, never rewritten wholesale: edits keep the first
//! original text, deletes only set a flag. Every row is keyed by a UUIDv7
//! generated locally, and reads order by `(created_at, uuid)`.
//!
//! Outgoing messages are written before they are handed to the network.
//! Delivery is at most once: a message the network refused is queued and
//! sent when the peer comes back online, but a message that was handed over
//! (including a call that timed out) is only sent again by `resend_message`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Row};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contacts::ContactManager;
use crate::logging::{msg_id, peer_id};
use crate::model::{
    now_millis, uuid_millis, Contact, Direction, FileRef, Message, MessageKind, PublicKey,
    Receipt, SessionHandle,
};
use crate::network::{NetworkClient, NetworkError};
use crate::storage::{column_opt_millis, column_opt_uuid, column_uuid, Storage, StorageError, Tx};

/// Upper bound on rows returned by one read.
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message content is empty")]
    ContentEmpty,
    #[error("no contact holds session handle {0}")]
    ContactNotFound(SessionHandle),
    #[error("contact {0} is blocked")]
    ContactBlocked(PublicKey),
    #[error("message {0} not found")]
    NotFound(Uuid),
    #[error("message {0} was not sent by us")]
    NotOwnMessage(Uuid),
    /// The message was stored but could not be handed to the network. It
    /// stays undelivered and is retried when the peer reconnects.
    #[error("message stored but not sent: {reason}")]
    NetworkUnavailable {
        message: Box<Message>,
        reason: NetworkError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str = "m.uuid, m.contact_key, m.session_handle, m.content, \
     m.message_type, m.direction, m.created_at, m.delivered_at, m.read_at, m.edited_at, \
     m.original_content, m.file_path, m.file_size, m.file_mime, m.deleted, m.reply_to, \
     m.dispatched_at";

pub(crate) fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let file = match row.get::<_, Option<i64>>(12)? {
        Some(size) => Some(FileRef {
            path: row.get(11)?,
            size: size as u64,
            mime: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Message {
        uuid: column_uuid(row, 0)?,
        contact_key: row.get(1)?,
        session_handle: row.get(2)?,
        content: row.get(3)?,
        kind: row.get(4)?,
        direction: row.get(5)?,
        created_at: row.get::<_, i64>(6)? as u64,
        delivered_at: column_opt_millis(row, 7)?,
        read_at: column_opt_millis(row, 8)?,
        edited_at: column_opt_millis(row, 9)?,
        original_content: row.get(10)?,
        file,
        deleted: row.get(14)?,
        reply_to: column_opt_uuid(row, 15)?,
        dispatched_at: column_opt_millis(row, 16)?,
    })
}

/// A new message owned by `contact`, stamped with a fresh UUIDv7 whose
/// timestamp doubles as `created_at`.
pub(crate) fn compose(
    contact: &Contact,
    handle: Option<SessionHandle>,
    content: &str,
    kind: MessageKind,
    direction: Direction,
) -> Message {
    let uuid = Uuid::now_v7();
    let created_at = uuid_millis(&uuid).unwrap_or_else(now_millis);
    Message {
        uuid,
        contact_key: contact.public_key,
        session_handle: handle,
        content: content.to_string(),
        kind,
        direction,
        created_at,
        delivered_at: None,
        dispatched_at: None,
        read_at: None,
        edited_at: None,
        original_content: None,
        file: None,
        deleted: false,
        reply_to: None,
    }
}

pub(crate) fn insert_message(tx: &Tx<'_>, m: &Message) -> Result<(), StorageError> {
    let (file_path, file_size, file_mime) = match &m.file {
        Some(file) => (
            file.path.clone(),
            Some(file.size as i64),
            Some(file.mime.clone()),
        ),
        None => (None, None, None),
    };
    tx.exec(
        "INSERT INTO messages (uuid, contact_key, session_handle, content, message_type,
                               direction, created_at, delivered_at, read_at, file_path,
                               file_size, file_mime, deleted, reply_to)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13)",
        params![
            m.uuid.to_string(),
            m.contact_key,
            m.session_handle,
            m.content,
            m.kind,
            m.direction,
            m.created_at as i64,
            m.delivered_at.map(|v| v as i64),
            m.read_at.map(|v| v as i64),
            file_path,
            file_size,
            file_mime,
            m.reply_to.map(|u| u.to_string()),
        ],
    )?;
    Ok(())
}

/// Quote every whitespace-separated term so user input cannot use FTS5
/// query syntax. Terms are ANDed.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn clamp_limit(limit: usize) -> i64 {
    limit.min(MAX_PAGE_SIZE) as i64
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Receipts held back while sends are in progress, at most.
const MAX_EARLY_RECEIPTS: usize = 1024;

/// Called with a message whose receipt arrived before its send returned.
pub type DeliveryListener = Box<dyn Fn(&Message) + Send + Sync>;

/// Sends in progress and messages awaiting acknowledgement. Never locked
/// across a network or storage call.
#[derive(Default)]
struct Outbox {
    /// Messages with a network call in progress.
    sending: HashSet<Uuid>,
    by_receipt: HashMap<(SessionHandle, Receipt), Uuid>,
    /// Receipts that matched nothing while a send was still in progress.
    early: HashSet<(SessionHandle, Receipt)>,
}

pub struct MessageManager {
    storage: Arc<Storage>,
    contacts: Arc<ContactManager>,
    network: Arc<NetworkClient>,
    outbox: Mutex<Outbox>,
    listener: Mutex<Option<DeliveryListener>>,
}

impl MessageManager {
    pub fn new(
        storage: Arc<Storage>,
        contacts: Arc<ContactManager>,
        network: Arc<NetworkClient>,
    ) -> Self {
        Self {
            storage,
            contacts,
            network,
            outbox: Mutex::new(Outbox::default()),
            listener: Mutex::new(None),
        }
    }

    /// Register the callback for deliveries that `on_delivery_receipt` could
    /// not report because the receipt beat the send's return.
    pub fn set_delivery_listener(&self, listener: DeliveryListener) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, handle: SessionHandle) -> Result<Contact, MessageError> {
        self.contacts
            .contact_by_handle(handle)
            .ok_or(MessageError::ContactNotFound(handle))
    }

    /// Mark `uuid` as being sent. False if another caller already is.
    fn claim(&self, uuid: Uuid) -> bool {
        self.lock_outbox().sending.insert(uuid)
    }

    /// Hand `message` to the network and release its claim. The caller must
    /// hold the claim. Once the network has the message (or may have it,
    /// after a timeout) the row is stamped `dispatched_at` so it is never
    /// sent again automatically.
    fn dispatch(&self, handle: SessionHandle, message: &Message) -> Result<Receipt, NetworkError> {
        let result = self
            .network
            .send_message(handle, message.kind, message.content.clone());
        if matches!(&result, Ok(_) | Err(NetworkError::Timeout(_))) {
            self.mark_dispatched(message.uuid);
        }

        let acknowledged = {
            let mut outbox = self.lock_outbox();
            outbox.sending.remove(&message.uuid);
            let acknowledged = match &result {
                Ok(receipt) => {
                    let key = (handle, *receipt);
                    if outbox.early.remove(&key) {
                        true
                    } else {
                        outbox.by_receipt.insert(key, message.uuid);
                        false
                    }
                }
                Err(_) => false,
            };
            if outbox.sending.is_empty() {
                outbox.early.clear();
            }
            acknowledged
        };

        if acknowledged {
            match self.mark_delivered(message.uuid) {
                Ok(Some(delivered)) => self.notify_delivered(&delivered),
                Ok(None) => {}
                Err(err) => {
                    warn!(msg = %msg_id(&message.uuid), error = %err, "failed to record delivery")
                }
            }
        }
        result
    }

    fn mark_dispatched(&self, uuid: Uuid) {
        if let Err(err) = self.storage.exec(
            "UPDATE messages SET dispatched_at = COALESCE(dispatched_at, ?2) WHERE uuid = ?1",
            params![uuid.to_string(), now_millis() as i64],
        ) {
            warn!(msg = %msg_id(&uuid), error = %err, "failed to record dispatch");
        }
    }

    fn notify_delivered(&self, message: &Message) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = listener.as_ref() {
            listener(message);
        }
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Persist an outgoing message, then send it. The returned message has no
    /// `delivered_at` until the peer's receipt arrives.
    pub fn send_message(
        &self,
        handle: SessionHandle,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, MessageError> {
        self.send_inner(handle, content, kind, None)
    }

    /// Send a reply to an earlier message in the same conversation.
    pub fn send_reply(
        &self,
        handle: SessionHandle,
        reply_to: Uuid,
        content: &str,
    ) -> Result<Message, MessageError> {
        self.send_inner(handle, content, MessageKind::Normal, Some(reply_to))
    }

    fn send_inner(
        &self,
        handle: SessionHandle,
        content: &str,
        kind: MessageKind,
        reply_to: Option<Uuid>,
    ) -> Result<Message, MessageError> {
        if content.trim().is_empty() {
            return Err(MessageError::ContentEmpty);
        }
        let contact = self.resolve(handle)?;
        if contact.blocked {
            return Err(MessageError::ContactBlocked(contact.public_key));
        }
        if let Some(parent) = reply_to {
            match self.get_message(parent)? {
                Some(m) if m.contact_key == contact.public_key => {}
                _ => return Err(MessageError::NotFound(parent)),
            }
        }

        let mut message = compose(&contact, Some(handle), content, kind, Direction::Outgoing);
        message.reply_to = reply_to;
        // Claimed before the row exists so a concurrent retry cannot pick it up.
        self.claim(message.uuid);
        if let Err(e) = self
            .storage
            .transaction(|tx| insert_message(tx, &message))
        {
            self.lock_outbox().sending.remove(&message.uuid);
            return Err(e.into());
        }
        debug!(
            peer = %peer_id(&contact.public_key),
            msg = %msg_id(&message.uuid),
            "stored outgoing message"
        );

        let result = self.dispatch(handle, &message);
        // Pick up dispatched_at and any early delivery.
        let message = self.get_message(message.uuid).ok().flatten().unwrap_or(message);
        match result {
            Ok(_) => Ok(message),
            Err(reason) => {
                info!(
                    peer = %peer_id(&contact.public_key),
                    msg = %msg_id(&message.uuid),
                    %reason,
                    queued = message.dispatched_at.is_none(),
                    "message not sent"
                );
                Err(MessageError::NetworkUnavailable {
                    message: Box::new(message),
                    reason,
                })
            }
        }
    }

    /// Send the offline queue of the contact now holding `handle`: outgoing
    /// messages the network never accepted, oldest first. Stops at the first
    /// network failure. Returns how many were handed to the network.
    pub fn retry_undelivered(&self, handle: SessionHandle) -> Result<usize, MessageError> {
        let contact = self.resolve(handle)?;
        if contact.blocked {
            return Ok(0);
        }
        let pending = self.queued_messages(&contact.public_key)?;
        let mut sent = 0;
        for message in pending {
            if !self.claim(message.uuid) {
                continue;
            }
            match self.dispatch(handle, &message) {
                Ok(_) => sent += 1,
                Err(err) => {
                    debug!(peer = %peer_id(&contact.public_key), %err, "retry stopped");
                    break;
                }
            }
        }
        if sent > 0 {
            info!(peer = %peer_id(&contact.public_key), sent, "sent queued messages");
        }
        Ok(sent)
    }

    /// Send an undelivered outgoing message again on the user's request, even
    /// if the network already had it. The peer may see it twice.
    pub fn resend_message(&self, uuid: Uuid) -> Result<Message, MessageError> {
        let message = self.get_message(uuid)?.ok_or(MessageError::NotFound(uuid))?;
        if message.direction != Direction::Outgoing {
            return Err(MessageError::NotOwnMessage(uuid));
        }
        if message.is_delivered() || message.kind == MessageKind::File {
            return Ok(message);
        }
        let contact = self
            .contacts
            .get_contact(&message.contact_key)
            .ok_or(MessageError::NotFound(uuid))?;
        if contact.blocked {
            return Err(MessageError::ContactBlocked(contact.public_key));
        }
        let Some(handle) = contact.session_handle else {
            return Err(MessageError::NetworkUnavailable {
                message: Box::new(message),
                reason: NetworkError::Offline,
            });
        };
        if !self.claim(uuid) {
            return Ok(message);
        }
        let result = self.dispatch(handle, &message);
        let message = self.get_message(uuid).ok().flatten().unwrap_or(message);
        match result {
            Ok(_) => {
                info!(peer = %peer_id(&contact.public_key), msg = %msg_id(&uuid), "message resent");
                Ok(message)
            }
            Err(reason) => Err(MessageError::NetworkUnavailable {
                message: Box::new(message),
                reason,
            }),
        }
    }

    /// Drop receipt bookkeeping for `handle` after the peer disconnects.
    /// The messages stay dispatched: they are not resent automatically.
    pub fn forget_receipts(&self, handle: SessionHandle) {
        let mut outbox = self.lock_outbox();
        outbox.by_receipt.retain(|(h, _), _| *h != handle);
        outbox.early.retain(|(h, _)| *h != handle);
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Store a message from the peer holding `handle`. The row is committed
    /// before this returns.
    pub fn on_message_received(
        &self,
        handle: SessionHandle,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, MessageError> {
        if content.is_empty() {
            return Err(MessageError::ContentEmpty);
        }
        let contact = self.resolve(handle)?;
        if contact.blocked {
            debug!(peer = %peer_id(&contact.public_key), "dropped message from blocked contact");
            return Err(MessageError::ContactBlocked(contact.public_key));
        }

        let mut message = compose(&contact, Some(handle), content, kind, Direction::Incoming);
        message.delivered_at = Some(message.created_at);
        self.storage
            .transaction(|tx| insert_message(tx, &message))?;
        debug!(
            peer = %peer_id(&contact.public_key),
            msg = %msg_id(&message.uuid),
            "stored incoming message"
        );
        Ok(message)
    }

    /// The peer acknowledged `receipt`. A receipt that matches no message is
    /// held while a send is in progress, since its send may not have returned
    /// yet; otherwise it is ignored. `None` also covers messages deleted
    /// since they were sent.
    pub fn on_delivery_receipt(
        &self,
        handle: SessionHandle,
        receipt: Receipt,
    ) -> Result<Option<Message>, MessageError> {
        let uuid = {
            let mut outbox = self.lock_outbox();
            match outbox.by_receipt.remove(&(handle, receipt)) {
                Some(uuid) => uuid,
                None => {
                    if !outbox.sending.is_empty() && outbox.early.len() < MAX_EARLY_RECEIPTS {
                        outbox.early.insert((handle, receipt));
                    } else {
                        debug!(%handle, receipt = receipt.0, "receipt for unknown message ignored");
                    }
                    return Ok(None);
                }
            }
        };
        self.mark_delivered(uuid)
    }

    /// Mark an outgoing message delivered. Idempotent. `None` when the
    /// message was deleted.
    pub fn mark_delivered(&self, uuid: Uuid) -> Result<Option<Message>, MessageError> {
        self.storage.exec(
            "UPDATE messages SET delivered_at = ?2
             WHERE uuid = ?1 AND direction = 'outgoing' AND delivered_at IS NULL",
            params![uuid.to_string(), now_millis() as i64],
        )?;
        if let Some(message) = self.get_message(uuid)? {
            return Ok(Some(message));
        }
        let exists = self.storage.query_one(
            "SELECT 1 FROM messages WHERE uuid = ?1",
            params![uuid.to_string()],
            |row| row.get::<_, i64>(0),
        )?;
        match exists {
            Some(_) => {
                debug!(msg = %msg_id(&uuid), "delivery recorded for deleted message");
                Ok(None)
            }
            None => Err(MessageError::NotFound(uuid)),
        }
    }

    pub fn mark_read(&self, uuid: Uuid) -> Result<Message, MessageError> {
        let changed = self.storage.exec(
            "UPDATE messages SET read_at = COALESCE(read_at, ?2)
             WHERE uuid = ?1 AND deleted = 0",
            params![uuid.to_string(), now_millis() as i64],
        )?;
        if changed == 0 {
            return Err(MessageError::NotFound(uuid));
        }
        self.get_message(uuid)?.ok_or(MessageError::NotFound(uuid))
    }

    // -----------------------------------------------------------------------
    // Edit / delete
    // -----------------------------------------------------------------------

    /// Replace the text of one of our own messages. The first edit keeps the
    /// original text; later edits never overwrite it.
    pub fn edit_message(&self, uuid: Uuid, new_content: &str) -> Result<Message, MessageError> {
        let existing = self.get_message(uuid)?.ok_or(MessageError::NotFound(uuid))?;
        if existing.direction != Direction::Outgoing {
            return Err(MessageError::NotOwnMessage(uuid));
        }
        if new_content.trim().is_empty() {
            return Err(MessageError::ContentEmpty);
        }

        let changed = self.storage.exec(
            "UPDATE messages
             SET original_content = COALESCE(original_content, content),
                 content = ?2,
                 edited_at = ?3
             WHERE uuid = ?1 AND deleted = 0",
            params![uuid.to_string(), new_content, now_millis() as i64],
        )?;
        if changed == 0 {
            return Err(MessageError::NotFound(uuid));
        }
        debug!(msg = %msg_id(&uuid), "message edited");
        self.get_message(uuid)?.ok_or(MessageError::NotFound(uuid))
    }

    /// Hide a message from reads and search. The row is kept.
    pub fn delete_message(&self, uuid: Uuid) -> Result<(), MessageError> {
        let changed = self.storage.exec(
            "UPDATE messages SET deleted = 1 WHERE uuid = ?1 AND deleted = 0",
            params![uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(MessageError::NotFound(uuid));
        }
        debug!(msg = %msg_id(&uuid), "message deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_message(&self, uuid: Uuid) -> Result<Option<Message>, MessageError> {
        Ok(self.storage.query_one(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.uuid = ?1 AND m.deleted = 0"),
            params![uuid.to_string()],
            row_to_message,
        )?)
    }

    /// History with the contact currently holding `handle`, including
    /// messages exchanged under earlier handles.
    pub fn get_messages(
        &self,
        handle: SessionHandle,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, MessageError> {
        let contact = self.resolve(handle)?;
        self.get_messages_for_contact(&contact.public_key, limit, offset)
    }

    pub fn get_messages_for_contact(
        &self,
        public_key: &PublicKey,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, MessageError> {
        Ok(self.storage.query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.contact_key = ?1 AND m.deleted = 0
                 ORDER BY m.created_at ASC, m.uuid ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            params![public_key, clamp_limit(limit), offset as i64],
            row_to_message,
        )?)
    }

    /// Outgoing text messages to `public_key` the peer has not acknowledged,
    /// oldest first. File references are excluded: transfers are restarted
    /// explicitly, not resent.
    pub fn undelivered_messages(&self, public_key: &PublicKey) -> Result<Vec<Message>, MessageError> {
        self.outgoing_where(public_key, "")
    }

    /// The undelivered messages the network never accepted.
    pub fn queued_messages(&self, public_key: &PublicKey) -> Result<Vec<Message>, MessageError> {
        self.outgoing_where(public_key, "AND m.dispatched_at IS NULL")
    }

    fn outgoing_where(
        &self,
        public_key: &PublicKey,
        extra: &str,
    ) -> Result<Vec<Message>, MessageError> {
        Ok(self.storage.query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 WHERE m.contact_key = ?1 AND m.direction = 'outgoing'
                   AND m.delivered_at IS NULL AND m.deleted = 0
                   AND m.message_type != 'file' {extra}
                 ORDER BY m.created_at ASC, m.uuid ASC
                 LIMIT ?2"
            ),
            params![public_key, MAX_PAGE_SIZE as i64],
            row_to_message,
        )?)
    }

    /// Search live messages. Uses the full-text index when present (ranked
    /// by relevance, then recency), otherwise a substring match ranked by
    /// recency. A blank query matches nothing.
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>, MessageError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let results = if self.storage.has_full_text_search() {
            self.storage.query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages_fts f
                     JOIN messages m ON m.id = f.rowid
                     WHERE messages_fts MATCH ?1 AND m.deleted = 0
                     ORDER BY bm25(messages_fts), m.created_at DESC
                     LIMIT ?2"
                ),
                params![fts_query(query), clamp_limit(limit)],
                row_to_message,
            )
        } else {
            self.storage.query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m
                     WHERE m.deleted = 0 AND m.content LIKE ?1 ESCAPE '\\'
                     ORDER BY m.created_at DESC, m.uuid DESC
                     LIMIT ?2"
                ),
                params![like_pattern(query), clamp_limit(limit)],
                row_to_message,
            )
        };

        results.map_err(|err| {
            warn!(error = %err, "message search failed");
            MessageError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{client, ScriptedNetwork};
    use crate::storage::FullTextMode;
    use std::sync::atomic::Ordering;

    struct Fixture {
        messages: MessageManager,
        contacts: Arc<ContactManager>,
        network: Arc<NetworkClient>,
        net: Arc<ScriptedNetwork>,
    }

    fn fixture_with(full_text: FullTextMode) -> Fixture {
        let storage = Arc::new(Storage::open_in_memory_with(full_text).unwrap());
        let net = ScriptedNetwork::new();
        let network = client(&net);
        let contacts = Arc::new(ContactManager::new(storage.clone(), network.clone()).unwrap());
        contacts
            .on_friend_request_accepted(PublicKey::from_bytes([1; 32]), SessionHandle(1))
            .unwrap();
        contacts
            .on_friend_request_accepted(PublicKey::from_bytes([2; 32]), SessionHandle(2))
            .unwrap();
        let messages = MessageManager::new(storage, contacts.clone(), network.clone());
        Fixture {
            messages,
            contacts,
            network,
            net,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FullTextMode::Auto)
    }

    #[test]
    fn test_send_assigns_uuid_without_delivery() {
        let f = fixture();
        let a = f
            .messages
            .send_message(SessionHandle(1), "hello", MessageKind::Normal)
            .unwrap();
        let b = f
            .messages
            .send_message(SessionHandle(1), "again", MessageKind::Normal)
            .unwrap();
        assert_ne!(a.uuid, b.uuid);
        assert!(a.delivered_at.is_none());
        assert_eq!(uuid_millis(&a.uuid), Some(a.created_at));
        assert_eq!(f.net.sent_count(), 2);

        let stored = f.messages.get_message(a.uuid).unwrap().unwrap();
        assert_eq!(stored, a);
    }

    #[test]
    fn test_send_validation() {
        let f = fixture();
        assert!(matches!(
            f.messages.send_message(SessionHandle(1), "   ", MessageKind::Normal),
            Err(MessageError::ContentEmpty)
        ));
        assert!(matches!(
            f.messages.send_message(SessionHandle(42), "hi", MessageKind::Normal),
            Err(MessageError::ContactNotFound(SessionHandle(42)))
        ));
        f.contacts.block(PublicKey::from_bytes([2; 32])).unwrap();
        assert!(matches!(
            f.messages.send_message(SessionHandle(2), "hi", MessageKind::Normal),
            Err(MessageError::ContactBlocked(_))
        ));
        assert_eq!(f.net.sent_count(), 0);
    }

    #[test]
    fn test_offline_send_keeps_row_and_retries() {
        let f = fixture();
        f.net.offline.store(true, Ordering::SeqCst);
        let err = f
            .messages
            .send_message(SessionHandle(1), "later", MessageKind::Normal)
            .unwrap_err();
        let MessageError::NetworkUnavailable { message, reason } = err else {
            panic!("expected NetworkUnavailable");
        };
        assert_eq!(reason, NetworkError::Offline);
        let key = PublicKey::from_bytes([1; 32]);
        assert_eq!(f.messages.undelivered_messages(&key).unwrap().len(), 1);

        assert!(message.dispatched_at.is_none());
        assert_eq!(f.messages.queued_messages(&key).unwrap().len(), 1);

        f.net.offline.store(false, Ordering::SeqCst);
        assert_eq!(f.messages.retry_undelivered(SessionHandle(1)).unwrap(), 1);
        // Handed over once: never sent again by a later flush.
        assert_eq!(f.messages.retry_undelivered(SessionHandle(1)).unwrap(), 0);
        assert_eq!(f.net.sent_count(), 1);
        assert!(f.messages.queued_messages(&key).unwrap().is_empty());

        let receipt = Receipt(1);
        let delivered = f
            .messages
            .on_delivery_receipt(SessionHandle(1), receipt)
            .unwrap()
            .unwrap();
        assert_eq!(delivered.uuid, message.uuid);
        assert!(delivered.delivered_at.is_some());
        assert!(f.messages.undelivered_messages(&key).unwrap().is_empty());
    }

    #[test]
    fn test_dispatched_sends_are_not_repeated_after_disconnect() {
        let f = fixture();
        let sent = f
            .messages
            .send_message(SessionHandle(1), "once", MessageKind::Normal)
            .unwrap();
        assert!(sent.dispatched_at.is_some());
        f.messages.forget_receipts(SessionHandle(1));
        assert_eq!(f.messages.retry_undelivered(SessionHandle(1)).unwrap(), 0);
        assert_eq!(f.net.sent_count(), 1);

        // Still undelivered, so the user may send it again explicitly.
        let key = PublicKey::from_bytes([1; 32]);
        assert_eq!(f.messages.undelivered_messages(&key).unwrap().len(), 1);
        f.messages.resend_message(sent.uuid).unwrap();
        assert_eq!(f.net.sent_count(), 2);
    }

    #[test]
    fn test_timed_out_send_is_not_queued() {
        let f = fixture();
        f.network.set_timeout(std::time::Duration::from_millis(100));
        f.net.hang.store(true, Ordering::SeqCst);
        let err = f
            .messages
            .send_message(SessionHandle(1), "maybe", MessageKind::Normal)
            .unwrap_err();
        let MessageError::NetworkUnavailable { message, reason } = err else {
            panic!("expected NetworkUnavailable");
        };
        assert!(matches!(reason, NetworkError::Timeout(_)));
        assert!(message.dispatched_at.is_some());

        f.net.hang.store(false, Ordering::SeqCst);
        assert_eq!(f.messages.retry_undelivered(SessionHandle(1)).unwrap(), 0);
    }

    #[test]
    fn test_resend_rejections() {
        let f = fixture();
        let incoming = f
            .messages
            .on_message_received(SessionHandle(1), "theirs", MessageKind::Normal)
            .unwrap();
        assert!(matches!(
            f.messages.resend_message(incoming.uuid),
            Err(MessageError::NotOwnMessage(_))
        ));
        assert!(matches!(
            f.messages.resend_message(Uuid::now_v7()),
            Err(MessageError::NotFound(_))
        ));

        let own = f
            .messages
            .send_message(SessionHandle(1), "ack'd", MessageKind::Normal)
            .unwrap();
        f.messages
            .on_delivery_receipt(SessionHandle(1), Receipt(1))
            .unwrap();
        let again = f.messages.resend_message(own.uuid).unwrap();
        assert!(again.is_delivered());
        assert_eq!(f.net.sent_count(), 1);
    }

    #[test]
    fn test_receipt_for_deleted_message_is_not_an_error() {
        let f = fixture();
        let sent = f
            .messages
            .send_message(SessionHandle(1), "oops", MessageKind::Normal)
            .unwrap();
        f.messages.delete_message(sent.uuid).unwrap();
        assert!(f
            .messages
            .on_delivery_receipt(SessionHandle(1), Receipt(1))
            .unwrap()
            .is_none());
        assert!(matches!(
            f.messages.mark_delivered(Uuid::now_v7()),
            Err(MessageError::NotFound(_))
        ));
    }

    #[test]
    fn test_receipt_arriving_before_send_returns_is_kept() {
        let f = fixture();
        let uuid = Uuid::now_v7();
        assert!(f.messages.claim(uuid));
        assert!(f
            .messages
            .on_delivery_receipt(SessionHandle(1), Receipt(1))
            .unwrap()
            .is_none());
        assert!(f.messages.lock_outbox().early.contains(&(SessionHandle(1), Receipt(1))));

        // Nothing in progress: stray receipts are not kept.
        f.messages.lock_outbox().sending.remove(&uuid);
        f.messages
            .on_delivery_receipt(SessionHandle(1), Receipt(2))
            .unwrap();
        assert!(!f.messages.lock_outbox().early.contains(&(SessionHandle(1), Receipt(2))));
    }

    #[test]
    fn test_unknown_receipt_ignored() {
        let f = fixture();
        assert!(f
            .messages
            .on_delivery_receipt(SessionHandle(1), Receipt(77))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_edit_preserves_first_original() {
        let f = fixture();
        let m = f
            .messages
            .send_message(SessionHandle(1), "first", MessageKind::Normal)
            .unwrap();
        let edited = f.messages.edit_message(m.uuid, "second").unwrap();
        assert_eq!(edited.content, "second");
        assert_eq!(edited.original_content.as_deref(), Some("first"));
        assert!(edited.edited_at.is_some());

        let again = f.messages.edit_message(m.uuid, "third").unwrap();
        assert_eq!(again.content, "third");
        assert_eq!(again.original_content.as_deref(), Some("first"));
    }

    #[test]
    fn test_edit_rejections() {
        let f = fixture();
        let incoming = f
            .messages
            .on_message_received(SessionHandle(1), "theirs", MessageKind::Normal)
            .unwrap();
        assert!(matches!(
            f.messages.edit_message(incoming.uuid, "mine now"),
            Err(MessageError::NotOwnMessage(_))
        ));
        assert!(matches!(
            f.messages.edit_message(Uuid::now_v7(), "x"),
            Err(MessageError::NotFound(_))
        ));
        let own = f
            .messages
            .send_message(SessionHandle(1), "mine", MessageKind::Normal)
            .unwrap();
        assert!(matches!(
            f.messages.edit_message(own.uuid, ""),
            Err(MessageError::ContentEmpty)
        ));
    }

    #[test]
    fn test_received_message_is_delivered_and_ordered() {
        let f = fixture();
        let sent = f
            .messages
            .send_message(SessionHandle(1), "ping", MessageKind::Normal)
            .unwrap();
        let got = f
            .messages
            .on_message_received(SessionHandle(1), "pong", MessageKind::Action)
            .unwrap();
        assert!(got.delivered_at.is_some());
        assert_eq!(got.direction, Direction::Incoming);

        let history = f
            .messages
            .get_messages(SessionHandle(1), 10, 0)
            .unwrap();
        let ids: Vec<Uuid> = history.iter().map(|m| m.uuid).collect();
        assert_eq!(ids, vec![sent.uuid, got.uuid]);

        // Other contacts' history is separate.
        assert!(f
            .messages
            .get_messages(SessionHandle(2), 10, 0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pagination_is_clamped() {
        let f = fixture();
        for i in 0..5 {
            f.messages
                .on_message_received(SessionHandle(1), &format!("m{i}"), MessageKind::Normal)
                .unwrap();
        }
        let page = f.messages.get_messages(SessionHandle(1), 2, 2).unwrap();
        let texts: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3"]);
        assert_eq!(
            f.messages
                .get_messages(SessionHandle(1), usize::MAX, 0)
                .unwrap()
                .len(),
            5
        );
    }

    #[test]
    fn test_reply_must_reference_same_conversation() {
        let f = fixture();
        let parent = f
            .messages
            .on_message_received(SessionHandle(1), "question?", MessageKind::Normal)
            .unwrap();
        let reply = f
            .messages
            .send_reply(SessionHandle(1), parent.uuid, "answer")
            .unwrap();
        assert_eq!(reply.reply_to, Some(parent.uuid));
        assert!(matches!(
            f.messages.send_reply(SessionHandle(2), parent.uuid, "wrong chat"),
            Err(MessageError::NotFound(_))
        ));
    }

    fn check_search_and_delete(f: &Fixture) {
        let keep = f
            .messages
            .on_message_received(SessionHandle(1), "the quick brown fox", MessageKind::Normal)
            .unwrap();
        let gone = f
            .messages
            .on_message_received(SessionHandle(2), "a quick reply", MessageKind::Normal)
            .unwrap();
        f.messages
            .on_message_received(SessionHandle(2), "100% done_now", MessageKind::Normal)
            .unwrap();

        assert_eq!(f.messages.search_messages("quick", 10).unwrap().len(), 2);
        assert!(f.messages.search_messages("   ", 10).unwrap().is_empty());

        f.messages.delete_message(gone.uuid).unwrap();
        let hits = f.messages.search_messages("quick", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uuid, keep.uuid);
        assert!(f.messages.get_message(gone.uuid).unwrap().is_none());
        assert!(matches!(
            f.messages.delete_message(gone.uuid),
            Err(MessageError::NotFound(_))
        ));
        assert!(f
            .messages
            .get_messages(SessionHandle(2), 10, 0)
            .unwrap()
            .iter()
            .all(|m| m.uuid != gone.uuid));

        // Quotes in user input must not break the query.
        assert!(f.messages.search_messages("\"unbalanced", 10).is_ok());
    }

    #[test]
    fn test_search_and_soft_delete_full_text() {
        check_search_and_delete(&fixture_with(FullTextMode::Auto));
    }

    #[test]
    fn test_search_and_soft_delete_substring() {
        let f = fixture_with(FullTextMode::Disabled);
        check_search_and_delete(&f);
        // LIKE wildcards in the query are literal.
        assert_eq!(f.messages.search_messages("100%", 10).unwrap().len(), 1);
        assert_eq!(f.messages.search_messages("e_n", 10).unwrap().len(), 1);
        assert!(f.messages.search_messages("%%", 10).unwrap().is_empty());
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("hello  world"), "\"hello\" \"world\"");
        assert_eq!(fts_query("say \"hi\""), "\"say\" \"\"\"hi\"\"\"");
        assert_eq!(like_pattern("50%_a\\b"), "%50\\%\\_a\\\\b%");
    }
}
