//! Contact directory: the persisted peer list plus an in-memory cache
//! indexed by public key and by the session handle each peer currently
//! holds.
//!
//! Network callbacks (presence, names, handle assignment) and UI actions
//! (add, block, favorite) mutate the directory concurrently. Every mutation
//! takes the directory lock, writes the row, then updates the cache, so the
//! cache never shows a state the database does not hold.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::logging::peer_id;
use crate::model::{
    now_millis, Contact, ContactId, FriendRequest, FriendRequestStatus, IdentifierError,
    PeerAddress, Presence, PublicKey, SessionHandle,
};
use crate::network::{NetworkClient, NetworkError};
use crate::storage::{column_opt_millis, Storage, StorageError};

/// Longest friend request message the network layer will carry, in bytes.
pub const MAX_REQUEST_MESSAGE_LEN: usize = 1016;

#[derive(Debug, Error)]
pub enum ContactError {
    #[error("invalid contact identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),
    #[error("friend request message is {len} bytes, limit is {max}")]
    RequestMessageTooLong { len: usize, max: usize },
    #[error("contact {0} already exists")]
    AlreadyExists(PublicKey),
    #[error("no contact or pending request for {0}")]
    NotFound(PublicKey),
    #[error("network unavailable: {0}")]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

const CONTACT_COLUMNS: &str = "id, public_key, session_handle, name, status_message, presence, \
     blocked, favorite, avatar, created_at, updated_at, last_seen";

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: ContactId(row.get(0)?),
        public_key: row.get(1)?,
        session_handle: row.get(2)?,
        name: row.get(3)?,
        status_message: row.get(4)?,
        presence: row.get(5)?,
        blocked: row.get(6)?,
        favorite: row.get(7)?,
        avatar: row.get(8)?,
        created_at: row.get::<_, i64>(9)? as u64,
        updated_at: row.get::<_, i64>(10)? as u64,
        last_seen: column_opt_millis(row, 11)?,
    })
}

fn row_to_friend_request(row: &Row<'_>) -> rusqlite::Result<FriendRequest> {
    Ok(FriendRequest {
        public_key: row.get(0)?,
        message: row.get(1)?,
        received_at: row.get::<_, i64>(2)? as u64,
        status: row.get(3)?,
    })
}

// ---------------------------------------------------------------------------
// Directory cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Directory {
    by_key: BTreeMap<PublicKey, Contact>,
    by_handle: HashMap<SessionHandle, PublicKey>,
}

impl Directory {
    fn insert(&mut self, contact: Contact) {
        if let Some(previous) = self.by_key.get(&contact.public_key) {
            if let Some(old_handle) = previous.session_handle {
                if self.by_handle.get(&old_handle) == Some(&contact.public_key) {
                    self.by_handle.remove(&old_handle);
                }
            }
        }
        if let Some(handle) = contact.session_handle {
            self.by_handle.insert(handle, contact.public_key);
        }
        self.by_key.insert(contact.public_key, contact);
    }

    /// Detach `handle` from whichever contact other than `keep` holds it.
    fn release_handle(&mut self, handle: SessionHandle, keep: &PublicKey, now: u64) {
        let Some(holder) = self.by_handle.get(&handle).copied() else {
            return;
        };
        if holder == *keep {
            return;
        }
        self.by_handle.remove(&handle);
        if let Some(contact) = self.by_key.get_mut(&holder) {
            contact.session_handle = None;
            contact.updated_at = now;
        }
    }

    fn by_handle(&self, handle: SessionHandle) -> Option<&Contact> {
        self.by_handle
            .get(&handle)
            .and_then(|key| self.by_key.get(key))
    }
}

fn sorted(mut contacts: Vec<Contact>) -> Vec<Contact> {
    contacts.sort_by(|a, b| {
        b.favorite
            .cmp(&a.favorite)
            .then_with(|| {
                a.display_name()
                    .to_lowercase()
                    .cmp(&b.display_name().to_lowercase())
            })
            .then_with(|| a.public_key.cmp(&b.public_key))
    });
    contacts
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ContactManager {
    storage: Arc<Storage>,
    network: Arc<NetworkClient>,
    directory: Mutex<Directory>,
}

impl ContactManager {
    /// Load the directory. Session handles from a previous run are
    /// meaningless to the new network session, so they are cleared and every
    /// contact starts offline.
    pub fn new(storage: Arc<Storage>, network: Arc<NetworkClient>) -> Result<Self, StorageError> {
        storage.exec(
            "UPDATE contacts SET session_handle = NULL, presence = 'offline'
             WHERE session_handle IS NOT NULL OR presence != 'offline'",
            [],
        )?;
        let contacts = storage.query(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts"),
            [],
            row_to_contact,
        )?;

        let mut directory = Directory::default();
        for contact in contacts {
            directory.insert(contact);
        }
        debug!(contacts = directory.by_key.len(), "contact directory loaded");

        Ok(Self {
            storage,
            network,
            directory: Mutex::new(directory),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Adding contacts
    // -----------------------------------------------------------------------

    /// Send a friend request to `identifier` (a public key or full address)
    /// and record the contact with the handle the network assigns.
    pub fn add_contact(
        &self,
        identifier: &str,
        request_message: &str,
    ) -> Result<ContactId, ContactError> {
        let address = PeerAddress::parse(identifier)?;
        if request_message.len() > MAX_REQUEST_MESSAGE_LEN {
            return Err(ContactError::RequestMessageTooLong {
                len: request_message.len(),
                max: MAX_REQUEST_MESSAGE_LEN,
            });
        }
        let public_key = address.public_key;
        if self.lock().by_key.contains_key(&public_key) {
            return Err(ContactError::AlreadyExists(public_key));
        }

        // The directory lock is not held across the network round-trip.
        let handle = self
            .network
            .request_friend(address, request_message.to_string())?;

        let mut dir = self.lock();
        if dir.by_key.contains_key(&public_key) {
            return Err(ContactError::AlreadyExists(public_key));
        }
        let contact = self.store_with_handle(&mut dir, public_key, handle, false)?;
        info!(peer = %peer_id(&public_key), %handle, "friend request sent");
        Ok(contact.id)
    }

    /// The peer accepted our request (or we accepted theirs). Creates the
    /// contact if needed, unblocks it, and binds it to `handle`.
    pub fn on_friend_request_accepted(
        &self,
        public_key: PublicKey,
        handle: SessionHandle,
    ) -> Result<Contact, ContactError> {
        let mut dir = self.lock();
        let contact = self.store_with_handle(&mut dir, public_key, handle, true)?;
        info!(peer = %peer_id(&public_key), %handle, "friendship established");
        Ok(contact)
    }

    /// A known contact reconnected under a new handle. Unknown keys are
    /// ignored.
    pub fn assign_session(
        &self,
        public_key: PublicKey,
        handle: SessionHandle,
    ) -> Result<Option<Contact>, ContactError> {
        let mut dir = self.lock();
        if !dir.by_key.contains_key(&public_key) {
            debug!(peer = %peer_id(&public_key), %handle, "session for unknown key ignored");
            return Ok(None);
        }
        let contact = self.store_with_handle(&mut dir, public_key, handle, false)?;
        Ok(Some(contact))
    }

    /// Persist `public_key` holding `handle`, clearing the handle from any
    /// previous holder in the same transaction. `accepted` also unblocks the
    /// contact and settles its friend request, still in that transaction.
    fn store_with_handle(
        &self,
        dir: &mut Directory,
        public_key: PublicKey,
        handle: SessionHandle,
        accepted: bool,
    ) -> Result<Contact, ContactError> {
        let now = now_millis();
        let existing = dir.by_key.get(&public_key).cloned();

        let contact = self.storage.transaction(|tx| -> Result<Contact, StorageError> {
            let released = tx.exec(
                "UPDATE contacts SET session_handle = NULL, updated_at = ?2
                 WHERE session_handle = ?1 AND public_key != ?3",
                params![handle, now as i64, public_key],
            )?;
            if released > 0 {
                debug!(%handle, "session handle moved to a different peer");
            }

            if accepted {
                tx.exec(
                    "UPDATE friend_requests SET status = 'accepted' WHERE public_key = ?1",
                    params![public_key],
                )?;
            }

            match existing {
                Some(mut contact) => {
                    contact.session_handle = Some(handle);
                    if accepted {
                        contact.blocked = false;
                    }
                    contact.updated_at = now;
                    tx.exec(
                        "UPDATE contacts SET session_handle = ?2, blocked = ?3, updated_at = ?4
                         WHERE public_key = ?1",
                        params![public_key, handle, contact.blocked, now as i64],
                    )?;
                    Ok(contact)
                }
                None => {
                    tx.exec(
                        "INSERT INTO contacts (public_key, session_handle, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?3)",
                        params![public_key, handle, now as i64],
                    )?;
                    Ok(Contact {
                        id: ContactId(tx.last_insert_rowid()?),
                        public_key,
                        session_handle: Some(handle),
                        name: String::new(),
                        status_message: String::new(),
                        presence: Presence::Offline,
                        blocked: false,
                        favorite: false,
                        avatar: None,
                        created_at: now,
                        updated_at: now,
                        last_seen: None,
                    })
                }
            }
        })?;

        dir.release_handle(handle, &public_key, now);
        dir.insert(contact.clone());
        Ok(contact)
    }

    // -----------------------------------------------------------------------
    // Incoming friend requests
    // -----------------------------------------------------------------------

    /// Record an incoming friend request. Returns the request when it is new
    /// and should be shown. Requests from existing contacts (blocked or not)
    /// and previously rejected requests are not resurfaced; a repeat of a
    /// pending request refreshes its message.
    pub fn on_friend_request(
        &self,
        public_key: PublicKey,
        message: &str,
    ) -> Result<Option<FriendRequest>, ContactError> {
        let dir = self.lock();
        if let Some(contact) = dir.by_key.get(&public_key) {
            debug!(
                peer = %peer_id(&public_key),
                blocked = contact.blocked,
                "friend request from existing contact ignored"
            );
            return Ok(None);
        }

        let existing = self.storage.query_one(
            "SELECT public_key, message, received_at, status FROM friend_requests
             WHERE public_key = ?1",
            params![public_key],
            row_to_friend_request,
        )?;
        let now = now_millis();
        match existing.map(|r| r.status) {
            Some(FriendRequestStatus::Pending) => {
                self.storage.exec(
                    "UPDATE friend_requests SET message = ?2, received_at = ?3
                     WHERE public_key = ?1",
                    params![public_key, message, now as i64],
                )?;
                Ok(None)
            }
            Some(status) => {
                debug!(peer = %peer_id(&public_key), %status, "friend request not resurfaced");
                Ok(None)
            }
            None => {
                self.storage.exec(
                    "INSERT INTO friend_requests (public_key, message, received_at, status)
                     VALUES (?1, ?2, ?3, 'pending')",
                    params![public_key, message, now as i64],
                )?;
                info!(peer = %peer_id(&public_key), "stored incoming friend request");
                Ok(Some(FriendRequest {
                    public_key,
                    message: message.to_string(),
                    received_at: now,
                    status: FriendRequestStatus::Pending,
                }))
            }
        }
    }

    /// Pending incoming requests, oldest first.
    pub fn list_friend_requests(&self) -> Result<Vec<FriendRequest>, ContactError> {
        Ok(self.storage.query(
            "SELECT public_key, message, received_at, status FROM friend_requests
             WHERE status = 'pending' ORDER BY received_at ASC",
            [],
            row_to_friend_request,
        )?)
    }

    pub fn accept_friend_request(&self, public_key: PublicKey) -> Result<Contact, ContactError> {
        self.require_pending(&public_key)?;
        let handle = self.network.accept_friend(public_key)?;
        self.on_friend_request_accepted(public_key, handle)
    }

    pub fn reject_friend_request(&self, public_key: PublicKey) -> Result<(), ContactError> {
        self.require_pending(&public_key)?;
        self.storage.exec(
            "UPDATE friend_requests SET status = 'rejected' WHERE public_key = ?1",
            params![public_key],
        )?;
        info!(peer = %peer_id(&public_key), "friend request rejected");
        Ok(())
    }

    fn require_pending(&self, public_key: &PublicKey) -> Result<(), ContactError> {
        let status = self.storage.query_one(
            "SELECT status FROM friend_requests WHERE public_key = ?1",
            params![public_key],
            |row| row.get::<_, FriendRequestStatus>(0),
        )?;
        match status {
            Some(FriendRequestStatus::Pending) => Ok(()),
            _ => Err(ContactError::NotFound(*public_key)),
        }
    }

    // -----------------------------------------------------------------------
    // Network-driven updates
    // -----------------------------------------------------------------------

    /// Apply `update` to the contact holding `handle`. Unknown handles are
    /// logged and ignored.
    fn update_by_handle<F>(
        &self,
        handle: SessionHandle,
        event: &'static str,
        update: F,
    ) -> Result<Option<Contact>, ContactError>
    where
        F: FnOnce(&mut Contact, u64),
    {
        let mut dir = self.lock();
        let Some(key) = dir.by_handle.get(&handle).copied() else {
            debug!(%handle, event, "event for unknown session handle ignored");
            return Ok(None);
        };
        self.update_locked(&mut dir, key, update).map(Some)
    }

    fn update_by_key<F>(&self, public_key: PublicKey, update: F) -> Result<Contact, ContactError>
    where
        F: FnOnce(&mut Contact, u64),
    {
        let mut dir = self.lock();
        self.update_locked(&mut dir, public_key, update)
    }

    /// Write every mutable field except the session handle, which only
    /// moves through `store_with_handle`.
    fn update_locked<F>(
        &self,
        dir: &mut Directory,
        public_key: PublicKey,
        update: F,
    ) -> Result<Contact, ContactError>
    where
        F: FnOnce(&mut Contact, u64),
    {
        let mut contact = dir
            .by_key
            .get(&public_key)
            .cloned()
            .ok_or(ContactError::NotFound(public_key))?;
        let now = now_millis();
        update(&mut contact, now);
        contact.updated_at = now;

        self.storage.exec(
            "UPDATE contacts SET name = ?2, status_message = ?3, presence = ?4, blocked = ?5,
                    favorite = ?6, avatar = ?7, updated_at = ?8, last_seen = ?9
             WHERE public_key = ?1",
            params![
                public_key,
                contact.name,
                contact.status_message,
                contact.presence,
                contact.blocked,
                contact.favorite,
                contact.avatar,
                now as i64,
                contact.last_seen.map(|v| v as i64),
            ],
        )?;
        dir.insert(contact.clone());
        Ok(contact)
    }

    pub fn on_presence_changed(
        &self,
        handle: SessionHandle,
        presence: Presence,
    ) -> Result<Option<Contact>, ContactError> {
        self.update_by_handle(handle, "presence", |contact, now| {
            // last_seen records the most recent moment the peer was connected.
            if presence.is_connected() || contact.presence.is_connected() {
                contact.last_seen = Some(now);
            }
            contact.presence = presence;
        })
    }

    pub fn on_name_changed(
        &self,
        handle: SessionHandle,
        name: &str,
    ) -> Result<Option<Contact>, ContactError> {
        let name = name.trim().to_string();
        self.update_by_handle(handle, "name", move |contact, _| contact.name = name)
    }

    pub fn on_status_message_changed(
        &self,
        handle: SessionHandle,
        status_message: &str,
    ) -> Result<Option<Contact>, ContactError> {
        let status_message = status_message.to_string();
        self.update_by_handle(handle, "status_message", move |contact, _| {
            contact.status_message = status_message
        })
    }

    pub fn set_avatar(
        &self,
        public_key: PublicKey,
        avatar: Option<Vec<u8>>,
    ) -> Result<Contact, ContactError> {
        self.update_by_key(public_key, move |contact, _| contact.avatar = avatar)
    }

    // -----------------------------------------------------------------------
    // UI actions
    // -----------------------------------------------------------------------

    pub fn block(&self, public_key: PublicKey) -> Result<Contact, ContactError> {
        let contact = self.update_by_key(public_key, |contact, _| contact.blocked = true)?;
        info!(peer = %peer_id(&public_key), "contact blocked");
        Ok(contact)
    }

    pub fn unblock(&self, public_key: PublicKey) -> Result<Contact, ContactError> {
        let contact = self.update_by_key(public_key, |contact, _| contact.blocked = false)?;
        info!(peer = %peer_id(&public_key), "contact unblocked");
        Ok(contact)
    }

    pub fn set_favorite(
        &self,
        public_key: PublicKey,
        favorite: bool,
    ) -> Result<Contact, ContactError> {
        self.update_by_key(public_key, move |contact, _| contact.favorite = favorite)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Snapshot of every contact, favorites first, then by name.
    pub fn get_all_contacts(&self) -> Vec<Contact> {
        let snapshot: Vec<Contact> = self.lock().by_key.values().cloned().collect();
        sorted(snapshot)
    }

    /// Snapshot of contacts that are not blocked.
    pub fn get_active_contacts(&self) -> Vec<Contact> {
        let snapshot: Vec<Contact> = self
            .lock()
            .by_key
            .values()
            .filter(|c| !c.blocked)
            .cloned()
            .collect();
        sorted(snapshot)
    }

    pub fn get_contact(&self, public_key: &PublicKey) -> Option<Contact> {
        self.lock().by_key.get(public_key).cloned()
    }

    pub fn contact_by_handle(&self, handle: SessionHandle) -> Option<Contact> {
        self.lock().by_handle(handle).cloned()
    }
}
