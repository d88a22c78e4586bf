//! File transfer bookkeeping.
//!
//! The network layer moves the bytes; this module owns the lifecycle of
//! each transfer: validation before anything is offered, the state machine,
//! monotonic progress, and the file-reference message that shows the
//! transfer in the conversation.
//!
//! ```text
//! pending ──► active ──► completed
//!    │          ▲ │
//!    │          │ ▼
//!    │        paused
//!    │          │
//!    └──────────┴──────► failed | cancelled
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::contacts::ContactManager;
use crate::logging::{msg_id, peer_id};
use crate::messages::{compose, insert_message};
use crate::model::{
    now_millis, Contact, Direction, FileRef, Message, MessageKind, PublicKey, SessionHandle, Transfer,
    TransferId, TransferState,
};
use crate::network::{FileControl, NetworkClient, NetworkError};
use crate::storage::{column_opt_millis, column_opt_uuid, Storage, StorageError, Tx};

/// 2 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;
const MAX_FILE_SIZE_SETTING: &str = "transfers.max_file_size";
const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("file is {size} bytes, limit is {max}")]
    FileTooLarge { size: u64, max: u64 },
    #[error("no contact holds session handle {0}")]
    ContactNotFound(SessionHandle),
    #[error("contact {0} is blocked")]
    ContactBlocked(PublicKey),
    #[error("transfer {0} not found")]
    NotFound(TransferId),
    #[error("transfer {0} was already accepted or closed")]
    AlreadyResolved(TransferId),
    #[error("transfer {0} is not an incoming transfer")]
    NotIncoming(TransferId),
    #[error("transfer {id} is already {state}")]
    AlreadyTerminal { id: TransferId, state: TransferState },
    #[error("transfer {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TransferId,
        from: TransferState,
        to: TransferState,
    },
    #[error("transfer {id} could not be sent: {reason}")]
    NetworkUnavailable { id: TransferId, reason: NetworkError },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const TRANSFER_COLUMNS: &str = "id, contact_key, session_handle, file_name, file_size, \
     local_path, direction, state, progress, created_at, started_at, completed_at, \
     failure_reason, message_uuid";

fn row_to_transfer(row: &Row<'_>) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: TransferId(row.get(0)?),
        contact_key: row.get(1)?,
        session_handle: row.get(2)?,
        file_name: row.get(3)?,
        file_size: row.get::<_, i64>(4)? as u64,
        local_path: row.get(5)?,
        direction: row.get(6)?,
        state: row.get(7)?,
        progress: row.get::<_, i64>(8)? as u64,
        created_at: row.get::<_, i64>(9)? as u64,
        started_at: column_opt_millis(row, 10)?,
        completed_at: column_opt_millis(row, 11)?,
        failure_reason: row.get(12)?,
        message_uuid: column_opt_uuid(row, 13)?,
    })
}

fn save_transfer(tx: &Tx<'_>, t: &Transfer) -> Result<(), StorageError> {
    tx.exec(
        "UPDATE file_transfers
         SET session_handle = ?2, local_path = ?3, state = ?4, progress = ?5,
             started_at = ?6, completed_at = ?7, failure_reason = ?8
         WHERE id = ?1",
        params![
            t.id.0,
            t.session_handle,
            t.local_path,
            t.state,
            t.progress as i64,
            t.started_at.map(|v| v as i64),
            t.completed_at.map(|v| v as i64),
            t.failure_reason,
        ],
    )?;
    Ok(())
}

/// Reduce a peer-supplied name to a bare file name that cannot escape the
/// destination directory.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let base = normalized.rsplit('/').next().unwrap_or("");
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Reserve a path in `dir` for `file_name` that does not overwrite anything:
/// `name.ext`, then `name (1).ext`, `name (2).ext`, ...
fn reserve_destination(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 0u32.. {
        let candidate_name = match (n, &ext) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (n, None) => format!("{stem} ({n})"),
        };
        let candidate = dir.join(candidate_name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free destination name",
    ))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct TransferManager {
    storage: Arc<Storage>,
    contacts: Arc<ContactManager>,
    network: Arc<NetworkClient>,
    max_file_size: AtomicU64,
    /// Non-terminal transfers.
    active: Mutex<BTreeMap<TransferId, Transfer>>,
}

impl TransferManager {
    /// Load the persisted size ceiling and fail transfers a previous process
    /// left unfinished; the network layer cannot resume them.
    pub fn new(
        storage: Arc<Storage>,
        contacts: Arc<ContactManager>,
        network: Arc<NetworkClient>,
    ) -> Result<Self, StorageError> {
        let max_file_size = match storage.get_setting(MAX_FILE_SIZE_SETTING)? {
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(value = %value, "ignoring unparsable max file size setting");
                DEFAULT_MAX_FILE_SIZE
            }),
            None => DEFAULT_MAX_FILE_SIZE,
        };

        let interrupted = storage.exec(
            "UPDATE file_transfers
             SET state = 'failed', failure_reason = ?1, completed_at = ?2
             WHERE state IN ('pending', 'active', 'paused')",
            params![INTERRUPTED, now_millis() as i64],
        )?;
        if interrupted > 0 {
            info!(interrupted, "marked unfinished transfers as failed");
        }

        Ok(Self {
            storage,
            contacts,
            network,
            max_file_size: AtomicU64::new(max_file_size),
            active: Mutex::new(BTreeMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TransferId, Transfer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_max_file_size(&self) -> u64 {
        self.max_file_size.load(Ordering::Relaxed)
    }

    pub fn set_max_file_size(&self, max: u64) -> Result<(), TransferError> {
        self.storage
            .set_setting(MAX_FILE_SIZE_SETTING, &max.to_string())?;
        self.max_file_size.store(max, Ordering::Relaxed);
        info!(max, "max file size updated");
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<(), TransferError> {
        let max = self.get_max_file_size();
        if size > max {
            return Err(TransferError::FileTooLarge { size, max });
        }
        Ok(())
    }

    fn resolve(&self, handle: SessionHandle) -> Result<Contact, TransferError> {
        let contact = self
            .contacts
            .contact_by_handle(handle)
            .ok_or(TransferError::ContactNotFound(handle))?;
        if contact.blocked {
            return Err(TransferError::ContactBlocked(contact.public_key));
        }
        Ok(contact)
    }

    /// The handle the transfer's peer holds right now.
    fn current_handle(&self, t: &Transfer) -> Result<SessionHandle, NetworkError> {
        self.contacts
            .get_contact(&t.contact_key)
            .and_then(|c| c.session_handle)
            .ok_or(NetworkError::Offline)
    }

    fn load(
        &self,
        active: &BTreeMap<TransferId, Transfer>,
        id: TransferId,
    ) -> Result<Transfer, TransferError> {
        if let Some(t) = active.get(&id) {
            return Ok(t.clone());
        }
        self.storage
            .query_one(
                &format!("SELECT {TRANSFER_COLUMNS} FROM file_transfers WHERE id = ?1"),
                params![id.0],
                row_to_transfer,
            )?
            .ok_or(TransferError::NotFound(id))
    }

    /// Persist `t` (and, when it just completed, its message's file fields)
    /// and refresh the cache.
    fn commit(
        &self,
        active: &mut BTreeMap<TransferId, Transfer>,
        t: Transfer,
    ) -> Result<Transfer, TransferError> {
        self.storage.transaction(|tx| -> Result<(), StorageError> {
            save_transfer(tx, &t)?;
            if t.state == TransferState::Completed {
                if let Some(uuid) = t.message_uuid {
                    tx.exec(
                        "UPDATE messages SET file_path = ?2, file_size = ?3 WHERE uuid = ?1",
                        params![uuid.to_string(), t.local_path, t.progress as i64],
                    )?;
                }
            }
            Ok(())
        })?;
        if t.state.is_terminal() {
            active.remove(&t.id);
        } else {
            active.insert(t.id, t.clone());
        }
        Ok(t)
    }

    /// Move `id` to `to`, enforcing the state machine.
    fn transition(
        &self,
        id: TransferId,
        to: TransferState,
        reason: Option<String>,
    ) -> Result<Transfer, TransferError> {
        let mut active = self.lock();
        let mut t = self.load(&active, id)?;
        if t.state.is_terminal() {
            return Err(TransferError::AlreadyTerminal { id, state: t.state });
        }
        if t.state == to {
            return Ok(t);
        }
        if !t.state.can_transition_to(to) {
            return Err(TransferError::InvalidTransition {
                id,
                from: t.state,
                to,
            });
        }

        let now = now_millis();
        if to == TransferState::Active && t.started_at.is_none() {
            t.started_at = Some(now);
        }
        if to.is_terminal() {
            t.completed_at = Some(now);
        }
        if reason.is_some() {
            t.failure_reason = reason;
        }
        debug!(transfer = %id, from = %t.state, to = %to, "transfer state change");
        t.state = to;
        self.commit(&mut active, t)
    }

    /// Tell the network about a local state change. Failures are logged;
    /// the local state stands.
    fn control_best_effort(&self, t: &Transfer, control: FileControl) {
        let result = self
            .current_handle(t)
            .and_then(|handle| self.network.control_file(handle, t.id, control));
        if let Err(err) = result {
            warn!(transfer = %t.id, ?control, %err, "file control not delivered");
        }
    }

    // -----------------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------------

    /// Offer `local_path` to the peer holding `handle`. All validation runs
    /// before any record is created.
    pub fn send_file(
        &self,
        handle: SessionHandle,
        local_path: &Path,
    ) -> Result<TransferId, TransferError> {
        let metadata = match fs::metadata(local_path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::FileNotFound(local_path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(TransferError::FileNotFound(local_path.to_path_buf()));
        }
        let size = metadata.len();
        self.check_size(size)?;
        let contact = self.resolve(handle)?;

        let file_name = sanitize_file_name(&local_path.to_string_lossy());
        let path_text = local_path.to_string_lossy().into_owned();
        let mut message = compose(
            &contact,
            Some(handle),
            &file_name,
            MessageKind::File,
            Direction::Outgoing,
        );
        message.file = Some(FileRef {
            path: Some(path_text.clone()),
            size,
            mime: mime_guess::from_path(local_path)
                .first_or_octet_stream()
                .to_string(),
        });

        let transfer = self.create(
            &contact,
            handle,
            &file_name,
            size,
            Some(path_text),
            Direction::Outgoing,
            &message,
        )?;
        info!(
            transfer = %transfer.id,
            peer = %peer_id(&contact.public_key),
            size,
            "offering file"
        );

        if let Err(reason) = self
            .network
            .offer_file(handle, transfer.id, file_name, size)
        {
            self.transition(
                transfer.id,
                TransferState::Failed,
                Some(reason.to_string()),
            )?;
            return Err(TransferError::NetworkUnavailable {
                id: transfer.id,
                reason,
            });
        }
        Ok(transfer.id)
    }

    /// Write the transfer row and its file-reference message together.
    #[allow(clippy::too_many_arguments)]
    fn create(
        &self,
        contact: &Contact,
        handle: SessionHandle,
        file_name: &str,
        size: u64,
        local_path: Option<String>,
        direction: Direction,
        message: &Message,
    ) -> Result<Transfer, TransferError> {
        let mut active = self.lock();
        let id = self.storage.transaction(|tx| -> Result<i64, StorageError> {
            insert_message(tx, message)?;
            tx.exec(
                "INSERT INTO file_transfers (contact_key, session_handle, file_name, file_size,
                                             local_path, direction, state, progress,
                                             created_at, message_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8)",
                params![
                    contact.public_key,
                    handle,
                    file_name,
                    size as i64,
                    local_path,
                    direction,
                    message.created_at as i64,
                    message.uuid.to_string(),
                ],
            )?;
            tx.last_insert_rowid()
        })?;

        let transfer = Transfer {
            id: TransferId(id),
            contact_key: contact.public_key,
            session_handle: Some(handle),
            file_name: file_name.to_string(),
            file_size: size,
            local_path,
            direction,
            state: TransferState::Pending,
            progress: 0,
            created_at: message.created_at,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            message_uuid: Some(message.uuid),
        };
        active.insert(transfer.id, transfer.clone());
        debug!(transfer = %transfer.id, msg = %msg_id(&message.uuid), "transfer recorded");
        Ok(transfer)
    }

    /// The peer accepted our offer.
    pub fn on_peer_accepted(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.transition(id, TransferState::Active, None)
    }

    // -----------------------------------------------------------------------
    // Incoming
    // -----------------------------------------------------------------------

    /// Record a file the peer holding `handle` offers us.
    pub fn on_file_offer(
        &self,
        handle: SessionHandle,
        file_name: &str,
        size: u64,
    ) -> Result<Transfer, TransferError> {
        let contact = self.resolve(handle)?;
        let file_name = sanitize_file_name(file_name);
        let mut message = compose(
            &contact,
            Some(handle),
            &file_name,
            MessageKind::File,
            Direction::Incoming,
        );
        message.delivered_at = Some(message.created_at);
        message.file = Some(FileRef {
            path: None,
            size,
            mime: mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .to_string(),
        });
        let transfer = self.create(
            &contact,
            handle,
            &file_name,
            size,
            None,
            Direction::Incoming,
            &message,
        )?;
        info!(
            transfer = %transfer.id,
            peer = %peer_id(&contact.public_key),
            size,
            "incoming file offer"
        );
        Ok(transfer)
    }

    /// Accept an incoming offer into `destination_dir`. Returns the path the
    /// file will be written to; an existing file is never overwritten.
    pub fn accept_file(
        &self,
        id: TransferId,
        destination_dir: &Path,
    ) -> Result<PathBuf, TransferError> {
        let t = self.load(&self.lock(), id)?;
        if t.direction != Direction::Incoming {
            return Err(TransferError::NotIncoming(id));
        }
        if t.state != TransferState::Pending {
            return Err(TransferError::AlreadyResolved(id));
        }
        self.check_size(t.file_size)?;

        let accept = self
            .current_handle(&t)
            .and_then(|handle| self.network.accept_file(handle, id));
        if let Err(reason) = accept {
            return Err(TransferError::NetworkUnavailable { id, reason });
        }

        let mut active = self.lock();
        let mut t = self.load(&active, id)?;
        if t.state != TransferState::Pending {
            return Err(TransferError::AlreadyResolved(id));
        }
        let destination = reserve_destination(destination_dir, &t.file_name)?;
        t.local_path = Some(destination.to_string_lossy().into_owned());
        t.state = TransferState::Active;
        t.started_at = Some(now_millis());
        self.commit(&mut active, t)?;
        info!(transfer = %id, path = %destination.display(), "file accepted");
        Ok(destination)
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    pub fn pause_file(&self, id: TransferId) -> Result<Transfer, TransferError> {
        let t = self.transition(id, TransferState::Paused, None)?;
        self.control_best_effort(&t, FileControl::Pause);
        Ok(t)
    }

    pub fn resume_file(&self, id: TransferId) -> Result<Transfer, TransferError> {
        let t = self.transition(id, TransferState::Active, None)?;
        self.control_best_effort(&t, FileControl::Resume);
        if t.progress == t.file_size {
            // Every byte arrived while paused.
            return self.on_chunk_progress(id, t.progress);
        }
        Ok(t)
    }

    /// Cancel a transfer that has not finished. The peer is told on a best
    /// effort basis.
    pub fn cancel_file(&self, id: TransferId) -> Result<Transfer, TransferError> {
        let t = self.transition(id, TransferState::Cancelled, None)?;
        info!(transfer = %id, "transfer cancelled");
        self.control_best_effort(&t, FileControl::Cancel);
        Ok(t)
    }

    /// Record that `bytes` of the file have moved. Progress is clamped to the
    /// declared size and never goes backwards; reaching the declared size
    /// completes the transfer, unless it is paused, in which case it
    /// completes on resume.
    pub fn on_chunk_progress(&self, id: TransferId, bytes: u64) -> Result<Transfer, TransferError> {
        let mut active = self.lock();
        let mut t = self.load(&active, id)?;
        if t.state.is_terminal() {
            return Err(TransferError::AlreadyTerminal { id, state: t.state });
        }

        let progress = bytes.min(t.file_size).max(t.progress);
        let completes = progress == t.file_size && t.state != TransferState::Paused;
        if progress == t.progress && t.state != TransferState::Pending && !completes {
            return Ok(t);
        }
        let now = now_millis();
        t.progress = progress;
        if t.state == TransferState::Pending {
            t.state = TransferState::Active;
            t.started_at = Some(now);
        }
        if completes && t.state.can_transition_to(TransferState::Completed) {
            t.state = TransferState::Completed;
            t.completed_at = Some(now);
            info!(transfer = %id, size = t.file_size, "transfer completed");
        }
        self.commit(&mut active, t)
    }

    pub fn on_transfer_failed(&self, id: TransferId, reason: &str) -> Result<Transfer, TransferError> {
        let t = self.transition(id, TransferState::Failed, Some(reason.to_string()))?;
        warn!(transfer = %id, reason, "transfer failed");
        Ok(t)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        match self.load(&self.lock(), id) {
            Ok(t) => Ok(Some(t)),
            Err(TransferError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of transfers that have not reached a terminal state.
    pub fn get_active_transfers(&self) -> Vec<Transfer> {
        self.lock().values().cloned().collect()
    }

    /// Most recent transfers in any state, newest first.
    pub fn list_transfers(&self, limit: usize) -> Result<Vec<Transfer>, TransferError> {
        Ok(self.storage.query(
            &format!(
                "SELECT {TRANSFER_COLUMNS} FROM file_transfers ORDER BY id DESC LIMIT ?1"
            ),
            params![limit.min(crate::messages::MAX_PAGE_SIZE) as i64],
            row_to_transfer,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::{client, ScriptedNetwork};
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tempfile::TempDir;

    struct Fixture {
        transfers: TransferManager,
        storage: Arc<Storage>,
        contacts: Arc<ContactManager>,
        net: Arc<ScriptedNetwork>,
        tmp: TempDir,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let net = ScriptedNetwork::new();
        let network = client(&net);
        let contacts = Arc::new(ContactManager::new(storage.clone(), network.clone()).unwrap());
        contacts
            .on_friend_request_accepted(PublicKey::from_bytes([1; 32]), SessionHandle(1))
            .unwrap();
        let transfers = TransferManager::new(storage.clone(), contacts.clone(), network).unwrap();
        Fixture {
            transfers,
            storage,
            contacts,
            net,
            tmp: TempDir::new().unwrap(),
        }
    }

    fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_size_ceiling_is_inclusive() {
        let f = fixture();
        f.transfers.set_max_file_size(1024).unwrap();
        let exact = write_file(f.tmp.path(), "exact.bin", 1024);
        let over = write_file(f.tmp.path(), "over.bin", 1025);

        assert!(f.transfers.send_file(SessionHandle(1), &exact).is_ok());
        assert!(matches!(
            f.transfers.send_file(SessionHandle(1), &over),
            Err(TransferError::FileTooLarge {
                size: 1025,
                max: 1024
            })
        ));
        assert_eq!(f.net.offers.lock().unwrap().len(), 1);
        assert_eq!(f.transfers.list_transfers(10).unwrap().len(), 1);
    }

    #[test]
    fn test_send_file_validation_creates_nothing() {
        let f = fixture();
        assert!(matches!(
            f.transfers
                .send_file(SessionHandle(1), &f.tmp.path().join("missing.txt")),
            Err(TransferError::FileNotFound(_))
        ));
        assert!(matches!(
            f.transfers.send_file(SessionHandle(1), f.tmp.path()),
            Err(TransferError::FileNotFound(_))
        ));
        let file = write_file(f.tmp.path(), "a.txt", 3);
        assert!(matches!(
            f.transfers.send_file(SessionHandle(9), &file),
            Err(TransferError::ContactNotFound(_))
        ));
        assert!(f.transfers.list_transfers(10).unwrap().is_empty());
        let messages: Option<i64> = f
            .storage
            .query_one("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(messages, Some(0));
    }

    #[test]
    fn test_max_file_size_persists() {
        let f = fixture();
        assert_eq!(f.transfers.get_max_file_size(), DEFAULT_MAX_FILE_SIZE);
        f.transfers.set_max_file_size(4096).unwrap();
        let reloaded =
            TransferManager::new(f.storage.clone(), f.contacts.clone(), client(&f.net)).unwrap();
        assert_eq!(reloaded.get_max_file_size(), 4096);
    }

    #[test]
    fn test_outgoing_lifecycle_completes_and_updates_message() {
        let f = fixture();
        let file = write_file(f.tmp.path(), "photo.png", 10);
        let id = f.transfers.send_file(SessionHandle(1), &file).unwrap();

        let t = f.transfers.on_peer_accepted(id).unwrap();
        assert_eq!(t.state, TransferState::Active);
        f.transfers.on_chunk_progress(id, 4).unwrap();
        // Progress never goes backwards.
        assert_eq!(f.transfers.on_chunk_progress(id, 2).unwrap().progress, 4);

        let paused = f.transfers.pause_file(id).unwrap();
        assert_eq!(paused.state, TransferState::Paused);
        f.transfers.resume_file(id).unwrap();

        // Over-reporting is clamped to the declared size.
        let done = f.transfers.on_chunk_progress(id, 50).unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.progress, 10);
        assert!(f.transfers.get_active_transfers().is_empty());

        let (path, size, mime): (Option<String>, i64, String) = f
            .storage
            .query_one(
                "SELECT file_path, file_size, file_mime FROM messages WHERE uuid = ?1",
                params![done.message_uuid.unwrap().to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(path.as_deref(), Some(&*file.to_string_lossy()));
        assert_eq!(size, 10);
        assert_eq!(mime, "image/png");

        let controls = f.net.controls.lock().unwrap();
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0].2, FileControl::Pause);
    }

    #[test]
    fn test_progress_while_paused_completes_on_resume() {
        let f = fixture();
        let file = write_file(f.tmp.path(), "notes.txt", 10);
        let id = f.transfers.send_file(SessionHandle(1), &file).unwrap();
        f.transfers.on_peer_accepted(id).unwrap();
        f.transfers.pause_file(id).unwrap();

        // Chunks already in flight still land while paused.
        let t = f.transfers.on_chunk_progress(id, 10).unwrap();
        assert_eq!(t.state, TransferState::Paused);
        assert_eq!(t.progress, 10);
        assert!(t.completed_at.is_none());
        assert_eq!(f.transfers.get_active_transfers().len(), 1);

        let resumed = f.transfers.resume_file(id).unwrap();
        assert_eq!(resumed.state, TransferState::Completed);
        assert!(resumed.completed_at.is_some());
        assert!(f.transfers.get_active_transfers().is_empty());
    }

    #[test]
    fn test_cancel_after_completion_rejected() {
        let f = fixture();
        let file = write_file(f.tmp.path(), "doc.pdf", 5);
        let id = f.transfers.send_file(SessionHandle(1), &file).unwrap();
        f.transfers.on_chunk_progress(id, 5).unwrap();

        assert!(matches!(
            f.transfers.cancel_file(id),
            Err(TransferError::AlreadyTerminal {
                state: TransferState::Completed,
                ..
            })
        ));
        assert_eq!(
            f.transfers.get_transfer(id).unwrap().unwrap().state,
            TransferState::Completed
        );
        assert!(matches!(
            f.transfers.on_chunk_progress(id, 5),
            Err(TransferError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn test_cancel_is_best_effort_when_offline() {
        let f = fixture();
        let file = write_file(f.tmp.path(), "doc.txt", 5);
        let id = f.transfers.send_file(SessionHandle(1), &file).unwrap();
        f.net.offline.store(true, AtomicOrdering::SeqCst);
        let t = f.transfers.cancel_file(id).unwrap();
        assert_eq!(t.state, TransferState::Cancelled);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_offer_failure_marks_transfer_failed() {
        let f = fixture();
        f.net.offline.store(true, AtomicOrdering::SeqCst);
        let file = write_file(f.tmp.path(), "x.bin", 1);
        let err = f.transfers.send_file(SessionHandle(1), &file).unwrap_err();
        let TransferError::NetworkUnavailable { id, .. } = err else {
            panic!("expected NetworkUnavailable, got {err:?}");
        };
        let t = f.transfers.get_transfer(id).unwrap().unwrap();
        assert_eq!(t.state, TransferState::Failed);
        assert!(t.failure_reason.is_some());
    }

    #[test]
    fn test_incoming_accept_never_clobbers() {
        let f = fixture();
        let dest = f.tmp.path().join("downloads");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("report.txt"), b"existing").unwrap();

        let offer = f
            .transfers
            .on_file_offer(SessionHandle(1), "../../etc/report.txt", 8)
            .unwrap();
        assert_eq!(offer.file_name, "report.txt");
        assert_eq!(offer.state, TransferState::Pending);

        let path = f.transfers.accept_file(offer.id, &dest).unwrap();
        assert_eq!(path, dest.join("report (1).txt"));
        assert_eq!(fs::read(dest.join("report.txt")).unwrap(), b"existing");
        assert!(matches!(
            f.transfers.accept_file(offer.id, &dest),
            Err(TransferError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn test_accept_rejects_outgoing_and_oversized() {
        let f = fixture();
        let file = write_file(f.tmp.path(), "mine.bin", 2);
        let outgoing = f.transfers.send_file(SessionHandle(1), &file).unwrap();
        assert!(matches!(
            f.transfers.accept_file(outgoing, f.tmp.path()),
            Err(TransferError::NotIncoming(_))
        ));

        f.transfers.set_max_file_size(100).unwrap();
        let big = f
            .transfers
            .on_file_offer(SessionHandle(1), "big.iso", 101)
            .unwrap();
        assert!(matches!(
            f.transfers.accept_file(big.id, f.tmp.path()),
            Err(TransferError::FileTooLarge { .. })
        ));
        assert!(matches!(
            f.transfers.accept_file(TransferId(999), f.tmp.path()),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn test_chunk_promotes_pending_to_active() {
        let f = fixture();
        let offer = f
            .transfers
            .on_file_offer(SessionHandle(1), "song.mp3", 100)
            .unwrap();
        let t = f.transfers.on_chunk_progress(offer.id, 10).unwrap();
        assert_eq!(t.state, TransferState::Active);
        assert!(t.started_at.is_some());
    }

    #[test]
    fn test_unfinished_transfers_fail_on_restart() {
        let f = fixture();
        let offer = f
            .transfers
            .on_file_offer(SessionHandle(1), "half.zip", 100)
            .unwrap();
        f.transfers.on_chunk_progress(offer.id, 50).unwrap();

        let restarted =
            TransferManager::new(f.storage.clone(), f.contacts.clone(), client(&f.net)).unwrap();
        let t = restarted.get_transfer(offer.id).unwrap().unwrap();
        assert_eq!(t.state, TransferState::Failed);
        assert_eq!(t.failure_reason.as_deref(), Some(INTERRUPTED));
        assert!(restarted.get_active_transfers().is_empty());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a/b/c.txt"), "c.txt");
        assert_eq!(sanitize_file_name("..\\..\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("dir/"), "file");
        assert_eq!(sanitize_file_name("bad\u{0}name"), "badname");
    }
}
