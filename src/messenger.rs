//! The messenger facade: one storage handle, the three managers, and the
//! routing of network events into them.
//!
//! UI code calls the managers directly through the accessors. Network code
//! either calls [`Messenger::handle_event`] on its own thread or submits to the
//! queue returned by [`Messenger::start_event_queue`]. Either way, UI
//! notifications go out on the broadcast channel only after the change is on
//! disk.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, Settings};
use crate::contacts::{ContactError, ContactManager};
use crate::events::{EventQueue, NetworkEvent, UiEvent, UI_CHANNEL_CAPACITY};
use crate::messages::{MessageError, MessageManager};
use crate::model::TransferId;
use crate::network::{Network, NetworkClient};
use crate::storage::{DbKey, OpenOptions, Storage, StorageError};
use crate::transfers::{TransferError, TransferManager};

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error(transparent)]
    Contact(#[from] ContactError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start event dispatcher: {0}")]
    Dispatcher(#[from] std::io::Error),
}

pub struct Messenger {
    settings: Mutex<Settings>,
    storage: Arc<Storage>,
    network: Arc<NetworkClient>,
    contacts: Arc<ContactManager>,
    messages: Arc<MessageManager>,
    transfers: Arc<TransferManager>,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl Messenger {
    /// Open (or create) the store under `settings.data_dir` and build the
    /// managers on top of it.
    pub fn open(
        settings: Settings,
        key: Option<DbKey>,
        network: Arc<dyn Network>,
    ) -> Result<Self, MessengerError> {
        let path = settings.database_path();
        let storage = Storage::open_with(
            &path,
            OpenOptions {
                key,
                full_text: settings.full_text_mode(),
            },
        )?;
        info!(
            path = %path.display(),
            encrypted = storage.is_encrypted(),
            full_text = storage.has_full_text_search(),
            "store opened"
        );
        Self::with_storage(settings, Arc::new(storage), network)
    }

    /// Build the managers over an already-open store.
    pub fn with_storage(
        settings: Settings,
        storage: Arc<Storage>,
        network: Arc<dyn Network>,
    ) -> Result<Self, MessengerError> {
        let network = Arc::new(NetworkClient::new(network, settings.network_timeout()));
        let contacts = Arc::new(ContactManager::new(storage.clone(), network.clone())?);
        let messages = Arc::new(MessageManager::new(
            storage.clone(),
            contacts.clone(),
            network.clone(),
        ));
        let transfers = Arc::new(TransferManager::new(
            storage.clone(),
            contacts.clone(),
            network.clone(),
        )?);
        if let Some(max) = settings.max_file_size {
            if max != transfers.get_max_file_size() {
                transfers.set_max_file_size(max)?;
            }
        }
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        let delivered_tx = ui_tx.clone();
        messages.set_delivery_listener(Box::new(move |message| {
            let _ = delivered_tx.send(UiEvent::MessageDelivered {
                uuid: message.uuid,
                delivered_at: message.delivered_at,
            });
        }));

        Ok(Self {
            settings: Mutex::new(settings),
            storage,
            network,
            contacts,
            messages,
            transfers,
            ui_tx,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn contacts(&self) -> &Arc<ContactManager> {
        &self.contacts
    }

    pub fn messages(&self) -> &Arc<MessageManager> {
        &self.messages
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Receive UI notifications from now on. Works without an async runtime
    /// via `blocking_recv`/`try_recv`.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is fine.
        let _ = self.ui_tx.send(event);
    }

    fn lock_settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> Settings {
        self.lock_settings().clone()
    }

    /// Apply a new settings snapshot. Timeout and file size ceiling take
    /// effect immediately; the data directory and full-text choice need a
    /// reopen. An invalid snapshot changes nothing.
    pub fn apply_settings(&self, new: Settings) -> Result<(), MessengerError> {
        new.validate()?;
        let mut current = self.lock_settings();
        if new.data_dir != current.data_dir || new.full_text_search != current.full_text_search {
            warn!("data_dir and full_text_search changes apply on next open");
        }
        if let Some(max) = new.max_file_size {
            self.transfers.set_max_file_size(max)?;
        }
        self.network.set_timeout(new.network_timeout());
        info!(
            timeout_secs = new.network_timeout_secs,
            max_file_size = self.transfers.get_max_file_size(),
            "settings applied"
        );
        *current = new;
        Ok(())
    }

    /// Accept an incoming file into the configured downloads directory.
    pub fn accept_file_to_downloads(
        &self,
        transfer: TransferId,
    ) -> Result<PathBuf, MessengerError> {
        let dir = self.lock_settings().downloads_dir();
        self.accept_file_into(transfer, &dir)
    }

    /// Accept an incoming file into `dir` and publish the new transfer state.
    pub fn accept_file_into(
        &self,
        transfer: TransferId,
        dir: &Path,
    ) -> Result<PathBuf, MessengerError> {
        let path = self.transfers.accept_file(transfer, dir)?;
        if let Some(t) = self.transfers.get_transfer(transfer)? {
            self.emit(UiEvent::TransferUpdated { transfer: t });
        }
        Ok(path)
    }

    /// Apply one network event and publish the resulting UI notifications.
    pub fn handle_event(&self, event: NetworkEvent) -> Result<(), MessengerError> {
        debug!(event = event.name(), "handling network event");
        match event {
            NetworkEvent::FriendRequest {
                public_key,
                message,
            } => {
                if let Some(request) = self.contacts.on_friend_request(public_key, &message)? {
                    self.emit(UiEvent::FriendRequestReceived {
                        public_key: request.public_key,
                        message: request.message,
                    });
                }
            }
            NetworkEvent::FriendAccepted { public_key, handle } => {
                let contact = self.contacts.on_friend_request_accepted(public_key, handle)?;
                self.emit(UiEvent::ContactUpdated { contact });
            }
            NetworkEvent::SessionAssigned { public_key, handle } => {
                if let Some(contact) = self.contacts.assign_session(public_key, handle)? {
                    self.emit(UiEvent::ContactUpdated { contact });
                }
            }
            NetworkEvent::PresenceChanged { handle, presence } => {
                let Some(contact) = self.contacts.on_presence_changed(handle, presence)? else {
                    return Ok(());
                };
                self.emit(UiEvent::ContactUpdated { contact });
                if presence.is_connected() {
                    let sent = self.messages.retry_undelivered(handle)?;
                    if sent > 0 {
                        info!(%handle, sent, "flushed offline queue");
                    }
                } else {
                    self.messages.forget_receipts(handle);
                }
            }
            NetworkEvent::NameChanged { handle, name } => {
                if let Some(contact) = self.contacts.on_name_changed(handle, &name)? {
                    self.emit(UiEvent::ContactUpdated { contact });
                }
            }
            NetworkEvent::StatusMessageChanged {
                handle,
                status_message,
            } => {
                if let Some(contact) = self
                    .contacts
                    .on_status_message_changed(handle, &status_message)?
                {
                    self.emit(UiEvent::ContactUpdated { contact });
                }
            }
            NetworkEvent::MessageReceived {
                handle,
                kind,
                content,
            } => {
                let message = self.messages.on_message_received(handle, &content, kind)?;
                self.emit(UiEvent::MessageReceived { message });
            }
            NetworkEvent::DeliveryReceipt { handle, receipt } => {
                if let Some(message) = self.messages.on_delivery_receipt(handle, receipt)? {
                    self.emit(UiEvent::MessageDelivered {
                        uuid: message.uuid,
                        delivered_at: message.delivered_at,
                    });
                }
            }
            NetworkEvent::FileOffer {
                handle,
                file_name,
                size,
            } => {
                let transfer = self.transfers.on_file_offer(handle, &file_name, size)?;
                if let Some(uuid) = transfer.message_uuid {
                    if let Some(message) = self.messages.get_message(uuid)? {
                        self.emit(UiEvent::MessageReceived { message });
                    }
                }
                self.emit(UiEvent::TransferUpdated { transfer });
            }
            NetworkEvent::PeerAcceptedFile { transfer } => {
                let transfer = self.transfers.on_peer_accepted(transfer)?;
                self.emit(UiEvent::TransferUpdated { transfer });
            }
            NetworkEvent::ChunkProgress { transfer, bytes } => {
                let transfer = self.transfers.on_chunk_progress(transfer, bytes)?;
                self.emit(UiEvent::TransferUpdated { transfer });
            }
            NetworkEvent::TransferFailed { transfer, reason } => {
                let transfer = self.transfers.on_transfer_failed(transfer, &reason)?;
                self.emit(UiEvent::TransferUpdated { transfer });
            }
        }
        Ok(())
    }

    /// Start a dispatcher thread that feeds queued events to
    /// [`handle_event`](Self::handle_event). Failures are logged and the
    /// dispatcher moves on to the next event.
    pub fn start_event_queue(self: &Arc<Self>) -> Result<EventQueue, MessengerError> {
        let capacity = self.lock_settings().event_queue_capacity;
        let messenger = Arc::clone(self);
        let queue = EventQueue::start(capacity, move |event| {
            let name = event.name();
            if let Err(e) = messenger.handle_event(event) {
                warn!(event = name, error = %e, "network event rejected");
            }
        })?;
        Ok(queue)
    }

    /// Close the store. Manager calls afterwards fail with
    /// [`StorageError::Closed`].
    pub fn close(&self) -> Result<(), MessengerError> {
        self.storage.close()?;
        info!("messenger closed");
        Ok(())
    }
}
