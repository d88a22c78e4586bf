//! Domain types shared by the storage layer and the managers.
//!
//! A peer has two identities: the long-term [`PublicKey`] and the volatile
//! [`SessionHandle`] the network layer assigns while the peer is known to the
//! running node. Only the public key is safe to persist as a reference;
//! handles are resolved to keys at call time.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const NOSPAM_SIZE: usize = 4;
pub const CHECKSUM_SIZE: usize = 2;
/// Public key + nospam + checksum.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Millisecond timestamp embedded in a UUIDv7, if it has one.
pub fn uuid_millis(id: &Uuid) -> Option<u64> {
    id.get_timestamp().map(|ts| {
        let (secs, nanos) = ts.to_unix();
        secs * 1000 + u64::from(nanos / 1_000_000)
    })
}

/// A UUIDv7 whose embedded timestamp is `millis` and whose remaining bits
/// carry `seq`, so ids built for the same millisecond sort by `seq`.
pub fn uuid_at_millis(millis: u64, seq: u64) -> Uuid {
    let mut tail = [0u8; 10];
    // The top two bits of the tail are replaced by the variant.
    tail[2..].copy_from_slice(&(seq & (u64::MAX >> 2)).to_be_bytes());
    uuid::Builder::from_unix_timestamp_millis(millis, &tail).into_uuid()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier must be {expected} hex characters, got {found}")]
    Length { expected: usize, found: usize },
    #[error("identifier is not valid hex")]
    Hex,
    #[error("address checksum mismatch")]
    Checksum,
}

// ---------------------------------------------------------------------------
// Peer identity
// ---------------------------------------------------------------------------

/// Long-term peer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentifierError> {
        let s = s.trim();
        if s.len() != PUBLIC_KEY_SIZE * 2 {
            return Err(IdentifierError::Length {
                expected: PUBLIC_KEY_SIZE * 2,
                found: s.len(),
            });
        }
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| IdentifierError::Hex)?;
        Ok(Self(bytes))
    }

    /// Upper-case hex, the form stored in the database.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ToSql for PublicKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for PublicKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::from_hex(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// What a user types to add a contact: either a bare public key or a full
/// address carrying the peer's nospam value and a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub public_key: PublicKey,
    pub nospam: Option<[u8; NOSPAM_SIZE]>,
}

impl PeerAddress {
    /// Parse a 64-hex public key or a 76-hex address. The address checksum
    /// is the XOR of the preceding bytes folded into two lanes.
    pub fn parse(identifier: &str) -> Result<Self, IdentifierError> {
        let s = identifier.trim();
        match s.len() {
            n if n == PUBLIC_KEY_SIZE * 2 => Ok(Self {
                public_key: PublicKey::from_hex(s)?,
                nospam: None,
            }),
            n if n == ADDRESS_SIZE * 2 => {
                let mut bytes = [0u8; ADDRESS_SIZE];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| IdentifierError::Hex)?;
                let body = &bytes[..PUBLIC_KEY_SIZE + NOSPAM_SIZE];
                if address_checksum(body) != bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] {
                    return Err(IdentifierError::Checksum);
                }
                let mut key = [0u8; PUBLIC_KEY_SIZE];
                key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
                let mut nospam = [0u8; NOSPAM_SIZE];
                nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
                Ok(Self {
                    public_key: PublicKey(key),
                    nospam: Some(nospam),
                })
            }
            found => Err(IdentifierError::Length {
                expected: ADDRESS_SIZE * 2,
                found,
            }),
        }
    }

    /// Full 76-hex form, when the nospam value is known.
    pub fn to_hex(&self) -> Option<String> {
        let nospam = self.nospam?;
        let mut bytes = Vec::with_capacity(ADDRESS_SIZE);
        bytes.extend_from_slice(self.public_key.as_bytes());
        bytes.extend_from_slice(&nospam);
        let checksum = address_checksum(&bytes);
        bytes.extend_from_slice(&checksum);
        Some(hex::encode_upper(bytes))
    }
}

fn address_checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut checksum = [0u8; CHECKSUM_SIZE];
    for (i, b) in body.iter().enumerate() {
        checksum[i % CHECKSUM_SIZE] ^= b;
    }
    checksum
}

/// Network-assigned numeric handle for a peer. Not stable across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl ToSql for SessionHandle {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for SessionHandle {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        u32::try_from(raw)
            .map(SessionHandle)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub i64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t-{}", self.0)
    }
}

/// Delivery receipt number returned by the network layer for a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Receipt(pub u32);

// ---------------------------------------------------------------------------
// Enumerations stored as text
// ---------------------------------------------------------------------------

/// Declares a text-backed enum with `as_str` / `parse` helpers and SQL
/// conversions matching the lowercase names stored in the database.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                $name::parse(text).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} value {:?}", stringify!($name), text).into(),
                    )
                })
            }
        }
    };
}

text_enum!(
    /// Peer presence as reported by the network layer.
    Presence {
        Offline => "offline",
        Away => "away",
        Busy => "busy",
        Online => "online",
    }
);

impl Presence {
    pub fn is_connected(&self) -> bool {
        !matches!(self, Presence::Offline)
    }
}

text_enum!(
    MessageKind {
        Normal => "normal",
        Action => "action",
        File => "file",
    }
);

text_enum!(
    Direction {
        Incoming => "incoming",
        Outgoing => "outgoing",
    }
);

text_enum!(
    TransferState {
        Pending => "pending",
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
);

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// Transitions are forward-only except for the `active <-> paused` edge.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

text_enum!(
    FriendRequestStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
);

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub id: ContactId,
    pub public_key: PublicKey,
    pub session_handle: Option<SessionHandle>,
    pub name: String,
    pub status_message: String,
    pub presence: Presence,
    pub blocked: bool,
    pub favorite: bool,
    #[serde(skip)]
    pub avatar: Option<Vec<u8>>,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_seen: Option<u64>,
}

impl Contact {
    /// Name to show in lists: the peer's chosen name or a short key prefix.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.public_key.to_hex().chars().take(8).collect()
        } else {
            self.name.clone()
        }
    }
}

/// File fields carried by file-reference messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRef {
    pub path: Option<String>,
    pub size: u64,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub uuid: Uuid,
    pub contact_key: PublicKey,
    pub session_handle: Option<SessionHandle>,
    pub content: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub created_at: u64,
    pub delivered_at: Option<u64>,
    /// Set once an outgoing message has been handed to the network, even if
    /// the call timed out. Such messages are never resent automatically.
    pub dispatched_at: Option<u64>,
    pub read_at: Option<u64>,
    pub edited_at: Option<u64>,
    pub original_content: Option<String>,
    pub file: Option<FileRef>,
    pub deleted: bool,
    pub reply_to: Option<Uuid>,
}

impl Message {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub id: TransferId,
    pub contact_key: PublicKey,
    pub session_handle: Option<SessionHandle>,
    pub file_name: String,
    pub file_size: u64,
    pub local_path: Option<String>,
    pub direction: Direction,
    pub state: TransferState,
    pub progress: u64,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub failure_reason: Option<String>,
    pub message_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendRequest {
    pub public_key: PublicKey,
    pub message: String,
    pub received_at: u64,
    pub status: FriendRequestStatus,
}
