//! Integration tests for the storage engine and migration ledger.
//!
//! Tests cover:
//! - Upgrading a database left by a release without message uuids
//! - Legacy rows sharing a timestamp keep their order after the upgrade
//! - Migration idempotence across reopen
//! - Settings and ledger persistence on disk
//! - Encryption at rest (SQLCipher builds only)

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::{params, Connection};
use tempfile::TempDir;
use uuid::Uuid;

use parley::config::Settings;
use parley::messenger::Messenger;
use parley::model::{uuid_millis, PublicKey};
use parley::network::OfflineNetwork;
use parley::storage::migrations::run_migrations_up_to;
use parley::storage::{db_path, MigrationContext, Storage, StorageError, MIGRATIONS};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PEER_HEX: &str = "76518406F6A9F2217E8DC487CC783C25CC16A15EB36FF32E335A235342C48A39";

fn ledger_names(storage: &Storage) -> Vec<String> {
    storage
        .applied_migrations()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

/// Build a database the way the first release left it: base schema only,
/// messages keyed by row id.
fn write_v0_database(path: &std::path::Path, created: &[u64]) {
    let conn = Connection::open(path).unwrap();
    run_migrations_up_to(
        &conn,
        1,
        &MigrationContext {
            full_text_allowed: true,
        },
    )
    .unwrap();
    conn.execute(
        "INSERT INTO contacts (public_key, name, created_at, updated_at)
         VALUES (?1, 'alice', 1, 1)",
        params![PEER_HEX],
    )
    .unwrap();
    for (i, at) in created.iter().enumerate() {
        conn.execute(
            "INSERT INTO messages (contact_key, content, direction, created_at)
             VALUES (?1, ?2, 'incoming', ?3)",
            params![PEER_HEX, format!("old {i}"), *at as i64],
        )
        .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

#[test]
fn v0_database_gains_message_uuids() {
    let tmp = TempDir::new().unwrap();
    let path = db_path(tmp.path());
    let created = [1_700_000_000_000u64, 1_700_000_000_000, 1_700_000_005_000];
    write_v0_database(&path, &created);

    let storage = Storage::open(&path, None).unwrap();
    let rows: Vec<(String, i64)> = storage
        .query(
            "SELECT uuid, created_at FROM messages ORDER BY id",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(rows.len(), 3);

    let mut seen = HashSet::new();
    for (text, created_at) in &rows {
        let uuid = Uuid::parse_str(text).unwrap();
        assert_eq!(uuid_millis(&uuid), Some(*created_at as u64));
        assert!(seen.insert(uuid), "duplicate uuid {uuid}");
    }

    let names = ledger_names(&storage);
    assert_eq!(
        names.iter().filter(|n| *n == "0002_message_uuid").count(),
        1
    );
    storage.close().unwrap();

    // A second open applies nothing and keeps the same ids.
    let storage = Storage::open(&path, None).unwrap();
    assert_eq!(ledger_names(&storage), names);
    let again: Vec<String> = storage
        .query("SELECT uuid FROM messages ORDER BY id", [], |row| row.get(0))
        .unwrap();
    let before: Vec<String> = rows.into_iter().map(|(u, _)| u).collect();
    assert_eq!(again, before);
}

#[test]
fn v0_messages_sharing_a_millisecond_keep_their_order() {
    let tmp = TempDir::new().unwrap();
    let path = db_path(tmp.path());
    write_v0_database(&path, &[1_700_000_000_000; 20]);

    let settings = Settings::for_data_dir(tmp.path());
    let messenger = Messenger::open(settings, None, Arc::new(OfflineNetwork)).unwrap();
    let peer = PublicKey::from_hex(PEER_HEX).unwrap();
    let contents: Vec<String> = messenger
        .messages()
        .get_messages_for_contact(&peer, 50, 0)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("old {i}")).collect();
    assert_eq!(contents, expected);
}

#[test]
fn reopen_applies_each_migration_once() {
    let tmp = TempDir::new().unwrap();
    let path = db_path(tmp.path());

    for _ in 0..3 {
        let storage = Storage::open(&path, None).unwrap();
        storage.close().unwrap();
    }

    let storage = Storage::open(&path, None).unwrap();
    let names = ledger_names(&storage);
    let expected: Vec<String> = MIGRATIONS.iter().map(|m| m.name.to_string()).collect();
    assert_eq!(names, expected);
}

#[test]
fn settings_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = db_path(tmp.path());
    {
        let storage = Storage::open(&path, None).unwrap();
        storage.set_setting("ui.theme", "dark").unwrap();
        storage.set_setting("ui.theme", "light").unwrap();
        storage.close().unwrap();
    }
    let storage = Storage::open(&path, None).unwrap();
    assert_eq!(
        storage.get_setting("ui.theme").unwrap().as_deref(),
        Some("light")
    );
    assert_eq!(storage.get_setting("missing").unwrap(), None);
}

#[test]
fn public_keys_stored_as_upper_hex() {
    let storage = Storage::open_in_memory().unwrap();
    let key = PublicKey::from_hex(&PEER_HEX.to_lowercase()).unwrap();
    storage
        .exec(
            "INSERT INTO contacts (public_key, created_at, updated_at) VALUES (?1, 1, 1)",
            params![key],
        )
        .unwrap();
    let stored: Option<String> = storage
        .query_one("SELECT public_key FROM contacts", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored.as_deref(), Some(PEER_HEX));
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

#[cfg(feature = "sqlcipher")]
mod encrypted {
    use super::*;
    use parley::storage::DbKey;

    fn key(byte: u8) -> DbKey {
        DbKey::from_bytes(vec![byte; 32]).unwrap()
    }

    #[test]
    fn reopen_with_same_key() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(tmp.path());
        {
            let storage = Storage::open(&path, Some(key(7))).unwrap();
            assert!(storage.is_encrypted());
            storage.set_setting("k", "v").unwrap();
            storage.close().unwrap();
        }
        let storage = Storage::open(&path, Some(key(7))).unwrap();
        assert_eq!(storage.get_setting("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn wrong_key_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(tmp.path());
        Storage::open(&path, Some(key(7))).unwrap().close().unwrap();

        let err = Storage::open(&path, Some(key(8))).err().unwrap();
        assert!(matches!(err, StorageError::WrongKeyOrCorrupt), "{err:?}");
    }

    #[test]
    fn file_is_not_plain_sqlite() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(tmp.path());
        Storage::open(&path, Some(key(7))).unwrap().close().unwrap();

        let header = std::fs::read(&path).unwrap();
        assert!(!header.starts_with(b"SQLite format 3"));
        assert!(matches!(
            Storage::open(&path, None),
            Err(StorageError::Corrupt(_) | StorageError::WrongKeyOrCorrupt)
        ));
    }
}

#[cfg(not(feature = "sqlcipher"))]
#[test]
fn key_without_cipher_support_is_refused() {
    let tmp = TempDir::new().unwrap();
    let key = parley::storage::DbKey::from_bytes(vec![7; 32]).unwrap();
    let err = Storage::open(&db_path(tmp.path()), Some(key)).err().unwrap();
    assert!(matches!(err, StorageError::EncryptionUnavailable));
}
