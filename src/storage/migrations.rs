//! Ordered, named schema migrations with an applied-migrations ledger.
//!
//! Each migration runs inside its own immediate transaction together with
//! the ledger insert, so a crash leaves either both or neither. Whether a
//! migration already ran is checked after the write lock is taken, which
//! makes concurrent opens of the same file safe.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use super::StorageError;
use crate::model::{now_millis, uuid_at_millis};

pub struct MigrationContext {
    /// False when the caller turned full-text search off.
    pub full_text_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied,
    /// Not recorded in the ledger, so it is retried on the next open.
    Skipped(&'static str),
}

type ApplyFn = fn(&Connection, &MigrationContext) -> Result<MigrationOutcome, StorageError>;

pub struct Migration {
    pub name: &'static str,
    apply: ApplyFn,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_base_schema",
        apply: base_schema,
    },
    Migration {
        name: "0002_message_uuid",
        apply: message_uuid,
    },
    Migration {
        name: "0003_message_reply_to",
        apply: message_reply_to,
    },
    Migration {
        name: "0004_friend_requests",
        apply: friend_requests,
    },
    Migration {
        name: "0005_messages_fts",
        apply: messages_fts,
    },
    Migration {
        name: "0006_message_dispatched_at",
        apply: message_dispatched_at,
    },
];

/// Apply every migration in `migrations` not yet in the ledger, in order.
/// Returns how many were applied.
pub fn run_migrations(
    conn: &Connection,
    migrations: &[Migration],
    ctx: &MigrationContext,
) -> Result<usize, StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            name       TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let mut applied = 0;
    for migration in migrations {
        if run_one(conn, migration, ctx).map_err(|source| StorageError::Migration {
            name: migration.name,
            source: Box::new(source),
        })? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Apply only the first `count` migrations. Lets tests build a database as
/// an older release would have left it.
pub fn run_migrations_up_to(
    conn: &Connection,
    count: usize,
    ctx: &MigrationContext,
) -> Result<usize, StorageError> {
    run_migrations(conn, &MIGRATIONS[..count.min(MIGRATIONS.len())], ctx)
}

fn run_one(
    conn: &Connection,
    migration: &Migration,
    ctx: &MigrationContext,
) -> Result<bool, StorageError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    if is_applied(&tx, migration.name)? {
        return Ok(false);
    }

    match (migration.apply)(&tx, ctx)? {
        MigrationOutcome::Applied => {
            tx.execute(
                "INSERT INTO migrations (name, applied_at) VALUES (?1, ?2)",
                params![migration.name, now_millis() as i64],
            )?;
            tx.commit()?;
            info!(migration = migration.name, "applied schema migration");
            Ok(true)
        }
        MigrationOutcome::Skipped(reason) => {
            tx.rollback()?;
            info!(migration = migration.name, reason, "skipped schema migration");
            Ok(false)
        }
    }
}

fn is_applied(conn: &Connection, name: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM migrations WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn has_table(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StorageError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn base_schema(conn: &Connection, _ctx: &MigrationContext) -> Result<MigrationOutcome, StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS contacts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            public_key      TEXT NOT NULL UNIQUE,
            session_handle  INTEGER,
            name            TEXT NOT NULL DEFAULT '',
            status_message  TEXT NOT NULL DEFAULT '',
            presence        TEXT NOT NULL DEFAULT 'offline',
            blocked         INTEGER NOT NULL DEFAULT 0,
            favorite        INTEGER NOT NULL DEFAULT 0,
            avatar          BLOB,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            last_seen       INTEGER
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_session_handle
            ON contacts(session_handle) WHERE session_handle IS NOT NULL;

        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_key      TEXT NOT NULL,
            session_handle   INTEGER,
            content          TEXT NOT NULL DEFAULT '',
            message_type     TEXT NOT NULL DEFAULT 'normal',
            direction        TEXT NOT NULL,
            created_at       INTEGER NOT NULL,
            delivered_at     INTEGER,
            read_at          INTEGER,
            edited_at        INTEGER,
            original_content TEXT,
            file_path        TEXT,
            file_size        INTEGER,
            file_mime        TEXT,
            deleted          INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_contact
            ON messages(contact_key, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_session_handle
            ON messages(session_handle);
        CREATE INDEX IF NOT EXISTS idx_messages_created
            ON messages(created_at);

        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_transfers (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            contact_key     TEXT NOT NULL,
            session_handle  INTEGER,
            file_name       TEXT NOT NULL,
            file_size       INTEGER NOT NULL,
            local_path      TEXT,
            direction       TEXT NOT NULL,
            state           TEXT NOT NULL DEFAULT 'pending',
            progress        INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            started_at      INTEGER,
            completed_at    INTEGER,
            failure_reason  TEXT,
            message_uuid    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_file_transfers_session_handle
            ON file_transfers(session_handle);
        CREATE INDEX IF NOT EXISTS idx_file_transfers_state
            ON file_transfers(state);
        ",
    )?;
    Ok(MigrationOutcome::Applied)
}

/// Give every message a time-ordered UUID. Existing rows get one built
/// from their own `created_at` so the embedded timestamp stays truthful,
/// with the row id in the low bits so rows sharing a millisecond keep their
/// insertion order.
fn message_uuid(conn: &Connection, _ctx: &MigrationContext) -> Result<MigrationOutcome, StorageError> {
    if !has_column(conn, "messages", "uuid")? {
        conn.execute_batch("ALTER TABLE messages ADD COLUMN uuid TEXT;")?;
    }

    let pending: Vec<(i64, i64)> = {
        let mut stmt =
            conn.prepare("SELECT id, created_at FROM messages WHERE uuid IS NULL ORDER BY id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<(i64, i64)>>>()?
    };

    let mut update = conn.prepare("UPDATE messages SET uuid = ?1 WHERE id = ?2")?;
    for (id, created_at) in &pending {
        let uuid = uuid_at_millis((*created_at).max(0) as u64, (*id).max(0) as u64);
        update.execute(params![uuid.to_string(), id])?;
    }
    if !pending.is_empty() {
        info!(rows = pending.len(), "backfilled message uuids");
    }

    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_uuid ON messages(uuid);",
    )?;
    Ok(MigrationOutcome::Applied)
}

fn message_reply_to(
    conn: &Connection,
    _ctx: &MigrationContext,
) -> Result<MigrationOutcome, StorageError> {
    if !has_column(conn, "messages", "reply_to")? {
        conn.execute_batch("ALTER TABLE messages ADD COLUMN reply_to TEXT;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_messages_reply_to ON messages(reply_to);",
    )?;
    Ok(MigrationOutcome::Applied)
}

fn friend_requests(
    conn: &Connection,
    _ctx: &MigrationContext,
) -> Result<MigrationOutcome, StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS friend_requests (
            public_key  TEXT PRIMARY KEY,
            message     TEXT NOT NULL DEFAULT '',
            received_at INTEGER NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_friend_requests_status
            ON friend_requests(status, received_at);
        ",
    )?;
    Ok(MigrationOutcome::Applied)
}

/// External-content FTS5 index over live (not soft-deleted) messages.
fn messages_fts(conn: &Connection, ctx: &MigrationContext) -> Result<MigrationOutcome, StorageError> {
    if !ctx.full_text_allowed {
        return Ok(MigrationOutcome::Skipped("full-text search disabled"));
    }
    if !fts5_supported(conn) {
        warn!("sqlite build lacks FTS5, message search will use substring matching");
        return Ok(MigrationOutcome::Skipped("fts5 unavailable"));
    }

    conn.execute_batch(
        "
        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
            content,
            content='messages',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages
        WHEN new.deleted = 0
        BEGIN
            INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages
        WHEN old.deleted = 0
        BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
        END;

        CREATE TRIGGER IF NOT EXISTS messages_fts_update AFTER UPDATE OF content, deleted ON messages
        BEGIN
            INSERT INTO messages_fts(messages_fts, rowid, content)
                SELECT 'delete', old.id, old.content WHERE old.deleted = 0;
            INSERT INTO messages_fts(rowid, content)
                SELECT new.id, new.content WHERE new.deleted = 0;
        END;

        INSERT INTO messages_fts(rowid, content)
            SELECT id, content FROM messages WHERE deleted = 0;
        ",
    )?;
    Ok(MigrationOutcome::Applied)
}

/// When an outgoing message was handed to the network. Undelivered rows that
/// predate the column may already have reached the peer, so they count as
/// dispatched.
fn message_dispatched_at(
    conn: &Connection,
    _ctx: &MigrationContext,
) -> Result<MigrationOutcome, StorageError> {
    if !has_column(conn, "messages", "dispatched_at")? {
        conn.execute_batch("ALTER TABLE messages ADD COLUMN dispatched_at INTEGER;")?;
    }
    conn.execute_batch(
        "UPDATE messages SET dispatched_at = created_at
         WHERE direction = 'outgoing' AND delivered_at IS NULL
           AND dispatched_at IS NULL;",
    )?;
    Ok(MigrationOutcome::Applied)
}

fn fts5_supported(conn: &Connection) -> bool {
    match conn.execute_batch(
        "CREATE VIRTUAL TABLE temp.parley_fts5_probe USING fts5(body);
         DROP TABLE temp.parley_fts5_probe;",
    ) {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "fts5 probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::uuid_millis;
    use uuid::Uuid;

    fn all_allowed() -> MigrationContext {
        MigrationContext {
            full_text_allowed: true,
        }
    }

    fn ledger(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM migrations ORDER BY rowid")
            .unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let first = run_migrations(&conn, MIGRATIONS, &all_allowed()).unwrap();
        assert!(first >= MIGRATIONS.len() - 1);
        let second = run_migrations(&conn, MIGRATIONS, &all_allowed()).unwrap();
        assert_eq!(second, 0);
        assert_eq!(ledger(&conn).len(), first);
    }

    #[test]
    fn test_uuid_backfill_uses_row_timestamp() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations_up_to(&conn, 1, &all_allowed()).unwrap();

        for (i, created_at) in [1_600_000_000_000i64, 1_600_000_000_500, 1_700_000_000_000]
            .iter()
            .enumerate()
        {
            conn.execute(
                "INSERT INTO messages (contact_key, content, direction, created_at)
                 VALUES ('AB', ?1, 'incoming', ?2)",
                params![format!("m{i}"), created_at],
            )
            .unwrap();
        }

        run_migrations(&conn, MIGRATIONS, &all_allowed()).unwrap();

        let mut stmt = conn
            .prepare("SELECT uuid, created_at FROM messages ORDER BY id")
            .unwrap();
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        for (uuid, created_at) in &rows {
            let parsed = Uuid::parse_str(uuid).unwrap();
            assert_eq!(parsed.get_version_num(), 7);
            assert_eq!(uuid_millis(&parsed), Some(*created_at as u64));
        }
        let names = ledger(&conn);
        assert!(names.contains(&"0002_message_uuid".to_string()));
    }

    #[test]
    fn test_fts_skipped_when_disabled_and_retried_later() {
        let conn = Connection::open_in_memory().unwrap();
        let ctx = MigrationContext {
            full_text_allowed: false,
        };
        run_migrations(&conn, MIGRATIONS, &ctx).unwrap();
        assert!(!has_table(&conn, "messages_fts").unwrap());
        assert!(!ledger(&conn).contains(&"0005_messages_fts".to_string()));

        run_migrations(&conn, MIGRATIONS, &all_allowed()).unwrap();
        if fts5_supported(&conn) {
            assert!(has_table(&conn, "messages_fts").unwrap());
            assert!(ledger(&conn).contains(&"0005_messages_fts".to_string()));
        }
    }

    #[test]
    fn test_failed_migration_is_reported_by_name() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, &MIGRATIONS[..1], &all_allowed()).unwrap();

        fn broken(conn: &Connection, _: &MigrationContext) -> Result<MigrationOutcome, StorageError> {
            conn.execute_batch("CREATE TABLE half_done (x INTEGER); SELECT * FROM no_such_table;")?;
            Ok(MigrationOutcome::Applied)
        }
        let bad = [Migration {
            name: "9999_broken",
            apply: broken,
        }];
        let err = run_migrations(&conn, &bad, &all_allowed()).unwrap_err();
        assert!(matches!(err, StorageError::Migration { name: "9999_broken", .. }));
        // Partial work of the failed migration is rolled back.
        assert!(!has_table(&conn, "half_done").unwrap());
        assert!(!ledger(&conn).contains(&"9999_broken".to_string()));
    }
}
