//! Durable state: outbox, ping inbox, received-ids, message store,
//! ping sessions and peer sequence counters.
//!
//! One SQLite database, WAL mode, foreign keys on. All access goes
//! through [`Store`], which serializes on its own connection mutex; no
//! caller ever holds the lock across I/O or an await point.

pub mod inbox;
pub mod outbox;
pub mod received;
pub mod schema;
pub mod sequences;
pub mod sessions;

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use rusqlite::Connection;
use thiserror::Error;

use crate::protocol::wire::{MessageId, PingId};
use crate::protocol::WireType;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Capacity of the in-memory recent-ids cache in front of `received_ids`.
const RECENT_IDS_CAPACITY: usize = 10_000;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle to the core database.
pub struct Store {
    conn: Mutex<Connection>,
    /// Hot cache of recently seen (namespace, id) pairs. A hit means
    /// definitely seen; a miss falls through to the unique-index insert,
    /// which is the authoritative guard.
    recent: Mutex<LruCache<(u8, String), ()>>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests and ephemeral profiles).
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_IDS_CAPACITY).expect("capacity is nonzero"),
            )),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    pub(crate) fn recent_lock(&self) -> MutexGuard<'_, LruCache<(u8, String), ()>> {
        self.recent.lock().expect("recent-ids lock poisoned")
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current == 0 {
        log::info!("initializing database schema v{SCHEMA_VERSION}");
        conn.execute_batch(schema::SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if current < SCHEMA_VERSION {
        for version in (current + 1)..=SCHEMA_VERSION {
            log::info!("running migration to v{version}");
            run_migration(conn, version)?;
            conn.pragma_update(None, "user_version", version)?;
        }
    } else if current > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    Ok(())
}

fn run_migration(_conn: &Connection, version: u32) -> Result<()> {
    // Future migrations go here:
    // 2 => migration_v2(conn),
    Err(StorageError::Migration(format!(
        "unknown migration version: {version}"
    )))
}

/// A message row as persisted by the atomic-store flow.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub contact_id: i64,
    pub ping_id: Option<PingId>,
    pub message_type: WireType,
    pub content: Vec<u8>,
    pub timestamp_ms: i64,
}

/// Outcome of the atomic-store flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Inserted and, if a ping-id was supplied, the inbox row advanced to
    /// MSG_STORED with its cached wire bytes cleared.
    Stored,
    /// The message-id was already present; nothing changed.
    Duplicate,
}

/// Atomic-store flow for an incoming message payload.
///
/// One transaction: dedup insert into `received_ids[MESSAGE]`, insert the
/// message row, transition the ping-inbox row to MSG_STORED and null its
/// cached wire bytes. The caller emits MESSAGE_ACK afterwards in either
/// outcome.
pub fn store_incoming_message(
    store: &Store,
    msg: &StoredMessage,
    now_ms: i64,
) -> Result<StoreOutcome> {
    let outcome = {
        let mut conn = store.lock();
        let tx = conn.transaction()?;

        let fresh = tx.execute(
            "INSERT OR IGNORE INTO received_ids (namespace, id, received_ms)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                received::IdNamespace::Message as u8,
                msg.message_id.as_str(),
                now_ms
            ],
        )? == 1;

        if !fresh {
            tx.commit()?;
            StoreOutcome::Duplicate
        } else {
            tx.execute(
                "INSERT INTO messages
                 (message_id, contact_id, ping_id, message_type, content, timestamp_ms, stored_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.message_id.as_str(),
                    msg.contact_id,
                    msg.ping_id.as_ref().map(|p| p.to_hex()),
                    msg.message_type as u8,
                    msg.content,
                    msg.timestamp_ms,
                    now_ms
                ],
            )?;

            if let Some(ping_id) = &msg.ping_id {
                tx.execute(
                    "UPDATE ping_inbox
                     SET state = ?1, wire_bytes = NULL, last_change_ms = ?2
                     WHERE ping_id = ?3 AND state != ?1",
                    rusqlite::params![
                        inbox::InboxState::MsgStored as i64,
                        now_ms,
                        ping_id.to_hex()
                    ],
                )?;
            }

            tx.commit()?;
            StoreOutcome::Stored
        }
    };

    if outcome == StoreOutcome::Stored {
        store
            .recent_lock()
            .put(
                (
                    received::IdNamespace::Message as u8,
                    msg.message_id.as_str().to_string(),
                ),
                (),
            );
    }

    Ok(outcome)
}

/// Fetch a stored message by id.
pub fn get_message(store: &Store, message_id: &str) -> Result<StoredMessage> {
    let conn = store.lock();
    conn.query_row(
        "SELECT message_id, contact_id, ping_id, message_type, content, timestamp_ms
         FROM messages WHERE message_id = ?1",
        [message_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound("message".into()),
        other => StorageError::Sqlite(other),
    })
    .and_then(|(id, contact_id, ping_hex, ty, content, ts)| {
        Ok(StoredMessage {
            message_id: MessageId::from_string(id)
                .map_err(|_| StorageError::Corrupt("message_id".into()))?,
            contact_id,
            ping_id: match ping_hex {
                Some(h) => Some(
                    PingId::from_hex(&h).map_err(|_| StorageError::Corrupt("ping_id".into()))?,
                ),
                None => None,
            },
            message_type: WireType::from_u8(ty as u8)
                .ok_or_else(|| StorageError::Corrupt("message_type".into()))?,
            content,
            timestamp_ms: ts,
        })
    })
}

/// Fetch the stored message matching a ping-id, if any.
pub fn get_message_by_ping(store: &Store, ping_id: &PingId) -> Result<Option<StoredMessage>> {
    let id: Option<String> = {
        let conn = store.lock();
        conn.query_row(
            "SELECT message_id FROM messages WHERE ping_id = ?1",
            [ping_id.to_hex()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Sqlite(other)),
        })?
    };
    match id {
        Some(id) => Ok(Some(get_message(store, &id)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_sets_version() {
        let store = Store::open_memory().unwrap();
        let version: u32 = store
            .lock()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_store_incoming_message_is_idempotent() {
        let store = Store::open_memory().unwrap();
        let msg = StoredMessage {
            message_id: MessageId::for_incoming(b"hi", "peer.onion"),
            contact_id: 1,
            ping_id: None,
            message_type: WireType::Text,
            content: b"hi".to_vec(),
            timestamp_ms: 1_000,
        };

        assert_eq!(
            store_incoming_message(&store, &msg, 2_000).unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(
            store_incoming_message(&store, &msg, 3_000).unwrap(),
            StoreOutcome::Duplicate
        );

        let stored = get_message(&store, msg.message_id.as_str()).unwrap();
        assert_eq!(stored.content, b"hi");
        assert_eq!(stored.timestamp_ms, 1_000);
    }

    #[test]
    fn test_store_transitions_inbox_and_clears_wire() {
        let store = Store::open_memory().unwrap();
        let ping_id = PingId::random();
        inbox::insert_seen(&store, &ping_id, 1, "d2lyZQ==", 500, 400).unwrap();
        inbox::claim_download(&store, &ping_id, 600).unwrap();
        inbox::mark_pong_sent(&store, &ping_id, 700).unwrap();

        let msg = StoredMessage {
            message_id: MessageId::for_incoming(b"payload", "peer.onion"),
            contact_id: 1,
            ping_id: Some(ping_id),
            message_type: WireType::Text,
            content: b"payload".to_vec(),
            timestamp_ms: 500,
        };
        store_incoming_message(&store, &msg, 800).unwrap();

        let row = inbox::get(&store, &ping_id).unwrap();
        assert_eq!(row.state, inbox::InboxState::MsgStored);
        assert!(row.wire_bytes.is_none());

        let found = get_message_by_ping(&store, &ping_id).unwrap().unwrap();
        assert_eq!(found.message_id, msg.message_id);
    }
}
