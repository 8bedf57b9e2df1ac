//! Outbox: one durable row per outgoing logical message.
//!
//! `ping_id` and `ping_timestamp_ms` are assigned at creation and never
//! mutated; retries reuse the cached wire bytes. The two delivery flags
//! are distinct signals: `ping_delivered` (set by PING_ACK) only stops
//! further re-Pings, while `pong_received` (set by an authenticated
//! Pong) is what releases the payload send. Once `message_delivered` is
//! set the row is terminally DELIVERED and the retry worker does no
//! further work for it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::Row;

use super::{Result, StorageError, Store};
use crate::protocol::wire::{MessageId, PingId};
use crate::protocol::{ContactId, WireType};

/// Outgoing message lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum OutboxStatus {
    /// Created; Ping emitted or about to be, retries in progress.
    PingSent = 0,
    /// Message-ACK observed. Terminal.
    Delivered = 1,
    /// Retry budget exhausted. Terminal.
    Failed = 2,
    /// The peer declined with an unauthenticated Pong. Terminal.
    Refused = 3,
    /// Cancelled by the sender before ping delivery. Terminal.
    Cancelled = 4,
}

impl OutboxStatus {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::PingSent),
            1 => Some(Self::Delivered),
            2 => Some(Self::Failed),
            3 => Some(Self::Refused),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PingSent)
    }
}

/// Everything needed to create an outbox row.
pub struct NewOutboxMessage {
    pub contact_id: ContactId,
    pub message_id: MessageId,
    pub message_type: WireType,
    pub payload_plain: Vec<u8>,
    pub ping_id: PingId,
    pub ping_timestamp_ms: i64,
    pub ping_wire: Vec<u8>,
    pub self_destruct_ms: Option<i64>,
    pub read_receipt: bool,
}

#[derive(Clone, Debug)]
pub struct OutboxRow {
    pub id: i64,
    pub contact_id: ContactId,
    pub message_id: MessageId,
    pub message_type: WireType,
    pub payload_plain: Vec<u8>,
    pub ping_id: PingId,
    pub ping_timestamp_ms: i64,
    pub ping_wire: Vec<u8>,
    pub message_wire: Option<Vec<u8>>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_retry_ms: i64,
    /// The peer has seen the Ping (PING_ACK). Suppresses re-Pings only.
    pub ping_delivered: bool,
    /// The peer consented with an authenticated Pong. Releases the
    /// payload send.
    pub pong_received: bool,
    pub message_delivered: bool,
    pub self_destruct_ms: Option<i64>,
    pub read_receipt: bool,
    pub created_ms: i64,
}

const COLUMNS: &str = "id, contact_id, message_id, message_type, payload_plain, ping_id, \
     ping_timestamp_ms, ping_wire, message_wire, status, retry_count, last_retry_ms, \
     ping_delivered, pong_received, message_delivered, self_destruct_ms, read_receipt, \
     created_ms";

fn row_to_outbox(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        message_id: row.get(2)?,
        message_type: row.get(3)?,
        payload_plain: row.get(4)?,
        ping_id: row.get(5)?,
        ping_timestamp_ms: row.get(6)?,
        ping_wire: row.get(7)?,
        message_wire: row.get(8)?,
        status: row.get(9)?,
        retry_count: row.get(10)?,
        last_retry_ms: row.get(11)?,
        ping_delivered: row.get(12)?,
        pong_received: row.get(13)?,
        message_delivered: row.get(14)?,
        self_destruct_ms: row.get(15)?,
        read_receipt: row.get(16)?,
        created_ms: row.get(17)?,
    })
}

struct RawRow {
    id: i64,
    contact_id: i64,
    message_id: String,
    message_type: i64,
    payload_plain: Vec<u8>,
    ping_id: String,
    ping_timestamp_ms: i64,
    ping_wire: String,
    message_wire: Option<String>,
    status: i64,
    retry_count: i64,
    last_retry_ms: i64,
    ping_delivered: bool,
    pong_received: bool,
    message_delivered: bool,
    self_destruct_ms: Option<i64>,
    read_receipt: bool,
    created_ms: i64,
}

impl RawRow {
    fn decode(self) -> Result<OutboxRow> {
        Ok(OutboxRow {
            id: self.id,
            contact_id: self.contact_id,
            message_id: MessageId::from_string(self.message_id)
                .map_err(|_| StorageError::Corrupt("outbox.message_id".into()))?,
            message_type: WireType::from_u8(self.message_type as u8)
                .ok_or_else(|| StorageError::Corrupt("outbox.message_type".into()))?,
            payload_plain: self.payload_plain,
            ping_id: PingId::from_hex(&self.ping_id)
                .map_err(|_| StorageError::Corrupt("outbox.ping_id".into()))?,
            ping_timestamp_ms: self.ping_timestamp_ms,
            ping_wire: BASE64
                .decode(&self.ping_wire)
                .map_err(|_| StorageError::Corrupt("outbox.ping_wire".into()))?,
            message_wire: match self.message_wire {
                Some(b64) => Some(
                    BASE64
                        .decode(&b64)
                        .map_err(|_| StorageError::Corrupt("outbox.message_wire".into()))?,
                ),
                None => None,
            },
            status: OutboxStatus::from_i64(self.status)
                .ok_or_else(|| StorageError::Corrupt("outbox.status".into()))?,
            retry_count: self.retry_count as u32,
            last_retry_ms: self.last_retry_ms,
            ping_delivered: self.ping_delivered,
            pong_received: self.pong_received,
            message_delivered: self.message_delivered,
            self_destruct_ms: self.self_destruct_ms,
            read_receipt: self.read_receipt,
            created_ms: self.created_ms,
        })
    }
}

/// Insert a new outgoing message. Returns the local row id.
pub fn insert(store: &Store, msg: &NewOutboxMessage, now_ms: i64) -> Result<i64> {
    let conn = store.lock();
    conn.execute(
        "INSERT INTO outbox
         (contact_id, message_id, message_type, payload_plain, ping_id, ping_timestamp_ms,
          ping_wire, status, self_destruct_ms, read_receipt, created_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            msg.contact_id,
            msg.message_id.as_str(),
            msg.message_type as u8,
            msg.payload_plain,
            msg.ping_id.to_hex(),
            msg.ping_timestamp_ms,
            BASE64.encode(&msg.ping_wire),
            OutboxStatus::PingSent as i64,
            msg.self_destruct_ms,
            msg.read_receipt,
            now_ms
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_by_ping(store: &Store, ping_id: &PingId) -> Result<Option<OutboxRow>> {
    let raw = {
        let conn = store.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM outbox WHERE ping_id = ?1"),
            [ping_id.to_hex()],
            row_to_outbox,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Sqlite(other)),
        })?
    };
    raw.map(RawRow::decode).transpose()
}

pub fn get_by_message_id(store: &Store, message_id: &str) -> Result<Option<OutboxRow>> {
    let raw = {
        let conn = store.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM outbox WHERE message_id = ?1"),
            [message_id],
            row_to_outbox,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Sqlite(other)),
        })?
    };
    raw.map(RawRow::decode).transpose()
}

/// Cache the built message wire bytes (first send after Pong).
pub fn set_message_wire(store: &Store, ping_id: &PingId, wire: &[u8]) -> Result<()> {
    let conn = store.lock();
    conn.execute(
        "UPDATE outbox SET message_wire = ?1 WHERE ping_id = ?2",
        rusqlite::params![BASE64.encode(wire), ping_id.to_hex()],
    )?;
    Ok(())
}

/// Record that the peer has seen the Ping (PING_ACK). Stops re-Pings;
/// the payload stays held until a Pong arrives. Returns whether the
/// flag changed (false = it was already set, or no such row).
pub fn mark_ping_delivered(store: &Store, ping_id: &PingId) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET ping_delivered = 1
         WHERE ping_id = ?1 AND ping_delivered = 0",
        [ping_id.to_hex()],
    )?;
    Ok(changed == 1)
}

/// Record the peer's authenticated Pong: the Ping is implicitly
/// delivered and the payload send is released. Returns whether the flag
/// changed.
pub fn mark_pong_received(store: &Store, ping_id: &PingId) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET ping_delivered = 1, pong_received = 1
         WHERE ping_id = ?1 AND pong_received = 0",
        [ping_id.to_hex()],
    )?;
    Ok(changed == 1)
}

/// Terminal: MESSAGE_ACK observed for this message-id.
pub fn mark_delivered(store: &Store, message_id: &str) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET message_delivered = 1, status = ?1
         WHERE message_id = ?2 AND message_delivered = 0",
        rusqlite::params![OutboxStatus::Delivered as i64, message_id],
    )?;
    Ok(changed == 1)
}

/// Terminal: the peer declined with an unauthenticated Pong.
pub fn mark_refused(store: &Store, ping_id: &PingId) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET status = ?1 WHERE ping_id = ?2 AND status = ?3",
        rusqlite::params![
            OutboxStatus::Refused as i64,
            ping_id.to_hex(),
            OutboxStatus::PingSent as i64
        ],
    )?;
    Ok(changed == 1)
}

/// Terminal: retry budget exhausted.
pub fn mark_failed(store: &Store, ping_id: &PingId) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET status = ?1 WHERE ping_id = ?2 AND status = ?3",
        rusqlite::params![
            OutboxStatus::Failed as i64,
            ping_id.to_hex(),
            OutboxStatus::PingSent as i64
        ],
    )?;
    Ok(changed == 1)
}

/// Count a send attempt.
pub fn bump_retry(store: &Store, ping_id: &PingId, now_ms: i64) -> Result<()> {
    let conn = store.lock();
    conn.execute(
        "UPDATE outbox SET retry_count = retry_count + 1, last_retry_ms = ?1
         WHERE ping_id = ?2",
        rusqlite::params![now_ms, ping_id.to_hex()],
    )?;
    Ok(())
}

/// Cancel an outgoing message. Only possible before the Ping has been
/// delivered; afterwards the receiver may already hold it.
pub fn cancel(store: &Store, message_id: &str) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE outbox SET status = ?1
         WHERE message_id = ?2 AND status = ?3 AND ping_delivered = 0",
        rusqlite::params![
            OutboxStatus::Cancelled as i64,
            message_id,
            OutboxStatus::PingSent as i64
        ],
    )?;
    Ok(changed == 1)
}

/// Rows to a contact whose Ping has not been delivered (Tap handler
/// re-Ping targets).
pub fn undelivered_to_contact(store: &Store, contact_id: ContactId) -> Result<Vec<OutboxRow>> {
    let raws = {
        let conn = store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM outbox
             WHERE contact_id = ?1 AND status = ?2 AND ping_delivered = 0"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![contact_id, OutboxStatus::PingSent as i64],
                row_to_outbox,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    raws.into_iter().map(RawRow::decode).collect()
}

/// All non-terminal rows (worker resume after restart).
pub fn active(store: &Store) -> Result<Vec<OutboxRow>> {
    let raws = {
        let conn = store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM outbox WHERE status = ?1 ORDER BY created_ms"
        ))?;
        let rows = stmt
            .query_map([OutboxStatus::PingSent as i64], row_to_outbox)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    raws.into_iter().map(RawRow::decode).collect()
}

/// Remove rows whose self-destruct deadline has passed.
pub fn reap_self_destructed(store: &Store, now_ms: i64) -> Result<usize> {
    let conn = store.lock();
    let removed = conn.execute(
        "DELETE FROM outbox WHERE self_destruct_ms IS NOT NULL AND self_destruct_ms < ?1",
        [now_ms],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_msg(contact_id: ContactId) -> NewOutboxMessage {
        NewOutboxMessage {
            contact_id,
            message_id: MessageId::random(),
            message_type: WireType::Text,
            payload_plain: b"hello".to_vec(),
            ping_id: PingId::random(),
            ping_timestamp_ms: 1_000,
            ping_wire: vec![1, 2, 3, 4],
            self_destruct_ms: None,
            read_receipt: false,
        }
    }

    #[test]
    fn test_insert_and_round_trip() {
        let store = Store::open_memory().unwrap();
        let msg = new_msg(7);
        insert(&store, &msg, 999).unwrap();

        let row = get_by_ping(&store, &msg.ping_id).unwrap().unwrap();
        assert_eq!(row.contact_id, 7);
        assert_eq!(row.message_id, msg.message_id);
        assert_eq!(row.ping_wire, vec![1, 2, 3, 4]);
        assert_eq!(row.ping_timestamp_ms, 1_000);
        assert_eq!(row.status, OutboxStatus::PingSent);
        assert!(!row.ping_delivered);
        assert!(row.message_wire.is_none());
    }

    #[test]
    fn test_delivery_flow() {
        let store = Store::open_memory().unwrap();
        let msg = new_msg(1);
        insert(&store, &msg, 0).unwrap();

        assert!(mark_ping_delivered(&store, &msg.ping_id).unwrap());
        // Second ACK for the same ping is a no-op.
        assert!(!mark_ping_delivered(&store, &msg.ping_id).unwrap());

        // A PING_ACK alone does not release the payload.
        let row = get_by_ping(&store, &msg.ping_id).unwrap().unwrap();
        assert!(row.ping_delivered);
        assert!(!row.pong_received);

        assert!(mark_pong_received(&store, &msg.ping_id).unwrap());
        assert!(!mark_pong_received(&store, &msg.ping_id).unwrap());

        set_message_wire(&store, &msg.ping_id, &[9, 9]).unwrap();
        assert!(mark_delivered(&store, msg.message_id.as_str()).unwrap());

        let row = get_by_message_id(&store, msg.message_id.as_str())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, OutboxStatus::Delivered);
        assert!(row.pong_received);
        assert!(row.message_delivered);
        assert_eq!(row.message_wire.as_deref(), Some(&[9u8, 9][..]));
    }

    #[test]
    fn test_pong_implies_ping_delivered() {
        let store = Store::open_memory().unwrap();
        let msg = new_msg(1);
        insert(&store, &msg, 0).unwrap();

        // Instant-path Pong with no prior PING_ACK sets both flags.
        assert!(mark_pong_received(&store, &msg.ping_id).unwrap());
        let row = get_by_ping(&store, &msg.ping_id).unwrap().unwrap();
        assert!(row.ping_delivered);
        assert!(row.pong_received);
    }

    #[test]
    fn test_cancel_only_before_ping_delivered() {
        let store = Store::open_memory().unwrap();
        let msg = new_msg(1);
        insert(&store, &msg, 0).unwrap();

        mark_ping_delivered(&store, &msg.ping_id).unwrap();
        assert!(!cancel(&store, msg.message_id.as_str()).unwrap());

        let msg2 = new_msg(1);
        insert(&store, &msg2, 0).unwrap();
        assert!(cancel(&store, msg2.message_id.as_str()).unwrap());
        let row = get_by_ping(&store, &msg2.ping_id).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Cancelled);
    }

    #[test]
    fn test_undelivered_to_contact_excludes_delivered() {
        let store = Store::open_memory().unwrap();
        let a = new_msg(5);
        let b = new_msg(5);
        let other = new_msg(6);
        insert(&store, &a, 0).unwrap();
        insert(&store, &b, 0).unwrap();
        insert(&store, &other, 0).unwrap();
        mark_ping_delivered(&store, &a.ping_id).unwrap();

        let rows = undelivered_to_contact(&store, 5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ping_id, b.ping_id);
    }

    #[test]
    fn test_self_destruct_reaper() {
        let store = Store::open_memory().unwrap();
        let mut msg = new_msg(1);
        msg.self_destruct_ms = Some(100);
        insert(&store, &msg, 0).unwrap();

        assert_eq!(reap_self_destructed(&store, 50).unwrap(), 0);
        assert_eq!(reap_self_destructed(&store, 200).unwrap(), 1);
        assert!(get_by_ping(&store, &msg.ping_id).unwrap().is_none());
    }
}
