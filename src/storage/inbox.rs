//! Ping inbox: the durable record of what the receiver owes each peer.
//!
//! One row per accepted incoming Ping. Transitions are monotonic and
//! enforced in the UPDATE predicates, so a stale writer can never move a
//! row backwards:
//!
//! ```text
//! PING_SEEN -> DOWNLOAD_QUEUED -> PONG_SENT -> MSG_STORED (terminal)
//!                    \                 \
//!                     +-> FAILED_TEMP --+-> MANUAL_REQUIRED
//! ```
//!
//! Cached wire bytes are cleared exactly when the row reaches MSG_STORED
//! (done inside the atomic-store transaction in `storage::mod`).

use rusqlite::Row;

use super::{Result, StorageError, Store};
use crate::protocol::wire::PingId;
use crate::protocol::ContactId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum InboxState {
    /// Ping accepted and stored; waiting for the app or user to react.
    PingSeen = 0,
    /// Pong emitted; payload awaited (bounded by the download watchdog).
    PongSent = 1,
    /// Payload received and persisted. Terminal.
    MsgStored = 2,
    /// Auto-download claimed this Ping; Pong not yet emitted.
    DownloadQueued = 10,
    /// A download attempt failed below the retry budget; will retry.
    FailedTemp = 11,
    /// Retry budget exhausted or Ping expired; user action required.
    ManualRequired = 12,
}

impl InboxState {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::PingSeen),
            1 => Some(Self::PongSent),
            2 => Some(Self::MsgStored),
            10 => Some(Self::DownloadQueued),
            11 => Some(Self::FailedTemp),
            12 => Some(Self::ManualRequired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InboxRow {
    pub ping_id: PingId,
    pub contact_id: ContactId,
    pub state: InboxState,
    pub first_seen_ms: i64,
    pub last_change_ms: i64,
    /// Base64 of the original encrypted Ping; required to rebuild session
    /// material for the download phase. None once MSG_STORED.
    pub wire_bytes: Option<String>,
    pub auto_retry_count: u32,
    pub ping_timestamp_ms: i64,
}

fn row_to_inbox(row: &Row<'_>) -> rusqlite::Result<(String, i64, i64, i64, i64, Option<String>, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode(
    (ping_id, contact_id, state, first_seen, last_change, wire, retries, ping_ts): (
        String,
        i64,
        i64,
        i64,
        i64,
        Option<String>,
        i64,
        i64,
    ),
) -> Result<InboxRow> {
    Ok(InboxRow {
        ping_id: PingId::from_hex(&ping_id)
            .map_err(|_| StorageError::Corrupt("ping_inbox.ping_id".into()))?,
        contact_id,
        state: InboxState::from_i64(state)
            .ok_or_else(|| StorageError::Corrupt("ping_inbox.state".into()))?,
        first_seen_ms: first_seen,
        last_change_ms: last_change,
        wire_bytes: wire,
        auto_retry_count: retries as u32,
        ping_timestamp_ms: ping_ts,
    })
}

const COLUMNS: &str = "ping_id, contact_id, state, first_seen_ms, last_change_ms, wire_bytes, \
     auto_retry_count, ping_timestamp_ms";

/// Accept a Ping into the inbox in PING_SEEN. Idempotent: a duplicate
/// ping-id leaves the existing row untouched and returns false.
pub fn insert_seen(
    store: &Store,
    ping_id: &PingId,
    contact_id: ContactId,
    wire_b64: &str,
    ping_timestamp_ms: i64,
    now_ms: i64,
) -> Result<bool> {
    let conn = store.lock();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO ping_inbox
         (ping_id, contact_id, state, first_seen_ms, last_change_ms, wire_bytes,
          auto_retry_count, ping_timestamp_ms)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, 0, ?6)",
        rusqlite::params![
            ping_id.to_hex(),
            contact_id,
            InboxState::PingSeen as i64,
            now_ms,
            wire_b64,
            ping_timestamp_ms
        ],
    )?;
    Ok(inserted == 1)
}

pub fn get(store: &Store, ping_id: &PingId) -> Result<InboxRow> {
    let raw = {
        let conn = store.lock();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM ping_inbox WHERE ping_id = ?1"),
            [ping_id.to_hex()],
            row_to_inbox,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound("ping_inbox".into()),
            other => StorageError::Sqlite(other),
        })?
    };
    decode(raw)
}

/// Claim a Ping for download: PING_SEEN or FAILED_TEMP -> DOWNLOAD_QUEUED.
/// Returns false if the row is in any other state (already claimed,
/// stored, or needs manual action).
pub fn claim_download(store: &Store, ping_id: &PingId, now_ms: i64) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE ping_inbox SET state = ?1, last_change_ms = ?2
         WHERE ping_id = ?3 AND state IN (?4, ?5)",
        rusqlite::params![
            InboxState::DownloadQueued as i64,
            now_ms,
            ping_id.to_hex(),
            InboxState::PingSeen as i64,
            InboxState::FailedTemp as i64
        ],
    )?;
    Ok(changed == 1)
}

/// DOWNLOAD_QUEUED -> PONG_SENT.
pub fn mark_pong_sent(store: &Store, ping_id: &PingId, now_ms: i64) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE ping_inbox SET state = ?1, last_change_ms = ?2
         WHERE ping_id = ?3 AND state = ?4",
        rusqlite::params![
            InboxState::PongSent as i64,
            now_ms,
            ping_id.to_hex(),
            InboxState::DownloadQueued as i64
        ],
    )?;
    Ok(changed == 1)
}

/// Record a failed download attempt. Idempotent per attempt: only rows in
/// DOWNLOAD_QUEUED or PONG_SENT move, with the retry count bumped in the
/// same statement; a second call for the same failure is a no-op.
///
/// Returns the row's state afterwards.
pub fn fail_auto_download(
    store: &Store,
    ping_id: &PingId,
    max_auto_retries: u32,
    now_ms: i64,
) -> Result<InboxState> {
    {
        let conn = store.lock();
        conn.execute(
            "UPDATE ping_inbox SET
                 auto_retry_count = auto_retry_count + 1,
                 state = CASE WHEN auto_retry_count + 1 >= ?1 THEN ?2 ELSE ?3 END,
                 last_change_ms = ?4
             WHERE ping_id = ?5 AND state IN (?6, ?7)",
            rusqlite::params![
                max_auto_retries,
                InboxState::ManualRequired as i64,
                InboxState::FailedTemp as i64,
                now_ms,
                ping_id.to_hex(),
                InboxState::DownloadQueued as i64,
                InboxState::PongSent as i64
            ],
        )?;
    }
    Ok(get(store, ping_id)?.state)
}

/// Force MANUAL_REQUIRED (expiry path). No-op on terminal rows.
pub fn mark_manual_required(store: &Store, ping_id: &PingId, now_ms: i64) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "UPDATE ping_inbox SET state = ?1, last_change_ms = ?2
         WHERE ping_id = ?3 AND state NOT IN (?4, ?1)",
        rusqlite::params![
            InboxState::ManualRequired as i64,
            now_ms,
            ping_id.to_hex(),
            InboxState::MsgStored as i64
        ],
    )?;
    Ok(changed == 1)
}

/// The contact's Ping currently in the download phase, if any. Used to
/// correlate an arriving message blob back to its inbox row.
pub fn active_download_for_contact(
    store: &Store,
    contact_id: ContactId,
) -> Result<Option<InboxRow>> {
    let raw = {
        let conn = store.lock();
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM ping_inbox
                 WHERE contact_id = ?1 AND state IN (?2, ?3)
                 ORDER BY last_change_ms DESC LIMIT 1"
            ),
            rusqlite::params![
                contact_id,
                InboxState::PongSent as i64,
                InboxState::DownloadQueued as i64
            ],
            row_to_inbox,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::Sqlite(other)),
        })?
    };
    raw.map(decode).transpose()
}

/// Rows in FAILED_TEMP awaiting an auto-retry.
pub fn failed_temp(store: &Store) -> Result<Vec<InboxRow>> {
    rows_in_state(store, InboxState::FailedTemp)
}

/// Rows stuck in PONG_SENT since before `cutoff_ms` — their download
/// task is gone (crash or abort) and the watchdog of last resort must
/// fail them over.
pub fn failed_candidates_stuck_in_pong(store: &Store, cutoff_ms: i64) -> Result<Vec<InboxRow>> {
    let raws = {
        let conn = store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM ping_inbox
             WHERE state = ?1 AND last_change_ms < ?2"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![InboxState::PongSent as i64, cutoff_ms],
                row_to_inbox,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    raws.into_iter().map(decode).collect()
}

fn rows_in_state(store: &Store, state: InboxState) -> Result<Vec<InboxRow>> {
    let raws = {
        let conn = store.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM ping_inbox WHERE state = ?1 ORDER BY first_seen_ms"
        ))?;
        let rows = stmt
            .query_map([state as i64], row_to_inbox)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    raws.into_iter().map(decode).collect()
}

/// Expire non-terminal rows whose Ping is older than the window: they
/// move to MANUAL_REQUIRED and are surfaced as "message expired".
/// Returns the affected ping-ids.
pub fn expire_older_than(store: &Store, cutoff_ms: i64, now_ms: i64) -> Result<Vec<(PingId, ContactId)>> {
    let rows: Vec<(String, i64)> = {
        let conn = store.lock();
        let mut stmt = conn.prepare(
            "SELECT ping_id, contact_id FROM ping_inbox
             WHERE ping_timestamp_ms < ?1 AND state NOT IN (?2, ?3)",
        )?;
        let found = stmt
            .query_map(
                rusqlite::params![
                    cutoff_ms,
                    InboxState::MsgStored as i64,
                    InboxState::ManualRequired as i64
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        conn.execute(
            "UPDATE ping_inbox SET state = ?1, last_change_ms = ?2
             WHERE ping_timestamp_ms < ?3 AND state NOT IN (?4, ?1)",
            rusqlite::params![
                InboxState::ManualRequired as i64,
                now_ms,
                cutoff_ms,
                InboxState::MsgStored as i64
            ],
        )?;
        found
    };

    rows.into_iter()
        .map(|(hex, contact)| {
            Ok((
                PingId::from_hex(&hex)
                    .map_err(|_| StorageError::Corrupt("ping_inbox.ping_id".into()))?,
                contact,
            ))
        })
        .collect()
}

/// Delete rows older than the dedup window. Terminal rows only; the
/// received-ids table still guards against re-acceptance inside its own
/// retention.
pub fn purge_older_than(store: &Store, cutoff_ms: i64) -> Result<usize> {
    let conn = store.lock();
    let removed = conn.execute(
        "DELETE FROM ping_inbox
         WHERE first_seen_ms < ?1 AND state IN (?2, ?3)",
        rusqlite::params![
            cutoff_ms,
            InboxState::MsgStored as i64,
            InboxState::ManualRequired as i64
        ],
    )?;
    Ok(removed)
}
