//! Per-peer encryption sequence counters.
//!
//! The send counter is allocated here and persisted before a frame is
//! sealed, so it is strictly monotonic across restarts. The receive side
//! tracks the highest sequence seen per peer. Frames may legitimately
//! arrive out of order (different dials race over the overlay), so the
//! default policy is windowed: [`observe_recv`] admits a frame that
//! trails the high-water mark by less than [`RECV_WINDOW`] and rejects
//! anything older. True replays carry an already-seen id and are
//! stopped by the received-ids guard before the sequence is consulted.
//! [`accept_recv`] keeps the strict strictly-increasing rule for frames
//! where reordering carries no value (presence beacons).

use super::{Result, Store};

/// How far below the high-water mark a frame may trail and still be
/// admitted as plausible reordering.
pub const RECV_WINDOW: u64 = 100;

/// Allocate the next send sequence for frames to `peer_x25519`.
pub fn next_send(store: &Store, peer_x25519: &[u8; 32]) -> Result<u64> {
    let conn = store.lock();
    conn.execute(
        "INSERT INTO peer_sequences (peer_x25519, send_seq, recv_high)
         VALUES (?1, 1, 0)
         ON CONFLICT(peer_x25519) DO UPDATE SET send_seq = send_seq + 1",
        [peer_x25519.as_slice()],
    )?;
    let seq: i64 = conn.query_row(
        "SELECT send_seq FROM peer_sequences WHERE peer_x25519 = ?1",
        [peer_x25519.as_slice()],
        |row| row.get(0),
    )?;
    Ok(seq as u64)
}

/// Record `seq` from `peer_x25519`, tolerating out-of-order arrival
/// within [`RECV_WINDOW`]. Advances the high-water mark when `seq`
/// exceeds it. Returns false for frames trailing the mark by a full
/// window or more; the caller drops those without further bookkeeping.
pub fn observe_recv(store: &Store, peer_x25519: &[u8; 32], seq: u64) -> Result<bool> {
    let conn = store.lock();
    let high: i64 = conn
        .query_row(
            "SELECT recv_high FROM peer_sequences WHERE peer_x25519 = ?1",
            [peer_x25519.as_slice()],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0),
            other => Err(other),
        })?;

    if seq.saturating_add(RECV_WINDOW) <= high as u64 {
        return Ok(false);
    }

    if seq > high as u64 {
        conn.execute(
            "INSERT INTO peer_sequences (peer_x25519, send_seq, recv_high)
             VALUES (?1, 0, ?2)
             ON CONFLICT(peer_x25519) DO UPDATE SET recv_high = excluded.recv_high",
            rusqlite::params![peer_x25519.as_slice(), seq as i64],
        )?;
    }

    Ok(true)
}

/// Accept `seq` from `peer_x25519` only if it is strictly greater than
/// the highest sequence accepted so far. Returns whether it was accepted
/// (and recorded as the new high-water mark).
pub fn accept_recv(store: &Store, peer_x25519: &[u8; 32], seq: u64) -> Result<bool> {
    let conn = store.lock();
    let changed = conn.execute(
        "INSERT INTO peer_sequences (peer_x25519, send_seq, recv_high)
         VALUES (?1, 0, ?2)
         ON CONFLICT(peer_x25519) DO UPDATE SET recv_high = excluded.recv_high
         WHERE recv_high < excluded.recv_high",
        rusqlite::params![peer_x25519.as_slice(), seq as i64],
    )?;
    Ok(changed == 1)
}

/// Highest sequence accepted from a peer (0 if none).
pub fn recv_high(store: &Store, peer_x25519: &[u8; 32]) -> Result<u64> {
    let conn = store.lock();
    let high: Option<i64> = conn
        .query_row(
            "SELECT recv_high FROM peer_sequences WHERE peer_x25519 = ?1",
            [peer_x25519.as_slice()],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(high.unwrap_or(0) as u64)
}
