//! Received-ids deduplication table.
//!
//! Append-only (id, namespace) pairs with a retention window. The
//! unique-index insert is the guard: a conflict means "already seen" and
//! the engine short-circuits downstream work while still emitting the
//! appropriate ACK. Never replace the insert with a pre-read.

use super::{Result, Store};

/// Logical id namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IdNamespace {
    Ping = 0,
    Pong = 1,
    Message = 2,
}

/// Record an id as seen. Returns `true` if the id is new, `false` if it
/// was already present (the idempotent no-op case).
pub fn insert(store: &Store, namespace: IdNamespace, id: &str, now_ms: i64) -> Result<bool> {
    // Hot path: a cache hit is definitely a duplicate.
    {
        let mut recent = store.recent_lock();
        if recent.contains(&(namespace as u8, id.to_string())) {
            return Ok(false);
        }
    }

    let fresh = {
        let conn = store.lock();
        conn.execute(
            "INSERT OR IGNORE INTO received_ids (namespace, id, received_ms)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![namespace as u8, id, now_ms],
        )? == 1
    };

    store
        .recent_lock()
        .put((namespace as u8, id.to_string()), ());

    Ok(fresh)
}

/// Whether an id has been seen, without recording it.
pub fn contains(store: &Store, namespace: IdNamespace, id: &str) -> Result<bool> {
    {
        let mut recent = store.recent_lock();
        if recent.contains(&(namespace as u8, id.to_string())) {
            return Ok(true);
        }
    }

    let conn = store.lock();
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM received_ids WHERE namespace = ?1 AND id = ?2)",
        rusqlite::params![namespace as u8, id],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Purge entries older than the namespace's retention window. Returns the
/// number of rows removed.
pub fn purge(store: &Store, namespace: IdNamespace, cutoff_ms: i64) -> Result<usize> {
    let removed = {
        let conn = store.lock();
        conn.execute(
            "DELETE FROM received_ids WHERE namespace = ?1 AND received_ms < ?2",
            rusqlite::params![namespace as u8, cutoff_ms],
        )?
    };

    if removed > 0 {
        // Drop the hot cache wholesale so purged ids become acceptable
        // again; it refills from live traffic.
        store.recent_lock().clear();
    }

    Ok(removed)
}
