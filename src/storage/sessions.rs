//! Durable mirror of the in-memory ping-session store, so session
//! material survives a process restart.

use super::{Result, StorageError, Store};
use crate::protocol::wire::PingId;
use crate::protocol::ContactId;

#[derive(Clone, Debug)]
pub struct SessionRow {
    pub ping_id: PingId,
    pub contact_id: ContactId,
    pub sender_x25519: [u8; 32],
    pub timestamp_ms: i64,
    pub wire_b64: String,
    pub received_ms: i64,
}

pub fn save(store: &Store, row: &SessionRow) -> Result<()> {
    let conn = store.lock();
    conn.execute(
        "INSERT OR REPLACE INTO ping_sessions
         (ping_id, contact_id, sender_x25519, timestamp_ms, wire_bytes, received_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            row.ping_id.to_hex(),
            row.contact_id,
            row.sender_x25519.as_slice(),
            row.timestamp_ms,
            row.wire_b64,
            row.received_ms
        ],
    )?;
    Ok(())
}

pub fn delete(store: &Store, ping_id: &PingId) -> Result<()> {
    let conn = store.lock();
    conn.execute(
        "DELETE FROM ping_sessions WHERE ping_id = ?1",
        [ping_id.to_hex()],
    )?;
    Ok(())
}

pub fn load_all(store: &Store) -> Result<Vec<SessionRow>> {
    let raws: Vec<(String, i64, Vec<u8>, i64, String, i64)> = {
        let conn = store.lock();
        let mut stmt = conn.prepare(
            "SELECT ping_id, contact_id, sender_x25519, timestamp_ms, wire_bytes, received_ms
             FROM ping_sessions",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    raws.into_iter()
        .map(|(ping_hex, contact_id, key, ts, wire, received)| {
            let sender_x25519: [u8; 32] = key
                .try_into()
                .map_err(|_| StorageError::Corrupt("ping_sessions.sender_x25519".into()))?;
            Ok(SessionRow {
                ping_id: PingId::from_hex(&ping_hex)
                    .map_err(|_| StorageError::Corrupt("ping_sessions.ping_id".into()))?,
                contact_id,
                sender_x25519,
                timestamp_ms: ts,
                wire_b64: wire,
                received_ms: received,
            })
        })
        .collect()
}

pub fn purge_older_than(store: &Store, cutoff_ms: i64) -> Result<usize> {
    let conn = store.lock();
    let removed = conn.execute(
        "DELETE FROM ping_sessions WHERE received_ms < ?1",
        [cutoff_ms],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_delete() {
        let store = Store::open_memory().unwrap();
        let row = SessionRow {
            ping_id: PingId::random(),
            contact_id: 3,
            sender_x25519: [7u8; 32],
            timestamp_ms: 123,
            wire_b64: "cGluZw==".into(),
            received_ms: 456,
        };
        save(&store, &row).unwrap();

        let loaded = load_all(&store).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].ping_id, row.ping_id);
        assert_eq!(loaded[0].sender_x25519, [7u8; 32]);

        delete(&store, &row.ping_id).unwrap();
        assert!(load_all(&store).unwrap().is_empty());
    }

    #[test]
    fn test_purge() {
        let store = Store::open_memory().unwrap();
        for (i, received) in [(1i64, 100i64), (2, 900)] {
            save(
                &store,
                &SessionRow {
                    ping_id: PingId::random(),
                    contact_id: i,
                    sender_x25519: [0u8; 32],
                    timestamp_ms: 0,
                    wire_b64: String::new(),
                    received_ms: received,
                },
            )
            .unwrap();
        }
        assert_eq!(purge_older_than(&store, 500).unwrap(), 1);
        assert_eq!(load_all(&store).unwrap().len(), 1);
    }
}
