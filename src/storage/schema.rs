//! Initial database schema.
//!
//! All timestamps are Unix epoch milliseconds. Wire bytes at rest are
//! stored as unwrapped base64 strings. Schema version lives in
//! `PRAGMA user_version`.

/// Schema v1: outbox, ping_inbox, received_ids, messages, ping_sessions,
/// peer_sequences.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE outbox (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id         INTEGER NOT NULL,
    message_id         TEXT    NOT NULL UNIQUE,
    message_type       INTEGER NOT NULL,
    payload_plain      BLOB    NOT NULL,
    ping_id            TEXT    NOT NULL UNIQUE,
    ping_timestamp_ms  INTEGER NOT NULL,
    ping_wire          TEXT    NOT NULL,
    message_wire       TEXT,
    status             INTEGER NOT NULL DEFAULT 0,
    retry_count        INTEGER NOT NULL DEFAULT 0,
    last_retry_ms      INTEGER NOT NULL DEFAULT 0,
    ping_delivered     INTEGER NOT NULL DEFAULT 0,
    pong_received      INTEGER NOT NULL DEFAULT 0,
    message_delivered  INTEGER NOT NULL DEFAULT 0,
    self_destruct_ms   INTEGER,
    read_receipt       INTEGER NOT NULL DEFAULT 0,
    created_ms         INTEGER NOT NULL
);

CREATE INDEX idx_outbox_contact ON outbox(contact_id, status);
CREATE INDEX idx_outbox_status  ON outbox(status);

CREATE TABLE ping_inbox (
    ping_id            TEXT    PRIMARY KEY,
    contact_id         INTEGER NOT NULL,
    state              INTEGER NOT NULL DEFAULT 0,
    first_seen_ms      INTEGER NOT NULL,
    last_change_ms     INTEGER NOT NULL,
    wire_bytes         TEXT,
    auto_retry_count   INTEGER NOT NULL DEFAULT 0,
    ping_timestamp_ms  INTEGER NOT NULL
);

CREATE INDEX idx_inbox_contact ON ping_inbox(contact_id, state);
CREATE INDEX idx_inbox_state   ON ping_inbox(state);

CREATE TABLE received_ids (
    namespace    INTEGER NOT NULL,
    id           TEXT    NOT NULL,
    received_ms  INTEGER NOT NULL,
    PRIMARY KEY (namespace, id)
) WITHOUT ROWID;

CREATE TABLE messages (
    message_id    TEXT    PRIMARY KEY,
    contact_id    INTEGER NOT NULL,
    ping_id       TEXT,
    message_type  INTEGER NOT NULL,
    content       BLOB    NOT NULL,
    timestamp_ms  INTEGER NOT NULL,
    stored_ms     INTEGER NOT NULL
);

CREATE INDEX idx_messages_contact ON messages(contact_id, timestamp_ms);

CREATE TABLE ping_sessions (
    ping_id        TEXT    PRIMARY KEY,
    contact_id     INTEGER NOT NULL,
    sender_x25519  BLOB    NOT NULL,
    timestamp_ms   INTEGER NOT NULL,
    wire_bytes     TEXT    NOT NULL,
    received_ms    INTEGER NOT NULL
);

CREATE TABLE peer_sequences (
    peer_x25519  BLOB    PRIMARY KEY,
    send_seq     INTEGER NOT NULL DEFAULT 0,
    recv_high    INTEGER NOT NULL DEFAULT 0
);
"#;
