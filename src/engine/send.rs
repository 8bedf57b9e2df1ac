//! Send engine: Ping -> (wait Pong) -> Message -> Message-ACK.
//!
//! Each outgoing message gets a durable outbox row and a retry worker.
//! The worker re-Pings with the exact cached wire bytes until the Ping
//! is acknowledged, sends the payload once a Pong arrives (instant path
//! on the dial connection when possible, deferred via the Pong listener
//! otherwise), and stops the moment MESSAGE_ACK lands.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::Config;
use crate::crypto::Identity;
use crate::engine::{now_ms, EngineError};
use crate::network::transport::Connection;
use crate::network::Transport;
use crate::protocol::envelope::{build_message, build_ping, open_pong, OpenedPong};
use crate::protocol::wire::{MessageId, PingId};
use crate::protocol::{
    ContactDirectory, ContactId, ContactRecord, MessagePayload, WireType,
};
use crate::storage::outbox::{self, OutboxRow};
use crate::storage::received::IdNamespace;
use crate::storage::{received, sequences, Store};
use crate::supervisor::StatusFlags;

/// Per-message knobs the application can set at send time.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Epoch-ms deadline after which the row self-destructs.
    pub self_destruct_ms: Option<i64>,
    pub read_receipt: bool,
}

pub struct SendEngine {
    identity: Arc<Identity>,
    store: Arc<Store>,
    transport: Arc<Transport>,
    contacts: Arc<dyn ContactDirectory>,
    config: Arc<Config>,
    status: Arc<StatusFlags>,
    /// Wakes a row's retry worker when a Pong or ACK lands for it.
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl SendEngine {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<Store>,
        transport: Arc<Transport>,
        contacts: Arc<dyn ContactDirectory>,
        config: Arc<Config>,
        status: Arc<StatusFlags>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            store,
            transport,
            contacts,
            config,
            status,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Queue a message for a contact and start delivering it.
    ///
    /// The ping-id and ping-timestamp are assigned here, once; every
    /// retry reuses the wire bytes built now.
    pub async fn send_message(
        self: &Arc<Self>,
        contact_id: ContactId,
        payload: MessagePayload,
        options: SendOptions,
    ) -> Result<MessageId, EngineError> {
        let contact = self
            .contacts
            .get(contact_id)
            .ok_or(EngineError::UnknownContact(contact_id))?;

        let payload_plain = payload.encode()?;
        let message_id = MessageId::random();
        let ping_id = PingId::random();
        let ping_timestamp_ms = now_ms();

        let sequence = sequences::next_send(&self.store, &contact.x25519_pub)?;
        let ping_wire = build_ping(
            &self.identity,
            &contact.x25519_pub,
            &ping_id,
            ping_timestamp_ms,
            sequence,
        )?;

        outbox::insert(
            &self.store,
            &outbox::NewOutboxMessage {
                contact_id,
                message_id: message_id.clone(),
                message_type: payload.wire_type(),
                payload_plain,
                ping_id,
                ping_timestamp_ms,
                ping_wire,
                self_destruct_ms: options.self_destruct_ms,
                read_receipt: options.read_receipt,
            },
            ping_timestamp_ms,
        )?;

        log::info!(
            "queued {:?} message {message_id} for contact {contact_id} (ping {ping_id})",
            payload.wire_type()
        );

        let engine = self.clone();
        tokio::spawn(async move { engine.retry_worker(ping_id).await });

        Ok(message_id)
    }

    /// Cancel an outgoing message. Succeeds only while the Ping is
    /// undelivered; afterwards the receiver may already hold it.
    pub fn cancel(&self, message_id: &str) -> Result<bool, EngineError> {
        let cancelled = outbox::cancel(&self.store, message_id)?;
        if cancelled {
            if let Some(row) = outbox::get_by_message_id(&self.store, message_id)? {
                self.notify_waiter(&row.ping_id);
            }
        }
        Ok(cancelled)
    }

    /// Restart retry workers for all non-terminal rows (called once at
    /// supervisor start).
    pub fn resume(self: &Arc<Self>) -> Result<usize, EngineError> {
        let rows = outbox::active(&self.store)?;
        let count = rows.len();
        for row in rows {
            let engine = self.clone();
            tokio::spawn(async move { engine.retry_worker(row.ping_id).await });
        }
        if count > 0 {
            log::info!("resumed {count} outbox retry workers");
        }
        Ok(count)
    }

    // ---- signals from the receive engine ----

    /// A Pong arrived (listener or instant path). An authenticated Pong
    /// releases the payload send; a decline ends the exchange as REFUSED.
    pub fn on_pong(&self, pong: &OpenedPong) {
        let ping_hex = pong.ping_id.to_hex();
        // Record the id; duplicates fall through to no-op updates below.
        if let Err(e) = received::insert(&self.store, IdNamespace::Pong, &ping_hex, now_ms()) {
            log::warn!("received-ids insert failed for pong {ping_hex}: {e}");
        }

        let result = if pong.authenticated {
            outbox::mark_pong_received(&self.store, &pong.ping_id)
        } else {
            log::info!("peer declined ping {ping_hex}");
            outbox::mark_refused(&self.store, &pong.ping_id)
        };

        match result {
            Ok(true) => self.notify_waiter(&pong.ping_id),
            Ok(false) => {}
            Err(e) => log::warn!("outbox update failed for pong {ping_hex}: {e}"),
        }
    }

    /// A PING_ACK or MESSAGE_ACK arrived. Best-effort: never errors.
    pub fn on_ack(&self, kind: WireType, acked_id: &str) {
        match kind {
            WireType::PingAck => {
                let Ok(ping_id) = PingId::from_hex(acked_id) else {
                    log::debug!("ping-ack with malformed id dropped");
                    return;
                };
                match outbox::mark_ping_delivered(&self.store, &ping_id) {
                    Ok(true) => {
                        log::debug!("ping {acked_id} delivered");
                        self.notify_waiter(&ping_id);
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("ping-ack update failed: {e}"),
                }
            }
            WireType::MessageAck => match outbox::get_by_message_id(&self.store, acked_id) {
                Ok(Some(row)) => match outbox::mark_delivered(&self.store, acked_id) {
                    Ok(true) => {
                        log::info!("message {acked_id} delivered");
                        self.notify_waiter(&row.ping_id);
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("message-ack update failed: {e}"),
                },
                Ok(None) => log::debug!("message-ack for unknown id {acked_id}"),
                Err(e) => log::warn!("message-ack lookup failed: {e}"),
            },
            other => log::debug!("ignoring ack of type {other:?}"),
        }
    }

    /// Tap handler: the contact just came online; re-Ping every
    /// undelivered row once, spaced by the tap gap.
    pub async fn tap_repings(&self, contact_id: ContactId) {
        let rows = match outbox::undelivered_to_contact(&self.store, contact_id) {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("tap re-ping query failed: {e}");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        log::info!("tap from contact {contact_id}: re-pinging {} rows", rows.len());

        let gap = Duration::from_millis(self.config.timing.tap_gap_ms);
        for row in rows {
            if let Err(e) = self.dial_and_send_ping(&row).await {
                log::debug!("tap re-ping for {} failed: {e}", row.ping_id);
            }
            tokio::time::sleep(gap).await;
        }
    }

    // ---- the retry worker ----

    async fn retry_worker(self: Arc<Self>, ping_id: PingId) {
        let notify = self.register_waiter(&ping_id);
        let timing = &self.config.timing;
        let mut pong_waits: u32 = 0;

        loop {
            let row = match outbox::get_by_ping(&self.store, &ping_id) {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    log::error!("outbox read failed for {ping_id}: {e}");
                    break;
                }
            };

            if row.message_delivered || row.status.is_terminal() {
                break;
            }

            // No network work while the overlay is down; the row stays
            // queued and the attempt budget is not spent.
            if !self.status.overlay_ready() {
                tokio::time::sleep(Duration::from_secs(timing.retry_tick_secs)).await;
                continue;
            }

            // Ping acknowledged but no Pong yet: nothing to send. The
            // payload waits for the peer's consent, re-Pinging is
            // suppressed, and the attempt budget is untouched.
            let wants_network = row.pong_received || !row.ping_delivered;
            if wants_network {
                // Inter-attempt minimum spacing.
                let now = now_ms();
                let min_gap_ms = (timing.inter_attempt_min_secs * 1000) as i64;
                if row.last_retry_ms > 0 && now - row.last_retry_ms < min_gap_ms {
                    tokio::time::sleep(Duration::from_millis(
                        (min_gap_ms - (now - row.last_retry_ms)) as u64,
                    ))
                    .await;
                    continue;
                }

                if row.retry_count >= timing.max_send_attempts {
                    log::warn!("ping {ping_id}: retry budget exhausted, marking failed");
                    if let Err(e) = outbox::mark_failed(&self.store, &ping_id) {
                        log::error!("mark_failed for {ping_id}: {e}");
                    }
                    break;
                }

                if let Err(e) = outbox::bump_retry(&self.store, &ping_id, now) {
                    log::error!("bump_retry for {ping_id}: {e}");
                }

                if row.pong_received {
                    // Authenticated Pong in hand: (re)send the payload,
                    // then wait for the MESSAGE_ACK via the ACK listener.
                    if let Err(e) = self.send_payload(&row, None).await {
                        log::debug!("payload send for {ping_id} failed: {e}");
                    }
                } else {
                    match self.attempt_ping(&row).await {
                        Ok(()) => {}
                        Err(e) => log::debug!("ping attempt for {ping_id} failed: {e}"),
                    }
                }
            }

            // Wait for a Pong/ACK signal, with the listener-path backoff
            // (2 s, 4 s, 8 s, capped) for the first attempts, then the
            // plain retry tick.
            pong_waits += 1;
            let wait_secs = if pong_waits <= timing.pong_backoff_attempts {
                (1u64 << pong_waits).min(timing.pong_backoff_cap_secs)
            } else {
                timing.retry_tick_secs
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => {}
            }
        }

        self.unregister_waiter(&ping_id);
    }

    /// One Ping attempt: dial, send the cached wire bytes, and hold the
    /// connection briefly for the instant path.
    async fn attempt_ping(&self, row: &OutboxRow) -> Result<(), EngineError> {
        let contact = self.contact_of(row)?;
        let mut conn = self
            .transport
            .dial(&contact.messaging_onion, self.config.network.ping_port)
            .await?;
        conn.send(&row.ping_wire).await?;

        let reply = conn
            .recv(
                self.transport.max_frame_bytes(),
                Duration::from_secs(self.config.timing.instant_pong_wait_secs),
            )
            .await?;

        if reply.is_empty() {
            // Deferred path: the Pong listener will pick it up.
            return Ok(());
        }

        let Ok(pong) = open_pong(&reply, &self.identity) else {
            log::debug!("instant-path reply for {} was not a pong", row.ping_id);
            return Ok(());
        };
        if pong.ping_id != row.ping_id {
            log::debug!("instant-path pong answers a different ping");
            return Ok(());
        }

        self.on_pong(&pong);

        if pong.authenticated {
            // Same dial, same connection: frame two of the instant path.
            if let Some(fresh) = outbox::get_by_ping(&self.store, &row.ping_id)? {
                self.send_payload(&fresh, Some(&mut conn)).await?;
            }
        }

        Ok(())
    }

    /// Re-Ping once on an existing row (tap trigger), no instant read.
    async fn dial_and_send_ping(&self, row: &OutboxRow) -> Result<(), EngineError> {
        let contact = self.contact_of(row)?;
        let mut conn = self
            .transport
            .dial(&contact.messaging_onion, self.config.network.ping_port)
            .await?;
        conn.send(&row.ping_wire).await?;
        Ok(())
    }

    /// Send the message payload, building and caching the wire bytes on
    /// first use so retries stay byte-identical.
    async fn send_payload(
        &self,
        row: &OutboxRow,
        conn: Option<&mut Connection>,
    ) -> Result<(), EngineError> {
        let contact = self.contact_of(row)?;

        let wire = match &row.message_wire {
            Some(wire) => wire.clone(),
            None => {
                let sequence = sequences::next_send(&self.store, &contact.x25519_pub)?;
                let wire = build_message(
                    &self.identity,
                    &contact.x25519_pub,
                    row.message_type,
                    &row.payload_plain,
                    sequence,
                )?;
                outbox::set_message_wire(&self.store, &row.ping_id, &wire)?;
                wire
            }
        };

        match conn {
            Some(conn) => conn.send(&wire).await?,
            None => {
                let mut conn = self
                    .transport
                    .dial(&contact.messaging_onion, self.config.network.ping_port)
                    .await?;
                conn.send(&wire).await?;
            }
        }

        log::info!("sent payload for ping {} ({} bytes)", row.ping_id, wire.len());
        Ok(())
    }

    fn contact_of(&self, row: &OutboxRow) -> Result<ContactRecord, EngineError> {
        self.contacts
            .get(row.contact_id)
            .ok_or(EngineError::UnknownContact(row.contact_id))
    }

    // ---- waiter registry ----

    fn register_waiter(&self, ping_id: &PingId) -> Arc<Notify> {
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .entry(ping_id.to_hex())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify_waiter(&self, ping_id: &PingId) {
        if let Some(notify) = self
            .waiters
            .lock()
            .expect("waiter lock poisoned")
            .get(&ping_id.to_hex())
        {
            notify.notify_one();
        }
    }

    fn unregister_waiter(&self, ping_id: &PingId) {
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .remove(&ping_id.to_hex());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryDirectory;

    fn engine_with_contact() -> (Arc<SendEngine>, ContactRecord, Arc<Store>) {
        let identity = Arc::new(Identity::generate());
        let peer = Identity::generate();
        let store = Arc::new(Store::open_memory().unwrap());
        let config = Arc::new(Config::default());
        let transport = Arc::new(Transport::new(&config));
        let directory = MemoryDirectory::new();
        let contact = ContactRecord {
            id: 1,
            display_name: "peer".into(),
            messaging_onion: format!("{}.onion", "b".repeat(56)),
            ed25519_pub: peer.public_bytes(),
            x25519_pub: peer.x25519_public(),
        };
        directory.add(contact.clone());

        let status = StatusFlags::new();
        status.force_ready();
        let engine = SendEngine::new(
            identity,
            store.clone(),
            transport,
            Arc::new(directory),
            config,
            status,
        );
        (engine, contact, store)
    }

    #[tokio::test]
    async fn test_send_message_creates_outbox_row() {
        let (engine, contact, store) = engine_with_contact();

        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();

        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();
        assert_eq!(row.contact_id, contact.id);
        assert_eq!(row.message_type, WireType::Text);
        assert_eq!(row.payload_plain, b"hi");
        assert!(!row.ping_wire.is_empty());
        assert!(!row.ping_delivered);
    }

    #[tokio::test]
    async fn test_send_to_unknown_contact_fails() {
        let (engine, _, _) = engine_with_contact();
        let err = engine
            .send_message(42, MessagePayload::Text("x".into()), SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownContact(42)));
    }

    #[tokio::test]
    async fn test_authenticated_pong_releases_payload() {
        let (engine, contact, store) = engine_with_contact();
        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();
        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();

        engine.on_pong(&OpenedPong {
            ping_id: row.ping_id,
            authenticated: true,
            sender_x25519: contact.x25519_pub,
            sequence: 1,
        });

        let row = outbox::get_by_ping(&store, &row.ping_id).unwrap().unwrap();
        assert!(row.ping_delivered);
        assert!(row.pong_received);
        assert_eq!(row.status, outbox::OutboxStatus::PingSent);
    }

    #[tokio::test]
    async fn test_ping_ack_alone_does_not_release_payload() {
        let (engine, contact, store) = engine_with_contact();
        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();
        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();

        // PING_ACK only stops re-Pings; the payload waits for the Pong.
        engine.on_ack(WireType::PingAck, &row.ping_id.to_hex());

        let row = outbox::get_by_ping(&store, &row.ping_id).unwrap().unwrap();
        assert!(row.ping_delivered);
        assert!(!row.pong_received);
    }

    #[tokio::test]
    async fn test_declined_pong_refuses_row() {
        let (engine, contact, store) = engine_with_contact();
        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();
        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();

        engine.on_pong(&OpenedPong {
            ping_id: row.ping_id,
            authenticated: false,
            sender_x25519: contact.x25519_pub,
            sequence: 1,
        });

        let row = outbox::get_by_ping(&store, &row.ping_id).unwrap().unwrap();
        assert_eq!(row.status, outbox::OutboxStatus::Refused);
    }

    #[tokio::test]
    async fn test_acks_reconcile_outbox() {
        let (engine, contact, store) = engine_with_contact();
        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();
        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();

        engine.on_ack(WireType::PingAck, &row.ping_id.to_hex());
        let row = outbox::get_by_ping(&store, &row.ping_id).unwrap().unwrap();
        assert!(row.ping_delivered);

        engine.on_ack(WireType::MessageAck, message_id.as_str());
        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();
        assert!(row.message_delivered);
        assert_eq!(row.status, outbox::OutboxStatus::Delivered);

        // Malformed and unknown acks are silently ignored.
        engine.on_ack(WireType::PingAck, "not-hex");
        engine.on_ack(WireType::MessageAck, "0000aaaa0000aaaa0000aaaa0000aaaa");
    }

    #[tokio::test]
    async fn test_cancel_before_ping_delivered() {
        let (engine, contact, store) = engine_with_contact();
        let message_id = engine
            .send_message(contact.id, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();

        assert!(engine.cancel(message_id.as_str()).unwrap());

        let row = outbox::get_by_message_id(&store, message_id.as_str())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, outbox::OutboxStatus::Cancelled);

        // Cancelling again is a no-op.
        assert!(!engine.cancel(message_id.as_str()).unwrap());
    }
}
