//! Receive engine: four cooperative pollers over the listeners.
//!
//! P1 (Ping/Message) routes each inbound frame through three attempts in
//! order: Ping, delayed Pong, message blob. P2 (Tap) triggers one-shot
//! re-Pings of undelivered outbox rows. P3 (Pong) and P4 (ACK) feed the
//! send engine. Known ping-ids re-ack before anything else so exact
//! retries still stop the sender's storm; fresh frames pass the
//! windowed sequence policy before their id is recorded, so a reordered
//! Ping is neither lost nor poisoned. Everything that fails to parse is
//! adversarial noise and is dropped with a debug log.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::Config;
use crate::crypto::{derive_session_key, Identity};
use crate::engine::events::{Event, EventBus};
use crate::engine::send::SendEngine;
use crate::engine::now_ms;
use crate::network::sessions::{PingSession, PingSessionStore};
use crate::network::transport::{ConnId, Listener};
use crate::network::Transport;
use crate::protocol::envelope::{
    build_ack, open_ack, open_message, open_ping, open_pong, OpenedMessage, OpenedPing,
};
use crate::protocol::wire::{normalize_wire_bytes, MessageId, WireType};
use crate::protocol::{ContactDirectory, ContactRecord, MessagePayload};
use crate::storage::received::IdNamespace;
use crate::storage::{
    inbox, received, sequences, store_incoming_message, Store, StoreOutcome, StoredMessage,
};
use crate::supervisor::StatusFlags;

/// The four bound listeners, P1-P4.
pub struct Listeners {
    pub ping: Listener,
    pub tap: Listener,
    pub pong: Listener,
    pub ack: Listener,
}

/// Cadence of the listener poll loops.
const POLL_SLEEP: Duration = Duration::from_secs(1);

pub struct RecvEngine {
    identity: Arc<Identity>,
    store: Arc<Store>,
    transport: Arc<Transport>,
    contacts: Arc<dyn ContactDirectory>,
    pub(crate) sessions: Arc<PingSessionStore>,
    events: EventBus,
    config: Arc<Config>,
    send: Arc<SendEngine>,
    pub(crate) status: Arc<StatusFlags>,
}

impl RecvEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<Store>,
        transport: Arc<Transport>,
        contacts: Arc<dyn ContactDirectory>,
        sessions: Arc<PingSessionStore>,
        events: EventBus,
        config: Arc<Config>,
        send: Arc<SendEngine>,
        status: Arc<StatusFlags>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            store,
            transport,
            contacts,
            sessions,
            events,
            config,
            send,
            status,
        })
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn contacts(&self) -> &Arc<dyn ContactDirectory> {
        &self.contacts
    }

    pub(crate) fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Spawn the four pollers. They exit when the supervisor clears the
    /// running flag.
    pub fn spawn_pollers(
        self: &Arc<Self>,
        listeners: Arc<Listeners>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(4);

        let engine = self.clone();
        let l = listeners.clone();
        handles.push(tokio::spawn(async move {
            while engine.status.is_running() {
                match l.ping.poll() {
                    Some((conn_id, frame)) => engine.handle_ping_listener(conn_id, frame).await,
                    None => tokio::time::sleep(POLL_SLEEP).await,
                }
            }
        }));

        let engine = self.clone();
        let l = listeners.clone();
        handles.push(tokio::spawn(async move {
            while engine.status.is_running() {
                match l.tap.poll() {
                    Some((conn_id, frame)) => engine.handle_tap(conn_id, frame).await,
                    None => tokio::time::sleep(POLL_SLEEP).await,
                }
            }
        }));

        let engine = self.clone();
        let l = listeners.clone();
        handles.push(tokio::spawn(async move {
            while engine.status.is_running() {
                match l.pong.poll() {
                    Some((conn_id, frame)) => engine.handle_pong(conn_id, frame).await,
                    None => tokio::time::sleep(POLL_SLEEP).await,
                }
            }
        }));

        let engine = self.clone();
        let l = listeners;
        handles.push(tokio::spawn(async move {
            while engine.status.is_running() {
                match l.ack.poll() {
                    Some((conn_id, frame)) => engine.handle_ack(conn_id, frame).await,
                    None => tokio::time::sleep(POLL_SLEEP).await,
                }
            }
        }));

        handles
    }

    // ---- P1: Ping / Message listener ----

    pub(crate) async fn handle_ping_listener(self: &Arc<Self>, conn_id: ConnId, frame: Vec<u8>) {
        // Pings first, accepting the legacy type-less form.
        let canonical = normalize_wire_bytes(WireType::Ping, &frame);
        if let Ok(ping) = open_ping(&canonical, &self.identity) {
            self.accept_ping(conn_id, canonical, ping).await;
            return;
        }

        // A Pong that lost the race to the dial connection and got posted
        // to the messaging port instead.
        if let Ok(pong) = open_pong(&frame, &self.identity) {
            self.transport.drop_parked(conn_id);
            log::debug!("delayed pong for {} via messaging port", pong.ping_id);
            self.send.on_pong(&pong);
            return;
        }

        match open_message(&frame, &self.identity) {
            Ok(message) => {
                self.transport.drop_parked(conn_id);
                self.process_message(message).await;
            }
            Err(e) => {
                self.transport.drop_parked(conn_id);
                log::debug!("undecodable frame on messaging port dropped: {e}");
            }
        }
    }

    async fn accept_ping(self: &Arc<Self>, conn_id: ConnId, canonical: Vec<u8>, ping: OpenedPing) {
        let Some(contact) = self.contacts.find_by_x25519(&ping.sender_x25519) else {
            self.transport.drop_parked(conn_id);
            log::debug!("ping from unknown sender key dropped");
            return;
        };

        match contact.verifying_key() {
            Some(key) if ping.verify_identity(&key) => {}
            _ => {
                self.transport.drop_parked(conn_id);
                log::warn!(
                    "ping {} failed identity check for contact {}",
                    ping.ping_id,
                    contact.id
                );
                return;
            }
        }

        let now = now_ms();
        let ping_hex = ping.ping_id.to_hex();

        // Exact retry of a known ping: ACK again to stop the sender's
        // storm, touch nothing else. (Fast-path read; the insert below
        // stays the authoritative guard.)
        match received::contains(&self.store, IdNamespace::Ping, &ping_hex) {
            Ok(true) => {
                self.transport.drop_parked(conn_id);
                log::debug!("duplicate ping {ping_hex}, re-acking");
                self.spawn_ping_ack(contact, ping_hex);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                self.transport.drop_parked(conn_id);
                log::error!("received-ids lookup failed: {e}");
                return;
            }
        }

        // Windowed sequence policy, BEFORE the id is recorded: pings to
        // the same peer race over separate dials and may arrive out of
        // order, so a fresh ping only has to land within the window. A
        // rejected frame leaves no trace, so an honest retry can still
        // succeed later.
        match sequences::observe_recv(&self.store, &ping.sender_x25519, ping.sequence) {
            Ok(true) => {}
            Ok(false) => {
                self.transport.drop_parked(conn_id);
                log::debug!("sequence {} on ping {ping_hex} outside window", ping.sequence);
                return;
            }
            Err(e) => {
                self.transport.drop_parked(conn_id);
                log::error!("sequence check failed: {e}");
                return;
            }
        }

        let fresh = match received::insert(&self.store, IdNamespace::Ping, &ping_hex, now) {
            Ok(fresh) => fresh,
            Err(e) => {
                self.transport.drop_parked(conn_id);
                log::error!("received-ids insert failed: {e}");
                return;
            }
        };

        if !fresh {
            // Lost a race with a concurrent copy of the same ping.
            self.transport.drop_parked(conn_id);
            log::debug!("duplicate ping {ping_hex}, re-acking");
            self.spawn_ping_ack(contact, ping_hex);
            return;
        }

        let wire_b64 = BASE64.encode(&canonical);
        if let Err(e) = inbox::insert_seen(
            &self.store,
            &ping.ping_id,
            contact.id,
            &wire_b64,
            ping.timestamp_ms,
            now,
        ) {
            self.transport.drop_parked(conn_id);
            log::error!("inbox insert failed for {ping_hex}: {e}");
            return;
        }

        let session_key =
            match derive_session_key(self.identity.agreement_secret(), &ping.sender_x25519) {
                Ok(key) => key,
                Err(e) => {
                    self.transport.drop_parked(conn_id);
                    log::warn!("session derivation failed for {ping_hex}: {e}");
                    return;
                }
            };

        self.sessions.insert(PingSession {
            ping_id: ping.ping_id,
            contact_id: contact.id,
            sender_x25519: ping.sender_x25519,
            timestamp_ms: ping.timestamp_ms,
            wire_bytes: canonical,
            session_key,
            received_ms: now,
            // Parked for the instant path; swept after the reply window.
            conn_id: Some(conn_id),
        });

        log::info!("accepted ping {ping_hex} from contact {}", contact.id);
        self.spawn_ping_ack(contact.clone(), ping_hex.clone());
        self.events.emit(Event::PingReceived {
            contact_id: contact.id,
            ping_id: ping_hex,
        });

        if self.config.timing.auto_download {
            let engine = self.clone();
            let ping_id = ping.ping_id;
            tokio::spawn(async move {
                if let Err(e) = engine.download(&ping_id).await {
                    log::debug!("auto-download for {ping_id} did not complete: {e}");
                }
            });
        }
    }

    /// Route an incoming message payload through the atomic-store flow
    /// and acknowledge it. Shared by the listener path and the
    /// instant-path download read.
    pub(crate) async fn process_message(self: &Arc<Self>, message: OpenedMessage) {
        let Some(contact) = self.contacts.find_by_x25519(&message.sender_x25519) else {
            log::debug!("message from unknown sender key dropped");
            return;
        };

        let payload = match MessagePayload::decode(message.wire_type, &message.plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("malformed {:?} payload dropped: {e}", message.wire_type);
                return;
            }
        };

        let message_id = MessageId::for_incoming(&message.plaintext, &contact.messaging_onion);

        // Correlate with the Ping being downloaded, when there is one.
        let inbox_row = inbox::active_download_for_contact(&self.store, contact.id)
            .ok()
            .flatten();
        let (ping_id, timestamp_ms) = match &inbox_row {
            Some(row) => (Some(row.ping_id), row.ping_timestamp_ms),
            None => (None, now_ms()),
        };

        let stored = StoredMessage {
            message_id: message_id.clone(),
            contact_id: contact.id,
            ping_id,
            message_type: message.wire_type,
            content: message.plaintext.clone(),
            timestamp_ms,
        };

        let outcome = match store_incoming_message(&self.store, &stored, now_ms()) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("atomic store failed for message {message_id}: {e}");
                return;
            }
        };

        if outcome == StoreOutcome::Stored {
            // Bookkeeping only: payloads dedup on message-id, and they
            // may arrive out of order like their pings.
            if let Err(e) =
                sequences::observe_recv(&self.store, &message.sender_x25519, message.sequence)
            {
                log::warn!("sequence bookkeeping failed: {e}");
            }
            if let Some(ping_id) = &ping_id {
                self.sessions.remove(ping_id);
            }
            log::info!(
                "stored {:?} message {message_id} from contact {}",
                message.wire_type,
                contact.id
            );
            match payload {
                MessagePayload::Profile(update) => {
                    log::info!(
                        "contact {} announced profile name {:?}",
                        contact.id,
                        update.display_name
                    );
                    self.events.emit(Event::ProfileUpdated {
                        contact_id: contact.id,
                    });
                }
                _ => {
                    self.events.emit(Event::MessageStored {
                        contact_id: contact.id,
                        message_id: message_id.as_str().to_string(),
                    });
                }
            }
        } else {
            log::debug!("duplicate message {message_id}, re-acking only");
        }

        // MESSAGE_ACK in both outcomes, outside the transaction.
        self.spawn_message_ack(contact, message_id.as_str().to_string());
    }

    // ---- P2: Tap listener ----

    async fn handle_tap(&self, conn_id: ConnId, frame: Vec<u8>) {
        self.transport.drop_parked(conn_id);

        let tap = match open_tap_frame(&frame, &self.identity) {
            Some(tap) => tap,
            None => {
                log::debug!("undecodable tap frame dropped");
                return;
            }
        };

        let Some(contact) = self.contacts.find_by_x25519(&tap.sender_x25519) else {
            log::debug!("tap from unknown sender dropped");
            return;
        };

        match sequences::accept_recv(&self.store, &tap.sender_x25519, tap.sequence) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("replayed tap from contact {} dropped", contact.id);
                return;
            }
            Err(e) => {
                log::warn!("sequence check failed on tap: {e}");
                return;
            }
        }

        log::debug!("tap from contact {}", contact.id);
        let send = self.send.clone();
        tokio::spawn(async move { send.tap_repings(contact.id).await });
    }

    // ---- P3: Pong listener ----

    async fn handle_pong(&self, conn_id: ConnId, frame: Vec<u8>) {
        self.transport.drop_parked(conn_id);
        match open_pong(&frame, &self.identity) {
            Ok(pong) => self.send.on_pong(&pong),
            Err(e) => log::debug!("undecodable pong frame dropped: {e}"),
        }
    }

    // ---- P4: ACK listener ----

    async fn handle_ack(&self, conn_id: ConnId, frame: Vec<u8>) {
        self.transport.drop_parked(conn_id);
        match open_ack(&frame, &self.identity) {
            Ok(ack) => self.send.on_ack(ack.kind, &ack.acked_id),
            Err(e) => log::debug!("undecodable ack frame dropped: {e}"),
        }
    }

    // ---- ACK emission ----

    /// PING_ACK: one fresh dial to the sender's ACK port, best-effort.
    fn spawn_ping_ack(self: &Arc<Self>, contact: ContactRecord, ping_hex: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine
                .emit_ack(&contact, WireType::PingAck, &ping_hex)
                .await
            {
                log::debug!("ping-ack to contact {} failed: {e}", contact.id);
            }
        });
    }

    /// MESSAGE_ACK: retried (1 s then 2 s backoff) so the sender's retry
    /// worker actually stops.
    pub(crate) fn spawn_message_ack(self: &Arc<Self>, contact: ContactRecord, message_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let attempts = engine.config.timing.ack_retry_attempts.max(1);
            for attempt in 0..attempts {
                match engine
                    .emit_ack(&contact, WireType::MessageAck, &message_id)
                    .await
                {
                    Ok(()) => return,
                    Err(e) => {
                        log::debug!(
                            "message-ack attempt {} to contact {} failed: {e}",
                            attempt + 1,
                            contact.id
                        );
                    }
                }
                tokio::time::sleep(Duration::from_secs(1 << attempt.min(4))).await;
            }
            log::warn!("message-ack to contact {} gave up", contact.id);
        });
    }

    async fn emit_ack(
        &self,
        contact: &ContactRecord,
        kind: WireType,
        acked_id: &str,
    ) -> Result<(), crate::engine::EngineError> {
        let sequence = sequences::next_send(&self.store, &contact.x25519_pub)?;
        let wire = build_ack(&self.identity, &contact.x25519_pub, kind, acked_id, sequence)?;
        let mut conn = self
            .transport
            .dial(&contact.messaging_onion, self.config.network.ack_port)
            .await?;
        conn.send(&wire).await?;
        Ok(())
    }

}

/// Tap frames may arrive without a type byte from legacy clients too.
fn open_tap_frame(
    frame: &[u8],
    identity: &Identity,
) -> Option<crate::protocol::envelope::OpenedTap> {
    use crate::protocol::envelope::open_tap;
    if let Ok(tap) = open_tap(frame, identity) {
        return Some(tap);
    }
    let canonical = normalize_wire_bytes(WireType::Tap, frame);
    open_tap(&canonical, identity).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::engine::SendOptions;
    use crate::protocol::envelope::{build_message, build_ping};
    use crate::protocol::wire::PingId;
    use crate::protocol::{ContactId, MemoryDirectory};
    use crate::storage::outbox;

    /// Map of "host:port" routes a fake SOCKS proxy resolves to local
    /// ports, so two in-process peers can reach each other the way they
    /// would through the overlay.
    type Routes = Arc<StdMutex<HashMap<String, u16>>>;

    async fn spawn_fake_proxy(routes: Routes) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut client, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut greeting = [0u8; 3];
                    client.read_exact(&mut greeting).await.ok()?;
                    client.write_all(&[0x05, 0x00]).await.ok()?;

                    let mut head = [0u8; 4];
                    client.read_exact(&mut head).await.ok()?;
                    let mut len = [0u8; 1];
                    client.read_exact(&mut len).await.ok()?;
                    let mut host = vec![0u8; len[0] as usize];
                    client.read_exact(&mut host).await.ok()?;
                    let mut port = [0u8; 2];
                    client.read_exact(&mut port).await.ok()?;

                    let key = format!(
                        "{}:{}",
                        String::from_utf8(host).ok()?,
                        u16::from_be_bytes(port)
                    );
                    let target = routes.lock().unwrap().get(&key).copied();
                    let Some(target) = target else {
                        let _ = client
                            .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                            .await;
                        return None;
                    };

                    let mut upstream =
                        TcpStream::connect(("127.0.0.1", target)).await.ok()?;
                    client
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .ok()?;
                    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                    Some(())
                });
            }
        });

        proxy_port
    }

    struct Peer {
        identity: Arc<Identity>,
        onion: String,
        store: Arc<Store>,
        send: Arc<SendEngine>,
        recv: Arc<RecvEngine>,
        events: tokio::sync::broadcast::Receiver<Event>,
        directory: Arc<MemoryDirectory>,
    }

    impl Peer {
        async fn spawn(name: &str, proxy_port: u16, routes: &Routes, auto_download: bool) -> Peer {
            let identity = Arc::new(Identity::generate());
            let onion = format!("{name}.onion");

            let mut config = Config::default();
            config.network.socks_port = proxy_port;
            config.timing.auto_download = auto_download;
            config.timing.inter_attempt_min_secs = 0;
            config.timing.download_timeout_secs = 20;
            let config = Arc::new(config);

            let store = Arc::new(Store::open_memory().unwrap());
            let transport = Arc::new(Transport::new(&config));
            let sessions = Arc::new(PingSessionStore::new(Some(store.clone())));
            let bus = EventBus::default();
            let events = bus.subscribe();
            let directory = Arc::new(MemoryDirectory::new());
            let status = StatusFlags::new();
            status.force_ready();

            let send = SendEngine::new(
                identity.clone(),
                store.clone(),
                transport.clone(),
                directory.clone(),
                config.clone(),
                status.clone(),
            );
            let recv = RecvEngine::new(
                identity.clone(),
                store.clone(),
                transport.clone(),
                directory.clone(),
                sessions,
                bus,
                config.clone(),
                send.clone(),
                status,
            );

            // Bind P1-P4 on ephemeral ports; the proxy translates the
            // well-known ports the engines dial into the real ones.
            let wait = Duration::from_secs(5);
            let listeners = Arc::new(Listeners {
                ping: Listener::bind(0, transport.clone(), wait).await.unwrap(),
                tap: Listener::bind(0, transport.clone(), wait).await.unwrap(),
                pong: Listener::bind(0, transport.clone(), wait).await.unwrap(),
                ack: Listener::bind(0, transport.clone(), wait).await.unwrap(),
            });
            {
                let mut map = routes.lock().unwrap();
                map.insert(
                    format!("{onion}:{}", config.network.ping_port),
                    listeners.ping.port,
                );
                map.insert(
                    format!("{onion}:{}", config.network.tap_port),
                    listeners.tap.port,
                );
                map.insert(
                    format!("{onion}:{}", config.network.pong_port),
                    listeners.pong.port,
                );
                map.insert(
                    format!("{onion}:{}", config.network.ack_port),
                    listeners.ack.port,
                );
            }
            recv.spawn_pollers(listeners);

            Peer {
                identity,
                onion,
                store,
                send,
                recv,
                events,
                directory,
            }
        }

        fn contact_record(&self, id: ContactId) -> ContactRecord {
            ContactRecord {
                id,
                display_name: self.onion.clone(),
                messaging_onion: self.onion.clone(),
                ed25519_pub: self.identity.public_bytes(),
                x25519_pub: self.identity.x25519_public(),
            }
        }

        fn knows(&self, other: &Peer, as_id: ContactId) {
            self.directory.add(other.contact_record(as_id));
        }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
        let start = tokio::time::Instant::now();
        loop {
            if check() {
                return;
            }
            if start.elapsed() > deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_text_delivery() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;

        let alice = Peer::spawn("alice", proxy_port, &routes, true).await;
        let mut bob = Peer::spawn("bob", proxy_port, &routes, true).await;
        alice.knows(&bob, 1);
        bob.knows(&alice, 1);

        let message_id = alice
            .send
            .send_message(1, MessagePayload::Text("hi".into()), SendOptions::default())
            .await
            .unwrap();

        // Alice's row reaches DELIVERED once Bob stores and acks.
        let store = alice.store.clone();
        let id = message_id.as_str().to_string();
        eventually("alice row delivered", Duration::from_secs(30), move || {
            outbox::get_by_message_id(&store, &id)
                .unwrap()
                .map(|row| row.message_delivered)
                .unwrap_or(false)
        })
        .await;

        // Bob holds exactly one stored copy of the plaintext.
        let row = outbox::get_by_message_id(&alice.store, message_id.as_str())
            .unwrap()
            .unwrap();
        let stored = crate::storage::get_message_by_ping(&bob.store, &row.ping_id)
            .unwrap()
            .expect("bob stored the message");
        assert_eq!(stored.content, b"hi");
        assert_eq!(stored.message_type, WireType::Text);

        let inbox_row = inbox::get(&bob.store, &row.ping_id).unwrap();
        assert_eq!(inbox_row.state, inbox::InboxState::MsgStored);
        assert!(inbox_row.wire_bytes.is_none());

        // Bob's app saw both events.
        let mut saw_ping = false;
        let mut saw_stored = false;
        while let Ok(event) = bob.events.try_recv() {
            match event {
                Event::PingReceived { .. } => saw_ping = true,
                Event::MessageStored { .. } => saw_stored = true,
                _ => {}
            }
        }
        assert!(saw_ping && saw_stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_pings_collapse_to_one_inbox_row() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;

        // No auto-download so the inbox rows stay observable in PING_SEEN.
        let alice = Peer::spawn("alice", proxy_port, &routes, false).await;
        let bob = Peer::spawn("bob", proxy_port, &routes, false).await;
        alice.knows(&bob, 1);
        bob.knows(&alice, 1);

        // Hand-build one ping and deliver it three times, as a flaky
        // network would.
        let ping_id = PingId::random();
        let seq = crate::storage::sequences::next_send(
            &alice.store,
            &bob.identity.x25519_public(),
        )
        .unwrap();
        let wire = build_ping(
            &alice.identity,
            &bob.identity.x25519_public(),
            &ping_id,
            now_ms(),
            seq,
        )
        .unwrap();

        // Alice's outbox row exists before any ack can land.
        outbox::insert(
            &alice.store,
            &outbox::NewOutboxMessage {
                contact_id: 1,
                message_id: MessageId::random(),
                message_type: WireType::Text,
                payload_plain: b"x".to_vec(),
                ping_id,
                ping_timestamp_ms: 0,
                ping_wire: wire.clone(),
                self_destruct_ms: None,
                read_receipt: false,
            },
            0,
        )
        .unwrap();

        for _ in 0..3 {
            bob.recv
                .handle_ping_listener(ConnId(u64::MAX), wire.clone())
                .await;
        }

        let row = inbox::get(&bob.store, &ping_id).unwrap();
        assert_eq!(row.state, inbox::InboxState::PingSeen);
        assert_eq!(bob.recv.sessions.len(), 1);

        // Every delivery earned an ack; alice's flag flips on the first.
        let store = alice.store.clone();
        eventually("alice sees ping ack", Duration::from_secs(20), move || {
            outbox::get_by_ping(&store, &ping_id)
                .unwrap()
                .map(|r| r.ping_delivered)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_out_of_order_pings_and_payloads_both_stored() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;
        let alice = Peer::spawn("alice", proxy_port, &routes, false).await;
        let bob = Peer::spawn("bob", proxy_port, &routes, false).await;
        bob.knows(&alice, 1);

        // Alice sends M1 then M2; different dial latencies deliver M2's
        // ping to Bob first.
        let bob_x = bob.identity.x25519_public();
        let ping1 = PingId::random();
        let ping2 = PingId::random();
        let seq1 = crate::storage::sequences::next_send(&alice.store, &bob_x).unwrap();
        let seq2 = crate::storage::sequences::next_send(&alice.store, &bob_x).unwrap();
        let wire1 = build_ping(&alice.identity, &bob_x, &ping1, now_ms(), seq1).unwrap();
        let wire2 = build_ping(&alice.identity, &bob_x, &ping2, now_ms(), seq2).unwrap();

        bob.recv.handle_ping_listener(ConnId(1), wire2).await;
        bob.recv.handle_ping_listener(ConnId(2), wire1).await;

        assert_eq!(
            inbox::get(&bob.store, &ping1).unwrap().state,
            inbox::InboxState::PingSeen
        );
        assert_eq!(
            inbox::get(&bob.store, &ping2).unwrap().state,
            inbox::InboxState::PingSeen
        );

        // The payloads land out of order too; both must be stored.
        for (ping_id, body, seq) in [(ping2, &b"M2"[..], seq2 + 10), (ping1, &b"M1"[..], seq1 + 10)]
        {
            inbox::claim_download(&bob.store, &ping_id, now_ms()).unwrap();
            inbox::mark_pong_sent(&bob.store, &ping_id, now_ms()).unwrap();
            let blob = build_message(&alice.identity, &bob_x, WireType::Text, body, seq).unwrap();
            let opened = open_message(&blob, &bob.identity).unwrap();
            bob.recv.process_message(opened).await;
            assert_eq!(
                inbox::get(&bob.store, &ping_id).unwrap().state,
                inbox::InboxState::MsgStored
            );
        }

        let m1 = crate::storage::get_message_by_ping(&bob.store, &ping1)
            .unwrap()
            .expect("M1 stored despite arriving second");
        let m2 = crate::storage::get_message_by_ping(&bob.store, &ping2)
            .unwrap()
            .expect("M2 stored");
        assert_eq!(m1.content, b"M1");
        assert_eq!(m2.content, b"M2");
    }

    #[tokio::test]
    async fn test_far_stale_ping_dropped_without_poisoning() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;
        let alice = Peer::spawn("alice", proxy_port, &routes, false).await;
        let bob = Peer::spawn("bob", proxy_port, &routes, false).await;
        bob.knows(&alice, 1);

        let alice_x = alice.identity.x25519_public();
        let bob_x = bob.identity.x25519_public();

        // The peer's high-water mark is far ahead of this frame.
        assert!(crate::storage::sequences::observe_recv(&bob.store, &alice_x, 500).unwrap());

        let ping_id = PingId::random();
        let wire = build_ping(&alice.identity, &bob_x, &ping_id, now_ms(), 1).unwrap();
        bob.recv.handle_ping_listener(ConnId(1), wire).await;

        // Dropped before any record was made: no inbox row, and the id is
        // not marked seen, so a later in-window retry could still land.
        assert!(inbox::get(&bob.store, &ping_id).is_err());
        assert!(!crate::storage::received::contains(
            &bob.store,
            crate::storage::received::IdNamespace::Ping,
            &ping_id.to_hex()
        )
        .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_sender_frames_are_dropped() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;
        let bob = Peer::spawn("bob", proxy_port, &routes, false).await;

        // A stranger bob has no contact record for.
        let stranger = Identity::generate();
        let ping = build_ping(
            &stranger,
            &bob.identity.x25519_public(),
            &PingId::random(),
            now_ms(),
            1,
        )
        .unwrap();
        bob.recv.handle_ping_listener(ConnId(1), ping).await;
        assert!(bob.recv.sessions.is_empty());

        let blob = build_message(
            &stranger,
            &bob.identity.x25519_public(),
            WireType::Text,
            b"spam",
            2,
        )
        .unwrap();
        bob.recv.handle_ping_listener(ConnId(2), blob).await;

        // Nothing stored, nothing in the inbox.
        let count: i64 = bob
            .store
            .lock()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_expired_ping_download_surfaces_message_expired() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;
        let mut bob = Peer::spawn("bob", proxy_port, &routes, false).await;
        let alice = Peer::spawn("alice", proxy_port, &routes, false).await;
        bob.knows(&alice, 1);

        // A Ping whose declared timestamp is 8 days old.
        let eight_days_ms = 8 * 24 * 60 * 60 * 1000;
        let old_ts = now_ms() - eight_days_ms;
        let ping_id = PingId::random();
        let wire = build_ping(
            &alice.identity,
            &bob.identity.x25519_public(),
            &ping_id,
            old_ts,
            1,
        )
        .unwrap();

        bob.recv.handle_ping_listener(ConnId(1), wire).await;
        assert_eq!(
            inbox::get(&bob.store, &ping_id).unwrap().state,
            inbox::InboxState::PingSeen
        );

        let err = bob.recv.download(&ping_id).await.unwrap_err();
        assert!(matches!(err, crate::engine::EngineError::PingExpired));
        assert_eq!(
            inbox::get(&bob.store, &ping_id).unwrap().state,
            inbox::InboxState::ManualRequired
        );

        let mut saw_expired = false;
        while let Ok(event) = bob.events.try_recv() {
            if let Event::DownloadFailed { reason, .. } = event {
                if reason == "message expired" {
                    saw_expired = true;
                }
            }
        }
        assert!(saw_expired, "expiry must surface as DownloadFailed");
    }

    #[tokio::test]
    async fn test_download_after_stored_only_reacks() {
        let routes: Routes = Arc::new(StdMutex::new(HashMap::new()));
        let proxy_port = spawn_fake_proxy(routes.clone()).await;
        let bob = Peer::spawn("bob", proxy_port, &routes, false).await;
        let alice = Peer::spawn("alice", proxy_port, &routes, false).await;
        bob.knows(&alice, 1);

        let ping_id = PingId::random();
        let ping = build_ping(
            &alice.identity,
            &bob.identity.x25519_public(),
            &ping_id,
            now_ms(),
            1,
        )
        .unwrap();
        bob.recv.handle_ping_listener(ConnId(1), ping).await;

        inbox::claim_download(&bob.store, &ping_id, now_ms()).unwrap();
        inbox::mark_pong_sent(&bob.store, &ping_id, now_ms()).unwrap();

        let blob = build_message(
            &alice.identity,
            &bob.identity.x25519_public(),
            WireType::Text,
            b"payload",
            2,
        )
        .unwrap();
        let opened = open_message(&blob, &bob.identity).unwrap();
        bob.recv.process_message(opened.clone()).await;

        assert_eq!(
            inbox::get(&bob.store, &ping_id).unwrap().state,
            inbox::InboxState::MsgStored
        );

        // Second delivery of the same payload: duplicate, no second row.
        bob.recv.process_message(opened).await;
        let count: i64 = bob
            .store
            .lock()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // Download after MSG_STORED is a no-op beyond the re-ack.
        bob.recv.download(&ping_id).await.unwrap();
        assert_eq!(
            inbox::get(&bob.store, &ping_id).unwrap().state,
            inbox::InboxState::MsgStored
        );
    }
}

