//! Supervisor: overlay bring-up, listener lifecycle, health probing,
//! reconnection, retention jobs and tap broadcasts.
//!
//! All cross-cutting state lives here as atomics on [`StatusFlags`];
//! there are no process-wide singletons. Engines read the flags, the
//! supervisor writes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;

use crate::config::Config;
use crate::crypto::Identity;
use crate::engine::events::EventBus;
use crate::engine::recv::{Listeners, RecvEngine};
use crate::engine::send::SendEngine;
use crate::engine::{now_ms, Event};
use crate::network::sessions::PingSessionStore;
use crate::network::transport::Listener;
use crate::network::Transport;
use crate::protocol::envelope::build_tap;
use crate::protocol::{ContactDirectory, PingId};
use crate::storage::received::IdNamespace;
use crate::storage::{inbox, outbox, received, sequences, sessions as durable_sessions, Store};

/// Shared run-state flags the engines and the UI poll.
pub struct StatusFlags {
    running: AtomicBool,
    proxy_ready: AtomicBool,
    listeners_ready: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl StatusFlags {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            proxy_ready: AtomicBool::new(false),
            listeners_ready: AtomicBool::new(false),
            fatal: Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Both the proxy and the listeners are up.
    pub fn overlay_ready(&self) -> bool {
        self.proxy_ready.load(Ordering::SeqCst) && self.listeners_ready.load(Ordering::SeqCst)
    }

    pub fn record_fatal(&self, reason: String) {
        log::error!("fatal: {reason}");
        *self.fatal.lock().expect("fatal flag lock poisoned") = Some(reason);
    }

    /// Engine tests run without a supervisor; flip everything on.
    #[cfg(test)]
    pub(crate) fn force_ready(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.proxy_ready.store(true, Ordering::SeqCst);
        self.listeners_ready.store(true, Ordering::SeqCst);
    }
}

/// What the UI sees when it polls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemStatus {
    Stopped,
    Starting,
    Ready,
    ProxyDown,
    Fatal(String),
}

pub struct Supervisor {
    config: Arc<Config>,
    identity: Arc<Identity>,
    store: Arc<Store>,
    contacts: Arc<dyn ContactDirectory>,
    transport: Arc<Transport>,
    sessions: Arc<PingSessionStore>,
    events: EventBus,
    status: Arc<StatusFlags>,
    send: Arc<SendEngine>,
    recv: Arc<RecvEngine>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    listeners: Mutex<Option<Arc<Listeners>>>,
}

impl Supervisor {
    /// Wire up the whole core. Opens (or creates) the database, builds
    /// both engines, and rehydrates persisted ping sessions. Nothing
    /// touches the network until [`start`](Self::start).
    pub fn new(
        config: Config,
        identity: Identity,
        contacts: Arc<dyn ContactDirectory>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;
        let config = Arc::new(config);
        let identity = Arc::new(identity);

        let store = if config.storage.data_dir.is_empty() {
            Arc::new(Store::open_memory().context("open in-memory store")?)
        } else {
            let dir = std::path::Path::new(&config.storage.data_dir);
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create data dir {}", dir.display()))?;
            Arc::new(Store::open(&dir.join("core.db")).context("open store")?)
        };

        let transport = Arc::new(Transport::new(&config));
        let sessions = Arc::new(PingSessionStore::new(Some(store.clone())));
        sessions.load_persisted(durable_sessions::load_all(&store)?);

        let events = EventBus::default();
        let status = StatusFlags::new();

        let send = SendEngine::new(
            identity.clone(),
            store.clone(),
            transport.clone(),
            contacts.clone(),
            config.clone(),
            status.clone(),
        );
        let recv = RecvEngine::new(
            identity.clone(),
            store.clone(),
            transport.clone(),
            contacts.clone(),
            sessions.clone(),
            events.clone(),
            config.clone(),
            send.clone(),
            status.clone(),
        );

        Ok(Arc::new(Self {
            config,
            identity,
            store,
            contacts,
            transport,
            sessions,
            events,
            status,
            send,
            recv,
            tasks: Mutex::new(Vec::new()),
            listeners: Mutex::new(None),
        }))
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn send_engine(&self) -> Arc<SendEngine> {
        self.send.clone()
    }

    pub fn recv_engine(&self) -> Arc<RecvEngine> {
        self.recv.clone()
    }

    pub fn status(&self) -> Arc<StatusFlags> {
        self.status.clone()
    }

    pub fn system_status(&self) -> SystemStatus {
        if let Some(reason) = self
            .status
            .fatal
            .lock()
            .expect("fatal flag lock poisoned")
            .clone()
        {
            return SystemStatus::Fatal(reason);
        }
        if !self.status.is_running() {
            return SystemStatus::Stopped;
        }
        if !self.status.proxy_ready.load(Ordering::SeqCst) {
            return SystemStatus::ProxyDown;
        }
        if !self.status.listeners_ready.load(Ordering::SeqCst) {
            return SystemStatus::Starting;
        }
        SystemStatus::Ready
    }

    /// Bring the overlay up: wait for the proxy, bind P1-P4, spawn the
    /// pollers, resume outbox workers, start the background jobs.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.status.running.store(true, Ordering::SeqCst);

        self.wait_for_proxy().await;
        self.bind_listeners().await.context("bind listeners")?;
        self.send.resume().context("resume outbox workers")?;

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");

        let supervisor = self.clone();
        tasks.push(tokio::spawn(async move { supervisor.health_loop().await }));

        let supervisor = self.clone();
        tasks.push(tokio::spawn(
            async move { supervisor.retention_loop().await },
        ));

        log::info!("supervisor started");
        Ok(())
    }

    /// Stop listeners and pollers. Idempotent.
    pub async fn shutdown(&self) {
        self.status.running.store(false, Ordering::SeqCst);
        self.status.listeners_ready.store(false, Ordering::SeqCst);

        if let Some(listeners) = self
            .listeners
            .lock()
            .expect("listener slot lock poisoned")
            .take()
        {
            listeners.ping.stop();
            listeners.tap.stop();
            listeners.pong.stop();
            listeners.ack.stop();
        }

        for task in self
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        log::info!("supervisor stopped");
    }

    /// Broadcast a Tap to every contact with the configured gap, so
    /// peers holding undelivered messages for us re-Ping immediately.
    pub async fn tap_broadcast(&self) {
        let contacts = self.contacts.all();
        if contacts.is_empty() {
            return;
        }
        log::info!("tap broadcast to {} contacts", contacts.len());
        let gap = Duration::from_millis(self.config.timing.tap_gap_ms);

        for contact in contacts {
            let result: Result<(), crate::engine::EngineError> = async {
                let tap_id = *PingId::random().as_bytes();
                let sequence = sequences::next_send(&self.store, &contact.x25519_pub)?;
                let wire = build_tap(&self.identity, &contact.x25519_pub, &tap_id, sequence)?;
                let mut conn = self
                    .transport
                    .dial(&contact.messaging_onion, self.config.network.tap_port)
                    .await?;
                conn.send(&wire).await?;
                Ok(())
            }
            .await;

            if let Err(e) = result {
                log::debug!("tap to contact {} failed: {e}", contact.id);
            }
            tokio::time::sleep(gap).await;
        }
    }

    // ---- bring-up ----

    /// Block until the SOCKS proxy answers, with the reconnection
    /// backoff policy (initial 5 s, cap 60 s, minimum 3 s between
    /// attempts).
    async fn wait_for_proxy(&self) {
        let timing = &self.config.timing;
        let mut backoff = timing.reconnect_initial_secs.max(timing.reconnect_min_gap_secs);

        loop {
            if !self.status.is_running() {
                return;
            }
            if self.transport.probe_proxy().await {
                self.status.proxy_ready.store(true, Ordering::SeqCst);
                log::info!("proxy reachable");
                return;
            }
            self.status.proxy_ready.store(false, Ordering::SeqCst);
            log::warn!("proxy unreachable, retrying in {backoff}s");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(timing.reconnect_cap_secs);
        }
    }

    async fn bind_listeners(self: &Arc<Self>) -> anyhow::Result<()> {
        let n = &self.config.network;
        let first_byte_wait = Duration::from_secs(5);

        let listeners = Arc::new(Listeners {
            ping: Listener::bind(n.ping_port, self.transport.clone(), first_byte_wait).await?,
            tap: Listener::bind(n.tap_port, self.transport.clone(), first_byte_wait).await?,
            pong: Listener::bind(n.pong_port, self.transport.clone(), first_byte_wait).await?,
            ack: Listener::bind(n.ack_port, self.transport.clone(), first_byte_wait).await?,
        });

        let handles = self.recv.spawn_pollers(listeners.clone());
        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .extend(handles);

        *self.listeners.lock().expect("listener slot lock poisoned") = Some(listeners);
        self.status.listeners_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ---- health / reconnection ----

    /// Probe the proxy on a fixed cadence; after the configured number of
    /// consecutive failures inside the window, force a full restart of
    /// the overlay-facing parts.
    async fn health_loop(self: Arc<Self>) {
        let timing = &self.config.timing;
        let mut failures: Vec<i64> = Vec::new();

        while self.status.is_running() {
            tokio::time::sleep(Duration::from_secs(timing.probe_interval_secs)).await;

            if self.transport.probe_proxy().await {
                self.status.proxy_ready.store(true, Ordering::SeqCst);
                failures.clear();
                continue;
            }

            let now = now_ms();
            self.status.proxy_ready.store(false, Ordering::SeqCst);
            failures.push(now);
            let window_ms = (timing.probe_fail_window_secs * 1000) as i64;
            failures.retain(|t| now - t < window_ms);
            log::warn!("proxy probe failed ({} in window)", failures.len());

            if failures.len() >= timing.probe_fail_limit as usize {
                failures.clear();
                self.restart_overlay().await;
            }
        }
    }

    /// Tear down listeners, wait for the proxy to come back, re-bind,
    /// then announce ourselves to every contact with a Tap burst.
    async fn restart_overlay(self: &Arc<Self>) {
        log::warn!("forcing overlay restart");
        self.status.listeners_ready.store(false, Ordering::SeqCst);

        if let Some(listeners) = self
            .listeners
            .lock()
            .expect("listener slot lock poisoned")
            .take()
        {
            listeners.ping.stop();
            listeners.tap.stop();
            listeners.pong.stop();
            listeners.ack.stop();
        }

        self.wait_for_proxy().await;
        if !self.status.is_running() {
            return;
        }

        match self.bind_listeners().await {
            Ok(()) => {
                log::info!("overlay restarted");
                self.tap_broadcast().await;
            }
            Err(e) => {
                self.status
                    .record_fatal(format!("listener rebind failed: {e}"));
            }
        }
    }

    // ---- retention & watchdog jobs ----

    /// Periodic housekeeping: received-ids retention, inbox expiry and
    /// purge, stuck-download watchdog, session cleanup, parked-connection
    /// sweep, self-destruct reaping, FAILED_TEMP re-downloads.
    async fn retention_loop(self: Arc<Self>) {
        let tick = Duration::from_secs(30);

        while self.status.is_running() {
            tokio::time::sleep(tick).await;
            let now = now_ms();

            if let Err(e) = self.run_retention_pass(now).await {
                log::warn!("retention pass failed: {e}");
            }
        }
    }

    async fn run_retention_pass(self: &Arc<Self>, now: i64) -> anyhow::Result<()> {
        let ping_window = self.config.ping_retention_ms();
        let pong_window = self.config.pong_retention_ms();

        received::purge(&self.store, IdNamespace::Ping, now - ping_window)?;
        received::purge(&self.store, IdNamespace::Message, now - ping_window)?;
        received::purge(&self.store, IdNamespace::Pong, now - pong_window)?;

        // Expired Pings surface as "message expired".
        for (ping_id, contact_id) in inbox::expire_older_than(&self.store, now - ping_window, now)?
        {
            self.events.emit(Event::DownloadFailed {
                contact_id,
                ping_id: ping_id.to_hex(),
                reason: "message expired".into(),
            });
        }
        inbox::purge_older_than(&self.store, now - ping_window)?;

        // Watchdog of last resort: a row stuck in PONG_SENT past the
        // download budget (e.g. after a crash) fails over to the retry
        // path.
        let stuck_cutoff = now - (self.config.timing.download_timeout_secs * 1000) as i64;
        for row in inbox::failed_candidates_stuck_in_pong(&self.store, stuck_cutoff)? {
            log::warn!("download for {} stuck in PONG_SENT, failing", row.ping_id);
            inbox::fail_auto_download(
                &self.store,
                &row.ping_id,
                self.config.timing.max_auto_retries,
                now,
            )?;
        }

        // Auto-retry downloads that failed below budget.
        if self.config.timing.auto_download && self.status.overlay_ready() {
            for row in inbox::failed_temp(&self.store)? {
                let recv = self.recv.clone();
                let ping_id = row.ping_id;
                tokio::spawn(async move {
                    if let Err(e) = recv.download(&ping_id).await {
                        log::debug!("retry download for {ping_id}: {e}");
                    }
                });
            }
        }

        self.sessions.cleanup_expired(now, ping_window);
        durable_sessions::purge_older_than(&self.store, now - ping_window)?;
        outbox::reap_self_destructed(&self.store, now)?;
        self.transport.sweep_parked(Duration::from_secs(
            self.config.timing.parked_window_secs,
        ));

        Ok(())
    }
}
