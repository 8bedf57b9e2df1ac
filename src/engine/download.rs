//! Receiver-initiated download: pull the payload a Ping announced.
//!
//! One watchdog task per download is the sole timeout authority: it is
//! started when DOWNLOAD_QUEUED is entered, fires at the configured
//! budget (45 s), and sets a shared flag the poll loop checks. The poll
//! loop itself never measures time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::engine::events::Event;
use crate::engine::recv::RecvEngine;
use crate::engine::{now_ms, EngineError};
use crate::network::sessions::PingSession;
use crate::protocol::envelope::{build_pong, open_message, open_ping};
use crate::protocol::wire::{normalize_wire_bytes, PingId, WireType};
use crate::storage::inbox::{self, InboxState};
use crate::storage::{get_message_by_ping, sequences};

/// Poll cadence while waiting for the payload.
const DOWNLOAD_POLL: Duration = Duration::from_secs(1);

impl RecvEngine {
    /// Download the message behind an accepted Ping.
    ///
    /// Idempotent: after MSG_STORED the only side effect is re-emitting
    /// MESSAGE_ACK. Fails with user-actionable errors for the two
    /// surfaced cases (expiry and watchdog timeout); everything else is
    /// retried through the FAILED_TEMP path.
    pub async fn download(self: &Arc<Self>, ping_id: &PingId) -> Result<(), EngineError> {
        // Pre-flight: the overlay must be up before any claim is made.
        if !self.status.overlay_ready() {
            return Err(EngineError::OverlayUnavailable);
        }

        let row = inbox::get(self.store(), ping_id)?;

        if row.state == InboxState::MsgStored {
            // Re-download after completion: just re-ack.
            if let Some(message) = get_message_by_ping(self.store(), ping_id)? {
                if let Some(contact) = self.contacts().get(row.contact_id) {
                    self.spawn_message_ack(contact, message.message_id.as_str().to_string());
                }
            }
            return Ok(());
        }

        if !inbox::claim_download(self.store(), ping_id, now_ms())? {
            // Another download owns it, or manual action is required.
            log::debug!("ping {ping_id} not claimable for download");
            return Ok(());
        }

        match self.run_download(ping_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The watchdog path has already recorded its own failure.
                if !matches!(e, EngineError::DownloadTimedOut | EngineError::PingExpired) {
                    self.record_download_failure(ping_id, &e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn run_download(self: &Arc<Self>, ping_id: &PingId) -> Result<(), EngineError> {
        let row = inbox::get(self.store(), ping_id)?;
        let session = self.restore_session(ping_id, &row)?;

        let contact = self
            .contacts()
            .get(row.contact_id)
            .ok_or(EngineError::UnknownContact(row.contact_id))?;

        // Expired Pings are never answered.
        let age_ms = now_ms() - session.timestamp_ms;
        if age_ms > self.config().ping_retention_ms() {
            inbox::mark_manual_required(self.store(), ping_id, now_ms())?;
            self.events().emit(Event::DownloadFailed {
                contact_id: row.contact_id,
                ping_id: ping_id.to_hex(),
                reason: "message expired".into(),
            });
            return Err(EngineError::PingExpired);
        }

        // Sole timeout authority for this download.
        let expired = Arc::new(AtomicBool::new(false));
        {
            let expired = expired.clone();
            let budget = self.config().download_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                expired.store(true, Ordering::SeqCst);
            });
        }

        let sequence = sequences::next_send(self.store(), &session.sender_x25519)?;
        let pong = build_pong(
            self.identity(),
            &session.sender_x25519,
            ping_id,
            true,
            sequence,
        )?;

        // Instant path: answer on the connection the Ping arrived on, if
        // it is still parked and alive. Otherwise post the Pong to the
        // sender's Pong listener (deferred path).
        let mut instant_conn = None;
        if let Some(conn_id) = self.sessions.take_conn(ping_id) {
            if let Some(mut conn) = self.transport().take(conn_id) {
                if conn.is_alive().await {
                    log::debug!("download {ping_id}: instant path on {conn_id}");
                    conn.send(&pong).await?;
                    instant_conn = Some(conn);
                }
            }
        }
        if instant_conn.is_none() {
            let mut conn = self
                .transport()
                .dial(&contact.messaging_onion, self.config().network.pong_port)
                .await?;
            conn.send(&pong).await?;
            log::debug!("download {ping_id}: pong posted, awaiting payload");
        }
        inbox::mark_pong_sent(self.store(), ping_id, now_ms())?;

        // Wait for the payload: on the held connection when we have one,
        // via the messaging listener either way. The watchdog flag is the
        // only exit besides success.
        while !expired.load(Ordering::SeqCst) {
            if inbox::get(self.store(), ping_id)?.state == InboxState::MsgStored {
                break;
            }

            let mut lost_conn = false;
            match instant_conn.as_mut() {
                Some(conn) => match conn
                    .recv(self.transport().max_frame_bytes(), DOWNLOAD_POLL)
                    .await
                {
                    Ok(blob) if !blob.is_empty() => {
                        if let Ok(message) = open_message(&blob, self.identity()) {
                            self.process_message(message).await;
                        }
                    }
                    Ok(_) => {
                        if !conn.is_alive().await {
                            lost_conn = true;
                        }
                    }
                    Err(_) => lost_conn = true,
                },
                None => tokio::time::sleep(DOWNLOAD_POLL).await,
            }
            if lost_conn {
                log::debug!("download {ping_id}: instant connection gone, listener path");
                instant_conn = None;
            }
        }

        self.finish_download(ping_id, &expired).await
    }

    /// Resolve the download's end state once the wait loop exits.
    async fn finish_download(
        self: &Arc<Self>,
        ping_id: &PingId,
        expired: &AtomicBool,
    ) -> Result<(), EngineError> {
        let state = inbox::get(self.store(), ping_id)?.state;
        if state == InboxState::MsgStored {
            return Ok(());
        }

        if expired.load(Ordering::SeqCst) {
            self.record_download_failure(ping_id, "download timed out — retry");
            return Err(EngineError::DownloadTimedOut);
        }

        // Connection produced no payload but the budget is not spent;
        // count it as a failed attempt so the retry path can reclaim.
        self.record_download_failure(ping_id, "no payload received");
        Err(EngineError::DownloadFailed)
    }

    fn record_download_failure(self: &Arc<Self>, ping_id: &PingId, reason: &str) {
        let contact_id = match inbox::fail_auto_download(
            self.store(),
            ping_id,
            self.config().timing.max_auto_retries,
            now_ms(),
        ) {
            Ok(_) => inbox::get(self.store(), ping_id)
                .map(|r| r.contact_id)
                .unwrap_or_default(),
            Err(e) => {
                log::error!("fail_auto_download for {ping_id}: {e}");
                return;
            }
        };

        log::info!("download {ping_id} failed: {reason}");
        self.events().emit(Event::DownloadFailed {
            contact_id,
            ping_id: ping_id.to_hex(),
            reason: reason.to_string(),
        });
    }

    /// Session material for the download: the live map when present,
    /// otherwise reopened from the inbox row's cached wire bytes.
    fn restore_session(
        self: &Arc<Self>,
        ping_id: &PingId,
        row: &inbox::InboxRow,
    ) -> Result<PingSession, EngineError> {
        if let Some(session) = self.sessions.get(ping_id) {
            if session.session_key != [0u8; 32] {
                return Ok(session);
            }
        }

        let wire_b64 = row
            .wire_bytes
            .as_deref()
            .ok_or(EngineError::MissingWireBytes)?;
        let wire = BASE64
            .decode(wire_b64)
            .map_err(|_| EngineError::MissingWireBytes)?;

        let canonical = normalize_wire_bytes(WireType::Ping, &wire);
        let ping = open_ping(&canonical, self.identity())?;
        let session_key = crate::crypto::derive_session_key(
            self.identity().agreement_secret(),
            &ping.sender_x25519,
        )?;

        let session = PingSession {
            ping_id: *ping_id,
            contact_id: row.contact_id,
            sender_x25519: ping.sender_x25519,
            timestamp_ms: ping.timestamp_ms,
            wire_bytes: canonical,
            session_key,
            received_ms: row.first_seen_ms,
            conn_id: None,
        };
        self.sessions.insert(session.clone());
        Ok(session)
    }

}
