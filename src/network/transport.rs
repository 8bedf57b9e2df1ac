//! Transport adapter: dialing through the overlay proxy, the four local
//! listeners, and the parked-connection table for the instant path.
//!
//! Connections are half-duplex request/response: the dialer writes one
//! frame in a single burst, may read one reply frame, then closes. There
//! is no length prefix on the wire, so a frame is delimited by write
//! quiescence: the reader aggregates chunks until the stream goes idle.
//!
//! A connection is owned by whoever dialed or accepted it; ownership
//! moves between engines only through the parked-connection table keyed
//! by [`ConnId`]. No lock is ever held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::socks;
use crate::config::Config;

/// Gap of silence that ends a frame read.
const READ_IDLE_GAP: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socks error: {0}")]
    Socks(#[from] socks::SocksError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown connection id {0}")]
    UnknownConnection(u64),
    #[error("frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Handle to a parked connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An open connection to (or from) a peer.
pub struct Connection {
    stream: TcpStream,
    /// Onion address for dialed connections, proxy address for accepted.
    pub peer: String,
    pub opened_at: Instant,
}

impl Connection {
    fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            stream,
            peer,
            opened_at: Instant::now(),
        }
    }

    /// Write one frame in a single burst.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one frame: wait up to `first_byte_wait` for data, then
    /// aggregate chunks until the stream idles or `max_bytes` is hit.
    /// Returns an empty vec when nothing arrived in time.
    pub async fn recv(&mut self, max_bytes: usize, first_byte_wait: Duration) -> Result<Vec<u8>> {
        let mut frame = Vec::new();
        let mut chunk = [0u8; 4096];

        match timeout(first_byte_wait, self.stream.read(&mut chunk)).await {
            Err(_) => return Ok(frame),
            Ok(Ok(0)) => return Ok(frame),
            Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }

        loop {
            if frame.len() > max_bytes {
                return Err(TransportError::FrameTooLarge(max_bytes));
            }
            match timeout(READ_IDLE_GAP, self.stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
            }
        }

        Ok(frame)
    }

    /// Transport-level liveness probe. Never compares timestamps: peeks
    /// the socket and treats EOF or a hard error as dead.
    pub async fn is_alive(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match timeout(Duration::from_millis(20), self.stream.peek(&mut probe)).await {
            Ok(Ok(0)) => false,     // peer closed
            Ok(Ok(_)) => true,      // reply bytes already waiting
            Ok(Err(_)) => false,    // socket error
            Err(_) => true,         // quiet but open
        }
    }

    /// Close by dropping the stream.
    pub fn close(self) {}
}

/// Dialer plus the parked-connection table.
pub struct Transport {
    socks_host: String,
    socks_port: u16,
    dial_timeout: Duration,
    max_frame_bytes: usize,
    parked: Mutex<HashMap<u64, Connection>>,
    next_id: AtomicU64,
}

impl Transport {
    pub fn new(config: &Config) -> Self {
        Self {
            socks_host: config.network.socks_host.clone(),
            socks_port: config.network.socks_port,
            dial_timeout: config.dial_timeout(),
            max_frame_bytes: config.network.max_frame_bytes,
            parked: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Dial a hidden service through the proxy.
    pub async fn dial(&self, onion_address: &str, port: u16) -> Result<Connection> {
        let stream = socks::connect(
            &self.socks_host,
            self.socks_port,
            onion_address,
            port,
            self.dial_timeout,
        )
        .await?;
        Ok(Connection::new(stream, onion_address.to_string()))
    }

    /// Check the proxy is reachable.
    pub async fn probe_proxy(&self) -> bool {
        socks::probe(&self.socks_host, self.socks_port, Duration::from_secs(5)).await
    }

    /// Park a connection for later pickup (instant-path reply window).
    pub fn park(&self, conn: Connection) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.parked
            .lock()
            .expect("parked connections lock poisoned")
            .insert(id, conn);
        ConnId(id)
    }

    /// Take exclusive ownership of a parked connection.
    pub fn take(&self, id: ConnId) -> Option<Connection> {
        self.parked
            .lock()
            .expect("parked connections lock poisoned")
            .remove(&id.0)
    }

    /// Drop a parked connection without using it.
    pub fn drop_parked(&self, id: ConnId) {
        self.take(id);
    }

    /// Evict parked connections older than the reply window.
    pub fn sweep_parked(&self, max_age: Duration) -> usize {
        let mut parked = self
            .parked
            .lock()
            .expect("parked connections lock poisoned");
        let before = parked.len();
        parked.retain(|_, conn| conn.opened_at.elapsed() < max_age);
        before - parked.len()
    }
}

/// One of the four local listeners (P1-P4). Inbound frames surface via
/// the non-blocking [`Listener::poll`]; the connection itself is parked
/// for a bounded reply window.
pub struct Listener {
    pub port: u16,
    rx: Mutex<mpsc::UnboundedReceiver<(ConnId, Vec<u8>)>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Listener {
    /// Bind a loopback listener and start its accept loop.
    pub async fn bind(
        port: u16,
        transport: std::sync::Arc<Transport>,
        first_byte_wait: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let bound_port = listener.local_addr()?.port();
        log::info!("listener started on 127.0.0.1:{bound_port}");

        let (tx, rx) = mpsc::unbounded_channel();
        let max_frame = transport.max_frame_bytes();

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let tx = tx.clone();
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            let mut conn = Connection::new(stream, peer_addr.to_string());
                            match conn.recv(max_frame, first_byte_wait).await {
                                Ok(frame) if !frame.is_empty() => {
                                    let conn_id = transport.park(conn);
                                    if tx.send((conn_id, frame)).is_err() {
                                        transport.drop_parked(conn_id);
                                    }
                                }
                                Ok(_) => {
                                    log::debug!("connection from {peer_addr} sent no frame");
                                }
                                Err(e) => {
                                    log::debug!("read error from {peer_addr}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("accept error on port {bound_port}: {e}");
                    }
                }
            }
        });

        Ok(Self {
            port: bound_port,
            rx: Mutex::new(rx),
            handle,
        })
    }

    /// Non-blocking poll for the next inbound frame.
    pub fn poll(&self) -> Option<(ConnId, Vec<u8>)> {
        self.rx
            .lock()
            .expect("listener channel lock poisoned")
            .try_recv()
            .ok()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
