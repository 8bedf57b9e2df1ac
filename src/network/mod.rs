pub mod onion;
pub mod sessions;
pub mod socks;
pub mod transport;

pub use onion::{onion_address_from_ed25519, validate_onion_address};
pub use sessions::{PingSession, PingSessionStore};
pub use socks::SocksError;
pub use transport::{ConnId, Connection, Listener, Transport, TransportError};
