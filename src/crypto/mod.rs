pub mod constant_time;
pub mod identity;
pub mod session;

pub use constant_time::{eq_24, eq_32, eq_slices};
pub use identity::{x25519_public_of, Identity, IdentityError};
pub use session::{
    derive_session_key, open_body, seal_body, wipe_key, SessionError, BODY_OVERHEAD, BODY_VERSION,
};
