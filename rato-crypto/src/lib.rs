//! RatoNet Frame Authentication
//!
//! Signs native multi-link frames with HMAC-SHA256 keyed by the streamer
//! secret, so the relay only accepts traffic from registered streamers.

pub mod auth;

pub use auth::{derive_run_id, AuthError, FrameKey};
