//! HMAC frame authentication

use rato_protocol::{FrameAuth, TAG_SIZE};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac};
use std::fmt;
use thiserror::Error;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("System random source unavailable")]
    Random,
}

/// Per-streamer frame key
///
/// The HMAC key is derived from the streamer id and its secret. An empty
/// secret still binds frames to the streamer id, which gives integrity but
/// no authenticity.
#[derive(Clone)]
pub struct FrameKey {
    key: hmac::Key,
}

impl FrameKey {
    /// Derive the key for a streamer
    pub fn new(streamer_id: &str, secret: &str) -> Self {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(b"ratonet-frame-v1");
        ctx.update(streamer_id.as_bytes());
        ctx.update(&[0u8]);
        ctx.update(secret.as_bytes());
        let material = ctx.finish();

        FrameKey {
            key: hmac::Key::new(hmac::HMAC_SHA256, material.as_ref()),
        }
    }
}

impl fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameKey(***)")
    }
}

impl FrameAuth for FrameKey {
    fn sign(&self, data: &[u8]) -> [u8; TAG_SIZE] {
        let tag = hmac::sign(&self.key, data);
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_ref());
        out
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        hmac::verify(&self.key, data, tag).is_ok()
    }
}

/// Draw a random run id for a field agent run
pub fn derive_run_id() -> Result<u32, AuthError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 4];
    rng.fill(&mut bytes).map_err(|_| AuthError::Random)?;
    Ok(u32::from_be_bytes(bytes))
}
