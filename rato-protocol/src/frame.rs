//! Native Multi-Link Frame Format
//!
//! Every datagram sent in native multi-link mode is a frame: an 18-byte fixed
//! header, the streamer id, the payload, and a 32-byte authentication tag.
//! The same media frame is sent once per up link with the same sequence
//! number; the receiver deduplicates on `seq`.
//!
//! ```text
//!  0               1               2               3
//! +-------------------------------+---------------+---------------+
//! |            magic              |    version    |     kind      |
//! +---------------+---------------+---------------+---------------+
//! |    link_id    |    id_len     |            run_id ...         |
//! +---------------+---------------+-------------------------------+
//! |        ... run_id             |             seq ...           |
//! +-------------------------------+-------------------------------+
//! |                          ... seq ...                          |
//! +-------------------------------+-------------------------------+
//! |        ... seq                |  streamer id | payload | tag  |
//! +-------------------------------+-------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame magic ("RB")
pub const FRAME_MAGIC: u16 = 0x5242;

/// Current frame version
pub const FRAME_VERSION: u8 = 1;

/// Size of the fixed part of the header
pub const FIXED_HEADER_SIZE: usize = 18;

/// Size of the authentication tag (HMAC-SHA256)
pub const TAG_SIZE: usize = 32;

/// Longest streamer id carried in a frame
pub const MAX_STREAMER_ID_LEN: usize = 64;

/// Frame errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Bad frame magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid streamer id")]
    InvalidStreamerId,

    #[error("Frame authentication failed")]
    BadTag,

    #[error("Malformed link report")]
    MalformedReport,
}

/// Kind of frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Media payload from the encoder
    Media = 0,
    /// Link quality report from the field agent
    LinkReport = 1,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Media),
            1 => Some(FrameKind::LinkReport),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Signs and verifies frames
///
/// Implemented by `rato-crypto`; the protocol layer stays independent of the
/// MAC primitive.
pub trait FrameAuth {
    /// Compute the tag over `data`
    fn sign(&self, data: &[u8]) -> [u8; TAG_SIZE];

    /// Check `tag` against `data`
    fn verify(&self, data: &[u8], tag: &[u8]) -> bool;
}

/// All-zero tags, for benchmarks and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuth;

impl FrameAuth for NullAuth {
    fn sign(&self, _data: &[u8]) -> [u8; TAG_SIZE] {
        [0u8; TAG_SIZE]
    }

    fn verify(&self, _data: &[u8], tag: &[u8]) -> bool {
        tag.len() == TAG_SIZE && tag.iter().all(|b| *b == 0)
    }
}

/// Fixed header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind
    pub kind: FrameKind,
    /// Index of the sending link within the run
    pub link_id: u8,
    /// Random id of the field agent run
    pub run_id: u32,
    /// Media sequence number
    pub seq: u64,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fixed header
    pub header: FrameHeader,
    /// Streamer the frame belongs to
    pub streamer_id: String,
    /// Media bytes or an encoded link report
    pub payload: Bytes,
}

impl Frame {
    /// Create a media frame
    pub fn media(
        streamer_id: impl Into<String>,
        run_id: u32,
        link_id: u8,
        seq: u64,
        payload: Bytes,
    ) -> Self {
        Frame {
            header: FrameHeader {
                kind: FrameKind::Media,
                link_id,
                run_id,
                seq,
            },
            streamer_id: streamer_id.into(),
            payload,
        }
    }

    /// Create a link report frame
    pub fn link_report(
        streamer_id: impl Into<String>,
        run_id: u32,
        link_id: u8,
        last_seq: u64,
        payload: Bytes,
    ) -> Self {
        Frame {
            header: FrameHeader {
                kind: FrameKind::LinkReport,
                link_id,
                run_id,
                seq: last_seq,
            },
            streamer_id: streamer_id.into(),
            payload,
        }
    }

    /// Size on the wire
    pub fn size(&self) -> usize {
        FIXED_HEADER_SIZE + self.streamer_id.len() + self.payload.len() + TAG_SIZE
    }

    /// Serialize and sign the frame
    pub fn to_bytes(&self, auth: &impl FrameAuth) -> Result<BytesMut, FrameError> {
        let id = self.streamer_id.as_bytes();
        if id.is_empty() || id.len() > MAX_STREAMER_ID_LEN {
            return Err(FrameError::InvalidStreamerId);
        }

        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.header.kind.as_u8());
        buf.put_u8(self.header.link_id);
        buf.put_u8(id.len() as u8);
        buf.put_u32(self.header.run_id);
        buf.put_u64(self.header.seq);
        buf.put_slice(id);
        buf.put_slice(&self.payload);

        let tag = auth.sign(&buf);
        buf.put_slice(&tag);
        Ok(buf)
    }

    /// Parse and verify a frame
    pub fn from_bytes(bytes: &[u8], auth: &impl FrameAuth) -> Result<Self, FrameError> {
        let minimum = FIXED_HEADER_SIZE + 1 + TAG_SIZE;
        if bytes.len() < minimum {
            return Err(FrameError::InsufficientData {
                expected: minimum,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..FIXED_HEADER_SIZE];
        let magic = buf.get_u16();
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw_kind = buf.get_u8();
        let kind = FrameKind::from_u8(raw_kind).ok_or(FrameError::UnknownKind(raw_kind))?;
        let link_id = buf.get_u8();
        let id_len = buf.get_u8() as usize;
        let run_id = buf.get_u32();
        let seq = buf.get_u64();

        if id_len == 0 || id_len > MAX_STREAMER_ID_LEN {
            return Err(FrameError::InvalidStreamerId);
        }
        let signed_len = bytes.len() - TAG_SIZE;
        if FIXED_HEADER_SIZE + id_len > signed_len {
            return Err(FrameError::InsufficientData {
                expected: FIXED_HEADER_SIZE + id_len + TAG_SIZE,
                actual: bytes.len(),
            });
        }

        let (signed, tag) = bytes.split_at(signed_len);
        if !auth.verify(signed, tag) {
            return Err(FrameError::BadTag);
        }

        let id_end = FIXED_HEADER_SIZE + id_len;
        let streamer_id = std::str::from_utf8(&signed[FIXED_HEADER_SIZE..id_end])
            .map_err(|_| FrameError::InvalidStreamerId)?
            .to_string();

        Ok(Frame {
            header: FrameHeader {
                kind,
                link_id,
                run_id,
                seq,
            },
            streamer_id,
            payload: Bytes::copy_from_slice(&signed[id_end..]),
        })
    }
}
