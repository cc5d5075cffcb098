//! In-band link reports
//!
//! The field agent sends a link report frame each probe cycle so the relay
//! can score health from the field's own view of every link.

use crate::frame::FrameError;
use crate::link::{LinkMetrics, LinkState};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoded size of one entry
pub const REPORT_ENTRY_SIZE: usize = 18;

/// Quality of one link at report time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkReportEntry {
    /// Link index within the run
    pub link_id: u8,
    /// Link state
    pub state: LinkState,
    /// Link metrics
    pub metrics: LinkMetrics,
}

/// Report covering every link known to the field agent
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LinkReport {
    pub entries: Vec<LinkReportEntry>,
}

impl LinkReport {
    pub fn new(entries: Vec<LinkReportEntry>) -> Self {
        LinkReport { entries }
    }

    /// Serialize the report payload
    pub fn encode(&self) -> Bytes {
        let count = self.entries.len().min(u8::MAX as usize);
        let mut buf = BytesMut::with_capacity(1 + count * REPORT_ENTRY_SIZE);
        buf.put_u8(count as u8);

        for entry in self.entries.iter().take(count) {
            buf.put_u8(entry.link_id);
            buf.put_u8(entry.state.as_u8());
            buf.put_f32(entry.metrics.rtt_ms as f32);
            buf.put_f32(entry.metrics.jitter_ms as f32);
            buf.put_f32(entry.metrics.loss_ratio as f32);
            buf.put_f32(entry.metrics.est_bandwidth_kbps as f32);
        }

        buf.freeze()
    }

    /// Parse a report payload
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut buf = bytes;
        if buf.remaining() < 1 {
            return Err(FrameError::MalformedReport);
        }

        let count = buf.get_u8() as usize;
        if buf.remaining() != count * REPORT_ENTRY_SIZE {
            return Err(FrameError::MalformedReport);
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let link_id = buf.get_u8();
            let state = LinkState::from_u8(buf.get_u8()).ok_or(FrameError::MalformedReport)?;
            let metrics = LinkMetrics {
                rtt_ms: buf.get_f32() as f64,
                jitter_ms: buf.get_f32() as f64,
                loss_ratio: (buf.get_f32() as f64).clamp(0.0, 1.0),
                est_bandwidth_kbps: buf.get_f32() as f64,
            };
            entries.push(LinkReportEntry {
                link_id,
                state,
                metrics,
            });
        }

        Ok(LinkReport { entries })
    }

    /// Entries whose link is still usable
    pub fn usable(&self) -> impl Iterator<Item = &LinkReportEntry> {
        self.entries.iter().filter(|e| e.state.is_usable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(link_id: u8, state: LinkState, rtt: f64) -> LinkReportEntry {
        LinkReportEntry {
            link_id,
            state,
            metrics: LinkMetrics {
                rtt_ms: rtt,
                jitter_ms: 4.0,
                loss_ratio: 0.25,
                est_bandwidth_kbps: 3000.0,
            },
        }
    }

    #[test]
    fn test_report_encoding() {
        let report = LinkReport::new(vec![
            entry(0, LinkState::Up, 40.0),
            entry(1, LinkState::Down, 0.0),
        ]);
        let bytes = report.encode();
        assert_eq!(bytes.len(), 1 + 2 * REPORT_ENTRY_SIZE);

        let decoded = LinkReport::decode(&bytes).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.usable().count(), 1);
    }

    #[test]
    fn test_truncated_report() {
        let bytes = LinkReport::new(vec![entry(0, LinkState::Up, 40.0)]).encode();
        assert_eq!(
            LinkReport::decode(&bytes[..bytes.len() - 1]),
            Err(FrameError::MalformedReport)
        );
        assert_eq!(LinkReport::decode(&[]), Err(FrameError::MalformedReport));
    }

    #[test]
    fn test_unknown_state_byte() {
        let mut bytes = LinkReport::new(vec![entry(0, LinkState::Up, 40.0)])
            .encode()
            .to_vec();
        bytes[2] = 7;
        assert_eq!(LinkReport::decode(&bytes), Err(FrameError::MalformedReport));
    }
}
