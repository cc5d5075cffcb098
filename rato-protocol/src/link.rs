//! Link identity and quality metrics
//!
//! A link is one network interface on the field hardware. Its metrics come
//! from the Link Monitor on the field side and reach the relay through link
//! reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of network interface backing a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Cellular,
    Wifi,
    Ethernet,
    Satellite,
    Vpn,
    Unknown,
}

impl LinkKind {
    /// Classify an interface by its name
    pub fn classify(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let has = |prefixes: &[&str]| prefixes.iter().any(|p| name.contains(p));

        if has(&["starlink", "sat"]) {
            LinkKind::Satellite
        } else if has(&["wwan", "ppp", "usb", "cdc", "qmi", "rmnet"]) {
            LinkKind::Cellular
        } else if has(&["wlan", "wlp", "wifi", "ath"]) {
            LinkKind::Wifi
        } else if has(&["eth", "enp", "eno", "en0"]) {
            LinkKind::Ethernet
        } else if has(&["tun", "tap", "wg", "vti"]) {
            LinkKind::Vpn
        } else {
            LinkKind::Unknown
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkKind::Cellular => "cellular",
            LinkKind::Wifi => "wifi",
            LinkKind::Ethernet => "ethernet",
            LinkKind::Satellite => "satellite",
            LinkKind::Vpn => "vpn",
            LinkKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Link state as seen by the last probe cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Link is usable and within quality bounds
    Up,
    /// Link is usable but scoring below the degraded cut
    Degraded,
    /// Link is not usable this cycle
    Down,
}

impl LinkState {
    /// Up or degraded links still carry traffic
    #[inline]
    pub fn is_usable(self) -> bool {
        !matches!(self, LinkState::Down)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            LinkState::Up => 0,
            LinkState::Degraded => 1,
            LinkState::Down => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LinkState::Up),
            1 => Some(LinkState::Degraded),
            2 => Some(LinkState::Down),
            _ => None,
        }
    }
}

/// Quality metrics for one link
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkMetrics {
    /// Average round-trip time (milliseconds)
    pub rtt_ms: f64,
    /// RTT deviation (milliseconds)
    pub jitter_ms: f64,
    /// Packet loss ratio (0.0 to 1.0)
    pub loss_ratio: f64,
    /// Estimated throughput (kbit/s)
    pub est_bandwidth_kbps: f64,
}

impl LinkMetrics {
    /// Metrics for a link that did not answer at all
    pub fn unreachable() -> Self {
        LinkMetrics {
            loss_ratio: 1.0,
            ..LinkMetrics::default()
        }
    }

    /// Whether the probe got any reply
    pub fn is_reachable(&self) -> bool {
        self.loss_ratio < 1.0
    }

    /// Per-link quality score (0-100)
    ///
    /// Step penalties on RTT, jitter and loss. Loss weighs the most since it
    /// costs retransmissions on every bonded path.
    pub fn score(&self) -> u8 {
        let mut score: i32 = 100;

        if self.rtt_ms > 200.0 {
            score -= 40;
        } else if self.rtt_ms > 100.0 {
            score -= 25;
        } else if self.rtt_ms > 50.0 {
            score -= 10;
        }

        if self.jitter_ms > 50.0 {
            score -= 30;
        } else if self.jitter_ms > 20.0 {
            score -= 15;
        } else if self.jitter_ms > 10.0 {
            score -= 5;
        }

        let loss_pct = self.loss_ratio * 100.0;
        if loss_pct >= 10.0 {
            score -= 40;
        } else if loss_pct >= 5.0 {
            score -= 25;
        } else if loss_pct > 0.0 {
            score -= (loss_pct * 3.0) as i32;
        }

        score.clamp(0, 100) as u8
    }

    /// Derive the link state from these metrics
    pub fn state(&self, degraded_below: u8) -> LinkState {
        if !self.is_reachable() {
            LinkState::Down
        } else if self.score() < degraded_below {
            LinkState::Degraded
        } else {
            LinkState::Up
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_interfaces() {
        assert_eq!(LinkKind::classify("wwan0"), LinkKind::Cellular);
        assert_eq!(LinkKind::classify("usb0"), LinkKind::Cellular);
        assert_eq!(LinkKind::classify("wlan0"), LinkKind::Wifi);
        assert_eq!(LinkKind::classify("wlp3s0"), LinkKind::Wifi);
        assert_eq!(LinkKind::classify("eth0"), LinkKind::Ethernet);
        assert_eq!(LinkKind::classify("enp0s31f6"), LinkKind::Ethernet);
        assert_eq!(LinkKind::classify("starlink0"), LinkKind::Satellite);
        assert_eq!(LinkKind::classify("wg0"), LinkKind::Vpn);
        assert_eq!(LinkKind::classify("bond7"), LinkKind::Unknown);
    }

    #[test]
    fn test_perfect_link_scores_full() {
        let metrics = LinkMetrics {
            rtt_ms: 20.0,
            jitter_ms: 2.0,
            loss_ratio: 0.0,
            est_bandwidth_kbps: 5000.0,
        };
        assert_eq!(metrics.score(), 100);
        assert_eq!(metrics.state(50), LinkState::Up);
    }

    #[test]
    fn test_bad_link_penalties() {
        let metrics = LinkMetrics {
            rtt_ms: 250.0,
            jitter_ms: 60.0,
            loss_ratio: 0.12,
            est_bandwidth_kbps: 0.0,
        };
        // 100 - 40 - 30 - 40
        assert_eq!(metrics.score(), 0);
        assert_eq!(metrics.state(50), LinkState::Degraded);
    }

    #[test]
    fn test_small_loss_penalty() {
        let metrics = LinkMetrics {
            rtt_ms: 10.0,
            jitter_ms: 1.0,
            loss_ratio: 0.02,
            est_bandwidth_kbps: 0.0,
        };
        assert_eq!(metrics.score(), 94);
    }

    #[test]
    fn test_unreachable_is_down() {
        assert_eq!(LinkMetrics::unreachable().state(50), LinkState::Down);
    }

    #[test]
    fn test_state_byte_mapping() {
        for state in [LinkState::Up, LinkState::Degraded, LinkState::Down] {
            assert_eq!(LinkState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(LinkState::from_u8(9), None);
    }
}
