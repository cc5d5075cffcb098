//! Status display and formatting

use rato_bonding::BondingStatus;
use rato_relay::SessionStatus;
use std::fmt::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a kbit/s estimate in human-readable form
pub fn format_bandwidth(kbps: f64) -> String {
    if !kbps.is_finite() || kbps <= 0.0 {
        "-".to_string()
    } else if kbps >= 1_000_000.0 {
        format!("{:.2} Gbps", kbps / 1_000_000.0)
    } else if kbps >= 1_000.0 {
        format!("{:.2} Mbps", kbps / 1_000.0)
    } else {
        format!("{:.0} Kbps", kbps)
    }
}

/// Format duration in human-readable form
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Render the field agent status as a table
pub fn render_bonding_status(status: &BondingStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "┌──────────────────────────────────────────────────────────────┐");
    let _ = writeln!(
        out,
        "│ BONDING  {:<10} mode: {:<12}                          ",
        status.lifecycle,
        status.mode.unwrap_or("-")
    );
    if let Some(failure) = &status.last_failure {
        let _ = writeln!(out, "│ last failure: {}", failure);
    }
    let _ = writeln!(out, "├──────────┬───────────┬──────────┬───────┬─────────┬──────────┤");
    let _ = writeln!(out, "│ link     │ kind      │ state    │ score │ rtt     │ bandwidth│");
    for link in &status.links {
        let marker = if link.member { "*" } else { " " };
        let _ = writeln!(
            out,
            "│{}{:<9}│ {:<10}│ {:<9}│ {:>5} │ {:>5.0}ms │ {:>9}│",
            marker,
            link.name,
            link.kind.to_string(),
            format!("{:?}", link.state),
            link.score,
            link.metrics.rtt_ms,
            format_bandwidth(link.metrics.est_bandwidth_kbps)
        );
    }
    let _ = writeln!(out, "└──────────┴───────────┴──────────┴───────┴─────────┴──────────┘");
    out
}

/// Display the field agent status
pub fn display_bonding_status(status: &BondingStatus) {
    print!("{}", render_bonding_status(status));
}

/// Render one line per session plus one per destination
///
/// Destinations only ever appear in their masked form.
pub fn render_sessions(sessions: &[SessionStatus]) -> String {
    let mut out = String::new();
    if sessions.is_empty() {
        out.push_str("no active sessions\n");
        return out;
    }
    for session in sessions {
        let _ = writeln!(
            out,
            "{} port={} mode={} receive={} health={}({}) scene={} delivered={} rejected={} lost={} dup={}",
            session.streamer_id,
            session.port,
            session.mode,
            session.receive_state,
            session.health.state,
            session.health.score,
            session.scene.map_or_else(|| "-".to_string(), |s| s.to_string()),
            format_bytes(session.bytes_delivered),
            session.frames_rejected,
            session.reorder.frames_lost,
            session.reorder.duplicates_dropped,
        );
        for relay in &session.relays {
            let _ = write!(
                out,
                "  -> {} {} {} restarts={}",
                relay.platform, relay.target_masked, relay.state, relay.restarts
            );
            if let Some(exit) = &relay.last_exit {
                let _ = write!(out, " last_exit={:?}", exit);
            }
            out.push('\n');
        }
    }
    out
}

/// Display relay session status
pub fn display_sessions(sessions: &[SessionStatus]) {
    print!("{}", render_sessions(sessions));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rato_bonding::ReorderStats;
    use rato_relay::{
        HealthState, HealthSummary, IngestMode, ReceiveState, RelayProcessState,
        RelayProcessStatus, Scene,
    };

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(0.0), "-");
        assert_eq!(format_bandwidth(850.0), "850 Kbps");
        assert_eq!(format_bandwidth(4_500.0), "4.50 Mbps");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 02m 05s");
    }

    #[test]
    fn test_render_sessions_masks_targets() {
        let sessions = vec![SessionStatus {
            streamer_id: "field-1".to_string(),
            generation: 1,
            port: 9000,
            mode: IngestMode::Native,
            receive_state: ReceiveState::Live,
            ever_live: true,
            health: HealthSummary {
                score: 82,
                state: HealthState::Healthy,
            },
            scene: Some(Scene::Live),
            relays: vec![RelayProcessStatus {
                platform: "youtube".to_string(),
                target_masked: "rtmp://a.rtmp.youtube.com/***".to_string(),
                state: RelayProcessState::Running,
                restarts: 0,
                last_exit: None,
            }],
            frames_rejected: 0,
            bytes_delivered: 4096,
            reorder: ReorderStats {
                frames_lost: 2,
                duplicates_dropped: 40,
                ..Default::default()
            },
        }];

        let text = render_sessions(&sessions);
        assert!(text.contains("field-1 port=9000"));
        assert!(text.contains("lost=2 dup=40"));
        assert!(text.contains("rtmp://a.rtmp.youtube.com/***"));
        assert_eq!(render_sessions(&[]), "no active sessions\n");
    }
}
