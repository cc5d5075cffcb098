//! Link Monitor
//!
//! Discovers network interfaces, probes each one on a fixed period and
//! publishes the samples as [`LinkEvent`]s. The monitor only measures; the
//! bonding engine decides membership.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rato_io::run_with_timeout;
use rato_protocol::{LinkKind, LinkMetrics, LinkState};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Probe errors
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Failed to run probe: {0}")]
    Spawn(#[from] io::Error),

    #[error("Unrecognized probe output")]
    Unparseable,
}

/// Measures the quality of one interface
pub trait LinkProbe: Send + Sync {
    /// Probe `interface`, returning within `timeout`
    fn probe(&self, interface: &str, timeout: Duration) -> Result<LinkMetrics, ProbeError>;
}

/// ICMP probe through the system `ping`
#[derive(Debug, Clone)]
pub struct PingProbe {
    /// Address pinged through every link
    pub target: String,
    /// Echo requests per probe
    pub count: u32,
}

impl Default for PingProbe {
    fn default() -> Self {
        PingProbe {
            target: "8.8.8.8".to_string(),
            count: 3,
        }
    }
}

impl LinkProbe for PingProbe {
    fn probe(&self, interface: &str, timeout: Duration) -> Result<LinkMetrics, ProbeError> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut command = Command::new("ping");
        command
            .arg("-c")
            .arg(self.count.to_string())
            .args(["-i", "0.2", "-W"])
            .arg(&wait_secs)
            .arg("-I")
            .arg(interface)
            .arg(&self.target);

        let output = run_with_timeout(&mut command, timeout)?.ok_or(ProbeError::Timeout)?;
        parse_ping_output(&output.stdout).ok_or(ProbeError::Unparseable)
    }
}

/// Extract loss, RTT and jitter from `ping` output
///
/// Understands both the iputils (`rtt min/avg/max/mdev`) and BSD
/// (`round-trip min/avg/max/stddev`) summary lines. Output without a loss
/// line is rejected.
pub fn parse_ping_output(output: &str) -> Option<LinkMetrics> {
    let mut metrics = LinkMetrics::unreachable();
    let mut saw_loss = false;

    for line in output.lines() {
        if let Some(idx) = line.find("% packet loss") {
            let number = line[..idx]
                .rsplit(|c: char| !(c.is_ascii_digit() || c == '.'))
                .next()?;
            let pct: f64 = number.parse().ok()?;
            metrics.loss_ratio = (pct / 100.0).clamp(0.0, 1.0);
            saw_loss = true;
        }

        let line = line.trim_start();
        if line.starts_with("rtt ") || line.starts_with("round-trip ") {
            let values = line.split('=').nth(1)?.trim();
            let values = values.split_whitespace().next()?;
            let parts: Vec<f64> = values
                .split('/')
                .map(str::parse)
                .collect::<Result<_, _>>()
                .ok()?;
            if parts.len() == 4 {
                metrics.rtt_ms = parts[1];
                metrics.jitter_ms = parts[3];
            }
        }
    }

    saw_loss.then_some(metrics)
}

/// Lists candidate interfaces and their traffic counters
pub trait InterfaceSource: Send + Sync {
    /// Names of interfaces that can carry a link right now
    fn list(&self) -> Vec<String>;

    /// Total bytes moved through `interface` (tx + rx)
    fn byte_count(&self, interface: &str) -> Option<u64>;
}

/// Interfaces read from `/sys/class/net`
#[derive(Debug, Clone)]
pub struct SysfsInterfaces {
    root: PathBuf,
    forced: Vec<String>,
    max_links: usize,
}

impl SysfsInterfaces {
    pub fn new(forced: Vec<String>, max_links: usize) -> Self {
        Self::with_root("/sys/class/net", forced, max_links)
    }

    /// Read interfaces from a different sysfs root
    pub fn with_root(root: impl Into<PathBuf>, forced: Vec<String>, max_links: usize) -> Self {
        SysfsInterfaces {
            root: root.into(),
            forced,
            max_links,
        }
    }

    fn read_counter(&self, interface: &str, counter: &str) -> Option<u64> {
        let path = self
            .root
            .join(interface)
            .join("statistics")
            .join(counter);
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl InterfaceSource for SysfsInterfaces {
    fn list(&self) -> Vec<String> {
        if !self.forced.is_empty() {
            return self.forced.iter().take(self.max_links).cloned().collect();
        }

        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .filter(|name| {
                let state = fs::read_to_string(self.root.join(name).join("operstate"))
                    .unwrap_or_default();
                matches!(state.trim(), "up" | "unknown")
            })
            .collect();

        names.sort();
        names.truncate(self.max_links);
        names
    }

    fn byte_count(&self, interface: &str) -> Option<u64> {
        let tx = self.read_counter(interface, "tx_bytes")?;
        let rx = self.read_counter(interface, "rx_bytes")?;
        Some(tx + rx)
    }
}

/// Throughput estimate from successive byte counter readings
#[derive(Debug, Clone, Default)]
pub struct ThroughputMeter {
    last: Option<(u64, Instant)>,
}

impl ThroughputMeter {
    /// Record a counter reading and return kbit/s since the previous one
    pub fn update(&mut self, bytes: u64, now: Instant) -> f64 {
        let rate = match self.last {
            Some((prev, at)) if bytes >= prev => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (bytes - prev) as f64 * 8.0 / 1000.0 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.last = Some((bytes, now));
        rate
    }
}

/// One network interface as seen by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkLink {
    /// Index carried in frames; stable for the run
    pub id: u8,
    pub name: String,
    pub kind: LinkKind,
    pub metrics: LinkMetrics,
    pub state: LinkState,
    pub last_sample_at: Option<Instant>,
}

impl NetworkLink {
    /// Link just discovered, not probed yet
    pub fn discovered(id: u8, name: impl Into<String>) -> Self {
        let name = name.into();
        NetworkLink {
            id,
            kind: LinkKind::classify(&name),
            name,
            metrics: LinkMetrics::unreachable(),
            state: LinkState::Down,
            last_sample_at: None,
        }
    }

    /// Apply a successful probe
    pub fn apply_sample(&mut self, metrics: LinkMetrics, degraded_below: u8, now: Instant) {
        self.state = metrics.state(degraded_below);
        self.metrics = metrics;
        self.last_sample_at = Some(now);
    }

    /// Record a failed or timed-out probe
    pub fn mark_down(&mut self, now: Instant) {
        self.metrics = LinkMetrics::unreachable();
        self.state = LinkState::Down;
        self.last_sample_at = Some(now);
    }

    pub fn score(&self) -> u8 {
        self.metrics.score()
    }
}

/// Output of the Link Monitor
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Interface appeared
    Discovered(NetworkLink),
    /// Probe cycle finished with the link usable
    Sample(NetworkLink),
    /// Probe cycle finished with the link unusable
    Down(NetworkLink),
    /// Interface disappeared
    Removed(String),
}

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Period between probes of one link
    pub probe_interval: Duration,
    /// Upper bound of one probe
    pub probe_timeout: Duration,
    /// Period between interface scans
    pub discovery_interval: Duration,
    /// Links scoring below this are degraded
    pub degraded_below: u8,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            discovery_interval: Duration::from_secs(5),
            degraded_below: 50,
        }
    }
}

/// Run one probe cycle for `link`
///
/// Never fails: a probe error or timeout marks the link down for the cycle.
pub fn sample_link(
    link: &mut NetworkLink,
    probe: &dyn LinkProbe,
    source: &dyn InterfaceSource,
    meter: &mut ThroughputMeter,
    config: &MonitorConfig,
    now: Instant,
) -> LinkEvent {
    match probe.probe(&link.name, config.probe_timeout) {
        Ok(mut metrics) => {
            if let Some(bytes) = source.byte_count(&link.name) {
                metrics.est_bandwidth_kbps = meter.update(bytes, now);
            }
            link.apply_sample(metrics, config.degraded_below, now);
        }
        Err(e) => {
            debug!(link = %link.name, error = %e, "Probe failed");
            link.mark_down(now);
        }
    }

    if link.state.is_usable() {
        LinkEvent::Sample(link.clone())
    } else {
        LinkEvent::Down(link.clone())
    }
}

struct ProbeWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProbeWorker {
    fn spawn(
        mut link: NetworkLink,
        probe: Arc<dyn LinkProbe>,
        source: Arc<dyn InterfaceSource>,
        config: MonitorConfig,
        events: Sender<LinkEvent>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("probe-{}", link.name))
            .spawn(move || {
                let mut meter = ThroughputMeter::default();
                loop {
                    let started = Instant::now();
                    let event = sample_link(
                        &mut link,
                        probe.as_ref(),
                        source.as_ref(),
                        &mut meter,
                        &config,
                        started,
                    );
                    if events.send(event).is_err() {
                        break;
                    }

                    let wait = config.probe_interval.saturating_sub(started.elapsed());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            })?;

        Ok(ProbeWorker { stop_tx, handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

/// Running Link Monitor
///
/// One discovery thread plus one probe thread per link.
pub struct LinkMonitor {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LinkMonitor {
    /// Start monitoring; events go to `events`
    pub fn spawn(
        config: MonitorConfig,
        probe: Arc<dyn LinkProbe>,
        source: Arc<dyn InterfaceSource>,
        events: Sender<LinkEvent>,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("link-discovery".to_string())
            .spawn(move || discovery_loop(config, probe, source, events, stop_rx))?;

        Ok(LinkMonitor {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop discovery and every probe thread
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Link ids of present interfaces
///
/// Ids go back to the pool when an interface disappears. The wire carries a
/// `u8`, so at most 256 interfaces can be tracked at once.
#[derive(Debug, Default)]
struct LinkIds {
    by_name: HashMap<String, u8>,
}

impl LinkIds {
    /// Id of `name`, taking the lowest free one for a new interface
    fn assign(&mut self, name: &str) -> Option<u8> {
        if let Some(id) = self.by_name.get(name) {
            return Some(*id);
        }
        let used: HashSet<u8> = self.by_name.values().copied().collect();
        let id = (0..=u8::MAX).find(|id| !used.contains(id))?;
        self.by_name.insert(name.to_string(), id);
        Some(id)
    }

    /// Drop the ids of interfaces not in `present`
    fn retain(&mut self, present: &[String]) {
        self.by_name.retain(|name, _| present.contains(name));
    }
}

fn discovery_loop(
    config: MonitorConfig,
    probe: Arc<dyn LinkProbe>,
    source: Arc<dyn InterfaceSource>,
    events: Sender<LinkEvent>,
    stop_rx: Receiver<()>,
) {
    let mut ids = LinkIds::default();
    let mut workers: HashMap<String, ProbeWorker> = HashMap::new();

    loop {
        let present = source.list();

        let gone: Vec<String> = workers
            .keys()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(worker) = workers.remove(&name) {
                worker.stop();
            }
            info!(link = %name, "Interface removed");
            let _ = events.send(LinkEvent::Removed(name));
        }
        ids.retain(&present);

        for name in present {
            if workers.contains_key(&name) {
                continue;
            }
            let Some(id) = ids.assign(&name) else {
                warn!(link = %name, "No free link id, ignoring interface");
                continue;
            };
            let link = NetworkLink::discovered(id, name.clone());
            info!(link = %name, kind = %link.kind, id, "Interface discovered");
            let _ = events.send(LinkEvent::Discovered(link.clone()));

            match ProbeWorker::spawn(
                link,
                Arc::clone(&probe),
                Arc::clone(&source),
                config.clone(),
                events.clone(),
            ) {
                Ok(worker) => {
                    workers.insert(name, worker);
                }
                Err(e) => warn!(link = %name, error = %e, "Failed to start probe thread"),
            }
        }

        match stop_rx.recv_timeout(config.discovery_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }

    for (_, worker) in workers.drain() {
        worker.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const IPUTILS: &str = "\
PING 8.8.8.8 (8.8.8.8) from 10.0.0.2 wwan0: 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=41.2 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 402ms
rtt min/avg/max/mdev = 38.114/41.203/45.010/2.871 ms
";

    const BSD: &str = "\
--- 8.8.8.8 ping statistics ---
3 packets transmitted, 2 packets received, 33.3% packet loss
round-trip min/avg/max/stddev = 10.1/12.3/15.0/2.1 ms
";

    struct FakeProbe {
        results: Mutex<Vec<Result<LinkMetrics, ProbeError>>>,
    }

    impl LinkProbe for FakeProbe {
        fn probe(&self, _interface: &str, _timeout: Duration) -> Result<LinkMetrics, ProbeError> {
            self.results.lock().pop().unwrap_or(Err(ProbeError::Timeout))
        }
    }

    struct FakeSource {
        names: Mutex<Vec<String>>,
        bytes: u64,
    }

    impl InterfaceSource for FakeSource {
        fn list(&self) -> Vec<String> {
            self.names.lock().clone()
        }

        fn byte_count(&self, _interface: &str) -> Option<u64> {
            Some(self.bytes)
        }
    }

    fn good() -> LinkMetrics {
        LinkMetrics {
            rtt_ms: 30.0,
            jitter_ms: 3.0,
            loss_ratio: 0.0,
            est_bandwidth_kbps: 0.0,
        }
    }

    #[test]
    fn test_parse_iputils() {
        let metrics = parse_ping_output(IPUTILS).unwrap();
        assert_eq!(metrics.loss_ratio, 0.0);
        assert!((metrics.rtt_ms - 41.203).abs() < 1e-9);
        assert!((metrics.jitter_ms - 2.871).abs() < 1e-9);
    }

    #[test]
    fn test_parse_bsd_with_loss() {
        let metrics = parse_ping_output(BSD).unwrap();
        assert!((metrics.loss_ratio - 0.333).abs() < 1e-9);
        assert!((metrics.rtt_ms - 12.3).abs() < 1e-9);
        assert!((metrics.jitter_ms - 2.1).abs() < 1e-9);
    }

    #[test]
    fn test_parse_total_loss() {
        let output = "3 packets transmitted, 0 received, 100% packet loss, time 2030ms\n";
        let metrics = parse_ping_output(output).unwrap();
        assert!(!metrics.is_reachable());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_ping_output("ping: unknown iface wwan9\n").is_none());
    }

    #[test]
    fn test_throughput_meter() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::default();
        assert_eq!(meter.update(1_000, start), 0.0);

        // 125 000 bytes in one second is 1000 kbit/s
        let rate = meter.update(126_000, start + Duration::from_secs(1));
        assert!((rate - 1000.0).abs() < 1e-6);

        // Counter reset
        assert_eq!(meter.update(10, start + Duration::from_secs(2)), 0.0);
    }

    #[test]
    fn test_sample_link_marks_timeout_down() {
        let probe = FakeProbe {
            results: Mutex::new(vec![Err(ProbeError::Timeout), Ok(good())]),
        };
        let source = FakeSource {
            names: Mutex::new(vec![]),
            bytes: 0,
        };
        let config = MonitorConfig::default();
        let mut meter = ThroughputMeter::default();
        let mut link = NetworkLink::discovered(0, "wwan0");
        let now = Instant::now();

        let first = sample_link(&mut link, &probe, &source, &mut meter, &config, now);
        assert!(matches!(first, LinkEvent::Sample(ref l) if l.state == LinkState::Up));

        let second = sample_link(&mut link, &probe, &source, &mut meter, &config, now);
        assert!(matches!(second, LinkEvent::Down(ref l) if l.state == LinkState::Down));
        assert_eq!(link.last_sample_at, Some(now));
    }

    #[test]
    fn test_sysfs_listing() {
        let root = std::env::temp_dir().join(format!("rato-sysfs-{}", std::process::id()));
        for (name, state) in [("lo", "unknown"), ("eth0", "up"), ("wwan0", "unknown"), ("wlan0", "down")] {
            let dir = root.join(name).join("statistics");
            fs::create_dir_all(&dir).unwrap();
            fs::write(root.join(name).join("operstate"), format!("{}\n", state)).unwrap();
            fs::write(dir.join("tx_bytes"), "100\n").unwrap();
            fs::write(dir.join("rx_bytes"), "23\n").unwrap();
        }

        let source = SysfsInterfaces::with_root(&root, Vec::new(), 4);
        assert_eq!(source.list(), vec!["eth0".to_string(), "wwan0".to_string()]);
        assert_eq!(source.byte_count("eth0"), Some(123));

        let limited = SysfsInterfaces::with_root(&root, Vec::new(), 1);
        assert_eq!(limited.list(), vec!["eth0".to_string()]);

        let forced = SysfsInterfaces::with_root(&root, vec!["usb0".to_string()], 4);
        assert_eq!(forced.list(), vec!["usb0".to_string()]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_link_ids_reused_after_removal() {
        let mut ids = LinkIds::default();
        assert_eq!(ids.assign("eth0"), Some(0));
        assert_eq!(ids.assign("wwan0"), Some(1));
        assert_eq!(ids.assign("eth0"), Some(0));

        ids.retain(&["wwan0".to_string()]);
        assert_eq!(ids.assign("usb0"), Some(0));
        assert_eq!(ids.assign("wwan0"), Some(1));
    }

    #[test]
    fn test_link_ids_never_wrap() {
        let mut ids = LinkIds::default();
        let names: Vec<String> = (0..256).map(|n| format!("if{}", n)).collect();
        for (n, name) in names.iter().enumerate() {
            assert_eq!(ids.assign(name), Some(n as u8));
        }
        assert_eq!(ids.assign("one-too-many"), None);

        ids.retain(&names[1..]);
        assert_eq!(ids.assign("one-too-many"), Some(0));
    }

    #[test]
    fn test_monitor_discovers_and_removes() {
        let probe = Arc::new(FakeProbe {
            results: Mutex::new(Vec::new()),
        });
        let source = Arc::new(FakeSource {
            names: Mutex::new(vec!["eth0".to_string()]),
            bytes: 0,
        });
        let config = MonitorConfig {
            probe_interval: Duration::from_millis(10),
            discovery_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (tx, rx) = channel::unbounded();

        let mut monitor = LinkMonitor::spawn(config, probe, source.clone(), tx).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, LinkEvent::Discovered(ref l) if l.name == "eth0" && l.id == 0));

        source.names.lock().clear();
        let removed = rx
            .iter()
            .take(500)
            .find(|e| matches!(e, LinkEvent::Removed(_)));
        assert_eq!(removed, Some(LinkEvent::Removed("eth0".to_string())));

        monitor.stop();
    }
}
