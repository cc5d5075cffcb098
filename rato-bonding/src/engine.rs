//! Bonding Engine runtime
//!
//! Owns the [`BondingStateMachine`] on its own thread, feeds it link events
//! and timer ticks, and carries out its actions against the real transports.

use crate::dedicated::DedicatedSender;
use crate::monitor::{LinkEvent, NetworkLink};
use crate::sender::{MultiLinkSender, SenderConfig, SenderError};
use crate::session::{
    BondingAction, BondingMode, BondingPolicy, BondingStateMachine, CloseReason, LinkFailure,
    SessionLifecycle,
};
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::RwLock;
use rato_crypto::FrameKey;
use rato_io::{find_binary, Timer};
use rato_protocol::{LinkKind, LinkMetrics, LinkReport, LinkReportEntry, LinkState};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_millis(100);

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Cannot resolve relay address {0}")]
    Resolve(String),

    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Field agent bonding configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub streamer_id: String,
    pub secret: String,
    /// Relay host
    pub server_host: String,
    /// Relay receive port
    pub server_port: u16,
    /// Local port the encoder pushes to
    pub input_port: u16,
    /// Dedicated sender name or path; `None` disables protocol bonding
    pub dedicated_sender: Option<String>,
    /// Latency advertised in the SRT ingest URL
    pub latency: Duration,
    pub policy: BondingPolicy,
    /// Period between link reports in native mode
    pub report_interval: Duration,
    pub pin_interfaces: bool,
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            streamer_id: String::new(),
            secret: String::new(),
            server_host: "127.0.0.1".to_string(),
            server_port: 9000,
            input_port: 5000,
            dedicated_sender: Some("srtla_send".to_string()),
            latency: Duration::from_millis(500),
            policy: BondingPolicy::default(),
            report_interval: Duration::from_secs(1),
            pin_interfaces: true,
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// URL the encoder must push to in `mode`
    pub fn ingest_url(&self, mode: &BondingMode) -> String {
        match mode {
            BondingMode::ProtocolBonded { .. } => format!(
                "srt://127.0.0.1:{}?mode=caller&latency={}",
                self.input_port,
                self.latency.as_micros()
            ),
            BondingMode::NativeMultiLink => format!("udp://127.0.0.1:{}", self.input_port),
        }
    }
}

/// One link in a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatus {
    pub name: String,
    pub kind: LinkKind,
    pub state: LinkState,
    pub score: u8,
    pub metrics: LinkMetrics,
    pub member: bool,
}

/// Engine snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BondingStatus {
    pub lifecycle: SessionLifecycle,
    pub mode: Option<&'static str>,
    pub ingest_url: Option<String>,
    pub links: Vec<LinkStatus>,
    pub last_failure: Option<String>,
}

impl Default for BondingStatus {
    fn default() -> Self {
        BondingStatus {
            lifecycle: SessionLifecycle::Starting,
            mode: None,
            ingest_url: None,
            links: Vec::new(),
            last_failure: None,
        }
    }
}

enum Transport {
    Idle,
    Dedicated(DedicatedSender),
    Native(MultiLinkSender),
}

struct EngineLoop {
    config: EngineConfig,
    key: FrameKey,
    run_id: u32,
    /// Media sequence carried across native relaunches within `run_id`
    next_seq: u64,
    server: SocketAddr,
    machine: BondingStateMachine,
    transport: Transport,
    links: HashMap<String, NetworkLink>,
    order: Vec<String>,
    reconnect_at: Option<Instant>,
    report_timer: Timer,
    status: Arc<RwLock<BondingStatus>>,
}

impl EngineLoop {
    fn run(mut self, events: Receiver<LinkEvent>, stop_rx: Receiver<()>) {
        let dedicated = resolve_dedicated_sender(&self.config);
        match &dedicated {
            Some(path) => info!(sender = %path.display(), "Dedicated bonding sender available"),
            None => info!("No dedicated bonding sender, using native multi-link"),
        }
        let actions = self.machine.start(dedicated);
        self.apply(actions);

        while !self.machine.is_closed() {
            select! {
                recv(events) -> msg => match msg {
                    Ok(event) => {
                        self.track(&event);
                        let actions = self.machine.on_link_event(&event);
                        self.apply(actions);
                    }
                    Err(_) => {
                        let actions = self.machine.close();
                        self.apply(actions);
                    }
                },
                recv(stop_rx) -> _ => {
                    let actions = self.machine.close();
                    self.apply(actions);
                },
                default(TICK) => {}
            }
            self.tick(Instant::now());
        }

        self.stop_transport();
        self.publish();
    }

    fn tick(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| now >= at) {
            self.reconnect_at = None;
            let actions = self.machine.on_reconnect_timer();
            self.apply(actions);
        }

        let exited = match &mut self.transport {
            Transport::Dedicated(sender) => sender.exited(),
            _ => None,
        };
        if let Some(status) = exited {
            warn!(?status, "Dedicated bonding sender exited, falling back to native multi-link");
            self.transport = Transport::Idle;
            let actions = self.machine.on_sender_exit();
            self.apply(actions);
        }

        if self.report_timer.try_fire(now) {
            self.send_report();
        }
        self.publish();
    }

    fn track(&mut self, event: &LinkEvent) {
        match event {
            LinkEvent::Discovered(link) | LinkEvent::Sample(link) | LinkEvent::Down(link) => {
                if !self.links.contains_key(&link.name) {
                    self.order.push(link.name.clone());
                }
                self.links.insert(link.name.clone(), link.clone());
            }
            LinkEvent::Removed(name) => {
                self.links.remove(name);
                self.order.retain(|n| n != name);
            }
        }
    }

    fn apply(&mut self, actions: Vec<BondingAction>) {
        let mut queue: VecDeque<BondingAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            debug!(?action, "Bonding action");
            match action {
                BondingAction::Launch { mode, links } => {
                    self.stop_transport();
                    if let Err(e) = self.launch(&mode, &links) {
                        error!(mode = mode.label(), error = %e, "Failed to launch transport");
                        if matches!(mode, BondingMode::ProtocolBonded { .. }) {
                            queue.extend(self.machine.on_sender_exit());
                        }
                    }
                }
                BondingAction::AddPath(name) => self.add_path(&name),
                BondingAction::RemovePath(name) => {
                    let failure = LinkFailure::TransientLinkLoss { link: name.clone() };
                    warn!(%failure, "Link left the bonding set");
                    if let Transport::Native(sender) = &self.transport {
                        sender.remove_path(&name);
                    }
                }
                BondingAction::ScheduleReconnect { delay, attempt } => {
                    self.stop_transport();
                    let failure = LinkFailure::TotalLinkLoss;
                    warn!(
                        %failure,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "No usable link, reconnecting"
                    );
                    self.reconnect_at = Some(Instant::now() + delay);
                }
                BondingAction::Close(reason) => {
                    self.stop_transport();
                    self.reconnect_at = None;
                    match reason {
                        CloseReason::Requested => info!("Bonding session closed"),
                        CloseReason::ReconnectExhausted => {
                            error!("Reconnect attempts exhausted, bonding session closed")
                        }
                    }
                }
            }
        }
        self.publish();
    }

    fn launch(&mut self, mode: &BondingMode, links: &[String]) -> Result<(), EngineError> {
        match mode {
            BondingMode::ProtocolBonded { sender } => {
                let dedicated = DedicatedSender::launch(
                    sender,
                    self.config.input_port,
                    &self.config.server_host,
                    self.config.server_port,
                    links,
                )?;
                self.transport = Transport::Dedicated(dedicated);
            }
            BondingMode::NativeMultiLink => {
                let paths: Vec<(u8, String)> = links
                    .iter()
                    .map(|name| (self.link_id(name), name.clone()))
                    .collect();
                let sender_config = SenderConfig {
                    streamer_id: self.config.streamer_id.clone(),
                    run_id: self.run_id,
                    input: SocketAddr::from(([127, 0, 0, 1], self.config.input_port)),
                    server: self.server,
                    pin_interfaces: self.config.pin_interfaces,
                    first_seq: self.next_seq,
                };
                let sender = MultiLinkSender::start(sender_config, self.key.clone(), &paths)?;
                self.transport = Transport::Native(sender);
            }
        }
        info!(
            mode = mode.label(),
            ingest = %self.config.ingest_url(mode),
            links = %links.join(","),
            "Bonding session active"
        );
        Ok(())
    }

    fn add_path(&mut self, name: &str) {
        match &self.transport {
            Transport::Native(sender) => {
                if let Err(e) = sender.add_path(self.link_id(name), name) {
                    warn!(link = %name, error = %e, "Failed to add path");
                }
            }
            Transport::Dedicated(_) => {
                debug!(link = %name, "Dedicated sender manages its own paths")
            }
            Transport::Idle => {}
        }
    }

    fn link_id(&self, name: &str) -> u8 {
        self.links.get(name).map(|l| l.id).unwrap_or(0)
    }

    fn stop_transport(&mut self) {
        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Dedicated(mut sender) => {
                if let Err(e) = sender.stop(self.config.stop_grace) {
                    warn!(error = %e, "Failed to stop dedicated sender");
                }
            }
            Transport::Native(mut sender) => {
                sender.stop();
                self.next_seq = sender.next_seq();
            }
            Transport::Idle => {}
        }
    }

    fn send_report(&mut self) {
        let Transport::Native(sender) = &self.transport else {
            return;
        };
        let entries = self
            .order
            .iter()
            .filter_map(|name| self.links.get(name))
            .map(|link| LinkReportEntry {
                link_id: link.id,
                state: link.state,
                metrics: link.metrics,
            })
            .collect();
        if let Err(e) = sender.send_report(&LinkReport::new(entries)) {
            debug!(error = %e, "Link report not sent");
        }
    }

    fn publish(&self) {
        let members = self.machine.members();
        let links = self
            .order
            .iter()
            .filter_map(|name| self.links.get(name))
            .map(|link| LinkStatus {
                name: link.name.clone(),
                kind: link.kind,
                state: link.state,
                score: link.score(),
                metrics: link.metrics,
                member: members.iter().any(|m| m == &link.name),
            })
            .collect();

        let mode = self.machine.mode();
        *self.status.write() = BondingStatus {
            lifecycle: self.machine.lifecycle(),
            mode: mode.map(BondingMode::label),
            ingest_url: mode.map(|m| self.config.ingest_url(m)),
            links,
            last_failure: self.machine.last_failure().map(|f| f.to_string()),
        };
    }
}

/// Running Bonding Engine
pub struct BondingEngine {
    status: Arc<RwLock<BondingStatus>>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl BondingEngine {
    /// Start the engine on its own thread, consuming monitor events
    pub fn spawn(
        config: EngineConfig,
        run_id: u32,
        events: Receiver<LinkEvent>,
    ) -> Result<Self, EngineError> {
        let target = format!("{}:{}", config.server_host, config.server_port);
        let server = target
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| EngineError::Resolve(target.clone()))?;

        let status = Arc::new(RwLock::new(BondingStatus::default()));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let now = Instant::now();

        let engine = EngineLoop {
            key: FrameKey::new(&config.streamer_id, &config.secret),
            run_id,
            next_seq: 0,
            server,
            machine: BondingStateMachine::new(config.policy.clone()),
            transport: Transport::Idle,
            links: HashMap::new(),
            order: Vec::new(),
            reconnect_at: None,
            report_timer: Timer::new(config.report_interval, now),
            status: Arc::clone(&status),
            config,
        };

        info!(run_id, server = %server, "Bonding engine starting");
        let handle = thread::Builder::new()
            .name("bonding-engine".to_string())
            .spawn(move || engine.run(events, stop_rx))?;

        Ok(BondingEngine {
            status,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> BondingStatus {
        self.status.read().clone()
    }

    /// URL the encoder must push to, once a mode is active
    pub fn ingest_url(&self) -> Option<String> {
        self.status.read().ingest_url.clone()
    }

    /// Whether the engine thread has finished
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Close the session and join the engine thread
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BondingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binary the engine would use for protocol bonding
pub fn resolve_dedicated_sender(config: &EngineConfig) -> Option<PathBuf> {
    config.dedicated_sender.as_deref().and_then(find_binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rato_io::LinkSocket;
    use rato_protocol::{Frame, FrameKind};

    fn up_link(id: u8, name: &str) -> NetworkLink {
        let mut link = NetworkLink::discovered(id, name);
        link.apply_sample(
            LinkMetrics {
                rtt_ms: 20.0,
                jitter_ms: 2.0,
                loss_ratio: 0.0,
                est_bandwidth_kbps: 1000.0,
            },
            50,
            Instant::now(),
        );
        link
    }

    fn wait_for(engine: &BondingEngine, pred: impl Fn(&BondingStatus) -> bool) -> BondingStatus {
        for _ in 0..200 {
            let status = engine.status();
            if pred(&status) {
                return status;
            }
            thread::sleep(Duration::from_millis(10));
        }
        engine.status()
    }

    fn recv_media(relay: &LinkSocket, key: &FrameKey) -> Frame {
        let mut buf = [0u8; 2048];
        loop {
            let (n, _) = relay.recv_from(&mut buf).unwrap();
            let frame = Frame::from_bytes(&buf[..n], key).unwrap();
            if frame.header.kind == FrameKind::Media {
                return frame;
            }
        }
    }

    #[test]
    fn test_ingest_urls() {
        let config = EngineConfig {
            input_port: 6000,
            ..Default::default()
        };
        assert_eq!(
            config.ingest_url(&BondingMode::NativeMultiLink),
            "udp://127.0.0.1:6000"
        );
        assert_eq!(
            config.ingest_url(&BondingMode::ProtocolBonded {
                sender: PathBuf::from("srtla_send")
            }),
            "srt://127.0.0.1:6000?mode=caller&latency=500000"
        );
    }

    #[test]
    fn test_native_engine_forwards_and_reports() {
        let relay = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        relay.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let encoder_port = LinkSocket::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let config = EngineConfig {
            streamer_id: "field-1".to_string(),
            secret: "s".to_string(),
            server_port: relay.local_addr().unwrap().port(),
            input_port: encoder_port,
            dedicated_sender: None,
            report_interval: Duration::from_millis(50),
            pin_interfaces: false,
            ..Default::default()
        };
        let (tx, rx) = channel::unbounded();
        let mut engine = BondingEngine::spawn(config, 5, rx).unwrap();

        tx.send(LinkEvent::Sample(up_link(0, "eth0"))).unwrap();
        let status = wait_for(&engine, |s| s.lifecycle == SessionLifecycle::Active);
        assert_eq!(status.mode, Some("native-multilink"));
        assert_eq!(
            status.ingest_url,
            Some(format!("udp://127.0.0.1:{}", encoder_port))
        );

        let key = FrameKey::new("field-1", "s");
        let mut buf = [0u8; 2048];
        let (n, _) = relay.recv_from(&mut buf).unwrap();
        let frame = Frame::from_bytes(&buf[..n], &key).unwrap();
        assert_eq!(frame.header.kind, FrameKind::LinkReport);
        assert_eq!(frame.header.run_id, 5);

        tx.send(LinkEvent::Down(NetworkLink::discovered(0, "eth0")))
            .unwrap();
        let status = wait_for(&engine, |s| s.lifecycle == SessionLifecycle::Reconnecting);
        assert_eq!(status.last_failure.as_deref(), Some("total link loss"));

        engine.stop();
        assert_eq!(engine.status().lifecycle, SessionLifecycle::Closed);
    }

    #[test]
    fn test_sequence_survives_reconnect() {
        let relay = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        relay.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let encoder = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let input_port = LinkSocket::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let input: SocketAddr = SocketAddr::from(([127, 0, 0, 1], input_port));

        let config = EngineConfig {
            streamer_id: "field-1".to_string(),
            secret: "s".to_string(),
            server_port: relay.local_addr().unwrap().port(),
            input_port,
            dedicated_sender: None,
            report_interval: Duration::from_secs(60),
            pin_interfaces: false,
            policy: BondingPolicy {
                reconnect_steps: vec![Duration::from_millis(50)],
                max_reconnect_attempts: 20,
            },
            ..Default::default()
        };
        let key = FrameKey::new("field-1", "s");
        let (tx, rx) = channel::unbounded();
        let mut engine = BondingEngine::spawn(config, 9, rx).unwrap();

        tx.send(LinkEvent::Sample(up_link(0, "eth0"))).unwrap();
        wait_for(&engine, |s| s.lifecycle == SessionLifecycle::Active);
        for _ in 0..3 {
            encoder.send_to(b"ts", input).unwrap();
        }
        let before: Vec<u64> = (0..3).map(|_| recv_media(&relay, &key).header.seq).collect();
        assert_eq!(before, vec![0, 1, 2]);

        tx.send(LinkEvent::Down(NetworkLink::discovered(0, "eth0")))
            .unwrap();
        wait_for(&engine, |s| s.lifecycle == SessionLifecycle::Reconnecting);
        tx.send(LinkEvent::Sample(up_link(0, "eth0"))).unwrap();
        let status = wait_for(&engine, |s| s.lifecycle == SessionLifecycle::Active);
        assert_eq!(status.lifecycle, SessionLifecycle::Active);

        encoder.send_to(b"ts", input).unwrap();
        let after = recv_media(&relay, &key);
        assert_eq!(after.header.run_id, 9);
        assert_eq!(after.header.seq, 3);

        engine.stop();
    }
}
