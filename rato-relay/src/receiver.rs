//! Session Receiver
//!
//! Receives one streamer's bonded uplink on its leased port, reassembles
//! the media stream and fans every payload out to the session's local
//! endpoints. Quality samples for the Health Monitor are cut every
//! `check_interval`.
//!
//! In native mode the frames are our own and the reorder buffer merges the
//! redundant copies. In protocol mode `srtla_rec` and an SRT bridge do the
//! reassembly and the receiver only forwards the resulting datagrams.

use crate::events::RelayEvent;
use crate::health::QualitySample;
use crate::task::TaskHandle;
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use rato_bonding::{ReorderBuffer, ReorderError, ReorderStats};
use rato_crypto::FrameKey;
use rato_io::{find_binary, Backoff, LinkSocket, ManagedChild, SocketError, Timer};
use rato_protocol::{Frame, FrameKind, LinkReport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Largest datagram accepted on the receive port
const MAX_DATAGRAM: usize = 4096;

/// Socket read timeout of the receive loop
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Binary not found: {0}")]
    MissingBinary(String),

    #[error("Failed to start receiver thread: {0}")]
    Thread(io::Error),
}

/// How a session's uplink arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Native multi-link frames on the leased port
    Native,
    /// `srtla_rec` on the leased port
    Protocol,
    /// Protocol when its binaries are installed, native otherwise
    Auto,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestMode::Native => "native",
            IngestMode::Protocol => "protocol",
            IngestMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Receive state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveState {
    WaitingForData,
    Live,
    Stalled,
    Closed,
}

impl fmt::Display for ReceiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiveState::WaitingForData => "waiting",
            ReceiveState::Live => "live",
            ReceiveState::Stalled => "stalled",
            ReceiveState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// External reassembly in protocol mode
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub receiver_binary: PathBuf,
    pub bridge_binary: PathBuf,
    /// `srtla_rec` forwards to `port + forward_offset`
    pub forward_offset: u16,
    /// The bridge delivers raw datagrams to `port + output_offset`
    pub output_offset: u16,
    pub restart_delay: Duration,
    pub max_restarts: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            receiver_binary: PathBuf::from("srtla_rec"),
            bridge_binary: PathBuf::from("srt-live-transmit"),
            forward_offset: 1000,
            output_offset: 2000,
            restart_delay: Duration::from_secs(2),
            max_restarts: 10,
        }
    }
}

/// Receiver settings
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub mode: IngestMode,
    pub bind_ip: IpAddr,
    /// Reorder budget
    pub latency: Duration,
    pub max_buffer_frames: usize,
    pub stall_timeout: Duration,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub max_links: u32,
    pub protocol: ProtocolConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            mode: IngestMode::Native,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            latency: Duration::from_millis(500),
            max_buffer_frames: 4096,
            stall_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(2),
            max_links: 4,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ReceiverConfig {
    /// Concrete mode for a new session
    pub fn resolve_mode(&self) -> Result<IngestMode, ReceiverError> {
        let receiver = find_binary(&self.protocol.receiver_binary.to_string_lossy());
        let bridge = find_binary(&self.protocol.bridge_binary.to_string_lossy());

        match self.mode {
            IngestMode::Native => Ok(IngestMode::Native),
            IngestMode::Protocol => {
                if receiver.is_none() {
                    return Err(ReceiverError::MissingBinary(
                        self.protocol.receiver_binary.display().to_string(),
                    ));
                }
                if bridge.is_none() {
                    return Err(ReceiverError::MissingBinary(
                        self.protocol.bridge_binary.display().to_string(),
                    ));
                }
                Ok(IngestMode::Protocol)
            }
            IngestMode::Auto if receiver.is_some() && bridge.is_some() => Ok(IngestMode::Protocol),
            IngestMode::Auto => Ok(IngestMode::Native),
        }
    }
}

/// Idle detection
///
/// `WaitingForData` never times out. A live session stalls after
/// `stall_timeout` without data and closes after `idle_timeout`.
#[derive(Debug, Clone)]
pub struct ReceiveTracker {
    state: ReceiveState,
    last_data: Option<Instant>,
    ever_live: bool,
    stall_timeout: Duration,
    idle_timeout: Duration,
}

impl ReceiveTracker {
    pub fn new(stall_timeout: Duration, idle_timeout: Duration) -> Self {
        ReceiveTracker {
            state: ReceiveState::WaitingForData,
            last_data: None,
            ever_live: false,
            stall_timeout,
            idle_timeout,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn ever_live(&self) -> bool {
        self.ever_live
    }

    pub fn last_data(&self) -> Option<Instant> {
        self.last_data
    }

    /// Data arrived; returns the new state on a transition
    pub fn on_data(&mut self, now: Instant) -> Option<ReceiveState> {
        if self.state == ReceiveState::Closed {
            return None;
        }
        self.last_data = Some(now);
        match self.state {
            ReceiveState::WaitingForData | ReceiveState::Stalled => {
                self.state = ReceiveState::Live;
                self.ever_live = true;
                Some(ReceiveState::Live)
            }
            _ => None,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<ReceiveState> {
        let last = self.last_data?;
        let silent = now.saturating_duration_since(last);
        let next = match self.state {
            ReceiveState::Live | ReceiveState::Stalled if silent >= self.idle_timeout => {
                ReceiveState::Closed
            }
            ReceiveState::Live if silent >= self.stall_timeout => ReceiveState::Stalled,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }

    pub fn close(&mut self) -> Option<ReceiveState> {
        if self.state == ReceiveState::Closed {
            return None;
        }
        self.state = ReceiveState::Closed;
        Some(ReceiveState::Closed)
    }
}

/// Accumulates one check interval of receive quality
#[derive(Debug, Clone)]
pub struct QualityWindow {
    started: Instant,
    max_links: u32,
    links: HashSet<u8>,
    /// Links seen during the current run
    run_links: HashSet<u8>,
    bytes: u64,
    report: Option<LinkReport>,
    reorder_mark: ReorderStats,
}

impl QualityWindow {
    pub fn new(now: Instant, max_links: u32) -> Self {
        QualityWindow {
            started: now,
            max_links: max_links.max(1),
            links: HashSet::new(),
            run_links: HashSet::new(),
            bytes: 0,
            report: None,
            reorder_mark: ReorderStats::default(),
        }
    }

    pub fn saw_link(&mut self, link_id: u8) {
        self.links.insert(link_id);
        self.run_links.insert(link_id);
    }

    pub fn delivered(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    pub fn on_report(&mut self, report: LinkReport) {
        self.report = Some(report);
    }

    /// Forget everything learned about the previous run
    pub fn new_run(&mut self, now: Instant) {
        self.run_links.clear();
        self.links.clear();
        self.report = None;
        self.bytes = 0;
        self.started = now;
        self.reorder_mark = ReorderStats::default();
    }

    /// Close the window and start the next one
    pub fn sample(&mut self, now: Instant, reorder: &ReorderStats) -> QualitySample {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let bitrate_kbps = if elapsed > 0.0 {
            self.bytes as f64 * 8.0 / 1000.0 / elapsed
        } else {
            0.0
        };

        let active = (self.links.len() as u32).min(self.max_links);
        let reported = self.report.as_ref().map_or(0, |r| r.entries.len() as u32);
        let total = reported
            .max(self.run_links.len() as u32)
            .max(active)
            .min(self.max_links);

        let mut window_loss = reorder.since(&self.reorder_mark).loss_ratio();
        if active == 0 {
            window_loss = 1.0;
        }

        let (rtt_ms, jitter_ms, bandwidth_kbps, reported_loss) = match &self.report {
            Some(report) => {
                let usable: Vec<_> = report
                    .usable()
                    .filter(|e| e.metrics.is_reachable())
                    .collect();
                if usable.is_empty() {
                    (None, None, None, 0.0)
                } else {
                    let n = usable.len() as f64;
                    let rtt = usable.iter().map(|e| e.metrics.rtt_ms).sum::<f64>() / n;
                    let jitter = usable.iter().map(|e| e.metrics.jitter_ms).sum::<f64>() / n;
                    let loss = usable.iter().map(|e| e.metrics.loss_ratio).sum::<f64>() / n;
                    let bandwidth = usable.iter().map(|e| e.metrics.est_bandwidth_kbps).sum();
                    (Some(rtt), Some(jitter), Some(bandwidth), loss)
                }
            }
            None => (None, None, None, 0.0),
        };

        let sample = QualitySample {
            at: now,
            active_links: active,
            total_links: total,
            rtt_ms,
            jitter_ms,
            loss_ratio: window_loss.max(reported_loss).clamp(0.0, 1.0),
            bandwidth_kbps,
            bitrate_kbps,
        };

        self.started = now;
        self.links.clear();
        self.bytes = 0;
        self.report = None;
        self.reorder_mark = *reorder;
        sample
    }
}

/// Who the receiver works for
#[derive(Debug, Clone)]
pub struct ReceiverContext {
    pub streamer_id: String,
    pub generation: u64,
    pub port: u16,
    pub key: FrameKey,
    /// Local endpoints every payload is copied to
    pub targets: Vec<SocketAddr>,
}

/// Counters and state published by the receiver thread
#[derive(Debug, Clone)]
pub struct ReceiverStatus {
    pub mode: IngestMode,
    pub state: ReceiveState,
    pub ever_live: bool,
    pub run_id: Option<u32>,
    /// Frames failing verification
    pub frames_rejected: u64,
    /// Valid frames carrying another streamer id
    pub frames_foreign: u64,
    pub bytes_delivered: u64,
    pub reorder: ReorderStats,
    pub last_data_at: Option<Instant>,
}

impl ReceiverStatus {
    fn new(mode: IngestMode) -> Self {
        ReceiverStatus {
            mode,
            state: ReceiveState::WaitingForData,
            ever_live: false,
            run_id: None,
            frames_rejected: 0,
            frames_foreign: 0,
            bytes_delivered: 0,
            reorder: ReorderStats::default(),
            last_data_at: None,
        }
    }
}

/// Shared pieces of both receive loops
struct Session {
    context: ReceiverContext,
    out: LinkSocket,
    tracker: ReceiveTracker,
    window: QualityWindow,
    check: Timer,
    status: Arc<RwLock<ReceiverStatus>>,
    samples: Sender<QualitySample>,
    events: Sender<RelayEvent>,
}

impl Session {
    fn publish_state(&self, state: ReceiveState) {
        info!(
            streamer = %self.context.streamer_id,
            port = self.context.port,
            state = %state,
            "Receive state changed"
        );
        {
            let mut status = self.status.write();
            status.state = state;
            status.ever_live = self.tracker.ever_live();
            status.last_data_at = self.tracker.last_data();
        }
        let _ = self.events.send(RelayEvent::Receive {
            streamer_id: self.context.streamer_id.clone(),
            generation: self.context.generation,
            state,
        });
    }

    fn on_data(&mut self, now: Instant) {
        if let Some(state) = self.tracker.on_data(now) {
            self.publish_state(state);
        }
    }

    fn forward(&mut self, payload: &[u8]) {
        for target in &self.context.targets {
            if let Err(e) = self.out.send_to(payload, *target) {
                trace!(streamer = %self.context.streamer_id, target = %target, error = %e, "Forward failed");
            }
        }
        self.window.delivered(payload.len());
        self.status.write().bytes_delivered += payload.len() as u64;
    }

    /// Periodic work; returns false once the session has closed
    fn tick(&mut self, now: Instant, reorder: &ReorderStats) -> bool {
        if self.status.read().reorder != *reorder {
            self.status.write().reorder = *reorder;
        }
        if let Some(state) = self.tracker.on_tick(now) {
            self.publish_state(state);
        }
        if self.tracker.state() == ReceiveState::Closed {
            return false;
        }

        if self.check.try_fire(now) {
            let sample = self.window.sample(now, reorder);
            self.status.write().last_data_at = self.tracker.last_data();
            if self.tracker.state() != ReceiveState::WaitingForData {
                let _ = self.samples.send(sample);
            }
        }
        true
    }

    fn close(&mut self) {
        if let Some(state) = self.tracker.close() {
            self.publish_state(state);
        }
    }
}

/// Running session receiver
pub struct SessionReceiver {
    mode: IngestMode,
    status: Arc<RwLock<ReceiverStatus>>,
    task: TaskHandle,
}

impl SessionReceiver {
    /// Bind the receive path and start the receive thread
    ///
    /// `mode` must already be resolved (see [`ReceiverConfig::resolve_mode`]).
    pub fn spawn(
        context: ReceiverContext,
        config: &ReceiverConfig,
        mode: IngestMode,
        samples: Sender<QualitySample>,
        events: Sender<RelayEvent>,
    ) -> Result<Self, ReceiverError> {
        let mode = match mode {
            IngestMode::Auto => config.resolve_mode()?,
            other => other,
        };

        let listen_port = match mode {
            IngestMode::Protocol => context.port.wrapping_add(config.protocol.output_offset),
            _ => context.port,
        };
        let listen_ip = match mode {
            IngestMode::Protocol => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => config.bind_ip,
        };
        let socket = LinkSocket::bind(SocketAddr::new(listen_ip, listen_port))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            debug!(port = listen_port, error = %e, "Could not raise receive buffer");
        }
        let out = LinkSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;

        let helpers = match mode {
            IngestMode::Protocol => protocol_helpers(&context, config)?,
            _ => Vec::new(),
        };

        let status = Arc::new(RwLock::new(ReceiverStatus::new(mode)));
        let now = Instant::now();
        let session = Session {
            tracker: ReceiveTracker::new(config.stall_timeout, config.idle_timeout),
            window: QualityWindow::new(now, config.max_links),
            check: Timer::new(config.check_interval, now),
            status: Arc::clone(&status),
            samples,
            events,
            out,
            context,
        };

        info!(
            streamer = %session.context.streamer_id,
            port = session.context.port,
            mode = %mode,
            targets = session.context.targets.len(),
            "Session receiver started"
        );

        let name = format!("receiver-{}", session.context.streamer_id);
        let config = config.clone();
        let task = match mode {
            IngestMode::Protocol => TaskHandle::spawn(name, move |stop| {
                run_protocol(session, socket, helpers, &config, stop)
            }),
            _ => TaskHandle::spawn(name, move |stop| run_native(session, socket, &config, stop)),
        }
        .map_err(ReceiverError::Thread)?;

        Ok(SessionReceiver { mode, status, task })
    }

    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn status(&self) -> ReceiverStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> ReceiveState {
        self.status.read().state
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.task.stop(timeout)
    }
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

fn run_native(mut session: Session, socket: LinkSocket, config: &ReceiverConfig, stop: Receiver<()>) {
    let mut reorder = ReorderBuffer::new(config.latency, config.max_buffer_frames);
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut run_id: Option<u32> = None;

    loop {
        if stop_requested(&stop) {
            session.close();
            break;
        }

        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                let now = Instant::now();
                match Frame::from_bytes(&buf[..n], &session.context.key) {
                    Err(e) => {
                        session.status.write().frames_rejected += 1;
                        trace!(streamer = %session.context.streamer_id, from = %from, error = %e, "Dropped frame");
                    }
                    Ok(frame) if frame.streamer_id != session.context.streamer_id => {
                        session.status.write().frames_foreign += 1;
                        trace!(streamer = %session.context.streamer_id, from = %from, "Dropped frame for another streamer");
                    }
                    Ok(frame) => {
                        if run_id != Some(frame.header.run_id) {
                            if let Some(previous) = run_id {
                                info!(
                                    streamer = %session.context.streamer_id,
                                    previous,
                                    run_id = frame.header.run_id,
                                    "New field run supersedes the previous one"
                                );
                                session.window.new_run(now);
                            }
                            reorder.reset();
                            run_id = Some(frame.header.run_id);
                            session.status.write().run_id = run_id;
                        }

                        session.on_data(now);
                        session.window.saw_link(frame.header.link_id);

                        match frame.header.kind {
                            FrameKind::Media => {
                                match reorder.push(frame.header.seq, frame.header.link_id, frame.payload, now) {
                                    Ok(_) => {}
                                    Err(ReorderError::TooOld(seq)) => {
                                        trace!(streamer = %session.context.streamer_id, seq, "Frame arrived too late");
                                    }
                                    Err(e) => {
                                        debug!(streamer = %session.context.streamer_id, error = %e, "Frame not buffered");
                                    }
                                }
                            }
                            FrameKind::LinkReport => match LinkReport::decode(&frame.payload) {
                                Ok(report) => session.window.on_report(report),
                                Err(e) => {
                                    debug!(streamer = %session.context.streamer_id, error = %e, "Bad link report");
                                }
                            },
                        }
                    }
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                warn!(streamer = %session.context.streamer_id, error = %e, "Receive failed");
            }
        }

        let now = Instant::now();
        for delivered in reorder.pop_ready(now) {
            session.forward(&delivered.payload);
        }
        if !session.tick(now, reorder.stats()) {
            break;
        }
    }

    debug!(streamer = %session.context.streamer_id, "Native receiver stopped");
}

/// External process the protocol receive path depends on
struct Helper {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    child: Option<ManagedChild>,
    restart_at: Option<Instant>,
    backoff: Backoff,
}

impl Helper {
    fn new(name: &str, program: PathBuf, args: Vec<String>, config: &ProtocolConfig) -> Self {
        Helper {
            name: name.to_string(),
            program,
            args,
            child: None,
            restart_at: None,
            backoff: Backoff::fixed_steps(vec![config.restart_delay])
                .with_max_attempts(config.max_restarts),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn start(&mut self) -> io::Result<()> {
        let child = ManagedChild::spawn(self.name.clone(), &mut self.command())?;
        self.child = Some(child);
        self.restart_at = None;
        Ok(())
    }

    /// Restart after an exit; false once restarts are exhausted
    fn check(&mut self, now: Instant) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => warn!(process = %self.name, %status, "Helper process exited"),
                Err(e) => warn!(process = %self.name, error = %e, "Helper process lost"),
            }
            self.child = None;
            return self.schedule(now);
        }

        match self.restart_at {
            Some(at) if at <= now => match self.start() {
                Ok(()) => {
                    info!(process = %self.name, attempt = self.backoff.attempts(), "Helper process restarted");
                    true
                }
                Err(e) => {
                    warn!(process = %self.name, error = %e, "Helper restart failed");
                    self.schedule(now)
                }
            },
            _ => true,
        }
    }

    fn schedule(&mut self, now: Instant) -> bool {
        match self.backoff.next_delay() {
            Some(delay) => {
                self.restart_at = Some(now + delay);
                true
            }
            None => {
                error!(process = %self.name, "Helper process exceeded restart cap");
                false
            }
        }
    }

    fn stop(&mut self, grace: Duration) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.stop(grace) {
                debug!(process = %self.name, error = %e, "Failed to stop helper");
            }
        }
    }
}

/// `srtla_rec <port> 127.0.0.1 <port+forward>` and the SRT bridge behind it
fn protocol_helpers(
    context: &ReceiverContext,
    config: &ReceiverConfig,
) -> Result<Vec<Helper>, ReceiverError> {
    let protocol = &config.protocol;
    let forward = context.port.wrapping_add(protocol.forward_offset);
    let output = context.port.wrapping_add(protocol.output_offset);

    let mut helpers = vec![
        Helper::new(
            "srt-bridge",
            protocol.bridge_binary.clone(),
            vec![
                format!(
                    "srt://0.0.0.0:{}?mode=listener&latency={}",
                    forward,
                    config.latency.as_millis()
                ),
                format!("udp://127.0.0.1:{}", output),
                "-v".to_string(),
            ],
            protocol,
        ),
        Helper::new(
            "srtla_rec",
            protocol.receiver_binary.clone(),
            vec![
                context.port.to_string(),
                "127.0.0.1".to_string(),
                forward.to_string(),
            ],
            protocol,
        ),
    ];

    for helper in helpers.iter_mut() {
        helper.start().map_err(|source| ReceiverError::Launch {
            name: helper.name.clone(),
            source,
        })?;
    }
    Ok(helpers)
}

fn run_protocol(
    mut session: Session,
    socket: LinkSocket,
    mut helpers: Vec<Helper>,
    config: &ReceiverConfig,
    stop: Receiver<()>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut stats = ReorderStats::default();

    loop {
        if stop_requested(&stop) {
            session.close();
            break;
        }

        match socket.recv_from(&mut buf) {
            Ok((n, _)) => {
                let now = Instant::now();
                session.on_data(now);
                session.window.saw_link(0);
                stats.frames_received += 1;
                stats.frames_delivered += 1;
                session.forward(&buf[..n]);
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => warn!(streamer = %session.context.streamer_id, error = %e, "Receive failed"),
        }

        let now = Instant::now();
        if !helpers.iter_mut().all(|h| h.check(now)) {
            session.close();
            break;
        }
        if !session.tick(now, &stats) {
            break;
        }
    }

    let grace = config.protocol.restart_delay;
    for helper in helpers.iter_mut().rev() {
        helper.stop(grace);
    }
    debug!(streamer = %session.context.streamer_id, "Protocol receiver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam::channel;
    use rato_protocol::{LinkMetrics, LinkReportEntry, LinkState};

    #[test]
    fn test_tracker_timeouts() {
        let t0 = Instant::now();
        let mut tracker = ReceiveTracker::new(Duration::from_secs(5), Duration::from_secs(30));

        assert_eq!(tracker.on_tick(t0 + Duration::from_secs(600)), None);
        assert_eq!(tracker.state(), ReceiveState::WaitingForData);

        assert_eq!(tracker.on_data(t0), Some(ReceiveState::Live));
        assert_eq!(tracker.on_data(t0 + Duration::from_secs(1)), None);
        assert_eq!(tracker.on_tick(t0 + Duration::from_secs(4)), None);
        assert_eq!(
            tracker.on_tick(t0 + Duration::from_secs(6)),
            Some(ReceiveState::Stalled)
        );
        assert_eq!(
            tracker.on_data(t0 + Duration::from_secs(7)),
            Some(ReceiveState::Live)
        );
        assert_eq!(
            tracker.on_tick(t0 + Duration::from_secs(12)),
            Some(ReceiveState::Stalled)
        );
        assert_eq!(
            tracker.on_tick(t0 + Duration::from_secs(37)),
            Some(ReceiveState::Closed)
        );
        assert_eq!(tracker.on_data(t0 + Duration::from_secs(38)), None);
        assert!(tracker.ever_live());
    }

    fn report(entries: &[(u8, LinkState, f64)]) -> LinkReport {
        LinkReport::new(
            entries
                .iter()
                .map(|(id, state, rtt)| LinkReportEntry {
                    link_id: *id,
                    state: *state,
                    metrics: LinkMetrics {
                        rtt_ms: *rtt,
                        jitter_ms: 2.0,
                        loss_ratio: 0.0,
                        est_bandwidth_kbps: 3000.0,
                    },
                })
                .collect(),
        )
    }

    #[test]
    fn test_window_sample() {
        let t0 = Instant::now();
        let mut window = QualityWindow::new(t0, 4);
        window.saw_link(0);
        window.saw_link(1);
        window.delivered(250_000);
        window.on_report(report(&[
            (0, LinkState::Up, 40.0),
            (1, LinkState::Degraded, 80.0),
            (2, LinkState::Down, 0.0),
        ]));

        let sample = window.sample(t0 + Duration::from_secs(2), &ReorderStats::default());
        assert_eq!(sample.active_links, 2);
        assert_eq!(sample.total_links, 3);
        assert_eq!(sample.rtt_ms, Some(60.0));
        assert_eq!(sample.bandwidth_kbps, Some(6000.0));
        assert!((sample.bitrate_kbps - 1000.0).abs() < 1e-6);
        assert_eq!(sample.loss_ratio, 0.0);

        // One link goes quiet in the next window
        window.saw_link(0);
        let next = window.sample(t0 + Duration::from_secs(4), &ReorderStats::default());
        assert_eq!(next.active_links, 1);
        assert_eq!(next.total_links, 2);
        assert_eq!(next.rtt_ms, None);
    }

    #[test]
    fn test_window_loss_from_gaps() {
        let t0 = Instant::now();
        let mut window = QualityWindow::new(t0, 4);
        window.saw_link(0);
        let stats = ReorderStats {
            frames_delivered: 90,
            frames_lost: 10,
            ..Default::default()
        };
        let sample = window.sample(t0 + Duration::from_secs(2), &stats);
        assert!((sample.loss_ratio - 0.1).abs() < 1e-9);

        window.saw_link(0);
        let sample = window.sample(t0 + Duration::from_secs(4), &stats);
        assert_eq!(sample.loss_ratio, 0.0);
    }

    #[test]
    fn test_empty_window_is_silent() {
        let t0 = Instant::now();
        let mut window = QualityWindow::new(t0, 4);
        let sample = window.sample(t0 + Duration::from_secs(2), &ReorderStats::default());
        assert_eq!(sample.active_links, 0);
        assert_eq!(sample.loss_ratio, 1.0);
    }

    fn spawn_native(
        key: FrameKey,
        config: ReceiverConfig,
        targets: Vec<SocketAddr>,
    ) -> (SessionReceiver, u16, channel::Receiver<QualitySample>, channel::Receiver<RelayEvent>) {
        let probe = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (sample_tx, sample_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();
        let context = ReceiverContext {
            streamer_id: "field-1".to_string(),
            generation: 1,
            port,
            key,
            targets,
        };
        let receiver =
            SessionReceiver::spawn(context, &config, IngestMode::Native, sample_tx, event_tx)
                .unwrap();
        (receiver, port, sample_rx, event_rx)
    }

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            latency: Duration::from_millis(50),
            stall_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(500),
            check_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_native_receive_dedup_and_forward() {
        let key = FrameKey::new("field-1", "secret");
        let sink = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (mut receiver, port, _samples, events) =
            spawn_native(key.clone(), test_config(), vec![sink.local_addr().unwrap()]);
        let server: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));

        let field = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        for seq in [1u64, 0, 1, 0, 2] {
            for link in [0u8, 1] {
                let frame = Frame::media("field-1", 9, link, seq, Bytes::from(vec![seq as u8; 16]));
                field.send_to(&frame.to_bytes(&key).unwrap(), server).unwrap();
            }
        }
        // Wrong secret and wrong streamer are both dropped
        let bad_key = FrameKey::new("field-1", "other");
        let forged = Frame::media("field-1", 9, 0, 3, Bytes::from_static(b"forged"));
        field.send_to(&forged.to_bytes(&bad_key).unwrap(), server).unwrap();
        let foreign = Frame::media("field-2", 9, 0, 3, Bytes::from_static(b"foreign"));
        field.send_to(&foreign.to_bytes(&key).unwrap(), server).unwrap();

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        for _ in 0..3 {
            let (n, _) = sink.recv_from(&mut buf).unwrap();
            got.push(buf[..n][0]);
        }
        assert_eq!(got, vec![0, 1, 2]);

        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            RelayEvent::Receive { state, .. } => assert_eq!(state, ReceiveState::Live),
            other => panic!("unexpected event {:?}", other),
        }

        std::thread::sleep(Duration::from_millis(100));
        let status = receiver.status();
        assert_eq!(status.run_id, Some(9));
        assert_eq!(status.frames_rejected, 1);
        assert_eq!(status.frames_foreign, 1);
        assert!(receiver.stop(Duration::from_secs(2)));
    }

    #[test]
    fn test_reorder_stats_current_between_checks() {
        let key = FrameKey::new("field-1", "secret");
        let config = ReceiverConfig {
            check_interval: Duration::from_secs(60),
            ..test_config()
        };
        let (mut receiver, port, _samples, _events) = spawn_native(key.clone(), config, Vec::new());
        let server: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
        let field = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        for seq in [0u64, 1, 1, 2] {
            let frame = Frame::media("field-1", 4, 0, seq, Bytes::from_static(b"ts"));
            field.send_to(&frame.to_bytes(&key).unwrap(), server).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut stats = receiver.status().reorder;
        while stats.frames_delivered < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            stats = receiver.status().reorder;
        }
        assert_eq!(stats.frames_delivered, 3);
        assert_eq!(stats.duplicates_dropped, 1);
        assert!(receiver.stop(Duration::from_secs(2)));
    }

    #[test]
    fn test_idle_session_closes() {
        let key = FrameKey::new("field-1", "secret");
        let (mut receiver, port, samples, events) = spawn_native(key.clone(), test_config(), Vec::new());
        let field = LinkSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let frame = Frame::media("field-1", 1, 0, 0, Bytes::from_static(b"x"));
        field
            .send_to(&frame.to_bytes(&key).unwrap(), SocketAddr::from(([127, 0, 0, 1], port)))
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_secs(3)) {
            if let RelayEvent::Receive { state, .. } = event {
                states.push(state);
                if state == ReceiveState::Closed {
                    break;
                }
            }
        }
        assert_eq!(
            states,
            vec![ReceiveState::Live, ReceiveState::Stalled, ReceiveState::Closed]
        );
        assert!(receiver.stop(Duration::from_secs(2)));
        assert!(samples.try_iter().any(|s| s.active_links == 0));
    }

    #[test]
    fn test_waiting_session_sends_no_samples() {
        let key = FrameKey::new("field-1", "secret");
        let (mut receiver, _port, samples, _events) = spawn_native(key, test_config(), Vec::new());
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(receiver.state(), ReceiveState::WaitingForData);
        assert!(samples.try_recv().is_err());
        assert!(receiver.stop(Duration::from_secs(2)));
    }

    #[test]
    fn test_protocol_mode_requires_binaries() {
        let config = ReceiverConfig {
            mode: IngestMode::Protocol,
            protocol: ProtocolConfig {
                receiver_binary: PathBuf::from("/nonexistent/srtla_rec"),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_mode(),
            Err(ReceiverError::MissingBinary(_))
        ));

        let auto = ReceiverConfig {
            mode: IngestMode::Auto,
            ..config
        };
        assert_eq!(auto.resolve_mode().unwrap(), IngestMode::Native);
    }
}
