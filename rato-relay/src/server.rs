//! Session Manager
//!
//! [`RelayServer`] owns every streamer session, the relay orchestrator and
//! the scene controller on one thread. [`RelayHandle`] talks to it with
//! commands, so session lifecycle changes are serialized.
//!
//! A second `open` for a streamer supersedes the existing session: the old
//! session's tasks are fully stopped and the new one takes over its port
//! lease, so the field agent keeps sending to the same port.
//!
//! An idle close always returns the port to the pool. With `auto_reopen`
//! the streamer is queued and reopened once its old port leaves quarantine.

use crate::destination::RelayDestination;
use crate::directory::{StreamerDirectory, StreamerProfile};
use crate::events::RelayEvent;
use crate::health::{
    spawn_health_task, HealthConfig, HealthMonitor, HealthRecord, HealthState,
};
use crate::orchestrator::{EndpointConfig, LocalEndpoints, RelayOrchestrator, SessionView};
use crate::ports::{PortAllocator, PortAllocatorConfig, PortError, PortLease};
use crate::receiver::{
    IngestMode, ReceiveState, ReceiverConfig, ReceiverContext, ReceiverError, SessionReceiver,
};
use crate::scene::{Scene, SceneConfig, SceneController, SceneError, SceneInput, SceneSwitcher};
use crate::supervisor::{PublisherLauncher, RelayError, RelayProcessStatus, SupervisorConfig};
use crate::task::TaskHandle;
use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::RwLock;
use rato_bonding::ReorderStats;
use rato_crypto::FrameKey;
use rato_io::Timer;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Idle tick of the manager loop
const TICK: Duration = Duration::from_millis(200);

/// Longest a handle waits for a reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    #[error("Unknown streamer: {0}")]
    UnknownStreamer(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Relay server is not running")]
    ServerGone,

    #[error("Relay server did not reply in time")]
    Timeout,
}

/// Relay-side settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ports: PortAllocatorConfig,
    pub endpoints: EndpointConfig,
    pub receiver: ReceiverConfig,
    pub health: HealthConfig,
    pub supervisor: SupervisorConfig,
    pub scene: SceneConfig,
    /// Secret for streamers whose profile has none
    pub default_secret: String,
    pub sweep_interval: Duration,
    /// Reopen a session after an idle close, on the same port once it
    /// leaves quarantine
    pub auto_reopen: bool,
    /// Bound on each teardown step
    pub close_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            ports: PortAllocatorConfig::default(),
            endpoints: EndpointConfig::default(),
            receiver: ReceiverConfig::default(),
            health: HealthConfig::default(),
            supervisor: SupervisorConfig::default(),
            scene: SceneConfig::default(),
            default_secret: String::new(),
            sweep_interval: Duration::from_secs(10),
            auto_reopen: false,
            close_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSummary {
    pub score: u8,
    pub state: HealthState,
}

/// Snapshot of one session; destinations appear masked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub streamer_id: String,
    pub generation: u64,
    pub port: u16,
    pub mode: IngestMode,
    pub receive_state: ReceiveState,
    pub ever_live: bool,
    pub health: HealthSummary,
    pub scene: Option<Scene>,
    pub relays: Vec<RelayProcessStatus>,
    pub frames_rejected: u64,
    pub bytes_delivered: u64,
    pub reorder: ReorderStats,
}

struct StreamerSession {
    generation: u64,
    lease: PortLease,
    endpoints: LocalEndpoints,
    destinations: Vec<RelayDestination>,
    receiver: SessionReceiver,
    health_task: TaskHandle,
    health: Arc<RwLock<HealthRecord>>,
}

enum Command {
    Open {
        streamer_id: String,
        reply: Sender<Result<u16, SessionError>>,
    },
    Close {
        streamer_id: String,
        reply: Sender<bool>,
    },
    Reconfigure {
        streamer_id: String,
        reply: Sender<Result<bool, SessionError>>,
    },
    Snapshot {
        reply: Sender<Vec<SessionStatus>>,
    },
    Subscribe {
        reply: Sender<Receiver<RelayEvent>>,
    },
    Shutdown,
}

/// Cloneable client of a [`RelayServer`]
#[derive(Clone)]
pub struct RelayHandle {
    commands: Sender<Command>,
}

impl RelayHandle {
    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = channel::bounded(1);
        self.commands
            .send(build(tx))
            .map_err(|_| SessionError::ServerGone)?;
        rx.recv_timeout(REPLY_TIMEOUT).map_err(|e| {
            if e.is_timeout() {
                SessionError::Timeout
            } else {
                SessionError::ServerGone
            }
        })
    }

    /// Open a session in `WaitingForData`; returns the leased port
    pub fn open(&self, streamer_id: &str) -> Result<u16, SessionError> {
        let streamer_id = streamer_id.to_string();
        self.request(|reply| Command::Open { streamer_id, reply })?
    }

    /// Close a session; false if there was none
    pub fn close(&self, streamer_id: &str) -> Result<bool, SessionError> {
        let streamer_id = streamer_id.to_string();
        self.request(|reply| Command::Close { streamer_id, reply })
    }

    /// Re-read a streamer's destinations
    ///
    /// A session that has not gone live yet is reopened right away; a live
    /// one keeps its relays and the change applies to its next session.
    pub fn reconfigure(&self, streamer_id: &str) -> Result<bool, SessionError> {
        let streamer_id = streamer_id.to_string();
        self.request(|reply| Command::Reconfigure { streamer_id, reply })?
    }

    pub fn snapshot(&self) -> Result<Vec<SessionStatus>, SessionError> {
        self.request(|reply| Command::Snapshot { reply })
    }

    /// Receive every relay event from now on
    pub fn subscribe(&self) -> Result<Receiver<RelayEvent>, SessionError> {
        self.request(|reply| Command::Subscribe { reply })
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The session manager thread
pub struct RelayServer {
    handle: RelayHandle,
    thread: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn spawn(
        config: RelayConfig,
        directory: Arc<dyn StreamerDirectory>,
        launcher: Arc<dyn PublisherLauncher>,
        switcher: Arc<dyn SceneSwitcher>,
    ) -> Result<Self, SessionError> {
        let ports = PortAllocator::new(config.ports.clone())?;
        let (command_tx, command_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();
        let (scene_tx, scene_rx) = channel::unbounded();

        let scene = SceneController::spawn(config.scene.clone(), switcher, scene_rx)?;
        let orchestrator = RelayOrchestrator::new(
            launcher,
            config.supervisor.clone(),
            ports.clone(),
            event_tx.clone(),
        );

        info!(
            base_port = config.ports.base_port,
            port_count = config.ports.port_count,
            mode = %config.receiver.mode,
            "Relay server starting"
        );

        let mut state = ServerState {
            sweep: Timer::new(config.sweep_interval, Instant::now()),
            config,
            directory,
            ports,
            orchestrator,
            scene,
            scene_tx,
            events: event_tx,
            subscribers: Vec::new(),
            sessions: HashMap::new(),
            pending_reopen: HashMap::new(),
            next_generation: 1,
        };

        let thread = thread::Builder::new()
            .name("relay-server".to_string())
            .spawn(move || {
                loop {
                    select! {
                        recv(command_rx) -> msg => match msg {
                            Ok(Command::Shutdown) | Err(_) => break,
                            Ok(command) => state.handle_command(command),
                        },
                        recv(event_rx) -> msg => {
                            if let Ok(event) = msg {
                                state.handle_event(event);
                            }
                        },
                        default(TICK) => {}
                    }
                    state.housekeeping(Instant::now());
                }
                state.shutdown();
            })?;

        Ok(RelayServer {
            handle: RelayHandle {
                commands: command_tx,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Block until the server thread ends
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

struct ServerState {
    config: RelayConfig,
    directory: Arc<dyn StreamerDirectory>,
    ports: PortAllocator,
    orchestrator: RelayOrchestrator,
    scene: SceneController,
    scene_tx: Sender<SceneInput>,
    events: Sender<RelayEvent>,
    subscribers: Vec<Sender<RelayEvent>>,
    sessions: HashMap<String, StreamerSession>,
    /// Idle-closed streamers and the port they had
    pending_reopen: HashMap<String, u16>,
    next_generation: u64,
    sweep: Timer,
}

impl ServerState {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { streamer_id, reply } => {
                let result = self.open(&streamer_id);
                if let Err(e) = &result {
                    warn!(streamer = %streamer_id, error = %e, "Failed to open session");
                }
                let _ = reply.send(result);
            }
            Command::Close { streamer_id, reply } => {
                let cancelled = self.pending_reopen.remove(&streamer_id).is_some();
                let closed = self.close(&streamer_id, "requested");
                let _ = reply.send(closed || cancelled);
            }
            Command::Reconfigure { streamer_id, reply } => {
                let _ = reply.send(self.reconfigure(&streamer_id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Subscribe { reply } => {
                let (tx, rx) = channel::unbounded();
                self.subscribers.push(tx);
                let _ = reply.send(rx);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: RelayEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());

        let current = self
            .sessions
            .get(event.streamer_id())
            .is_some_and(|s| s.generation == event.generation());
        if !current {
            debug!(streamer = %event.streamer_id(), generation = event.generation(), "Ignoring event from a closed session");
            return;
        }

        match event {
            RelayEvent::Health(transition) => {
                let _ = self.scene_tx.send(transition.into());
            }
            RelayEvent::Receive {
                streamer_id,
                state: ReceiveState::Closed,
                ..
            } => {
                info!(streamer = %streamer_id, "Session idle, closing");
                let port = self.sessions.get(&streamer_id).map(|s| s.lease.port());
                self.close(&streamer_id, "idle");
                if let (true, Some(port)) = (self.config.auto_reopen, port) {
                    debug!(streamer = %streamer_id, port, "Reopen queued");
                    self.pending_reopen.insert(streamer_id, port);
                }
            }
            RelayEvent::Receive {
                streamer_id,
                generation,
                state: ReceiveState::Live,
            } => {
                self.resume_scene(&streamer_id, generation);
                self.reconcile(&streamer_id);
            }
            RelayEvent::Receive { streamer_id, .. } => self.reconcile(&streamer_id),
            RelayEvent::Relay { .. } | RelayEvent::Failed { .. } => {}
        }
    }

    fn reconcile(&mut self, streamer_id: &str) {
        let Some(session) = self.sessions.get(streamer_id) else {
            return;
        };
        let status = session.receiver.status();
        let view = SessionView {
            generation: session.generation,
            state: status.state,
            ever_live: status.ever_live,
            port: session.lease.port(),
            endpoints: &session.endpoints,
        };
        self.orchestrator
            .reconcile(streamer_id, &view, &session.destinations);
    }

    /// Feed the committed health of a session that just went live to the
    /// scene controller
    fn resume_scene(&self, streamer_id: &str, generation: u64) {
        let Some(session) = self.sessions.get(streamer_id) else {
            return;
        };
        let state = session.health.read().state;
        let _ = self.scene_tx.send(SceneInput::Resumed {
            streamer_id: streamer_id.to_string(),
            generation,
            state,
        });
    }

    fn lookup(&self, streamer_id: &str) -> Result<StreamerProfile, SessionError> {
        self.directory
            .lookup(streamer_id)
            .ok_or_else(|| SessionError::UnknownStreamer(streamer_id.to_string()))
    }

    fn open(&mut self, streamer_id: &str) -> Result<u16, SessionError> {
        let profile = self.lookup(streamer_id)?;
        self.pending_reopen.remove(streamer_id);

        let lease = match self.retire(streamer_id) {
            Some(lease) => {
                info!(
                    streamer = %streamer_id,
                    port = lease.port(),
                    "New connection supersedes the existing session"
                );
                lease
            }
            None => self.ports.acquire(streamer_id)?,
        };
        self.start_session(streamer_id, lease, profile)
    }

    /// Stop the current session's tasks and hand back its lease
    ///
    /// `None` when there is no session or the sweep already reclaimed the port.
    fn retire(&mut self, streamer_id: &str) -> Option<PortLease> {
        let mut session = self.sessions.remove(streamer_id)?;
        self.stop_tasks(streamer_id, &mut session);
        let StreamerSession { lease, .. } = session;
        lease.is_held().then_some(lease)
    }

    /// Reopen idle-closed streamers whose previous port is free again
    ///
    /// A port taken by someone else in the meantime means any free port.
    fn reopen_pending(&mut self) {
        if self.pending_reopen.is_empty() {
            return;
        }
        let pending: Vec<(String, u16)> = self.pending_reopen.drain().collect();
        for (streamer_id, port) in pending {
            let profile = match self.lookup(&streamer_id) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(streamer = %streamer_id, error = %e, "Dropping queued reopen");
                    continue;
                }
            };
            let lease = match self.ports.acquire_port(&streamer_id, port) {
                Ok(lease) => lease,
                Err(PortError::Quarantined(_)) => {
                    self.pending_reopen.insert(streamer_id, port);
                    continue;
                }
                Err(e) => {
                    debug!(streamer = %streamer_id, port, error = %e, "Previous port unavailable");
                    match self.ports.acquire(&streamer_id) {
                        Ok(lease) => lease,
                        Err(e) => {
                            warn!(streamer = %streamer_id, error = %e, "Reopen postponed");
                            self.pending_reopen.insert(streamer_id, port);
                            continue;
                        }
                    }
                }
            };
            info!(streamer = %streamer_id, port = lease.port(), "Reopening session");
            if let Err(e) = self.start_session(&streamer_id, lease, profile) {
                warn!(streamer = %streamer_id, error = %e, "Failed to reopen session");
            }
        }
    }

    /// Start receiver and health tasks on an already leased port
    fn start_session(
        &mut self,
        streamer_id: &str,
        lease: PortLease,
        profile: StreamerProfile,
    ) -> Result<u16, SessionError> {
        let StreamerProfile {
            secret,
            destinations,
            ..
        } = profile;
        let secret = if secret.is_empty() {
            self.config.default_secret.clone()
        } else {
            secret
        };
        let port = lease.port();
        let slot = port - self.config.ports.base_port;
        let endpoints = LocalEndpoints::assign(&self.config.endpoints, slot, &destinations);
        let generation = self.next_generation;
        self.next_generation += 1;
        let now = Instant::now();

        let (sample_tx, sample_rx) = channel::unbounded();
        let health = Arc::new(RwLock::new(HealthRecord::initial(now)));
        let monitor = HealthMonitor::new(streamer_id, generation, self.config.health.clone(), now);
        let health_task =
            spawn_health_task(monitor, sample_rx, self.events.clone(), Arc::clone(&health))?;

        let context = ReceiverContext {
            streamer_id: streamer_id.to_string(),
            generation,
            port,
            key: FrameKey::new(streamer_id, &secret),
            targets: endpoints.addrs(),
        };
        let receiver = SessionReceiver::spawn(
            context,
            &self.config.receiver,
            self.config.receiver.mode,
            sample_tx,
            self.events.clone(),
        )?;

        info!(
            streamer = %streamer_id,
            port,
            generation,
            destinations = endpoints.len(),
            "Session opened"
        );
        self.sessions.insert(
            streamer_id.to_string(),
            StreamerSession {
                generation,
                lease,
                endpoints,
                destinations,
                receiver,
                health_task,
                health,
            },
        );
        Ok(port)
    }

    /// Stop a session's tasks without touching its lease
    fn stop_tasks(&mut self, streamer_id: &str, session: &mut StreamerSession) {
        let timeout = self.config.close_timeout;
        if !session.receiver.stop(timeout) {
            warn!(streamer = %streamer_id, "Receiver did not stop in time");
        }
        if !session.health_task.stop(timeout) {
            warn!(streamer = %streamer_id, "Health task did not stop in time");
        }
        if !self.orchestrator.stop_streamer(streamer_id) {
            warn!(streamer = %streamer_id, "Some relays were detached while stopping");
        }
    }

    fn close(&mut self, streamer_id: &str, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(streamer_id) else {
            return false;
        };
        self.stop_tasks(streamer_id, &mut session);

        let port = session.lease.port();
        if !session.lease.release() {
            debug!(streamer = %streamer_id, port, "Port was already reclaimed");
        }
        info!(streamer = %streamer_id, port, reason, "Session closed");
        true
    }

    fn reconfigure(&mut self, streamer_id: &str) -> Result<bool, SessionError> {
        let Some(profile) = self.directory.lookup(streamer_id) else {
            return Err(SessionError::UnknownStreamer(streamer_id.to_string()));
        };
        let waiting = self
            .sessions
            .get(streamer_id)
            .map(|s| !s.receiver.status().ever_live);

        match waiting {
            Some(true) => {
                info!(
                    streamer = %streamer_id,
                    destinations = profile.destinations.len(),
                    "Destinations changed, reopening idle session"
                );
                self.open(streamer_id)?;
                Ok(true)
            }
            Some(false) => {
                info!(streamer = %streamer_id, "Destinations changed, applying to the next session");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn snapshot(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|(streamer_id, session)| {
                let receiver = session.receiver.status();
                let health = *session.health.read();
                SessionStatus {
                    streamer_id: streamer_id.clone(),
                    generation: session.generation,
                    port: session.lease.port(),
                    mode: receiver.mode,
                    receive_state: receiver.state,
                    ever_live: receiver.ever_live,
                    health: HealthSummary {
                        score: health.score,
                        state: health.state,
                    },
                    scene: self.scene.shown(streamer_id),
                    relays: self.orchestrator.statuses(streamer_id),
                    frames_rejected: receiver.frames_rejected,
                    bytes_delivered: receiver.bytes_delivered,
                    reorder: receiver.reorder,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.streamer_id.cmp(&b.streamer_id));
        statuses
    }

    fn housekeeping(&mut self, now: Instant) {
        self.reopen_pending();
        for streamer_id in self.orchestrator.reap() {
            self.reconcile(&streamer_id);
        }
        if !self.sweep.try_fire(now) {
            return;
        }

        for session in self.sessions.values() {
            if !session.receiver.is_finished() {
                session.lease.touch();
            }
        }

        for (streamer_id, port) in self.ports.sweep(now) {
            let owned = self
                .sessions
                .get(&streamer_id)
                .is_some_and(|s| s.lease.port() == port);
            if owned {
                warn!(streamer = %streamer_id, port, "Session lost its receiver, closing");
                self.close(&streamer_id, "orphaned");
            }
        }
    }

    fn shutdown(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for streamer_id in ids {
            self.close(&streamer_id, "shutdown");
        }
        self.orchestrator.stop_all();
        if !self.scene.stop(self.config.close_timeout) {
            warn!("Scene controller did not stop in time");
        }
        info!("Relay server stopped");
    }
}
