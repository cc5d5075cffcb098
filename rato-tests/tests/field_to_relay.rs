//! Field agent bonding engine against a real relay server
//!
//! The engine forwards encoder datagrams over two loopback links. Link
//! events drive it through total loss and recovery while the relay keeps
//! the session, its scene and its port.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rato::bonding::{BondingPolicy, LinkEvent, NetworkLink, SessionLifecycle};
use rato::relay::{
    EndpointConfig, HealthConfig, IngestMode, PortAllocatorConfig, PublisherLauncher,
    PublisherProcess, ReceiveState, ReceiverConfig, RelayError, RelayEvent, SceneConfig,
    SceneError, SceneSwitcher, SessionStatus, StaticDirectory, StreamerProfile,
};
use rato::{
    BondingEngine, EngineConfig, LinkMetrics, RelayConfig, RelayDestination, RelayHandle,
    RelayServer,
};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(8);

struct Idle {
    stopped: bool,
}

impl PublisherProcess for Idle {
    fn poll_progress(&mut self) -> bool {
        !self.stopped
    }

    fn try_wait(&mut self) -> Option<String> {
        self.stopped.then(|| "stopped".to_string())
    }

    fn stop(&mut self, _grace: Duration) {
        self.stopped = true;
    }
}

struct IdleLauncher;

impl PublisherLauncher for IdleLauncher {
    fn launch(
        &self,
        _input: SocketAddr,
        _destination: &RelayDestination,
    ) -> Result<Box<dyn PublisherProcess>, RelayError> {
        Ok(Box::new(Idle { stopped: false }))
    }
}

#[derive(Default)]
struct RecordingSwitcher {
    calls: Mutex<Vec<String>>,
}

impl RecordingSwitcher {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl SceneSwitcher for RecordingSwitcher {
    fn switch(&self, _streamer_id: &str, scene_name: &str) -> Result<(), SceneError> {
        self.calls.lock().push(scene_name.to_string());
        Ok(())
    }
}

/// Pushes transport stream sized datagrams at the engine input
struct Encoder {
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Encoder {
    fn start(input: SocketAddr) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let thread = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
                let mut n = 0u8;
                while !done.load(Ordering::SeqCst) {
                    let _ = socket.send_to(&[n; 188], input);
                    n = n.wrapping_add(1);
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };
        Encoder {
            done,
            thread: Some(thread),
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Field {
    engine: BondingEngine,
    links: Sender<LinkEvent>,
    _encoder: Encoder,
}

impl Field {
    fn start(relay_port: u16) -> Self {
        let input_port = UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = EngineConfig {
            streamer_id: "cam".to_string(),
            secret: "field-secret".to_string(),
            server_port: relay_port,
            input_port,
            dedicated_sender: None,
            report_interval: Duration::from_millis(100),
            pin_interfaces: false,
            policy: BondingPolicy {
                reconnect_steps: vec![Duration::from_millis(100)],
                max_reconnect_attempts: 1000,
            },
            ..Default::default()
        };
        let (links, rx) = channel::unbounded();
        let engine = BondingEngine::spawn(config, 31, rx).unwrap();
        let field = Field {
            engine,
            links,
            _encoder: Encoder::start(SocketAddr::from(([127, 0, 0, 1], input_port))),
        };
        field.links_up();
        field.wait_lifecycle(SessionLifecycle::Active);
        field
    }

    fn links_up(&self) {
        for (id, name) in [(0, "wlan0"), (1, "wwan0")] {
            let mut link = NetworkLink::discovered(id, name);
            link.apply_sample(
                LinkMetrics {
                    rtt_ms: 20.0,
                    jitter_ms: 2.0,
                    loss_ratio: 0.0,
                    est_bandwidth_kbps: 5000.0,
                },
                50,
                Instant::now(),
            );
            self.links.send(LinkEvent::Sample(link)).unwrap();
        }
    }

    fn links_down(&self) {
        for (id, name) in [(0, "wlan0"), (1, "wwan0")] {
            let mut link = NetworkLink::discovered(id, name);
            link.mark_down(Instant::now());
            self.links.send(LinkEvent::Down(link)).unwrap();
        }
    }

    fn wait_lifecycle(&self, lifecycle: SessionLifecycle) {
        let deadline = Instant::now() + WAIT;
        while self.engine.status().lifecycle != lifecycle {
            assert!(Instant::now() < deadline, "engine never reached {:?}", lifecycle);
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn relay_config(base: u16, idle_timeout: Duration, auto_reopen: bool) -> RelayConfig {
    RelayConfig {
        ports: PortAllocatorConfig {
            base_port: base,
            port_count: 1,
            reuse_delay: Duration::from_millis(300),
            orphan_timeout: Duration::from_secs(60),
        },
        endpoints: EndpointConfig {
            local_base_port: base + 50,
            max_destinations: 1,
        },
        receiver: ReceiverConfig {
            mode: IngestMode::Native,
            bind_ip: [127, 0, 0, 1].into(),
            latency: Duration::from_millis(50),
            stall_timeout: Duration::from_millis(200),
            idle_timeout,
            check_interval: Duration::from_millis(50),
            max_links: 2,
            ..Default::default()
        },
        health: HealthConfig {
            dwell_samples: 2,
            ..Default::default()
        },
        scene: SceneConfig {
            fallback_delay: Duration::from_millis(100),
            recovery_delay: Duration::from_millis(100),
            ..Default::default()
        },
        auto_reopen,
        close_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn spawn_relay(config: RelayConfig, switcher: Arc<RecordingSwitcher>) -> RelayServer {
    let directory = StaticDirectory::new([StreamerProfile::new("cam", "field-secret")
        .with_destination(RelayDestination::new("main", "rtmp://ingest.example/live/KEY"))]);
    RelayServer::spawn(config, Arc::new(directory), Arc::new(IdleLauncher), switcher).unwrap()
}

fn wait_status(handle: &RelayHandle, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = handle.snapshot().unwrap().into_iter().find(|s| pred(s)) {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out waiting for session status");
        thread::sleep(Duration::from_millis(20));
    }
}

fn wait_receive(events: &Receiver<RelayEvent>, generation: u64, state: ReceiveState) {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(RelayEvent::Receive {
                generation: g,
                state: s,
                ..
            }) if g == generation && s == state => return,
            Ok(_) => {}
            Err(_) => panic!("timed out waiting for {:?}", state),
        }
    }
}

fn wait_calls(switcher: &RecordingSwitcher, expected: &[&str]) {
    let deadline = Instant::now() + WAIT;
    while switcher.calls().len() < expected.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(switcher.calls()[..expected.len()], *expected);
}

#[test]
fn test_frames_flow_again_after_link_recovery() {
    let switcher = Arc::new(RecordingSwitcher::default());
    let server = spawn_relay(
        relay_config(39400, Duration::from_secs(30), false),
        Arc::clone(&switcher),
    );
    let handle = server.handle();
    let events = handle.subscribe().unwrap();
    let port = handle.open("cam").unwrap();

    let field = Field::start(port);
    wait_receive(&events, 1, ReceiveState::Live);
    let before = wait_status(&handle, |s| s.reorder.frames_delivered >= 20);
    // Both links carry every datagram
    let before = wait_status(&handle, |s| {
        s.reorder.duplicates_dropped > 0
            && s.reorder.frames_delivered > before.reorder.frames_delivered
    });

    field.links_down();
    field.wait_lifecycle(SessionLifecycle::Reconnecting);
    wait_calls(&switcher, &["BRB"]);
    let stalled = handle.snapshot().unwrap()[0].reorder;

    field.links_up();
    field.wait_lifecycle(SessionLifecycle::Active);
    let after = wait_status(&handle, |s| s.reorder.frames_delivered >= stalled.frames_delivered + 20);
    assert_eq!(after.generation, 1);
    assert_eq!(after.port, port);
    assert!(after.bytes_delivered > before.bytes_delivered);
    wait_calls(&switcher, &["BRB", "LIVE"]);

    drop(field);
    server.shutdown();
}

#[test]
fn test_outage_closes_and_reopened_session_goes_live() {
    let switcher = Arc::new(RecordingSwitcher::default());
    let server = spawn_relay(
        relay_config(39500, Duration::from_millis(600), true),
        Arc::clone(&switcher),
    );
    let handle = server.handle();
    let events = handle.subscribe().unwrap();
    let port = handle.open("cam").unwrap();

    let field = Field::start(port);
    wait_receive(&events, 1, ReceiveState::Live);

    field.links_down();
    wait_calls(&switcher, &["BRB"]);
    wait_receive(&events, 1, ReceiveState::Closed);

    // Reopened on the same port once the quarantine is over
    let reopened = wait_status(&handle, |s| s.generation == 2);
    assert_eq!(reopened.port, port);
    assert_eq!(reopened.receive_state, ReceiveState::WaitingForData);

    field.links_up();
    field.wait_lifecycle(SessionLifecycle::Active);
    wait_receive(&events, 2, ReceiveState::Live);
    wait_status(&handle, |s| s.generation == 2 && s.reorder.frames_delivered > 0);
    wait_calls(&switcher, &["BRB", "LIVE"]);

    drop(field);
    assert!(handle.close("cam").unwrap());
    server.shutdown();
}
