//! Native Multi-Link Sender
//!
//! Reads datagrams from the local encoder, frames them and sends the same
//! frame on every member path. The relay keeps the first copy of each
//! sequence number.

use bytes::Bytes;
use crossbeam::channel::{self, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use rato_crypto::FrameKey;
use rato_io::{LinkSocket, SocketError};
use rato_protocol::{Frame, FrameError, LinkReport};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Largest encoder datagram accepted
const MAX_INPUT_DATAGRAM: usize = 2048;

/// Sender errors
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Failed to start sender thread: {0}")]
    Thread(io::Error),

    #[error("No member paths")]
    NoPaths,
}

/// Per-path statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathStats {
    pub link_id: u8,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Sender statistics
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    /// Datagrams read from the encoder
    pub datagrams_in: u64,
    /// Datagrams dropped because no path was up
    pub dropped_no_path: u64,
    /// Link reports sent
    pub reports_sent: u64,
}

/// Where the sender reads and writes
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub streamer_id: String,
    pub run_id: u32,
    /// Local encoder input
    pub input: SocketAddr,
    /// Relay receive address
    pub server: SocketAddr,
    /// Pin each path socket to its interface
    pub pin_interfaces: bool,
    /// Sequence number of the first media frame
    ///
    /// A restarted sender under the same run id must continue where the
    /// previous one stopped, or the relay discards everything as duplicates.
    pub first_seq: u64,
}

struct PathSlot {
    name: String,
    socket: LinkSocket,
    stats: PathStats,
}

struct Shared {
    config: SenderConfig,
    key: FrameKey,
    paths: RwLock<Vec<PathSlot>>,
    next_seq: AtomicU64,
    stats: Mutex<SenderStats>,
}

impl Shared {
    /// Send `frame` on every path, stamped with each path's link id
    ///
    /// The link id is covered by the tag, so every copy is signed on its own.
    fn fan_out(&self, frame: &Frame) -> Result<usize, SenderError> {
        let mut paths = self.paths.write();
        let mut delivered = 0;

        for path in paths.iter_mut() {
            let mut copy = frame.clone();
            copy.header.link_id = path.stats.link_id;
            let bytes = copy.to_bytes(&self.key)?;

            match path.socket.send_to(&bytes, self.config.server) {
                Ok(n) => {
                    path.stats.frames_sent += 1;
                    path.stats.bytes_sent += n as u64;
                    delivered += 1;
                }
                Err(e) => {
                    path.stats.send_errors += 1;
                    trace!(link = %path.name, error = %e, "Send failed");
                }
            }
        }

        Ok(delivered)
    }
}

/// Running native multi-link sender
pub struct MultiLinkSender {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
    local_input: SocketAddr,
}

impl MultiLinkSender {
    /// Bind the encoder input and start forwarding over `paths`
    ///
    /// `paths` is `(link_id, interface)`.
    pub fn start(
        config: SenderConfig,
        key: FrameKey,
        paths: &[(u8, String)],
    ) -> Result<Self, SenderError> {
        let input = LinkSocket::bind(config.input)?;
        input.set_read_timeout(Some(Duration::from_millis(100)))?;
        let local_input = input.local_addr()?;

        let mut slots = Vec::with_capacity(paths.len());
        for (link_id, name) in paths {
            slots.push(open_path(*link_id, name, &config)?);
        }

        info!(
            streamer = %config.streamer_id,
            input = %local_input,
            server = %config.server,
            paths = slots.len(),
            "Native multi-link sender started"
        );

        let first_seq = config.first_seq;
        let shared = Arc::new(Shared {
            config,
            key,
            paths: RwLock::new(slots),
            next_seq: AtomicU64::new(first_seq),
            stats: Mutex::new(SenderStats::default()),
        });

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("multilink-sender".to_string())
            .spawn(move || {
                let mut buf = [0u8; MAX_INPUT_DATAGRAM];
                loop {
                    match stop_rx.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }

                    let n = match input.recv_from(&mut buf) {
                        Ok((n, _)) => n,
                        Err(e) if e.is_timeout() => continue,
                        Err(e) => {
                            warn!(error = %e, "Encoder input read failed");
                            continue;
                        }
                    };

                    worker.stats.lock().datagrams_in += 1;
                    let seq = worker.next_seq.fetch_add(1, Ordering::Relaxed);
                    let frame = Frame::media(
                        worker.config.streamer_id.clone(),
                        worker.config.run_id,
                        0,
                        seq,
                        Bytes::copy_from_slice(&buf[..n]),
                    );

                    match worker.fan_out(&frame) {
                        Ok(0) => worker.stats.lock().dropped_no_path += 1,
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Failed to frame datagram"),
                    }
                }
                debug!("Native multi-link sender stopped");
            })
            .map_err(SenderError::Thread)?;

        Ok(MultiLinkSender {
            shared,
            stop_tx,
            handle: Some(handle),
            local_input,
        })
    }

    /// Sequence number the next media frame will carry
    pub fn next_seq(&self) -> u64 {
        self.shared.next_seq.load(Ordering::Relaxed)
    }

    /// Address the encoder pushes to
    pub fn input_addr(&self) -> SocketAddr {
        self.local_input
    }

    /// Start sending on another interface
    pub fn add_path(&self, link_id: u8, name: &str) -> Result<(), SenderError> {
        if self.shared.paths.read().iter().any(|p| p.name == name) {
            return Ok(());
        }
        let slot = open_path(link_id, name, &self.shared.config)?;
        self.shared.paths.write().push(slot);
        info!(link = %name, "Path added");
        Ok(())
    }

    /// Stop sending on an interface
    pub fn remove_path(&self, name: &str) -> bool {
        let mut paths = self.shared.paths.write();
        let before = paths.len();
        paths.retain(|p| p.name != name);
        let removed = paths.len() != before;
        if removed {
            info!(link = %name, "Path removed");
        }
        removed
    }

    /// Send a link report on every path
    pub fn send_report(&self, report: &LinkReport) -> Result<usize, SenderError> {
        if self.shared.paths.read().is_empty() {
            return Err(SenderError::NoPaths);
        }
        let last_seq = self.shared.next_seq.load(Ordering::Relaxed).saturating_sub(1);
        let frame = Frame::link_report(
            self.shared.config.streamer_id.clone(),
            self.shared.config.run_id,
            0,
            last_seq,
            report.encode(),
        );
        let sent = self.shared.fan_out(&frame)?;
        self.shared.stats.lock().reports_sent += 1;
        Ok(sent)
    }

    pub fn path_names(&self) -> Vec<String> {
        self.shared.paths.read().iter().map(|p| p.name.clone()).collect()
    }

    pub fn path_stats(&self) -> Vec<PathStats> {
        self.shared
            .paths
            .read()
            .iter()
            .map(|p| p.stats.clone())
            .collect()
    }

    pub fn stats(&self) -> SenderStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the forwarding thread
    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MultiLinkSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_path(link_id: u8, name: &str, config: &SenderConfig) -> Result<PathSlot, SenderError> {
    let any: SocketAddr = if config.server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let socket = if config.pin_interfaces {
        match LinkSocket::bind_to_interface(any, name) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(link = %name, error = %e, "Cannot pin socket to interface, sending unpinned");
                LinkSocket::bind(any)?
            }
        }
    } else {
        LinkSocket::bind(any)?
    };

    Ok(PathSlot {
        name: name.to_string(),
        socket,
        stats: PathStats {
            link_id,
            ..Default::default()
        },
    })
}
