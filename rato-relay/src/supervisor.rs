//! Publisher supervision
//!
//! One supervisor thread per (session, destination). It launches the
//! publisher, watches its progress and restarts it with exponential backoff
//! until the restart cap is reached.

use crate::destination::RelayDestination;
use crate::events::RelayEvent;
use crate::ports::PortRef;
use crate::task::TaskHandle;
use crossbeam::channel::{RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rato_io::{Backoff, ManagedChild};
use serde::Serialize;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Publisher errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Publisher for {platform} exited: {exit}")]
    PublisherCrash { platform: String, exit: String },

    #[error("Failed to launch publisher for {platform}: {source}")]
    Launch {
        platform: String,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of one publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProcessState {
    Starting,
    Running,
    BackoffWait,
    Stopped,
    Failed,
}

impl RelayProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayProcessState::Stopped | RelayProcessState::Failed)
    }
}

impl fmt::Display for RelayProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayProcessState::Starting => "starting",
            RelayProcessState::Running => "running",
            RelayProcessState::BackoffWait => "backoff",
            RelayProcessState::Stopped => "stopped",
            RelayProcessState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one publisher; the target is masked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayProcessStatus {
    pub platform: String,
    pub target_masked: String,
    pub state: RelayProcessState,
    pub restarts: u32,
    pub last_exit: Option<String>,
}

/// A running publisher
pub trait PublisherProcess: Send {
    /// True if the publisher reported progress since the last call
    fn poll_progress(&mut self) -> bool;

    /// Exit description once the publisher has gone
    fn try_wait(&mut self) -> Option<String>;

    /// Ask the publisher to finish, killing it after `grace`
    fn stop(&mut self, grace: Duration);
}

/// Starts publishers
pub trait PublisherLauncher: Send + Sync {
    fn launch(
        &self,
        input: SocketAddr,
        destination: &RelayDestination,
    ) -> Result<Box<dyn PublisherProcess>, RelayError>;
}

/// Supervision policy
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Restarts allowed before the publisher is marked failed
    pub max_restarts: u32,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_restarts: 10,
            stop_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Who the supervisor publishes for
#[derive(Debug, Clone)]
pub struct SupervisorContext {
    pub streamer_id: String,
    pub generation: u64,
    /// Local endpoint the publisher reads from
    pub input: SocketAddr,
    pub destination: RelayDestination,
}

struct StatusCell {
    streamer_id: String,
    generation: u64,
    platform: String,
    status: Arc<RwLock<RelayProcessStatus>>,
    events: Sender<RelayEvent>,
}

impl StatusCell {
    fn set(&self, state: RelayProcessState, restarts: u32, last_exit: Option<String>) {
        let changed = {
            let mut status = self.status.write();
            let changed = status.state != state;
            status.state = state;
            status.restarts = restarts;
            if last_exit.is_some() {
                status.last_exit = last_exit.clone();
            }
            changed
        };
        if !changed {
            return;
        }

        let event = if state == RelayProcessState::Failed {
            RelayEvent::Failed {
                streamer_id: self.streamer_id.clone(),
                generation: self.generation,
                platform: self.platform.clone(),
                restarts,
                last_exit,
            }
        } else {
            RelayEvent::Relay {
                streamer_id: self.streamer_id.clone(),
                generation: self.generation,
                platform: self.platform.clone(),
                state,
                restarts,
            }
        };
        let _ = self.events.send(event);
    }
}

/// Handle to a supervisor thread
pub struct RelaySupervisor {
    platform: String,
    generation: u64,
    status: Arc<RwLock<RelayProcessStatus>>,
    task: TaskHandle,
    stop_timeout: Duration,
}

impl RelaySupervisor {
    /// Start supervising; `pin` keeps the session's receive port reserved
    /// until the thread exits
    pub fn spawn(
        context: SupervisorContext,
        config: SupervisorConfig,
        launcher: Arc<dyn PublisherLauncher>,
        events: Sender<RelayEvent>,
        pin: Option<PortRef>,
    ) -> io::Result<Self> {
        let platform = context.destination.platform.clone();
        let status = Arc::new(RwLock::new(RelayProcessStatus {
            platform: platform.clone(),
            target_masked: context.destination.target.masked(),
            state: RelayProcessState::Starting,
            restarts: 0,
            last_exit: None,
        }));
        let cell = StatusCell {
            streamer_id: context.streamer_id.clone(),
            generation: context.generation,
            platform: platform.clone(),
            status: Arc::clone(&status),
            events,
        };
        let stop_timeout = config.stop_grace + Duration::from_secs(1);
        let name = format!("relay-{}-{}", context.streamer_id, platform);

        let task = TaskHandle::spawn(name, move |stop| {
            let _pin = pin;
            let destination = &context.destination;
            let masked = destination.target.masked();
            let mut backoff = Backoff::exponential(config.backoff_initial, config.backoff_max);
            let mut restarts = 0u32;

            loop {
                cell.set(RelayProcessState::Starting, restarts, None);
                info!(
                    streamer = %context.streamer_id,
                    destination = %masked,
                    platform = %destination.platform,
                    input = %context.input,
                    "Starting publisher"
                );

                let exit = match launcher.launch(context.input, destination) {
                    Ok(mut process) => {
                        let mut running = false;
                        loop {
                            match stop.recv_timeout(config.poll_interval) {
                                Err(RecvTimeoutError::Timeout) => {}
                                _ => {
                                    process.stop(config.stop_grace);
                                    cell.set(RelayProcessState::Stopped, restarts, None);
                                    info!(streamer = %context.streamer_id, destination = %masked, "Publisher stopped");
                                    return;
                                }
                            }
                            if process.poll_progress() && !running {
                                running = true;
                                backoff.reset();
                                cell.set(RelayProcessState::Running, restarts, None);
                                debug!(streamer = %context.streamer_id, destination = %masked, "Publisher running");
                            }
                            if let Some(exit) = process.try_wait() {
                                break exit;
                            }
                        }
                    }
                    Err(e) => e.to_string(),
                };

                let crash = RelayError::PublisherCrash {
                    platform: destination.platform.clone(),
                    exit: exit.clone(),
                };
                if restarts >= config.max_restarts {
                    error!(
                        streamer = %context.streamer_id,
                        destination = %masked,
                        restarts,
                        error = %crash,
                        "Publisher exceeded restart cap, giving up"
                    );
                    cell.set(RelayProcessState::Failed, restarts, Some(exit));
                    return;
                }

                let delay = backoff.next_delay().unwrap_or(config.backoff_max);
                warn!(
                    streamer = %context.streamer_id,
                    destination = %masked,
                    restarts,
                    delay_ms = delay.as_millis() as u64,
                    error = %crash,
                    "Publisher crashed, restarting"
                );
                cell.set(RelayProcessState::BackoffWait, restarts, Some(exit));
                restarts += 1;

                match stop.recv_timeout(delay) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => {
                        cell.set(RelayProcessState::Stopped, restarts, None);
                        return;
                    }
                }
            }
        })?;

        Ok(RelaySupervisor {
            platform,
            generation: context.generation,
            status,
            task,
            stop_timeout,
        })
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> RelayProcessStatus {
        self.status.read().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the publisher and join the thread, bounded by the stop grace
    pub fn stop(&mut self) -> bool {
        self.task.stop(self.stop_timeout)
    }
}

/// Container format for a target URL
pub fn output_format(target: &str) -> &'static str {
    match target.split_once("://").map(|(scheme, _)| scheme) {
        Some("srt") | Some("udp") | Some("rtp") => "mpegts",
        _ => "flv",
    }
}

/// Publishes with `ffmpeg`
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    binary: PathBuf,
    reencode: bool,
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        FfmpegLauncher {
            binary: PathBuf::from("ffmpeg"),
            reencode: false,
        }
    }
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<PathBuf>, reencode: bool) -> Self {
        FfmpegLauncher {
            binary: binary.into(),
            reencode,
        }
    }

    /// The full command line; it carries the raw target, so never log it
    pub fn command(&self, input: SocketAddr, destination: &RelayDestination) -> Command {
        let target = destination.target.expose();
        let mut command = Command::new(&self.binary);
        command
            .args(["-hide_banner", "-loglevel", "warning", "-nostats"])
            .args(["-progress", "pipe:1"])
            .arg("-i")
            .arg(format!("udp://{}?overrun_nonfatal=1", input));
        if self.reencode {
            command.args([
                "-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac",
            ]);
        } else {
            command.args(["-c", "copy"]);
        }
        command.args(["-f", output_format(target)]).arg(target);
        command
    }
}

impl PublisherLauncher for FfmpegLauncher {
    fn launch(
        &self,
        input: SocketAddr,
        destination: &RelayDestination,
    ) -> Result<Box<dyn PublisherProcess>, RelayError> {
        let mut command = self.command(input, destination);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let launch_error = |source| RelayError::Launch {
            platform: destination.platform.clone(),
            source,
        };
        let mut child = ManagedChild::spawn(format!("ffmpeg-{}", destination.platform), &mut command)
            .map_err(launch_error)?;

        let progress = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));

        if let Some(stdout) = child.take_stdout() {
            let progress = Arc::clone(&progress);
            thread::Builder::new()
                .name("ffmpeg-progress".to_string())
                .spawn(move || {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        if line.starts_with("progress=") || line.starts_with("out_time") {
                            progress.store(true, Ordering::Relaxed);
                        }
                    }
                })
                .map_err(launch_error)?;
        }

        if let Some(stderr) = child.take_stderr() {
            let last_error = Arc::clone(&last_error);
            let raw = destination.target.expose().to_string();
            let masked = destination.target.masked();
            thread::Builder::new()
                .name("ffmpeg-log".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let line = if raw.is_empty() {
                            line.to_string()
                        } else {
                            line.replace(&raw, &masked)
                        };
                        debug!(target: "ffmpeg", destination = %masked, "{}", line);
                        *last_error.lock() = Some(line);
                    }
                })
                .map_err(launch_error)?;
        }

        Ok(Box::new(FfmpegProcess {
            child,
            progress,
            last_error,
        }))
    }
}

struct FfmpegProcess {
    child: ManagedChild,
    progress: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl PublisherProcess for FfmpegProcess {
    fn poll_progress(&mut self) -> bool {
        self.progress.swap(false, Ordering::Relaxed)
    }

    fn try_wait(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => Some(match self.last_error.lock().take() {
                Some(line) => format!("{} ({})", status, line),
                None => status.to_string(),
            }),
            Err(e) => Some(e.to_string()),
        }
    }

    fn stop(&mut self, grace: Duration) {
        if let Err(e) = self.child.stop(grace) {
            warn!(process = %self.child.name(), error = %e, "Failed to stop publisher");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    /// Crashes right away, optionally after reporting progress
    struct CrashingLauncher {
        launches: AtomicU32,
        progress_first: bool,
    }

    struct Crashing {
        progress: bool,
    }

    impl PublisherProcess for Crashing {
        fn poll_progress(&mut self) -> bool {
            std::mem::take(&mut self.progress)
        }

        fn try_wait(&mut self) -> Option<String> {
            Some("exit status: 1".to_string())
        }

        fn stop(&mut self, _grace: Duration) {}
    }

    impl PublisherLauncher for CrashingLauncher {
        fn launch(
            &self,
            _input: SocketAddr,
            _destination: &RelayDestination,
        ) -> Result<Box<dyn PublisherProcess>, RelayError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Crashing {
                progress: self.progress_first,
            }))
        }
    }

    /// Runs until stopped
    struct SteadyLauncher;

    struct Steady {
        stopped: bool,
    }

    impl PublisherProcess for Steady {
        fn poll_progress(&mut self) -> bool {
            true
        }

        fn try_wait(&mut self) -> Option<String> {
            self.stopped.then(|| "stopped".to_string())
        }

        fn stop(&mut self, _grace: Duration) {
            self.stopped = true;
        }
    }

    impl PublisherLauncher for SteadyLauncher {
        fn launch(
            &self,
            _input: SocketAddr,
            _destination: &RelayDestination,
        ) -> Result<Box<dyn PublisherProcess>, RelayError> {
            Ok(Box::new(Steady { stopped: false }))
        }
    }

    fn context() -> SupervisorContext {
        SupervisorContext {
            streamer_id: "s1".to_string(),
            generation: 1,
            input: "127.0.0.1:20000".parse().unwrap(),
            destination: RelayDestination::new("youtube", "rtmp://a.rtmp.youtube.com/live2/SECRET"),
        }
    }

    fn fast_config(max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            max_restarts,
            stop_grace: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn wait_for(supervisor: &RelaySupervisor, state: RelayProcessState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if supervisor.status().state == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_restart_cap_ends_failed() {
        let launcher = Arc::new(CrashingLauncher {
            launches: AtomicU32::new(0),
            progress_first: false,
        });
        let (tx, rx) = channel::unbounded();
        let supervisor =
            RelaySupervisor::spawn(context(), fast_config(3), launcher.clone(), tx, None).unwrap();

        assert!(wait_for(&supervisor, RelayProcessState::Failed));
        let status = supervisor.status();
        assert_eq!(status.restarts, 3);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 4);
        assert_eq!(status.last_exit.as_deref(), Some("exit status: 1"));

        let failed = rx
            .try_iter()
            .filter(|e| matches!(e, RelayEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_stop_running_publisher() {
        let (tx, rx) = channel::unbounded();
        let mut supervisor =
            RelaySupervisor::spawn(context(), fast_config(3), Arc::new(SteadyLauncher), tx, None)
                .unwrap();

        assert!(wait_for(&supervisor, RelayProcessState::Running));
        assert!(supervisor.stop());
        assert_eq!(supervisor.status().state, RelayProcessState::Stopped);
        assert_eq!(supervisor.status().restarts, 0);

        let states: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                RelayEvent::Relay { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![RelayProcessState::Running, RelayProcessState::Stopped]
        );
    }

    #[test]
    fn test_status_is_masked() {
        let (tx, _rx) = channel::unbounded();
        let mut supervisor =
            RelaySupervisor::spawn(context(), fast_config(0), Arc::new(SteadyLauncher), tx, None)
                .unwrap();
        let status = supervisor.status();
        assert_eq!(status.target_masked, "rtmp://a.rtmp.youtube.com/***");
        assert!(!format!("{:?}", status).contains("SECRET"));
        supervisor.stop();
    }

    #[test]
    fn test_ffmpeg_command_line() {
        let launcher = FfmpegLauncher::new("/usr/bin/ffmpeg", false);
        let command = launcher.command(
            "127.0.0.1:20001".parse().unwrap(),
            &RelayDestination::new("youtube", "rtmp://a.rtmp.youtube.com/live2/KEY"),
        );
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "warning",
                "-nostats",
                "-progress",
                "pipe:1",
                "-i",
                "udp://127.0.0.1:20001?overrun_nonfatal=1",
                "-c",
                "copy",
                "-f",
                "flv",
                "rtmp://a.rtmp.youtube.com/live2/KEY",
            ]
        );

        let reencode = FfmpegLauncher::new("ffmpeg", true).command(
            "127.0.0.1:20001".parse().unwrap(),
            &RelayDestination::new("srt", "srt://ingest.example.com:9000?streamid=K"),
        );
        let args: Vec<_> = reencode
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"mpegts".to_string()));
    }
}
