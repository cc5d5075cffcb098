//! Dedicated bonding sender
//!
//! Wraps the external `srtla_send` process used in protocol-bonded mode.
//! The process receives SRT from the encoder on a local port and spreads it
//! over the interfaces it was started with.

use rato_io::{ManagedChild, StopOutcome};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Running `srtla_send`
pub struct DedicatedSender {
    child: ManagedChild,
    listen_port: u16,
}

impl DedicatedSender {
    /// Command line: `srtla_send <listen_port> <host> <port> <iface>...`
    pub fn command(
        binary: &Path,
        listen_port: u16,
        host: &str,
        port: u16,
        interfaces: &[String],
    ) -> Command {
        let mut command = Command::new(binary);
        command
            .arg(listen_port.to_string())
            .arg(host)
            .arg(port.to_string())
            .args(interfaces);
        command
    }

    pub fn launch(
        binary: &Path,
        listen_port: u16,
        host: &str,
        port: u16,
        interfaces: &[String],
    ) -> io::Result<Self> {
        let mut command = Self::command(binary, listen_port, host, port, interfaces);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = ManagedChild::spawn("srtla_send", &mut command)?;
        if let Some(stderr) = child.take_stderr() {
            thread::Builder::new()
                .name("srtla-send-log".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        let line = line.trim();
                        if !line.is_empty() {
                            debug!(target: "srtla_send", "{}", line);
                        }
                    }
                })?;
        }

        info!(
            listen_port,
            server = %format!("{}:{}", host, port),
            links = %interfaces.join(","),
            "Dedicated bonding sender started"
        );
        Ok(DedicatedSender { child, listen_port })
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Exit status once the process is gone
    pub fn exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn stop(&mut self, grace: Duration) -> io::Result<StopOutcome> {
        self.child.stop(grace)
    }
}
