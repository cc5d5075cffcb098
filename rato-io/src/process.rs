//! External process control
//!
//! The field agent and relay drive several external tools (`ping`, the
//! dedicated bonding sender and receiver, the publisher). Every interaction
//! with them is bounded in time: one-shot commands are killed at their
//! deadline and long-running children are stopped with a grace period
//! followed by a kill.

use std::env;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Locate an executable
///
/// Names containing a path separator are checked as given; bare names are
/// searched on `PATH`.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Output of a finished one-shot command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut r) = reader {
            let mut raw = Vec::new();
            if r.read_to_end(&mut raw).is_ok() {
                out = String::from_utf8_lossy(&raw).into_owned();
            }
        }
        out
    })
}

/// Run a command to completion, killing it at `timeout`
///
/// Returns `Ok(None)` when the deadline passed; the child has been killed and
/// reaped by then.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> io::Result<Option<CommandOutput>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait_deadline(&mut child, timeout)?;
    let status = match status {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout.join();
            let _ = stderr.join();
            return Ok(None);
        }
    };

    Ok(Some(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    }))
}

fn wait_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// How a managed child ended when stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period
    Exited(ExitStatus),
    /// Ignored the request and was killed
    Killed,
    /// Had already exited before the stop request
    AlreadyExited(ExitStatus),
}

/// Long-running child process owned by one supervisor
///
/// Dropping a `ManagedChild` kills and reaps the process, so a child never
/// outlives its owner.
#[derive(Debug)]
pub struct ManagedChild {
    name: String,
    child: Child,
}

impl ManagedChild {
    /// Spawn `command`; `name` labels log lines
    pub fn spawn(name: impl Into<String>, command: &mut Command) -> io::Result<Self> {
        let name = name.into();
        let child = command.spawn()?;
        debug!(process = %name, pid = child.id(), "Spawned child process");
        Ok(ManagedChild { name, child })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for exit at most `timeout`
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        wait_deadline(&mut self.child, timeout)
    }

    /// Take the child's stdout pipe, if it was piped
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the child's stderr pipe, if it was piped
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Ask the child to exit, then kill it after `grace`
    ///
    /// Children with a piped stdin receive `q` followed by EOF; others get
    /// `SIGTERM` on unix.
    pub fn stop(&mut self, grace: Duration) -> io::Result<StopOutcome> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(StopOutcome::AlreadyExited(status));
        }

        match self.child.stdin.take() {
            Some(mut stdin) => {
                let _ = stdin.write_all(b"q\n");
                let _ = stdin.flush();
            }
            None => self.terminate(),
        }

        if let Some(status) = self.wait_timeout(grace)? {
            debug!(process = %self.name, ?status, "Child exited after stop request");
            return Ok(StopOutcome::Exited(status));
        }

        warn!(
            process = %self.name,
            grace_ms = grace.as_millis() as u64,
            "Child ignored stop request, killing"
        );
        self.child.kill()?;
        self.child.wait()?;
        Ok(StopOutcome::Killed)
    }

    #[cfg(unix)]
    fn terminate(&self) {
        let pid = self.child.id().to_string();
        let sent = Command::new("kill")
            .args(["-TERM", pid.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = sent {
            debug!(process = %self.name, error = %e, "Could not deliver SIGTERM");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
            debug!(process = %self.name, "Killed child on drop");
        }
    }
}
