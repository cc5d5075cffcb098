//! Stoppable worker threads

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// Handle to a named worker thread
///
/// The worker gets a stop receiver. Completion is signalled by the worker's
/// end of a done channel disconnecting, which also happens if it panics, so
/// joins can always be bounded.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _done = done_tx;
            f(stop_rx);
        })?;

        Ok(TaskHandle {
            name,
            stop_tx,
            done_rx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.done_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Stop the worker and wait at most `timeout` for it
    ///
    /// Returns false if the worker was still running at the deadline; it is
    /// then detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.wait(timeout)
    }

    /// Wait at most `timeout` for the worker to finish by itself
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    task = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Task did not finish in time, detaching"
                );
                false
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.request_stop();
        if self.handle.is_some() && self.is_finished() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
