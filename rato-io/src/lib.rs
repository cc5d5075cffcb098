//! RatoNet I/O and Platform Abstraction
//!
//! Network and process plumbing shared by the field agent and the relay:
//! UDP link sockets, backoff schedules and timers, and bounded control of
//! external child processes.

pub mod process;
pub mod socket;
pub mod time;

pub use process::{find_binary, run_with_timeout, CommandOutput, ManagedChild, StopOutcome};
pub use socket::{LinkSocket, SocketError};
pub use time::{Backoff, Timer};
