//! Relay event bus messages

use crate::health::HealthTransition;
use crate::receiver::ReceiveState;
use crate::supervisor::RelayProcessState;

/// Everything session tasks report to the session manager
///
/// Subscribers see the same stream, in the order the manager received it.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Receive state of a session changed
    Receive {
        streamer_id: String,
        generation: u64,
        state: ReceiveState,
    },
    /// Committed health transition
    Health(HealthTransition),
    /// Publisher process state changed
    Relay {
        streamer_id: String,
        generation: u64,
        platform: String,
        state: RelayProcessState,
        restarts: u32,
    },
    /// Publisher gave up after exceeding its restart cap
    Failed {
        streamer_id: String,
        generation: u64,
        platform: String,
        restarts: u32,
        last_exit: Option<String>,
    },
}

impl RelayEvent {
    pub fn streamer_id(&self) -> &str {
        match self {
            RelayEvent::Receive { streamer_id, .. }
            | RelayEvent::Relay { streamer_id, .. }
            | RelayEvent::Failed { streamer_id, .. } => streamer_id,
            RelayEvent::Health(t) => &t.streamer_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            RelayEvent::Receive { generation, .. }
            | RelayEvent::Relay { generation, .. }
            | RelayEvent::Failed { generation, .. } => *generation,
            RelayEvent::Health(t) => t.generation,
        }
    }
}
