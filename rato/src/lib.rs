//! RatoNet - bonded field uplink and relay
//!
//! High-level API tying together the wire format, link bonding on the field
//! side and the session relay on the server side.

pub use rato_bonding as bonding;
pub use rato_crypto as crypto;
pub use rato_io as io;
pub use rato_protocol as protocol;
pub use rato_relay as relay;

// Re-export commonly used types
pub use bonding::{BondingEngine, BondingMode, EngineConfig, LinkMonitor, MonitorConfig};
pub use crypto::FrameKey;
pub use protocol::{Frame, FrameKind, LinkMetrics, LinkState};
pub use relay::{HealthState, RelayConfig, RelayDestination, RelayHandle, RelayServer, Scene};
