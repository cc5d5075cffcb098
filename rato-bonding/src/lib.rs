//! RatoNet Link Bonding
//!
//! Field side of the bonded uplink: the Link Monitor probing every
//! interface, the Bonding Engine choosing and driving a transport, and the
//! native multi-link sender. The reorder buffer used by the relay to merge
//! redundant copies lives here too.

pub mod dedicated;
pub mod engine;
pub mod monitor;
pub mod reorder;
pub mod sender;
pub mod session;

pub use dedicated::DedicatedSender;
pub use engine::{
    resolve_dedicated_sender, BondingEngine, BondingStatus, EngineConfig, EngineError, LinkStatus,
};
pub use monitor::{
    parse_ping_output, sample_link, InterfaceSource, LinkEvent, LinkMonitor, LinkProbe,
    MonitorConfig, NetworkLink, PingProbe, ProbeError, SysfsInterfaces, ThroughputMeter,
};
pub use reorder::{DeliveredFrame, ReorderBuffer, ReorderError, ReorderStats};
pub use sender::{MultiLinkSender, PathStats, SenderConfig, SenderError, SenderStats};
pub use session::{
    BondingAction, BondingMode, BondingPolicy, BondingState, BondingStateMachine, CloseReason,
    LinkFailure, SessionLifecycle,
};
