//! RatoNet Relay
//!
//! Server side of the bonded uplink. Each streamer gets a leased receive
//! port and a session made of a receiver, a health monitor and one
//! publisher supervisor per enabled destination. The session manager owns
//! them all; the scene controller follows committed health changes.

pub mod destination;
pub mod directory;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod ports;
pub mod receiver;
pub mod scene;
pub mod server;
pub mod supervisor;
pub mod task;

pub use destination::{RelayDestination, SecretUrl};
pub use directory::{StaticDirectory, StreamerDirectory, StreamerProfile};
pub use events::RelayEvent;
pub use health::{
    score_sample, spawn_health_task, HealthBounds, HealthConfig, HealthConfigError,
    HealthDebouncer, HealthMonitor, HealthRecord, HealthState, HealthThresholds,
    HealthTransition, HealthWeights, MetricBounds, QualitySample,
};
pub use orchestrator::{EndpointConfig, LocalEndpoints, RelayOrchestrator, SessionView};
pub use ports::{PortAllocator, PortAllocatorConfig, PortError, PortLease, PortRef};
pub use receiver::{
    IngestMode, ProtocolConfig, QualityWindow, ReceiveState, ReceiveTracker, ReceiverConfig,
    ReceiverContext, ReceiverError, ReceiverStatus, SessionReceiver,
};
pub use scene::{
    CommandSwitcher, LogSwitcher, Scene, SceneConfig, SceneController, SceneError, SceneInput,
    SceneMapping, SceneState, SceneSwitcher,
};
pub use server::{
    HealthSummary, RelayConfig, RelayHandle, RelayServer, SessionError, SessionStatus,
};
pub use supervisor::{
    output_format, FfmpegLauncher, PublisherLauncher, PublisherProcess, RelayError,
    RelayProcessState, RelayProcessStatus, RelaySupervisor, SupervisorConfig, SupervisorContext,
};
pub use task::TaskHandle;
