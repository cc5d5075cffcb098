//! RatoNet CLI Library
//!
//! Shared functionality for the field agent and relay binaries.

pub mod config;
pub mod stats;

pub use config::{
    Config, ConfigError, DestinationEntry, FieldConfig, HealthSection, IngestSection,
    PortsSection, PublisherSection, RelaySection, SceneSection, Secret, StreamerEntry,
};
pub use stats::{display_bonding_status, display_sessions, format_bandwidth, format_bytes};
