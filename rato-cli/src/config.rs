//! Configuration file support for RatoNet binaries
//!
//! A value comes from the environment when the matching variable is set,
//! otherwise from the TOML file, otherwise from the section default.

use rato_bonding::{BondingPolicy, EngineConfig, MonitorConfig, PingProbe, SysfsInterfaces};
use rato_relay::{
    CommandSwitcher, EndpointConfig, FfmpegLauncher, HealthBounds, HealthConfig, HealthThresholds,
    HealthWeights, IngestMode, LogSwitcher, PortAllocatorConfig, ProtocolConfig, ReceiverConfig,
    RelayConfig, RelayDestination, SceneConfig, SceneMapping, SceneSwitcher, StaticDirectory,
    StreamerProfile, SupervisorConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// String that never shows up in `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("***")
        }
    }
}

/// Field agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub streamer_id: String,
    pub secret: Secret,
    /// Relay host
    pub server_host: String,
    /// Receive port leased to this streamer
    pub server_port: u16,
    /// Local port the encoder pushes to
    pub input_port: u16,
    /// Latency in milliseconds
    pub latency_ms: u64,
    pub max_links: usize,
    /// Interfaces to bond even when discovery would skip them
    pub interfaces: Vec<String>,
    /// Dedicated bonding sender; unset forces native bonding
    pub dedicated_sender: Option<String>,
    pub pin_interfaces: bool,
    /// Address pinged through every link
    pub probe_target: String,
    pub probe_interval_secs: f64,
    pub report_interval_secs: f64,
    /// Links scoring below this are degraded
    pub degraded_below: u8,
    /// Statistics interval in seconds
    pub stats_interval_secs: u64,
}

impl Default for FieldConfig {
    fn default() -> Self {
        FieldConfig {
            streamer_id: String::new(),
            secret: Secret::default(),
            server_host: "127.0.0.1".to_string(),
            server_port: 9000,
            input_port: 5000,
            latency_ms: 500,
            max_links: 4,
            interfaces: Vec::new(),
            dedicated_sender: Some("srtla_send".to_string()),
            pin_interfaces: true,
            probe_target: "8.8.8.8".to_string(),
            probe_interval_secs: 1.0,
            report_interval_secs: 1.0,
            degraded_below: 50,
            stats_interval_secs: 5,
        }
    }
}

/// Receive port pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsSection {
    pub base_port: u16,
    pub port_count: u16,
    /// Quarantine after release
    pub reuse_delay_secs: f64,
    /// Leases not touched for this long are reclaimed
    pub orphan_timeout_secs: f64,
    pub sweep_interval_secs: f64,
}

impl Default for PortsSection {
    fn default() -> Self {
        PortsSection {
            base_port: 9000,
            port_count: 64,
            reuse_delay_secs: 2.0,
            orphan_timeout_secs: 120.0,
            sweep_interval_secs: 10.0,
        }
    }
}

/// Session reception
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub mode: IngestMode,
    pub bind_ip: IpAddr,
    /// Reorder budget in milliseconds
    pub latency_ms: u64,
    pub max_links: u32,
    pub max_buffer_frames: usize,
    pub stall_timeout_secs: f64,
    /// Silence after which a session closes
    pub idle_timeout_secs: f64,
    pub local_base_port: u16,
    /// Local endpoint slots per session
    pub max_destinations: u16,
    /// Reopen a closed session on the same port
    pub auto_reopen: bool,
    /// Secret for streamers configured without one
    pub default_secret: Secret,
    pub srtla_rec: String,
    pub bridge: String,
}

impl Default for IngestSection {
    fn default() -> Self {
        IngestSection {
            mode: IngestMode::Auto,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            latency_ms: 500,
            max_links: 4,
            max_buffer_frames: 4096,
            stall_timeout_secs: 5.0,
            idle_timeout_secs: 30.0,
            local_base_port: 20000,
            max_destinations: 4,
            auto_reopen: true,
            default_secret: Secret::default(),
            srtla_rec: "srtla_rec".to_string(),
            bridge: "srt-live-transmit".to_string(),
        }
    }
}

/// Health scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub degraded: u8,
    pub critical: u8,
    pub down: u8,
    /// Sample period in seconds
    pub check_interval_secs: f64,
    pub dwell_samples: u32,
    /// Window scores averaged before classification
    pub smoothing_samples: usize,
    pub weights: HealthWeights,
    pub bounds: HealthBounds,
}

impl Default for HealthSection {
    fn default() -> Self {
        let thresholds = HealthThresholds::default();
        HealthSection {
            degraded: thresholds.degraded,
            critical: thresholds.critical,
            down: thresholds.down,
            check_interval_secs: 2.0,
            dwell_samples: 3,
            smoothing_samples: 5,
            weights: HealthWeights::default(),
            bounds: HealthBounds::default(),
        }
    }
}

/// Production scene control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSection {
    pub host: String,
    pub port: u16,
    pub password: Secret,
    pub live: String,
    pub standby: String,
    pub fallback_delay_secs: f64,
    pub recovery_delay_secs: f64,
    /// Command run per switch; `{scene}`, `{host}`, `{port}` and `{streamer}`
    /// are substituted. Unset only logs switches.
    pub command: Option<String>,
    pub command_timeout_secs: f64,
    /// Scene shown for each health state
    pub mapping: SceneMapping,
}

impl Default for SceneSection {
    fn default() -> Self {
        SceneSection {
            host: "localhost".to_string(),
            port: 4455,
            password: Secret::default(),
            live: "LIVE".to_string(),
            standby: "BRB".to_string(),
            fallback_delay_secs: 3.0,
            recovery_delay_secs: 5.0,
            command: None,
            command_timeout_secs: 5.0,
            mapping: SceneMapping::default(),
        }
    }
}

/// Publisher processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub ffmpeg: String,
    /// Re-encode instead of copying streams
    pub reencode: bool,
    pub max_restarts: u32,
    pub backoff_initial_secs: f64,
    pub backoff_max_secs: f64,
    pub stop_grace_secs: f64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        PublisherSection {
            ffmpeg: "ffmpeg".to_string(),
            reencode: false,
            max_restarts: 10,
            backoff_initial_secs: 1.0,
            backoff_max_secs: 30.0,
            stop_grace_secs: 5.0,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One destination as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationEntry {
    pub platform: String,
    pub target: Secret,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// One streamer as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerEntry {
    pub id: String,
    #[serde(default)]
    pub secret: Secret,
    #[serde(default)]
    pub destinations: Vec<DestinationEntry>,
}

impl StreamerEntry {
    fn upsert_destination(&mut self, platform: &str, target: String) {
        match self.destinations.iter_mut().find(|d| d.platform == platform) {
            Some(existing) => {
                existing.target = Secret::new(target);
                existing.enabled = true;
            }
            None => self.destinations.push(DestinationEntry {
                platform: platform.to_string(),
                target: Secret::new(target),
                enabled: true,
            }),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub ports: PortsSection,
    pub ingest: IngestSection,
    pub health: HealthSection,
    pub scene: SceneSection,
    pub publisher: PublisherSection,
    pub streamers: Vec<StreamerEntry>,
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Field agent configuration
    pub field: Option<FieldConfig>,
    /// Relay configuration
    pub relay: Option<RelaySection>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example field agent configuration
    pub fn example_field() -> Self {
        Config {
            field: Some(FieldConfig {
                streamer_id: "field-1".to_string(),
                secret: Secret::new("change-me"),
                server_host: "relay.example.com".to_string(),
                interfaces: vec!["wwan0".to_string(), "wwan1".to_string()],
                ..FieldConfig::default()
            }),
            relay: None,
        }
    }

    /// Create example relay configuration
    pub fn example_relay() -> Self {
        Config {
            field: None,
            relay: Some(RelaySection {
                streamers: vec![StreamerEntry {
                    id: "field-1".to_string(),
                    secret: Secret::new("change-me"),
                    destinations: vec![
                        DestinationEntry {
                            platform: "youtube".to_string(),
                            target: Secret::new("rtmp://a.rtmp.youtube.com/live2/xxxx-xxxx-xxxx"),
                            enabled: true,
                        },
                        DestinationEntry {
                            platform: "twitch".to_string(),
                            target: Secret::new("rtmp://live.twitch.tv/app/live_xxxxxxxx"),
                            enabled: false,
                        },
                    ],
                }],
                ..RelaySection::default()
            }),
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    ///
    /// Only sections already present are touched.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(relay) = self.relay.as_mut() {
            relay.apply_env(&lookup)?;
        }
        if let Some(field) = self.field.as_mut() {
            field.apply_env(&lookup)?;
        }
        Ok(())
    }

    /// Reject configurations the binaries cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.field.is_none() && self.relay.is_none() {
            return Err(ConfigError::Invalid(
                "configuration has neither a [field] nor a [relay] section".to_string(),
            ));
        }
        if let Some(field) = &self.field {
            field.validate()?;
        }
        if let Some(relay) = &self.relay {
            relay.validate()?;
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: name.to_string(),
                value: raw,
            }),
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value)
            .map_err(|_| ConfigError::Invalid(format!("{} out of range: {}", name, value)))
    } else {
        Err(ConfigError::Invalid(format!("{} must be positive, got {}", name, value)))
    }
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl FieldConfig {
    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: &F) -> Result<(), ConfigError> {
        if let Some(latency) = parse_var(lookup, "SRT_LATENCY_MS")? {
            self.latency_ms = latency;
        }
        if let Some(max_links) = parse_var(lookup, "SRT_MAX_LINKS")? {
            self.max_links = max_links;
        }
        if let Some(secret) = lookup("SRT_PASSPHRASE") {
            self.secret = Secret::new(secret);
        }
        if let Some(host) = lookup("FIELD_SERVER_HOST") {
            self.server_host = host.trim().to_string();
        }
        if let Some(list) = lookup("FIELD_INTERFACES") {
            self.interfaces = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streamer_id.is_empty() {
            return Err(ConfigError::Invalid("field.streamer_id is empty".to_string()));
        }
        if self.server_host.is_empty() {
            return Err(ConfigError::Invalid("field.server_host is empty".to_string()));
        }
        if self.max_links == 0 {
            return Err(ConfigError::Invalid("field.max_links must be at least 1".to_string()));
        }
        if self.degraded_below > 100 {
            return Err(ConfigError::Invalid(format!(
                "field.degraded_below must be at most 100, got {}",
                self.degraded_below
            )));
        }
        seconds("field.probe_interval_secs", self.probe_interval_secs)?;
        seconds("field.report_interval_secs", self.report_interval_secs)?;
        Ok(())
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            streamer_id: self.streamer_id.clone(),
            secret: self.secret.expose().to_string(),
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            input_port: self.input_port,
            dedicated_sender: self.dedicated_sender.clone(),
            latency: Duration::from_millis(self.latency_ms),
            policy: BondingPolicy::default(),
            report_interval: seconds("field.report_interval_secs", self.report_interval_secs)?,
            pin_interfaces: self.pin_interfaces,
            ..EngineConfig::default()
        })
    }

    pub fn monitor_config(&self) -> Result<MonitorConfig, ConfigError> {
        Ok(MonitorConfig {
            probe_interval: seconds("field.probe_interval_secs", self.probe_interval_secs)?,
            degraded_below: self.degraded_below,
            ..MonitorConfig::default()
        })
    }

    pub fn probe(&self) -> PingProbe {
        PingProbe {
            target: self.probe_target.clone(),
            ..PingProbe::default()
        }
    }

    pub fn interface_source(&self) -> SysfsInterfaces {
        SysfsInterfaces::new(self.interfaces.clone(), self.max_links)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

impl RelaySection {
    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: &F) -> Result<(), ConfigError> {
        if let Some(base) = parse_var(lookup, "SRT_BASE_PORT")? {
            self.ports.base_port = base;
        }
        if let Some(count) = parse_var(lookup, "SRT_PORT_COUNT")? {
            self.ports.port_count = count;
        }
        if let Some(latency) = parse_var(lookup, "SRT_LATENCY_MS")? {
            self.ingest.latency_ms = latency;
        }
        if let Some(max_links) = parse_var(lookup, "SRT_MAX_LINKS")? {
            self.ingest.max_links = max_links;
        }
        if let Some(secret) = lookup("SRT_PASSPHRASE") {
            self.ingest.default_secret = Secret::new(secret);
        }

        if let Some(v) = parse_var(lookup, "HEALTH_THRESHOLD_DEGRADED")? {
            self.health.degraded = v;
        }
        if let Some(v) = parse_var(lookup, "HEALTH_THRESHOLD_CRITICAL")? {
            self.health.critical = v;
        }
        if let Some(v) = parse_var(lookup, "HEALTH_THRESHOLD_DOWN")? {
            self.health.down = v;
        }
        if let Some(v) = parse_var(lookup, "HEALTH_CHECK_INTERVAL_S")? {
            self.health.check_interval_secs = v;
        }
        if let Some(v) = parse_var(lookup, "HEALTH_DWELL_SAMPLES")? {
            self.health.dwell_samples = v;
        }
        if let Some(v) = parse_var(lookup, "HEALTH_SMOOTHING_SAMPLES")? {
            self.health.smoothing_samples = v;
        }

        if let Some(host) = lookup("OBS_HOST") {
            self.scene.host = host.trim().to_string();
        }
        if let Some(port) = parse_var(lookup, "OBS_PORT")? {
            self.scene.port = port;
        }
        if let Some(password) = lookup("OBS_PASSWORD") {
            self.scene.password = Secret::new(password);
        }
        if let Some(live) = lookup("OBS_SCENE_LIVE") {
            self.scene.live = live;
        }
        if let Some(standby) = lookup("OBS_SCENE_BRB") {
            self.scene.standby = standby;
        }
        if let Some(v) = parse_var(lookup, "OBS_FALLBACK_DELAY_S")? {
            self.scene.fallback_delay_secs = v;
        }
        if let Some(v) = parse_var(lookup, "OBS_RECOVERY_DELAY_S")? {
            self.scene.recovery_delay_secs = v;
        }
        if let Some(command) = lookup("OBS_COMMAND") {
            let command = command.trim().to_string();
            self.scene.command = if command.is_empty() { None } else { Some(command) };
        }

        // RTMP_* targets belong to the first configured streamer
        let primary = lookup("RTMP_PRIMARY_URL").filter(|url| !url.trim().is_empty());
        let secondary = lookup("RTMP_SECONDARY_URL").filter(|url| !url.trim().is_empty());
        if primary.is_some() || secondary.is_some() {
            if self.streamers.is_empty() {
                self.streamers.push(StreamerEntry {
                    id: "default".to_string(),
                    secret: Secret::default(),
                    destinations: Vec::new(),
                });
            }
            if let Some(streamer) = self.streamers.first_mut() {
                if let Some(url) = primary {
                    streamer.upsert_destination("primary", url.trim().to_string());
                }
                if let Some(url) = secondary {
                    streamer.upsert_destination("secondary", url.trim().to_string());
                }
            }
        }
        Ok(())
    }

    fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded: self.health.degraded,
            critical: self.health.critical,
            down: self.health.down,
        }
    }

    fn ports_config(&self) -> Result<PortAllocatorConfig, ConfigError> {
        Ok(PortAllocatorConfig {
            base_port: self.ports.base_port,
            port_count: self.ports.port_count,
            reuse_delay: seconds("relay.ports.reuse_delay_secs", self.ports.reuse_delay_secs)?,
            orphan_timeout: seconds(
                "relay.ports.orphan_timeout_secs",
                self.ports.orphan_timeout_secs,
            )?,
        })
    }

    fn endpoints(&self) -> EndpointConfig {
        EndpointConfig {
            local_base_port: self.ingest.local_base_port,
            max_destinations: self.ingest.max_destinations,
        }
    }

    fn protocol(&self) -> ProtocolConfig {
        ProtocolConfig {
            receiver_binary: PathBuf::from(&self.ingest.srtla_rec),
            bridge_binary: PathBuf::from(&self.ingest.bridge),
            ..ProtocolConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |e: &dyn fmt::Display| ConfigError::Invalid(e.to_string());

        self.thresholds().validate().map_err(|e| invalid(&e))?;
        self.health.weights.validate().map_err(|e| invalid(&e))?;
        self.health.bounds.validate().map_err(|e| invalid(&e))?;
        if self.health.dwell_samples == 0 {
            return Err(ConfigError::Invalid(
                "relay.health.dwell_samples must be at least 1".to_string(),
            ));
        }
        if self.health.smoothing_samples == 0 {
            return Err(ConfigError::Invalid(
                "relay.health.smoothing_samples must be at least 1".to_string(),
            ));
        }
        seconds("relay.health.check_interval_secs", self.health.check_interval_secs)?;
        seconds("relay.scene.fallback_delay_secs", self.scene.fallback_delay_secs)?;
        seconds("relay.scene.recovery_delay_secs", self.scene.recovery_delay_secs)?;
        seconds("relay.scene.command_timeout_secs", self.scene.command_timeout_secs)?;
        seconds("relay.ingest.stall_timeout_secs", self.ingest.stall_timeout_secs)?;
        seconds("relay.ingest.idle_timeout_secs", self.ingest.idle_timeout_secs)?;
        seconds("relay.ports.sweep_interval_secs", self.ports.sweep_interval_secs)?;
        seconds("relay.publisher.backoff_initial_secs", self.publisher.backoff_initial_secs)?;
        seconds("relay.publisher.backoff_max_secs", self.publisher.backoff_max_secs)?;
        seconds("relay.publisher.stop_grace_secs", self.publisher.stop_grace_secs)?;
        if self.publisher.backoff_initial_secs > self.publisher.backoff_max_secs {
            return Err(ConfigError::Invalid(
                "relay.publisher.backoff_initial_secs exceeds backoff_max_secs".to_string(),
            ));
        }
        if self.ingest.max_links == 0 {
            return Err(ConfigError::Invalid(
                "relay.ingest.max_links must be at least 1".to_string(),
            ));
        }

        let ports = self.ports_config()?;
        ports.validate().map_err(|e| invalid(&e))?;
        let receive = (u32::from(ports.base_port), ports.end());

        let endpoints = self.endpoints();
        if endpoints.max_destinations == 0 {
            return Err(ConfigError::Invalid(
                "relay.ingest.max_destinations must be at least 1".to_string(),
            ));
        }
        let local = endpoints.range(ports.port_count);
        if local.1 > 65536 {
            return Err(ConfigError::Invalid(format!(
                "local endpoint range {}..{} exceeds the port space",
                local.0, local.1
            )));
        }

        let mut reserved = vec![("receive", receive)];
        if self.ingest.mode != IngestMode::Native {
            let protocol = self.protocol();
            for (name, offset) in [
                ("forward", protocol.forward_offset),
                ("bridge output", protocol.output_offset),
            ] {
                let range = (receive.0 + u32::from(offset), receive.1 + u32::from(offset));
                if range.1 > 65536 {
                    return Err(ConfigError::Invalid(format!(
                        "{} range {}..{} exceeds the port space",
                        name, range.0, range.1
                    )));
                }
                reserved.push((name, range));
            }
        }
        for (name, range) in &reserved {
            if overlaps(local, *range) {
                return Err(ConfigError::Invalid(format!(
                    "local endpoint range {}..{} overlaps the {} range {}..{}",
                    local.0, local.1, name, range.0, range.1
                )));
            }
        }

        let mut ids = HashSet::new();
        for streamer in &self.streamers {
            if streamer.id.is_empty() {
                return Err(ConfigError::Invalid("streamer with empty id".to_string()));
            }
            if !ids.insert(streamer.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "streamer {} configured twice",
                    streamer.id
                )));
            }
            let mut platforms = HashSet::new();
            for destination in &streamer.destinations {
                if destination.target.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "streamer {} destination {} has no target",
                        streamer.id, destination.platform
                    )));
                }
                if !platforms.insert(destination.platform.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "streamer {} lists platform {} twice",
                        streamer.id, destination.platform
                    )));
                }
            }
        }
        Ok(())
    }

    /// Session manager settings
    pub fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let receiver = ReceiverConfig {
            mode: self.ingest.mode,
            bind_ip: self.ingest.bind_ip,
            latency: Duration::from_millis(self.ingest.latency_ms),
            max_buffer_frames: self.ingest.max_buffer_frames,
            stall_timeout: seconds("relay.ingest.stall_timeout_secs", self.ingest.stall_timeout_secs)?,
            idle_timeout: seconds("relay.ingest.idle_timeout_secs", self.ingest.idle_timeout_secs)?,
            check_interval: seconds(
                "relay.health.check_interval_secs",
                self.health.check_interval_secs,
            )?,
            max_links: self.ingest.max_links,
            protocol: self.protocol(),
        };

        Ok(RelayConfig {
            ports: self.ports_config()?,
            endpoints: self.endpoints(),
            receiver,
            health: HealthConfig {
                thresholds: self.thresholds(),
                weights: self.health.weights,
                bounds: self.health.bounds,
                dwell_samples: self.health.dwell_samples,
                smoothing_samples: self.health.smoothing_samples,
            },
            supervisor: SupervisorConfig {
                backoff_initial: seconds(
                    "relay.publisher.backoff_initial_secs",
                    self.publisher.backoff_initial_secs,
                )?,
                backoff_max: seconds(
                    "relay.publisher.backoff_max_secs",
                    self.publisher.backoff_max_secs,
                )?,
                max_restarts: self.publisher.max_restarts,
                stop_grace: seconds(
                    "relay.publisher.stop_grace_secs",
                    self.publisher.stop_grace_secs,
                )?,
                ..SupervisorConfig::default()
            },
            scene: SceneConfig {
                live_scene: self.scene.live.clone(),
                standby_scene: self.scene.standby.clone(),
                fallback_delay: seconds(
                    "relay.scene.fallback_delay_secs",
                    self.scene.fallback_delay_secs,
                )?,
                recovery_delay: seconds(
                    "relay.scene.recovery_delay_secs",
                    self.scene.recovery_delay_secs,
                )?,
                mapping: self.scene.mapping,
            },
            default_secret: self.ingest.default_secret.expose().to_string(),
            sweep_interval: seconds("relay.ports.sweep_interval_secs", self.ports.sweep_interval_secs)?,
            auto_reopen: self.ingest.auto_reopen,
            ..RelayConfig::default()
        })
    }

    /// Profiles for every configured streamer
    pub fn profiles(&self) -> Vec<StreamerProfile> {
        self.streamers
            .iter()
            .map(|entry| StreamerProfile {
                id: entry.id.clone(),
                secret: entry.secret.expose().to_string(),
                destinations: entry
                    .destinations
                    .iter()
                    .map(|d| RelayDestination {
                        enabled: d.enabled,
                        ..RelayDestination::new(d.platform.clone(), d.target.expose())
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.profiles())
    }

    pub fn switcher(&self) -> Result<Arc<dyn SceneSwitcher>, ConfigError> {
        match &self.scene.command {
            Some(template) => {
                let timeout =
                    seconds("relay.scene.command_timeout_secs", self.scene.command_timeout_secs)?;
                Ok(Arc::new(
                    CommandSwitcher::new(
                        template,
                        self.scene.host.clone(),
                        self.scene.port,
                        self.scene.password.expose(),
                    )
                    .with_timeout(timeout),
                ))
            }
            None => Ok(Arc::new(LogSwitcher)),
        }
    }

    pub fn launcher(&self) -> FfmpegLauncher {
        FfmpegLauncher::new(&self.publisher.ffmpeg, self.publisher.reencode)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: String, value: String },
}
