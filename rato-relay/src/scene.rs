//! Scene Controller
//!
//! Maps committed health states onto the production's live and standby
//! scenes. A switch waits a fallback or recovery delay first, and a health
//! change back to the shown scene cancels it. Switching runs on its own
//! thread so a slow control channel never stalls reception or relay.
//!
//! Scene state outlives sessions. When a streamer's new session goes live
//! the manager feeds its committed health back in, since a fresh session
//! starts healthy without emitting a transition.

use crate::health::{HealthState, HealthTransition};
use crate::task::TaskHandle;
use crossbeam::channel::{select, Receiver};
use parking_lot::RwLock;
use rato_io::run_with_timeout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest idle wait of the controller loop
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("Control channel unavailable: {0}")]
    ControlChannelUnavailable(String),
}

/// Production scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scene {
    Live,
    Standby,
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scene::Live => f.write_str("live"),
            Scene::Standby => f.write_str("standby"),
        }
    }
}

/// Scene shown for each committed health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SceneMapping {
    pub healthy: Scene,
    pub degraded: Scene,
    pub critical: Scene,
    pub down: Scene,
}

impl Default for SceneMapping {
    fn default() -> Self {
        SceneMapping {
            healthy: Scene::Live,
            degraded: Scene::Live,
            critical: Scene::Standby,
            down: Scene::Standby,
        }
    }
}

impl SceneMapping {
    pub fn scene_for(&self, state: HealthState) -> Scene {
        match state {
            HealthState::Healthy => self.healthy,
            HealthState::Degraded => self.degraded,
            HealthState::Critical => self.critical,
            HealthState::Down => self.down,
        }
    }
}

/// Scene controller settings
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub live_scene: String,
    pub standby_scene: String,
    pub mapping: SceneMapping,
    /// Wait before switching to standby
    pub fallback_delay: Duration,
    /// Wait before switching back to live
    pub recovery_delay: Duration,
}

impl Default for SceneConfig {
    fn default() -> Self {
        SceneConfig {
            live_scene: "LIVE".to_string(),
            standby_scene: "BRB".to_string(),
            mapping: SceneMapping::default(),
            fallback_delay: Duration::from_secs(3),
            recovery_delay: Duration::from_secs(5),
        }
    }
}

impl SceneConfig {
    pub fn scene_for(&self, state: HealthState) -> Scene {
        self.mapping.scene_for(state)
    }

    pub fn scene_name(&self, scene: Scene) -> &str {
        match scene {
            Scene::Live => &self.live_scene,
            Scene::Standby => &self.standby_scene,
        }
    }

    fn delay_for(&self, scene: Scene) -> Duration {
        match scene {
            Scene::Live => self.recovery_delay,
            Scene::Standby => self.fallback_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSwitch {
    target: Scene,
    due: Instant,
}

/// Scene bookkeeping for one streamer
///
/// The production starts on the live scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneState {
    shown: Scene,
    pending: Option<PendingSwitch>,
}

impl Default for SceneState {
    fn default() -> Self {
        SceneState {
            shown: Scene::Live,
            pending: None,
        }
    }
}

impl SceneState {
    pub fn shown(&self) -> Scene {
        self.shown
    }

    pub fn pending(&self) -> Option<Scene> {
        self.pending.map(|p| p.target)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.due)
    }

    /// Apply a committed health state
    pub fn on_health(&mut self, state: HealthState, now: Instant, config: &SceneConfig) {
        let target = config.scene_for(state);
        if target == self.shown {
            self.pending = None;
            return;
        }
        if self.pending.is_some_and(|p| p.target == target) {
            return;
        }
        self.pending = Some(PendingSwitch {
            target,
            due: now + config.delay_for(target),
        });
    }

    /// Switch that is due at `now`, if any
    pub fn due(&self, now: Instant) -> Option<Scene> {
        self.pending.filter(|p| p.due <= now).map(|p| p.target)
    }

    pub fn confirm(&mut self, scene: Scene) {
        self.shown = scene;
        self.pending = None;
    }

    /// Drop the pending switch; the next health change retries it
    pub fn failed(&mut self) {
        self.pending = None;
    }
}

/// What the scene controller reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum SceneInput {
    /// Committed health transition
    Health(HealthTransition),
    /// A session went live; `state` is its committed health right now
    Resumed {
        streamer_id: String,
        generation: u64,
        state: HealthState,
    },
}

impl SceneInput {
    pub fn streamer_id(&self) -> &str {
        match self {
            SceneInput::Health(t) => &t.streamer_id,
            SceneInput::Resumed { streamer_id, .. } => streamer_id,
        }
    }

    pub fn state(&self) -> HealthState {
        match self {
            SceneInput::Health(t) => t.to,
            SceneInput::Resumed { state, .. } => *state,
        }
    }
}

impl From<HealthTransition> for SceneInput {
    fn from(transition: HealthTransition) -> Self {
        SceneInput::Health(transition)
    }
}

/// Control channel of the production software
pub trait SceneSwitcher: Send + Sync {
    fn switch(&self, streamer_id: &str, scene_name: &str) -> Result<(), SceneError>;
}

/// Switcher used when no control channel is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSwitcher;

impl SceneSwitcher for LogSwitcher {
    fn switch(&self, streamer_id: &str, scene_name: &str) -> Result<(), SceneError> {
        info!(streamer = %streamer_id, scene = %scene_name, "Scene switch (no control channel)");
        Ok(())
    }
}

/// Runs a command template for every switch
///
/// Placeholders `{scene}`, `{host}`, `{port}` and `{streamer}` are replaced
/// per argument, so a scene name with spaces stays one argument. The
/// password reaches the command as `OBS_PASSWORD` in its environment.
#[derive(Clone)]
pub struct CommandSwitcher {
    template: Vec<String>,
    host: String,
    port: u16,
    password: String,
    timeout: Duration,
}

impl fmt::Debug for CommandSwitcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSwitcher")
            .field("template", &self.template)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandSwitcher {
    pub fn new(template: &str, host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        CommandSwitcher {
            template: template.split_whitespace().map(str::to_string).collect(),
            host: host.into(),
            port,
            password: password.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program and arguments for one switch
    pub fn command_line(&self, streamer_id: &str, scene_name: &str) -> Vec<String> {
        let port = self.port.to_string();
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{scene}", scene_name)
                    .replace("{host}", &self.host)
                    .replace("{port}", &port)
                    .replace("{streamer}", streamer_id)
            })
            .collect()
    }
}

impl SceneSwitcher for CommandSwitcher {
    fn switch(&self, streamer_id: &str, scene_name: &str) -> Result<(), SceneError> {
        let line = self.command_line(streamer_id, scene_name);
        let Some((program, args)) = line.split_first() else {
            return Err(SceneError::ControlChannelUnavailable(
                "empty command template".to_string(),
            ));
        };

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null());
        if !self.password.is_empty() {
            command.env("OBS_PASSWORD", &self.password);
        }

        match run_with_timeout(&mut command, self.timeout) {
            Ok(Some(output)) if output.status.success() => Ok(()),
            Ok(Some(output)) => Err(SceneError::ControlChannelUnavailable(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                output.stderr.trim()
            ))),
            Ok(None) => Err(SceneError::ControlChannelUnavailable(format!(
                "{} timed out after {:?}",
                program, self.timeout
            ))),
            Err(e) => Err(SceneError::ControlChannelUnavailable(format!(
                "{}: {}",
                program, e
            ))),
        }
    }
}

/// Running scene controller
pub struct SceneController {
    task: TaskHandle,
    shown: Arc<RwLock<HashMap<String, Scene>>>,
}

impl SceneController {
    /// Start consuming scene inputs
    pub fn spawn(
        config: SceneConfig,
        switcher: Arc<dyn SceneSwitcher>,
        inputs: Receiver<SceneInput>,
    ) -> io::Result<Self> {
        let shown = Arc::new(RwLock::new(HashMap::new()));
        let published = Arc::clone(&shown);

        let task = TaskHandle::spawn("scene-controller", move |stop| {
            let mut states: HashMap<String, SceneState> = HashMap::new();
            loop {
                let now = Instant::now();
                let wait = states
                    .values()
                    .filter_map(SceneState::next_deadline)
                    .min()
                    .map(|due| due.saturating_duration_since(now))
                    .unwrap_or(MAX_IDLE_WAIT)
                    .min(MAX_IDLE_WAIT);

                select! {
                    recv(stop) -> _ => break,
                    recv(inputs) -> msg => {
                        let Ok(input) = msg else { break };
                        let health = input.state();
                        let state = states.entry(input.streamer_id().to_string()).or_default();
                        state.on_health(health, Instant::now(), &config);
                        debug!(
                            streamer = %input.streamer_id(),
                            %health,
                            pending = ?state.pending(),
                            "Scene input"
                        );
                    },
                    default(wait) => {}
                }

                let now = Instant::now();
                for (streamer_id, state) in states.iter_mut() {
                    let Some(target) = state.due(now) else {
                        continue;
                    };
                    let name = config.scene_name(target);
                    match switcher.switch(streamer_id, name) {
                        Ok(()) => {
                            state.confirm(target);
                            published.write().insert(streamer_id.clone(), target);
                            info!(streamer = %streamer_id, scene = %name, "Scene switched");
                        }
                        Err(e) => {
                            state.failed();
                            warn!(streamer = %streamer_id, scene = %name, error = %e, "Scene switch failed");
                        }
                    }
                }
            }
        })?;

        Ok(SceneController { task, shown })
    }

    /// Last scene confirmed for `streamer_id`; `None` means never switched
    pub fn shown(&self, streamer_id: &str) -> Option<Scene> {
        self.shown.read().get(streamer_id).copied()
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.task.stop(timeout)
    }
}
