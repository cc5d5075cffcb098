//! Health Monitor
//!
//! Turns receiver quality samples into a 0..=100 score, classifies the
//! score against configured cuts and debounces the result so that only a
//! sustained change commits a state transition.
//!
//! The classified score is the floored mean of the last few window scores.
//! A silent window clears that history and scores 0 on its own, so an
//! outage is never diluted by the windows before it.

use crate::events::RelayEvent;
use crate::task::TaskHandle;
use crossbeam::channel::{select, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/// Health configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthConfigError {
    #[error("Thresholds must satisfy down < critical < degraded < 100 (got {down}/{critical}/{degraded})")]
    Thresholds { down: u8, critical: u8, degraded: u8 },

    #[error("Metric weights must be non-negative with a positive sum")]
    Weights,

    #[error("Bounds for {0} must differ")]
    Bounds(&'static str),
}

/// Committed health of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Critical => "critical",
            HealthState::Down => "down",
        };
        f.write_str(s)
    }
}

/// Score cuts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub degraded: u8,
    pub critical: u8,
    pub down: u8,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        HealthThresholds {
            degraded: 70,
            critical: 40,
            down: 10,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), HealthConfigError> {
        if self.down < self.critical && self.critical < self.degraded && self.degraded < 100 {
            Ok(())
        } else {
            Err(HealthConfigError::Thresholds {
                down: self.down,
                critical: self.critical,
                degraded: self.degraded,
            })
        }
    }

    pub fn classify(&self, score: u8) -> HealthState {
        if score >= self.degraded {
            HealthState::Healthy
        } else if score >= self.critical {
            HealthState::Degraded
        } else if score >= self.down {
            HealthState::Critical
        } else {
            HealthState::Down
        }
    }
}

/// Linear mapping of a metric onto `[0, 1]`
///
/// `good` maps to 1 and `bad` to 0. Either ordering works, so the same type
/// covers lower-is-better and higher-is-better metrics.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct MetricBounds {
    pub good: f64,
    pub bad: f64,
}

impl MetricBounds {
    pub const fn new(good: f64, bad: f64) -> Self {
        MetricBounds { good, bad }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        ((self.bad - value) / (self.bad - self.good)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthBounds {
    pub rtt_ms: MetricBounds,
    pub jitter_ms: MetricBounds,
    pub loss_ratio: MetricBounds,
    /// Available bandwidth over receive bitrate
    pub bandwidth_headroom: MetricBounds,
}

impl Default for HealthBounds {
    fn default() -> Self {
        HealthBounds {
            rtt_ms: MetricBounds::new(50.0, 500.0),
            jitter_ms: MetricBounds::new(5.0, 100.0),
            loss_ratio: MetricBounds::new(0.0, 0.10),
            bandwidth_headroom: MetricBounds::new(1.5, 0.8),
        }
    }
}

impl HealthBounds {
    pub fn validate(&self) -> Result<(), HealthConfigError> {
        let pairs = [
            ("rtt_ms", self.rtt_ms),
            ("jitter_ms", self.jitter_ms),
            ("loss_ratio", self.loss_ratio),
            ("bandwidth_headroom", self.bandwidth_headroom),
        ];
        for (name, bounds) in pairs {
            if bounds.good == bounds.bad || !bounds.good.is_finite() || !bounds.bad.is_finite() {
                return Err(HealthConfigError::Bounds(name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthWeights {
    pub rtt: f64,
    pub jitter: f64,
    pub loss: f64,
    pub bandwidth: f64,
    /// Strength of the penalty for links missing from the window
    pub link_loss: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        HealthWeights {
            rtt: 0.3,
            jitter: 0.2,
            loss: 0.4,
            bandwidth: 0.1,
            link_loss: 0.7,
        }
    }
}

impl HealthWeights {
    pub fn validate(&self) -> Result<(), HealthConfigError> {
        let metric = [self.rtt, self.jitter, self.loss, self.bandwidth];
        let valid = metric.iter().all(|w| w.is_finite() && *w >= 0.0)
            && metric.iter().sum::<f64>() > 0.0
            && (0.0..=1.0).contains(&self.link_loss);
        if valid {
            Ok(())
        } else {
            Err(HealthConfigError::Weights)
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub thresholds: HealthThresholds,
    pub weights: HealthWeights,
    pub bounds: HealthBounds,
    /// Consecutive samples a new state must hold before it commits
    pub dwell_samples: u32,
    /// Window scores averaged into the classified score
    pub smoothing_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            thresholds: HealthThresholds::default(),
            weights: HealthWeights::default(),
            bounds: HealthBounds::default(),
            dwell_samples: 3,
            smoothing_samples: 5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), HealthConfigError> {
        self.thresholds.validate()?;
        self.weights.validate()?;
        self.bounds.validate()
    }
}

/// One window of receive quality
///
/// Metrics the window could not measure are `None` and left out of the
/// score, with the remaining weights renormalized.
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub at: Instant,
    /// Links that delivered data in the window
    pub active_links: u32,
    /// Links the session is known to have
    pub total_links: u32,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_ratio: f64,
    /// Bandwidth the links report as available
    pub bandwidth_kbps: Option<f64>,
    /// Receive bitrate over the window
    pub bitrate_kbps: f64,
}

impl QualitySample {
    /// A window with no data at all
    pub fn silent(at: Instant, total_links: u32) -> Self {
        QualitySample {
            at,
            active_links: 0,
            total_links,
            rtt_ms: None,
            jitter_ms: None,
            loss_ratio: 1.0,
            bandwidth_kbps: None,
            bitrate_kbps: 0.0,
        }
    }
}

/// Score a sample
pub fn score_sample(sample: &QualitySample, config: &HealthConfig) -> u8 {
    if sample.active_links == 0 {
        return 0;
    }

    let weights = &config.weights;
    let bounds = &config.bounds;
    let mut terms: Vec<(f64, f64)> = Vec::with_capacity(4);

    if let Some(rtt) = sample.rtt_ms {
        terms.push((weights.rtt, bounds.rtt_ms.normalize(rtt)));
    }
    if let Some(jitter) = sample.jitter_ms {
        terms.push((weights.jitter, bounds.jitter_ms.normalize(jitter)));
    }
    terms.push((weights.loss, bounds.loss_ratio.normalize(sample.loss_ratio)));
    if let Some(bandwidth) = sample.bandwidth_kbps {
        if sample.bitrate_kbps > 0.0 {
            let headroom = bandwidth / sample.bitrate_kbps;
            terms.push((weights.bandwidth, bounds.bandwidth_headroom.normalize(headroom)));
        }
    }

    let total_weight: f64 = terms.iter().map(|(w, _)| w).sum();
    if total_weight <= 0.0 {
        return 0;
    }
    let quality = terms.iter().map(|(w, v)| w * v).sum::<f64>() / total_weight;

    let total = sample.total_links.max(sample.active_links).max(1);
    let ratio = f64::from(sample.active_links) / f64::from(total);
    let multiplier = 1.0 - weights.link_loss * (1.0 - ratio);

    (quality * multiplier * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Dwell-count debouncer
#[derive(Debug, Clone)]
pub struct HealthDebouncer {
    committed: HealthState,
    pending: Option<(HealthState, u32)>,
    dwell: u32,
}

impl HealthDebouncer {
    pub fn new(initial: HealthState, dwell_samples: u32) -> Self {
        HealthDebouncer {
            committed: initial,
            pending: None,
            dwell: dwell_samples.max(1),
        }
    }

    pub fn committed(&self) -> HealthState {
        self.committed
    }

    pub fn pending(&self) -> Option<(HealthState, u32)> {
        self.pending
    }

    /// Feed one proposal; returns `(from, to)` when a transition commits
    pub fn observe(&mut self, proposed: HealthState) -> Option<(HealthState, HealthState)> {
        if proposed == self.committed {
            self.pending = None;
            return None;
        }

        let count = match self.pending {
            Some((state, count)) if state == proposed => count + 1,
            _ => 1,
        };

        if count >= self.dwell {
            let from = self.committed;
            self.committed = proposed;
            self.pending = None;
            Some((from, proposed))
        } else {
            self.pending = Some((proposed, count));
            None
        }
    }
}

/// Latest health of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthRecord {
    pub score: u8,
    pub state: HealthState,
    pub last_transition_at: Instant,
}

impl HealthRecord {
    pub fn initial(now: Instant) -> Self {
        HealthRecord {
            score: 100,
            state: HealthState::Healthy,
            last_transition_at: now,
        }
    }
}

/// A committed health change
#[derive(Debug, Clone, PartialEq)]
pub struct HealthTransition {
    pub streamer_id: String,
    pub generation: u64,
    pub from: HealthState,
    pub to: HealthState,
    pub score: u8,
    pub at: Instant,
}

/// Scoring plus debouncing for one session
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    streamer_id: String,
    generation: u64,
    config: HealthConfig,
    debouncer: HealthDebouncer,
    history: VecDeque<u8>,
    record: HealthRecord,
}

impl HealthMonitor {
    pub fn new(streamer_id: impl Into<String>, generation: u64, config: HealthConfig, now: Instant) -> Self {
        let debouncer = HealthDebouncer::new(HealthState::Healthy, config.dwell_samples);
        let history = VecDeque::with_capacity(config.smoothing_samples.max(1));
        HealthMonitor {
            streamer_id: streamer_id.into(),
            generation,
            config,
            debouncer,
            history,
            record: HealthRecord::initial(now),
        }
    }

    pub fn record(&self) -> HealthRecord {
        self.record
    }

    pub fn observe(&mut self, sample: &QualitySample) -> Option<HealthTransition> {
        let score = self.smooth(sample);
        self.record.score = score;
        let proposed = self.config.thresholds.classify(score);

        let (from, to) = self.debouncer.observe(proposed)?;
        self.record.state = to;
        self.record.last_transition_at = sample.at;
        Some(HealthTransition {
            streamer_id: self.streamer_id.clone(),
            generation: self.generation,
            from,
            to,
            score,
            at: sample.at,
        })
    }

    fn smooth(&mut self, sample: &QualitySample) -> u8 {
        let raw = score_sample(sample, &self.config);
        if sample.active_links == 0 {
            self.history.clear();
            return raw;
        }

        let window = self.config.smoothing_samples.max(1);
        while self.history.len() >= window {
            self.history.pop_front();
        }
        self.history.push_back(raw);
        let sum: usize = self.history.iter().map(|s| usize::from(*s)).sum();
        (sum / self.history.len()) as u8
    }
}

/// Run a session's health monitor on its own thread
///
/// Transitions are published in commit order; `record` always holds the
/// latest score.
pub fn spawn_health_task(
    monitor: HealthMonitor,
    samples: Receiver<QualitySample>,
    events: Sender<RelayEvent>,
    record: Arc<RwLock<HealthRecord>>,
) -> io::Result<TaskHandle> {
    let name = format!("health-{}", monitor.streamer_id);
    TaskHandle::spawn(name, move |stop| {
        let mut monitor = monitor;
        *record.write() = monitor.record();
        loop {
            select! {
                recv(stop) -> _ => break,
                recv(samples) -> msg => {
                    let Ok(sample) = msg else { break };
                    let transition = monitor.observe(&sample);
                    *record.write() = monitor.record();
                    debug!(
                        streamer = %monitor.streamer_id,
                        score = monitor.record.score,
                        links = sample.active_links,
                        "Health sample"
                    );
                    if let Some(transition) = transition {
                        info!(
                            streamer = %transition.streamer_id,
                            from = %transition.from,
                            to = %transition.to,
                            score = transition.score,
                            "Health state changed"
                        );
                        if events.send(RelayEvent::Health(transition)).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
}
