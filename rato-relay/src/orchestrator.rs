//! Relay Orchestrator
//!
//! Keeps exactly one publisher supervisor per (available session, enabled
//! destination). Every start and stop goes through [`RelayOrchestrator`],
//! which is owned by the session manager thread, so operations on one pair
//! never overlap.
//!
//! A supervisor that misses its stop deadline is parked until its thread
//! ends. Its pair gets no new supervisor in the meantime.

use crate::destination::RelayDestination;
use crate::events::RelayEvent;
use crate::ports::PortAllocator;
use crate::receiver::ReceiveState;
use crate::supervisor::{
    PublisherLauncher, RelayProcessStatus, RelaySupervisor, SupervisorConfig, SupervisorContext,
};
use crossbeam::channel::Sender;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Layout of per-destination local endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub local_base_port: u16,
    /// Endpoint slots reserved for each session
    pub max_destinations: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            local_base_port: 20000,
            max_destinations: 4,
        }
    }
}

impl EndpointConfig {
    /// Port range `[start, end)` covering `sessions` sessions
    pub fn range(&self, sessions: u16) -> (u32, u32) {
        let start = u32::from(self.local_base_port);
        (
            start,
            start + u32::from(sessions) * u32::from(self.max_destinations),
        )
    }
}

/// Local UDP endpoints of one session, one per enabled destination
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalEndpoints {
    entries: Vec<(String, SocketAddr)>,
}

impl LocalEndpoints {
    /// Assign endpoints for session `slot`
    ///
    /// Port = `local_base_port + slot * max_destinations + index`. Enabled
    /// destinations beyond `max_destinations` get no endpoint.
    pub fn assign(config: &EndpointConfig, slot: u16, destinations: &[RelayDestination]) -> Self {
        let first = u32::from(config.local_base_port)
            + u32::from(slot) * u32::from(config.max_destinations);
        let mut entries = Vec::new();

        for (index, destination) in destinations.iter().filter(|d| d.enabled).enumerate() {
            if index >= usize::from(config.max_destinations) {
                warn!(
                    platform = %destination.platform,
                    max = config.max_destinations,
                    "Too many destinations, ignoring"
                );
                continue;
            }
            let Ok(port) = u16::try_from(first + index as u32) else {
                warn!(platform = %destination.platform, "Local endpoint port out of range");
                continue;
            };
            entries.push((
                destination.platform.clone(),
                SocketAddr::from(([127, 0, 0, 1], port)),
            ));
        }
        LocalEndpoints { entries }
    }

    pub fn addr_for(&self, platform: &str) -> Option<SocketAddr> {
        self.entries
            .iter()
            .find(|(p, _)| p == platform)
            .map(|(_, addr)| *addr)
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|(_, addr)| *addr).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the orchestrator needs to know about a session
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub generation: u64,
    pub state: ReceiveState,
    /// Whether the session has ever been live
    pub ever_live: bool,
    pub port: u16,
    pub endpoints: &'a LocalEndpoints,
}

impl SessionView<'_> {
    /// Relays run once a session has been live and until it closes
    pub fn is_available(&self) -> bool {
        self.ever_live && self.state != ReceiveState::Closed
    }
}

type PairKey = (String, String);

/// Owner of every publisher supervisor
pub struct RelayOrchestrator {
    launcher: Arc<dyn PublisherLauncher>,
    config: SupervisorConfig,
    ports: PortAllocator,
    events: Sender<RelayEvent>,
    supervisors: BTreeMap<PairKey, RelaySupervisor>,
    /// Detached supervisors still winding down
    draining: BTreeMap<PairKey, RelaySupervisor>,
}

impl RelayOrchestrator {
    pub fn new(
        launcher: Arc<dyn PublisherLauncher>,
        config: SupervisorConfig,
        ports: PortAllocator,
        events: Sender<RelayEvent>,
    ) -> Self {
        RelayOrchestrator {
            launcher,
            config,
            ports,
            events,
            supervisors: BTreeMap::new(),
            draining: BTreeMap::new(),
        }
    }

    /// Bring the supervisors of `streamer_id` in line with `session`
    ///
    /// Supervisors that are no longer wanted, or belong to an older
    /// generation, are stopped and joined before anything new starts. A pair
    /// whose old supervisor is still draining is skipped until
    /// [`RelayOrchestrator::reap`] reports it clear.
    /// Returns the number of supervisors started.
    pub fn reconcile(
        &mut self,
        streamer_id: &str,
        session: &SessionView<'_>,
        destinations: &[RelayDestination],
    ) -> usize {
        let desired: Vec<(&RelayDestination, SocketAddr)> = if session.is_available() {
            destinations
                .iter()
                .filter(|d| d.enabled)
                .filter_map(|d| session.endpoints.addr_for(&d.platform).map(|addr| (d, addr)))
                .collect()
        } else {
            Vec::new()
        };
        let wanted: HashSet<&str> = desired.iter().map(|(d, _)| d.platform.as_str()).collect();

        let stale: Vec<PairKey> = self
            .supervisors
            .iter()
            .filter(|((streamer, platform), supervisor)| {
                streamer == streamer_id
                    && (!wanted.contains(platform.as_str())
                        || supervisor.generation() != session.generation)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.stop_pair(&key);
        }
        self.reap();

        let mut started = 0;
        for (destination, input) in desired {
            let key = (streamer_id.to_string(), destination.platform.clone());
            if self.supervisors.contains_key(&key) {
                continue;
            }
            if self.draining.contains_key(&key) {
                debug!(
                    streamer = %streamer_id,
                    platform = %destination.platform,
                    "Previous relay still stopping, start deferred"
                );
                continue;
            }

            let context = SupervisorContext {
                streamer_id: streamer_id.to_string(),
                generation: session.generation,
                input,
                destination: destination.clone(),
            };
            match RelaySupervisor::spawn(
                context,
                self.config.clone(),
                Arc::clone(&self.launcher),
                self.events.clone(),
                Some(self.ports.pin(session.port)),
            ) {
                Ok(supervisor) => {
                    self.supervisors.insert(key, supervisor);
                    started += 1;
                }
                Err(e) => warn!(
                    streamer = %streamer_id,
                    destination = %destination.target,
                    error = %e,
                    "Failed to start relay supervisor"
                ),
            }
        }
        started
    }

    fn stop_pair(&mut self, key: &PairKey) -> bool {
        let Some(mut supervisor) = self.supervisors.remove(key) else {
            return true;
        };
        let joined = supervisor.stop();
        if joined {
            info!(streamer = %key.0, platform = %key.1, "Relay stopped");
        } else {
            warn!(
                streamer = %key.0,
                platform = %key.1,
                "Relay supervisor did not stop in time, detached"
            );
            self.draining.insert(key.clone(), supervisor);
        }
        joined
    }

    /// Forget draining supervisors whose thread has ended
    ///
    /// Returns the streamers that had a pair unblocked, sorted and deduplicated.
    pub fn reap(&mut self) -> Vec<String> {
        let finished: Vec<PairKey> = self
            .draining
            .iter()
            .filter(|(_, supervisor)| supervisor.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        let mut streamers = Vec::new();
        for key in finished {
            self.draining.remove(&key);
            info!(streamer = %key.0, platform = %key.1, "Detached relay finished");
            if streamers.last() != Some(&key.0) {
                streamers.push(key.0);
            }
        }
        streamers
    }

    /// Pairs blocked behind a detached supervisor
    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    /// Stop every supervisor of `streamer_id`; false if any had to be detached
    pub fn stop_streamer(&mut self, streamer_id: &str) -> bool {
        let keys: Vec<PairKey> = self
            .supervisors
            .keys()
            .filter(|(streamer, _)| streamer == streamer_id)
            .cloned()
            .collect();
        keys.iter().fold(true, |all, key| self.stop_pair(key) && all)
    }

    pub fn stop_all(&mut self) -> bool {
        let keys: Vec<PairKey> = self.supervisors.keys().cloned().collect();
        keys.iter().fold(true, |all, key| self.stop_pair(key) && all)
    }

    pub fn statuses(&self, streamer_id: &str) -> Vec<RelayProcessStatus> {
        self.supervisors
            .iter()
            .filter(|((streamer, _), _)| streamer == streamer_id)
            .map(|(_, supervisor)| supervisor.status())
            .collect()
    }

    pub fn supervisor_count(&self) -> usize {
        self.supervisors.len()
    }
}

impl Drop for RelayOrchestrator {
    fn drop(&mut self) {
        self.stop_all();
    }
}
