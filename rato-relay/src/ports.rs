//! Receive Port Allocator
//!
//! Hands out ports from a contiguous range, one per streamer. A released port
//! sits in quarantine for `reuse_delay` and is never reissued while a relay
//! supervisor still pins it. Leases that stop being touched are reclaimed
//! by [`PortAllocator::sweep`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Port allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("No free receive port")]
    ExhaustedPool,

    #[error("Streamer {streamer_id} already holds port {port}")]
    AlreadyLeased { streamer_id: String, port: u16 },

    #[error("Port {0} is outside the receive range")]
    OutOfRange(u16),

    #[error("Port {0} is still in quarantine")]
    Quarantined(u16),

    #[error("Port {0} is in use")]
    InUse(u16),

    #[error("Invalid port range: {0}")]
    InvalidRange(String),
}

/// Allocator settings
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    pub base_port: u16,
    pub port_count: u16,
    /// Quarantine after release
    pub reuse_delay: Duration,
    /// Untouched leases older than this are reclaimed
    pub orphan_timeout: Duration,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        PortAllocatorConfig {
            base_port: 9000,
            port_count: 64,
            reuse_delay: Duration::from_secs(2),
            orphan_timeout: Duration::from_secs(120),
        }
    }
}

impl PortAllocatorConfig {
    pub fn validate(&self) -> Result<(), PortError> {
        if self.port_count == 0 {
            return Err(PortError::InvalidRange("port_count is zero".to_string()));
        }
        if self.base_port == 0 {
            return Err(PortError::InvalidRange("base_port is zero".to_string()));
        }
        if u32::from(self.base_port) + u32::from(self.port_count) > 65536 {
            return Err(PortError::InvalidRange(format!(
                "{} ports from {} overflow the port space",
                self.port_count, self.base_port
            )));
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base_port && u32::from(port) < self.end()
    }

    /// One past the last port, as u32 so a range ending at 65535 is representable
    pub fn end(&self) -> u32 {
        u32::from(self.base_port) + u32::from(self.port_count)
    }
}

#[derive(Debug)]
struct Lease {
    streamer_id: String,
    lease_id: u64,
    last_touch: Instant,
}

#[derive(Debug)]
struct PoolState {
    config: PortAllocatorConfig,
    leases: HashMap<u16, Lease>,
    by_streamer: HashMap<String, u16>,
    /// Release time of quarantined ports
    quarantine: HashMap<u16, Instant>,
    /// Outstanding pins per port
    pins: HashMap<u16, usize>,
    /// Offset to start the next scan from
    next_offset: u16,
    next_lease_id: u64,
}

impl PoolState {
    fn is_free(&mut self, port: u16, now: Instant) -> bool {
        if self.leases.contains_key(&port) || self.pins.get(&port).is_some_and(|n| *n > 0) {
            return false;
        }
        match self.quarantine.get(&port) {
            Some(released) if now.saturating_duration_since(*released) < self.config.reuse_delay => {
                false
            }
            Some(_) => {
                self.quarantine.remove(&port);
                true
            }
            None => true,
        }
    }

    fn remove_lease(&mut self, port: u16, now: Instant) -> Option<Lease> {
        let lease = self.leases.remove(&port)?;
        self.by_streamer.remove(&lease.streamer_id);
        self.quarantine.insert(port, now);
        Some(lease)
    }
}

/// Shared handle to the receive port pool
///
/// Cloning is cheap; all clones see the same pool.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    state: Arc<Mutex<PoolState>>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Result<Self, PortError> {
        config.validate()?;
        Ok(PortAllocator {
            state: Arc::new(Mutex::new(PoolState {
                config,
                leases: HashMap::new(),
                by_streamer: HashMap::new(),
                quarantine: HashMap::new(),
                pins: HashMap::new(),
                next_offset: 0,
                next_lease_id: 1,
            })),
        })
    }

    pub fn config(&self) -> PortAllocatorConfig {
        self.state.lock().config.clone()
    }

    pub fn acquire(&self, streamer_id: &str) -> Result<PortLease, PortError> {
        self.acquire_at(streamer_id, Instant::now())
    }

    /// Lease a free port for `streamer_id`
    pub fn acquire_at(&self, streamer_id: &str, now: Instant) -> Result<PortLease, PortError> {
        let mut state = self.state.lock();

        if let Some(port) = state.by_streamer.get(streamer_id) {
            return Err(PortError::AlreadyLeased {
                streamer_id: streamer_id.to_string(),
                port: *port,
            });
        }

        let count = state.config.port_count;
        let base = state.config.base_port;
        for step in 0..count {
            let offset = (state.next_offset + step) % count;
            let port = base + offset;
            if !state.is_free(port, now) {
                continue;
            }
            state.next_offset = (offset + 1) % count;
            return Ok(self.grant(&mut state, streamer_id, port, now));
        }

        warn!(streamer = %streamer_id, "Receive port pool exhausted");
        Err(PortError::ExhaustedPool)
    }

    pub fn acquire_port(&self, streamer_id: &str, port: u16) -> Result<PortLease, PortError> {
        self.acquire_port_at(streamer_id, port, Instant::now())
    }

    /// Lease exactly `port` for `streamer_id`
    ///
    /// Quarantine still applies, so a streamer reclaiming its previous port
    /// gets `Quarantined` until `reuse_delay` has passed.
    pub fn acquire_port_at(
        &self,
        streamer_id: &str,
        port: u16,
        now: Instant,
    ) -> Result<PortLease, PortError> {
        let mut state = self.state.lock();
        if !state.config.contains(port) {
            return Err(PortError::OutOfRange(port));
        }
        if let Some(held) = state.by_streamer.get(streamer_id) {
            return Err(PortError::AlreadyLeased {
                streamer_id: streamer_id.to_string(),
                port: *held,
            });
        }
        if state.leases.contains_key(&port) || state.pins.get(&port).is_some_and(|n| *n > 0) {
            return Err(PortError::InUse(port));
        }
        if !state.is_free(port, now) {
            return Err(PortError::Quarantined(port));
        }
        Ok(self.grant(&mut state, streamer_id, port, now))
    }

    fn grant(&self, state: &mut PoolState, streamer_id: &str, port: u16, now: Instant) -> PortLease {
        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            port,
            Lease {
                streamer_id: streamer_id.to_string(),
                lease_id,
                last_touch: now,
            },
        );
        state.by_streamer.insert(streamer_id.to_string(), port);
        debug!(streamer = %streamer_id, port, "Port leased");

        PortLease {
            allocator: self.clone(),
            streamer_id: streamer_id.to_string(),
            port,
            lease_id,
            released: false,
        }
    }

    pub fn release(&self, port: u16) -> Result<bool, PortError> {
        self.release_at(port, Instant::now())
    }

    /// Return `port` to the pool
    ///
    /// Idempotent: releasing a free port returns `Ok(false)`.
    pub fn release_at(&self, port: u16, now: Instant) -> Result<bool, PortError> {
        let mut state = self.state.lock();
        if !state.config.contains(port) {
            return Err(PortError::OutOfRange(port));
        }
        match state.remove_lease(port, now) {
            Some(lease) => {
                debug!(streamer = %lease.streamer_id, port, "Port released");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release only if `port` is still held by the given lease
    fn release_lease(&self, port: u16, lease_id: u64) -> bool {
        let mut state = self.state.lock();
        if state.leases.get(&port).map(|l| l.lease_id) != Some(lease_id) {
            return false;
        }
        state.remove_lease(port, Instant::now()).is_some()
    }

    pub fn touch(&self, port: u16) -> bool {
        self.touch_at(port, Instant::now())
    }

    /// Record that the owner of `port` is alive
    pub fn touch_at(&self, port: u16, now: Instant) -> bool {
        match self.state.lock().leases.get_mut(&port) {
            Some(lease) => {
                lease.last_touch = now;
                true
            }
            None => false,
        }
    }

    /// Reclaim leases not touched for `orphan_timeout`
    pub fn sweep(&self, now: Instant) -> Vec<(String, u16)> {
        let mut state = self.state.lock();
        let timeout = state.config.orphan_timeout;
        let mut stale: Vec<u16> = state
            .leases
            .iter()
            .filter(|(_, l)| now.saturating_duration_since(l.last_touch) >= timeout)
            .map(|(port, _)| *port)
            .collect();
        stale.sort_unstable();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for port in stale {
            if let Some(lease) = state.remove_lease(port, now) {
                info!(streamer = %lease.streamer_id, port, "Reclaimed orphaned port lease");
                reclaimed.push((lease.streamer_id, port));
            }
        }
        reclaimed
    }

    /// Keep `port` out of circulation until the returned guard drops
    pub fn pin(&self, port: u16) -> PortRef {
        *self.state.lock().pins.entry(port).or_insert(0) += 1;
        PortRef {
            allocator: self.clone(),
            port,
        }
    }

    pub fn lease_of(&self, streamer_id: &str) -> Option<u16> {
        self.state.lock().by_streamer.get(streamer_id).copied()
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Ports that `acquire` could hand out right now
    pub fn available_count(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let base = state.config.base_port;
        (0..state.config.port_count)
            .filter(|offset| state.is_free(base + offset, now))
            .count()
    }
}

/// Owned receive port
///
/// Dropping the lease releases the port unless it was already released or
/// reclaimed by the sweep.
#[derive(Debug)]
pub struct PortLease {
    allocator: PortAllocator,
    streamer_id: String,
    port: u16,
    lease_id: u64,
    released: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn streamer_id(&self) -> &str {
        &self.streamer_id
    }

    /// Whether the pool still attributes the port to this lease
    pub fn is_held(&self) -> bool {
        !self.released
            && self
                .allocator
                .state
                .lock()
                .leases
                .get(&self.port)
                .is_some_and(|l| l.lease_id == self.lease_id)
    }

    pub fn touch(&self) -> bool {
        self.is_held() && self.allocator.touch(self.port)
    }

    /// Release now; returns false if the sweep got there first
    pub fn release(mut self) -> bool {
        self.released = true;
        self.allocator.release_lease(self.port, self.lease_id)
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.released {
            self.allocator.release_lease(self.port, self.lease_id);
        }
    }
}

/// Pin on a port held by a relay supervisor
#[derive(Debug)]
pub struct PortRef {
    allocator: PortAllocator,
    port: u16,
}

impl PortRef {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortRef {
    fn drop(&mut self) {
        let mut state = self.allocator.state.lock();
        if let Some(count) = state.pins.get_mut(&self.port) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(&self.port);
            }
        }
    }
}
