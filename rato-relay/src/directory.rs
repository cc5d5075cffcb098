//! Streamer directory
//!
//! Source of per-streamer secrets and destinations. Persistence lives
//! outside this crate; [`StaticDirectory`] keeps profiles in memory.

use crate::destination::RelayDestination;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Everything the relay needs to know about one streamer
#[derive(Clone, Deserialize)]
pub struct StreamerProfile {
    pub id: String,
    /// Shared secret the frame key is derived from
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub destinations: Vec<RelayDestination>,
}

impl StreamerProfile {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        StreamerProfile {
            id: id.into(),
            secret: secret.into(),
            destinations: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: RelayDestination) -> Self {
        self.destinations.push(destination);
        self
    }

    pub fn enabled_destinations(&self) -> impl Iterator<Item = &RelayDestination> {
        self.destinations.iter().filter(|d| d.enabled)
    }
}

impl fmt::Debug for StreamerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerProfile")
            .field("id", &self.id)
            .field("secret", &"***")
            .field("destinations", &self.destinations)
            .finish()
    }
}

/// Lookup of streamer profiles
pub trait StreamerDirectory: Send + Sync {
    fn lookup(&self, streamer_id: &str) -> Option<StreamerProfile>;

    /// Ids of every known streamer
    fn streamers(&self) -> Vec<String>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<String, StreamerProfile>>,
}

impl StaticDirectory {
    pub fn new(profiles: impl IntoIterator<Item = StreamerProfile>) -> Self {
        StaticDirectory {
            profiles: RwLock::new(profiles.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }

    /// Add or replace a profile
    pub fn insert(&self, profile: StreamerProfile) -> Option<StreamerProfile> {
        self.profiles.write().insert(profile.id.clone(), profile)
    }

    /// Replace the destinations of a known streamer
    pub fn update_destinations(&self, streamer_id: &str, destinations: Vec<RelayDestination>) -> bool {
        match self.profiles.write().get_mut(streamer_id) {
            Some(profile) => {
                profile.destinations = destinations;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, streamer_id: &str) -> Option<StreamerProfile> {
        self.profiles.write().remove(streamer_id)
    }
}

impl StreamerDirectory for StaticDirectory {
    fn lookup(&self, streamer_id: &str) -> Option<StreamerProfile> {
        self.profiles.read().get(streamer_id).cloned()
    }

    fn streamers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
