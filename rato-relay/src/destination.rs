//! Publishing destinations
//!
//! Destination URLs usually embed a stream key, so they are wrapped in
//! [`SecretUrl`], which only ever prints a masked form.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Destination URL that never prints in full
///
/// `Debug`, `Display` and `Serialize` all produce `scheme://host/***`. The
/// raw value is only reachable through [`SecretUrl::expose`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretUrl(String);

impl SecretUrl {
    pub fn new(url: impl Into<String>) -> Self {
        SecretUrl(url.into())
    }

    /// The raw URL, for building the publisher command line only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Scheme and host followed by `/***`
    pub fn masked(&self) -> String {
        let Some((scheme, rest)) = self.0.split_once("://") else {
            return "***".to_string();
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let host = authority.rsplit('@').next().unwrap_or_default();
        if host.is_empty() {
            format!("{}://***", scheme)
        } else {
            format!("{}://{}/***", scheme, host)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretUrl({})", self.masked())
    }
}

impl fmt::Display for SecretUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Serialize for SecretUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.masked())
    }
}

fn default_enabled() -> bool {
    true
}

/// One place a streamer's feed is published to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDestination {
    /// Platform label, unique per streamer
    pub platform: String,
    pub target: SecretUrl,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RelayDestination {
    pub fn new(platform: impl Into<String>, target: impl Into<String>) -> Self {
        RelayDestination {
            platform: platform.into(),
            target: SecretUrl::new(target),
            enabled: true,
        }
    }
}
