//! Circuit build configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::HandshakeType;

/// Circuit build configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Handshake used for every hop
    pub handshake_type: HandshakeType,

    /// Timeout for the connection to hop 1, in milliseconds
    pub connect_timeout_ms: u64,

    /// Timeout for each CREATE2/EXTEND2 round trip, in milliseconds
    pub round_trip_timeout_ms: u64,

    /// Send DESTROY when a build fails after CREATE2 went out
    pub send_destroy_on_failure: bool,

    /// Collision retries when picking a circuit ID
    pub max_circ_id_attempts: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            handshake_type: HandshakeType::Ntor,
            connect_timeout_ms: 10_000,
            round_trip_timeout_ms: 30_000,
            send_destroy_on_failure: true,
            max_circ_id_attempts: 64,
        }
    }
}

impl CircuitConfig {
    /// Parse from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_handshake_type(mut self, handshake_type: HandshakeType) -> Self {
        self.handshake_type = handshake_type;
        self
    }

    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }
}
