//! Relay node records
//!
//! A [`Node`] is what the directory collaborator hands us: where a relay
//! listens and which long-term keys it holds. Circuits share nodes through
//! `Arc`, never copy them.

use std::fmt;
use std::net::IpAddr;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::{CircuitError, Result};

/// SHA-1 fingerprint of a relay's RSA identity key
pub type RsaIdentity = [u8; 20];

/// A relay's identity and reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Host the relay's OR port listens on
    pub host: String,

    /// OR (Onion Router) port
    pub port: u16,

    /// Legacy identity fingerprint (20 bytes)
    pub identity: RsaIdentity,

    /// Long-term onion key used by the handshake
    pub onion_key: PublicKey,

    /// Ed25519 identity, when the directory published one
    #[serde(default)]
    pub ed25519_identity: Option<[u8; 32]>,
}

impl Node {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        identity: RsaIdentity,
        onion_key: PublicKey,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            identity,
            onion_key,
            ed25519_identity: None,
        }
    }

    /// Build a node from descriptor-style text fields
    ///
    /// `fingerprint` is 40 hex digits, `onion_key` is base64 with or
    /// without padding.
    pub fn from_descriptor(
        host: impl Into<String>,
        port: u16,
        fingerprint: &str,
        onion_key: &str,
    ) -> Result<Self> {
        let host = host.into();
        let id_bytes = hex::decode(fingerprint.trim())
            .map_err(|e| CircuitError::InvalidNode(format!("Invalid fingerprint: {}", e)))?;
        let identity: RsaIdentity = id_bytes.as_slice().try_into().map_err(|_| {
            CircuitError::InvalidNode("Fingerprint must be 20 bytes (SHA-1)".into())
        })?;

        let key = onion_key.trim();
        let key_bytes = general_purpose::STANDARD
            .decode(key)
            .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(key))
            .map_err(|e| CircuitError::InvalidNode(format!("Invalid onion key: {}", e)))?;
        let key_bytes: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| {
            CircuitError::InvalidNode("Onion key must be 32 bytes".into())
        })?;

        log::debug!("Loaded node {}:{} ({})", host, port, hex::encode(&identity[..4]));

        Ok(Self::new(host, port, identity, PublicKey::from(key_bytes)))
    }

    pub fn with_ed25519_identity(mut self, id: [u8; 32]) -> Self {
        self.ed25519_identity = Some(id);
        self
    }

    /// The OR address as an IP literal, if `host` is one
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Hex fingerprint, uppercase as directories print it
    pub fn fingerprint(&self) -> String {
        hex::encode_upper(self.identity)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}~{}:{}", &self.fingerprint()[..8], self.host, self.port)
    }
}
