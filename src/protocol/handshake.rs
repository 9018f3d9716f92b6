//! Hop handshake engine
//!
//! One leg of key agreement between the client and a single hop, bound to
//! that hop's long-term onion key. Two handshake types are supported:
//!
//! - **TAP** (`0x0000`): the client value `X` travels hybrid-encrypted to
//!   the onion key; the responder proves knowledge of `DH(x, Y)` with
//!   `KH = KDF-TOR(DH)[..20]`.
//! - **ntor** (`0x0002`): X25519 ntor1 as used by Tor, authenticated by
//!   `AUTH = H(verify | ID | B | Y | X | PROTOID | "Server", t_mac)`.
//!
//! Both sides live here. [`build_handshake_request`] and
//! [`verify_and_derive`] are the client half; [`server_handshake`] is what a
//! relay runs on the CREATE2 it receives.
//!
//! Security: proofs are compared in constant time and an ephemeral key can
//! only be used once, since [`verify_and_derive`] consumes it.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html

use std::collections::HashSet;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CircuitError, Result};
use super::crypto::{
    hybrid_decrypt, hybrid_encrypt, HopKeys, TapKeyMaterial, HYBRID_LEN, TAP_KH_LEN,
};
use super::node::{Node, RsaIdentity};

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// Handshake type carried in CREATE2/EXTEND2 `HTYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeType {
    Tap,
    Ntor,
}

impl HandshakeType {
    pub fn from_u16(htype: u16) -> Option<Self> {
        match htype {
            0x0000 => Some(HandshakeType::Tap),
            0x0002 => Some(HandshakeType::Ntor),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            HandshakeType::Tap => 0x0000,
            HandshakeType::Ntor => 0x0002,
        }
    }

    /// Client HDATA length
    pub fn request_len(self) -> usize {
        match self {
            // E | ENC(X)
            HandshakeType::Tap => HYBRID_LEN,
            // ID | B | X
            HandshakeType::Ntor => 20 + 32 + 32,
        }
    }

    /// Server HDATA length
    pub fn reply_len(self) -> usize {
        match self {
            // Y | KH
            HandshakeType::Tap => 32 + TAP_KH_LEN,
            // Y | AUTH
            HandshakeType::Ntor => 32 + 32,
        }
    }
}

/// Client → server handshake data
///
/// Holds the public half only. `encoded` is what goes into HDATA, already
/// pre-processed for the handshake type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeData {
    handshake_type: HandshakeType,
    public: PublicKey,
    encoded: Vec<u8>,
}

impl HandshakeData {
    pub fn handshake_type(&self) -> HandshakeType {
        self.handshake_type
    }

    /// The ephemeral public value `GX`
    pub fn public_value(&self) -> &PublicKey {
        &self.public
    }

    /// HDATA bytes for CREATE2 / EXTEND2
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn into_encoded(self) -> Vec<u8> {
        self.encoded
    }
}

/// Server → client handshake reply: `GY` and the key-confirmation proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub public: PublicKey,
    pub proof: Vec<u8>,
}

impl HandshakeReply {
    /// Parse CREATED2/EXTENDED2 HDATA for `handshake_type`
    pub fn parse(handshake_type: HandshakeType, hdata: &[u8]) -> Result<Self> {
        let want = handshake_type.reply_len();
        if hdata.len() != want {
            return Err(CircuitError::MalformedCell(format!(
                "{:?} reply is {} bytes, expected {}",
                handshake_type,
                hdata.len(),
                want
            )));
        }
        let mut y = [0u8; 32];
        y.copy_from_slice(&hdata[..32]);
        Ok(Self {
            public: PublicKey::from(y),
            proof: hdata[32..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.proof.len());
        out.extend_from_slice(self.public.as_bytes());
        out.extend_from_slice(&self.proof);
        out
    }
}

/// The private half of a pending handshake
///
/// Never serialized and never sent. Consumed by [`verify_and_derive`], so a
/// retry has to start from a fresh [`build_handshake_request`].
pub struct EphemeralKey {
    handshake_type: HandshakeType,
    secret: StaticSecret,
    public: PublicKey,
    responder_identity: RsaIdentity,
    responder_onion_key: PublicKey,
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("handshake_type", &self.handshake_type)
            .finish_non_exhaustive()
    }
}

impl EphemeralKey {
    fn generate(handshake_type: HandshakeType, responder: &Node) -> Result<Self> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        // SECURITY: Validate entropy of generated key
        validate_entropy(public.as_bytes())?;

        Ok(Self {
            handshake_type,
            secret,
            public,
            responder_identity: responder.identity,
            responder_onion_key: responder.onion_key,
        })
    }

    pub fn handshake_type(&self) -> HandshakeType {
        self.handshake_type
    }
}

/// Detect obvious RNG failures (all zeros, all ones, repeated patterns)
fn validate_entropy(bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| b == 0) || bytes.iter().all(|&b| b == 0xFF) {
        log::error!("Ephemeral key is degenerate, RNG failure");
        return Err(CircuitError::Crypto("RNG failure: degenerate key".into()));
    }

    // Minimum byte variance (at least 8 unique bytes in 32)
    let unique: HashSet<u8> = bytes.iter().copied().collect();
    if unique.len() < 8 {
        log::error!("Ephemeral key has low entropy ({} unique bytes)", unique.len());
        return Err(CircuitError::Crypto("RNG failure: low entropy".into()));
    }
    Ok(())
}

/// Generate a fresh ephemeral key pair and the HDATA addressed to `responder`
pub fn build_handshake_request(
    handshake_type: HandshakeType,
    responder: &Node,
) -> Result<(EphemeralKey, HandshakeData)> {
    let key = EphemeralKey::generate(handshake_type, responder)?;

    let encoded = match handshake_type {
        HandshakeType::Tap => hybrid_encrypt(key.public.as_bytes(), &responder.onion_key)?.to_vec(),
        HandshakeType::Ntor => {
            let mut data = Vec::with_capacity(handshake_type.request_len());
            data.extend_from_slice(&responder.identity);
            data.extend_from_slice(responder.onion_key.as_bytes());
            data.extend_from_slice(key.public.as_bytes());
            data
        }
    };

    log::debug!(
        "Built {:?} handshake for {} (X starts {:02x?})",
        handshake_type,
        responder,
        &key.public.as_bytes()[..4]
    );

    let data = HandshakeData {
        handshake_type,
        public: key.public,
        encoded,
    };
    Ok((key, data))
}

/// Combine the ephemeral key with the responder's reply and check its proof
///
/// Returns the hop's session keys only if the proof verifies. A failed check
/// means a corrupted channel or an impersonation attempt; nothing derived
/// from the unverified shared value leaves this function.
pub fn verify_and_derive(ephemeral: EphemeralKey, reply: &HandshakeReply) -> Result<HopKeys> {
    match ephemeral.handshake_type {
        HandshakeType::Tap => tap_client_finish(&ephemeral, reply),
        HandshakeType::Ntor => ntor_client_finish(&ephemeral, reply),
    }
}

fn tap_client_finish(ephemeral: &EphemeralKey, reply: &HandshakeReply) -> Result<HopKeys> {
    let shared = ephemeral.secret.diffie_hellman(&reply.public);
    if !shared.was_contributory() {
        return Err(CircuitError::HandshakeVerification(
            "server value is a low-order point".into(),
        ));
    }

    let material = TapKeyMaterial::derive(shared.as_bytes())?;
    if !material.confirms(&reply.proof) {
        log::warn!("TAP key confirmation (KH) mismatch");
        return Err(CircuitError::HandshakeVerification("KH mismatch".into()));
    }
    Ok(material.keys.clone())
}

/// `secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID`
fn ntor_secret_input(
    xy: &[u8; 32],
    xb: &[u8; 32],
    identity: &RsaIdentity,
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Zeroizing<Vec<u8>> {
    let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 5 + 20 + PROTOID.len()));
    secret_input.extend_from_slice(xy);
    secret_input.extend_from_slice(xb);
    secret_input.extend_from_slice(identity);
    secret_input.extend_from_slice(b.as_bytes());
    secret_input.extend_from_slice(x.as_bytes());
    secret_input.extend_from_slice(y.as_bytes());
    secret_input.extend_from_slice(PROTOID);
    secret_input
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| CircuitError::Crypto("HMAC key rejected".into()))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// KEY_SEED and AUTH for an ntor secret_input
fn ntor_seed_and_auth(
    secret_input: &[u8],
    identity: &RsaIdentity,
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> Result<(Zeroizing<[u8; 32]>, [u8; 32])> {
    // KEY_SEED = H(secret_input, t_key)
    let key_seed = Zeroizing::new(hmac_sha256(T_KEY, secret_input)?);

    // verify = H(secret_input, t_verify)
    let verify = Zeroizing::new(hmac_sha256(T_VERIFY, secret_input)?);

    // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
    let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify[..]);
    auth_input.extend_from_slice(identity);
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");

    // AUTH = H(auth_input, t_mac)
    let auth = hmac_sha256(T_MAC, &auth_input)?;
    Ok((key_seed, auth))
}

fn ntor_client_finish(ephemeral: &EphemeralKey, reply: &HandshakeReply) -> Result<HopKeys> {
    // EXP(Y,x) - client secret with server's ephemeral public
    let xy = ephemeral.secret.diffie_hellman(&reply.public);
    // EXP(B,x) - client secret with relay's onion key
    let xb = ephemeral.secret.diffie_hellman(&ephemeral.responder_onion_key);
    if !xy.was_contributory() || !xb.was_contributory() {
        return Err(CircuitError::HandshakeVerification(
            "ntor shared value is degenerate".into(),
        ));
    }

    let secret_input = ntor_secret_input(
        xy.as_bytes(),
        xb.as_bytes(),
        &ephemeral.responder_identity,
        &ephemeral.responder_onion_key,
        &ephemeral.public,
        &reply.public,
    );
    let (key_seed, auth) = ntor_seed_and_auth(
        &secret_input,
        &ephemeral.responder_identity,
        &ephemeral.responder_onion_key,
        &ephemeral.public,
        &reply.public,
    )?;

    // SECURITY: constant-time comparison prevents timing attacks on AUTH
    let auth_valid: bool = auth.as_slice().ct_eq(&reply.proof).into();
    if !auth_valid {
        log::warn!("Server AUTH verification failed");
        return Err(CircuitError::HandshakeVerification(
            "Server AUTH verification failed".into(),
        ));
    }
    log::trace!("Server AUTH verified (constant-time)");

    HopKeys::from_ntor_seed(&key_seed[..])
}

/// A relay's long-term handshake material
pub struct OnionKeyPair {
    pub identity: RsaIdentity,
    secret: StaticSecret,
    public: PublicKey,
}

impl OnionKeyPair {
    pub fn new(identity: RsaIdentity, secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            identity,
            secret,
            public,
        }
    }

    /// A fresh random onion key under `identity`
    pub fn generate(identity: RsaIdentity) -> Self {
        Self::new(identity, StaticSecret::random_from_rng(OsRng))
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The directory record a client would use for this relay
    pub fn node(&self, host: impl Into<String>, port: u16) -> Node {
        Node::new(host, port, self.identity, self.public)
    }
}

/// Responder half: answer a client's HDATA
///
/// Returns the reply to put in CREATED2/EXTENDED2 and the keys the relay
/// shares with the client for this hop.
pub fn server_handshake(
    handshake_type: HandshakeType,
    keys: &OnionKeyPair,
    hdata: &[u8],
) -> Result<(HandshakeReply, HopKeys)> {
    if hdata.len() < handshake_type.request_len() {
        return Err(CircuitError::MalformedCell(format!(
            "{:?} request is {} bytes, need {}",
            handshake_type,
            hdata.len(),
            handshake_type.request_len()
        )));
    }

    let y_secret = StaticSecret::random_from_rng(OsRng);
    let y = PublicKey::from(&y_secret);

    match handshake_type {
        HandshakeType::Tap => {
            let x_bytes = hybrid_decrypt(&hdata[..HYBRID_LEN], &keys.secret)?;
            let x = PublicKey::from(*x_bytes);
            let shared = y_secret.diffie_hellman(&x);
            if !shared.was_contributory() {
                return Err(CircuitError::HandshakeVerification(
                    "client value is a low-order point".into(),
                ));
            }
            let material = TapKeyMaterial::derive(shared.as_bytes())?;
            let reply = HandshakeReply {
                public: y,
                proof: material.kh.to_vec(),
            };
            Ok((reply, material.keys.clone()))
        }
        HandshakeType::Ntor => {
            if hdata[..20] != keys.identity || hdata[20..52] != keys.public.as_bytes()[..] {
                return Err(CircuitError::mismatch(
                    "ntor request for this relay's keys",
                    "request for another identity",
                ));
            }
            let mut x_bytes = [0u8; 32];
            x_bytes.copy_from_slice(&hdata[52..84]);
            let x = PublicKey::from(x_bytes);

            // EXP(X,y) and EXP(X,b)
            let xy = y_secret.diffie_hellman(&x);
            let xb = keys.secret.diffie_hellman(&x);
            if !xy.was_contributory() || !xb.was_contributory() {
                return Err(CircuitError::HandshakeVerification(
                    "client value is a low-order point".into(),
                ));
            }

            let secret_input = ntor_secret_input(
                xy.as_bytes(),
                xb.as_bytes(),
                &keys.identity,
                &keys.public,
                &x,
                &y,
            );
            let (key_seed, auth) =
                ntor_seed_and_auth(&secret_input, &keys.identity, &keys.public, &x, &y)?;
            let reply = HandshakeReply {
                public: y,
                proof: auth.to_vec(),
            };
            Ok((reply, HopKeys::from_ntor_seed(&key_seed[..])?))
        }
    }
}
