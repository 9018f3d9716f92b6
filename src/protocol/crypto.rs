//! Circuit cryptography
//!
//! Key material and symmetric layers for circuit hops:
//! - KDF-TOR (SHA-1 counter mode) for the TAP handshake
//! - HKDF-SHA256 expansion for the ntor handshake
//! - X25519 + AES-128-CTR hybrid encryption of the TAP client value
//! - AES-128-CTR onion layers with SHA-1 running digests
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CircuitError, Result};
use super::cell::CELL_PAYLOAD_LEN;

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Length of the TAP key-confirmation hash `KH`
pub const TAP_KH_LEN: usize = 20;

/// Bytes of key material after KH: Df (20) | Db (20) | Kf (16) | Kb (16)
const HOP_KEY_MATERIAL_LEN: usize = 72;

/// Offsets of the fields a hop needs inside a relay body
const RECOGNIZED: std::ops::Range<usize> = 1..3;
const DIGEST: std::ops::Range<usize> = 5..9;

/// Keys for one hop
///
/// Each hop in the circuit has separate keys for:
/// - Forward encryption (client → relay)
/// - Backward encryption (relay → client)
/// - Forward digest seed (integrity)
/// - Backward digest seed (integrity)
///
/// SECURITY: Keys are automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; 16],

    /// Forward digest seed
    pub forward_digest: [u8; 20],

    /// Backward digest seed
    pub backward_digest: [u8; 20],
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HopKeys { .. }")
    }
}

impl HopKeys {
    /// Split `Df (20) | Db (20) | Kf (16) | Kb (16)`
    fn from_material(okm: &[u8]) -> Result<Self> {
        if okm.len() < HOP_KEY_MATERIAL_LEN {
            return Err(CircuitError::Crypto(format!(
                "need {} bytes of key material, got {}",
                HOP_KEY_MATERIAL_LEN,
                okm.len()
            )));
        }
        let mut keys = HopKeys {
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
        };
        keys.forward_digest.copy_from_slice(&okm[0..20]);
        keys.backward_digest.copy_from_slice(&okm[20..40]);
        keys.forward_key.copy_from_slice(&okm[40..56]);
        keys.backward_key.copy_from_slice(&okm[56..72]);
        Ok(keys)
    }

    /// Derive hop keys from an ntor KEY_SEED
    ///
    /// ```text
    /// K = HKDF-SHA256-Expand(KEY_SEED, m_expand)
    /// Output: Df (20) | Db (20) | Kf (16) | Kb (16) = 72 bytes
    /// ```
    pub fn from_ntor_seed(key_seed: &[u8]) -> Result<Self> {
        const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

        // KEY_SEED is already an HMAC output, so it is used directly as the PRK
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| CircuitError::Crypto("Invalid PRK length".into()))?;

        let mut okm = Zeroizing::new([0u8; HOP_KEY_MATERIAL_LEN]);
        hkdf.expand(M_EXPAND, &mut okm[..])
            .map_err(|_| CircuitError::Crypto("Key derivation failed".into()))?;

        Self::from_material(&okm[..])
    }
}

/// KDF-TOR: `K = H(K0 | [00]) | H(K0 | [01]) | ...` truncated to `len`
pub fn kdf_tor(seed: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(len + 20));
    let mut counter: u8 = 0;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// Output of KDF-TOR over a TAP shared value
pub struct TapKeyMaterial {
    /// Key-confirmation hash sent by the responder
    pub kh: [u8; TAP_KH_LEN],
    pub keys: HopKeys,
}

impl TapKeyMaterial {
    /// `KH (20) | Df | Db | Kf | Kb` from the DH shared value
    pub fn derive(shared: &[u8]) -> Result<Self> {
        let okm = kdf_tor(shared, TAP_KH_LEN + HOP_KEY_MATERIAL_LEN);
        let mut kh = [0u8; TAP_KH_LEN];
        kh.copy_from_slice(&okm[..TAP_KH_LEN]);
        let keys = HopKeys::from_material(&okm[TAP_KH_LEN..])?;
        Ok(Self { kh, keys })
    }

    /// Constant-time check of a received KH
    pub fn confirms(&self, proof: &[u8]) -> bool {
        self.kh.as_slice().ct_eq(proof).into()
    }
}

/// Length of a hybrid-encrypted 32-byte value: ephemeral key + ciphertext
pub const HYBRID_LEN: usize = 64;

fn hybrid_cipher(shared: &[u8; 32], ephemeral: &PublicKey) -> Result<Aes128Ctr> {
    const INFO: &[u8] = b"onion-circuit-tap:hybrid";
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral.as_bytes()), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hkdf.expand(INFO, &mut okm[..])
        .map_err(|_| CircuitError::Crypto("Hybrid key derivation failed".into()))?;
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&okm[..16]);
    iv.copy_from_slice(&okm[16..]);
    let cipher = Aes128Ctr::new(&key.into(), &iv.into());
    key.zeroize();
    Ok(cipher)
}

/// Encrypt a 32-byte value so only the holder of `recipient`'s secret reads it
///
/// Output: `E (32) | AES-128-CTR(value) (32)` where the key comes from
/// `DH(e, recipient)` under a fresh one-time key `e`.
pub fn hybrid_encrypt(value: &[u8; 32], recipient: &PublicKey) -> Result<[u8; HYBRID_LEN]> {
    let one_time = StaticSecret::random_from_rng(OsRng);
    let ephemeral = PublicKey::from(&one_time);
    let shared = one_time.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CircuitError::Crypto("Recipient onion key is a low-order point".into()));
    }

    let mut out = [0u8; HYBRID_LEN];
    out[..32].copy_from_slice(ephemeral.as_bytes());
    out[32..].copy_from_slice(value);
    hybrid_cipher(shared.as_bytes(), &ephemeral)?.apply_keystream(&mut out[32..]);
    Ok(out)
}

/// Inverse of [`hybrid_encrypt`]
pub fn hybrid_decrypt(data: &[u8], secret: &StaticSecret) -> Result<Zeroizing<[u8; 32]>> {
    if data.len() != HYBRID_LEN {
        return Err(CircuitError::MalformedCell(format!(
            "hybrid block is {} bytes, expected {}",
            data.len(),
            HYBRID_LEN
        )));
    }
    let mut eph = [0u8; 32];
    eph.copy_from_slice(&data[..32]);
    let ephemeral = PublicKey::from(eph);
    let shared = secret.diffie_hellman(&ephemeral);
    if !shared.was_contributory() {
        return Err(CircuitError::HandshakeVerification(
            "hybrid block uses a low-order point".into(),
        ));
    }

    let mut value = Zeroizing::new([0u8; 32]);
    value.copy_from_slice(&data[32..]);
    hybrid_cipher(shared.as_bytes(), &ephemeral)?.apply_keystream(&mut value[..]);
    Ok(value)
}

/// Which way a relay body travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client towards the exit
    Forward,
    /// Exit towards the client
    Backward,
}

/// Symmetric state for one hop, shared by both ends of that hop
///
/// AES-CTR keystreams and SHA-1 running digests persist across cells, so
/// every body must pass through here exactly once and in order.
pub struct HopCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    pub fn new(keys: &HopKeys) -> Self {
        // IVs start at zero (Tor spec)
        let iv = [0u8; 16];

        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest);

        Self {
            forward_cipher: Aes128Ctr::new(&keys.forward_key.into(), &iv.into()),
            backward_cipher: Aes128Ctr::new(&keys.backward_key.into(), &iv.into()),
            forward_digest,
            backward_digest,
        }
    }

    fn digest_mut(&mut self, dir: Direction) -> &mut Sha1 {
        match dir {
            Direction::Forward => &mut self.forward_digest,
            Direction::Backward => &mut self.backward_digest,
        }
    }

    /// Add or remove this hop's layer (CTR mode: encrypt = decrypt)
    pub fn apply(&mut self, dir: Direction, body: &mut [u8]) {
        match dir {
            Direction::Forward => self.forward_cipher.apply_keystream(body),
            Direction::Backward => self.backward_cipher.apply_keystream(body),
        }
    }

    /// Stamp the running digest into a plaintext body originated at this hop
    pub fn seal(&mut self, dir: Direction, body: &mut [u8]) -> Result<()> {
        if body.len() != CELL_PAYLOAD_LEN {
            return Err(CircuitError::MalformedCell(format!(
                "relay body of {} bytes, expected {}",
                body.len(),
                CELL_PAYLOAD_LEN
            )));
        }
        body[DIGEST].fill(0);
        let digest = self.digest_mut(dir);
        digest.update(&*body);
        let value = digest.clone().finalize();
        body[DIGEST].copy_from_slice(&value[..4]);
        Ok(())
    }

    /// Whether a body with this hop's layer removed is addressed to this hop
    ///
    /// The running digest only advances when the body is recognized.
    pub fn recognize(&mut self, dir: Direction, body: &[u8]) -> bool {
        if body.len() != CELL_PAYLOAD_LEN || body[RECOGNIZED] != [0, 0] {
            return false;
        }
        let mut zeroed = body.to_vec();
        zeroed[DIGEST].fill(0);

        let mut candidate = self.digest_mut(dir).clone();
        candidate.update(&zeroed);
        let value = candidate.clone().finalize();

        let matched: bool = value[..4].ct_eq(&body[DIGEST]).into();
        if matched {
            *self.digest_mut(dir) = candidate;
        }
        matched
    }
}

/// Client-side onion layers, one [`HopCrypto`] per established hop
///
/// Outbound bodies are encrypted from the farthest target hop back to hop 1;
/// inbound bodies are decrypted from hop 1 outward until a hop recognizes
/// them. Applying the layers in any other order yields garbage, not an
/// error, so the hop list only ever grows at the end.
#[derive(Default)]
pub struct OnionLayers {
    hops: Vec<HopCrypto>,
}

impl OnionLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the layer for the next hop
    pub fn push(&mut self, keys: &HopKeys) {
        self.hops.push(HopCrypto::new(keys));
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Seal `body` for hop `target` (1-based) and wrap it in layers target..=1
    pub fn encrypt_outbound(&mut self, body: &mut [u8], target: usize) -> Result<()> {
        if target == 0 || target > self.hops.len() {
            return Err(CircuitError::InvalidState(format!(
                "no layer for hop {} (circuit has {})",
                target,
                self.hops.len()
            )));
        }
        self.hops[target - 1].seal(Direction::Forward, body)?;

        // Encrypt in reverse order: target hop first, hop 1 last
        for hop in self.hops[..target].iter_mut().rev() {
            hop.apply(Direction::Forward, body);
        }
        Ok(())
    }

    /// Peel layers from hop 1 outward; returns the 1-based hop that sent it
    pub fn decrypt_inbound(&mut self, body: &mut [u8]) -> Result<usize> {
        for (idx, hop) in self.hops.iter_mut().enumerate() {
            hop.apply(Direction::Backward, body);
            if hop.recognize(Direction::Backward, body) {
                return Ok(idx + 1);
            }
        }

        // No hop verified - invalid cell
        Err(CircuitError::MalformedCell(
            "relay cell not recognized by any hop".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> HopKeys {
        HopKeys::from_ntor_seed(&[seed; 32]).unwrap()
    }

    fn body_with(data: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; CELL_PAYLOAD_LEN];
        body[0] = 2; // DATA
        body[11..11 + data.len()].copy_from_slice(data);
        body
    }

    #[test]
    fn test_key_derivation() {
        let k = keys(42);
        assert_ne!(k.forward_key, [0u8; 16]);
        assert_ne!(k.forward_key, k.backward_key);
        assert_ne!(k.forward_digest, k.backward_digest);

        // Derive again - should be deterministic
        assert!(k == keys(42));
        assert!(k != keys(43));
    }

    #[test]
    fn test_kdf_tor_blocks() {
        let out = kdf_tor(b"seed", 45);
        assert_eq!(out.len(), 45);

        let mut h0 = Sha1::new();
        h0.update(b"seed");
        h0.update([0u8]);
        assert_eq!(&out[..20], h0.finalize().as_slice());

        let mut h1 = Sha1::new();
        h1.update(b"seed");
        h1.update([1u8]);
        assert_eq!(&out[20..40], h1.finalize().as_slice());
    }

    #[test]
    fn test_tap_material_confirms_only_exact_kh() {
        let material = TapKeyMaterial::derive(&[5u8; 32]).unwrap();
        assert!(material.confirms(&material.kh));
        let mut bad = material.kh;
        bad[0] ^= 1;
        assert!(!material.confirms(&bad));
        assert!(!material.confirms(&material.kh[..19]));
    }

    #[test]
    fn test_hybrid_round_trip() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let value = [0x42u8; 32];

        let sealed = hybrid_encrypt(&value, &public).unwrap();
        assert_ne!(&sealed[32..], &value);
        assert_eq!(*hybrid_decrypt(&sealed, &secret).unwrap(), value);

        let other = StaticSecret::random_from_rng(OsRng);
        assert_ne!(*hybrid_decrypt(&sealed, &other).unwrap(), value);
    }

    #[test]
    fn test_onion_three_hops_outbound() {
        let hop_keys = [keys(1), keys(2), keys(3)];
        let mut client = OnionLayers::new();
        let mut relays: Vec<HopCrypto> = hop_keys.iter().map(HopCrypto::new).collect();
        for k in &hop_keys {
            client.push(k);
        }

        let original = body_with(b"through 3 hops");
        let mut body = original.clone();
        client.encrypt_outbound(&mut body, 3).unwrap();

        // Each relay peels one layer; only the last recognizes it
        relays[0].apply(Direction::Forward, &mut body);
        assert!(!relays[0].recognize(Direction::Forward, &body));
        relays[1].apply(Direction::Forward, &mut body);
        assert!(!relays[1].recognize(Direction::Forward, &body));
        relays[2].apply(Direction::Forward, &mut body);
        assert!(relays[2].recognize(Direction::Forward, &body));
        assert_eq!(&body[11..25], b"through 3 hops");
    }

    #[test]
    fn test_onion_inbound_from_middle_hop() {
        let hop_keys = [keys(1), keys(2), keys(3)];
        let mut client = OnionLayers::new();
        let mut relays: Vec<HopCrypto> = hop_keys.iter().map(HopCrypto::new).collect();
        for k in &hop_keys {
            client.push(k);
        }

        let mut body = body_with(b"from hop two");
        relays[1].seal(Direction::Backward, &mut body).unwrap();
        relays[1].apply(Direction::Backward, &mut body);
        relays[0].apply(Direction::Backward, &mut body);

        assert_eq!(client.decrypt_inbound(&mut body).unwrap(), 2);
        assert_eq!(&body[11..23], b"from hop two");
    }

    #[test]
    fn test_running_digest_rejects_replay() {
        let mut client = OnionLayers::new();
        client.push(&keys(1));
        let mut relay = HopCrypto::new(&keys(1));

        let mut first = body_with(b"one");
        relay.seal(Direction::Backward, &mut first).unwrap();
        relay.apply(Direction::Backward, &mut first);
        let mut replayed = first.clone();

        assert_eq!(client.decrypt_inbound(&mut first).unwrap(), 1);
        assert!(client.decrypt_inbound(&mut replayed).is_err());
    }

    #[test]
    fn test_unrecognized_inbound_rejected() {
        let mut client = OnionLayers::new();
        client.push(&keys(1));
        let mut body = vec![0x5Au8; CELL_PAYLOAD_LEN];
        assert!(client.decrypt_inbound(&mut body).is_err());
    }

    #[test]
    fn test_encrypt_outbound_bad_target() {
        let mut client = OnionLayers::new();
        client.push(&keys(1));
        let mut body = body_with(b"x");
        assert!(client.encrypt_outbound(&mut body, 0).is_err());
        assert!(client.encrypt_outbound(&mut body, 2).is_err());
    }

    #[test]
    fn test_short_body_rejected() {
        let mut client = OnionLayers::new();
        client.push(&keys(1));
        let mut short = [0u8; 4];
        assert!(matches!(
            client.encrypt_outbound(&mut short, 1),
            Err(CircuitError::MalformedCell(_))
        ));
        // Nothing was encrypted
        assert_eq!(short, [0u8; 4]);

        let mut relay = HopCrypto::new(&keys(1));
        let mut long = vec![0u8; CELL_PAYLOAD_LEN + 1];
        assert!(relay.seal(Direction::Backward, &mut long).is_err());
    }

    #[test]
    fn test_hop_keys_zeroize() {
        let mut k = keys(9);
        k.zeroize();
        assert_eq!(k.forward_key, [0u8; 16]);
        assert_eq!(k.backward_key, [0u8; 16]);
        assert_eq!(k.forward_digest, [0u8; 20]);
        assert_eq!(k.backward_digest, [0u8; 20]);
    }
}
