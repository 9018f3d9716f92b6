//! Onion circuit protocol
//!
//! This module implements circuit construction, including:
//! - Cell protocol (channel cells and relay messages)
//! - Link specifiers for EXTEND2
//! - TAP and ntor hop handshakes (client and relay side)
//! - Onion layers with per-hop keys
//! - The circuit build state machine, and streams over a built circuit

mod cell;
mod circid;
mod circuit;
mod crypto;
mod handshake;
mod linkspec;
mod node;
mod relay;

pub use cell::{
    decode_create2, decode_created2, decode_destroy, decode_relay, frame_len, Cell, CellCommand,
    CellPayload, Create2Payload, Created2Payload, Decoder, DecoderTable, DestroyPayload,
    PayloadDecoders, CELL_HEADER_LEN, CELL_LEN, CELL_PAYLOAD_LEN,
};
pub use circid::{CircIdAllocator, INITIATOR_BIT};
pub use circuit::{Circuit, CircuitState, StreamInfo};
pub use crypto::{
    hybrid_decrypt, hybrid_encrypt, kdf_tor, Direction, HopCrypto, HopKeys, OnionLayers,
    TapKeyMaterial, HYBRID_LEN, TAP_KH_LEN,
};
pub use handshake::{
    build_handshake_request, server_handshake, verify_and_derive, EphemeralKey, HandshakeData,
    HandshakeReply, HandshakeType, OnionKeyPair,
};
pub use linkspec::{build_extend2, first_or_port, lstype, resolve_link_specifiers, LinkSpecifier};
pub use node::{Node, RsaIdentity};
pub use relay::{
    begin_flags, decode_begin, decode_connected, decode_data, decode_end, decode_extend2,
    decode_extended2, decode_truncated, BeginPayload, ConnectedPayload, Extend2Payload,
    Extended2Payload, RelayCell, RelayCommand, RelayDecoders, RelayMsg, RELAY_HEADER_LEN,
};
