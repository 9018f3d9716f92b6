//! # Onion Circuit
//!
//! Client-side construction of multi-hop onion-routing circuits.
//!
//! ## Architecture
//!
//! ```text
//! Circuit (state machine)
//!   ↓
//! Handshake engine (TAP / ntor) + Link specifiers
//!   ↓
//! Cell codec
//!   ↓
//! Transport (TCP to hop 1)
//! ```
//!
//! ## Features
//!
//! - **Per-hop forward secrecy**: fresh ephemeral X25519 keys for every hop
//! - **Fail closed**: a bad proof, unexpected cell or wrong circuit ID
//!   tears the circuit down
//! - **Bounded**: the connect and every round trip have a timeout and a
//!   cancellation token
//! - **Streams**: once built, BEGIN/CONNECTED streams carry DATA through the exit
//! - **Both sides**: the relay half of each handshake is included, so a
//!   circuit can be exercised end to end against in-process relays
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use onion_circuit::{Circuit, CircuitConfig, Node, TcpTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(path: Vec<Arc<Node>>) -> onion_circuit::Result<()> {
//! let mut circuit = Circuit::new(path, Arc::new(TcpTransport::new()), CircuitConfig::default())?;
//! let cancel = CancellationToken::new();
//! circuit.build(&cancel).await?;
//! assert_eq!(circuit.session_keys().len(), circuit.path().len());
//!
//! let stream = circuit.begin_stream("example.com", 80, &cancel).await?;
//! circuit.send_data(stream.stream_id, b"GET / HTTP/1.0\r\n\r\n").await?;
//! while let Some(chunk) = circuit.recv_data(stream.stream_id, &cancel).await? {
//!     println!("{} bytes", chunk.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;


pub use config::CircuitConfig;
pub use error::{CircuitError, ErrorCode, Result};
pub use protocol::{
    build_handshake_request, server_handshake, verify_and_derive, Cell, CellCommand, Circuit,
    CircuitState, HandshakeReply, HandshakeType, HopKeys, LinkSpecifier, Node, OnionKeyPair,
    OnionLayers, RelayCell, RelayMsg, StreamInfo,
};
pub use transport::{Channel, TcpTransport, Transport};
