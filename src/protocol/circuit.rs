//! Circuit state machine
//!
//! Drives one circuit from nothing to N established hops:
//!
//! ```text
//! UNBUILT → CONNECTING → HOP1_HANDSHAKING → HOP1_READY
//!         → EXTENDING(2) → HOP2_READY → … → BUILT
//! ```
//!
//! Any failure along the way lands in FAILED, which is terminal. Each round
//! trip is bounded by the configured timeout and by the caller's
//! [`CancellationToken`]. Hop keys are appended only after the hop's proof
//! verified, so `session_key(i)` exists exactly when hops 1..=i are up.
//!
//! Only hop 1 is reached over a physical connection; hop i > 1 is reached
//! by an EXTEND2 sent through the layers of hops 1..i-1. Once built, streams
//! are opened at the last hop with BEGIN/CONNECTED.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use futures::FutureExt;
use rand::rngs::OsRng;
use tokio_util::sync::CancellationToken;

use crate::config::CircuitConfig;
use crate::error::{CircuitError, Result};
use crate::transport::{Channel, Transport};
use super::cell::{
    frame_len, Cell, CellCommand, CellPayload, DestroyPayload, PayloadDecoders, CELL_LEN,
};
use super::circid::CircIdAllocator;
use super::crypto::{HopKeys, OnionLayers};
use super::handshake::{build_handshake_request, verify_and_derive, HandshakeReply, HandshakeType};
use super::linkspec::build_extend2;
use super::node::Node;
use super::relay::{BeginPayload, RelayCell, RelayCommand, RelayDecoders, RelayMsg};

/// RELAY_END reason for a stream we are done with
const END_REASON_DONE: u8 = 6;

/// Where a circuit is in its build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Unbuilt,
    Connecting,
    Hop1Handshaking,
    /// Hops 1..=n are established and more remain
    Ready(usize),
    /// EXTEND2 for hop n is in flight
    Extending(usize),
    Built,
    Failed,
}

impl CircuitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CircuitState::Built | CircuitState::Failed)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Unbuilt => f.write_str("UNBUILT"),
            CircuitState::Connecting => f.write_str("CONNECTING"),
            CircuitState::Hop1Handshaking => f.write_str("HOP1_HANDSHAKING"),
            CircuitState::Ready(n) => write!(f, "HOP{}_READY", n),
            CircuitState::Extending(n) => write!(f, "EXTENDING({})", n),
            CircuitState::Built => f.write_str("BUILT"),
            CircuitState::Failed => f.write_str("FAILED"),
        }
    }
}

/// A stream the exit accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: u16,
    /// Address the exit connected to, if it said
    pub address: Option<IpAddr>,
    /// Seconds the address may be cached
    pub ttl: u32,
}

/// A circuit over `path`, reached through a channel from `T`
pub struct Circuit<T: Transport> {
    path: Vec<Arc<Node>>,
    transport: Arc<T>,
    config: CircuitConfig,
    state: CircuitState,

    /// Circuit ID on the channel to hop 1, once connected
    circuit_id: Option<u32>,
    circ_ids: CircIdAllocator,
    channel: Option<T::Channel>,

    /// Bytes received but not yet framed into a cell
    inbound: Vec<u8>,
    /// Whether hop 1 may hold state for us (CREATE2 went out)
    create_sent: bool,
    /// A cell was only partly written; nothing more may go on the stream
    torn_write: bool,

    keys: Vec<HopKeys>,
    layers: OnionLayers,
    cell_decoders: PayloadDecoders,
    relay_decoders: RelayDecoders,
    failure: Option<CircuitError>,

    /// Open streams, each with messages read ahead for it
    streams: HashMap<u16, VecDeque<RelayMsg>>,
    next_stream_id: u16,
}

impl<T: Transport> Circuit<T> {
    /// A new, unbuilt circuit; `path[0]` is hop 1
    pub fn new(path: Vec<Arc<Node>>, transport: Arc<T>, config: CircuitConfig) -> Result<Self> {
        if path.is_empty() {
            return Err(CircuitError::Config("circuit path is empty".into()));
        }
        let circ_ids = CircIdAllocator::new(config.max_circ_id_attempts);
        Ok(Self {
            path,
            transport,
            config,
            state: CircuitState::Unbuilt,
            circuit_id: None,
            circ_ids,
            channel: None,
            inbound: Vec::with_capacity(CELL_LEN),
            create_sent: false,
            torn_write: false,
            keys: Vec::new(),
            layers: OnionLayers::new(),
            cell_decoders: PayloadDecoders::standard(),
            relay_decoders: RelayDecoders::standard(),
            failure: None,
            streams: HashMap::new(),
            next_stream_id: 1,
        })
    }

    /// Replace the channel-cell decoder table
    pub fn with_cell_decoders(mut self, decoders: PayloadDecoders) -> Self {
        self.cell_decoders = decoders;
        self
    }

    /// Replace the relay-message decoder table
    pub fn with_relay_decoders(mut self, decoders: RelayDecoders) -> Self {
        self.relay_decoders = decoders;
        self
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn circuit_id(&self) -> Option<u32> {
        self.circuit_id
    }

    pub fn path(&self) -> &[Arc<Node>] {
        &self.path
    }

    /// Number of hops with verified keys
    pub fn hop_count(&self) -> usize {
        self.keys.len()
    }

    /// Keys for hop `i` (1-based), if that hop is established
    pub fn session_key(&self, i: usize) -> Option<&HopKeys> {
        i.checked_sub(1).and_then(|idx| self.keys.get(idx))
    }

    pub fn session_keys(&self) -> &[HopKeys] {
        &self.keys
    }

    /// Why the circuit failed, once it has
    pub fn failure(&self) -> Option<&CircuitError> {
        self.failure.as_ref()
    }

    fn handshake_type(&self) -> HandshakeType {
        self.config.handshake_type
    }

    fn require_state(&self, want: CircuitState, op: &str) -> Result<()> {
        if self.state != want {
            return Err(CircuitError::InvalidState(format!(
                "{} needs {}, circuit is {}",
                op, want, self.state
            )));
        }
        Ok(())
    }

    /// State after hop `n` came up
    fn ready_state(&self, n: usize) -> CircuitState {
        if n == self.path.len() {
            CircuitState::Built
        } else {
            CircuitState::Ready(n)
        }
    }

    /// Connect to hop 1
    ///
    /// Later hops are never connected to directly; see
    /// [`Circuit::extend_circuit_hop_i`].
    pub async fn open_connection(
        &mut self,
        hop_index: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if hop_index != 1 {
            return Err(CircuitError::InvalidState(format!(
                "only hop 1 is connected directly, not hop {}",
                hop_index
            )));
        }
        self.require_state(CircuitState::Unbuilt, "open_connection")?;
        self.state = CircuitState::Connecting;

        let node = Arc::clone(&self.path[0]);
        log::info!("Connecting to hop 1 {}", node);

        let limit = self.config.connect_timeout();
        let connect = self.transport.connect(&node.host, node.port);
        let connected = futures::select_biased! {
            _ = cancel.cancelled().fuse() => {
                log::info!("Connect to {} cancelled", node);
                Err(CircuitError::Cancelled)
            }
            _ = tokio::time::sleep(limit).fuse() => {
                log::warn!("Connect to {} timed out", node);
                Err(CircuitError::Timeout)
            }
            res = connect.fuse() => res,
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail(e).await),
        };
        self.channel = Some(channel);

        let id = match self.circ_ids.allocate(&mut OsRng) {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e).await),
        };
        self.circuit_id = Some(id);
        self.state = CircuitState::Hop1Handshaking;
        log::debug!("Connected to {}, circuit ID 0x{:08x}", node, id);
        Ok(())
    }

    /// CREATE2/CREATED2 with hop 1
    pub async fn create_circuit_hop1(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.require_state(CircuitState::Hop1Handshaking, "create_circuit_hop1")?;
        match self.handshake_hop1(cancel).await {
            Ok(keys) => {
                self.add_hop(keys);
                self.state = self.ready_state(1);
                log::info!("Hop 1 {} established ({})", self.path[0], self.state);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn handshake_hop1(&mut self, cancel: &CancellationToken) -> Result<HopKeys> {
        let id = self.id()?;
        let htype = self.handshake_type();
        let node = Arc::clone(&self.path[0]);

        if cancel.is_cancelled() {
            return Err(CircuitError::Cancelled);
        }
        let (ephemeral, hdata) = build_handshake_request(htype, &node)?;
        let create = Cell::create2(id, htype, hdata.into_encoded());

        log::debug!("Sending CREATE2 ({:?}) on circuit 0x{:08x}", htype, id);
        self.create_sent = true;
        let reply = self.round_trip(create, cancel).await?;
        self.check_circuit_id(&reply)?;

        match reply.into_payload() {
            CellPayload::Created2(created) => {
                let reply = HandshakeReply::parse(htype, &created.handshake_data)?;
                verify_and_derive(ephemeral, &reply)
            }
            CellPayload::Destroy(d) => Err(CircuitError::circuit_destroyed(d.reason)),
            other => Err(CircuitError::mismatch(CellCommand::Created2, other.name())),
        }
    }

    /// EXTEND2/EXTENDED2 to hop `i` (2..=N) through hops 1..i-1
    ///
    /// Only valid once hop i-1 is ready; calling it out of order is a
    /// contract violation that leaves the circuit untouched.
    pub async fn extend_circuit_hop_i(
        &mut self,
        i: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if i < 2 || i > self.path.len() {
            return Err(CircuitError::InvalidState(format!(
                "cannot extend to hop {} on a {}-hop path",
                i,
                self.path.len()
            )));
        }
        self.require_state(CircuitState::Ready(i - 1), "extend_circuit_hop_i")?;
        self.state = CircuitState::Extending(i);

        match self.handshake_hop_i(i, cancel).await {
            Ok(keys) => {
                self.add_hop(keys);
                self.state = self.ready_state(i);
                log::info!("Hop {} {} established ({})", i, self.path[i - 1], self.state);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn handshake_hop_i(&mut self, i: usize, cancel: &CancellationToken) -> Result<HopKeys> {
        let id = self.id()?;
        let htype = self.handshake_type();
        let target = Arc::clone(&self.path[i - 1]);

        let (ephemeral, extend) = build_extend2(&target, htype)?;
        let mut body = RelayCell::from_msg(&RelayMsg::Extend2(extend))?.to_bytes()?;

        // Only hop i-1 can read the EXTEND2
        self.layers.encrypt_outbound(&mut body, i - 1)?;

        log::debug!("Sending EXTEND2 for hop {} {} via hop {}", i, target, i - 1);
        let reply = self.round_trip(Cell::relay_early(id, body), cancel).await?;
        self.check_circuit_id(&reply)?;

        let mut body = match reply.into_payload() {
            CellPayload::Relay(body) => body,
            CellPayload::Destroy(d) => return Err(CircuitError::circuit_destroyed(d.reason)),
            other => {
                return Err(CircuitError::mismatch(CellCommand::Relay, other.name()));
            }
        };

        let from_hop = self.layers.decrypt_inbound(&mut body)?;
        let relay = RelayCell::from_bytes(&body)?;
        match relay.msg(&self.relay_decoders)? {
            RelayMsg::Extended2(extended) if from_hop == i - 1 => {
                let reply = HandshakeReply::parse(htype, &extended.handshake_data)?;
                verify_and_derive(ephemeral, &reply)
            }
            RelayMsg::Extended2(_) => Err(CircuitError::mismatch(
                format!("EXTENDED2 from hop {}", i - 1),
                format!("EXTENDED2 from hop {}", from_hop),
            )),
            RelayMsg::Truncated(reason) => {
                log::warn!("Hop {} truncated the circuit (reason {})", from_hop, reason);
                Err(CircuitError::circuit_destroyed(reason))
            }
            RelayMsg::Unparsed(cmd, _) => Err(CircuitError::mismatch(
                RelayCommand::Extended2,
                format!("undecoded {}", cmd),
            )),
            other => Err(CircuitError::mismatch(RelayCommand::Extended2, other.command())),
        }
    }

    /// Run the whole build: connect, hop 1, then every extension in order
    pub async fn build(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CircuitError::Cancelled);
        }
        self.open_connection(1, cancel).await?;
        self.create_circuit_hop1(cancel).await?;
        for i in 2..=self.path.len() {
            self.extend_circuit_hop_i(i, cancel).await?;
        }
        log::info!(
            "Circuit 0x{:08x} built through {} hops",
            self.circuit_id.unwrap_or_default(),
            self.keys.len()
        );
        Ok(())
    }

    /// Tear the circuit down
    ///
    /// Sends a best-effort DESTROY if hop 1 may know about the circuit,
    /// closes the channel and leaves the circuit FAILED. A no-op on a
    /// circuit that already failed.
    pub async fn abort(&mut self) {
        if self.state == CircuitState::Failed {
            return;
        }
        log::info!("Aborting circuit in state {}", self.state);
        self.teardown(DestroyPayload::FINISHED).await;
        self.state = CircuitState::Failed;
        self.failure = Some(CircuitError::Cancelled);
    }

    /// Send a relay cell to hop `hop` (1-based) through the layers
    pub async fn send_relay(&mut self, hop: usize, cell: &RelayCell) -> Result<()> {
        self.require_usable("send_relay")?;
        let id = self.id()?;
        let mut body = cell.to_bytes()?;
        self.layers.encrypt_outbound(&mut body, hop)?;

        let bytes = Cell::relay(id, body).to_bytes()?;
        let res = match self.channel.as_mut() {
            Some(channel) => channel.send(&bytes).await,
            None => Err(CircuitError::InvalidState("no channel".into())),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Wait for the next relay cell; returns the hop that sent it
    pub async fn recv_relay(&mut self, cancel: &CancellationToken) -> Result<(usize, RelayCell)> {
        self.require_usable("recv_relay")?;
        match self.recv_relay_inner(cancel).await {
            Ok(got) => Ok(got),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn recv_relay_inner(&mut self, cancel: &CancellationToken) -> Result<(usize, RelayCell)> {
        let cell = self.bounded(cancel, None).await?;
        self.check_circuit_id(&cell)?;
        let mut body = match cell.into_payload() {
            CellPayload::Relay(body) => body,
            CellPayload::Destroy(d) => return Err(CircuitError::circuit_destroyed(d.reason)),
            other => return Err(CircuitError::mismatch(CellCommand::Relay, other.name())),
        };
        let hop = self.layers.decrypt_inbound(&mut body)?;
        let relay = RelayCell::from_bytes(&body)?;
        if let RelayMsg::Truncated(reason) = relay.msg(&self.relay_decoders)? {
            return Err(CircuitError::circuit_destroyed(reason));
        }
        log::trace!("Relay {} from hop {}", relay.command, hop);
        Ok((hop, relay))
    }

    /// Open a stream from the last hop to `address:port`
    ///
    /// An END from the exit refuses the stream without harming the circuit;
    /// any other reply fails the circuit.
    pub async fn begin_stream(
        &mut self,
        address: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<StreamInfo> {
        self.require_state(CircuitState::Built, "begin_stream")?;
        let stream_id = self.allocate_stream_id()?;
        let exit = self.path.len();

        let begin = RelayMsg::Begin(BeginPayload::new(address, port));
        let cell = RelayCell::new(RelayCommand::Begin, stream_id, begin.encode()?);
        log::debug!("Opening stream {} to {}:{} at hop {}", stream_id, address, port, exit);
        self.send_relay(exit, &cell).await?;

        let msg = loop {
            let (hop, reply) = self.recv_relay(cancel).await?;
            if hop == exit && reply.stream_id == stream_id {
                break reply.msg(&self.relay_decoders);
            }
            // Traffic for streams already open is held for them
            match self.stream_msg(hop, &reply) {
                Ok(other) => {
                    if let Some(queue) = self.streams.get_mut(&reply.stream_id) {
                        queue.push_back(other);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match msg {
            Ok(RelayMsg::Connected(connected)) => {
                self.streams.insert(stream_id, VecDeque::new());
                log::info!("Stream {} to {}:{} connected", stream_id, address, port);
                Ok(StreamInfo {
                    stream_id,
                    address: connected.address,
                    ttl: connected.ttl,
                })
            }
            Ok(RelayMsg::End(reason)) => {
                log::info!("Exit refused stream to {}:{} (reason {})", address, port, reason);
                Err(CircuitError::stream_closed(reason))
            }
            Ok(other) => {
                let err = CircuitError::mismatch(RelayCommand::Connected, other.command());
                Err(self.fail(err).await)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Send `data` on an open stream, split over as many DATA cells as needed
    pub async fn send_data(&mut self, stream_id: u16, data: &[u8]) -> Result<()> {
        self.require_stream(stream_id, "send_data")?;
        let exit = self.path.len();
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            let cell = RelayCell::new(RelayCommand::Data, stream_id, chunk.to_vec());
            self.send_relay(exit, &cell).await?;
        }
        Ok(())
    }

    /// Next chunk of data on `stream_id`; `None` once the exit ended it
    ///
    /// Cells for other open streams that arrive first are held for them.
    pub async fn recv_data(
        &mut self,
        stream_id: u16,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        self.require_stream(stream_id, "recv_data")?;
        let msg = loop {
            if let Some(msg) = self.streams.get_mut(&stream_id).and_then(VecDeque::pop_front) {
                break msg;
            }
            let (hop, reply) = self.recv_relay(cancel).await?;
            match self.stream_msg(hop, &reply) {
                Ok(msg) if reply.stream_id == stream_id => break msg,
                Ok(msg) => {
                    if let Some(queue) = self.streams.get_mut(&reply.stream_id) {
                        queue.push_back(msg);
                    }
                }
                Err(e) => return Err(self.fail(e).await),
            }
        };

        match msg {
            RelayMsg::Data(data) => Ok(Some(data)),
            RelayMsg::End(reason) => {
                log::debug!("Stream {} ended by exit (reason {})", stream_id, reason);
                self.streams.remove(&stream_id);
                Ok(None)
            }
            other => {
                let err = CircuitError::mismatch(RelayCommand::Data, other.command());
                Err(self.fail(err).await)
            }
        }
    }

    /// Close a stream from our side
    pub async fn end_stream(&mut self, stream_id: u16) -> Result<()> {
        self.require_stream(stream_id, "end_stream")?;
        self.streams.remove(&stream_id);
        let end = RelayMsg::End(END_REASON_DONE).encode()?;
        let cell = RelayCell::new(RelayCommand::End, stream_id, end);
        self.send_relay(self.path.len(), &cell).await
    }

    /// Number of streams open on this circuit
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
            if !self.streams.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(CircuitError::InvalidState("no free stream ID".into()))
    }

    fn require_stream(&self, stream_id: u16, op: &str) -> Result<()> {
        self.require_state(CircuitState::Built, op)?;
        if !self.streams.contains_key(&stream_id) {
            return Err(CircuitError::InvalidState(format!(
                "{} on stream {}, which is not open",
                op, stream_id
            )));
        }
        Ok(())
    }

    /// Decode a stream cell from the exit for one of our open streams
    fn stream_msg(&self, hop: usize, reply: &RelayCell) -> Result<RelayMsg> {
        let exit = self.path.len();
        if hop != exit || !self.streams.contains_key(&reply.stream_id) {
            return Err(CircuitError::mismatch(
                format!("stream cell from hop {}", exit),
                format!("{} on stream {} from hop {}", reply.command, reply.stream_id, hop),
            ));
        }
        reply.msg(&self.relay_decoders)
    }

    fn require_usable(&self, op: &str) -> Result<()> {
        match self.state {
            CircuitState::Ready(_) | CircuitState::Built => Ok(()),
            state => Err(CircuitError::InvalidState(format!(
                "{} needs an established hop, circuit is {}",
                op, state
            ))),
        }
    }

    fn add_hop(&mut self, keys: HopKeys) {
        self.layers.push(&keys);
        self.keys.push(keys);
    }

    fn id(&self) -> Result<u32> {
        self.circuit_id
            .ok_or_else(|| CircuitError::InvalidState("no circuit ID before connecting".into()))
    }

    fn check_circuit_id(&self, cell: &Cell) -> Result<()> {
        let id = self.id()?;
        if cell.circuit_id() != id {
            log::warn!(
                "Reply on circuit 0x{:08x}, expected 0x{:08x}",
                cell.circuit_id(),
                id
            );
            return Err(CircuitError::mismatch(
                format!("circuit ID 0x{:08x}", id),
                format!("circuit ID 0x{:08x}", cell.circuit_id()),
            ));
        }
        Ok(())
    }

    /// Send `cell` and wait for exactly one reply cell
    async fn round_trip(&mut self, cell: Cell, cancel: &CancellationToken) -> Result<Cell> {
        let bytes = cell.to_bytes()?;
        self.bounded(cancel, Some(bytes)).await
    }

    /// Optionally send `outbound`, then read one cell, under timeout and cancellation
    async fn bounded(
        &mut self,
        cancel: &CancellationToken,
        outbound: Option<Vec<u8>>,
    ) -> Result<Cell> {
        let limit = self.config.round_trip_timeout();
        let decoders = &self.cell_decoders;
        let inbound = &mut self.inbound;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| CircuitError::InvalidState("no channel".into()))?;

        // Whether the send was entered, and whether it finished
        let mut started = false;
        let mut written = false;
        let res = {
            let (started, written) = (&mut started, &mut written);
            let exchange = async move {
                if let Some(bytes) = outbound {
                    *started = true;
                    channel.send(&bytes).await?;
                    *written = true;
                }
                recv_cell(channel, inbound, decoders).await
            };

            futures::select_biased! {
                _ = cancel.cancelled().fuse() => {
                    log::info!("Round trip cancelled");
                    Err(CircuitError::Cancelled)
                }
                _ = tokio::time::sleep(limit).fuse() => {
                    log::warn!("No reply within {:?}", limit);
                    Err(CircuitError::Timeout)
                }
                res = exchange.fuse() => res,
            }
        };
        if started && !written {
            self.torn_write = true;
        }
        res
    }

    /// Move to FAILED and release the channel; returns `err` for propagation
    async fn fail(&mut self, err: CircuitError) -> CircuitError {
        log::warn!("Circuit failed in state {}: {}", self.state, err);
        let reason = match &err {
            // Hop 1 already dropped the circuit
            CircuitError::CircuitDestroyed { .. } => None,
            CircuitError::Timeout => Some(DestroyPayload::TIMEOUT),
            CircuitError::Cancelled => Some(DestroyPayload::FINISHED),
            _ => Some(DestroyPayload::PROTOCOL),
        };
        match reason {
            Some(reason) => self.teardown(reason).await,
            None => self.close_channel().await,
        }
        self.state = CircuitState::Failed;
        self.failure = Some(err.clone());
        err
    }

    /// Best-effort DESTROY (if CREATE2 went out), then close
    async fn teardown(&mut self, reason: u8) {
        if self.torn_write {
            log::debug!("Skipping DESTROY behind a partly written cell");
        } else if self.create_sent && self.config.send_destroy_on_failure {
            if let (Some(id), Some(channel)) = (self.circuit_id, self.channel.as_mut()) {
                match Cell::destroy(id, reason).to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = channel.send(&bytes).await {
                            log::debug!("DESTROY not delivered: {}", e);
                        }
                    }
                    Err(e) => log::debug!("DESTROY not encoded: {}", e),
                }
            }
        }
        self.close_channel().await;
    }

    /// Close the channel; later calls find nothing to close
    async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                log::debug!("Channel close failed: {}", e);
            }
        }
        if let Some(id) = self.circuit_id {
            self.circ_ids.release(id);
        }
        self.inbound.clear();
        self.streams.clear();
    }
}

impl<T: Transport> fmt::Debug for Circuit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("circuit_id", &self.circuit_id)
            .field("state", &self.state)
            .field("hops", &self.keys.len())
            .field("path_len", &self.path.len())
            .finish_non_exhaustive()
    }
}

/// Read from `channel` until one whole cell is buffered
async fn recv_cell<C: Channel + ?Sized>(
    channel: &mut C,
    inbound: &mut Vec<u8>,
    decoders: &PayloadDecoders,
) -> Result<Cell> {
    loop {
        if let Some(len) = frame_len(inbound)? {
            if inbound.len() >= len {
                let frame: Vec<u8> = inbound.drain(..len).collect();
                let cell = Cell::from_bytes(&frame, decoders)?;
                log::trace!("Received {} on circuit 0x{:08x}", cell.command(), cell.circuit_id());
                return Ok(cell);
            }
        }

        let mut buf = [0u8; CELL_LEN];
        let n = channel.recv(&mut buf).await?;
        if n == 0 {
            return Err(CircuitError::Transport(if inbound.is_empty() {
                "connection closed by relay".into()
            } else {
                format!("connection closed mid-cell ({} bytes buffered)", inbound.len())
            }));
        }
        inbound.extend_from_slice(&buf[..n]);
    }
}
