//! In-process relay network for circuit tests
//!
//! Each channel from [`SimNetwork`] plays hop 1 of a circuit and, behind
//! it, every hop that hop 1 extends to. Relays run the real responder side
//! of the handshakes and the real relay-side onion layers, so a circuit
//! built against them is byte-for-byte the protocol a client would speak to
//! real relays. Faults can be injected at a given hop.
//!
//! Any hop answers BEGIN: port 25 is refused with END(EXITPOLICY), anything
//! else gets CONNECTED. DATA is echoed back; DATA saying "bye" is echoed and
//! followed by END(DONE).

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use onion_circuit::protocol::{
    first_or_port, frame_len, server_handshake, Cell, CellPayload, ConnectedPayload,
    Create2Payload, Direction, Extended2Payload, HopCrypto, Node, OnionKeyPair, PayloadDecoders,
    RelayCell, RelayDecoders, RelayMsg, CELL_LEN,
};
use onion_circuit::{Channel, CircuitError, Result, Transport};

/// DESTROY / TRUNCATED reason for an unreachable next hop
pub const CONNECTFAILED: u8 = 6;

/// END reasons the exit uses
pub const EXITPOLICY: u8 = 4;
pub const DONE: u8 = 6;

/// Address every CONNECTED for a hostname reports
pub const EXIT_ADDR: [u8; 4] = [93, 184, 216, 34];

/// What a relay does wrong, and at which hop (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Every connect fails
    RefuseConnect,
    /// Every connect hangs
    StallConnect,
    /// The reply for this hop comes back on another circuit ID
    WrongCircuitId(usize),
    /// EXTENDED2 for the first hop is sent from the second (1-based) hop
    MisroutedReply(usize, usize),
    /// The handshake proof at this hop has one bit flipped
    BadProof(usize),
    /// CREATED2 with HDATA cut short
    ShortCreated2,
    /// Hop 1 sends DESTROY instead of answering for this hop
    Destroy(usize, u8),
    /// The hop before this one answers with RELAY_TRUNCATED
    Truncated(usize, u8),
    /// No answer at all for this hop
    Stall(usize),
    /// Hop 1 closes the connection instead of answering for this hop
    HangUp(usize),
}

/// What the relays saw
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub connects: usize,
    pub closes: usize,
    pub creates: usize,
    pub extends: usize,
    /// Reasons of DESTROY cells received from the client
    pub destroys: Vec<u8>,
    pub begins: usize,
    /// Streams the client ended
    pub ends: Vec<u16>,
}

/// A set of relays reachable by address
pub struct SimNetwork {
    relays: Arc<HashMap<SocketAddr, Arc<OnionKeyPair>>>,
    nodes: Vec<Arc<Node>>,
    fault: Fault,
    chunk: usize,
    stats: Arc<Mutex<Stats>>,
}

impl SimNetwork {
    /// `n` relays at 10.0.0.1..=n, port 9001
    pub fn new(n: usize) -> Self {
        let mut relays = HashMap::new();
        let mut nodes = Vec::new();
        for i in 0..n {
            let keys = OnionKeyPair::generate([i as u8 + 1; 20]);
            let node = keys.node(format!("10.0.0.{}", i + 1), 9001);
            let addr: SocketAddr = format!("{}:{}", node.host, node.port)
                .parse()
                .expect("valid address");
            relays.insert(addr, Arc::new(keys));
            nodes.push(Arc::new(node));
        }
        Self {
            relays: Arc::new(relays),
            nodes,
            fault: Fault::None,
            chunk: CELL_LEN,
            stats: Arc::new(Mutex::new(Stats::default())),
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// Deliver replies at most `chunk` bytes per read
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Nodes in path order
    pub fn path(&self) -> Vec<Arc<Node>> {
        self.nodes.clone()
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().expect("stats lock").clone()
    }

    /// Keys of the relay at `addr`
    pub fn relay(&self, addr: SocketAddr) -> Option<Arc<OnionKeyPair>> {
        self.relays.get(&addr).cloned()
    }

    fn engine(&self, entry: Arc<OnionKeyPair>) -> RelayEngine {
        RelayEngine {
            entry,
            relays: Arc::clone(&self.relays),
            fault: self.fault,
            stats: Arc::clone(&self.stats),
            hops: Vec::new(),
            inbound: Vec::new(),
            outbox: VecDeque::new(),
            hung_up: false,
        }
    }

    /// Accept one TCP connection on `listener` and act as `entry` for it
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener, entry: Arc<OnionKeyPair>) {
        let (mut sock, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        self.stats.lock().expect("stats lock").connects += 1;
        let mut engine = self.engine(entry);
        let mut buf = [0u8; 2048];
        loop {
            let n = match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if engine.feed(&buf[..n]).is_err() {
                break;
            }
            let out: Vec<u8> = engine.outbox.drain(..).collect();
            if !out.is_empty() && sock.write_all(&out).await.is_err() {
                break;
            }
            if engine.hung_up {
                break;
            }
        }
        self.stats.lock().expect("stats lock").closes += 1;
    }
}

#[async_trait]
impl Transport for SimNetwork {
    type Channel = SimChannel;

    async fn connect(&self, host: &str, port: u16) -> Result<SimChannel> {
        self.stats.lock().expect("stats lock").connects += 1;
        match self.fault {
            Fault::RefuseConnect => {
                return Err(CircuitError::Transport("connection refused".into()));
            }
            Fault::StallConnect => futures::future::pending::<()>().await,
            _ => {}
        }
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| CircuitError::Transport(format!("cannot resolve {}", host)))?;
        let entry = self
            .relay(addr)
            .ok_or_else(|| CircuitError::Transport(format!("no relay at {}", addr)))?;
        Ok(SimChannel {
            engine: self.engine(entry),
            chunk: self.chunk,
            closed: false,
        })
    }
}

/// Client end of a connection to a simulated hop 1
pub struct SimChannel {
    engine: RelayEngine,
    chunk: usize,
    closed: bool,
}

#[async_trait]
impl Channel for SimChannel {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(CircuitError::Transport("send on closed channel".into()));
        }
        if self.engine.feed(bytes).is_err() {
            self.engine.hung_up = true;
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(CircuitError::Transport("recv on closed channel".into()));
        }
        let n = self.engine.outbox.len().min(buf.len()).min(self.chunk);
        if n > 0 {
            for (slot, byte) in buf.iter_mut().zip(self.engine.outbox.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if self.engine.hung_up {
            return Ok(0);
        }
        futures::future::pending().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.engine.stats.lock().expect("stats lock").closes += 1;
        Ok(())
    }
}

/// Relay-side processing for one connection
struct RelayEngine {
    entry: Arc<OnionKeyPair>,
    relays: Arc<HashMap<SocketAddr, Arc<OnionKeyPair>>>,
    fault: Fault,
    stats: Arc<Mutex<Stats>>,
    /// Relay-side layer of each established hop
    hops: Vec<HopCrypto>,
    inbound: Vec<u8>,
    outbox: VecDeque<u8>,
    hung_up: bool,
}

impl RelayEngine {
    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.inbound.extend_from_slice(bytes);
        let decoders = PayloadDecoders::standard();
        while let Some(len) = frame_len(&self.inbound)? {
            if self.inbound.len() < len {
                break;
            }
            let frame: Vec<u8> = self.inbound.drain(..len).collect();
            let cell = Cell::from_bytes(&frame, &decoders)?;
            self.handle(cell)?;
        }
        Ok(())
    }

    fn queue(&mut self, cell: Cell) -> Result<()> {
        self.outbox.extend(cell.to_bytes()?);
        Ok(())
    }

    fn handle(&mut self, cell: Cell) -> Result<()> {
        let id = cell.circuit_id();
        match cell.into_payload() {
            CellPayload::Create2(create) => {
                self.stats.lock().expect("stats lock").creates += 1;
                self.on_create2(id, create)
            }
            CellPayload::Relay(body) => self.on_relay(id, body),
            CellPayload::Destroy(d) => {
                self.stats.lock().expect("stats lock").destroys.push(d.reason);
                self.hops.clear();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Common faults for hop `hop`; true if the hop should not answer normally
    fn intercept(&mut self, id: u32, hop: usize) -> Result<bool> {
        match self.fault {
            Fault::Stall(h) if h == hop => Ok(true),
            Fault::HangUp(h) if h == hop => {
                self.hung_up = true;
                Ok(true)
            }
            Fault::Destroy(h, reason) if h == hop => {
                self.queue(Cell::destroy(id, reason))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn on_create2(&mut self, id: u32, create: Create2Payload) -> Result<()> {
        if self.intercept(id, 1)? {
            return Ok(());
        }
        let (reply, keys) =
            server_handshake(create.handshake_type, &self.entry, &create.handshake_data)?;
        self.hops.push(HopCrypto::new(&keys));

        let mut hdata = reply.encode();
        match self.fault {
            Fault::BadProof(1) => {
                let last = hdata.len() - 1;
                hdata[last] ^= 0x80;
            }
            Fault::ShortCreated2 => hdata.truncate(10),
            _ => {}
        }
        let reply_id = if self.fault == Fault::WrongCircuitId(1) {
            id ^ 1
        } else {
            id
        };
        self.queue(Cell::created2(reply_id, hdata))
    }

    fn on_relay(&mut self, id: u32, mut body: Vec<u8>) -> Result<()> {
        for j in 0..self.hops.len() {
            self.hops[j].apply(Direction::Forward, &mut body);
            if self.hops[j].recognize(Direction::Forward, &body) {
                return self.deliver(id, j, &body);
            }
        }
        // Nobody recognized it; a real relay would tear the circuit down
        Err(CircuitError::MalformedCell("unrecognized relay cell".into()))
    }

    /// Hop `j` (0-based) recognized `body`
    fn deliver(&mut self, id: u32, j: usize, body: &[u8]) -> Result<()> {
        let cell = RelayCell::from_bytes(body)?;
        match cell.msg(&RelayDecoders::standard())? {
            RelayMsg::Extend2(extend) => {
                self.stats.lock().expect("stats lock").extends += 1;
                let new_hop = j + 2;
                if self.intercept(id, new_hop)? {
                    return Ok(());
                }
                if let Fault::Truncated(h, reason) = self.fault {
                    if h == new_hop {
                        return self.reply_from(id, j, &RelayMsg::Truncated(reason));
                    }
                }

                let target = first_or_port(&extend.link_specifiers)
                    .and_then(|addr| self.relays.get(&addr).cloned());
                let Some(target) = target else {
                    return self.reply_from(id, j, &RelayMsg::Truncated(CONNECTFAILED));
                };

                let (reply, keys) =
                    server_handshake(extend.handshake_type, &target, &extend.handshake_data)?;
                self.hops.push(HopCrypto::new(&keys));

                let mut hdata = reply.encode();
                if self.fault == Fault::BadProof(new_hop) {
                    let last = hdata.len() - 1;
                    hdata[last] ^= 0x80;
                }
                let reply_id = if self.fault == Fault::WrongCircuitId(new_hop) {
                    id ^ 1
                } else {
                    id
                };
                let from = match self.fault {
                    Fault::MisroutedReply(h, from) if h == new_hop => from - 1,
                    _ => j,
                };
                self.reply_from(
                    reply_id,
                    from,
                    &RelayMsg::Extended2(Extended2Payload {
                        handshake_data: hdata,
                    }),
                )
            }
            RelayMsg::Begin(begin) => {
                self.stats.lock().expect("stats lock").begins += 1;
                let reply = if begin.port == 25 {
                    RelayMsg::End(EXITPOLICY)
                } else {
                    let address = begin
                        .address
                        .parse()
                        .unwrap_or_else(|_| EXIT_ADDR.into());
                    RelayMsg::Connected(ConnectedPayload {
                        address: Some(address),
                        ttl: 300,
                    })
                };
                self.reply_on(id, j, cell.stream_id, &reply)
            }
            RelayMsg::End(_) => {
                self.stats.lock().expect("stats lock").ends.push(cell.stream_id);
                Ok(())
            }
            msg => {
                // Echo anything else back from the same hop
                let mut echo = cell.clone();
                echo.digest = [0; 4];
                let mut body = echo.to_bytes()?;
                self.send_backward(id, j, &mut body)?;
                if msg == RelayMsg::Data(b"bye".to_vec()) {
                    self.reply_on(id, j, cell.stream_id, &RelayMsg::End(DONE))?;
                }
                Ok(())
            }
        }
    }

    fn reply_from(&mut self, id: u32, j: usize, msg: &RelayMsg) -> Result<()> {
        self.reply_on(id, j, 0, msg)
    }

    fn reply_on(&mut self, id: u32, j: usize, stream_id: u16, msg: &RelayMsg) -> Result<()> {
        let cell = RelayCell::new(msg.command(), stream_id, msg.encode()?);
        let mut body = cell.to_bytes()?;
        self.send_backward(id, j, &mut body)
    }

    /// Seal at hop `j`, then add backward layers j..=0
    fn send_backward(&mut self, id: u32, j: usize, body: &mut [u8]) -> Result<()> {
        self.hops[j].seal(Direction::Backward, body)?;
        for k in (0..=j).rev() {
            self.hops[k].apply(Direction::Backward, body);
        }
        self.queue(Cell::relay(id, body.to_vec()))
    }
}
