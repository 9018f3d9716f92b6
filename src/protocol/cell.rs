//! Channel cell codec
//!
//! Implements the link-protocol-v4 cell format used between the client and
//! its first hop. Cells are the basic unit of communication on a channel.
//!
//! Fixed-length cells:
//! ```text
//!     u32 circ_id;
//!     u8  command;
//!     u8  body[509];
//! ```
//!
//! Variable-length cells (VERSIONS and every command >= 128):
//! ```text
//!     u32 circ_id;
//!     u8  command;
//!     u16 len;
//!     u8  body[len];
//! ```
//!
//! Payloads are typed. Which decoder runs for a command is decided by a
//! caller-supplied [`DecoderTable`], so new payload kinds are added by
//! inserting a table entry rather than by touching the codec.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::{CircuitError, Result};
use super::handshake::HandshakeType;

/// Cell header size: 4 bytes circuit ID + 1 byte command
pub const CELL_HEADER_LEN: usize = 5;

/// Payload size for fixed-length cells
pub const CELL_PAYLOAD_LEN: usize = 509;

/// Total fixed-length cell size
pub const CELL_LEN: usize = CELL_HEADER_LEN + CELL_PAYLOAD_LEN;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (deprecated)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (deprecated)
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can carry EXTEND2
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command carry a length field
    pub fn is_var_len(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }

    /// Whether this command only makes sense on a non-zero circuit ID
    pub fn is_circuit_bound(self) -> bool {
        matches!(
            self,
            CellCommand::Create
                | CellCommand::Created
                | CellCommand::Relay
                | CellCommand::Destroy
                | CellCommand::CreateFast
                | CellCommand::CreatedFast
                | CellCommand::RelayEarly
                | CellCommand::Create2
                | CellCommand::Created2
        )
    }
}

impl fmt::Display for CellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellCommand::Padding => "PADDING",
            CellCommand::Create => "CREATE",
            CellCommand::Created => "CREATED",
            CellCommand::Relay => "RELAY",
            CellCommand::Destroy => "DESTROY",
            CellCommand::CreateFast => "CREATE_FAST",
            CellCommand::CreatedFast => "CREATED_FAST",
            CellCommand::Versions => "VERSIONS",
            CellCommand::Netinfo => "NETINFO",
            CellCommand::RelayEarly => "RELAY_EARLY",
            CellCommand::Create2 => "CREATE2",
            CellCommand::Created2 => "CREATED2",
            CellCommand::PaddingNegotiate => "PADDING_NEGOTIATE",
            CellCommand::Vpadding => "VPADDING",
            CellCommand::Certs => "CERTS",
            CellCommand::AuthChallenge => "AUTH_CHALLENGE",
            CellCommand::Authenticate => "AUTHENTICATE",
            CellCommand::Authorize => "AUTHORIZE",
        };
        f.write_str(name)
    }
}

/// CREATE2 body: `HTYPE u16 | HLEN u16 | HDATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create2Payload {
    pub handshake_type: HandshakeType,
    pub handshake_data: Vec<u8>,
}

/// CREATED2 body: `HLEN u16 | HDATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created2Payload {
    pub handshake_data: Vec<u8>,
}

/// DESTROY body: a single reason byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyPayload {
    pub reason: u8,
}

impl DestroyPayload {
    /// No reason given
    pub const NONE: u8 = 0;
    /// Protocol violation
    pub const PROTOCOL: u8 = 1;
    /// Circuit closed on request
    pub const FINISHED: u8 = 9;
    /// Timed out
    pub const TIMEOUT: u8 = 10;
}

/// Command-specific cell payload
///
/// The variant is fixed by the cell command; see [`CellPayload::fits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellPayload {
    Create2(Create2Payload),
    Created2(Created2Payload),
    Destroy(DestroyPayload),
    /// Onion-encrypted relay body (always [`CELL_PAYLOAD_LEN`] bytes)
    Relay(Vec<u8>),
    /// Body of a valid command we hold no decoder for
    Unparsed(Vec<u8>),
}

impl CellPayload {
    /// Short name of the payload variant, for error messages
    pub fn name(&self) -> &'static str {
        match self {
            CellPayload::Create2(_) => "CREATE2",
            CellPayload::Created2(_) => "CREATED2",
            CellPayload::Destroy(_) => "DESTROY",
            CellPayload::Relay(_) => "RELAY",
            CellPayload::Unparsed(_) => "unparsed",
        }
    }

    /// Whether this payload variant may travel under `command`
    pub fn fits(&self, command: CellCommand) -> bool {
        match self {
            CellPayload::Create2(_) => command == CellCommand::Create2,
            CellPayload::Created2(_) => command == CellCommand::Created2,
            CellPayload::Destroy(_) => command == CellCommand::Destroy,
            CellPayload::Relay(_) => {
                matches!(command, CellCommand::Relay | CellCommand::RelayEarly)
            }
            CellPayload::Unparsed(_) => true,
        }
    }

    fn encode_onto(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            CellPayload::Create2(p) => {
                buf.extend_from_slice(&p.handshake_type.as_u16().to_be_bytes());
                buf.extend_from_slice(&encode_len(p.handshake_data.len())?);
                buf.extend_from_slice(&p.handshake_data);
            }
            CellPayload::Created2(p) => {
                buf.extend_from_slice(&encode_len(p.handshake_data.len())?);
                buf.extend_from_slice(&p.handshake_data);
            }
            CellPayload::Destroy(p) => buf.push(p.reason),
            CellPayload::Relay(body) | CellPayload::Unparsed(body) => {
                buf.extend_from_slice(body)
            }
        }
        Ok(())
    }
}

fn encode_len(len: usize) -> Result<[u8; 2]> {
    u16::try_from(len)
        .map(u16::to_be_bytes)
        .map_err(|_| CircuitError::MalformedCell(format!("field of {} bytes too long", len)))
}

/// Decoder function for one payload kind
pub type Decoder<P> = fn(&[u8]) -> Result<P>;

/// Mapping from a command tag to the decoder for its payload variant
pub struct DecoderTable<C, P> {
    table: HashMap<C, Decoder<P>>,
}

impl<C: Copy + Eq + Hash, P> DecoderTable<C, P> {
    /// A table with no decoders; every body stays unparsed
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Add (or replace) the decoder for `command`
    pub fn with(mut self, command: C, decoder: Decoder<P>) -> Self {
        self.table.insert(command, decoder);
        self
    }

    /// Look up the decoder for `command`
    pub fn get(&self, command: C) -> Option<Decoder<P>> {
        self.table.get(&command).copied()
    }
}

impl<C: Copy + Eq + Hash, P> Default for DecoderTable<C, P> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Decoder table for channel cells
pub type PayloadDecoders = DecoderTable<CellCommand, CellPayload>;

impl DecoderTable<CellCommand, CellPayload> {
    /// Decoders for every payload kind a circuit build can receive or send
    pub fn standard() -> Self {
        Self::empty()
            .with(CellCommand::Create2, decode_create2)
            .with(CellCommand::Created2, decode_created2)
            .with(CellCommand::Destroy, decode_destroy)
            .with(CellCommand::Relay, decode_relay)
            .with(CellCommand::RelayEarly, decode_relay)
    }
}

/// Read a `u16` length prefix and the bytes it announces
pub(crate) fn take_u16_prefixed<'a>(body: &'a [u8], what: &str) -> Result<&'a [u8]> {
    if body.len() < 2 {
        return Err(CircuitError::MalformedCell(format!("{} length missing", what)));
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    body.get(2..2 + len).ok_or_else(|| {
        CircuitError::MalformedCell(format!(
            "{} claims {} bytes, only {} present",
            what,
            len,
            body.len() - 2
        ))
    })
}

/// Parse a CREATE2 body
pub fn decode_create2(body: &[u8]) -> Result<CellPayload> {
    if body.len() < 4 {
        return Err(CircuitError::MalformedCell("CREATE2 body too short".into()));
    }
    let htype = u16::from_be_bytes([body[0], body[1]]);
    let handshake_type = HandshakeType::from_u16(htype).ok_or_else(|| {
        CircuitError::MalformedCell(format!("unknown handshake type 0x{:04x}", htype))
    })?;
    let handshake_data = take_u16_prefixed(&body[2..], "CREATE2 HDATA")?.to_vec();
    Ok(CellPayload::Create2(Create2Payload {
        handshake_type,
        handshake_data,
    }))
}

/// Parse a CREATED2 body
pub fn decode_created2(body: &[u8]) -> Result<CellPayload> {
    let handshake_data = take_u16_prefixed(body, "CREATED2 HDATA")?.to_vec();
    Ok(CellPayload::Created2(Created2Payload { handshake_data }))
}

/// Parse a DESTROY body
pub fn decode_destroy(body: &[u8]) -> Result<CellPayload> {
    let reason = *body
        .first()
        .ok_or_else(|| CircuitError::MalformedCell("DESTROY body empty".into()))?;
    Ok(CellPayload::Destroy(DestroyPayload { reason }))
}

/// Keep a RELAY/RELAY_EARLY body opaque; only the circuit can decrypt it
pub fn decode_relay(body: &[u8]) -> Result<CellPayload> {
    if body.len() != CELL_PAYLOAD_LEN {
        return Err(CircuitError::MalformedCell(format!(
            "relay body is {} bytes, expected {}",
            body.len(),
            CELL_PAYLOAD_LEN
        )));
    }
    Ok(CellPayload::Relay(body.to_vec()))
}

/// A single channel cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    circuit_id: u32,
    command: CellCommand,
    payload: CellPayload,
}

impl Cell {
    /// Create a new cell, rejecting a payload that cannot travel under `command`
    pub fn new(circuit_id: u32, command: CellCommand, payload: CellPayload) -> Result<Self> {
        if !payload.fits(command) {
            return Err(CircuitError::MalformedCell(format!(
                "{} payload cannot be sent as {}",
                payload.name(),
                command
            )));
        }
        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }

    /// Create a CREATE2 cell
    pub fn create2(
        circuit_id: u32,
        handshake_type: HandshakeType,
        handshake_data: Vec<u8>,
    ) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Create2,
            payload: CellPayload::Create2(Create2Payload {
                handshake_type,
                handshake_data,
            }),
        }
    }

    /// Create a CREATED2 cell
    pub fn created2(circuit_id: u32, handshake_data: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Created2,
            payload: CellPayload::Created2(Created2Payload { handshake_data }),
        }
    }

    /// Create a DESTROY cell
    pub fn destroy(circuit_id: u32, reason: u8) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Destroy,
            payload: CellPayload::Destroy(DestroyPayload { reason }),
        }
    }

    /// Create a RELAY cell around an already-encrypted body
    pub fn relay(circuit_id: u32, body: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Relay,
            payload: CellPayload::Relay(body),
        }
    }

    /// Create a RELAY_EARLY cell (circuit extensions MUST use RELAY_EARLY)
    pub fn relay_early(circuit_id: u32, body: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command: CellCommand::RelayEarly,
            payload: CellPayload::Relay(body),
        }
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn command(&self) -> CellCommand {
        self.command
    }

    pub fn payload(&self) -> &CellPayload {
        &self.payload
    }

    pub fn into_payload(self) -> CellPayload {
        self.payload
    }

    /// Serialize cell to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CELL_LEN);

        // Circuit ID (4 bytes, big-endian)
        buf.extend_from_slice(&self.circuit_id.to_be_bytes());

        // Command (1 byte)
        buf.push(self.command as u8);

        if self.command.is_var_len() {
            let mut body = Vec::new();
            self.payload.encode_onto(&mut body)?;
            buf.extend_from_slice(&encode_len(body.len())?);
            buf.extend_from_slice(&body);
        } else {
            self.payload.encode_onto(&mut buf)?;
            if buf.len() > CELL_LEN {
                return Err(CircuitError::MalformedCell(format!(
                    "{} payload of {} bytes does not fit a fixed cell",
                    self.command,
                    buf.len() - CELL_HEADER_LEN
                )));
            }
            // Pad to fixed size
            buf.resize(CELL_LEN, 0);
        }

        Ok(buf)
    }

    /// Parse exactly one cell from bytes
    ///
    /// A valid command without a decoder in `decoders` is not an error: its
    /// body comes back as [`CellPayload::Unparsed`] so the caller can decide
    /// what an unexpected-but-valid cell means.
    pub fn from_bytes(data: &[u8], decoders: &PayloadDecoders) -> Result<Self> {
        let frame = frame_len(data)?.ok_or_else(|| {
            CircuitError::MalformedCell(format!("cell truncated at {} bytes", data.len()))
        })?;
        if data.len() < frame {
            return Err(CircuitError::MalformedCell(format!(
                "cell truncated: {} of {} bytes",
                data.len(),
                frame
            )));
        }
        if data.len() > frame {
            return Err(CircuitError::MalformedCell(format!(
                "{} trailing bytes after cell",
                data.len() - frame
            )));
        }

        // Parse circuit ID (4 bytes, big-endian)
        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

        // frame_len already rejected unknown commands
        let command = CellCommand::from_u8(data[4])
            .ok_or_else(|| CircuitError::MalformedCell(format!("Unknown command: {}", data[4])))?;

        if command.is_circuit_bound() && circuit_id == 0 {
            return Err(CircuitError::MalformedCell(format!(
                "{} cell on circuit ID 0",
                command
            )));
        }

        let body = if command.is_var_len() {
            &data[CELL_HEADER_LEN + 2..]
        } else {
            &data[CELL_HEADER_LEN..]
        };

        let payload = match decoders.get(command) {
            Some(decode) => decode(body)?,
            None => CellPayload::Unparsed(body.to_vec()),
        };

        Self::new(circuit_id, command, payload)
    }
}

/// Length of the cell at the front of `buf`
///
/// Returns `Ok(None)` while the header is still incomplete and an error when
/// the command byte is not a known command.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < CELL_HEADER_LEN {
        return Ok(None);
    }
    let command = CellCommand::from_u8(buf[4])
        .ok_or_else(|| CircuitError::MalformedCell(format!("Unknown command: {}", buf[4])))?;
    if !command.is_var_len() {
        return Ok(Some(CELL_LEN));
    }
    if buf.len() < CELL_HEADER_LEN + 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
    Ok(Some(CELL_HEADER_LEN + 2 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoders() -> PayloadDecoders {
        PayloadDecoders::standard()
    }

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::create2(12345, HandshakeType::Ntor, vec![1, 2, 3, 4]);
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), CELL_LEN);
        assert_eq!(&bytes[..4], &12345u32.to_be_bytes());
        assert_eq!(bytes[4], CellCommand::Create2 as u8);
        // HTYPE, HLEN
        assert_eq!(&bytes[5..9], &[0x00, 0x02, 0x00, 0x04]);

        let parsed = Cell::from_bytes(&bytes, &decoders()).unwrap();
        assert_eq!(parsed, cell);
    }

    #[test]
    fn test_round_trip_each_payload() {
        let cells = vec![
            Cell::create2(0x8000_0001, HandshakeType::Tap, vec![7; 64]),
            Cell::created2(0x8000_0001, vec![9; 52]),
            Cell::destroy(0x8000_0001, DestroyPayload::PROTOCOL),
            Cell::relay(0x8000_0001, vec![0xAA; CELL_PAYLOAD_LEN]),
            Cell::relay_early(0x8000_0001, vec![0xBB; CELL_PAYLOAD_LEN]),
        ];
        for cell in cells {
            let bytes = cell.to_bytes().unwrap();
            assert_eq!(Cell::from_bytes(&bytes, &decoders()).unwrap(), cell);
        }
    }

    #[test]
    fn test_variable_length_cell() {
        let payload = CellPayload::Unparsed(vec![1, 2, 3]);
        let cell = Cell::new(0, CellCommand::Vpadding, payload).unwrap();
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), CELL_HEADER_LEN + 2 + 3);
        assert_eq!(frame_len(&bytes).unwrap(), Some(bytes.len()));
        assert_eq!(Cell::from_bytes(&bytes, &decoders()).unwrap(), cell);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = Cell::destroy(5, 0).to_bytes().unwrap();
        bytes[4] = 200;
        assert!(matches!(
            Cell::from_bytes(&bytes, &decoders()),
            Err(CircuitError::MalformedCell(_))
        ));
        assert!(frame_len(&bytes).is_err());
    }

    #[test]
    fn test_unexpected_valid_command_is_not_an_error() {
        // DESTROY without a decoder still parses
        let bytes = Cell::destroy(5, 3).to_bytes().unwrap();
        let parsed = Cell::from_bytes(&bytes, &PayloadDecoders::empty()).unwrap();
        assert_eq!(parsed.command(), CellCommand::Destroy);
        assert!(matches!(parsed.payload(), CellPayload::Unparsed(_)));
    }

    #[test]
    fn test_truncated_cell_rejected() {
        let bytes = Cell::created2(77, vec![1; 64]).to_bytes().unwrap();
        for cut in [0, 3, 5, 100, CELL_LEN - 1] {
            assert!(matches!(
                Cell::from_bytes(&bytes[..cut], &decoders()),
                Err(CircuitError::MalformedCell(_))
            ));
        }
    }

    #[test]
    fn test_created2_hlen_overrun_rejected() {
        let mut bytes = Cell::created2(77, vec![1; 64]).to_bytes().unwrap();
        // HLEN = 600 cannot fit in 507 remaining bytes
        bytes[5..7].copy_from_slice(&600u16.to_be_bytes());
        assert!(matches!(
            Cell::from_bytes(&bytes, &decoders()),
            Err(CircuitError::MalformedCell(_))
        ));
    }

    #[test]
    fn test_zero_circuit_id_rejected_for_circuit_commands() {
        let bytes = Cell::created2(0, vec![1; 4]).to_bytes().unwrap();
        assert!(Cell::from_bytes(&bytes, &decoders()).is_err());
    }

    #[test]
    fn test_payload_must_fit_command() {
        let res = Cell::new(
            1,
            CellCommand::Created2,
            CellPayload::Destroy(DestroyPayload { reason: 0 }),
        );
        let err = res.unwrap_err().to_string();
        assert!(err.contains("DESTROY payload cannot be sent as"), "{}", err);
    }

    #[test]
    fn test_oversized_fixed_payload_rejected() {
        let cell = Cell::create2(1, HandshakeType::Ntor, vec![0; CELL_PAYLOAD_LEN]);
        assert!(cell.to_bytes().is_err());
    }

    #[test]
    fn test_frame_len_incomplete_header() {
        assert_eq!(frame_len(&[0, 0, 0]).unwrap(), None);
        assert_eq!(frame_len(&[0, 0, 0, 1, 129]).unwrap(), None);
        assert_eq!(frame_len(&[0, 0, 0, 1, 4]).unwrap(), Some(CELL_LEN));
    }
}
