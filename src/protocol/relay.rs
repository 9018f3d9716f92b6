//! Relay cells and the circuit-extension messages they carry
//!
//! A relay cell is the plaintext inside a RELAY or RELAY_EARLY body once
//! every onion layer is removed:
//!
//! ```text
//!     u8  relay_command;
//!     u16 recognized;
//!     u16 stream_id;
//!     u8  digest[4];
//!     u16 length;
//!     u8  data[length];
//!     u8  padding[498 - length];
//! ```
//!
//! EXTEND2/EXTENDED2 travel as relay messages on stream 0; BEGIN, CONNECTED,
//! DATA and END carry the stream they belong to. Message data is decoded
//! through a [`RelayDecoders`] table, the same way channel cells are.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{CircuitError, Result};
use super::cell::{take_u16_prefixed, DecoderTable, CELL_PAYLOAD_LEN};
use super::handshake::HandshakeType;
use super::linkspec::LinkSpecifier;

/// Relay header: command (1) + recognized (2) + stream ID (2) + digest (4) + length (2)
pub const RELAY_HEADER_LEN: usize = 11;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayCommand::Begin => "RELAY_BEGIN",
            RelayCommand::Data => "RELAY_DATA",
            RelayCommand::End => "RELAY_END",
            RelayCommand::Connected => "RELAY_CONNECTED",
            RelayCommand::Sendme => "RELAY_SENDME",
            RelayCommand::Extend => "RELAY_EXTEND",
            RelayCommand::Extended => "RELAY_EXTENDED",
            RelayCommand::Truncate => "RELAY_TRUNCATE",
            RelayCommand::Truncated => "RELAY_TRUNCATED",
            RelayCommand::Drop => "RELAY_DROP",
            RelayCommand::Resolve => "RELAY_RESOLVE",
            RelayCommand::Resolved => "RELAY_RESOLVED",
            RelayCommand::BeginDir => "RELAY_BEGIN_DIR",
            RelayCommand::Extend2 => "RELAY_EXTEND2",
            RelayCommand::Extended2 => "RELAY_EXTENDED2",
        };
        f.write_str(name)
    }
}

/// Relay cell (plaintext of a RELAY or RELAY_EARLY body)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for a cell addressed to its reader)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level messages)
    pub stream_id: u16,

    /// Digest (4 bytes), stamped by the onion layer
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = CELL_PAYLOAD_LEN - RELAY_HEADER_LEN;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// A circuit-level cell carrying `msg`
    pub fn from_msg(msg: &RelayMsg) -> Result<Self> {
        Ok(Self::new(msg.command(), 0, msg.encode()?))
    }

    /// Serialize to a full 509-byte body, zero padded
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(CircuitError::MalformedCell(format!(
                "{} data of {} bytes exceeds {}",
                self.command,
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(CELL_PAYLOAD_LEN);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);

        // Pad to CELL_PAYLOAD_LEN
        buf.resize(CELL_PAYLOAD_LEN, 0);
        Ok(buf)
    }

    /// Parse a decrypted relay body
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        if body.len() < RELAY_HEADER_LEN {
            return Err(CircuitError::MalformedCell("Relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(body[0]).ok_or_else(|| {
            CircuitError::MalformedCell(format!("Unknown relay command: {}", body[0]))
        })?;

        let recognized = u16::from_be_bytes([body[1], body[2]]);
        let stream_id = u16::from_be_bytes([body[3], body[4]]);
        let digest = [body[5], body[6], body[7], body[8]];
        let length = u16::from_be_bytes([body[9], body[10]]) as usize;

        if length > Self::MAX_DATA_SIZE {
            return Err(CircuitError::MalformedCell(format!(
                "relay length {} exceeds {}",
                length,
                Self::MAX_DATA_SIZE
            )));
        }
        let data = body
            .get(RELAY_HEADER_LEN..RELAY_HEADER_LEN + length)
            .ok_or_else(|| CircuitError::MalformedCell("Relay cell data truncated".into()))?
            .to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data,
        })
    }

    /// Decode the data as a typed message
    pub fn msg(&self, decoders: &RelayDecoders) -> Result<RelayMsg> {
        match decoders.get(self.command) {
            Some(decode) => decode(&self.data),
            None => Ok(RelayMsg::Unparsed(self.command, self.data.clone())),
        }
    }
}

/// EXTEND2 data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2Payload {
    pub link_specifiers: Vec<LinkSpecifier>,
    pub handshake_type: HandshakeType,
    pub handshake_data: Vec<u8>,
}

/// EXTENDED2 data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extended2Payload {
    pub handshake_data: Vec<u8>,
}

/// BEGIN flag bits
pub mod begin_flags {
    pub const IPV6_OK: u32 = 1 << 0;
    pub const IPV4_NOT_OK: u32 = 1 << 1;
    pub const IPV6_PREFERRED: u32 = 1 << 2;
}

/// BEGIN data: `ADDRPORT` as a NUL-terminated string, then `FLAGS u32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginPayload {
    /// Hostname or IP literal
    pub address: String,
    pub port: u16,
    /// See [`begin_flags`]
    pub flags: u32,
}

impl BeginPayload {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// CONNECTED data: the address the exit reached and how long it may be cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPayload {
    /// None when the exit sent an empty CONNECTED
    pub address: Option<IpAddr>,
    pub ttl: u32,
}

/// Typed relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMsg {
    Begin(BeginPayload),
    Connected(ConnectedPayload),
    Data(Vec<u8>),
    /// Stream closed; carries the END reason
    End(u8),
    Extend2(Extend2Payload),
    Extended2(Extended2Payload),
    /// A hop tore the rest of the circuit down; carries the DESTROY reason
    Truncated(u8),
    /// Valid command without a decoder
    Unparsed(RelayCommand, Vec<u8>),
}

impl RelayMsg {
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayMsg::Begin(_) => RelayCommand::Begin,
            RelayMsg::Connected(_) => RelayCommand::Connected,
            RelayMsg::Data(_) => RelayCommand::Data,
            RelayMsg::End(_) => RelayCommand::End,
            RelayMsg::Extend2(_) => RelayCommand::Extend2,
            RelayMsg::Extended2(_) => RelayCommand::Extended2,
            RelayMsg::Truncated(_) => RelayCommand::Truncated,
            RelayMsg::Unparsed(cmd, _) => *cmd,
        }
    }

    /// Encode the message data (without the relay header)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            RelayMsg::Begin(p) => {
                if p.address.is_empty() || p.address.contains('\0') {
                    return Err(CircuitError::MalformedCell(format!(
                        "BEGIN address {:?}",
                        p.address
                    )));
                }
                let addrport = if p.address.contains(':') {
                    format!("[{}]:{}", p.address, p.port)
                } else {
                    format!("{}:{}", p.address, p.port)
                };
                buf.extend_from_slice(addrport.as_bytes());
                buf.push(0);
                buf.extend_from_slice(&p.flags.to_be_bytes());
            }
            RelayMsg::Connected(p) => match p.address {
                None => {}
                Some(IpAddr::V4(v4)) => {
                    buf.extend_from_slice(&v4.octets());
                    buf.extend_from_slice(&p.ttl.to_be_bytes());
                }
                Some(IpAddr::V6(v6)) => {
                    buf.extend_from_slice(&[0, 0, 0, 0, 6]);
                    buf.extend_from_slice(&v6.octets());
                    buf.extend_from_slice(&p.ttl.to_be_bytes());
                }
            },
            RelayMsg::Data(data) => buf.extend_from_slice(data),
            RelayMsg::End(reason) => buf.push(*reason),
            RelayMsg::Extend2(p) => {
                let nspec = u8::try_from(p.link_specifiers.len()).map_err(|_| {
                    CircuitError::MalformedCell("too many link specifiers".into())
                })?;
                buf.push(nspec);
                for spec in &p.link_specifiers {
                    spec.encode_onto(&mut buf)?;
                }
                buf.extend_from_slice(&p.handshake_type.as_u16().to_be_bytes());
                buf.extend_from_slice(&u16_len(p.handshake_data.len())?);
                buf.extend_from_slice(&p.handshake_data);
            }
            RelayMsg::Extended2(p) => {
                buf.extend_from_slice(&u16_len(p.handshake_data.len())?);
                buf.extend_from_slice(&p.handshake_data);
            }
            RelayMsg::Truncated(reason) => buf.push(*reason),
            RelayMsg::Unparsed(_, data) => buf.extend_from_slice(data),
        }
        Ok(buf)
    }
}

fn u16_len(len: usize) -> Result<[u8; 2]> {
    u16::try_from(len)
        .map(u16::to_be_bytes)
        .map_err(|_| CircuitError::MalformedCell(format!("HDATA of {} bytes too long", len)))
}

/// Decoder table for relay messages
pub type RelayDecoders = DecoderTable<RelayCommand, RelayMsg>;

impl DecoderTable<RelayCommand, RelayMsg> {
    /// Decoders for the circuit-extension and stream messages
    pub fn standard() -> Self {
        Self::empty()
            .with(RelayCommand::Begin, decode_begin)
            .with(RelayCommand::Connected, decode_connected)
            .with(RelayCommand::Data, decode_data)
            .with(RelayCommand::End, decode_end)
            .with(RelayCommand::Extend2, decode_extend2)
            .with(RelayCommand::Extended2, decode_extended2)
            .with(RelayCommand::Truncated, decode_truncated)
    }
}

/// Parse BEGIN data
pub fn decode_begin(data: &[u8]) -> Result<RelayMsg> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CircuitError::MalformedCell("BEGIN address not terminated".into()))?;
    let addrport = std::str::from_utf8(&data[..nul])
        .map_err(|_| CircuitError::MalformedCell("BEGIN address is not UTF-8".into()))?;
    let (host, port) = addrport
        .rsplit_once(':')
        .ok_or_else(|| CircuitError::MalformedCell(format!("BEGIN address {:?}", addrport)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CircuitError::MalformedCell(format!("BEGIN port {:?}", port)))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(CircuitError::MalformedCell("BEGIN address empty".into()));
    }

    // FLAGS may be omitted
    let flags = match data.get(nul + 1..nul + 5) {
        Some(f) => u32::from_be_bytes([f[0], f[1], f[2], f[3]]),
        None => 0,
    };
    Ok(RelayMsg::Begin(BeginPayload {
        address: host.to_string(),
        port,
        flags,
    }))
}

/// Parse CONNECTED data (empty, IPv4 form, or IPv6 form)
pub fn decode_connected(data: &[u8]) -> Result<RelayMsg> {
    let ttl_at = |at: usize| -> Result<u32> {
        data.get(at..at + 4)
            .map(|t| u32::from_be_bytes([t[0], t[1], t[2], t[3]]))
            .ok_or_else(|| CircuitError::MalformedCell("CONNECTED TTL missing".into()))
    };

    if data.is_empty() {
        return Ok(RelayMsg::Connected(ConnectedPayload {
            address: None,
            ttl: 0,
        }));
    }
    if data.len() < 4 {
        return Err(CircuitError::MalformedCell(format!(
            "CONNECTED of {} bytes",
            data.len()
        )));
    }
    let v4 = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let payload = if !v4.is_unspecified() {
        ConnectedPayload {
            address: Some(IpAddr::V4(v4)),
            ttl: ttl_at(4)?,
        }
    } else {
        if data.get(4) != Some(&6) || data.len() < 21 {
            return Err(CircuitError::MalformedCell("CONNECTED IPv6 form truncated".into()));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[5..21]);
        ConnectedPayload {
            address: Some(IpAddr::V6(Ipv6Addr::from(octets))),
            ttl: ttl_at(21)?,
        }
    };
    Ok(RelayMsg::Connected(payload))
}

pub fn decode_data(data: &[u8]) -> Result<RelayMsg> {
    Ok(RelayMsg::Data(data.to_vec()))
}

/// Parse END data; an empty END means MISC
pub fn decode_end(data: &[u8]) -> Result<RelayMsg> {
    Ok(RelayMsg::End(data.first().copied().unwrap_or(1)))
}

/// Parse EXTEND2 data
pub fn decode_extend2(data: &[u8]) -> Result<RelayMsg> {
    let nspec = *data
        .first()
        .ok_or_else(|| CircuitError::MalformedCell("EXTEND2 data empty".into()))?;

    let mut pos = 1;
    let mut link_specifiers = Vec::with_capacity(nspec as usize);
    for _ in 0..nspec {
        let (spec, used) = LinkSpecifier::take_from(&data[pos..])?;
        link_specifiers.push(spec);
        pos += used;
    }

    let rest = &data[pos..];
    if rest.len() < 2 {
        return Err(CircuitError::MalformedCell("EXTEND2 HTYPE missing".into()));
    }
    let htype = u16::from_be_bytes([rest[0], rest[1]]);
    let handshake_type = HandshakeType::from_u16(htype).ok_or_else(|| {
        CircuitError::MalformedCell(format!("unknown handshake type 0x{:04x}", htype))
    })?;
    let handshake_data = take_u16_prefixed(&rest[2..], "EXTEND2 HDATA")?.to_vec();

    Ok(RelayMsg::Extend2(Extend2Payload {
        link_specifiers,
        handshake_type,
        handshake_data,
    }))
}

/// Parse EXTENDED2 data
pub fn decode_extended2(data: &[u8]) -> Result<RelayMsg> {
    let handshake_data = take_u16_prefixed(data, "EXTENDED2 HDATA")?.to_vec();
    Ok(RelayMsg::Extended2(Extended2Payload { handshake_data }))
}

/// Parse TRUNCATED data
pub fn decode_truncated(data: &[u8]) -> Result<RelayMsg> {
    let reason = *data
        .first()
        .ok_or_else(|| CircuitError::MalformedCell("TRUNCATED data empty".into()))?;
    Ok(RelayMsg::Truncated(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: RelayMsg) {
        let cell = RelayCell::from_msg(&msg).unwrap();
        let bytes = cell.to_bytes().unwrap();
        assert_eq!(bytes.len(), CELL_PAYLOAD_LEN);

        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, cell);
        assert_eq!(parsed.msg(&RelayDecoders::standard()).unwrap(), msg);
    }

    fn extend2(specs: Vec<LinkSpecifier>) -> RelayMsg {
        RelayMsg::Extend2(Extend2Payload {
            link_specifiers: specs,
            handshake_type: HandshakeType::Ntor,
            handshake_data: (0..84).collect(),
        })
    }

    #[test]
    fn test_relay_cell_serialization() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let bytes = relay.to_bytes().unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[3..5], &100u16.to_be_bytes());
        assert_eq!(&bytes[9..11], &3u16.to_be_bytes());

        let parsed = RelayCell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command, RelayCommand::Begin);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.data, vec![5, 6, 7]);
    }

    #[test]
    fn test_extend2_with_zero_one_three_specifiers() {
        round_trip(extend2(vec![]));
        round_trip(extend2(vec![LinkSpecifier::OrPort("10.1.2.3".parse().unwrap(), 443)]));
        round_trip(extend2(vec![
            LinkSpecifier::OrPort("10.1.2.3".parse().unwrap(), 443),
            LinkSpecifier::LegacyId([0x42; 20]),
            LinkSpecifier::Ed25519Id([0x24; 32]),
        ]));
    }

    #[test]
    fn test_extended2_and_truncated() {
        round_trip(RelayMsg::Extended2(Extended2Payload {
            handshake_data: vec![3; 64],
        }));
        round_trip(RelayMsg::Truncated(6));
    }

    #[test]
    fn test_unparsed_relay_message() {
        let cell = RelayCell::new(RelayCommand::Sendme, 1, vec![0, 0, 0]);
        let msg = cell.msg(&RelayDecoders::standard()).unwrap();
        assert_eq!(msg, RelayMsg::Unparsed(RelayCommand::Sendme, vec![0, 0, 0]));

        let cell = RelayCell::new(RelayCommand::Data, 1, b"hello".to_vec());
        assert_eq!(
            cell.msg(&RelayDecoders::empty()).unwrap(),
            RelayMsg::Unparsed(RelayCommand::Data, b"hello".to_vec())
        );
    }

    #[test]
    fn test_begin_layout() {
        let msg = RelayMsg::Begin(
            BeginPayload::new("example.com", 80).with_flags(begin_flags::IPV6_OK),
        );
        let data = msg.encode().unwrap();
        assert_eq!(&data[..15], b"example.com:80\0");
        assert_eq!(&data[15..], &[0, 0, 0, 1]);
        round_trip(msg);

        // IPv6 literals are bracketed on the wire
        let v6 = RelayMsg::Begin(BeginPayload::new("2001:db8::1", 443));
        assert!(v6.encode().unwrap().starts_with(b"[2001:db8::1]:443\0"));
        assert_eq!(decode_begin(&v6.encode().unwrap()).unwrap(), v6);
    }

    #[test]
    fn test_begin_without_flags() {
        let msg = decode_begin(b"10.0.0.9:8080\0").unwrap();
        assert_eq!(msg, RelayMsg::Begin(BeginPayload::new("10.0.0.9", 8080)));
    }

    #[test]
    fn test_bad_begin() {
        assert!(decode_begin(b"example.com:80").is_err());
        assert!(decode_begin(b"example.com\0").is_err());
        assert!(decode_begin(b"example.com:99999\0").is_err());
        assert!(decode_begin(b":80\0").is_err());
        assert!(RelayMsg::Begin(BeginPayload::new("", 80)).encode().is_err());
    }

    #[test]
    fn test_connected_forms() {
        round_trip(RelayMsg::Connected(ConnectedPayload {
            address: Some("93.184.216.34".parse().unwrap()),
            ttl: 300,
        }));
        round_trip(RelayMsg::Connected(ConnectedPayload {
            address: Some("2001:db8::7".parse().unwrap()),
            ttl: 60,
        }));
        round_trip(RelayMsg::Connected(ConnectedPayload {
            address: None,
            ttl: 0,
        }));

        let v4 = RelayMsg::Connected(ConnectedPayload {
            address: Some("1.2.3.4".parse().unwrap()),
            ttl: 7,
        });
        assert_eq!(v4.encode().unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn test_bad_connected() {
        assert!(decode_connected(&[1, 2]).is_err());
        assert!(decode_connected(&[1, 2, 3, 4]).is_err());
        // Zero address without the IPv6 type byte
        assert!(decode_connected(&[0, 0, 0, 0, 4, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_data_and_end() {
        round_trip(RelayMsg::Data(b"GET / HTTP/1.0\r\n\r\n".to_vec()));
        round_trip(RelayMsg::End(6));
        assert_eq!(decode_end(&[]).unwrap(), RelayMsg::End(1));
    }

    #[test]
    fn test_oversized_data_rejected() {
        let cell = RelayCell::new(RelayCommand::Data, 1, vec![0; RelayCell::MAX_DATA_SIZE + 1]);
        assert!(cell.to_bytes().is_err());
    }

    #[test]
    fn test_bad_relay_bodies() {
        assert!(RelayCell::from_bytes(&[14, 0, 0]).is_err());

        // Unknown relay command
        let mut bytes = RelayCell::new(RelayCommand::Data, 0, vec![]).to_bytes().unwrap();
        bytes[0] = 0xF0;
        assert!(RelayCell::from_bytes(&bytes).is_err());

        // Length field beyond the cell
        let mut bytes = RelayCell::new(RelayCommand::Data, 0, vec![]).to_bytes().unwrap();
        bytes[9..11].copy_from_slice(&600u16.to_be_bytes());
        assert!(RelayCell::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_extended2_hlen_overrun() {
        let mut data = vec![0u8; 10];
        data[..2].copy_from_slice(&64u16.to_be_bytes());
        assert!(matches!(
            decode_extended2(&data),
            Err(CircuitError::MalformedCell(_))
        ));
    }

    #[test]
    fn test_extend2_truncated_specifier_list() {
        // Claims two specifiers, carries one
        let mut data = vec![2u8];
        LinkSpecifier::LegacyId([1; 20]).encode_onto(&mut data).unwrap();
        assert!(decode_extend2(&data).is_err());
    }
}
