//! Link specifiers
//!
//! An EXTEND2 message tells the current last hop how to reach the next one.
//! Each link specifier is `LSTYPE u8 | LSLEN u8 | LSPEC`, and a message may
//! carry several of them. They are written in the order relays expect:
//! IPv4 address, RSA identity, Ed25519 identity, IPv6 address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{CircuitError, Result};
use super::handshake::{build_handshake_request, EphemeralKey, HandshakeType};
use super::node::{Node, RsaIdentity};
use super::relay::Extend2Payload;

/// Link specifier type tags
pub mod lstype {
    pub const ORPORT_V4: u8 = 0;
    pub const ORPORT_V6: u8 = 1;
    pub const RSA_ID: u8 = 2;
    pub const ED25519_ID: u8 = 3;
}

/// One way of identifying or reaching a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    /// OR address: IPv4 (type 0) or IPv6 (type 1), plus port
    OrPort(IpAddr, u16),
    /// SHA-1 fingerprint of the RSA identity key
    LegacyId(RsaIdentity),
    /// Ed25519 identity key
    Ed25519Id([u8; 32]),
    /// A type we don't know; kept so it can be forwarded untouched
    Unrecognized(u8, Vec<u8>),
}

impl LinkSpecifier {
    /// Wire type tag
    pub fn lstype(&self) -> u8 {
        match self {
            LinkSpecifier::OrPort(IpAddr::V4(_), _) => lstype::ORPORT_V4,
            LinkSpecifier::OrPort(IpAddr::V6(_), _) => lstype::ORPORT_V6,
            LinkSpecifier::LegacyId(_) => lstype::RSA_ID,
            LinkSpecifier::Ed25519Id(_) => lstype::ED25519_ID,
            LinkSpecifier::Unrecognized(t, _) => *t,
        }
    }

    /// Position of this specifier in an EXTEND2 list
    fn sort_pos(&self) -> u8 {
        match self {
            LinkSpecifier::OrPort(IpAddr::V4(_), _) => 0,
            LinkSpecifier::LegacyId(_) => 1,
            LinkSpecifier::Ed25519Id(_) => 2,
            LinkSpecifier::OrPort(IpAddr::V6(_), _) => 3,
            LinkSpecifier::Unrecognized(t, _) => *t,
        }
    }

    /// Sort specifiers into the order they should appear in EXTEND2
    pub fn sort_by_type(list: &mut [Self]) {
        list.sort_by_key(LinkSpecifier::sort_pos);
    }

    /// Append `LSTYPE | LSLEN | LSPEC`
    pub fn encode_onto(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut body = Vec::with_capacity(32);
        match self {
            LinkSpecifier::OrPort(IpAddr::V4(v4), port) => {
                body.extend_from_slice(&v4.octets());
                body.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::OrPort(IpAddr::V6(v6), port) => {
                body.extend_from_slice(&v6.octets());
                body.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => body.extend_from_slice(id),
            LinkSpecifier::Ed25519Id(id) => body.extend_from_slice(id),
            LinkSpecifier::Unrecognized(_, raw) => body.extend_from_slice(raw),
        }
        let len = u8::try_from(body.len()).map_err(|_| {
            CircuitError::MalformedCell(format!("link specifier body of {} bytes", body.len()))
        })?;
        buf.push(self.lstype());
        buf.push(len);
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Decode one specifier from the front of `buf`; returns it and the bytes used
    pub fn take_from(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(CircuitError::MalformedCell("link specifier header truncated".into()));
        }
        let (ls_type, ls_len) = (buf[0], buf[1] as usize);
        let body = buf.get(2..2 + ls_len).ok_or_else(|| {
            CircuitError::MalformedCell(format!(
                "link specifier type {} claims {} bytes, {} present",
                ls_type,
                ls_len,
                buf.len() - 2
            ))
        })?;

        let need = |want: usize| -> Result<()> {
            if ls_len == want {
                Ok(())
            } else {
                Err(CircuitError::MalformedCell(format!(
                    "link specifier type {} must be {} bytes, got {}",
                    ls_type, want, ls_len
                )))
            }
        };

        let spec = match ls_type {
            lstype::ORPORT_V4 => {
                need(6)?;
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                LinkSpecifier::OrPort(IpAddr::V4(addr), u16::from_be_bytes([body[4], body[5]]))
            }
            lstype::ORPORT_V6 => {
                need(18)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                LinkSpecifier::OrPort(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            lstype::RSA_ID => {
                need(20)?;
                let mut id = [0u8; 20];
                id.copy_from_slice(body);
                LinkSpecifier::LegacyId(id)
            }
            lstype::ED25519_ID => {
                need(32)?;
                let mut id = [0u8; 32];
                id.copy_from_slice(body);
                LinkSpecifier::Ed25519Id(id)
            }
            other => LinkSpecifier::Unrecognized(other, body.to_vec()),
        };
        Ok((spec, 2 + ls_len))
    }
}

/// The specifiers a hop needs to reach `node`
///
/// Only an address the node actually listens on is emitted, so the host
/// has to be an IP literal; name resolution is the directory's job.
pub fn resolve_link_specifiers(node: &Node) -> Result<Vec<LinkSpecifier>> {
    let ip = node.ip_addr().ok_or_else(|| {
        CircuitError::InvalidNode(format!("{} is not an IP address", node.host))
    })?;
    if node.port == 0 {
        return Err(CircuitError::InvalidNode(format!("{} has no OR port", node)));
    }

    let mut specs = vec![
        LinkSpecifier::OrPort(ip, node.port),
        LinkSpecifier::LegacyId(node.identity),
    ];
    if let Some(ed) = node.ed25519_identity {
        specs.push(LinkSpecifier::Ed25519Id(ed));
    }
    LinkSpecifier::sort_by_type(&mut specs);

    log::debug!("Link specifiers for {}: {} specs", node, specs.len());
    Ok(specs)
}

/// First reachable address in a specifier list
pub fn first_or_port(specs: &[LinkSpecifier]) -> Option<SocketAddr> {
    specs.iter().find_map(|s| match s {
        LinkSpecifier::OrPort(ip, port) => Some(SocketAddr::new(*ip, *port)),
        _ => None,
    })
}

/// EXTEND2 contents for `target`, with a fresh handshake piggybacked
pub fn build_extend2(
    target: &Node,
    handshake_type: HandshakeType,
) -> Result<(EphemeralKey, Extend2Payload)> {
    let link_specifiers = resolve_link_specifiers(target)?;
    let (ephemeral, hdata) = build_handshake_request(handshake_type, target)?;
    let payload = Extend2Payload {
        link_specifiers,
        handshake_type,
        handshake_data: hdata.into_encoded(),
    };
    Ok((ephemeral, payload))
}
