//! SOCKS5 wire format (RFC 1928), restricted to what the proxy speaks.
//!
//! Only the `NO AUTHENTICATION` method is ever negotiated and only
//! `CONNECT` is genuinely served; `UDP ASSOCIATE` gets a stub reply
//! and `BIND` is rejected. The request's destination is re-emitted
//! byte-for-byte as the tunnel address header `[ATYP][ADDR][PORT]`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use bytes::BufMut;

use crate::error::{Error, Result};

/// Protocol version byte.
pub const VERSION: u8 = 0x05;

/// Authentication method: no authentication required.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Command: establish a TCP connection.
pub const CMD_CONNECT: u8 = 0x01;
/// Command: bind a listening port (not supported).
pub const CMD_BIND: u8 = 0x02;
/// Command: UDP associate (stubbed).
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Address type: IPv4.
pub const ATYP_IPV4: u8 = 0x01;
/// Address type: domain name with a length prefix.
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// Reply code: succeeded.
pub const REP_SUCCEEDED: u8 = 0x00;
/// Reply code: command not supported.
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Method-selection reply: version 5, no authentication.
pub const METHOD_SELECT_REPLY: [u8; 2] = [VERSION, METHOD_NO_AUTH];

/// Abbreviated error reply for an unsupported command.
pub const CMD_NOT_SUPPORTED_REPLY: [u8; 4] = [VERSION, REP_CMD_NOT_SUPPORTED, 0x00, ATYP_IPV4];

/// A destination address as carried in a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// Domain name and port
    Domain(String, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
}

impl Address {
    /// Parse an address from a buffer starting at the ATYP byte.
    ///
    /// Returns the address and the number of bytes consumed
    /// (ATYP + ADDR + PORT).
    pub fn parse(buf: &[u8]) -> Result<(Address, usize)> {
        if buf.is_empty() {
            return Err(Error::protocol("truncated address"));
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(Error::protocol("truncated IPv4 address"));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Ipv4(ip, port), 7))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Err(Error::protocol("truncated domain address"));
                }
                let name_len = buf[1] as usize;
                if buf.len() < 2 + name_len + 2 {
                    return Err(Error::protocol("truncated domain address"));
                }
                let name = std::str::from_utf8(&buf[2..2 + name_len])
                    .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
                let port = u16::from_be_bytes([buf[2 + name_len], buf[2 + name_len + 1]]);
                Ok((Address::Domain(name.to_string(), port), 2 + name_len + 2))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(Error::protocol("truncated IPv6 address"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::Ipv6(Ipv6Addr::from(octets), port), 19))
            }
            other => Err(Error::protocol(format!(
                "unsupported address type: {other}"
            ))),
        }
    }

    /// Append the tunnel address header `[ATYP][ADDR][PORT]`.
    ///
    /// The bytes are exactly those received in the request; for a
    /// domain the length prefix is preserved.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ipv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Address::Domain(name, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(*port);
            }
            Address::Ipv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
        }
    }

    /// Serialized header length in bytes.
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 7,
            Address::Domain(name, _) => 2 + name.len() + 2,
            Address::Ipv6(..) => 19,
        }
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Domain(_, port) | Address::Ipv6(_, port) => *port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
            Address::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
        }
    }
}

/// A parsed SOCKS5 request.
#[derive(Debug, Clone)]
pub struct Request {
    /// The request command (`CMD_*`); unknown commands are kept so the
    /// caller can send the proper error reply.
    pub cmd: u8,
    /// The destination address.
    pub address: Address,
}

impl Request {
    /// Parse `VER CMD RSV ATYP DST.ADDR DST.PORT` from one buffer.
    ///
    /// Returns the request and the number of bytes consumed; anything
    /// after that is payload the client coalesced with the request.
    pub fn parse(buf: &[u8]) -> Result<(Request, usize)> {
        if buf.len() < 4 {
            return Err(Error::protocol("truncated request"));
        }
        if buf[0] != VERSION {
            return Err(Error::protocol(format!("unsupported version: {}", buf[0])));
        }
        let cmd = buf[1];
        let (address, addr_len) = Address::parse(&buf[3..])?;
        Ok((Request { cmd, address }, 3 + addr_len))
    }
}

/// Build the success reply `[VER REP RSV ATYP] [BND.ADDR] [BND.PORT]`.
///
/// `CONNECT` replies all-zero before the upstream leg is even dialed
/// (the fake reply); `UDP ASSOCIATE` reports the client socket's bound
/// local IPv4 address. Non-IPv4 bound addresses report as zero.
pub fn success_reply(bound: Option<SocketAddrV4>) -> [u8; 10] {
    let mut reply = [0u8; 10];
    reply[0] = VERSION;
    reply[1] = REP_SUCCEEDED;
    reply[3] = ATYP_IPV4;
    if let Some(addr) = bound {
        reply[4..8].copy_from_slice(&addr.ip().octets());
        reply[8..10].copy_from_slice(&addr.port().to_be_bytes());
    }
    reply
}

/// Narrow a socket address to IPv4 for reply reporting.
pub fn bound_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}
