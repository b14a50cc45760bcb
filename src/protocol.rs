use crate::address::AddrSpec;
use crate::error::SocksError;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Largest datagram the UDP relay will read in one call
pub const MAX_DGRAM: usize = 65_535;

/// Version of the username/password sub-negotiation (RFC 1929)
pub const USERPASS_VERSION: u8 = 0x01;

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Version represents available SOCKS proxy versions.
/// Only SOCKS5 is spoken by this crate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents the SOCKS5 authentication method codes
/// the crate knows by name. Custom authenticators may use any other code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// AuthStatus is the status byte of the username/password sub-negotiation reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Bind => write!(f, "BIND"),
            Command::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

/// MethodRequest is the client greeting that opens every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// read_from parses the greeting. The version byte is returned as sent;
    /// validating it is left to the caller.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, SocksError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // ClientHello format
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;

        let mut methods = vec![0u8; buf[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(Self {
            version: buf[0],
            methods,
        })
    }
}

/// Reply is the server response to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub version: u8,
    pub code: ReplyCode,
    pub bound: AddrSpec,
}

impl Reply {
    /// new builds a reply; a missing bound address is encoded as 0.0.0.0:0
    pub fn new(version: u8, code: ReplyCode, bound: Option<SocketAddr>) -> Self {
        let bound = bound.map(AddrSpec::from).unwrap_or_else(AddrSpec::unspecified);
        Self {
            version,
            code,
            bound,
        }
    }

    /// to_bytes encodes the reply; only a bound domain name can fail to fit
    pub fn to_bytes(&self) -> Result<Vec<u8>, SocksError> {
        // SOCKS5 reply format
        // +----+-----+-------+------+----------+----------+
        // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut reply = vec![self.version, self.code as u8, RSV];
        self.bound.write_to(&mut reply)?;
        Ok(reply)
    }
}

/// send_reply writes a single reply to the client
pub async fn send_reply<W>(
    writer: &mut W,
    version: u8,
    code: ReplyCode,
    bound: Option<SocketAddr>,
) -> Result<(), SocksError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let reply = Reply::new(version, code, bound);
    writer.write_all(&reply.to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}
