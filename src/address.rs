use crate::error::SocksError;
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest domain name the one-byte length prefix can carry
pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// Host is the address part of a SOCKS5 destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

/// AddrSpec is a SOCKS5 destination: an IP address or domain name plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrSpec {
    pub host: Host,
    pub port: u16,
}

impl AddrSpec {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    /// domain builds a domain destination. Names longer than
    /// [`MAX_DOMAIN_LEN`] bytes can be dialed but not encoded.
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::DomainName(name.into()), port)
    }

    /// 0.0.0.0:0, used wherever no meaningful address exists
    pub fn unspecified() -> Self {
        Self::new(Host::IPv4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn address_type(&self) -> AddressType {
        match self.host {
            Host::IPv4(_) => AddressType::IPv4,
            Host::DomainName(_) => AddressType::DomainName,
            Host::IPv6(_) => AddressType::IPv6,
        }
    }

    /// socket_addr returns the address when the host is already an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::IPv4(ip) => Some(SocketAddr::new(IpAddr::V4(*ip), self.port)),
            Host::IPv6(ip) => Some(SocketAddr::new(IpAddr::V6(*ip), self.port)),
            Host::DomainName(_) => None,
        }
    }

    /// read_from parses `ATYP | ADDR | PORT` from a stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, SocksError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let atyp = reader.read_u8().await?;

        let host = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                Host::IPv4(Ipv4Addr::from(addr))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = reader.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                Host::DomainName(domain_from_bytes(domain)?)
            }
            Some(AddressType::IPv6) => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                Host::IPv6(Ipv6Addr::from(addr))
            }
            None => return Err(SocksError::UnrecognizedAddrType(atyp)),
        };

        // Port is big endian (network order)
        let port = reader.read_u16().await?;

        Ok(Self { host, port })
    }

    /// from_packet parses `ATYP | ADDR | PORT` from the start of a byte slice
    /// and returns the address together with the number of bytes consumed
    pub fn from_packet(data: &[u8]) -> Result<(Self, usize), SocksError> {
        let short = || SocksError::Io(std::io::ErrorKind::UnexpectedEof.into());

        let atyp = *data.first().ok_or_else(short)?;
        let mut offset = 1;

        let host = match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let bytes: [u8; 4] = data
                    .get(offset..offset + 4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(short)?;
                offset += 4;
                Host::IPv4(Ipv4Addr::from(bytes))
            }
            Some(AddressType::DomainName) => {
                let len = *data.get(offset).ok_or_else(short)? as usize;
                offset += 1;
                let domain = data.get(offset..offset + len).ok_or_else(short)?;
                offset += len;
                Host::DomainName(domain_from_bytes(domain.to_vec())?)
            }
            Some(AddressType::IPv6) => {
                let bytes: [u8; 16] = data
                    .get(offset..offset + 16)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(short)?;
                offset += 16;
                Host::IPv6(Ipv6Addr::from(bytes))
            }
            None => return Err(SocksError::UnrecognizedAddrType(atyp)),
        };

        let port = data.get(offset..offset + 2).ok_or_else(short)?;
        let port = u16::from_be_bytes([port[0], port[1]]);
        offset += 2;

        Ok((Self { host, port }, offset))
    }

    /// write_to appends `ATYP | ADDR | PORT` to the buffer. Domain names
    /// that do not fit the one-byte length prefix are refused and nothing is
    /// written.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), SocksError> {
        match &self.host {
            Host::IPv4(ip) => write_socket_addr(SocketAddr::new(IpAddr::V4(*ip), self.port), buf),
            Host::IPv6(ip) => write_socket_addr(SocketAddr::new(IpAddr::V6(*ip), self.port), buf),
            Host::DomainName(name) => {
                let len = u8::try_from(name.len()).map_err(|_| {
                    SocksError::InvalidDomain(format!(
                        "{} bytes long, at most {MAX_DOMAIN_LEN} allowed",
                        name.len()
                    ))
                })?;
                buf.push(AddressType::DomainName as u8);
                buf.push(len);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&self.port.to_be_bytes());
            }
        }
        Ok(())
    }
}

/// write_socket_addr appends an IP destination, which always fits the wire format
pub(crate) fn write_socket_addr(addr: SocketAddr, buf: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

impl From<SocketAddr> for AddrSpec {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::IPv4(ip),
            IpAddr::V6(ip) => Host::IPv6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::IPv4(ip) => write!(f, "{ip}:{}", self.port),
            Host::IPv6(ip) => write!(f, "[{ip}]:{}", self.port),
            Host::DomainName(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

fn domain_from_bytes(bytes: Vec<u8>) -> Result<String, SocksError> {
    if bytes.is_empty() {
        return Err(SocksError::InvalidDomain("empty domain".into()));
    }
    String::from_utf8(bytes).map_err(|e| SocksError::InvalidDomain(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(addr: AddrSpec) {
        let mut buf = Vec::new();
        addr.write_to(&mut buf).unwrap();

        let mut reader: &[u8] = &buf;
        let from_stream = AddrSpec::read_from(&mut reader).await.unwrap();
        assert_eq!(from_stream, addr);

        let (from_packet, used) = AddrSpec::from_packet(&buf).unwrap();
        assert_eq!(from_packet, addr);
        assert_eq!(used, buf.len());
    }

    #[tokio::test]
    async fn round_trip_every_address_type() {
        round_trip("192.168.1.7:8080".parse::<SocketAddr>().unwrap().into()).await;
        round_trip("[2001:db8::1]:443".parse::<SocketAddr>().unwrap().into()).await;
        round_trip(AddrSpec::domain("example.com", 80)).await;
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let mut reader: &[u8] = &[0x02, 1, 2, 3, 4, 0, 80];
        let err = AddrSpec::read_from(&mut reader).await.unwrap_err();
        assert!(err.is_unrecognized_addr_type());
    }

    #[test]
    fn packet_too_short() {
        assert!(AddrSpec::from_packet(&[0x01, 127, 0, 0]).is_err());
        assert!(AddrSpec::from_packet(&[0x03, 10, b'a']).is_err());
        assert!(AddrSpec::from_packet(&[]).is_err());
    }

    #[test]
    fn empty_domain_rejected() {
        let err = AddrSpec::from_packet(&[0x03, 0, 0, 80]).unwrap_err();
        assert!(matches!(err, SocksError::InvalidDomain(_)));
    }

    #[test]
    fn display_brackets_ipv6() {
        let addr: AddrSpec = "[::1]:53".parse::<SocketAddr>().unwrap().into();
        assert_eq!(addr.to_string(), "[::1]:53");
        assert_eq!(AddrSpec::domain("a.b", 1).to_string(), "a.b:1");
    }

    #[test]
    fn overlong_domain_is_not_encoded() {
        let mut buf = Vec::new();
        let err = AddrSpec::domain("a".repeat(MAX_DOMAIN_LEN + 1), 80)
            .write_to(&mut buf)
            .unwrap_err();
        assert!(matches!(err, SocksError::InvalidDomain(_)));
        assert!(buf.is_empty());

        AddrSpec::domain("a".repeat(MAX_DOMAIN_LEN), 80)
            .write_to(&mut buf)
            .unwrap();
        assert_eq!(buf[1], 255);
        assert_eq!(buf.len(), 1 + 1 + 255 + 2);
    }
}
