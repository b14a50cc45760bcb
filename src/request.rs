use crate::address::AddrSpec;
use crate::auth::AuthContext;
use crate::error::SocksError;
use crate::protocol::{Command, Version};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Request is a parsed client command together with everything the server
/// learned about the connection before it arrived
#[derive(Debug, Clone)]
pub struct Request {
    pub version: u8,
    pub command: Command,
    /// destination as sent by the client; replaced by the address rewriter
    pub dest_addr: AddrSpec,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub auth_context: AuthContext,
}

impl Request {
    /// read_from parses a request from the stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, SocksError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // SOCKS5 request format
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        let version = header[0];
        if version != Version::SOCKS5 as u8 {
            return Err(SocksError::UnsupportedVersion(version));
        }

        let command =
            Command::from_byte(header[1]).ok_or(SocksError::UnrecognizedCommand(header[1]))?;

        // RSV is ignored
        let dest_addr = AddrSpec::read_from(reader).await?;

        Ok(Self {
            version,
            command,
            dest_addr,
            local_addr: None,
            remote_addr: None,
            auth_context: AuthContext::default(),
        })
    }
}
