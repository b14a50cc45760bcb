use crate::policy::Context;
use crate::stream::BoxStream;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Outbound is an established connection to a CONNECT destination
pub struct Outbound {
    pub stream: BoxStream,
    /// local end of the outbound connection, reported to the client
    pub local_addr: SocketAddr,
}

/// Dialer opens outbound TCP connections for CONNECT
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, ctx: &Context, addr: SocketAddr) -> io::Result<Outbound>;
}

/// TcpDialer connects with tokio's `TcpStream`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, _ctx: &Context, addr: SocketAddr) -> io::Result<Outbound> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        Ok(Outbound {
            stream: Box::new(stream),
            local_addr,
        })
    }
}
