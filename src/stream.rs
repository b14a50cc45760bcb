use tokio::io::{AsyncRead, AsyncWrite};

/// ProxyStream is any ordered, bidirectional byte stream the engine can
/// drive: a TCP connection, a test duplex pipe, or a custom transport
/// returned by a dialer
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn ProxyStream>;
