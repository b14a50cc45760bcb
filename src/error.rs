use std::io;
use thiserror::Error;

/// SocksError covers failures that are defined by the SOCKS5 wire protocol
/// itself. Operational failures (dialing, binding, relaying) are carried as
/// `anyhow::Error` with context instead.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no supported authentication method")]
    NoSupportedAuth,

    #[error("unsupported username/password sub-negotiation version: {0:#04x}")]
    UnsupportedAuthVersion(u8),

    #[error("user authentication failed")]
    UserAuthFailed,

    #[error("unrecognized command: {0:#04x}")]
    UnrecognizedCommand(u8),

    #[error("unrecognized address type: {0:#04x}")]
    UnrecognizedAddrType(u8),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("{command} to {dest} blocked by rules")]
    RuleDenied { command: String, dest: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SocksError {
    /// true when the error should be answered with an
    /// address-type-not-supported reply
    pub fn is_unrecognized_addr_type(&self) -> bool {
        matches!(self, SocksError::UnrecognizedAddrType(_))
    }
}
