//! An embeddable SOCKS5 protocol engine
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT, BIND and UDP ASSOCIATE
//!     - No Authentication
//!     - Username/Password Authentication, pluggable credential stores
//!     - Pluggable rules, address rewriting, name resolution and dialing
//!     - User supplied handlers per command
//!     - Dedicated outbound socket per UDP client-target pair, expired when idle
//!     - Pooled relay buffers and optional bounded task dispatch
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use sockrelay::{Socks5Server, StaticCredentials};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Socks5Server::builder()
//!         .with_credentials(StaticCredentials::new().with_user("alice", "s3cret"))
//!         .build();
//!     Arc::new(server).listen_and_serve("127.0.0.1:1080").await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod buffer;
pub mod commands;
pub mod dialer;
pub mod dispatch;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod relay;
pub mod request;
pub mod server;
pub mod stream;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::{AddrSpec, Host};
pub use auth::{AuthContext, Authenticator, CredentialStore, NoAuth, StaticCredentials, UserPass};
pub use error::SocksError;
pub use policy::{AddressRewriter, Context, NameResolver, PermitAll, PermitCommand, RuleSet};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use request::Request;
pub use server::{ServerBuilder, SessionState, Socks5Server};
