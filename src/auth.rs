use crate::error::SocksError;
use crate::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use crate::stream::ProxyStream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// AuthContext records which method authenticated a connection and
/// whatever identity that method established
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub method: u8,
    /// scheme specific identity, e.g. `username` for username/password
    pub payload: HashMap<String, String>,
}

impl AuthContext {
    pub fn new(method: u8) -> Self {
        Self {
            method,
            payload: HashMap::new(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.payload.get("username").map(String::as_str)
    }
}

/// Authenticator is one negotiable authentication scheme.
///
/// `authenticate` is called once the server has chosen this scheme. It owns
/// every byte exchanged from the method-selection reply up to the end of the
/// scheme's sub-negotiation.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn code(&self) -> u8;

    async fn authenticate(
        &self,
        stream: &mut dyn ProxyStream,
        user_addr: &str,
    ) -> Result<AuthContext, SocksError>;
}

/// CredentialStore validates username/password pairs
pub trait CredentialStore: Send + Sync {
    fn valid(&self, username: &str, password: &str, user_addr: &str) -> bool;
}

/// StaticCredentials is an in-memory username -> password map
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(HashMap<String, String>);

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.0.insert(username.into(), password.into());
        self
    }
}

impl<U, P> FromIterator<(U, P)> for StaticCredentials
where
    U: Into<String>,
    P: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (U, P)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        )
    }
}

impl CredentialStore for StaticCredentials {
    fn valid(&self, username: &str, password: &str, _user_addr: &str) -> bool {
        self.0.get(username).is_some_and(|p| p == password)
    }
}

/// NoAuth accepts every client without a sub-negotiation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    fn code(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn ProxyStream,
        _user_addr: &str,
    ) -> Result<AuthContext, SocksError> {
        stream
            .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
            .await?;
        stream.flush().await?;
        Ok(AuthContext::new(self.code()))
    }
}

/// UserPass implements username/password authentication (RFC 1929)
/// against a credential store
#[derive(Clone)]
pub struct UserPass {
    credentials: Arc<dyn CredentialStore>,
}

impl UserPass {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for UserPass {
    fn code(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(
        &self,
        stream: &mut dyn ProxyStream,
        user_addr: &str,
    ) -> Result<AuthContext, SocksError> {
        stream
            .write_all(&[Version::SOCKS5 as u8, AuthMethod::UserPass as u8])
            .await?;
        stream.flush().await?;

        // Client Username/Password Request
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;

        if header[0] != USERPASS_VERSION {
            write_status(stream, AuthStatus::Failure).await?;
            return Err(SocksError::UnsupportedAuthVersion(header[0]));
        }

        let mut username = vec![0u8; header[1] as usize];
        stream.read_exact(&mut username).await?;

        let password_len = stream.read_u8().await?;
        let mut password = vec![0u8; password_len as usize];
        stream.read_exact(&mut password).await?;

        let username = String::from_utf8_lossy(&username).into_owned();
        let password = String::from_utf8_lossy(&password);

        if !self.credentials.valid(&username, &password, user_addr) {
            warn!("authentication failed for user {username:?} from {user_addr}");
            write_status(stream, AuthStatus::Failure).await?;
            return Err(SocksError::UserAuthFailed);
        }

        write_status(stream, AuthStatus::Success).await?;
        debug!("user {username:?} authenticated from {user_addr}");

        let mut ctx = AuthContext::new(self.code());
        ctx.payload.insert("username".into(), username);
        Ok(ctx)
    }
}

async fn write_status(stream: &mut dyn ProxyStream, status: AuthStatus) -> Result<(), SocksError> {
    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;
    stream.flush().await?;
    Ok(())
}

/// select_authenticator returns the first method offered by the client that
/// the server has registered. Client order wins over server preference.
pub fn select_authenticator<'a>(
    registry: &'a HashMap<u8, Arc<dyn Authenticator>>,
    offered: &[u8],
) -> Option<&'a Arc<dyn Authenticator>> {
    offered.iter().find_map(|code| registry.get(code))
}

/// negotiate picks an authenticator for the offered methods and runs it.
/// When nothing matches, `05 FF` is written and `NoSupportedAuth` returned.
pub async fn negotiate(
    registry: &HashMap<u8, Arc<dyn Authenticator>>,
    stream: &mut dyn ProxyStream,
    user_addr: &str,
    offered: &[u8],
) -> Result<AuthContext, SocksError> {
    match select_authenticator(registry, offered) {
        Some(authenticator) => authenticator.authenticate(stream, user_addr).await,
        None => {
            // Best effort: the client is refused either way
            let _ = stream
                .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
                .await;
            let _ = stream.flush().await;
            Err(SocksError::NoSupportedAuth)
        }
    }
}
