use crate::{
    auth::{self, Authenticator, CredentialStore, NoAuth, UserPass},
    buffer::BufferPool,
    commands::{self, CommandHandler},
    dialer::{Dialer, TcpDialer},
    dispatch::{self, TaskPool},
    error::SocksError,
    policy::{AddressRewriter, Context, DnsResolver, NameResolver, NoRewrite, PermitAll, RuleSet},
    protocol::{MethodRequest, ReplyCode, Version, send_reply},
    request::Request,
    stream::BoxStream,
};
use anyhow::{Context as _, Result};
use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info};

/// Socks5Server holds the server-wide configuration. It is immutable once
/// built and shared by every connection task.
pub struct Socks5Server {
    pub(crate) auth_methods: HashMap<u8, Arc<dyn Authenticator>>,
    pub(crate) resolver: Arc<dyn NameResolver>,
    pub(crate) rules: Arc<dyn RuleSet>,
    pub(crate) rewriter: Arc<dyn AddressRewriter>,
    pub(crate) bind_ip: IpAddr,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) task_pool: Option<Arc<dyn TaskPool>>,
    pub(crate) connect_handler: Option<Arc<dyn CommandHandler>>,
    pub(crate) bind_handler: Option<Arc<dyn CommandHandler>>,
    pub(crate) associate_handler: Option<Arc<dyn CommandHandler>>,
    pub(crate) bind_accept_timeout: Option<Duration>,
}

/// ServerBuilder collects options for a [`Socks5Server`]
#[derive(Default)]
pub struct ServerBuilder {
    authenticators: Vec<Arc<dyn Authenticator>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    resolver: Option<Arc<dyn NameResolver>>,
    rules: Option<Arc<dyn RuleSet>>,
    rewriter: Option<Arc<dyn AddressRewriter>>,
    bind_ip: Option<IpAddr>,
    dialer: Option<Arc<dyn Dialer>>,
    buffer_pool: Option<Arc<BufferPool>>,
    task_pool: Option<Arc<dyn TaskPool>>,
    connect_handler: Option<Arc<dyn CommandHandler>>,
    bind_handler: Option<Arc<dyn CommandHandler>>,
    associate_handler: Option<Arc<dyn CommandHandler>>,
    bind_accept_timeout: Option<Duration>,
}

impl ServerBuilder {
    /// with_authenticator registers a custom scheme. Once any scheme is
    /// registered this way, the built-in defaults are not added.
    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticators.push(Arc::new(authenticator));
        self
    }

    /// with_credentials enables username/password authentication
    pub fn with_credentials(mut self, credentials: impl CredentialStore + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn with_resolver(mut self, resolver: impl NameResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_rules(mut self, rules: impl RuleSet + 'static) -> Self {
        self.rules = Some(Arc::new(rules));
        self
    }

    /// with_rewriter sets a rewriter, applied before the rules are consulted
    pub fn with_rewriter(mut self, rewriter: impl AddressRewriter + 'static) -> Self {
        self.rewriter = Some(Arc::new(rewriter));
        self
    }

    /// with_bind_ip sets the address BIND and UDP ASSOCIATE listen on
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    pub fn with_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    pub fn with_task_pool(mut self, pool: impl TaskPool + 'static) -> Self {
        self.task_pool = Some(Arc::new(pool));
        self
    }

    pub fn with_connect_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.connect_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_bind_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.bind_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_associate_handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.associate_handler = Some(Arc::new(handler));
        self
    }

    /// with_bind_accept_timeout bounds how long BIND waits for its peer
    pub fn with_bind_accept_timeout(mut self, timeout: Duration) -> Self {
        self.bind_accept_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Socks5Server {
        let mut authenticators = self.authenticators;

        // Ensure we have at least one authentication method enabled
        if authenticators.is_empty() {
            match self.credentials {
                Some(credentials) => authenticators.push(Arc::new(UserPass::new(credentials))),
                None => authenticators.push(Arc::new(NoAuth)),
            }
        }

        let auth_methods = authenticators
            .into_iter()
            .map(|a| (a.code(), a))
            .collect();

        Socks5Server {
            auth_methods,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(DnsResolver)),
            rules: self.rules.unwrap_or_else(|| Arc::new(PermitAll)),
            rewriter: self.rewriter.unwrap_or_else(|| Arc::new(NoRewrite)),
            bind_ip: self.bind_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            dialer: self.dialer.unwrap_or_else(|| Arc::new(TcpDialer)),
            buffer_pool: self.buffer_pool.unwrap_or_default(),
            task_pool: self.task_pool,
            connect_handler: self.connect_handler,
            bind_handler: self.bind_handler,
            associate_handler: self.associate_handler,
            bind_accept_timeout: self.bind_accept_timeout,
        }
    }
}

impl Default for Socks5Server {
    fn default() -> Self {
        ServerBuilder::default().build()
    }
}

impl Socks5Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// auth_methods lists the registered method codes in ascending order
    pub fn auth_methods(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.auth_methods.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    /// listen_and_serve binds `addr` and serves it until the listener fails
    pub async fn listen_and_serve(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// serve accepts connections until the listener itself fails. Failures of
    /// individual connections are logged and do not stop the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

        loop {
            let (inbound, peer_addr) = listener.accept().await?;
            let server = Arc::clone(&self);

            dispatch::submit(
                self.task_pool.as_ref(),
                Box::pin(async move {
                    debug!("new client: {peer_addr}");
                    if let Err(e) = server.serve_conn(inbound).await {
                        error!("connection error from {peer_addr}: {e:#}");
                    }
                }),
            );
        }
    }

    /// serve_conn runs the protocol on an accepted TCP connection
    pub async fn serve_conn(&self, stream: TcpStream) -> Result<()> {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        self.serve_stream(Box::new(stream), local_addr, remote_addr)
            .await
    }

    /// serve_stream runs the protocol on any byte stream. The stream is
    /// closed when this returns.
    pub async fn serve_stream(
        &self,
        stream: BoxStream,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        let mut session = Session::new(self, local_addr, remote_addr);
        session.run(stream).await
    }
}

/// SessionState is the progress of one connection through the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Accepted,
    MethodNegotiated,
    Authenticated,
    RequestParsed,
    PolicyEvaluated,
    Dispatched,
    Relaying,
    Terminated,
}

impl SessionState {
    /// advance moves forward to `next`; states never move backwards
    pub fn advance(&mut self, next: SessionState) {
        if next > *self {
            debug!("session {self} -> {next}");
            *self = next;
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Accepted => "accepted",
            SessionState::MethodNegotiated => "method negotiated",
            SessionState::Authenticated => "authenticated",
            SessionState::RequestParsed => "request parsed",
            SessionState::PolicyEvaluated => "policy evaluated",
            SessionState::Dispatched => "dispatched",
            SessionState::Relaying => "relaying",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Session drives a single connection
pub struct Session<'a> {
    server: &'a Socks5Server,
    state: SessionState,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl<'a> Session<'a> {
    pub fn new(
        server: &'a Socks5Server,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            server,
            state: SessionState::Accepted,
            local_addr,
            remote_addr,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// run drives the connection to completion. Errors carry the state the
    /// session had reached when it failed.
    pub async fn run(&mut self, stream: BoxStream) -> Result<()> {
        match self.drive(stream).await {
            Ok(()) => {
                self.state.advance(SessionState::Terminated);
                Ok(())
            }
            Err(e) => Err(e.context(format!("session failed after state '{}'", self.state))),
        }
    }

    async fn drive(&mut self, mut conn: BoxStream) -> Result<()> {
        let greeting = MethodRequest::read_from(&mut conn)
            .await
            .context("failed to read method request")?;
        if greeting.version != Version::SOCKS5 as u8 {
            return Err(SocksError::UnsupportedVersion(greeting.version).into());
        }
        self.state.advance(SessionState::MethodNegotiated);

        let user_addr = self
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let auth_context = auth::negotiate(
            &self.server.auth_methods,
            &mut *conn,
            &user_addr,
            &greeting.methods,
        )
        .await
        .context("failed to authenticate")?;
        self.state.advance(SessionState::Authenticated);

        let mut request = match Request::read_from(&mut conn).await {
            Ok(request) => request,
            Err(e) => {
                if e.is_unrecognized_addr_type() {
                    send_reply(&mut conn, greeting.version, ReplyCode::AddrTypeUnsupported, None)
                        .await
                        .context("failed to send reply")?;
                }
                return Err(anyhow::Error::new(e).context("failed to read destination address"));
            }
        };
        request.auth_context = auth_context;
        request.local_addr = self.local_addr;
        request.remote_addr = self.remote_addr;
        self.state.advance(SessionState::RequestParsed);

        let mut ctx = Context::new();
        self.server.rewriter.rewrite(&mut ctx, &mut request);
        if !self.server.rules.allow(&mut ctx, &request).await {
            send_reply(&mut conn, request.version, ReplyCode::ConnectionNotAllowed, None)
                .await
                .context("failed to send reply")?;
            return Err(anyhow::Error::new(SocksError::RuleDenied {
                command: request.command.to_string(),
                dest: request.dest_addr.to_string(),
            })
            .context("failed to handle request"));
        }
        self.state.advance(SessionState::PolicyEvaluated);

        debug!(
            "{} {} for {user_addr}",
            request.command, request.dest_addr
        );
        self.state.advance(SessionState::Dispatched);
        commands::execute(self.server, ctx, conn, request, &mut self.state)
            .await
            .context("failed to handle request")
    }
}
