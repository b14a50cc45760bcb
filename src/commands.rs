use crate::address::{AddrSpec, Host};
use crate::policy::Context;
use crate::protocol::{Command, ReplyCode, send_reply};
use crate::relay::relay;
use crate::request::Request;
use crate::server::{SessionState, Socks5Server};
use crate::stream::{BoxStream, ProxyStream};
use crate::udp::UdpRelay;
use anyhow::{Context as _, Result, anyhow, bail};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::select;
use tracing::{debug, info};

/// CommandHandler replaces the built-in handling of one command. It receives
/// the client connection right after the policy checks, before any reply has
/// been sent.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: Context, conn: BoxStream, request: Request) -> Result<()>;
}

/// execute runs the request's command, through a user handler when one is
/// configured for it
pub async fn execute(
    server: &Socks5Server,
    ctx: Context,
    conn: BoxStream,
    request: Request,
    state: &mut SessionState,
) -> Result<()> {
    let handler = match request.command {
        Command::Connect => &server.connect_handler,
        Command::Bind => &server.bind_handler,
        Command::UdpAssociate => &server.associate_handler,
    };
    if let Some(handler) = handler {
        return handler.handle(ctx, conn, request).await;
    }

    match request.command {
        Command::Connect => handle_connect(server, ctx, conn, request, state).await,
        Command::Bind => handle_bind(server, conn, request, state).await,
        Command::UdpAssociate => handle_associate(server, ctx, conn, request, state).await,
    }
}

// ================
// CONNECT COMMAND
// ================

async fn handle_connect(
    server: &Socks5Server,
    mut ctx: Context,
    mut conn: BoxStream,
    request: Request,
    state: &mut SessionState,
) -> Result<()> {
    let version = request.version;

    let target = match resolve(server, &mut ctx, &request.dest_addr).await {
        Ok(target) => target,
        Err(e) => {
            send_reply(&mut conn, version, ReplyCode::HostUnreachable, None).await?;
            return Err(e.context(format!("failed to resolve {}", request.dest_addr)));
        }
    };

    let outbound = match server.dialer.dial(&ctx, target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            send_reply(&mut conn, version, reply_code_for(&e), None).await?;
            return Err(anyhow!("connect to {} failed: {e}", request.dest_addr));
        }
    };

    send_reply(
        &mut conn,
        version,
        ReplyCode::Succeeded,
        Some(outbound.local_addr),
    )
    .await?;

    state.advance(SessionState::Relaying);
    relay_logged(server, conn, outbound.stream, &request.dest_addr).await;
    Ok(())
}

/// resolve turns the destination into a socket address, asking the
/// configured resolver for domain names
pub(crate) async fn resolve(
    server: &Socks5Server,
    ctx: &mut Context,
    dest: &AddrSpec,
) -> Result<SocketAddr> {
    if let Some(addr) = dest.socket_addr() {
        return Ok(addr);
    }
    let Host::DomainName(name) = &dest.host else {
        bail!("unresolvable destination {dest}");
    };
    let ip = server.resolver.resolve(ctx, name).await?;
    Ok(SocketAddr::new(ip, dest.port))
}

/// reply_code_for maps a dial error to the closest SOCKS5 reply code.
/// Errors the platform does not classify become a general failure.
pub fn reply_code_for(err: &io::Error) -> ReplyCode {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
        io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        _ => ReplyCode::ServerFailure,
    }
}

// ================
// BIND COMMAND
// ================

async fn handle_bind(
    server: &Socks5Server,
    mut conn: BoxStream,
    request: Request,
    state: &mut SessionState,
) -> Result<()> {
    let version = request.version;

    let listener = match TcpListener::bind(listen_addr(server, &request)).await {
        Ok(listener) => listener,
        Err(e) => {
            send_reply(&mut conn, version, ReplyCode::ServerFailure, None).await?;
            return Err(anyhow!("failed to open BIND listener: {e}"));
        }
    };
    let bound = advertised(listener.local_addr()?, &request);

    // First reply: where the peer should connect
    send_reply(&mut conn, version, ReplyCode::Succeeded, Some(bound)).await?;
    debug!("BIND listening on {bound} for {}", request.dest_addr);

    let accepted = accept_one(server, listener, &mut *conn).await;
    let (peer, peer_addr) = match accepted {
        Ok(accepted) => accepted,
        Err(BindFailure::TimedOut) => {
            send_reply(&mut conn, version, ReplyCode::TtlExpired, None).await?;
            bail!("BIND accept timed out");
        }
        Err(BindFailure::Accept(e)) => {
            send_reply(&mut conn, version, ReplyCode::ServerFailure, None).await?;
            return Err(anyhow!("BIND accept failed: {e}"));
        }
        Err(BindFailure::ClientGone) => bail!("client closed the connection during BIND"),
    };

    // Second reply: who connected
    send_reply(&mut conn, version, ReplyCode::Succeeded, Some(peer_addr)).await?;
    info!("BIND accepted {peer_addr} on {bound}");

    state.advance(SessionState::Relaying);
    relay_logged(server, conn, Box::new(peer), &request.dest_addr).await;
    Ok(())
}

enum BindFailure {
    TimedOut,
    Accept(io::Error),
    ClientGone,
}

/// accept_one waits for a single inbound connection. The listener is
/// consumed so it is closed whichever way this returns.
async fn accept_one(
    server: &Socks5Server,
    listener: TcpListener,
    control: &mut dyn ProxyStream,
) -> Result<(tokio::net::TcpStream, SocketAddr), BindFailure> {
    let accept = async {
        match server.bind_accept_timeout {
            Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
                Ok(accepted) => accepted.map_err(BindFailure::Accept),
                Err(_) => Err(BindFailure::TimedOut),
            },
            None => listener.accept().await.map_err(BindFailure::Accept),
        }
    };

    // The client must stay silent until the second reply; anything it does
    // on the control connection before then ends the BIND.
    let mut probe = [0u8; 1];
    select! {
        accepted = accept => accepted,
        _ = control.read(&mut probe) => Err(BindFailure::ClientGone),
    }
}

// ===============
// UDP ASSOCIATE
// ===============

async fn handle_associate(
    server: &Socks5Server,
    ctx: Context,
    mut conn: BoxStream,
    request: Request,
    state: &mut SessionState,
) -> Result<()> {
    let version = request.version;

    let socket = match UdpSocket::bind(listen_addr(server, &request)).await {
        Ok(socket) => socket,
        Err(e) => {
            send_reply(&mut conn, version, ReplyCode::ServerFailure, None).await?;
            return Err(anyhow!("failed to bind UDP relay socket: {e}"));
        }
    };
    let bound = advertised(socket.local_addr()?, &request);

    send_reply(&mut conn, version, ReplyCode::Succeeded, Some(bound)).await?;
    info!("UDP relay started: server is listening on: {bound}");

    state.advance(SessionState::Relaying);
    let client_ip = request.remote_addr.map(|addr| addr.ip());
    UdpRelay::new(socket, client_ip, Arc::clone(&server.resolver), ctx)
        .run(&mut *conn)
        .await
        .context("UDP relay failed")
}

// =========
// HELPERS
// =========

/// listen_addr picks where BIND and UDP ASSOCIATE listen. An unspecified
/// bind IP follows the address family the client reached us on, so the
/// client can always reach the advertised address.
fn listen_addr(server: &Socks5Server, request: &Request) -> SocketAddr {
    let ip = match (server.bind_ip, local_ip(request)) {
        (bind, Some(IpAddr::V6(_))) if bind.is_unspecified() => Ipv6Addr::UNSPECIFIED.into(),
        (bind, Some(IpAddr::V4(_))) if bind.is_unspecified() => Ipv4Addr::UNSPECIFIED.into(),
        (bind, _) => bind,
    };
    SocketAddr::new(ip, 0)
}

/// advertised replaces an unspecified bound IP with the address the client
/// reached us on, as long as both belong to the same family
fn advertised(bound: SocketAddr, request: &Request) -> SocketAddr {
    match local_ip(request) {
        Some(local)
            if bound.ip().is_unspecified()
                && !local.is_unspecified()
                && local.is_ipv4() == bound.is_ipv4() =>
        {
            SocketAddr::new(local, bound.port())
        }
        _ => bound,
    }
}

// IPv4 clients of a dual-stack listener show up as ::ffff:a.b.c.d
fn local_ip(request: &Request) -> Option<IpAddr> {
    request.local_addr.map(|addr| addr.ip().to_canonical())
}

async fn relay_logged(server: &Socks5Server, client: BoxStream, target: BoxStream, dest: &AddrSpec) {
    match relay(client, target, &server.buffer_pool).await {
        Ok((from_client, from_server)) => info!(
            "connection to {dest} closed: {from_client} bytes from client, {from_server} bytes from server"
        ),
        Err(e) => debug!("relay to {dest} ended: {e}"),
    }
}
