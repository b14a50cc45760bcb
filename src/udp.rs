use crate::address::{AddrSpec, Host, write_socket_addr};
use crate::policy::{Context, NameResolver};
use crate::protocol::{MAX_DGRAM, RSV};
use crate::stream::ProxyStream;
use anyhow::{Context as _, Result, bail};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

/// Outbound sockets idle for longer than this are closed
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often idle outbound sockets are looked for
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Target replies queued for the client before outbound sockets stop reading
const RESPONSE_QUEUE: usize = 256;

/// (payload, target it came from, client it is for)
type Response = (Vec<u8>, SocketAddr, SocketAddr);

/// AssociationKey identifies one client -> target flow
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
struct AssociationKey {
    client_addr: SocketAddr,
    target_addr: SocketAddr,
}

/// Peer is the outbound socket serving one flow
struct Peer {
    socket: Arc<UdpSocket>,
    last_activity: Instant,
    monitor: AbortHandle,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

/// Lookup is a finished name resolution together with the datagram that
/// was waiting on it
struct Lookup {
    client_addr: SocketAddr,
    name: String,
    port: u16,
    data: Vec<u8>,
    result: Result<IpAddr>,
}

/// UdpRelay forwards datagrams for one UDP ASSOCIATE until the control
/// connection closes. Every client -> target pair gets its own outbound
/// socket so replies can be attributed without NAT-style bookkeeping.
///
/// Domain targets are resolved in the background, so a slow lookup only
/// holds back the datagram that needs it. Answers are remembered for the
/// rest of the association.
pub struct UdpRelay {
    socket: UdpSocket,
    client_ip: Option<IpAddr>,
    resolver: Arc<dyn NameResolver>,
    ctx: Context,
    peers: HashMap<AssociationKey, Peer>,
    names: HashMap<String, IpAddr>,
    lookups: JoinSet<Lookup>,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
}

impl UdpRelay {
    pub fn new(
        socket: UdpSocket,
        client_ip: Option<IpAddr>,
        resolver: Arc<dyn NameResolver>,
        ctx: Context,
    ) -> Self {
        let (response_tx, response_rx) = channel(RESPONSE_QUEUE);
        Self {
            socket,
            client_ip: client_ip.map(|ip| ip.to_canonical()),
            resolver,
            ctx,
            peers: HashMap::new(),
            names: HashMap::new(),
            lookups: JoinSet::new(),
            response_tx,
            response_rx,
        }
    }

    /// run relays until `control` reaches end of stream or fails
    pub async fn run(mut self, control: &mut dyn ProxyStream) -> Result<()> {
        let mut buffer = vec![0u8; MAX_DGRAM];
        let mut probe = [0u8; 64];
        let mut sweep = interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);

        loop {
            select! {
                // The association lives exactly as long as the TCP connection
                read = control.read(&mut probe) => match read {
                    Ok(0) => {
                        info!("Client disconnected: terminating UDP association");
                        break;
                    }
                    Ok(_) => debug!("Unexpected data on TCP connection during UDP association"),
                    Err(e) => {
                        info!("TCP connection error: terminating UDP association: {e}");
                        break;
                    }
                },

                // Client -> target
                incoming = self.socket.recv_from(&mut buffer) => {
                    let (len, client_addr) = match incoming {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => {
                            debug!("UDP receive error, continuing: {e}");
                            continue;
                        }
                        Err(e) => return Err(e).context("UDP receive error"),
                    };
                    if !self.is_client_allowed(&client_addr) {
                        warn!("rejected UDP from unauthorized client: {client_addr}");
                        continue;
                    }
                    if let Err(e) = self.forward(&buffer[..len], client_addr).await {
                        error!("failed to handle client datagram from {client_addr}: {e:#}");
                    }
                }

                // Name lookups started by `forward`
                Some(joined) = self.lookups.join_next() => match joined {
                    Ok(lookup) => {
                        let client_addr = lookup.client_addr;
                        if let Err(e) = self.finish_lookup(lookup).await {
                            error!("failed to handle client datagram from {client_addr}: {e:#}");
                        }
                    }
                    Err(e) => error!("UDP name lookup task failed: {e}"),
                },

                // Target -> client
                Some((data, target_addr, client_addr)) = self.response_rx.recv() => {
                    let key = AssociationKey { client_addr, target_addr };
                    if let Some(peer) = self.peers.get_mut(&key) {
                        peer.last_activity = Instant::now();
                    }
                    let packet = encode_datagram(target_addr, &data);
                    if let Err(e) = self.socket.send_to(&packet, client_addr).await {
                        error!("Error sending response to client {client_addr}: {e}");
                    } else {
                        debug!("Sent {} bytes from {target_addr} to client {client_addr}", data.len());
                    }
                }

                _ = sweep.tick() => self.expire_idle(),
            }
        }

        Ok(())
    }

    /// forward unwraps one client datagram and sends its payload on. A
    /// datagram for a name not seen before is parked until its lookup ends.
    async fn forward(&mut self, packet: &[u8], client_addr: SocketAddr) -> Result<()> {
        let (target, data) = parse_datagram(packet)?;

        let target_addr = match (target.socket_addr(), &target.host) {
            (Some(addr), _) => addr,
            (None, Host::DomainName(name)) => match self.names.get(name) {
                Some(ip) => SocketAddr::new(*ip, target.port),
                None => {
                    self.start_lookup(client_addr, name.clone(), target.port, data.to_vec());
                    return Ok(());
                }
            },
            (None, _) => bail!("unresolvable UDP target {target}"),
        };

        self.send_to_target(client_addr, target_addr, data).await
    }

    fn start_lookup(&mut self, client_addr: SocketAddr, name: String, port: u16, data: Vec<u8>) {
        debug!("resolving UDP target {name} for {client_addr}");
        let resolver = Arc::clone(&self.resolver);
        let mut ctx = self.ctx.clone();

        self.lookups.spawn(async move {
            let result = resolver.resolve(&mut ctx, &name).await;
            Lookup {
                client_addr,
                name,
                port,
                data,
                result,
            }
        });
    }

    async fn finish_lookup(&mut self, lookup: Lookup) -> Result<()> {
        let ip = lookup
            .result
            .with_context(|| format!("failed to resolve UDP target {}", lookup.name))?;
        self.names.insert(lookup.name, ip);

        let target_addr = SocketAddr::new(ip, lookup.port);
        self.send_to_target(lookup.client_addr, target_addr, &lookup.data)
            .await
    }

    async fn send_to_target(
        &mut self,
        client_addr: SocketAddr,
        target_addr: SocketAddr,
        data: &[u8],
    ) -> Result<()> {
        let key = AssociationKey {
            client_addr,
            target_addr,
        };
        let peer = match self.peers.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(open_peer(key, self.response_tx.clone()).await?),
        };

        peer.socket.send_to(data, target_addr).await?;
        peer.last_activity = Instant::now();

        debug!("forwarded {} bytes: {client_addr} -> {target_addr}", data.len());
        Ok(())
    }

    // As per RFC 1928 datagrams must come from the IP address of the
    // client that opened the association
    fn is_client_allowed(&self, client_addr: &SocketAddr) -> bool {
        self.client_ip
            .is_none_or(|ip| ip == client_addr.ip().to_canonical())
    }

    fn expire_idle(&mut self) {
        let now = Instant::now();
        self.peers.retain(|key, peer| {
            let keep = now.duration_since(peer.last_activity) <= IDLE_TIMEOUT;
            if !keep {
                info!(
                    "Removed expired UDP relay: {} -> {}",
                    key.client_addr, key.target_addr
                );
            }
            keep
        });
    }
}

/// is_transient is true for receive errors that concern a single datagram,
/// typically ICMP feedback about an earlier send
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn open_peer(key: AssociationKey, response_tx: Sender<Response>) -> Result<Peer> {
    let any: IpAddr = match key.target_addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = Arc::new(UdpSocket::bind(SocketAddr::new(any, 0)).await?);
    info!(
        "Created new UDP relay: {} -> {} (via {})",
        key.client_addr,
        key.target_addr,
        socket.local_addr()?
    );

    let monitor = tokio::spawn(monitor_outbound_socket(
        Arc::clone(&socket),
        key,
        response_tx,
    ))
    .abort_handle();

    Ok(Peer {
        socket,
        last_activity: Instant::now(),
        monitor,
    })
}

/// monitor_outbound_socket passes datagrams from the target back to the relay
async fn monitor_outbound_socket(
    socket: Arc<UdpSocket>,
    key: AssociationKey,
    response_tx: Sender<Response>,
) {
    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from_addr)) => {
                if from_addr != key.target_addr {
                    debug!("Unexpected response from {from_addr} (expected {})", key.target_addr);
                    continue;
                }
                if response_tx
                    .send((buffer[..len].to_vec(), from_addr, key.client_addr))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if is_transient(&e) => debug!("outbound UDP receive error, continuing: {e}"),
            Err(e) => {
                error!("Error receiving from outbound socket: {e}");
                break;
            }
        }
    }

    debug!(
        "Stopped monitoring socket for {} -> {}",
        key.client_addr, key.target_addr
    );
}

/// parse_datagram splits a client datagram into its destination and payload
pub fn parse_datagram(packet: &[u8]) -> Result<(AddrSpec, &[u8])> {
    // SOCKS5 UDP Request Header
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+
    if packet.len() < 4 {
        bail!("UDP packet too short");
    }
    if packet[2] != 0x00 {
        bail!("UDP fragmentation not supported");
    }

    let (target, used) = AddrSpec::from_packet(&packet[3..])?;
    Ok((target, &packet[3 + used..]))
}

/// encode_datagram wraps a payload received from `from` for the client
pub fn encode_datagram(from: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut packet = vec![RSV, RSV, 0x00];
    write_socket_addr(from, &mut packet);
    packet.extend_from_slice(data);
    packet
}
