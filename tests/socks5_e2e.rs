//! End-to-end tests running the proxy on loopback sockets

use sockrelay::{PermitCommand, Socks5Server, StaticCredentials};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

async fn start_proxy(server: Socks5Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::new(server).serve(listener));
    addr
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// read_reply reads a reply with an IP bound address and returns its status
/// and that address
async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut head = [0u8; 4];
    timeout(STEP, stream.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head[0], 0x05);

    let ip = match head[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::from(octets)
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::from(octets)
        }
        other => panic!("unexpected address type {other:#04x}"),
    };
    let port = stream.read_u16().await.unwrap();
    (head[1], SocketAddr::new(ip, port))
}

fn ip_request(command: u8, addr: SocketAddr) -> Vec<u8> {
    let mut req = vec![0x05, command, 0x00];
    match addr.ip() {
        IpAddr::V4(ip) => {
            req.push(0x01);
            req.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            req.push(0x04);
            req.extend_from_slice(&ip.octets());
        }
    }
    req.extend_from_slice(&addr.port().to_be_bytes());
    req
}

/// start_ipv6_proxy serves on [::1], or returns None when the host has no
/// IPv6 loopback
async fn start_ipv6_proxy() -> Option<SocketAddr> {
    let listener = TcpListener::bind("[::1]:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    tokio::spawn(Arc::new(Socks5Server::default()).serve(listener));
    Some(addr)
}

async fn no_auth_handshake(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);
}

#[tokio::test]
async fn connect_through_proxy_to_echo_server() {
    let echo = start_echo_server().await;
    let proxy = start_proxy(Socks5Server::default()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;

    client.write_all(&ip_request(0x01, echo)).await.unwrap();
    let (status, bound) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(bound.ip(), Ipv4Addr::LOCALHOST);
    assert_ne!(bound.port(), 0);

    client.write_all(b"hello through socks").await.unwrap();
    let mut echoed = [0u8; 19];
    timeout(STEP, client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello through socks");
}

#[tokio::test]
async fn connect_by_domain_name() {
    let echo = start_echo_server().await;
    let proxy = start_proxy(Socks5Server::default()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;

    let mut req = vec![0x05, 0x01, 0x00, 0x03, 9];
    req.extend_from_slice(b"localhost");
    req.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&req).await.unwrap();

    // localhost may resolve to ::1 first, where nothing listens
    let mut head = [0u8; 4];
    timeout(STEP, client.read_exact(&mut head))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head[0], 0x05);
    if head[1] != 0x00 {
        return;
    }
    let rest = if head[3] == 0x01 { 6 } else { 18 };
    let mut bound = vec![0u8; rest];
    client.read_exact(&mut bound).await.unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(STEP, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn connect_refused_is_reported() {
    // grab a free port, then close it
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = start_proxy(Socks5Server::default()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;
    client.write_all(&ip_request(0x01, closed)).await.unwrap();

    let (status, bound) = read_reply(&mut client).await;
    assert_eq!(status, 0x05);
    assert_eq!(bound, SocketAddr::from(([0, 0, 0, 0], 0)));
}

#[tokio::test]
async fn username_password_login() {
    let echo = start_echo_server().await;
    let proxy = start_proxy(
        Socks5Server::builder()
            .with_credentials(StaticCredentials::new().with_user("alice", "s3cret"))
            .build(),
    )
    .await;

    // wrong password
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    client
        .write_all(&[0x01, 5, b'a', b'l', b'i', b'c', b'e', 5, b'w', b'r', b'o', b'n', b'g'])
        .await
        .unwrap();
    let mut answer = Vec::new();
    timeout(STEP, client.read_to_end(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, vec![0x05, 0x02, 0x01, 0x01]);

    // right password
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    client
        .write_all(&[0x01, 5, b'a', b'l', b'i', b'c', b'e', 6])
        .await
        .unwrap();
    client.write_all(b"s3cret").await.unwrap();
    let mut answer = [0u8; 4];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer, [0x05, 0x02, 0x01, 0x00]);

    client.write_all(&ip_request(0x01, echo)).await.unwrap();
    let (status, _) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
}

#[tokio::test]
async fn disabled_command_is_not_allowed() {
    let echo = start_echo_server().await;
    let proxy = start_proxy(
        Socks5Server::builder()
            .with_rules(PermitCommand::new(false, true, true))
            .build(),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;
    client.write_all(&ip_request(0x01, echo)).await.unwrap();

    let (status, _) = read_reply(&mut client).await;
    assert_eq!(status, 0x02);
}

#[tokio::test]
async fn bind_sends_two_replies() {
    let proxy = start_proxy(
        Socks5Server::builder()
            .with_bind_ip(Ipv4Addr::LOCALHOST.into())
            .build(),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;
    client
        .write_all(&ip_request(0x02, SocketAddr::from(([127, 0, 0, 1], 0))))
        .await
        .unwrap();

    let (status, listen_addr) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert_ne!(listen_addr.port(), 0);

    let mut peer = TcpStream::connect(listen_addr).await.unwrap();
    let (status, peer_addr) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(peer_addr, peer.local_addr().unwrap());

    peer.write_all(b"from peer").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(STEP, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"from peer");

    client.write_all(b"to peer").await.unwrap();
    let mut buf = [0u8; 7];
    timeout(STEP, peer.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"to peer");
}

#[tokio::test]
async fn bind_accept_timeout_expires() {
    let proxy = start_proxy(
        Socks5Server::builder()
            .with_bind_ip(Ipv4Addr::LOCALHOST.into())
            .with_bind_accept_timeout(Duration::from_millis(100))
            .build(),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;
    client
        .write_all(&ip_request(0x02, SocketAddr::from(([127, 0, 0, 1], 0))))
        .await
        .unwrap();

    let (status, _) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    let (status, _) = read_reply(&mut client).await;
    assert_eq!(status, 0x06);
}

#[tokio::test]
async fn udp_associate_round_trip() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let proxy = start_proxy(
        Socks5Server::builder()
            .with_bind_ip(Ipv4Addr::LOCALHOST.into())
            .build(),
    )
    .await;

    let mut control = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut control).await;
    control
        .write_all(&ip_request(0x03, SocketAddr::from(([0, 0, 0, 0], 0))))
        .await
        .unwrap();
    let (status, relay_addr) = read_reply(&mut control).await;
    assert_eq!(status, 0x00);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = ip_request(0x00, echo_addr);
    // RSV RSV FRAG replaces VER CMD RSV
    datagram[..3].copy_from_slice(&[0x00, 0x00, 0x00]);
    datagram.extend_from_slice(b"udp payload");
    client.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, from) = timeout(STEP, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay_addr);

    let (target, payload) = sockrelay::udp::parse_datagram(&buf[..n]).unwrap();
    assert_eq!(target.socket_addr(), Some(echo_addr));
    assert_eq!(payload, b"udp payload");
}

#[tokio::test]
async fn bind_over_ipv6_advertises_reachable_address() {
    let Some(proxy) = start_ipv6_proxy().await else {
        return;
    };

    let mut client = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut client).await;
    client
        .write_all(&ip_request(0x02, "[::1]:0".parse().unwrap()))
        .await
        .unwrap();

    let (status, listen_addr) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert!(listen_addr.is_ipv6());

    let mut peer = timeout(STEP, TcpStream::connect(listen_addr))
        .await
        .unwrap()
        .unwrap();
    let (status, peer_addr) = read_reply(&mut client).await;
    assert_eq!(status, 0x00);
    assert_eq!(peer_addr, peer.local_addr().unwrap());

    peer.write_all(b"v6").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(STEP, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"v6");
}

#[tokio::test]
async fn udp_associate_over_ipv6() {
    let Some(proxy) = start_ipv6_proxy().await else {
        return;
    };
    let echo = UdpSocket::bind("[::1]:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let mut control = TcpStream::connect(proxy).await.unwrap();
    no_auth_handshake(&mut control).await;
    control
        .write_all(&ip_request(0x03, "[::]:0".parse().unwrap()))
        .await
        .unwrap();
    let (status, relay_addr) = read_reply(&mut control).await;
    assert_eq!(status, 0x00);
    assert!(relay_addr.is_ipv6());

    let client = UdpSocket::bind("[::1]:0").await.unwrap();
    let datagram = sockrelay::udp::encode_datagram(echo_addr, b"six");
    client.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, from) = timeout(STEP, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, relay_addr);

    let (target, payload) = sockrelay::udp::parse_datagram(&buf[..n]).unwrap();
    assert_eq!(target.socket_addr(), Some(echo_addr));
    assert_eq!(payload, b"six");
}
