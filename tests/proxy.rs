//! End-to-end scenarios over loopback sockets.
//!
//! Each test stands up a real server leg, a fake upstream WireGuard
//! endpoint, and a client socket, then drives datagrams through the whole
//! path: obfuscation, handshake classification, forwarding, replies, and
//! eviction.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use zerocopy::AsBytes;

use wgmux::crypto::{encrypt_initiation, PublicKey, StaticSecret};
use wgmux::packet::FLAG_OBFUSCATE_BEFORE_SEND;
use wgmux::{Packet, Server, ServerConfig, WireGuardObfuscator};

const USER_KEY: &str = "kisekimo, mahoumo, muryoudewaarimasen";
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn b64(key: &[u8; 32]) -> String {
    use base64ct::{Base64, Encoding};
    Base64::encode_string(key)
}

async fn free_port() -> u16 {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.local_addr().unwrap().port()
}

async fn start_server(config: &str) -> tokio::task::JoinHandle<Result<(), wgmux::Error>> {
    let config = ServerConfig::from_str(config).unwrap();
    let handle = tokio::spawn(Server::new(&config).unwrap().run());
    // Give the listener a moment to bind.
    sleep(Duration::from_millis(200)).await;
    handle
}

fn obfuscate_frame(obfs: &WireGuardObfuscator, frame: &[u8]) -> Packet {
    let mut packet = Packet::new();
    packet.reset(frame.len());
    packet.bytes_mut().copy_from_slice(frame);
    packet.flags |= FLAG_OBFUSCATE_BEFORE_SEND;
    obfs.obfuscate(&mut packet);
    packet
}

fn deobfuscate_frame(obfs: &WireGuardObfuscator, wire: &[u8]) -> Packet {
    let mut packet = Packet::new();
    packet.reset(wire.len());
    packet.bytes_mut().copy_from_slice(wire);
    obfs.deobfuscate(&mut packet);
    packet
}

fn is_canonical(wire: &[u8]) -> bool {
    wire.len() >= 4 && (1..=4).contains(&wire[0]) && wire[1] == 0 && wire[2] == 0 && wire[3] == 0
}

/// A response frame with an all-zero MAC2, as an unloaded endpoint sends it.
fn response_frame() -> Vec<u8> {
    let mut resp = vec![0u8; 92];
    resp[0] = 2;
    for (i, b) in resp[4..76].iter_mut().enumerate() {
        *b = i as u8 ^ 0x5a;
    }
    resp
}

#[tokio::test]
async fn obfuscated_initiation_routes_to_configured_peer() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_sk = StaticSecret::from([0x11; 32]);
    let client_sk = StaticSecret::from([0x22; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 60,
            obfs: "{USER_KEY}",
            servers: [{{
                privkey: "{}",
                peers: [
                    {{ pubkey: "{}", forward_to: "127.0.0.1:{}" }},
                ],
            }}],
        }}"#,
        b64(&server_sk.to_bytes()),
        b64(PublicKey::from(&client_sk).as_bytes()),
        upstream.local_addr().unwrap().port(),
    ))
    .await;

    let obfs = WireGuardObfuscator::new(USER_KEY);
    let init = encrypt_initiation(&client_sk, &PublicKey::from(&server_sk), 99, [0; 12]);
    let canonical = init.as_bytes().to_vec();
    let wire = obfuscate_frame(&obfs, &canonical);
    assert!(!is_canonical(wire.bytes()));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(wire.bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    // The upstream endpoint sees the canonical frame, byte for byte.
    let mut buf = [0u8; 2048];
    let (n, entry_addr) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &canonical[..]);

    // A response with zero MAC2 goes back obfuscated; the client restores
    // it, marker cleared and MAC2 zeroed again.
    let resp = response_frame();
    upstream.send_to(&resp, entry_addr).await.unwrap();
    let (n, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(!is_canonical(&buf[..n]));
    assert!(n > resp.len());

    let restored = deobfuscate_frame(&obfs, &buf[..n]);
    assert_eq!(restored.bytes(), &resp[..]);

    // Established flow: a short obfuscated transport frame rides the same
    // entry and sheds its padding upstream.
    let mut transport = vec![0u8; 100];
    transport[0] = 4;
    for (i, b) in transport[16..].iter_mut().enumerate() {
        *b = i as u8;
    }
    let wire = obfuscate_frame(&obfs, &transport);
    assert_eq!(wire.len(), 116);
    client
        .send_to(wire.bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();
    let (n, from) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, entry_addr);
    assert_eq!(&buf[..n], &transport[..]);

    server.abort();
}

#[tokio::test]
async fn unknown_pubkey_falls_back() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fallback = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_sk = StaticSecret::from([0x33; 32]);
    let known_sk = StaticSecret::from([0x44; 32]);
    let stranger_sk = StaticSecret::from([0x55; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 60,
            servers: [{{
                privkey: "{}",
                address: "127.0.0.1",
                peers: [
                    {{ pubkey: "{}", forward_to: ":{}" }},
                    {{ forward_to: ":{}" }},
                ],
            }}],
        }}"#,
        b64(&server_sk.to_bytes()),
        b64(PublicKey::from(&known_sk).as_bytes()),
        upstream.local_addr().unwrap().port(),
        fallback.local_addr().unwrap().port(),
    ))
    .await;

    // Obfuscation disabled in this deployment: canonical frames on the wire.
    let init = encrypt_initiation(&stranger_sk, &PublicKey::from(&server_sk), 7, [0; 12]);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(init.as_bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, fallback.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], init.as_bytes());

    server.abort();
}

#[tokio::test]
async fn second_server_on_the_same_listener() {
    let upstream_one = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_two = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let first_sk = StaticSecret::from([0x66; 32]);
    let second_sk = StaticSecret::from([0x77; 32]);
    let client_sk = StaticSecret::from([0x88; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 60,
            servers: [
                {{
                    privkey: "{}",
                    peers: [{{ forward_to: "127.0.0.1:{}" }}],
                }},
                {{
                    privkey: "{}",
                    peers: [{{ pubkey: "{}", forward_to: "127.0.0.1:{}" }}],
                }},
            ],
        }}"#,
        b64(&first_sk.to_bytes()),
        upstream_one.local_addr().unwrap().port(),
        b64(&second_sk.to_bytes()),
        b64(PublicKey::from(&client_sk).as_bytes()),
        upstream_two.local_addr().unwrap().port(),
    ))
    .await;

    // Encrypted to the second server's key: decryption fails on the first
    // server and routes via the second.
    let init = encrypt_initiation(&client_sk, &PublicKey::from(&second_sk), 7, [0; 12]);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(init.as_bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = timeout(RECV_TIMEOUT, upstream_two.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], init.as_bytes());

    server.abort();
}

#[tokio::test]
async fn non_handshake_from_stranger_is_dropped() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_sk = StaticSecret::from([0x99; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 60,
            servers: [{{
                privkey: "{}",
                peers: [{{ forward_to: "127.0.0.1:{}" }}],
            }}],
        }}"#,
        b64(&server_sk.to_bytes()),
        upstream.local_addr().unwrap().port(),
    ))
    .await;

    let mut keepalive = [0u8; 32];
    keepalive[0] = 4;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&keepalive, ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    assert!(
        timeout(Duration::from_millis(400), upstream.recv_from(&mut buf))
            .await
            .is_err(),
        "transport frame without an entry must not be forwarded"
    );

    server.abort();
}

#[tokio::test]
async fn idle_entry_is_evicted_and_recreated() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_sk = StaticSecret::from([0xaa; 32]);
    let client_sk = StaticSecret::from([0xbb; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 1,
            servers: [{{
                privkey: "{}",
                peers: [{{ pubkey: "{}", forward_to: "127.0.0.1:{}" }}],
            }}],
        }}"#,
        b64(&server_sk.to_bytes()),
        b64(PublicKey::from(&client_sk).as_bytes()),
        upstream.local_addr().unwrap().port(),
    ))
    .await;

    let init = encrypt_initiation(&client_sk, &PublicKey::from(&server_sk), 7, [0; 12]);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(init.as_bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (_, first_entry) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    // Idle past the timeout plus a couple of sweep periods.
    sleep(Duration::from_millis(2600)).await;

    client
        .send_to(init.as_bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();
    let (_, second_entry) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(
        first_entry.port(),
        second_entry.port(),
        "a swept entry must come back on a fresh outbound socket"
    );

    server.abort();
}

#[tokio::test]
async fn plain_wireguard_passes_through_an_obfuscating_server() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_sk = StaticSecret::from([0xcc; 32]);
    let client_sk = StaticSecret::from([0xdd; 32]);

    let listen_port = free_port().await;
    let server = start_server(&format!(
        r#"{{
            listen: "127.0.0.1:{listen_port}",
            timeout: 60,
            obfs: "{USER_KEY}",
            servers: [{{
                privkey: "{}",
                peers: [{{ pubkey: "{}", forward_to: "127.0.0.1:{}" }}],
            }}],
        }}"#,
        b64(&server_sk.to_bytes()),
        b64(PublicKey::from(&client_sk).as_bytes()),
        upstream.local_addr().unwrap().port(),
    ))
    .await;

    // A peer that does not obfuscate: canonical initiation in, canonical
    // reply out.
    let init = encrypt_initiation(&client_sk, &PublicKey::from(&server_sk), 7, [0; 12]);
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(init.as_bytes(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, entry_addr) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], init.as_bytes());

    let resp = response_frame();
    upstream.send_to(&resp, entry_addr).await.unwrap();
    let (n, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], &resp[..]);

    server.abort();
}

mod client_leg {
    use super::*;
    use wgmux::{Client, ClientConfig};

    #[tokio::test]
    async fn mangles_outbound_and_restores_replies() {
        let fake_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_port = free_port().await;

        let config = ClientConfig::from_str(&format!(
            r#"{{
                server: "127.0.0.1:{}",
                id: 7,
                listen: "127.0.0.1:{listen_port}",
                timeout: 60,
                xor_key: "sayonara",
            }}"#,
            fake_server.local_addr().unwrap().port(),
        ))
        .unwrap();
        let client = tokio::spawn(Client::new(&config).unwrap().run());
        sleep(Duration::from_millis(200)).await;

        let mut keepalive = [0u8; 32];
        keepalive[0] = 4;
        for (i, b) in keepalive[16..].iter_mut().enumerate() {
            *b = i as u8;
        }

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&keepalive, ("127.0.0.1", listen_port))
            .await
            .unwrap();

        let key = b"sayonara";
        let mut expected = keepalive;
        expected[1] = 7;
        for (i, b) in expected.iter_mut().enumerate() {
            *b ^= key[i % key.len()];
        }

        let mut buf = [0u8; 2048];
        let (n, entry_addr) = timeout(RECV_TIMEOUT, fake_server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &expected[..]);

        // Reply comes back XORed; the client undoes it for the local peer.
        let mut reply = [0u8; 32];
        reply[0] = 4;
        for (i, b) in reply.iter_mut().enumerate() {
            *b = (*b ^ 0x3c).wrapping_add(i as u8);
        }
        let mut reply_wire = reply;
        for (i, b) in reply_wire.iter_mut().enumerate() {
            *b ^= key[i % key.len()];
        }
        fake_server.send_to(&reply_wire, entry_addr).await.unwrap();

        let (n, _) = timeout(RECV_TIMEOUT, peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &reply[..]);

        client.abort();
    }
}
