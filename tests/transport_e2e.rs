//! End-to-end transport scenarios over loopback.
//!
//! Exercises the full datagram path: compression gate, record sealing,
//! replay rejection, tamper rejection, keep-alive echoes, and the SOCKS5
//! UDP-Associate envelope against a minimal in-process relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

use veiltun::compress;
use veiltun::crypto::{MasterKey, PacketCipher};
use veiltun::error::Error;
use veiltun::transport::{Incoming, TransportConfig, UdpTransport};
use veiltun::wire::{self, Header, PacketType};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_key() -> MasterKey {
    MasterKey::from_bytes([0u8; 32])
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn quiet_config() -> TransportConfig {
    TransportConfig {
        local_addr: loopback(),
        keepalive_interval: Duration::ZERO,
        ..Default::default()
    }
}

async fn bind_receiver() -> Arc<UdpTransport> {
    UdpTransport::bind(&test_key(), quiet_config()).await.unwrap()
}

async fn bind_sender(remote: SocketAddr) -> Arc<UdpTransport> {
    UdpTransport::bind(
        &test_key(),
        TransportConfig {
            remote_addr: Some(remote),
            ..quiet_config()
        },
    )
    .await
    .unwrap()
}

/// Build one DATA datagram by hand, bypassing a transport's sequencer.
fn craft_datagram(cipher: &PacketCipher, sequence: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header { sequence, compressed: false }.encode();
    let record = cipher.seal(payload, &header).unwrap();
    let mut datagram = header.to_vec();
    datagram.extend_from_slice(&record);
    datagram
}

async fn recv(transport: &Arc<UdpTransport>) -> Result<Incoming, Error> {
    timeout(RECV_TIMEOUT, transport.recv()).await.expect("recv timed out")
}

// S1: plaintext echo through loopback.
#[tokio::test]
async fn small_payload_round_trips_uncompressed() {
    let receiver = bind_receiver().await;
    let sender = bind_sender(receiver.local_addr().unwrap()).await;

    let (payload, flag) = compress::compress(b"hello").unwrap();
    assert!(!flag, "five bytes are below the compression floor");
    sender.send(&payload, flag).await.unwrap();

    match recv(&receiver).await.unwrap() {
        Incoming::Data { payload, compressed, from } => {
            assert_eq!(payload, b"hello");
            assert!(!compressed);
            assert_eq!(from, sender.local_addr().unwrap());
        }
        other => panic!("expected data, got {other:?}"),
    }
}

// S2: the compressed flag is visible on the wire and the payload survives.
#[tokio::test]
async fn compression_gate_marks_the_wire() {
    let intercept = UdpSocket::bind(loopback()).await.unwrap();
    let sender = bind_sender(intercept.local_addr().unwrap()).await;

    let plaintext = vec![0x41u8; 256];
    let (payload, flag) = compress::compress(&plaintext).unwrap();
    assert!(flag, "256 identical bytes must compress");
    sender.send(&payload, flag).await.unwrap();

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(RECV_TIMEOUT, intercept.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(buf[0], PacketType::Data as u8);
    assert_eq!(buf[5], 0x01, "compressed flag must be set in the AAD bytes");

    let cipher = PacketCipher::new(&test_key());
    let opened = cipher.open(&buf[wire::HEADER_SIZE..len], &buf[..wire::HEADER_SIZE]).unwrap();
    let restored = compress::decompress(&opened, true).unwrap();
    assert_eq!(restored.as_ref(), plaintext.as_slice());
}

// S3: a replayed datagram is refused and the transport stays usable.
#[tokio::test]
async fn replayed_datagram_is_not_surfaced() {
    let receiver = bind_receiver().await;
    let receiver_addr = receiver.local_addr().unwrap();
    let injector = UdpSocket::bind(loopback()).await.unwrap();
    let cipher = PacketCipher::new(&test_key());

    let first = craft_datagram(&cipher, 0, b"first");
    injector.send_to(&first, receiver_addr).await.unwrap();
    match recv(&receiver).await.unwrap() {
        Incoming::Data { payload, .. } => assert_eq!(payload, b"first"),
        other => panic!("expected data, got {other:?}"),
    }

    let second = craft_datagram(&cipher, 1, b"second");
    injector.send_to(&second, receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await.unwrap(), Incoming::Data { .. }));

    // Redeliver the captured first datagram.
    injector.send_to(&first, receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await, Err(Error::Replay(0))));

    // The transport keeps working afterwards.
    let third = craft_datagram(&cipher, 2, b"third");
    injector.send_to(&third, receiver_addr).await.unwrap();
    match recv(&receiver).await.unwrap() {
        Incoming::Data { payload, .. } => assert_eq!(payload, b"third"),
        other => panic!("expected data, got {other:?}"),
    }
}

// S4: any flipped bit in the record voids the tag.
#[tokio::test]
async fn tampered_datagram_fails_authentication() {
    let receiver = bind_receiver().await;
    let receiver_addr = receiver.local_addr().unwrap();
    let injector = UdpSocket::bind(loopback()).await.unwrap();
    let cipher = PacketCipher::new(&test_key());

    let mut datagram = craft_datagram(&cipher, 0, b"sensitive inner packet");
    let target = wire::HEADER_SIZE + datagram.len() / 2;
    datagram[target] ^= 0x10;

    injector.send_to(&datagram, receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await, Err(Error::Crypto)));
}

// S5: keep-alives are emitted on the interval and echoed with their sequence.
#[tokio::test]
async fn keepalive_probe_and_echo() {
    // Emission: a transport with a known remote probes it periodically.
    let observer = UdpSocket::bind(loopback()).await.unwrap();
    let _prober = UdpTransport::bind(
        &test_key(),
        TransportConfig {
            local_addr: loopback(),
            remote_addr: Some(observer.local_addr().unwrap()),
            keepalive_interval: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), observer.recv_from(&mut buf))
        .await
        .expect("no keep-alive within two seconds")
        .unwrap();
    assert_eq!(len, wire::CONTROL_SIZE);
    assert_eq!(buf[0], PacketType::Keepalive as u8);

    // Echo: injecting a probe yields exactly one ack with the same
    // sequence and surfaces no payload to the caller.
    let receiver = bind_receiver().await;
    let receiver_addr = receiver.local_addr().unwrap();
    let injector = UdpSocket::bind(loopback()).await.unwrap();

    let probe = wire::encode_control(PacketType::Keepalive, 7777);
    injector.send_to(&probe, receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await.unwrap(), Incoming::Control { .. }));

    let (len, from) = timeout(RECV_TIMEOUT, injector.recv_from(&mut buf))
        .await
        .expect("no keep-alive ack")
        .unwrap();
    assert_eq!(from, receiver_addr);
    assert_eq!(len, wire::CONTROL_SIZE);
    assert_eq!(buf[0], PacketType::KeepaliveAck as u8);
    assert_eq!(u32::from_be_bytes(buf[1..5].try_into().unwrap()), 7777);
}

/// Minimal SOCKS5 UDP-Associate relay: negotiates one association, then
/// echoes every wrapped datagram straight back to its sender, asserting
/// the envelope is present on the wire.
async fn spawn_echo_relay() -> SocketAddr {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut control, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        control.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        control.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 10];
        control.read_exact(&mut request).await.unwrap();
        assert_eq!(request[0], 0x05);
        assert_eq!(request[1], 0x03, "expected UDP ASSOCIATE");

        let relay = UdpSocket::bind(loopback()).await.unwrap();
        let relay_addr = match relay.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!("bound v4"),
        };
        let mut reply = vec![0x05, 0x00, 0x00, 0x01];
        reply.extend_from_slice(&relay_addr.ip().octets());
        reply.extend_from_slice(&relay_addr.port().to_be_bytes());
        control.write_all(&reply).await.unwrap();

        // The control stream stays open while datagrams are echoed.
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = relay.recv_from(&mut buf).await.unwrap();
            assert!(len > wire::SOCKS5_ENVELOPE_SIZE);
            assert_eq!(&buf[..4], &[0x00, 0x00, 0x00, 0x01], "envelope missing on the wire");
            relay.send_to(&buf[..len], from).await.unwrap();
        }
    });

    proxy_addr
}

// S6: a transport behind the relay talks to itself through the envelope.
#[tokio::test]
async fn socks5_envelope_round_trip() {
    let proxy_addr = spawn_echo_relay().await;
    let vpn_server: SocketAddr = "127.0.0.9:9999".parse().unwrap();

    let transport = UdpTransport::bind(
        &test_key(),
        TransportConfig {
            local_addr: loopback(),
            remote_addr: Some(vpn_server),
            socks5_proxy: Some(proxy_addr),
            keepalive_interval: Duration::ZERO,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (payload, flag) = compress::compress(b"hello").unwrap();
    transport.send(&payload, flag).await.unwrap();

    match recv(&transport).await.unwrap() {
        Incoming::Data { payload, compressed, from } => {
            assert_eq!(payload, b"hello");
            assert!(!compressed);
            assert_eq!(from, vpn_server, "source must be rewritten to the VPN endpoint");
        }
        other => panic!("expected data, got {other:?}"),
    }

    // The SOCKS5 budget is tighter by the envelope size.
    assert_eq!(
        transport.max_payload(),
        wire::max_payload(false) - wire::SOCKS5_ENVELOPE_SIZE
    );
}

// Malformed datagrams surface as errors without killing the transport.
#[tokio::test]
async fn malformed_datagrams_are_survivable() {
    let receiver = bind_receiver().await;
    let receiver_addr = receiver.local_addr().unwrap();
    let injector = UdpSocket::bind(loopback()).await.unwrap();
    let cipher = PacketCipher::new(&test_key());

    injector.send_to(&[0x09, 0, 0, 0, 1], receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await, Err(Error::Packet(_))));

    injector.send_to(&[0x01, 0, 0], receiver_addr).await.unwrap();
    assert!(matches!(recv(&receiver).await, Err(Error::Packet(_))));

    let good = craft_datagram(&cipher, 0, b"still alive");
    injector.send_to(&good, receiver_addr).await.unwrap();
    match recv(&receiver).await.unwrap() {
        Incoming::Data { payload, .. } => assert_eq!(payload, b"still alive"),
        other => panic!("expected data, got {other:?}"),
    }
}
