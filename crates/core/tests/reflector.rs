//! End-to-end exercises of the reflector service over loopback UDP.

use std::net::SocketAddr;
use std::time::Duration;

use event_bus::EventBus;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ysfr_core::{
    bridge_queue, Blocklist, Handle, LocalDuration, Reflector, ReflectorConfig, ReflectorEvent,
    SystemClock,
};
use ysfr_protocol::{self as protocol, Callsign, DATA_FRAME_LEN};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestReflector {
    addr: SocketAddr,
    handle: Handle,
    cancellation: CancellationToken,
}

impl Drop for TestReflector {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn start_reflector() -> TestReflector {
    let mut bus = EventBus::default();
    bus.register::<ReflectorEvent>(Some(256));

    let mut config = ReflectorConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        Callsign::new("TESTREF").unwrap(),
    );
    config.talk_max_duration = LocalDuration::from_secs(60);

    let reflector = Reflector::bind(config, Blocklist::default(), &bus, SystemClock)
        .await
        .expect("reflector must bind on loopback");
    let addr = reflector.local_addr().unwrap();
    let handle = reflector.handle();

    let cancellation = CancellationToken::new();
    tokio::spawn(reflector.run(cancellation.clone()));

    TestReflector {
        addr,
        handle,
        cancellation,
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn data_frame(source: &str) -> Vec<u8> {
    let mut buf = vec![0u8; DATA_FRAME_LEN];
    buf[..4].copy_from_slice(b"YSFD");
    buf[4..14].copy_from_slice(&Callsign::new("GATEWAY").unwrap().to_field());
    buf[14..24].copy_from_slice(&Callsign::new(source).unwrap().to_field());
    buf[24..34].copy_from_slice(&Callsign::new("ALL").unwrap().to_field());
    buf
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf.truncate(len);
    buf
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = vec![0u8; 2048];
    let received = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(received.is_err(), "unexpected datagram arrived");
}

#[tokio::test]
async fn poll_is_answered_and_registers_the_peer() {
    let reflector = start_reflector().await;
    let peer = client().await;

    peer.send_to(&protocol::poll(&Callsign::new("R1").unwrap()), reflector.addr)
        .await
        .unwrap();

    let reply = recv(&peer).await;
    assert_eq!(&reply[..4], b"YSFP");
    assert_eq!(&reply[4..14], b"TESTREF   ");

    let stats = reflector.handle.stats().await.unwrap();
    assert_eq!(stats.table.active_connections, 1);

    let peers = reflector.handle.peers().await.unwrap();
    assert_eq!(peers[0].callsign, "R1");
    assert!(peers[0].address.contains("**"), "address must be masked");
}

#[tokio::test]
async fn data_frames_fan_out_to_other_peers_only() {
    let reflector = start_reflector().await;
    let talker = client().await;
    let listener = client().await;

    for (socket, callsign) in [(&talker, "R1"), (&listener, "R2")] {
        socket
            .send_to(
                &protocol::poll(&Callsign::new(callsign).unwrap()),
                reflector.addr,
            )
            .await
            .unwrap();
        recv(socket).await;
    }

    let frame = data_frame("R1");
    talker.send_to(&frame, reflector.addr).await.unwrap();

    let forwarded = recv(&listener).await;
    assert_eq!(forwarded, frame);
    // The sender never hears its own frame back.
    expect_silence(&talker).await;
}

#[tokio::test]
async fn contending_data_frame_is_dropped() {
    let reflector = start_reflector().await;
    let first = client().await;
    let second = client().await;
    let listener = client().await;

    for (socket, callsign) in [(&first, "R1"), (&second, "R2"), (&listener, "R3")] {
        socket
            .send_to(
                &protocol::poll(&Callsign::new(callsign).unwrap()),
                reflector.addr,
            )
            .await
            .unwrap();
        recv(socket).await;
    }

    first
        .send_to(&data_frame("R1"), reflector.addr)
        .await
        .unwrap();
    let forwarded = recv(&listener).await;
    assert_eq!(&forwarded[..4], b"YSFD");

    // While R1 holds the floor, R2's frames go nowhere; R1's keep flowing.
    second
        .send_to(&data_frame("R2"), reflector.addr)
        .await
        .unwrap();
    first
        .send_to(&data_frame("R1"), reflector.addr)
        .await
        .unwrap();

    let next = recv(&listener).await;
    assert_eq!(
        &next[14..24],
        &Callsign::new("R1").unwrap().to_field(),
        "only the floor holder's frames are forwarded"
    );
    expect_silence(&listener).await;
}

#[tokio::test]
async fn short_status_probe_is_answered_without_connecting() {
    let reflector = start_reflector().await;
    let prober = client().await;

    prober.send_to(b"YSFS", reflector.addr).await.unwrap();
    let reply = recv(&prober).await;
    assert_eq!(&reply[..4], b"YSFS");
    assert_eq!(&reply[4..14], b"TESTREF   ");
    assert_eq!(&reply[14..], b"000");

    let stats = reflector.handle.stats().await.unwrap();
    assert_eq!(stats.table.active_connections, 0);
    assert_eq!(stats.table.total_connections, 0);
}

#[tokio::test]
async fn unlink_disconnects_the_peer() {
    let reflector = start_reflector().await;
    let peer = client().await;
    let callsign = Callsign::new("R1").unwrap();

    peer.send_to(&protocol::poll(&callsign), reflector.addr)
        .await
        .unwrap();
    recv(&peer).await;

    peer.send_to(&protocol::unlink(&callsign), reflector.addr)
        .await
        .unwrap();

    // Unlink carries no reply; poll again from a second socket to fence.
    let fence = client().await;
    fence
        .send_to(&protocol::poll(&Callsign::new("R9").unwrap()), reflector.addr)
        .await
        .unwrap();
    recv(&fence).await;

    let stats = reflector.handle.stats().await.unwrap();
    assert_eq!(stats.table.active_connections, 1);
    let peers = reflector.handle.peers().await.unwrap();
    assert_eq!(peers[0].callsign, "R9");
}

#[tokio::test]
async fn forwarded_frames_reach_registered_bridges() {
    let reflector = start_reflector().await;
    let talker = client().await;

    talker
        .send_to(&protocol::poll(&Callsign::new("R1").unwrap()), reflector.addr)
        .await
        .unwrap();
    recv(&talker).await;

    let (bridge_tx, bridge_rx) = bridge_queue();
    reflector
        .handle
        .register_bridge("remote-a", bridge_tx)
        .unwrap();
    // A stats round-trip fences the registration command.
    reflector.handle.stats().await.unwrap();

    let frame = data_frame("R1");
    talker.send_to(&frame, reflector.addr).await.unwrap();

    let queued = timeout(RECV_TIMEOUT, bridge_rx.recv_async())
        .await
        .expect("bridge queue must receive the forwarded frame")
        .unwrap();
    assert_eq!(queued, frame);
}

#[tokio::test]
async fn injected_bridge_frames_reach_local_peers() {
    let reflector = start_reflector().await;
    let listener = client().await;

    listener
        .send_to(&protocol::poll(&Callsign::new("R1").unwrap()), reflector.addr)
        .await
        .unwrap();
    recv(&listener).await;

    let (bridge_tx, _bridge_rx) = bridge_queue();
    reflector
        .handle
        .register_bridge("remote-a", bridge_tx)
        .unwrap();

    let frame = data_frame("REMOTE");
    reflector
        .handle
        .inject_frame("remote-a", frame.clone())
        .unwrap();

    let forwarded = recv(&listener).await;
    assert_eq!(forwarded, frame);
}
