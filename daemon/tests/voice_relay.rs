//! End-to-end voice relay scenarios over real UDP sockets.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use uuid::Uuid;
use vcs_daemon::voice::VoiceServer;
use vcs_protocol::{PacketType, VoicePacket};
use vcs_state::{AdminState, BannedState, ClientRecord, Radio, Registry, Role, SettingsState};

use common::{expect_silence, recv_datagram, test_settings, wait_for};

struct Relay {
    server: Arc<VoiceServer>,
    registry: Arc<Registry>,
    addr: SocketAddr,
    _stop: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start_relay() -> Relay {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let settings = Arc::new(SettingsState::from_settings(test_settings(dir.path())));
    let banned = Arc::new(BannedState::load(dir.path().join("banned.json")).unwrap());

    let server = VoiceServer::new(
        Arc::clone(&registry),
        settings,
        banned,
        Arc::new(AdminState::new()),
    );

    let (stop, stop_rx) = watch::channel(false);
    let runner = Arc::clone(&server);
    tokio::spawn(runner.run("127.0.0.1:0".parse().unwrap(), stop_rx));

    let server_for_addr = Arc::clone(&server);
    let addr = wait_for(move || server_for_addr.local_addr()).await;

    Relay { server, registry, addr, _stop: stop, _dir: dir }
}

struct VoiceClient {
    id: Uuid,
    socket: UdpSocket,
}

impl Relay {
    /// Register a client, say HELLO and wait for the ack.
    async fn join(&self, name: &str, coalition: &str, frequency_khz: u32) -> VoiceClient {
        let id = Uuid::new_v4();
        self.registry.add(ClientRecord::new(
            id,
            name.to_string(),
            "AB1".to_string(),
            coalition.to_string(),
            Role::Guest,
        ));
        self.registry
            .replace_radios(
                id,
                vec![Radio {
                    id: 1,
                    name: "COM1".to_string(),
                    frequency_khz,
                    enabled: true,
                    is_intercom: false,
                }],
                10,
            )
            .unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hello = VoicePacket {
            packet_type: PacketType::Hello,
            ..VoicePacket::hello_ack(id)
        };
        socket.send_to(&hello.serialize(), self.addr).await.unwrap();

        let ack = recv_datagram(&socket).await;
        let ack = VoicePacket::parse(&ack).unwrap();
        assert_eq!(ack.packet_type, PacketType::HelloAck);
        assert_eq!(ack.sender_id, id);

        VoiceClient { id, socket }
    }
}

fn voice_datagram(sender: Uuid, frequency_khz: u32, payload_len: usize) -> Vec<u8> {
    VoicePacket::voice(sender, 1, frequency_khz, vec![0xAB; payload_len]).serialize()
}

#[tokio::test]
async fn test_test_frequency_echoes_to_sender_only() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 121_500).await;
    let bob = relay.join("Bob", "red", 121_500).await;

    let datagram = voice_datagram(alice.id, 121_500, 30);
    alice.socket.send_to(&datagram, relay.addr).await.unwrap();

    let echoed = recv_datagram(&alice.socket).await;
    assert_eq!(echoed, datagram);

    expect_silence(&bob.socket).await;
}

#[tokio::test]
async fn test_fan_out_same_coalition_only() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 251_000).await;
    let bob = relay.join("Bob", "red", 251_000).await;
    let carol = relay.join("Carol", "blue", 251_000).await;

    let datagram = voice_datagram(alice.id, 251_000, 64);
    alice.socket.send_to(&datagram, relay.addr).await.unwrap();

    let forwarded = recv_datagram(&bob.socket).await;
    assert_eq!(forwarded, datagram);

    expect_silence(&carol.socket).await;
    expect_silence(&alice.socket).await;
}

#[tokio::test]
async fn test_global_frequency_crosses_coalitions() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 243_000).await;
    let bob = relay.join("Bob", "red", 243_000).await;
    let carol = relay.join("Carol", "blue", 243_000).await;

    let datagram = voice_datagram(alice.id, 243_000, 64);
    alice.socket.send_to(&datagram, relay.addr).await.unwrap();

    assert_eq!(recv_datagram(&bob.socket).await, datagram);
    assert_eq!(recv_datagram(&carol.socket).await, datagram);
    expect_silence(&alice.socket).await;
}

#[tokio::test]
async fn test_mute_suppresses_reception_not_transmission() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 251_000).await;
    let bob = relay.join("Bob", "red", 251_000).await;
    let carol = relay.join("Carol", "red", 251_000).await;

    relay.registry.set_muted(bob.id, true).unwrap();

    // Muted Bob receives nothing, but everyone else still does.
    let datagram = voice_datagram(alice.id, 251_000, 64);
    alice.socket.send_to(&datagram, relay.addr).await.unwrap();
    assert_eq!(recv_datagram(&carol.socket).await, datagram);
    expect_silence(&bob.socket).await;

    // Muted Bob can still transmit.
    let from_bob = voice_datagram(bob.id, 251_000, 64);
    bob.socket.send_to(&from_bob, relay.addr).await.unwrap();
    assert_eq!(recv_datagram(&alice.socket).await, from_bob);
}

#[tokio::test]
async fn test_tiny_payload_dropped() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 251_000).await;
    let bob = relay.join("Bob", "red", 251_000).await;

    let datagram = voice_datagram(alice.id, 251_000, 5);
    alice.socket.send_to(&datagram, relay.addr).await.unwrap();

    expect_silence(&bob.socket).await;
}

#[tokio::test]
async fn test_voice_without_hello_dropped() {
    let relay = start_relay().await;
    let bob = relay.join("Bob", "red", 251_000).await;

    // A registered client that never said HELLO has no binding.
    let ghost = Uuid::new_v4();
    relay.registry.add(ClientRecord::new(
        ghost,
        "Ghost".to_string(),
        "GH0".to_string(),
        "red".to_string(),
        Role::Guest,
    ));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&voice_datagram(ghost, 251_000, 64), relay.addr)
        .await
        .unwrap();

    expect_silence(&bob.socket).await;
}

#[tokio::test]
async fn test_keepalive_is_echoed_and_sweep_evicts() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 251_000).await;

    let keepalive = VoicePacket::keepalive(alice.id).serialize();
    alice.socket.send_to(&keepalive, relay.addr).await.unwrap();

    let echo = VoicePacket::parse(&recv_datagram(&alice.socket).await).unwrap();
    assert_eq!(echo.packet_type, PacketType::Keepalive);

    // An idle binding is evicted once it exceeds the idle threshold.
    assert!(relay.server.has_binding(alice.id));
    assert_eq!(relay.server.sweep_bindings(Duration::from_secs(0)), 1);
    assert!(!relay.server.has_binding(alice.id));
}

#[tokio::test]
async fn test_malformed_datagram_ignored() {
    let relay = start_relay().await;
    let alice = relay.join("Alice", "red", 251_000).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"garbage", relay.addr).await.unwrap();
    socket.send_to(&[0u8; 64], relay.addr).await.unwrap();

    // The relay survives and keeps serving.
    let keepalive = VoicePacket::keepalive(alice.id).serialize();
    alice.socket.send_to(&keepalive, relay.addr).await.unwrap();
    let echo = VoicePacket::parse(&recv_datagram(&alice.socket).await).unwrap();
    assert_eq!(echo.packet_type, PacketType::Keepalive);
}
