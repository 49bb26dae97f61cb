//! End-to-end control-plane flows against a full application instance.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use vcs_daemon::app::{DistributionMode, VcsApplication};
use vcs_protocol::pb::{
    client_message, server_message, ClientCapabilities, ClientFeature, ClientMessage,
    DisconnectRequest, ErrorCode, GuestLoginRequest, HealthCheckRequest, InitAuthRequest,
    ServerMessage, ServerUpdate, ServingStatus, SubscribeRequest, SyncRequest,
    UpdateClientInfoRequest, UpdateRadioInfoRequest, CONTROL_PROTOCOL_VERSION,
};
use vcs_protocol::{read_message, write_message};

use common::{test_settings, wait_for};

async fn start_app() -> (Arc<VcsApplication>, SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    let settings = test_settings(dir.path());
    std::fs::write(&config_path, serde_yaml::to_string(&settings).unwrap()).unwrap();

    let app = Arc::new(
        VcsApplication::new(
            &config_path,
            &dir.path().join("banned.json"),
            DistributionMode::Standalone,
        )
        .unwrap(),
    );
    app.start_servers().await.unwrap();

    let app_for_addr = Arc::clone(&app);
    let addr = wait_for(move || app_for_addr.control_addr()).await;
    (app, addr, dir)
}

struct ControlClient {
    stream: TcpStream,
    next_id: u64,
}

impl ControlClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream, next_id: 1 }
    }

    /// Send one request and wait for its response, skipping pushes.
    async fn call(&mut self, token: &str, body: client_message::Body) -> server_message::Body {
        let request_id = self.next_id;
        self.next_id += 1;

        let message = ClientMessage {
            version: CONTROL_PROTOCOL_VERSION,
            request_id,
            token: token.to_string(),
            body: Some(body),
        };
        write_message(&mut self.stream, &message).await.unwrap();

        loop {
            let response: ServerMessage =
                timeout(Duration::from_secs(5), read_message(&mut self.stream))
                    .await
                    .expect("timed out waiting for response")
                    .unwrap()
                    .expect("connection closed");
            if response.request_id == request_id {
                return response.body.expect("response without body");
            }
        }
    }

    /// Wait for the next push message.
    async fn next_push(&mut self) -> ServerUpdate {
        loop {
            let message: ServerMessage =
                timeout(Duration::from_secs(5), read_message(&mut self.stream))
                    .await
                    .expect("timed out waiting for push")
                    .unwrap()
                    .expect("connection closed");
            if message.request_id == 0 {
                if let Some(server_message::Body::Update(update)) = message.body {
                    return update;
                }
            }
        }
    }

    async fn login(&mut self, name: &str, password: &str) -> (String, String) {
        let init = match self.call(
            "",
            client_message::Body::InitAuth(InitAuthRequest { capabilities: capabilities() }),
        )
        .await
        {
            server_message::Body::InitAuth(resp) => resp,
            other => panic!("unexpected response: {other:?}"),
        };
        assert!(init.success, "{}", init.error_message);
        assert!(init.has_guest_login);

        let login = match self.call(
            "",
            client_message::Body::GuestLogin(GuestLoginRequest {
                capabilities: capabilities(),
                client_guid: init.client_guid,
                name: name.to_string(),
                unit_id: "AB1".to_string(),
                password: password.to_string(),
            }),
        )
        .await
        {
            server_message::Body::GuestLogin(resp) => resp,
            other => panic!("unexpected response: {other:?}"),
        };
        assert!(login.success, "{}", login.error_message);
        (login.token, login.client_guid)
    }
}

fn capabilities() -> Option<ClientCapabilities> {
    Some(ClientCapabilities {
        version: "0.1.0".to_string(),
        supported_features: vec![ClientFeature::Standalone as i32],
    })
}

#[tokio::test]
async fn test_guest_login_and_sync() {
    let (_app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;

    let (token, client_guid) = client.login("Alice", "pw").await;
    assert!(!token.is_empty());

    let sync = match client.call(&token, client_message::Body::SyncClient(SyncRequest {})).await {
        server_message::Body::Sync(resp) => resp,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(sync.success);
    assert_eq!(sync.clients.len(), 1);
    let me = &sync.clients[&client_guid];
    assert_eq!(me.name, "Alice");
    assert_eq!(me.coalition, "red");

    let settings = sync.settings.unwrap();
    assert_eq!(settings.test_frequencies, vec![121_500]);
    assert_eq!(settings.global_frequencies, vec![243_000]);
}

#[tokio::test]
async fn test_session_methods_require_token() {
    let (_app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;

    let response =
        client.call("", client_message::Body::SyncClient(SyncRequest {})).await;
    match response {
        server_message::Body::Error(error) => {
            assert_eq!(error.code, ErrorCode::Unauthenticated as i32);
        }
        other => panic!("expected error, got {other:?}"),
    }

    let response = client
        .call("Bearer not-a-token", client_message::Body::SyncClient(SyncRequest {}))
        .await;
    assert!(matches!(response, server_message::Body::Error(_)));
}

#[tokio::test]
async fn test_subscribe_receives_radio_updates() {
    let (_app, addr, _dir) = start_app().await;

    let mut subscriber = ControlClient::connect(addr).await;
    let (sub_token, _) = subscriber.login("Alice", "pw").await;
    let response = subscriber
        .call(&sub_token, client_message::Body::Subscribe(SubscribeRequest {}))
        .await;
    match response {
        server_message::Body::Status(status) => assert!(status.success),
        other => panic!("unexpected response: {other:?}"),
    }

    let mut publisher = ControlClient::connect(addr).await;
    let (token, guid) = publisher.login("Bob", "pw").await;
    let response = publisher
        .call(
            &token,
            client_message::Body::UpdateRadioInfo(UpdateRadioInfoRequest {
                radios: vec![vcs_protocol::pb::Radio {
                    id: 1,
                    name: "COM1".to_string(),
                    frequency_khz: 251_000,
                    enabled: true,
                    is_intercom: false,
                }],
            }),
        )
        .await;
    match response {
        server_message::Body::Status(status) => assert!(status.success),
        other => panic!("unexpected response: {other:?}"),
    }

    // Bob's login and radio change both push updates; wait for the radio
    // one and check the snapshot carries his radio.
    loop {
        let update = subscriber.next_push().await;
        if update.topic == "clients/radio/changed" {
            let radios = &update.radios[&guid];
            assert_eq!(radios.radios.len(), 1);
            assert_eq!(radios.radios[0].frequency_khz, 251_000);
            break;
        }
    }
}

#[tokio::test]
async fn test_update_client_info_partial_rejection() {
    let (app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;
    let (token, guid) = client.login("Alice", "pw").await;

    let response = client
        .call(
            &token,
            client_message::Body::UpdateClientInfo(UpdateClientInfoRequest {
                name: "Alicia".to_string(),
                unit_id: "not-valid".to_string(),
                coalition: "blue".to_string(),
                role: 0,
            }),
        )
        .await;
    let status = match response {
        server_message::Body::Status(status) => status,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(!status.success);
    assert!(status.error_message.contains("unit ID"));

    // The valid fields were applied anyway.
    let id = uuid::Uuid::parse_str(&guid).unwrap();
    let record = app.registry.get(id).unwrap();
    assert_eq!(record.display_name, "Alicia");
    assert_eq!(record.coalition, "blue");
    assert_eq!(record.unit_id, "AB1");
}

#[tokio::test]
async fn test_disconnect_removes_client() {
    let (app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;
    let (token, _) = client.login("Alice", "pw").await;

    let response =
        client.call(&token, client_message::Body::Disconnect(DisconnectRequest {})).await;
    match response {
        server_message::Body::Status(status) => assert!(status.success),
        other => panic!("unexpected response: {other:?}"),
    }
    assert!(app.registry.is_empty());
}

#[tokio::test]
async fn test_guest_login_then_voice_echo() {
    let (app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;
    let (_token, guid) = client.login("Alice", "pw").await;
    let id = uuid::Uuid::parse_str(&guid).unwrap();

    let record = app.registry.get(id).unwrap();
    assert_eq!(record.role, vcs_state::Role::Guest);
    assert_eq!(record.coalition, "red");

    // Bring up the voice side of the same session.
    let app_for_addr = Arc::clone(&app);
    let voice_addr = wait_for(move || app_for_addr.voice_addr()).await;
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    use vcs_protocol::{PacketType, VoicePacket};
    let hello = VoicePacket {
        packet_type: PacketType::Hello,
        ..VoicePacket::hello_ack(id)
    };
    socket.send_to(&hello.serialize(), voice_addr).await.unwrap();
    let ack = common::recv_datagram(&socket).await;
    assert_eq!(VoicePacket::parse(&ack).unwrap().packet_type, PacketType::HelloAck);

    // A voice packet on the test frequency comes straight back, unchanged.
    let datagram = VoicePacket::voice(id, 1, 121_500, vec![0x42; 30]).serialize();
    socket.send_to(&datagram, voice_addr).await.unwrap();
    assert_eq!(common::recv_datagram(&socket).await, datagram);
}

#[tokio::test]
async fn test_health_check_reports_serving() {
    let (_app, addr, _dir) = start_app().await;
    let mut client = ControlClient::connect(addr).await;
    let (token, _) = client.login("Alice", "pw").await;

    let response = client
        .call(&token, client_message::Body::HealthCheck(HealthCheckRequest {}))
        .await;
    let health = match response {
        server_message::Body::HealthCheck(health) => health,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(health.status, ServingStatus::Serving as i32);
    assert_eq!(health.services["control"], ServingStatus::Serving as i32);
    assert_eq!(health.services["voice"], ServingStatus::Serving as i32);
}
