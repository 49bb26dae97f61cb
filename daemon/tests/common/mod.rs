//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use vcs_protocol::pb::{
    plugin_request, plugin_response, AuthFlowState, ConfigureResponse, FieldDefinition,
    FlowDefinition, FlowDiscoveryResponse, PluginAuthStepResponse, PluginRequest, PluginResponse,
    PongResponse, StepDefinition, UnitSelection,
};
use vcs_protocol::{read_message, write_message};
use vcs_state::{Coalition, Settings};

/// Low-cost bcrypt keeps the login-heavy tests fast.
pub fn hash(password: &str) -> String {
    bcrypt::hash(password, 4).unwrap()
}

/// Two coalitions (red "pw", blue "pw2"), a test and a global frequency,
/// key files and binds suitable for tests.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.coalitions.push(Coalition {
        name: "red".to_string(),
        description: "Red team".to_string(),
        color: "#ff0000".to_string(),
        password_hash: hash("pw"),
    });
    settings.coalitions.push(Coalition {
        name: "blue".to_string(),
        description: "Blue team".to_string(),
        color: "#0000ff".to_string(),
        password_hash: hash("pw2"),
    });
    settings.frequencies.test = vec![121_500];
    settings.frequencies.global = vec![243_000];
    settings.security.token.private_key_path = dir.join("key.pem");
    settings.security.token.public_key_path = dir.join("pubkey.pem");
    settings.network.control_bind = "127.0.0.1:0".parse().unwrap();
    settings.network.voice_bind = "127.0.0.1:0".parse().unwrap();
    settings
}

/// Receive one datagram or panic after two seconds.
pub async fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv failed");
    buf[..len].to_vec()
}

/// Assert that nothing arrives within 300 ms.
pub async fn expect_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 2048];
    let result = timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(result.is_err(), "expected no datagram, but one arrived");
}

/// Poll until `f` returns `Some`, or panic after two seconds.
pub async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = f() {
            return value;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

/// A scripted auth plugin good enough for the protocol handshake: accepts
/// every connection, answers configuration, offers one single-step "login"
/// flow and completes it on the first StartAuth.
pub struct FakePlugin {
    accept_handle: JoinHandle<()>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl FakePlugin {
    /// Stop accepting and drop every live connection.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
        self.accept_handle.abort();
    }
}

pub fn spawn_fake_plugin(listener: TcpListener) -> FakePlugin {
    let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    let accept_handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_plugin_connection(stream, shutdown_rx.clone()));
        }
    });
    FakePlugin { accept_handle, shutdown }
}

async fn serve_plugin_connection(
    mut stream: tokio::net::TcpStream,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => return,
            request = read_message::<_, PluginRequest>(&mut stream) => match request {
                Ok(Some(request)) => request,
                _ => return,
            },
        };

        let body = match request.body {
            Some(plugin_request::Body::Configure(_))
            | Some(plugin_request::Body::ConfigureFlow(_)) => {
                plugin_response::Body::Configure(ConfigureResponse {
                    success: true,
                    message: String::new(),
                })
            }
            Some(plugin_request::Body::DiscoverFlows(_)) => {
                plugin_response::Body::DiscoverFlows(FlowDiscoveryResponse {
                    flows: vec![login_flow()],
                })
            }
            Some(plugin_request::Body::StartAuth(_))
            | Some(plugin_request::Body::ContinueAuth(_)) => {
                plugin_response::Body::AuthStep(PluginAuthStepResponse {
                    state: AuthFlowState::Complete as i32,
                    session_id: "session-1".to_string(),
                    next_step: None,
                    message: String::new(),
                    player_name: "Frank".to_string(),
                    available_units: vec![UnitSelection {
                        unit_id: "XR2".to_string(),
                        unit_name: "Xray Two".to_string(),
                    }],
                    available_roles: vec![0, 1],
                })
            }
            Some(plugin_request::Body::Ping(ping)) => {
                plugin_response::Body::Pong(PongResponse { nonce: ping.nonce })
            }
            None => continue,
        };

        let response = PluginResponse {
            request_id: request.request_id,
            body: Some(body),
        };
        if write_message(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

fn login_flow() -> FlowDefinition {
    FlowDefinition {
        flow_id: "login".to_string(),
        display_name: "Account login".to_string(),
        steps: vec![StepDefinition {
            step_id: "credentials".to_string(),
            display_name: "Credentials".to_string(),
            fields: vec![FieldDefinition {
                name: "email".to_string(),
                label: "E-mail".to_string(),
                field_type: "text".to_string(),
                regex: "^.+@.+$".to_string(),
                default_value: String::new(),
            }],
            metadata: Default::default(),
        }],
    }
}

/// Shorthand used by every test that brings up a full server.
pub fn arc_settings(settings: Settings) -> Arc<vcs_state::SettingsState> {
    Arc::new(vcs_state::SettingsState::from_settings(settings))
}
