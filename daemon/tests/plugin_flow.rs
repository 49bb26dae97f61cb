//! Plugin channel behaviour: the configure handshake, a full login flow
//! through a scripted plugin, and reconnection after the channel drops.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;
use vcs_auth::TokenService;
use vcs_daemon::app::DistributionMode;
use vcs_daemon::control::AuthService;
use vcs_daemon::plugin::PluginManager;
use vcs_protocol::pb::{
    AuthFlowState, ClientCapabilities, ClientFeature, DiscoverFlowsRequest, InitAuthRequest,
    StartAuthRequest, UnitSelectRequest,
};
use vcs_state::{EventBus, PluginConfig, Registry, Role, SettingsState};

use common::{spawn_fake_plugin, test_settings, FakePlugin};

struct Fixture {
    auth: AuthService,
    settings: Arc<SettingsState>,
    _dir: tempfile::TempDir,
    _plugin: FakePlugin,
}

/// Bring up a fake plugin plus an auth service wired to it.
async fn start_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let plugin_addr = listener.local_addr().unwrap();
    let plugin = spawn_fake_plugin(listener);

    let mut settings = test_settings(dir.path());
    settings.security.enable_plugin_auth = true;
    settings.security.plugins.push(PluginConfig {
        name: "sso".to_string(),
        address: plugin_addr.to_string(),
        enabled: false,
        flow_config: Default::default(),
    });
    let settings = Arc::new(SettingsState::from_settings(settings));

    let (_stop_tx, stop) = watch::channel(false);
    let plugins = Arc::new(PluginManager::from_settings(&settings, stop));
    plugins.start().await;

    let auth = AuthService::new(
        Arc::new(Registry::new()),
        Arc::clone(&settings),
        EventBus::new(),
        Arc::new(TokenService::new()),
        plugins,
        DistributionMode::Standalone,
    );

    Fixture { auth, settings, _dir: dir, _plugin: plugin }
}

fn capabilities() -> Option<ClientCapabilities> {
    Some(ClientCapabilities {
        version: "0.1.0".to_string(),
        supported_features: vec![ClientFeature::Standalone as i32],
    })
}

#[tokio::test]
async fn test_connect_enables_plugin_and_discovers_flows() {
    let fixture = start_fixture().await;

    assert!(fixture.settings.plugin("sso").unwrap().enabled);

    let flows = fixture
        .auth
        .discover_flows(DiscoverFlowsRequest { plugin: "sso".to_string() })
        .await;
    assert!(flows.success, "{}", flows.error_message);
    assert_eq!(flows.flows.len(), 1);
    assert_eq!(flows.flows[0].flow_id, "login");
    assert_eq!(flows.flows[0].steps[0].fields[0].name, "email");
}

#[tokio::test]
async fn test_full_plugin_login_flow() {
    let fixture = start_fixture().await;

    let init = fixture.auth.init_auth(InitAuthRequest { capabilities: capabilities() });
    assert!(init.success);
    assert_eq!(init.available_plugins, vec!["sso".to_string()]);

    let mut input = HashMap::new();
    input.insert("email".to_string(), "frank@example.com".to_string());
    let step = fixture
        .auth
        .start_auth(StartAuthRequest {
            client_guid: init.client_guid.clone(),
            plugin: "sso".to_string(),
            flow_id: "login".to_string(),
            first_step_input: input,
        })
        .await;
    assert!(step.success, "{}", step.error_message);
    assert_eq!(step.state, AuthFlowState::Complete as i32);
    assert_eq!(step.player_name, "Frank");
    assert!(!step.secret.is_empty());
    assert_eq!(step.available_units.len(), 1);

    let selected = fixture.auth.unit_select(UnitSelectRequest {
        client_guid: init.client_guid,
        secret: step.secret,
        unit_id: "XR2".to_string(),
        role: Role::Member.as_u8() as u32,
        coalition: "red".to_string(),
    });
    assert!(selected.success, "{}", selected.error_message);
    assert!(!selected.token.is_empty());
}

#[tokio::test]
async fn test_disabled_plugin_rejected() {
    let fixture = start_fixture().await;
    fixture.settings.set_plugin_enabled("sso", false);

    let init = fixture.auth.init_auth(InitAuthRequest { capabilities: capabilities() });
    let step = fixture
        .auth
        .start_auth(StartAuthRequest {
            client_guid: init.client_guid,
            plugin: "sso".to_string(),
            flow_id: "login".to_string(),
            first_step_input: HashMap::new(),
        })
        .await;
    assert!(!step.success);
    assert!(step.error_message.contains("not available"));
}

#[tokio::test]
async fn test_reconnect_after_channel_loss() {
    let dir = tempfile::tempdir().unwrap();

    // A plugin that dies after the first session.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let plugin_addr = listener.local_addr().unwrap();
    let first_server = spawn_fake_plugin(listener);

    let mut settings = test_settings(dir.path());
    settings.security.enable_plugin_auth = true;
    settings.security.plugins.push(PluginConfig {
        name: "sso".to_string(),
        address: plugin_addr.to_string(),
        enabled: false,
        flow_config: Default::default(),
    });
    let settings = Arc::new(SettingsState::from_settings(settings));

    let (_stop_tx, stop) = watch::channel(false);
    let plugins = Arc::new(PluginManager::from_settings(&settings, stop));
    plugins.start().await;
    assert!(fixtures_enabled(&settings));

    // Kill the plugin. The next call fails, which disables the plugin and
    // starts the backoff loop.
    first_server.kill();
    sleep(Duration::from_millis(50)).await;

    let client = plugins.client("sso").unwrap();
    let result = client.discover_flows().await;
    assert!(result.is_err());
    assert!(!fixtures_enabled(&settings));

    // Bring the plugin back on the same port; the first backoff step is
    // one second, so the client should be re-enabled shortly after.
    let listener = TcpListener::bind(plugin_addr).await.unwrap();
    let _second_server = spawn_fake_plugin(listener);

    for _ in 0..100 {
        if fixtures_enabled(&settings) {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("plugin was not re-enabled after reconnection");
}

fn fixtures_enabled(settings: &Arc<SettingsState>) -> bool {
    settings.plugin("sso").map(|p| p.enabled).unwrap_or(false)
}

#[tokio::test]
async fn test_unknown_session_rejected_on_continue() {
    let fixture = start_fixture().await;

    let init = fixture.auth.init_auth(InitAuthRequest { capabilities: capabilities() });
    let response = fixture
        .auth
        .continue_auth(vcs_protocol::pb::ContinueAuthRequest {
            client_guid: init.client_guid,
            session_id: "never-issued".to_string(),
            step_data: HashMap::new(),
        })
        .await;
    assert!(!response.success);
    assert_eq!(response.error_message, "Problem verifying client");

    // A guid nobody initialised is rejected outright.
    let response = fixture
        .auth
        .continue_auth(vcs_protocol::pb::ContinueAuthRequest {
            client_guid: Uuid::new_v4().to_string(),
            session_id: "never-issued".to_string(),
            step_data: HashMap::new(),
        })
        .await;
    assert!(!response.success);
}
