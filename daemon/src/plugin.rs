//! Auth plugin client
//!
//! One long-lived outbound RPC channel per configured plugin. The channel
//! speaks the same length-delimited protobuf framing as the control plane;
//! calls are unary and serialised over the connection.
//!
//! Lifecycle: connect → configure (global + per-flow settings) → discover
//! flows → ready. A lost channel flips the plugin's enabled flag off in
//! the settings and starts a reconnection task with exponential backoff;
//! the first successful configure flips it back on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use vcs_protocol::pb::{
    plugin_request, plugin_response, ConfigureFlowRequest, ConfigureRequest, FlowDefinition,
    FlowDiscoveryRequest, PingRequest, PluginAuthStepResponse, PluginContinueAuthRequest,
    PluginRequest, PluginResponse, PluginStartAuthRequest,
};
use vcs_protocol::{read_message, write_message};
use vcs_state::{PluginConfig, SettingsState};

/// Deadline for configuration and discovery calls.
const CONFIGURE_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for auth step calls, which may wait on a human.
const AUTH_DEADLINE: Duration = Duration::from_secs(30);

/// Keepalive ping cadence and deadline.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_DEADLINE: Duration = Duration::from_secs(10);

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

const RECONNECT_BASE_BACKOFF_SECS: u64 = 1;
const RECONNECT_MAX_BACKOFF_SECS: u64 = 128;
const RECONNECT_MAX_ATTEMPTS: u32 = 20;

/// Errors surfaced to the auth service. Transport details never leak past
/// this boundary.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin unavailable: {0}")]
    Unavailable(String),

    #[error("rejected by plugin: {0}")]
    Rejected(String),

    #[error("plugin call timed out")]
    Timeout,
}

/// A client for one configured plugin.
pub struct PluginClient {
    name: String,
    address: String,
    config: PluginConfig,
    settings: Arc<SettingsState>,
    conn: Mutex<Option<TcpStream>>,
    next_request_id: AtomicU64,
    reconnecting: AtomicBool,
    stop: watch::Receiver<bool>,
}

impl PluginClient {
    pub fn new(
        config: PluginConfig,
        settings: Arc<SettingsState>,
        stop: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            address: config.address.clone(),
            config,
            settings,
            conn: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
            reconnecting: AtomicBool::new(false),
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect and run the configure → discover handshake. On success the
    /// plugin is marked enabled in the settings.
    pub async fn connect(self: &Arc<Self>) -> Result<(), PluginError> {
        info!(plugin = %self.name, address = %self.address, "connecting to plugin");

        let stream = tokio::time::timeout(CONNECT_DEADLINE, TcpStream::connect(&self.address))
            .await
            .map_err(|_| PluginError::Timeout)?
            .map_err(|e| PluginError::Unavailable(e.to_string()))?;

        *self.conn.lock().await = Some(stream);

        self.configure().await?;
        let flows = self.discover_flows().await?;
        self.configure_flows(&flows).await?;

        self.settings.set_plugin_enabled(&self.name, true);
        info!(plugin = %self.name, "plugin ready");
        Ok(())
    }

    /// Spawn the keepalive loop for this plugin.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let mut stop = self.stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        if !client.is_connected().await {
                            continue;
                        }
                        let nonce = fastrand::u64(..);
                        match client
                            .call(
                                plugin_request::Body::Ping(PingRequest { nonce }),
                                KEEPALIVE_DEADLINE,
                            )
                            .await
                        {
                            Ok(plugin_response::Body::Pong(pong)) if pong.nonce == nonce => {
                                debug!(plugin = %client.name, "keepalive ok");
                            }
                            Ok(_) => {
                                warn!(plugin = %client.name, "keepalive answered with wrong body");
                            }
                            Err(e) => {
                                // call() already kicked off reconnection.
                                warn!(plugin = %client.name, error = %e, "keepalive failed");
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Fetch the flow definitions the plugin currently offers.
    pub async fn discover_flows(self: &Arc<Self>) -> Result<Vec<FlowDefinition>, PluginError> {
        match self
            .call(
                plugin_request::Body::DiscoverFlows(FlowDiscoveryRequest {}),
                CONFIGURE_DEADLINE,
            )
            .await?
        {
            plugin_response::Body::DiscoverFlows(resp) => Ok(resp.flows),
            _ => Err(PluginError::Unavailable("unexpected response body".to_string())),
        }
    }

    /// Begin an authentication flow.
    pub async fn start_auth(
        self: &Arc<Self>,
        flow_id: String,
        first_step_input: HashMap<String, String>,
    ) -> Result<PluginAuthStepResponse, PluginError> {
        self.auth_call(plugin_request::Body::StartAuth(PluginStartAuthRequest {
            flow_id,
            first_step_input,
        }))
        .await
    }

    /// Feed the next step's input into a running flow.
    pub async fn continue_auth(
        self: &Arc<Self>,
        session_id: String,
        step_data: HashMap<String, String>,
    ) -> Result<PluginAuthStepResponse, PluginError> {
        self.auth_call(plugin_request::Body::ContinueAuth(PluginContinueAuthRequest {
            session_id,
            step_data,
        }))
        .await
    }

    async fn auth_call(
        self: &Arc<Self>,
        body: plugin_request::Body,
    ) -> Result<PluginAuthStepResponse, PluginError> {
        match self.call(body, AUTH_DEADLINE).await? {
            plugin_response::Body::AuthStep(resp) => Ok(resp),
            _ => Err(PluginError::Unavailable("unexpected response body".to_string())),
        }
    }

    async fn configure(self: &Arc<Self>) -> Result<(), PluginError> {
        info!(plugin = %self.name, "configuring plugin");
        let request = ConfigureRequest {
            plugin_name: self.name.clone(),
            global_settings: self.config.flow_config.global_settings.clone(),
        };

        match self.call(plugin_request::Body::Configure(request), CONFIGURE_DEADLINE).await? {
            plugin_response::Body::Configure(resp) if resp.success => Ok(()),
            plugin_response::Body::Configure(resp) => Err(PluginError::Rejected(resp.message)),
            _ => Err(PluginError::Unavailable("unexpected response body".to_string())),
        }
    }

    async fn configure_flows(
        self: &Arc<Self>,
        discovered: &[FlowDefinition],
    ) -> Result<(), PluginError> {
        for flow in &self.config.flow_config.flows {
            if !discovered.iter().any(|d| d.flow_id == flow.flow_id) {
                debug!(plugin = %self.name, flow = %flow.flow_id, "configured flow not offered by plugin");
                continue;
            }

            info!(plugin = %self.name, flow = %flow.flow_id, "configuring flow");
            let request = ConfigureFlowRequest {
                flow_id: flow.flow_id.clone(),
                settings: flow.configuration.clone(),
            };
            match self
                .call(plugin_request::Body::ConfigureFlow(request), CONFIGURE_DEADLINE)
                .await?
            {
                plugin_response::Body::Configure(resp) if resp.success => {}
                plugin_response::Body::Configure(resp) => {
                    return Err(PluginError::Rejected(resp.message));
                }
                _ => {
                    return Err(PluginError::Unavailable("unexpected response body".to_string()));
                }
            }
        }
        Ok(())
    }

    /// One unary call: write the request, read frames until the matching
    /// response id arrives. Any transport failure tears the connection
    /// down and schedules reconnection.
    async fn call(
        self: &Arc<Self>,
        body: plugin_request::Body,
        deadline: Duration,
    ) -> Result<plugin_response::Body, PluginError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = PluginRequest { request_id, body: Some(body) };

        let mut guard = self.conn.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(PluginError::Unavailable("not connected".to_string()));
        };

        let exchange = async {
            write_message(stream, &request).await?;
            loop {
                match read_message::<_, PluginResponse>(stream).await? {
                    Some(resp) if resp.request_id == request_id => {
                        return Ok::<_, vcs_protocol::CodecError>(Some(resp));
                    }
                    // A response to an earlier call that hit its deadline;
                    // skip it and keep reading.
                    Some(_) => continue,
                    None => return Ok(None),
                }
            }
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(Some(response))) => response
                .body
                .ok_or_else(|| PluginError::Unavailable("empty response".to_string())),
            Ok(Ok(None)) => {
                self.fail(&mut guard, "connection closed by plugin");
                Err(PluginError::Unavailable("connection closed".to_string()))
            }
            Ok(Err(e)) => {
                self.fail(&mut guard, &e.to_string());
                Err(PluginError::Unavailable(e.to_string()))
            }
            Err(_) => {
                self.fail(&mut guard, "deadline exceeded");
                Err(PluginError::Timeout)
            }
        }
    }

    /// Drop the connection, disable the plugin and kick off reconnection.
    fn fail(self: &Arc<Self>, guard: &mut Option<TcpStream>, reason: &str) {
        warn!(plugin = %self.name, reason, "plugin channel lost");
        *guard = None;
        self.settings.set_plugin_enabled(&self.name, false);
        self.schedule_reconnect();
    }

    /// Start the backoff reconnection task unless one is already running.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.reconnect_loop().await;
            client.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        warn!(plugin = %self.name, "attempting to reconnect to plugin");
        let mut backoff = RECONNECT_BASE_BACKOFF_SECS;
        let mut stop = self.stop.clone();

        for attempt in 1..=RECONNECT_MAX_ATTEMPTS {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    info!(plugin = %self.name, attempt, "plugin reconnected");
                    return;
                }
                Err(e) => {
                    debug!(plugin = %self.name, attempt, error = %e, "reconnect attempt failed");
                }
            }

            if backoff < RECONNECT_MAX_BACKOFF_SECS {
                backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF_SECS);
            }
        }

        error!(plugin = %self.name, "max reconnection attempts reached, giving up");
        *self.conn.lock().await = None;
    }
}

/// All plugin clients, keyed by plugin name.
pub struct PluginManager {
    plugins: HashMap<String, Arc<PluginClient>>,
}

impl PluginManager {
    /// Build clients for every plugin in the settings. Nothing connects
    /// yet; call [`PluginManager::start`].
    pub fn from_settings(settings: &Arc<SettingsState>, stop: watch::Receiver<bool>) -> Self {
        let configs = settings.read(|s| s.security.plugins.clone());
        let plugins = configs
            .into_iter()
            .map(|config| {
                let client = PluginClient::new(config, Arc::clone(settings), stop.clone());
                (client.name().to_string(), client)
            })
            .collect();
        Self { plugins }
    }

    /// Connect every plugin and start its keepalive loop. Individual
    /// failures only disable that plugin and leave its retry loop running.
    pub async fn start(&self) {
        for client in self.plugins.values() {
            if let Err(e) = client.connect().await {
                warn!(plugin = %client.name(), error = %e, "initial plugin connection failed");
                client.settings.set_plugin_enabled(client.name(), false);
                client.schedule_reconnect();
            }
            client.spawn_keepalive();
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<PluginClient>> {
        self.plugins.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
