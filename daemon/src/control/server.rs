//! Control server
//!
//! A TCP listener exchanging length-delimited protobuf envelopes with each
//! client. Requests are handled sequentially per connection; connections
//! run in parallel. A bearer-token interceptor guards every session
//! method; the auth-flow methods pass through untouched.
//!
//! `Subscribe` registers the connection's writer queue under the caller's
//! client id; the push task forwards event-bus traffic to every
//! registered stream. A sweep closes streams whose client has gone stale.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vcs_protocol::pb::{
    client_message, server_message, ClientMessage, ErrorCode, ErrorResponse, HealthCheckResponse,
    Notification, ServerMessage, ServerResponse, ServerUpdate, ServingStatus,
};
use vcs_protocol::{read_message, write_message};
use vcs_state::{AdminState, Event, EventBus, Registry, Role, Service, SettingsState};
use vcs_auth::TokenService;

use crate::control::srs_service::{clients_snapshot, radios_snapshot, CallContext};
use crate::control::{AuthService, SrsService};
use crate::metrics::METRICS;

/// Cadence of the stale-subscription sweep.
const STREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// A subscribed client is cut loose after this much registry silence.
const STREAM_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Outbound queue depth per connection.
const CONNECTION_QUEUE_CAPACITY: usize = 64;

struct StreamHandle {
    tx: mpsc::Sender<ServerMessage>,
    close: Arc<Notify>,
}

pub struct ControlServer {
    registry: Arc<Registry>,
    settings: Arc<SettingsState>,
    admin: Arc<AdminState>,
    bus: Arc<EventBus>,
    tokens: Arc<TokenService>,
    auth: Arc<AuthService>,
    srs: Arc<SrsService>,
    streams: Mutex<HashMap<Uuid, StreamHandle>>,
    local_addr: std::sync::OnceLock<SocketAddr>,
}

impl ControlServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        settings: Arc<SettingsState>,
        admin: Arc<AdminState>,
        bus: Arc<EventBus>,
        tokens: Arc<TokenService>,
        auth: Arc<AuthService>,
        srs: Arc<SrsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            settings,
            admin,
            bus,
            tokens,
            auth,
            srs,
            streams: Mutex::new(HashMap::new()),
            local_addr: std::sync::OnceLock::new(),
        })
    }

    /// The address the listener actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind and serve until the stop signal fires. In-flight connections
    /// observe the same signal and wind down on their own.
    pub async fn run(
        self: Arc<Self>,
        bind: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                self.admin.set_error(Service::Control, e.to_string());
                return Err(e).context(format!("failed to bind control listener on {bind}"));
            }
        };

        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        self.admin.set_running(Service::Control, true);
        info!(address = %bind, "control server started");

        let pusher = Arc::clone(&self);
        let mut push_stop = stop.clone();
        let push_handle = tokio::spawn(async move {
            let mut events = pusher.bus.subscribe(vcs_state::events::TOPIC_WILDCARD);
            loop {
                tokio::select! {
                    _ = push_stop.changed() => break,
                    event = events.recv() => match event {
                        Some(event) => pusher.push_update(event),
                        None => break,
                    },
                }
            }
        });

        let sweeper = Arc::clone(&self);
        let mut sweep_stop = stop.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAM_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = sweep_stop.changed() => break,
                    _ = interval.tick() => {
                        sweeper.sweep_streams(STREAM_MAX_AGE);
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("stopping control server");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "control accept error");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "control connection opened");

                    let server = Arc::clone(&self);
                    let conn_stop = stop.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer, conn_stop).await;
                    });
                }
            }
        }

        push_handle.abort();
        sweep_handle.abort();
        self.streams.lock().unwrap().clear();
        self.admin.set_running(Service::Control, false);
        info!("control server stopped");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) {
        METRICS.control_connections.inc();

        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(CONNECTION_QUEUE_CAPACITY);
        let close = Arc::new(Notify::new());

        let writer_handle = tokio::spawn(write_loop(writer, out_rx));

        // The client id this connection subscribed under, if any.
        let mut subscribed_as: Option<Uuid> = None;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = close.notified() => {
                    debug!(peer = %peer, "control stream closed by sweep");
                    break;
                }
                message = read_message::<_, ClientMessage>(&mut reader) => {
                    let message = match message {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "control read error");
                            break;
                        }
                    };

                    let request_id = message.request_id;
                    let body = self
                        .dispatch(message, &out_tx, &close, &mut subscribed_as)
                        .await;
                    let response = ServerMessage { request_id, body: Some(body) };
                    if out_tx.send(response).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Drop this connection's subscription unless a newer connection
        // already replaced it.
        if let Some(id) = subscribed_as {
            let mut streams = self.streams.lock().unwrap();
            if let Some(handle) = streams.get(&id) {
                if Arc::ptr_eq(&handle.close, &close) {
                    streams.remove(&id);
                }
            }
        }

        drop(out_tx);
        let _ = writer_handle.await;
        METRICS.control_connections.dec();
        debug!(peer = %peer, "control connection closed");
    }

    async fn dispatch(
        &self,
        message: ClientMessage,
        out_tx: &mpsc::Sender<ServerMessage>,
        close: &Arc<Notify>,
        subscribed_as: &mut Option<Uuid>,
    ) -> server_message::Body {
        use client_message::Body;

        let Some(body) = message.body else {
            return error_body(ErrorCode::InvalidRequest, "empty request body");
        };

        // Auth-flow methods skip the token interceptor.
        let body = match body {
            Body::InitAuth(req) => {
                return server_message::Body::InitAuth(self.auth.init_auth(req));
            }
            Body::GuestLogin(req) => {
                return server_message::Body::GuestLogin(self.auth.guest_login(req));
            }
            Body::DiscoverFlows(req) => {
                return server_message::Body::DiscoverFlows(self.auth.discover_flows(req).await);
            }
            Body::StartAuth(req) => {
                return server_message::Body::AuthStep(self.auth.start_auth(req).await);
            }
            Body::ContinueAuth(req) => {
                return server_message::Body::AuthStep(self.auth.continue_auth(req).await);
            }
            Body::UnitSelect(req) => {
                return server_message::Body::UnitSelect(self.auth.unit_select(req));
            }
            session_body => session_body,
        };

        let ctx = match self.authenticate(&message.token, required_role(&body)) {
            Ok(ctx) => ctx,
            Err(error) => return error,
        };

        match body {
            Body::SyncClient(_) => server_message::Body::Sync(self.srs.sync_client(ctx)),
            Body::GetServerSettings(_) => server_message::Body::ServerSettings(
                vcs_protocol::pb::ServerSettingsResponse {
                    success: true,
                    error_message: String::new(),
                    settings: Some(self.srs.server_settings()),
                },
            ),
            Body::UpdateClientInfo(req) => {
                server_message::Body::Status(self.srs.update_client_info(ctx, req))
            }
            Body::UpdateRadioInfo(req) => {
                server_message::Body::Status(self.srs.update_radio_info(ctx, req))
            }
            Body::Disconnect(_) => server_message::Body::Status(self.srs.disconnect(ctx)),
            Body::Subscribe(_) => {
                self.subscribe(ctx.client_id, out_tx.clone(), Arc::clone(close));
                *subscribed_as = Some(ctx.client_id);
                server_message::Body::Status(ServerResponse::ok())
            }
            Body::HealthCheck(_) => server_message::Body::HealthCheck(self.health_check()),
            // Auth-flow bodies were fully handled above.
            _ => error_body(ErrorCode::InvalidRequest, "unexpected request body"),
        }
    }

    /// The request interceptor: resolve the bearer token and enforce the
    /// per-method minimum role.
    fn authenticate(
        &self,
        token: &str,
        min_role: Role,
    ) -> Result<CallContext, server_message::Body> {
        if token.is_empty() {
            return Err(error_body(ErrorCode::Unauthenticated, "missing authorization token"));
        }
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let claims = self
            .tokens
            .verify(token, min_role, &self.settings.token_settings())
            .map_err(|e| match e {
                vcs_auth::TokenError::RoleInsufficient { .. } => {
                    error_body(ErrorCode::PermissionDenied, e.to_string())
                }
                _ => error_body(ErrorCode::Unauthenticated, "invalid token"),
            })?;

        let client_id = claims
            .client_id()
            .ok_or_else(|| error_body(ErrorCode::Unauthenticated, "invalid token"))?;
        let role = claims
            .role()
            .ok_or_else(|| error_body(ErrorCode::Unauthenticated, "invalid token"))?;

        Ok(CallContext { client_id, role })
    }

    /// Register (or replace) a client's push stream.
    fn subscribe(&self, client_id: Uuid, tx: mpsc::Sender<ServerMessage>, close: Arc<Notify>) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(previous) = streams.insert(client_id, StreamHandle { tx, close }) {
            // A reconnecting client replaces its dead stream.
            previous.close.notify_one();
            debug!(client_id = %client_id, "replaced existing update stream");
        }
        info!(client_id = %client_id, "client subscribed to updates");
    }

    /// Forward one bus event to every subscribed stream.
    fn push_update(&self, event: Event) {
        let update = self.build_update(&event);
        let message = ServerMessage {
            request_id: 0,
            body: Some(server_message::Body::Update(update)),
        };

        let mut streams = self.streams.lock().unwrap();
        streams.retain(|client_id, handle| match handle.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow consumer; it reconciles via SyncClient.
                debug!(client_id = %client_id, "update stream full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn build_update(&self, event: &Event) -> ServerUpdate {
        let mut update = ServerUpdate {
            topic: event.topic().to_string(),
            ..ServerUpdate::default()
        };

        match event {
            Event::ClientsChanged => {
                update.clients = clients_snapshot(&self.registry);
            }
            Event::RadiosChanged => {
                update.radios = radios_snapshot(&self.registry);
            }
            Event::SettingsChanged | Event::CoalitionsChanged => {
                update.settings = Some(self.srs.server_settings());
            }
            Event::Notification { title, message, severity } => {
                update.notification = Some(Notification {
                    title: title.clone(),
                    message: message.clone(),
                    severity: severity.as_str().to_string(),
                });
            }
            // Topic alone is enough; subscribers resync what they need.
            Event::BannedChanged | Event::AdminChanged => {}
        }

        update
    }

    /// Close the streams of clients that fell out of the registry or went
    /// silent past the threshold.
    fn sweep_streams(&self, max_age: Duration) {
        let now = std::time::SystemTime::now();
        let mut streams = self.streams.lock().unwrap();
        streams.retain(|client_id, handle| {
            let stale = match self.registry.get(*client_id) {
                None => true,
                Some(client) => now
                    .duration_since(client.last_update)
                    .map(|age| age > max_age)
                    .unwrap_or(false),
            };
            if stale {
                info!(client_id = %client_id, "closing stale update stream");
                handle.close.notify_one();
            }
            !stale
        });
    }

    fn health_check(&self) -> HealthCheckResponse {
        let voice = self.admin.status(Service::Voice);
        let control = self.admin.status(Service::Control);

        let mut services = HashMap::new();
        services.insert("voice".to_string(), serving_status(voice.running) as i32);
        services.insert("control".to_string(), serving_status(control.running) as i32);

        HealthCheckResponse {
            status: serving_status(self.admin.all_running()) as i32,
            services,
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!(error = %e, "control write error");
            break;
        }
    }
}

/// Minimum role per session method. Every current method is readable by
/// guests; the table exists so management methods added behind the admin
/// seam get a natural place to demand more.
fn required_role(body: &client_message::Body) -> Role {
    use client_message::Body;
    match body {
        Body::SyncClient(_)
        | Body::GetServerSettings(_)
        | Body::UpdateClientInfo(_)
        | Body::UpdateRadioInfo(_)
        | Body::Disconnect(_)
        | Body::Subscribe(_)
        | Body::HealthCheck(_) => Role::Guest,
        // Auth-flow methods never reach the interceptor.
        _ => Role::Guest,
    }
}

fn serving_status(running: bool) -> ServingStatus {
    if running {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    }
}

fn error_body(code: ErrorCode, message: impl Into<String>) -> server_message::Body {
    server_message::Body::Error(ErrorResponse {
        code: code as i32,
        message: message.into(),
    })
}
