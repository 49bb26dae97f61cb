//! Authentication service
//!
//! Drives guest logins and multi-step plugin logins. Clients start with
//! `InitAuth`, which allocates their id and a 20-minute login window;
//! guest logins promote straight into the registry, plugin logins run
//! through `StartAuth`/`ContinueAuth` against the plugin channel, then
//! pick a unit with `UnitSelect`. Expired login sessions are reaped on
//! every entry point before any request is looked at.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};
use uuid::Uuid;
use vcs_auth::{generate_secret, secrets_match, verify_password, TokenService};
use vcs_protocol::pb::{
    AuthFlowResponse, AuthFlowState, ClientCapabilities, ClientFeature, CoalitionSelection,
    ContinueAuthRequest, DiscoverFlowsRequest, DiscoverFlowsResponse, DistributionMode as PbMode,
    GuestLoginRequest, GuestLoginResponse, InitAuthRequest, InitAuthResponse, RoleSelection,
    StartAuthRequest, UnitSelectRequest, UnitSelectResponse, UnitSelection,
};
use vcs_state::{
    registry::{is_valid_display_name, is_valid_unit_id},
    ClientRecord, Event, EventBus, Registry, Role, SettingsState,
};

use crate::app::DistributionMode;
use crate::metrics::METRICS;
use crate::plugin::{PluginClient, PluginError, PluginManager};

/// Client protocol versions the server accepts.
const SUPPORTED_CLIENT_VERSION: &str = "0.1.0";

/// Window between `InitAuth` and a completed login.
const PRE_LOGIN_WINDOW: Duration = Duration::from_secs(20 * 60);

/// Window between plugin completion and `UnitSelect`.
const UNIT_SELECT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// An in-progress login.
struct AuthenticatingClient {
    secret: Option<String>,
    expires: SystemTime,
    player_name: String,
    available_roles: Vec<u8>,
    available_units: Vec<UnitSelection>,
    plugin_name: Option<String>,
    session_id: Option<String>,
}

impl AuthenticatingClient {
    fn new() -> Self {
        Self {
            secret: None,
            expires: SystemTime::now() + PRE_LOGIN_WINDOW,
            player_name: String::new(),
            available_roles: Vec::new(),
            available_units: Vec::new(),
            plugin_name: None,
            session_id: None,
        }
    }
}

pub struct AuthService {
    registry: Arc<Registry>,
    settings: Arc<SettingsState>,
    bus: Arc<EventBus>,
    tokens: Arc<TokenService>,
    plugins: Arc<PluginManager>,
    mode: DistributionMode,
    authenticating: Mutex<HashMap<Uuid, AuthenticatingClient>>,
}

impl AuthService {
    pub fn new(
        registry: Arc<Registry>,
        settings: Arc<SettingsState>,
        bus: Arc<EventBus>,
        tokens: Arc<TokenService>,
        plugins: Arc<PluginManager>,
        mode: DistributionMode,
    ) -> Self {
        Self {
            registry,
            settings,
            bus,
            tokens,
            plugins,
            mode,
            authenticating: Mutex::new(HashMap::new()),
        }
    }

    /// First contact: version and capability gate, then a fresh client id
    /// with a 20-minute login window.
    pub fn init_auth(&self, request: InitAuthRequest) -> InitAuthResponse {
        self.prune_expired();

        if let Err(message) = self.check_capabilities(request.capabilities.as_ref()) {
            METRICS.auth_failures.inc();
            return InitAuthResponse {
                success: false,
                error_message: message,
                ..InitAuthResponse::default()
            };
        }

        let client_guid = Uuid::new_v4();
        self.authenticating
            .lock()
            .unwrap()
            .insert(client_guid, AuthenticatingClient::new());

        let available_plugins = if self.settings.plugin_auth_enabled() {
            self.settings.enabled_plugin_names()
        } else {
            Vec::new()
        };

        debug!(client_guid = %client_guid, "auth initialised");
        InitAuthResponse {
            success: true,
            error_message: String::new(),
            client_guid: client_guid.to_string(),
            distribution_mode: self.pb_mode() as i32,
            available_plugins,
            has_guest_login: self.settings.guest_auth_enabled(),
        }
    }

    /// Guest login: the password selects the coalition, the client is
    /// promoted with the Guest role and handed a token.
    pub fn guest_login(&self, request: GuestLoginRequest) -> GuestLoginResponse {
        self.prune_expired();

        let fail = |message: &str| {
            METRICS.auth_failures.inc();
            GuestLoginResponse {
                success: false,
                error_message: message.to_string(),
                ..GuestLoginResponse::default()
            }
        };

        if !self.settings.guest_auth_enabled() {
            return fail("Guest login is disabled");
        }
        if let Err(message) = self.check_capabilities(request.capabilities.as_ref()) {
            METRICS.auth_failures.inc();
            return GuestLoginResponse {
                success: false,
                error_message: message,
                ..GuestLoginResponse::default()
            };
        }
        if !is_valid_display_name(&request.name) {
            return fail("Invalid username");
        }
        if !is_valid_unit_id(&request.unit_id) {
            return fail("Invalid UnitId");
        }

        let Some(client_guid) = self.lookup_authenticating(&request.client_guid) else {
            return fail("Unknown or expired login session, start over with InitAuth");
        };

        // Try the password against every coalition; the first match wins.
        // bcrypt keeps each comparison constant-time.
        let coalitions = self.settings.read(|s| s.coalitions.clone());
        let selected = coalitions
            .iter()
            .find(|c| verify_password(&request.password, &c.password_hash));
        let Some(coalition) = selected else {
            debug!(name = %request.name, "guest login with unknown coalition password");
            return fail("No Coalition found with that password");
        };

        let _ = self.take_authenticating(&request.client_guid);
        self.registry.add(ClientRecord::new(
            client_guid,
            request.name.clone(),
            request.unit_id.clone(),
            coalition.name.clone(),
            Role::Guest,
        ));
        self.bus.publish(Event::ClientsChanged);
        METRICS.registered_clients.set(self.registry.len() as i64);

        let token = match self
            .tokens
            .generate(client_guid, Role::Guest, &self.settings.token_settings())
        {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to generate guest token");
                self.registry.remove(client_guid);
                return fail("Failed to generate token");
            }
        };

        METRICS.auth_successes.inc();
        info!(
            name = %request.name,
            unit_id = %request.unit_id,
            coalition = %coalition.name,
            client_guid = %client_guid,
            "guest login succeeded"
        );
        GuestLoginResponse {
            success: true,
            error_message: String::new(),
            token,
            client_guid: client_guid.to_string(),
            coalition: coalition.name.clone(),
        }
    }

    /// Ask a plugin which flows it offers, mapped to the client schema.
    pub async fn discover_flows(&self, request: DiscoverFlowsRequest) -> DiscoverFlowsResponse {
        self.prune_expired();

        let fail = |message: String| DiscoverFlowsResponse {
            success: false,
            error_message: message,
            flows: Vec::new(),
        };

        let Some(client) = self.enabled_plugin(&request.plugin) else {
            return fail(format!("Plugin '{}' is not available", request.plugin));
        };

        match client.discover_flows().await {
            Ok(flows) => DiscoverFlowsResponse {
                success: true,
                error_message: String::new(),
                flows,
            },
            Err(e) => fail(plugin_error_message(&e)),
        }
    }

    /// First step of a plugin flow.
    pub async fn start_auth(&self, request: StartAuthRequest) -> AuthFlowResponse {
        self.prune_expired();

        let Some(client_guid) = self.lookup_authenticating(&request.client_guid) else {
            return flow_failure("Unknown or expired login session, start over with InitAuth");
        };
        let Some(plugin) = self.enabled_plugin(&request.plugin) else {
            return flow_failure(&format!("Plugin '{}' is not available", request.plugin));
        };

        match plugin.start_auth(request.flow_id, request.first_step_input).await {
            Ok(step) => self.apply_plugin_step(client_guid, Some(request.plugin), step),
            Err(e) => {
                METRICS.auth_failures.inc();
                flow_failure(&plugin_error_message(&e))
            }
        }
    }

    /// Subsequent steps of a plugin flow. The session must belong to the
    /// authenticating client that started it.
    pub async fn continue_auth(&self, request: ContinueAuthRequest) -> AuthFlowResponse {
        self.prune_expired();

        let Some(client_guid) = Uuid::parse_str(&request.client_guid).ok() else {
            return flow_failure("Problem verifying client");
        };
        let session = {
            let authenticating = self.authenticating.lock().unwrap();
            authenticating.get(&client_guid).map(|entry| {
                (
                    entry.plugin_name.clone(),
                    entry.session_id.as_deref() == Some(request.session_id.as_str()),
                )
            })
        };
        let Some((plugin_name, owns_session)) = session else {
            return flow_failure("Unknown or expired login session, start over with InitAuth");
        };
        if !owns_session {
            METRICS.auth_failures.inc();
            return flow_failure("Problem verifying client");
        }
        let Some(plugin) = plugin_name.as_deref().and_then(|n| self.enabled_plugin(n)) else {
            return flow_failure("Plugin is no longer available");
        };

        match plugin.continue_auth(request.session_id, request.step_data).await {
            Ok(step) => self.apply_plugin_step(client_guid, plugin_name, step),
            Err(e) => {
                METRICS.auth_failures.inc();
                flow_failure(&plugin_error_message(&e))
            }
        }
    }

    /// Final step after a completed plugin flow: validate the secret and
    /// the selections, then promote into the registry.
    pub fn unit_select(&self, request: UnitSelectRequest) -> UnitSelectResponse {
        self.prune_expired();

        let fail = |message: &str| {
            METRICS.auth_failures.inc();
            UnitSelectResponse {
                success: false,
                error_message: message.to_string(),
                token: String::new(),
            }
        };

        let Ok(client_guid) = Uuid::parse_str(&request.client_guid) else {
            return fail("Problem verifying client");
        };

        let promoted = {
            let mut authenticating = self.authenticating.lock().unwrap();
            let Some(entry) = authenticating.get(&client_guid) else {
                return fail("Problem verifying client");
            };

            let secret_ok = entry
                .secret
                .as_deref()
                .map(|s| secrets_match(&request.secret, s))
                .unwrap_or(false);
            if !secret_ok {
                warn!(client_guid = %client_guid, "unit select with bad secret");
                return fail("Problem verifying client");
            }

            let Some(role) = u8::try_from(request.role).ok().and_then(Role::from_u8) else {
                return fail("Invalid Role");
            };
            if !entry.available_roles.contains(&role.as_u8()) {
                return fail("Invalid Role");
            }

            // The unit may come from the plugin's list or be any
            // syntactically valid tag.
            let unit_known =
                entry.available_units.iter().any(|u| u.unit_id == request.unit_id);
            if !unit_known && !is_valid_unit_id(&request.unit_id) {
                return fail("Invalid UnitId");
            }

            if !self.settings.coalition_exists(&request.coalition) {
                return fail("Invalid Coalition");
            }

            let entry = authenticating.remove(&client_guid).unwrap();
            ClientRecord::new(
                client_guid,
                entry.player_name,
                request.unit_id.clone(),
                request.coalition.clone(),
                role,
            )
        };

        let role = promoted.role;
        self.registry.add(promoted);
        self.bus.publish(Event::ClientsChanged);
        METRICS.registered_clients.set(self.registry.len() as i64);

        let token = match self
            .tokens
            .generate(client_guid, role, &self.settings.token_settings())
        {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to generate token after unit select");
                self.registry.remove(client_guid);
                return fail("Failed to generate token");
            }
        };

        METRICS.auth_successes.inc();
        info!(client_guid = %client_guid, unit_id = %request.unit_id, "unit select succeeded");
        UnitSelectResponse {
            success: true,
            error_message: String::new(),
            token,
        }
    }

    /// Map a plugin step result onto the authenticating client and build
    /// the client-facing response. Plugin-internal configuration never
    /// reaches the client; only the step schema does.
    fn apply_plugin_step(
        &self,
        client_guid: Uuid,
        plugin_name: Option<String>,
        step: vcs_protocol::pb::PluginAuthStepResponse,
    ) -> AuthFlowResponse {
        match AuthFlowState::try_from(step.state).unwrap_or(AuthFlowState::Failed) {
            AuthFlowState::Continue => {
                let mut authenticating = self.authenticating.lock().unwrap();
                if let Some(entry) = authenticating.get_mut(&client_guid) {
                    entry.plugin_name = plugin_name;
                    entry.session_id = Some(step.session_id.clone());
                }
                AuthFlowResponse {
                    success: true,
                    state: AuthFlowState::Continue as i32,
                    session_id: step.session_id,
                    next_step: step.next_step,
                    ..AuthFlowResponse::default()
                }
            }
            AuthFlowState::Complete => {
                let secret = generate_secret();
                {
                    let mut authenticating = self.authenticating.lock().unwrap();
                    if let Some(entry) = authenticating.get_mut(&client_guid) {
                        entry.secret = Some(secret.clone());
                        entry.expires = SystemTime::now() + UNIT_SELECT_WINDOW;
                        entry.player_name = step.player_name.clone();
                        entry.available_units = step.available_units.clone();
                        entry.available_roles = step
                            .available_roles
                            .iter()
                            .filter_map(|r| u8::try_from(*r).ok())
                            .collect();
                    }
                }

                let available_roles = step
                    .available_roles
                    .iter()
                    .filter_map(|r| u8::try_from(*r).ok().and_then(Role::from_u8))
                    .map(|role| RoleSelection {
                        id: u32::from(role.as_u8()),
                        name: role.name().to_string(),
                    })
                    .collect();
                let available_coalitions = self.settings.read(|s| {
                    s.coalitions
                        .iter()
                        .map(|c| CoalitionSelection {
                            name: c.name.clone(),
                            description: c.description.clone(),
                            color: c.color.clone(),
                        })
                        .collect()
                });

                info!(client_guid = %client_guid, player = %step.player_name, "plugin auth complete");
                AuthFlowResponse {
                    success: true,
                    state: AuthFlowState::Complete as i32,
                    secret,
                    player_name: step.player_name,
                    available_roles,
                    available_units: step.available_units,
                    available_coalitions,
                    ..AuthFlowResponse::default()
                }
            }
            AuthFlowState::Failed => {
                METRICS.auth_failures.inc();
                debug!(client_guid = %client_guid, message = %step.message, "plugin auth failed");
                flow_failure(&step.message)
            }
        }
    }

    /// Version + distribution capability gate shared by the entry points.
    fn check_capabilities(&self, capabilities: Option<&ClientCapabilities>) -> Result<(), String> {
        let Some(capabilities) = capabilities else {
            return Err("Missing client capabilities".to_string());
        };
        if capabilities.version != SUPPORTED_CLIENT_VERSION {
            return Err("Unsupported version".to_string());
        }

        let compatible = capabilities.supported_features.iter().any(|feature| {
            match ClientFeature::try_from(*feature) {
                Ok(ClientFeature::Standalone) => self.mode == DistributionMode::Standalone,
                Ok(ClientFeature::Distributed) => self.mode == DistributionMode::Control,
                Err(_) => false,
            }
        });
        if !compatible {
            return Err(format!(
                "Unsupported distribution capabilities, currently running: {}",
                self.mode
            ));
        }
        Ok(())
    }

    /// Drop every expired login session.
    fn prune_expired(&self) {
        let now = SystemTime::now();
        let mut authenticating = self.authenticating.lock().unwrap();
        authenticating.retain(|id, entry| {
            let keep = entry.expires >= now;
            if !keep {
                debug!(client_guid = %id, "removing expired authenticating client");
            }
            keep
        });
    }

    /// Parse and look up an authenticating client id without consuming it.
    fn lookup_authenticating(&self, guid: &str) -> Option<Uuid> {
        let id = Uuid::parse_str(guid).ok()?;
        self.authenticating.lock().unwrap().contains_key(&id).then_some(id)
    }

    /// Remove and return an authenticating client id, for promotions.
    fn take_authenticating(&self, guid: &str) -> Option<Uuid> {
        let id = Uuid::parse_str(guid).ok()?;
        self.authenticating.lock().unwrap().remove(&id).map(|_| id)
    }

    fn enabled_plugin(&self, name: &str) -> Option<Arc<PluginClient>> {
        if !self.settings.plugin_auth_enabled() {
            return None;
        }
        if !self.settings.plugin(name).map(|p| p.enabled).unwrap_or(false) {
            return None;
        }
        self.plugins.client(name)
    }

    fn pb_mode(&self) -> PbMode {
        match self.mode {
            DistributionMode::Standalone => PbMode::Standalone,
            DistributionMode::Control => PbMode::Control,
            DistributionMode::Voice => PbMode::Voice,
        }
    }
}

fn flow_failure(message: &str) -> AuthFlowResponse {
    AuthFlowResponse {
        success: false,
        error_message: message.to_string(),
        state: AuthFlowState::Failed as i32,
        ..AuthFlowResponse::default()
    }
}

fn plugin_error_message(error: &PluginError) -> String {
    match error {
        PluginError::Unavailable(_) => "Authentication plugin is unavailable".to_string(),
        PluginError::Rejected(message) => message.clone(),
        PluginError::Timeout => "Authentication plugin timed out".to_string(),
    }
}
