//! Radio service
//!
//! The token-guarded session methods: state sync, identity and radio
//! updates, disconnect. The interceptor in the control server resolves the
//! bearer token into a [`CallContext`] before any of these run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;
use vcs_protocol::pb::{
    ClientInfo, CoalitionSelection, Radio as PbRadio, RadioInfo, ServerResponse, ServerSettings,
    SyncResponse, UpdateClientInfoRequest, UpdateRadioInfoRequest,
};
use vcs_state::{
    Event, EventBus, IdentityUpdate, Radio, Registry, RegistryError, Role, SettingsState,
};

use crate::metrics::METRICS;

/// Identity extracted from a verified bearer token.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub client_id: Uuid,
    pub role: Role,
}

pub struct SrsService {
    registry: Arc<Registry>,
    settings: Arc<SettingsState>,
    bus: Arc<EventBus>,
}

impl SrsService {
    pub fn new(registry: Arc<Registry>, settings: Arc<SettingsState>, bus: Arc<EventBus>) -> Self {
        Self { registry, settings, bus }
    }

    /// Full snapshot of clients, radios and the public settings.
    pub fn sync_client(&self, _ctx: CallContext) -> SyncResponse {
        SyncResponse {
            success: true,
            error_message: String::new(),
            clients: clients_snapshot(&self.registry),
            radios: radios_snapshot(&self.registry),
            settings: Some(build_server_settings(&self.settings)),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        build_server_settings(&self.settings)
    }

    /// Per-field identity update; rejected fields are reported back while
    /// the valid rest is applied.
    pub fn update_client_info(
        &self,
        ctx: CallContext,
        request: UpdateClientInfoRequest,
    ) -> ServerResponse {
        let mut update = IdentityUpdate {
            display_name: non_empty(request.name),
            unit_id: non_empty(request.unit_id),
            coalition: non_empty(request.coalition),
            role: None,
        };

        let mut rejections = Vec::new();
        match u8::try_from(request.role).ok().and_then(Role::from_u8) {
            Some(role) => update.role = Some(role),
            None => rejections.push("Invalid role id.".to_string()),
        }

        let settings = Arc::clone(&self.settings);
        match self.registry.update_identity(ctx.client_id, update, |name| {
            settings.coalition_exists(name)
        }) {
            Ok(applied_rejections) => rejections.extend(applied_rejections),
            Err(RegistryError::ClientNotFound) => {
                warn!(client_id = %ctx.client_id, "identity update for unknown client");
                return ServerResponse::error(
                    "Internal error: You may already have been disconnected.",
                );
            }
            Err(e) => return ServerResponse::error(e.to_string()),
        }

        // Some fields may have been applied even when others were
        // rejected, so subscribers still need the change event.
        self.bus.publish(Event::ClientsChanged);

        if rejections.is_empty() {
            info!(client_id = %ctx.client_id, "client info updated");
            ServerResponse::ok()
        } else {
            ServerResponse::error(format!(
                "Errors occurred while updating client info: \n - {}",
                rejections.join("\n - ")
            ))
        }
    }

    /// Wholesale radio replacement. The client owns its radio state; only
    /// the configured per-user limit is enforced.
    pub fn update_radio_info(
        &self,
        ctx: CallContext,
        request: UpdateRadioInfoRequest,
    ) -> ServerResponse {
        let radios: Vec<Radio> = request.radios.into_iter().map(radio_from_pb).collect();
        let limit = self.settings.max_radios_per_user();

        match self.registry.replace_radios(ctx.client_id, radios, limit) {
            Ok(()) => {
                self.bus.publish(Event::RadiosChanged);
                ServerResponse::ok()
            }
            Err(RegistryError::ClientNotFound) => ServerResponse::error(
                "Internal error: We could not find your radios, please try logging in again.",
            ),
            Err(e @ RegistryError::RadioLimitExceeded { .. }) => {
                ServerResponse::error(e.to_string())
            }
        }
    }

    /// Remove the caller from the registry.
    pub fn disconnect(&self, ctx: CallContext) -> ServerResponse {
        if !self.registry.remove(ctx.client_id) {
            return ServerResponse::error(
                "Internal error: You may already have been disconnected.",
            );
        }
        METRICS.registered_clients.set(self.registry.len() as i64);
        info!(client_id = %ctx.client_id, "client disconnected");
        self.bus.publish(Event::ClientsChanged);
        ServerResponse::ok()
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

pub fn clients_snapshot(registry: &Registry) -> HashMap<String, ClientInfo> {
    registry
        .all_clients()
        .into_iter()
        .map(|c| {
            (
                c.id.to_string(),
                ClientInfo {
                    name: c.display_name.clone(),
                    unit_id: c.unit_id.clone(),
                    coalition: c.coalition.clone(),
                    role: u32::from(c.role.as_u8()),
                    last_update: c.last_update_unix(),
                },
            )
        })
        .collect()
}

pub fn radios_snapshot(registry: &Registry) -> HashMap<String, RadioInfo> {
    let last_updates: HashMap<Uuid, i64> = registry
        .all_clients()
        .into_iter()
        .map(|c| (c.id, c.last_update_unix()))
        .collect();

    registry
        .all_radios()
        .into_iter()
        .map(|(id, record)| {
            (
                id.to_string(),
                RadioInfo {
                    radios: record.radios.iter().map(radio_to_pb).collect(),
                    muted: record.muted,
                    last_update: last_updates.get(&id).copied().unwrap_or(0),
                },
            )
        })
        .collect()
}

/// The public slice of the settings, shared with every client.
pub fn build_server_settings(settings: &SettingsState) -> ServerSettings {
    settings.read(|s| ServerSettings {
        coalitions: s
            .coalitions
            .iter()
            .map(|c| CoalitionSelection {
                name: c.name.clone(),
                description: c.description.clone(),
                color: c.color.clone(),
            })
            .collect(),
        test_frequencies: s.frequencies.test.clone(),
        global_frequencies: s.frequencies.global.clone(),
        max_radios_per_client: s.general.max_radios_per_user,
    })
}

fn radio_from_pb(radio: PbRadio) -> Radio {
    Radio {
        id: radio.id,
        name: radio.name,
        frequency_khz: radio.frequency_khz,
        enabled: radio.enabled,
        is_intercom: radio.is_intercom,
    }
}

fn radio_to_pb(radio: &Radio) -> PbRadio {
    PbRadio {
        id: radio.id,
        name: radio.name.clone(),
        frequency_khz: radio.frequency_khz,
        enabled: radio.enabled,
        is_intercom: radio.is_intercom,
    }
}
