//! Application wiring
//!
//! `VcsApplication` owns every subsystem as an explicit, injected value:
//! states and bus first, then the servers on top. Construction follows the
//! startup order settings → banned list → token keys → registry → control
//! server → voice server; shutdown walks the servers back down in reverse.
//!
//! Admin operations (kick/ban/mute) live here: this is the seam the
//! out-of-scope GUI and REST layers call into.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;
use vcs_auth::TokenService;
use vcs_state::{
    AdminState, BannedClient, BannedState, Event, EventBus, Registry, SettingsState, Severity,
};

use crate::control::{AuthService, ControlServer, SrsService};
use crate::metrics::{self, METRICS};
use crate::plugin::PluginManager;
use crate::voice::VoiceServer;

/// Cadence of the registry liveness sweep.
const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// A registry entry is dropped after this much silence.
const REGISTRY_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Which servers this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionMode {
    /// Control and voice in one process.
    Standalone,
    /// Control plane only, for a control node fronting voice nodes.
    Control,
    /// Voice relay only.
    Voice,
}

impl DistributionMode {
    pub fn runs_control(self) -> bool {
        matches!(self, DistributionMode::Standalone | DistributionMode::Control)
    }

    pub fn runs_voice(self) -> bool {
        matches!(self, DistributionMode::Standalone | DistributionMode::Voice)
    }
}

impl std::str::FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(DistributionMode::Standalone),
            "control" => Ok(DistributionMode::Control),
            "voice" => Ok(DistributionMode::Voice),
            other => Err(format!(
                "invalid distribution mode '{other}', must be one of: standalone, control, voice"
            )),
        }
    }
}

impl std::fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistributionMode::Standalone => write!(f, "Standalone"),
            DistributionMode::Control => write!(f, "Control"),
            DistributionMode::Voice => write!(f, "Voice"),
        }
    }
}

/// The running application.
pub struct VcsApplication {
    pub registry: Arc<Registry>,
    pub settings: Arc<SettingsState>,
    pub banned: Arc<BannedState>,
    pub admin: Arc<AdminState>,
    pub bus: Arc<EventBus>,
    pub tokens: Arc<TokenService>,
    pub plugins: Arc<PluginManager>,
    pub voice: Arc<VoiceServer>,
    control: Arc<ControlServer>,
    mode: DistributionMode,

    voice_stop: watch::Sender<bool>,
    control_stop: watch::Sender<bool>,
    background_stop: watch::Sender<bool>,
    voice_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    control_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl VcsApplication {
    /// Build every subsystem. Fails fast on unreadable settings, a broken
    /// ban list or unusable token keys.
    pub fn new(
        config_path: &Path,
        banned_path: &Path,
        mode: DistributionMode,
    ) -> anyhow::Result<Self> {
        let settings = Arc::new(
            SettingsState::load(config_path)
                .with_context(|| format!("failed to load settings from {}", config_path.display()))?,
        );
        let banned = Arc::new(
            BannedState::load(banned_path).with_context(|| {
                format!("failed to load banned clients from {}", banned_path.display())
            })?,
        );

        let tokens = Arc::new(TokenService::new());
        if mode.runs_control() {
            tokens
                .ensure_keys(&settings.token_settings())
                .context("failed to load or generate token keys")?;
        }

        let registry = Arc::new(Registry::new());
        let admin = Arc::new(AdminState::new());
        let bus = EventBus::new();

        let (background_stop, background_rx) = watch::channel(false);
        let plugins = Arc::new(PluginManager::from_settings(&settings, background_rx));

        let auth = Arc::new(AuthService::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
            Arc::clone(&bus),
            Arc::clone(&tokens),
            Arc::clone(&plugins),
            mode,
        ));
        let srs = Arc::new(SrsService::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
            Arc::clone(&bus),
        ));
        let control = ControlServer::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
            Arc::clone(&admin),
            Arc::clone(&bus),
            Arc::clone(&tokens),
            auth,
            srs,
        );
        let voice = VoiceServer::new(
            Arc::clone(&registry),
            Arc::clone(&settings),
            Arc::clone(&banned),
            Arc::clone(&admin),
        );

        let (voice_stop, _) = watch::channel(false);
        let (control_stop, _) = watch::channel(false);

        Ok(Self {
            registry,
            settings,
            banned,
            admin,
            bus,
            tokens,
            plugins,
            voice,
            control,
            mode,
            voice_stop,
            control_stop,
            background_stop,
            voice_handle: Mutex::new(None),
            control_handle: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> DistributionMode {
        self.mode
    }

    /// Address the control listener bound, once running.
    pub fn control_addr(&self) -> Option<std::net::SocketAddr> {
        self.control.local_addr()
    }

    /// Address the voice socket bound, once running.
    pub fn voice_addr(&self) -> Option<std::net::SocketAddr> {
        self.voice.local_addr()
    }

    /// Start every server this mode calls for. Bind failures are fatal.
    pub async fn start_servers(&self) -> anyhow::Result<()> {
        let (control_bind, voice_bind, monitoring) = self.settings.read(|s| {
            (s.network.control_bind, s.network.voice_bind, s.monitoring.clone())
        });

        metrics::start_server(monitoring.prometheus_bind, monitoring.prometheus_enabled);

        if self.mode.runs_control() {
            let server = Arc::clone(&self.control);
            let stop = self.control_stop.subscribe();
            let handle = tokio::spawn(server.run(control_bind, stop));
            // Give the listener a beat to come up, then check it did not
            // die on bind.
            tokio::time::sleep(Duration::from_millis(50)).await;
            if handle.is_finished() {
                let result = handle.await.context("control server task panicked")?;
                return Err(result
                    .err()
                    .unwrap_or_else(|| anyhow::anyhow!("control server exited at startup")));
            }
            *self.control_handle.lock().unwrap() = Some(handle);

            if self.settings.plugin_auth_enabled() {
                self.plugins.start().await;
            }
        }

        if self.mode.runs_voice() {
            let server = Arc::clone(&self.voice);
            let stop = self.voice_stop.subscribe();
            let handle = tokio::spawn(server.run(voice_bind, stop));
            tokio::time::sleep(Duration::from_millis(50)).await;
            if handle.is_finished() {
                let result = handle.await.context("voice server task panicked")?;
                return Err(result
                    .err()
                    .unwrap_or_else(|| anyhow::anyhow!("voice server exited at startup")));
            }
            *self.voice_handle.lock().unwrap() = Some(handle);
        }

        self.spawn_registry_sweep();
        self.bus.publish(Event::AdminChanged);
        info!(mode = %self.mode, "servers started");
        Ok(())
    }

    /// Stop servers in reverse startup order: voice first, then control,
    /// then the background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down");

        let _ = self.voice_stop.send(true);
        let voice_handle = self.voice_handle.lock().unwrap().take();
        if let Some(handle) = voice_handle {
            if let Ok(Err(e)) = handle.await {
                warn!(error = %e, "voice server exited with error");
            }
        }

        let _ = self.control_stop.send(true);
        let control_handle = self.control_handle.lock().unwrap().take();
        if let Some(handle) = control_handle {
            if let Ok(Err(e)) = handle.await {
                warn!(error = %e, "control server exited with error");
            }
        }

        let _ = self.background_stop.send(true);
        info!("shutdown complete");
    }

    /// Periodically evict registry entries that stopped updating. Runs
    /// for the life of the application.
    fn spawn_registry_sweep(&self) {
        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        let mut stop = self.background_stop.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REGISTRY_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        let evicted = registry.sweep_stale(REGISTRY_MAX_AGE);
                        if !evicted.is_empty() {
                            for id in &evicted {
                                info!(client_id = %id, "removed stale client from registry");
                            }
                            METRICS.registered_clients.set(registry.len() as i64);
                            bus.publish(Event::ClientsChanged);
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Admin seam
    // ------------------------------------------------------------------

    /// Kick a client: drop it from the registry and the voice relay.
    pub fn kick_client(&self, id: Uuid, reason: &str) -> bool {
        if !self.registry.remove(id) {
            self.notify("Kick failed", "Client not found", Severity::Error);
            return false;
        }
        self.voice.drop_binding(id);
        METRICS.registered_clients.set(self.registry.len() as i64);
        info!(client_id = %id, reason, "client kicked");
        self.bus.publish(Event::ClientsChanged);
        self.notify("Kick succeeded", "Client kicked successfully", Severity::Success);
        true
    }

    /// Ban a client: persist the ban, then kick.
    pub fn ban_client(&self, id: Uuid, reason: &str) -> bool {
        let Some(record) = self.registry.get(id) else {
            self.notify("Ban failed", "Client not found", Severity::Error);
            return false;
        };

        let ip_address = self
            .voice
            .binding_ip(id)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let entry = BannedClient {
            id,
            display_name: record.display_name,
            ip_address,
            reason: reason.to_string(),
        };
        if let Err(e) = self.banned.ban(entry) {
            warn!(error = %e, "failed to save banned clients");
            self.notify("Ban failed", "Failed to save banned clients", Severity::Error);
            return false;
        }

        self.registry.remove(id);
        self.voice.drop_binding(id);
        METRICS.registered_clients.set(self.registry.len() as i64);
        info!(client_id = %id, reason, "client banned");
        self.bus.publish(Event::ClientsChanged);
        self.bus.publish(Event::BannedChanged);
        self.notify("Ban succeeded", "Client banned successfully", Severity::Success);
        true
    }

    /// Lift a ban.
    pub fn unban_client(&self, id: Uuid) -> bool {
        match self.banned.unban(id) {
            Ok(true) => {
                self.bus.publish(Event::BannedChanged);
                self.notify("Unban succeeded", "Client successfully unbanned", Severity::Success);
                true
            }
            Ok(false) => {
                self.notify("Unban failed", "Client not found", Severity::Error);
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to save banned clients");
                self.notify("Unban failed", "Failed to save banned clients", Severity::Error);
                false
            }
        }
    }

    /// Server-enforced gag: a muted client still transmits but is removed
    /// from every receiver set.
    pub fn set_client_muted(&self, id: Uuid, muted: bool) -> bool {
        if self.registry.set_muted(id, muted).is_err() {
            self.notify("Mute failed", "Client not found", Severity::Error);
            return false;
        }
        info!(client_id = %id, muted, "client mute changed");
        self.bus.publish(Event::RadiosChanged);
        true
    }

    /// Persist the settings after an admin edit and tell subscribers.
    pub fn save_settings(&self) -> anyhow::Result<()> {
        self.settings.save().context("failed to save settings")?;
        self.bus.publish(Event::SettingsChanged);
        Ok(())
    }

    fn notify(&self, title: &str, message: &str, severity: Severity) {
        self.bus.publish(Event::notification(title, message, severity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcs_state::ClientRecord;

    fn test_app(dir: &Path) -> VcsApplication {
        let config_path = dir.join("config.yaml");
        // An empty mapping loads as all-default settings.
        std::fs::write(&config_path, "{}\n").unwrap();
        VcsApplication::new(&config_path, &dir.join("banned.json"), DistributionMode::Voice)
            .unwrap()
    }

    fn join(app: &VcsApplication, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        app.registry.add(ClientRecord::new(
            id,
            name.to_string(),
            "AB1".to_string(),
            "red".to_string(),
            vcs_state::Role::Member,
        ));
        id
    }

    #[tokio::test]
    async fn test_kick_removes_client() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let id = join(&app, "Mallory");

        assert!(app.kick_client(id, "being rude"));
        assert!(!app.registry.contains(id));
        assert!(!app.kick_client(id, "again"));
    }

    #[tokio::test]
    async fn test_ban_persists_and_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let id = join(&app, "Mallory");

        assert!(app.ban_client(id, "abuse"));
        assert!(!app.registry.contains(id));
        assert!(app.banned.is_banned(id));

        assert!(app.unban_client(id));
        assert!(!app.banned.is_banned(id));
        assert!(!app.unban_client(id));
    }

    #[tokio::test]
    async fn test_mute_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let id = join(&app, "Bob");

        assert!(app.set_client_muted(id, true));
        assert!(app.registry.is_muted(id));
        assert!(app.set_client_muted(id, false));
        assert!(!app.registry.is_muted(id));

        assert!(!app.set_client_muted(Uuid::new_v4(), true));
    }
}
