//! Server settings
//!
//! Loaded from a YAML file at startup and kept behind a reader-writer lock.
//! Reads dominate (the voice fan-out checks frequencies on every packet);
//! writes only happen through the admin seam, followed by [`SettingsState::save`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A coalition clients can join. The shared password is stored as a bcrypt
/// hash, never in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coalition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Frequencies {
    /// Loopback frequencies in kHz: audio is echoed to the sender only.
    #[serde(default)]
    pub test: Vec<u32>,
    /// Frequencies in kHz that bypass the same-coalition check.
    #[serde(default)]
    pub global: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "default_max_radios")]
    pub max_radios_per_user: u32,
}

fn default_max_radios() -> u32 {
    10
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self { max_radios_per_user: default_max_radios() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default = "default_true")]
    pub enable_guest_auth: bool,
    #[serde(default)]
    pub enable_plugin_auth: bool,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub token: TokenSettings,
}

fn default_true() -> bool {
    true
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enable_guest_auth: true,
            enable_plugin_auth: false,
            plugins: Vec::new(),
            token: TokenSettings::default(),
        }
    }
}

/// One configured auth plugin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// TCP address of the plugin's RPC endpoint.
    pub address: String,
    /// Flipped off automatically while the plugin is unreachable.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub flow_config: FlowConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowConfiguration {
    /// Forwarded to the plugin's `Configure` call. Never exposed to clients.
    #[serde(default)]
    pub global_settings: HashMap<String, String>,
    #[serde(default)]
    pub flows: Vec<FlowSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSettings {
    pub flow_id: String,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSettings {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    #[serde(default = "default_public_key_path")]
    pub public_key_path: PathBuf,
}

fn default_issuer() -> String {
    "vcs-server".to_string()
}

fn default_subject() -> String {
    "ClientToken".to_string()
}

fn default_expiration_secs() -> u64 {
    86_400
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("ecdsa_key.pem")
}

fn default_public_key_path() -> PathBuf {
    PathBuf::from("ecdsa_pubkey.pem")
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            subject: default_subject(),
            expiration_secs: default_expiration_secs(),
            private_key_path: default_private_key_path(),
            public_key_path: default_public_key_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_control_bind")]
    pub control_bind: SocketAddr,
    #[serde(default = "default_voice_bind")]
    pub voice_bind: SocketAddr,
}

fn default_control_bind() -> SocketAddr {
    "0.0.0.0:5000".parse().unwrap()
}

fn default_voice_bind() -> SocketAddr {
    "0.0.0.0:5002".parse().unwrap()
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            control_bind: default_control_bind(),
            voice_bind: default_voice_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,
    #[serde(default)]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: false,
        }
    }
}

/// The full settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub coalitions: Vec<Coalition>,
    #[serde(default)]
    pub frequencies: Frequencies,
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Shared, lock-protected settings view.
pub struct SettingsState {
    path: PathBuf,
    inner: RwLock<Settings>,
}

impl SettingsState {
    /// Load from `path`. A missing file default-initialises the settings
    /// and writes them out so operators get a template to edit.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();

        let settings = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|source| SettingsError::Io { path: path.clone(), source })?;
            serde_yaml::from_str(&content)?
        } else {
            let defaults = Settings::default();
            write_atomic(&path, &defaults)?;
            defaults
        };

        Ok(Self { path, inner: RwLock::new(settings) })
    }

    /// In-memory state for tests and for voice-only nodes that receive
    /// their settings over the control link.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            path: PathBuf::from("config.yaml"),
            inner: RwLock::new(settings),
        }
    }

    /// Run `f` against the current settings under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.inner.read().unwrap())
    }

    /// Run `f` against the settings under the write lock. The caller is
    /// expected to follow up with [`SettingsState::save`].
    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        f(&mut self.inner.write().unwrap())
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().unwrap().clone()
    }

    /// Serialise to disk atomically, holding the write lock so a
    /// concurrent update cannot tear the file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let inner = self.inner.write().unwrap();
        write_atomic(&self.path, &inner)
    }

    pub fn coalition_exists(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .coalitions
            .iter()
            .any(|c| c.name == name)
    }

    pub fn is_test_frequency(&self, khz: u32) -> bool {
        self.inner.read().unwrap().frequencies.test.contains(&khz)
    }

    pub fn is_global_frequency(&self, khz: u32) -> bool {
        self.inner.read().unwrap().frequencies.global.contains(&khz)
    }

    pub fn plugin(&self, name: &str) -> Option<PluginConfig> {
        self.inner
            .read()
            .unwrap()
            .security
            .plugins
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Flip a plugin's enabled flag. Returns false for unknown plugins.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.security.plugins.iter_mut().find(|p| p.name == name) {
            Some(plugin) => {
                plugin.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn max_radios_per_user(&self) -> usize {
        self.inner.read().unwrap().general.max_radios_per_user as usize
    }

    pub fn guest_auth_enabled(&self) -> bool {
        self.inner.read().unwrap().security.enable_guest_auth
    }

    pub fn plugin_auth_enabled(&self) -> bool {
        self.inner.read().unwrap().security.enable_plugin_auth
    }

    pub fn token_settings(&self) -> TokenSettings {
        self.inner.read().unwrap().security.token.clone()
    }

    /// Names of plugins currently enabled, for `InitAuth` advertising.
    pub fn enabled_plugin_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .security
            .plugins
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect()
    }
}

/// Write `settings` to `path` via a temp file in the same directory plus a
/// rename, so readers never observe a half-written file.
fn write_atomic(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let yaml = serde_yaml::to_string(settings)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml)
        .map_err(|source| SettingsError::Io { path: tmp.clone(), source })?;
    std::fs::rename(&tmp, path)
        .map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
    Ok(())
}
