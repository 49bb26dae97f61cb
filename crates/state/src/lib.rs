//! VCS State - shared server state
//!
//! The authoritative in-memory state of a running server:
//! - `Registry`: connected clients and their radios
//! - `SettingsState`: YAML-backed configuration behind a RwLock
//! - `BannedState`: persisted ban list
//! - `AdminState`: per-service status for the admin seam
//! - `EventBus`: in-process change notifications
//!
//! Lock ordering across the workspace: Registry → Settings → AdminState →
//! EventBus. Voice-relay and plugin-client internals are leaves.

pub mod admin;
pub mod banned;
pub mod events;
pub mod registry;
pub mod settings;

pub use admin::{AdminState, Service, ServiceStatus};
pub use banned::{BannedClient, BannedError, BannedState};
pub use events::{Event, EventBus, Severity};
pub use registry::{
    ClientRecord, IdentityUpdate, Radio, RadioRecord, Registry, RegistryError, Role,
};
pub use settings::{
    Coalition, PluginConfig, Settings, SettingsError, SettingsState, TokenSettings,
};
