//! Client registry
//!
//! The authoritative map of connected clients and their radio state. The
//! auth service inserts records on successful login; the control RPC
//! mutates them; the voice relay only reads. Every accessor copies data
//! out under the lock so no caller ever holds it across I/O.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Client role, ordered Guest < Member < Admin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Role {
    #[default]
    Guest,
    Member,
    Admin,
}

impl Role {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Role::Guest),
            1 => Some(Role::Member),
            2 => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::Member => 1,
            Role::Admin => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Guest => "Guest",
            Role::Member => "Member",
            Role::Admin => "Admin",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client not found")]
    ClientNotFound,

    #[error("radio limit exceeded: {count} radios, at most {limit} allowed")]
    RadioLimitExceeded { count: usize, limit: usize },
}

/// Identity of one authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: Uuid,
    pub display_name: String,
    pub unit_id: String,
    pub coalition: String,
    pub role: Role,
    pub last_update: SystemTime,
}

impl ClientRecord {
    pub fn new(id: Uuid, display_name: String, unit_id: String, coalition: String, role: Role) -> Self {
        Self {
            id,
            display_name,
            unit_id,
            coalition,
            role,
            last_update: SystemTime::now(),
        }
    }

    /// Unix seconds of the last update, for wire snapshots.
    pub fn last_update_unix(&self) -> i64 {
        self.last_update
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// One configured radio of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Radio {
    pub id: u32,
    pub name: String,
    /// 24-bit value in kHz.
    pub frequency_khz: u32,
    pub enabled: bool,
    pub is_intercom: bool,
}

/// Radio state of one client, 1:1 with its [`ClientRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RadioRecord {
    pub radios: Vec<Radio>,
    /// Server-enforced gag. A muted client transmits but receives nothing.
    pub muted: bool,
}

/// Partial identity update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    pub display_name: Option<String>,
    pub unit_id: Option<String>,
    pub coalition: Option<String>,
    pub role: Option<Role>,
}

/// Checks the `^[A-Z0-9]{2,4}$` unit id shape.
pub fn is_valid_unit_id(unit_id: &str) -> bool {
    (2..=4).contains(&unit_id.len())
        && unit_id.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Checks the 1..=32 character display-name bound.
pub fn is_valid_display_name(name: &str) -> bool {
    let count = name.chars().count();
    (1..=32).contains(&count)
}

struct RegistryInner {
    clients: HashMap<Uuid, ClientRecord>,
    radios: HashMap<Uuid, RadioRecord>,
}

/// The registry itself. Shared as `Arc<Registry>`; all operations are
/// atomic with respect to the internal lock.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                clients: HashMap::new(),
                radios: HashMap::new(),
            }),
        }
    }

    /// Insert a freshly authenticated client together with an empty radio
    /// record. Overwrites any previous session with the same id.
    pub fn add(&self, record: ClientRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.radios.insert(record.id, RadioRecord::default());
        inner.clients.insert(record.id, record);
    }

    /// Remove both records. Returns whether the client existed.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        let existed = inner.clients.remove(&id).is_some();
        inner.radios.remove(&id);
        existed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.read().unwrap().clients.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<ClientRecord> {
        self.inner.read().unwrap().clients.get(&id).cloned()
    }

    pub fn get_radios(&self, id: Uuid) -> Option<RadioRecord> {
        self.inner.read().unwrap().radios.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_clients(&self) -> Vec<ClientRecord> {
        self.inner.read().unwrap().clients.values().cloned().collect()
    }

    pub fn all_radios(&self) -> Vec<(Uuid, RadioRecord)> {
        self.inner
            .read()
            .unwrap()
            .radios
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }

    /// Apply an identity update field by field.
    ///
    /// Each field is validated independently; the valid subset is applied
    /// and the rejection messages for the rest are returned. An empty list
    /// means the whole update went through. `coalition_exists` is consulted
    /// for the coalition field only.
    pub fn update_identity<F>(
        &self,
        id: Uuid,
        update: IdentityUpdate,
        coalition_exists: F,
    ) -> Result<Vec<String>, RegistryError>
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.inner.write().unwrap();
        let client = inner.clients.get_mut(&id).ok_or(RegistryError::ClientNotFound)?;

        let mut rejections = Vec::new();

        if let Some(name) = update.display_name {
            if is_valid_display_name(&name) {
                client.display_name = name;
            } else {
                rejections.push(
                    "Invalid username. It must be between 1 and 32 characters long.".to_string(),
                );
            }
        }

        if let Some(unit_id) = update.unit_id {
            if is_valid_unit_id(&unit_id) {
                client.unit_id = unit_id;
            } else {
                rejections.push(
                    "Invalid unit ID. It must be 2 to 4 uppercase alphanumeric characters."
                        .to_string(),
                );
            }
        }

        if let Some(coalition) = update.coalition {
            if coalition_exists(&coalition) {
                client.coalition = coalition;
            } else {
                rejections.push(
                    "Coalition not found, please select an existing coalition.".to_string(),
                );
            }
        }

        if let Some(role) = update.role {
            if can_swap_role(client.role, role) {
                client.role = role;
            } else {
                rejections.push(
                    "You cannot swap roles. Please contact an administrator if you need a \
                     different role."
                        .to_string(),
                );
            }
        }

        client.last_update = SystemTime::now();
        Ok(rejections)
    }

    /// Replace a client's radios wholesale. The client owns its own radio
    /// state, so the contents are trusted; only the configured limit is
    /// enforced.
    pub fn replace_radios(
        &self,
        id: Uuid,
        radios: Vec<Radio>,
        limit: usize,
    ) -> Result<(), RegistryError> {
        if radios.len() > limit {
            return Err(RegistryError::RadioLimitExceeded { count: radios.len(), limit });
        }

        let mut inner = self.inner.write().unwrap();
        if !inner.radios.contains_key(&id) {
            return Err(RegistryError::ClientNotFound);
        }
        let muted = inner.radios.get(&id).map(|r| r.muted).unwrap_or(false);
        inner.radios.insert(id, RadioRecord { radios, muted });
        if let Some(client) = inner.clients.get_mut(&id) {
            client.last_update = SystemTime::now();
        }
        Ok(())
    }

    pub fn set_muted(&self, id: Uuid, muted: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let record = inner.radios.get_mut(&id).ok_or(RegistryError::ClientNotFound)?;
        record.muted = muted;
        Ok(())
    }

    pub fn is_muted(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .unwrap()
            .radios
            .get(&id)
            .map(|r| r.muted)
            .unwrap_or(false)
    }

    /// Refresh a client's activity timestamp.
    pub fn touch(&self, id: Uuid) {
        if let Some(client) = self.inner.write().unwrap().clients.get_mut(&id) {
            client.last_update = SystemTime::now();
        }
    }

    /// Whether `listener` receives a transmission from `sender` on
    /// `frequency_khz`:
    /// the listener is not muted, has an enabled radio tuned to the
    /// frequency, shares the sender's coalition unless the frequency is
    /// global, and is not the sender itself.
    pub fn is_listening_on(
        &self,
        listener: Uuid,
        sender: Uuid,
        frequency_khz: u32,
        is_global: bool,
    ) -> bool {
        if listener == sender {
            return false;
        }

        let inner = self.inner.read().unwrap();

        let Some(radio_record) = inner.radios.get(&listener) else {
            return false;
        };
        if radio_record.muted {
            return false;
        }
        if !radio_record
            .radios
            .iter()
            .any(|r| r.enabled && r.frequency_khz == frequency_khz)
        {
            return false;
        }

        if is_global {
            return true;
        }
        match (inner.clients.get(&listener), inner.clients.get(&sender)) {
            (Some(l), Some(s)) => l.coalition == s.coalition,
            _ => false,
        }
    }

    /// Remove every client whose `last_update` is older than `max_age`.
    /// Returns the evicted ids so the caller can publish a change event.
    pub fn sweep_stale(&self, max_age: Duration) -> Vec<Uuid> {
        let now = SystemTime::now();
        let mut inner = self.inner.write().unwrap();

        let stale: Vec<Uuid> = inner
            .clients
            .iter()
            .filter(|(_, c)| {
                now.duration_since(c.last_update).map(|age| age > max_age).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            inner.clients.remove(id);
            inner.radios.remove(id);
        }
        stale
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Role-swap policy: downgrades only, and never down to Guest. Swapping to
/// the current role is allowed so clients may re-send their state verbatim.
fn can_swap_role(current: Role, requested: Role) -> bool {
    requested != Role::Guest && requested <= current
}
