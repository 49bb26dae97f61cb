//! Banned clients
//!
//! A small JSON-backed list, loaded at startup and rewritten atomically on
//! every mutation. The voice relay checks `is_ip_banned` on each datagram,
//! so lookups stay behind a read lock.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BannedError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid banned clients file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedClient {
    pub id: Uuid,
    pub display_name: String,
    pub ip_address: String,
    pub reason: String,
}

/// The persisted ban list.
pub struct BannedState {
    path: PathBuf,
    inner: RwLock<Vec<BannedClient>>,
}

impl BannedState {
    /// Load from `path`; a missing file starts with an empty list.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BannedError> {
        let path = path.as_ref().to_path_buf();

        let banned = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|source| BannedError::Io { path: path.clone(), source })?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };

        Ok(Self { path, inner: RwLock::new(banned) })
    }

    pub fn all(&self) -> Vec<BannedClient> {
        self.inner.read().unwrap().clone()
    }

    pub fn is_banned(&self, id: Uuid) -> bool {
        self.inner.read().unwrap().iter().any(|b| b.id == id)
    }

    pub fn is_ip_banned(&self, ip: IpAddr) -> bool {
        let ip = ip.to_string();
        self.inner.read().unwrap().iter().any(|b| b.ip_address == ip)
    }

    /// Add an entry and rewrite the file. Duplicate ids are replaced so a
    /// re-ban updates the reason.
    pub fn ban(&self, entry: BannedClient) -> Result<(), BannedError> {
        let mut inner = self.inner.write().unwrap();
        inner.retain(|b| b.id != entry.id);
        inner.push(entry);
        self.persist(&inner)
    }

    /// Remove an entry and rewrite the file. Returns false when the id was
    /// not on the list.
    pub fn unban(&self, id: Uuid) -> Result<bool, BannedError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.len();
        inner.retain(|b| b.id != id);
        if inner.len() == before {
            return Ok(false);
        }
        self.persist(&inner)?;
        Ok(true)
    }

    fn persist(&self, banned: &[BannedClient]) -> Result<(), BannedError> {
        let json = serde_json::to_string_pretty(banned)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|source| BannedError::Io { path: tmp.clone(), source })?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|source| BannedError::Io { path: self.path.clone(), source })?;
        Ok(())
    }
}
