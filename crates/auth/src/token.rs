//! Bearer tokens
//!
//! ES256-signed JWTs carrying the client id and role. Keys live in PEM
//! files next to the server; if they are missing at first use, a fresh
//! P-256 keypair is generated and written with `0600` / `0644` modes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vcs_state::{Role, TokenSettings};

/// Clock skew tolerated when checking `exp`.
const VALIDATION_LEEWAY_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("key error: {0}")]
    Key(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("token carries unknown role id {0}")]
    UnknownRole(u32),

    #[error("insufficient role: have {have}, need at least {need}")]
    RoleInsufficient { have: u8, need: u8 },
}

/// The claims carried by every token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub client_guid: String,
    pub role_id: u32,
    pub iss: String,
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
}

impl Claims {
    pub fn client_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.client_guid).ok()
    }

    pub fn role(&self) -> Option<Role> {
        u8::try_from(self.role_id).ok().and_then(Role::from_u8)
    }
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies bearer tokens. Keys are loaded once on first use
/// and cached for the lifetime of the service.
pub struct TokenService {
    keys: RwLock<Option<Arc<KeyPair>>>,
}

impl TokenService {
    pub fn new() -> Self {
        Self { keys: RwLock::new(None) }
    }

    /// Load or generate the key material now instead of on the first
    /// login, so key problems surface at startup.
    pub fn ensure_keys(&self, settings: &TokenSettings) -> Result<(), TokenError> {
        self.keys(settings).map(|_| ())
    }

    /// Sign a token for `client_id` with `role`, valid for
    /// `settings.expiration_secs`.
    pub fn generate(
        &self,
        client_id: Uuid,
        role: Role,
        settings: &TokenSettings,
    ) -> Result<String, TokenError> {
        let keys = self.keys(settings)?;

        let now = unix_now();
        let claims = Claims {
            client_guid: client_id.to_string(),
            role_id: u32::from(role.as_u8()),
            iss: settings.issuer.clone(),
            sub: settings.subject.clone(),
            iat: now,
            exp: now + settings.expiration_secs,
            jti: Uuid::new_v4().to_string(),
        };

        Ok(encode(&Header::new(Algorithm::ES256), &claims, &keys.encoding)?)
    }

    /// Verify signature and expiry, then check the carried role against
    /// `min_role`.
    pub fn verify(
        &self,
        token: &str,
        min_role: Role,
        settings: &TokenSettings,
    ) -> Result<Claims, TokenError> {
        let keys = self.keys(settings)?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = VALIDATION_LEEWAY_SECS;

        let data = decode::<Claims>(token, &keys.decoding, &validation)?;
        let claims = data.claims;

        let role = claims.role().ok_or(TokenError::UnknownRole(claims.role_id))?;
        if role < min_role {
            return Err(TokenError::RoleInsufficient {
                have: role.as_u8(),
                need: min_role.as_u8(),
            });
        }

        Ok(claims)
    }

    fn keys(&self, settings: &TokenSettings) -> Result<Arc<KeyPair>, TokenError> {
        if let Some(keys) = self.keys.read().unwrap().as_ref() {
            return Ok(Arc::clone(keys));
        }

        let mut slot = self.keys.write().unwrap();
        // Another caller may have won the race between the locks.
        if let Some(keys) = slot.as_ref() {
            return Ok(Arc::clone(keys));
        }

        let keys = Arc::new(load_or_generate_keys(settings)?);
        *slot = Some(Arc::clone(&keys));
        Ok(keys)
    }
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn load_or_generate_keys(settings: &TokenSettings) -> Result<KeyPair, TokenError> {
    let private_path = &settings.private_key_path;
    let public_path = &settings.public_key_path;

    if private_path.exists() && public_path.exists() {
        let private_pem = read_file(private_path)?;
        let public_pem = read_file(public_path)?;
        return Ok(KeyPair {
            encoding: EncodingKey::from_ec_pem(private_pem.as_bytes())?,
            decoding: DecodingKey::from_ec_pem(public_pem.as_bytes())?,
        });
    }

    let secret = SecretKey::random(&mut OsRng);
    let private_pem = secret
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| TokenError::Key(e.to_string()))?;
    let public_pem = secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| TokenError::Key(e.to_string()))?;

    write_key_file(private_path, private_pem.as_bytes(), 0o600)?;
    write_key_file(public_path, public_pem.as_bytes(), 0o644)?;

    Ok(KeyPair {
        encoding: EncodingKey::from_ec_pem(private_pem.as_bytes())?,
        decoding: DecodingKey::from_ec_pem(public_pem.as_bytes())?,
    })
}

fn read_file(path: &Path) -> Result<String, TokenError> {
    std::fs::read_to_string(path)
        .map_err(|source| TokenError::Io { path: path.to_path_buf(), source })
}

fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), TokenError> {
    std::fs::write(path, contents)
        .map_err(|source| TokenError::Io { path: path.to_path_buf(), source })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|source| TokenError::Io { path: path.to_path_buf(), source })?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
