//! Coalition password hashing
//!
//! Passwords are stored as salted bcrypt hashes; verification runs in
//! constant time inside the bcrypt comparison.

use bcrypt::{hash, verify, BcryptError, DEFAULT_COST};

/// Hash a plaintext password for storage in the settings file.
pub fn hash_password(password: &str) -> Result<String, BcryptError> {
    hash(password, DEFAULT_COST)
}

/// Check `password` against a stored hash. A malformed hash counts as a
/// mismatch rather than an error so one corrupt coalition entry cannot
/// break the whole login loop.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    verify(password, password_hash).unwrap_or(false)
}
