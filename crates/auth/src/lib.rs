//! VCS Auth - authentication primitives
//!
//! - `TokenService`: ES256 bearer tokens with lazy PEM key management
//! - `password`: bcrypt hashing for coalition passwords
//! - `secret`: diceware client secrets for the plugin login flow

pub mod password;
pub mod secret;
pub mod token;

pub use password::{hash_password, verify_password};
pub use secret::{generate_secret, secrets_match};
pub use token::{Claims, TokenError, TokenService};
