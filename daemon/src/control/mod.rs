//! Control plane: the framed RPC endpoint clients talk to.

pub mod auth_service;
pub mod server;
pub mod srs_service;

pub use auth_service::AuthService;
pub use server::ControlServer;
pub use srs_service::{CallContext, SrsService};
