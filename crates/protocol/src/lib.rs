//! VCS Protocol - wire formats for the voice and control planes
//!
//! This crate defines everything that crosses a socket:
//! - `VoicePacket`: the fixed-header UDP voice packet codec
//! - `pb`: protobuf control-plane and plugin-channel messages
//! - `framing`: length-delimited framing for the TCP channels

pub mod framing;
pub mod pb;
mod voice;

pub use framing::{read_message, write_message, CodecError, MAX_FRAME_SIZE};
pub use voice::*;
