//! WebSocket support for real-time sync.
//!
//! A connection belongs to one (user, device). Clients run passes and pulls
//! over the socket and hear about passes finished by their other devices.

mod manager;
mod protocol;

pub use manager::ConnectionManager;
pub use protocol::*;
