//! Request handlers shared by the HTTP routes and the WebSocket protocol.

mod conflicts;
mod operations;
mod records;
mod sync;
mod websocket;

pub use conflicts::*;
pub use operations::*;
pub use records::*;
pub use sync::*;
pub use websocket::*;
