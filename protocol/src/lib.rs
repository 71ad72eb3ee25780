//! Wire types for talking to a sandterm server
//!
//! The HTTP API creates, heartbeats and closes sessions. A session's terminal
//! is then opened as a WebSocket at [TERMINAL_PATH], which carries terminal
//! bytes in both directions plus the occasional client [Input::Resize]
//! control message.

#[macro_use] extern crate serde;


mod input;
mod messages;
mod types;

pub use input::*;
pub use messages::*;
pub use types::*;
