//! WebSocket gateway hosting Parley voice-agent sessions.
//!
//! Each connection gets a session lifecycle for its binary audio path and, on
//! the agent endpoint, a turn processor that streams model replies and
//! synthesized speech back over the same socket.

pub mod connection;
pub mod events;
pub mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;
pub mod turn;

pub use server::{router, start_gateway};
pub use state::{GatewayState, SessionMode};
pub use turn::{Pipeline, TurnSettings};
