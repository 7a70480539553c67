//! WebSocket Session Management
//!
//! This module contains the core logic for serving client sessions over
//! WebSockets. It is structured into submodules for clarity:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `registry`: Tracks live connections and their outbound queues.
//! - `session_state`: Per-session health metrics and the eviction sweep.
//! - `session`: Manages the WebSocket connection lifecycle, from handshake to termination.
//! - `cycle`: Drains upstream events and tracks the generation cycle.
//! - `provider`: Handles the connection to the real-time voice API (Gemini Live).

mod cycle;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod session;
pub mod session_state;
#[cfg(test)]
pub(crate) mod testing;

pub use session::ws_handler;
