//! Casa API Library Crate
//!
//! This library contains the session layer of the Casa voice gateway: the
//! WebSocket protocol and orchestrator, the connection registry, per-session
//! health tracking, and the resilience envelope around the upstream voice
//! session and the device backend. The `api` binary is a thin wrapper around
//! this library.

pub mod admin;
pub mod config;
pub mod error;
pub mod resilience;
pub mod router;
pub mod state;
pub mod ws;
