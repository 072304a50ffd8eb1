//! outpost-server: the relay side of the outpost reverse tunnel.
//!
//! Accepts outbound WebSocket connections from private clients, tracks
//! which public hostnames each session has bound, and bridges public HTTP
//! traffic onto the owning session.

pub mod auth;
pub mod bridge;
pub mod certs;
pub mod config;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;
