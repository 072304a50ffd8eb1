//! outpost-client: the private side of the outpost reverse tunnel.
//!
//! Dials out to the relay, claims public hostnames, and forwards the
//! requests the relay pushes down to local services.

pub mod config;
pub mod proxy;

pub use config::{Binding, ClientConfig};
pub use proxy::ClientProxy;
