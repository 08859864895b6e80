//! HTTP control plane and media gateway.
//!
//! Hosts the call session registry (admission, duration sweeps, archive), the
//! control-plane operations, the outbound destination policy, lifecycle
//! callbacks and the WebSocket media bridge that carries call audio.

pub mod bridge;
pub mod callbacks;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod methods;
pub mod policy;
pub mod registry;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use server::{router, serve, start_gateway};
pub use state::GatewayState;
