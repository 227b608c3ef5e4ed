//! Porthole tunnel client
//!
//! Makes a service on `localhost` reachable through a public URL assigned
//! by a tunnel broker, over a single WebSocket connection.

pub mod config;
pub mod proxy;
pub mod tunnel;

pub use config::{RawTunnelConfig, TunnelConfig};
pub use porthole_shared::{Error, Result, ValidationError};
pub use tunnel::{start, ActiveTunnel, SessionState, Tunnel, TunnelSession};
