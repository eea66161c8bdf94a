//! TCP tunneling over Google Cloud Identity-Aware Proxy.
//!
//! A local TCP listener bridges each accepted connection to a Compute Engine
//! instance port by dialing the IAP "SSH Relay v4" WebSocket service and
//! speaking its framed transport. Each local connection owns a dedicated
//! relay session; ordering is preserved per direction and transient link
//! failures are absorbed by the relay's reconnect-with-ack mechanism.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod relay;

pub use client::IapTunnelClient;
pub use error::{CredentialsError, TunnelError};
pub use relay::host::{RelayEndpoint, TunnelTarget};
