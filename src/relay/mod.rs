//! SSH Relay v4 client: framing, the tunnel session state machine, and the
//! per-connection bridge.

pub mod bridge;
pub mod frame;
pub mod host;
pub mod tunnel;
