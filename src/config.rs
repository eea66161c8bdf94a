use std::path::PathBuf;

use clap::Parser;

use crate::relay::host::TunnelTarget;

/// TCP tunneling over Google Cloud Identity-Aware Proxy.
///
/// Listens on a local port and bridges each accepted connection to a
/// Compute Engine instance port through the IAP relay service.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// GCP project id
    #[arg(long, env = "IAP_TUNNEL_PROJECT")]
    pub project: String,

    /// GCE zone (e.g. us-central1-a)
    #[arg(long, env = "IAP_TUNNEL_ZONE")]
    pub zone: String,

    /// GCE instance name
    #[arg(long, env = "IAP_TUNNEL_INSTANCE")]
    pub instance: String,

    /// Network interface of the instance
    #[arg(long, env = "IAP_TUNNEL_INTERFACE", default_value = "nic0")]
    pub interface: String,

    /// Remote port to connect to on the instance
    #[arg(long, env = "IAP_TUNNEL_PORT", default_value = "22")]
    pub port: String,

    /// Local port to bind for tunneling
    #[arg(long, env = "IAP_TUNNEL_LOCAL_PORT", default_value_t = 2223)]
    pub local_port: u16,

    /// Path to a Google credentials JSON file (defaults to ADC discovery)
    #[arg(long, env = "IAP_TUNNEL_CREDENTIALS_FILE")]
    pub credentials_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "loglevel", env = "IAP_TUNNEL_LOGLEVEL", default_value = "info")]
    pub loglevel: String,

    /// Output logs as JSON
    #[arg(long, env = "IAP_TUNNEL_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Validate credentials and relay reachability, then exit
    #[arg(long, default_value_t = false)]
    pub dry_run_only: bool,
}

impl Config {
    pub fn target(&self) -> TunnelTarget {
        TunnelTarget {
            project: self.project.clone(),
            zone: self.zone.clone(),
            instance: self.instance.clone(),
            interface: self.interface.clone(),
            port: self.port.clone(),
        }
    }
}
