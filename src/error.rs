//! Error types for the tunnel client library.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by tunnel sessions, bridges, and the listener supervisor.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Token acquisition failed; terminal for the affected tunnel.
    #[error("credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    /// The WebSocket dial (TCP, TLS, or upgrade) failed.
    #[error("relay dial failed: {0}")]
    Dial(tungstenite::Error),

    #[error("relay dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// WebSocket read/write failure on an established session.
    #[error("relay transport error: {0}")]
    Transport(tungstenite::Error),

    /// The relay closed the session with a non-normal status code.
    #[error("relay closed the session with status {code}: {reason}")]
    RelayClosed { code: u16, reason: String },

    /// Outbound payload write failed part-way through a fragmented payload.
    #[error("write failed after {sent} payload bytes: {source}")]
    Write {
        sent: usize,
        source: tungstenite::Error,
    },

    /// The tunnel was closed before or during the operation.
    #[error("tunnel is closed")]
    Closed,

    /// A second concurrent `serve` call was rejected.
    #[error("tunnel client is already active")]
    AlreadyActive,

    /// The accept loop exhausted its retry budget.
    #[error("failed to accept connection after {attempts} retries: {source}")]
    Accept { attempts: u32, source: std::io::Error },

    /// Local TCP socket failure (bind, read, or write).
    #[error("local socket error: {0}")]
    LocalIo(#[from] std::io::Error),
}

/// Errors from access-token acquisition.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error(
        "no application default credentials found; run `gcloud auth application-default login` \
         or set GOOGLE_APPLICATION_CREDENTIALS"
    )]
    NotFound,

    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("credentials file {path} is missing the `{field}` field")]
    Missing { path: PathBuf, field: &'static str },

    /// Only `authorized_user` (ADC) files are supported; service-account
    /// keys require assertion signing and are rejected with guidance.
    #[error(
        "unsupported credential type {0:?}; mint application default credentials with \
         `gcloud auth application-default login`"
    )]
    Unsupported(String),

    #[error("token refresh request failed: {0}")]
    Refresh(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
}
