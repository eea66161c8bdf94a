//! Local listener supervisor: accepts TCP connections and pairs each one
//! with a dedicated relay tunnel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::credentials::TokenSource;
use crate::error::TunnelError;
use crate::relay::bridge;
use crate::relay::host::{RelayEndpoint, TunnelTarget};
use crate::relay::tunnel::{self, Tunnel};

/// Local bind port used when the caller does not pick one.
pub const DEFAULT_LOCAL_PORT: u16 = 2201;
/// Keep-alive idle period applied to accepted sockets.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);
/// Consecutive transient accept failures tolerated before giving up.
const ACCEPT_RETRIES: u32 = 3;

/// TCP-over-IAP tunnel client.
///
/// Owns the local listener; every accepted connection gets its own relay
/// session, so session-id ownership is unambiguous and unrelated streams
/// never block each other.
pub struct IapTunnelClient {
    endpoint: RelayEndpoint,
    target: TunnelTarget,
    tokens: Arc<dyn TokenSource>,
    local_port: u16,
    active: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl IapTunnelClient {
    pub fn new(
        target: TunnelTarget,
        tokens: Arc<dyn TokenSource>,
        local_port: Option<u16>,
    ) -> Self {
        Self {
            endpoint: RelayEndpoint::default(),
            target,
            tokens,
            local_port: local_port.unwrap_or(DEFAULT_LOCAL_PORT),
            active: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Point the client at a non-default relay endpoint.
    pub fn with_endpoint(mut self, endpoint: RelayEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Validate credentials and relay reachability without opening the
    /// listener: one dial, one read, then a normal closure.
    pub async fn dry_run(&self) -> Result<(), TunnelError> {
        tunnel::dry_run(&self.endpoint, &self.target, self.tokens.as_ref()).await
    }

    /// Address the listener is bound to while `serve` is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Accept local connections and bridge each one to its own tunnel until
    /// `shutdown` fires or the accept loop fails past its retry budget.
    ///
    /// A second concurrent call fails with [`TunnelError::AlreadyActive`]
    /// without binding anything.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyActive);
        }
        let _active = ActiveGuard(&self.active);

        let listener = TcpListener::bind(("0.0.0.0", self.local_port))
            .await
            .map_err(TunnelError::LocalIo)?;
        let addr = listener.local_addr().map_err(TunnelError::LocalIo)?;
        *self.local_addr.lock().unwrap() = Some(addr);
        info!(addr = %addr, "tcp-over-iap listener ready");

        let result = self.accept_loop(&listener, &mut shutdown).await;
        *self.local_addr.lock().unwrap() = None;
        info!("tcp-over-iap listener closed");
        result
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let mut retry = AcceptRetry::new(ACCEPT_RETRIES);
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.changed() => {
                    info!("shutdown requested, listener closing");
                    return Ok(());
                }
            };

            match accepted {
                Ok((conn, peer)) => {
                    retry.reset();
                    debug!(peer = %peer, "connection accepted");
                    apply_keepalive(&conn);
                    self.spawn_bridge(conn, shutdown.clone());
                }
                Err(err) => match retry.backoff() {
                    Some(delay) => {
                        warn!(
                            error = %err,
                            attempt = retry.attempt(),
                            max = ACCEPT_RETRIES,
                            delay_secs = delay.as_secs(),
                            "accept failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => return Ok(()),
                        }
                    }
                    None => {
                        return Err(TunnelError::Accept {
                            attempts: ACCEPT_RETRIES,
                            source: err,
                        });
                    }
                },
            }
        }
    }

    fn spawn_bridge(&self, conn: TcpStream, shutdown: watch::Receiver<bool>) {
        let endpoint = self.endpoint.clone();
        let target = self.target.clone();
        let tokens = Arc::clone(&self.tokens);
        tokio::spawn(async move {
            let peer = conn.peer_addr().ok();
            let tunnel =
                match Tunnel::open(endpoint, target, tokens, shutdown.clone()).await {
                    Ok(tunnel) => tunnel,
                    Err(err) => {
                        warn!(error = %err, "tunnel dial failed, dropping local connection");
                        return;
                    }
                };
            match bridge::run(conn, tunnel, shutdown).await {
                Ok(()) => debug!(peer = ?peer, "bridge finished"),
                Err(err) => warn!(error = %err, peer = ?peer, "bridge failed"),
            }
        });
    }
}

/// Clears the active flag when `serve` returns by any path.
struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Linear accept backoff: attempt n sleeps n seconds, with at most `max`
/// consecutive retries. A successful accept resets the budget.
struct AcceptRetry {
    max: u32,
    attempt: u32,
}

impl AcceptRetry {
    fn new(max: u32) -> Self {
        Self { max, attempt: 0 }
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, or `None` once the retry budget is exhausted.
    fn backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max {
            return None;
        }
        self.attempt += 1;
        Some(Duration::from_secs(u64::from(self.attempt)))
    }
}

fn apply_keepalive(conn: &TcpStream) {
    let sock = SockRef::from(conn);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to enable keepalive on accepted socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_retry_backs_off_linearly_then_exhausts() {
        let mut retry = AcceptRetry::new(3);
        assert_eq!(retry.backoff(), Some(Duration::from_secs(1)));
        assert_eq!(retry.backoff(), Some(Duration::from_secs(2)));
        assert_eq!(retry.backoff(), Some(Duration::from_secs(3)));
        assert_eq!(retry.backoff(), None);
    }

    #[test]
    fn accept_retry_resets_on_success() {
        let mut retry = AcceptRetry::new(3);
        assert_eq!(retry.backoff(), Some(Duration::from_secs(1)));
        retry.reset();
        assert_eq!(retry.backoff(), Some(Duration::from_secs(1)));
        assert_eq!(retry.backoff(), Some(Duration::from_secs(2)));
    }
}
