//! Per-connection bridge: one accepted local TCP socket joined to one
//! dedicated relay tunnel.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::frame::MAX_DATA_PAYLOAD;
use super::tunnel::Tunnel;
use crate::error::TunnelError;

/// Run the bridge until either side ends, then tear both down.
///
/// Waits for the tunnel's session id before moving any bytes. The
/// completion value is the first real failure from either pump; clean EOF
/// and cancellation complete with `Ok`.
pub async fn run(
    local: TcpStream,
    mut tunnel: Tunnel,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    tokio::select! {
        res = tunnel.ready() => {
            if let Err(err) = res {
                // Local socket drops on return, closing the connection.
                tunnel.close().await;
                return Err(err);
            }
        }
        _ = shutdown.changed() => {
            debug!("shutdown before tunnel became ready");
            tunnel.close().await;
            return Ok(());
        }
    }
    debug!("bridge ready");

    let (mut local_read, mut local_write) = local.into_split();
    let (mut tunnel_read, tunnel_write) = tunnel.into_split();
    let uplink_write = tunnel_write.clone();

    let uplink = async {
        let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
        loop {
            let n = local_read.read(&mut buf).await.map_err(TunnelError::LocalIo)?;
            if n == 0 {
                debug!("local connection reached end of stream");
                return Ok::<(), TunnelError>(());
            }
            uplink_write.send(&buf[..n]).await?;
        }
    };

    let downlink = async {
        let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
        loop {
            let n = tunnel_read.read(&mut buf).await;
            if n == 0 {
                debug!("tunnel reached end of stream");
                return Ok::<(), TunnelError>(());
            }
            local_write
                .write_all(&buf[..n])
                .await
                .map_err(TunnelError::LocalIo)?;
        }
    };

    let result = tokio::select! {
        res = uplink => res,
        res = downlink => res,
        _ = shutdown.changed() => Ok(()),
    };

    // Dropping the pumps released both socket halves; closing the tunnel
    // sends the normal-closure frame and wakes anything still blocked.
    tunnel_write.close().await;

    if result.is_ok() {
        if let Some(cause) = tunnel_write.terminal_cause() {
            // The pump saw a plain end-of-stream; the underlying cause was
            // already reported by the session task.
            debug!(cause = %cause, "bridge closed after tunnel failure");
        }
    }
    result
}
