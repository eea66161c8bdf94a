//! Tunnel session: one WebSocket to the relay, the SSH Relay v4 state
//! machine, and the reader/writer halves handed to a bridge.
//!
//! A session dials the connect URL, captures the session id from the first
//! CONNECT_SUCCESS_SID frame (firing `ready`), then moves payload bytes in
//! both directions. A transport failure after sid capture is absorbed by a
//! single reconnect dial carrying the cumulative inbound byte count; the
//! relay replays whatever the client had not yet acknowledged.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::frame::{self, RelayFrame, MAX_DATA_PAYLOAD};
use super::host::{close_status, RelayEndpoint, TunnelTarget, ORIGIN, RELAY_SUBPROTOCOL, USER_AGENT};
use crate::credentials::TokenSource;
use crate::error::TunnelError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Deadline for each of TCP connect and WebSocket upgrade, per dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Keep-alive idle period on the relay-facing socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);
/// Inbound payload queue depth, in messages.
const INBOUND_QUEUE: usize = 1024;
/// Acknowledge inbound bytes once the unacked count exceeds this.
const ACK_THRESHOLD: u64 = 2 * MAX_DATA_PAYLOAD as u64;

/// State shared between the session task, the writer half, and teardown.
struct Shared {
    /// Single serialized WebSocket writer; `None` once closed. Every frame
    /// (DATA, ACK, Close) holds the lock for exactly one send.
    sink: Mutex<Option<WsSink>>,
    ready_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    cause: std::sync::Mutex<Option<TunnelError>>,
}

impl Shared {
    /// Fire `closed` and record the terminal cause. The first cause wins;
    /// the signal itself fires at most once per session.
    fn finish(&self, cause: Option<TunnelError>) {
        if let Some(err) = cause {
            let mut slot = self.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.closed_tx.send_replace(true);
    }

    fn take_cause(&self) -> TunnelError {
        self.cause
            .lock()
            .unwrap()
            .take()
            .unwrap_or(TunnelError::Closed)
    }

    /// Close the WebSocket with a normal status if it is still open.
    async fn close_ws(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let close = CloseFrame {
                code: CloseCode::Normal,
                reason: "closing tunnel".into(),
            };
            let _ = sink.send(Message::Close(Some(close))).await;
            let _ = sink.close().await;
        }
    }
}

/// An open relay session. Split into halves before running byte pumps.
pub struct Tunnel {
    reader: TunnelReader,
    writer: TunnelWriter,
}

impl Tunnel {
    /// Dial the relay and spawn the session read loop.
    ///
    /// Dial failures are returned synchronously. The session is not ready
    /// for payload traffic until the relay issues a session id; wait with
    /// [`Tunnel::ready`].
    pub async fn open(
        endpoint: RelayEndpoint,
        target: TunnelTarget,
        tokens: Arc<dyn TokenSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Tunnel, TunnelError> {
        let tls = Arc::new(tls_config());
        let url = endpoint.connect_url(&target);
        info!(url = %url, "connecting to relay");
        let ws = dial(&url, tokens.as_ref(), &tls).await?;
        let (sink, source) = ws.split();

        let (ready_tx, ready_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let shared = Arc::new(Shared {
            sink: Mutex::new(Some(sink)),
            ready_tx,
            closed_tx,
            cause: std::sync::Mutex::new(None),
        });

        let session = Session {
            source,
            inbound: inbound_tx,
            closed: shared.closed_tx.subscribe(),
            shared: Arc::clone(&shared),
            endpoint,
            target,
            tokens,
            tls,
            shutdown,
            sid: None,
            bytes_received: 0,
            bytes_acked: 0,
            bytes_confirmed: 0,
        };
        tokio::spawn(session.run());

        Ok(Tunnel {
            reader: TunnelReader {
                inbound: inbound_rx,
                residual: Bytes::new(),
                ready: ready_rx,
                closed: closed_rx,
                ready_seen: false,
            },
            writer: TunnelWriter { shared },
        })
    }

    /// Wait until the relay has issued a session id, or fail with the
    /// session's terminal cause.
    pub async fn ready(&mut self) -> Result<(), TunnelError> {
        loop {
            if *self.reader.ready.borrow() {
                self.reader.ready_seen = true;
                return Ok(());
            }
            if *self.reader.closed.borrow() {
                return Err(self.writer.shared.take_cause());
            }
            tokio::select! {
                res = self.reader.ready.changed() => {
                    if res.is_err() {
                        return Err(self.writer.shared.take_cause());
                    }
                }
                res = self.reader.closed.changed() => {
                    if res.is_err() {
                        return Err(self.writer.shared.take_cause());
                    }
                }
            }
        }
    }

    pub fn into_split(self) -> (TunnelReader, TunnelWriter) {
        (self.reader, self.writer)
    }

    /// Close the session locally: normal closure on the WebSocket, `closed`
    /// signal to the reader and the session task.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

/// Reader half: delivers inbound payload bytes in relay order.
pub struct TunnelReader {
    inbound: mpsc::Receiver<Bytes>,
    residual: Bytes,
    ready: watch::Receiver<bool>,
    closed: watch::Receiver<bool>,
    ready_seen: bool,
}

impl TunnelReader {
    /// Pull the next inbound payload bytes into `buf`; `0` means
    /// end-of-stream. Blocks until the session is ready before delivering
    /// the first byte.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if !self.ready_seen {
            loop {
                if *self.ready.borrow() {
                    self.ready_seen = true;
                    break;
                }
                if *self.closed.borrow() {
                    return 0;
                }
                tokio::select! {
                    res = self.ready.changed() => {
                        if res.is_err() {
                            return 0;
                        }
                    }
                    res = self.closed.changed() => {
                        if res.is_err() {
                            return 0;
                        }
                    }
                }
            }
        }

        if self.residual.is_empty() {
            let next = tokio::select! {
                msg = self.inbound.recv() => msg,
                _ = signalled(&mut self.closed) => None,
            };
            match next {
                Some(payload) => self.residual = payload,
                None => return 0,
            }
        }

        let n = buf.len().min(self.residual.len());
        buf[..n].copy_from_slice(&self.residual.split_to(n));
        n
    }
}

/// Writer half: fragments payloads into DATA frames. Cheap to clone; all
/// clones serialize on the session's single WebSocket writer.
#[derive(Clone)]
pub struct TunnelWriter {
    shared: Arc<Shared>,
}

impl TunnelWriter {
    /// Fragment `payload` into DATA frames of at most [`MAX_DATA_PAYLOAD`]
    /// bytes and transmit them in order. Returns the count of payload bytes
    /// handed to the WebSocket; a mid-payload transport failure reports the
    /// bytes already sent in the error.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, TunnelError> {
        let mut sent = 0;
        for chunk in payload.chunks(MAX_DATA_PAYLOAD) {
            let data = frame::encode_data(chunk);
            let mut guard = self.shared.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return Err(TunnelError::Closed);
            };
            if let Err(source) = sink.send(Message::Binary(data)).await {
                return Err(TunnelError::Write { sent, source });
            }
            drop(guard);
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Close the session locally.
    pub async fn close(&self) {
        self.shared.finish(None);
        self.shared.close_ws().await;
    }

    /// Terminal cause recorded by the session task, if any. Takes it.
    pub fn terminal_cause(&self) -> Option<TunnelError> {
        self.shared.cause.lock().unwrap().take()
    }
}

/// The session task: owns the WebSocket read half and all session counters.
struct Session {
    source: WsSource,
    inbound: mpsc::Sender<Bytes>,
    closed: watch::Receiver<bool>,
    shared: Arc<Shared>,
    endpoint: RelayEndpoint,
    target: TunnelTarget,
    tokens: Arc<dyn TokenSource>,
    tls: Arc<rustls::ClientConfig>,
    shutdown: watch::Receiver<bool>,
    /// Captured from the first CONNECT_SUCCESS_SID frame; enables reconnect.
    sid: Option<String>,
    /// Cumulative DATA payload bytes delivered by the relay. Survives
    /// reconnect; it is the ack point asserted in the reconnect URL.
    bytes_received: u64,
    /// High-water mark of `bytes_received` at the last ACK we emitted.
    bytes_acked: u64,
    /// Most recent ACK value received from the relay.
    bytes_confirmed: u64,
}

impl Session {
    async fn run(mut self) {
        let cause = match self.drive().await {
            Ok(()) => {
                debug!("session read loop finished");
                None
            }
            Err(err) => {
                warn!(error = %err, "session failed");
                Some(err)
            }
        };
        self.shared.finish(cause);
        self.shared.close_ws().await;
        info!(
            bytes_received = self.bytes_received,
            bytes_confirmed = self.bytes_confirmed,
            "tunnel closed"
        );
    }

    /// Read frames until clean close, local close, or a terminal failure.
    async fn drive(&mut self) -> Result<(), TunnelError> {
        loop {
            let next = tokio::select! {
                next = self.source.next() => next,
                _ = signalled(&mut self.closed) => {
                    debug!("local close, stopping read loop");
                    return Ok(());
                }
                _ = signalled(&mut self.shutdown) => {
                    info!("shutdown requested, stopping read loop");
                    return Ok(());
                }
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    self.recover(TunnelError::Transport(err)).await?;
                    continue;
                }
                None => {
                    // Stream ended without a close handshake.
                    self.recover(TunnelError::Transport(WsError::ConnectionClosed))
                        .await?;
                    continue;
                }
            };

            let raw = match msg {
                Message::Binary(data) => data,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(close) => {
                    let (code, reason) = match close {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (close_status::ABNORMAL, String::new()),
                    };
                    if code == close_status::NORMAL {
                        info!("relay closed the session normally");
                        return Ok(());
                    }
                    warn!(
                        code,
                        status = close_status::describe(code),
                        reason = %reason,
                        "relay closed the session"
                    );
                    return Err(TunnelError::RelayClosed { code, reason });
                }
                _ => {
                    debug!("ignoring non-binary relay message");
                    continue;
                }
            };

            match frame::decode(raw) {
                Ok(RelayFrame::ConnectSuccessSid { sid }) => {
                    debug!(sid = %sid, "session id captured");
                    info!("relay session ready");
                    self.sid = Some(sid);
                    self.shared.ready_tx.send_replace(true);
                }
                Ok(RelayFrame::ReconnectSuccessAck { ack }) => {
                    self.bytes_confirmed = ack;
                    info!(confirmed = ack, "relay session resumed");
                }
                Ok(RelayFrame::Ack { ack }) => {
                    self.bytes_confirmed = ack;
                    debug!(confirmed = ack, "peer ack");
                }
                Ok(RelayFrame::Data { payload, remainder }) => {
                    if !remainder.is_empty() {
                        // The relay does not chain frames in this client's
                        // usage; record the length and drop the bytes.
                        debug!(
                            len = remainder.len(),
                            "discarding trailing bytes after data payload"
                        );
                    }
                    let len = payload.len() as u64;
                    let delivered = tokio::select! {
                        res = self.inbound.send(payload) => res.is_ok(),
                        _ = signalled(&mut self.closed) => false,
                    };
                    if !delivered {
                        // Reader side is gone; the session is over.
                        return Ok(());
                    }
                    self.bytes_received += len;
                    if self.bytes_received - self.bytes_acked > ACK_THRESHOLD {
                        self.send_ack().await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "discarding undecodable relay frame");
                }
            }
        }
    }

    /// One reconnect attempt per transport failure, and only once a session
    /// id is captured. The reconnect URL asserts `bytes_received` so the
    /// relay can replay unacknowledged bytes; counters are left untouched.
    async fn recover(&mut self, err: TunnelError) -> Result<(), TunnelError> {
        let Some(sid) = self.sid.clone() else {
            return Err(err);
        };
        if *self.shutdown.borrow() || *self.closed.borrow() {
            return Err(err);
        }

        warn!(
            error = %err,
            sid = %sid,
            ack = self.bytes_received,
            "relay transport failed, attempting reconnect"
        );
        let url = self
            .endpoint
            .reconnect_url(&self.target.zone, &sid, self.bytes_received);
        let ws = match dial(&url, self.tokens.as_ref(), &self.tls).await {
            Ok(ws) => ws,
            Err(redial_err) => {
                warn!(error = %redial_err, "reconnect failed");
                return Err(redial_err);
            }
        };
        let (sink, source) = ws.split();
        *self.shared.sink.lock().await = Some(sink);
        self.source = source;
        debug!("reconnect dial succeeded, awaiting relay ack");
        Ok(())
    }

    async fn send_ack(&mut self) {
        let data = frame::encode_ack(self.bytes_received);
        let mut guard = self.shared.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return;
        };
        match sink.send(Message::Binary(data)).await {
            Ok(()) => {
                drop(guard);
                self.bytes_acked = self.bytes_received;
                debug!(acked = self.bytes_acked, "acknowledged inbound bytes");
            }
            // The next read observes the dead socket and drives the normal
            // failure path.
            Err(err) => debug!(error = %err, "failed to send ack frame"),
        }
    }
}

/// Validate credentials and relay reachability: one dial, one read, then a
/// normal closure. No listener is involved.
pub async fn dry_run(
    endpoint: &RelayEndpoint,
    target: &TunnelTarget,
    tokens: &dyn TokenSource,
) -> Result<(), TunnelError> {
    let tls = Arc::new(tls_config());
    let url = endpoint.connect_url(target);
    info!(url = %url, "dry run: dialing relay");
    let mut ws = dial(&url, tokens, &tls).await?;
    match ws.next().await {
        Some(Ok(msg)) => debug!(len = msg.len(), "dry run: received relay frame"),
        Some(Err(err)) => return Err(TunnelError::Transport(err)),
        None => return Err(TunnelError::Transport(WsError::ConnectionClosed)),
    }
    let close = CloseFrame {
        code: CloseCode::Normal,
        reason: "dry run complete".into(),
    };
    let _ = ws.close(Some(close)).await;
    info!("dry run successful, relay reachable");
    Ok(())
}

/// Dial the relay: TCP with a deadline, socket options, TLS when the scheme
/// asks for it, then the WebSocket upgrade with the relay handshake headers.
async fn dial(
    url: &str,
    tokens: &dyn TokenSource,
    tls: &Arc<rustls::ClientConfig>,
) -> Result<WsStream, TunnelError> {
    let token = tokens.access_token().await?;

    let mut request = url.into_client_request().map_err(TunnelError::Dial)?;
    let headers = request.headers_mut();
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| TunnelError::Dial(WsError::HttpFormat(e.into())))?;
    headers.insert(http::header::AUTHORIZATION, bearer);
    headers.insert(http::header::ORIGIN, HeaderValue::from_static(ORIGIN));
    headers.insert(http::header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(RELAY_SUBPROTOCOL),
    );

    let uri = request.uri().clone();
    let host = uri
        .host()
        .ok_or(TunnelError::Dial(WsError::Url(UrlError::NoHostName)))?;
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| TunnelError::DialTimeout(DIAL_TIMEOUT))?
        .map_err(|e| TunnelError::Dial(WsError::Io(e)))?;
    configure_socket(&tcp);

    let connector = if is_tls {
        Connector::Rustls(Arc::clone(tls))
    } else {
        Connector::Plain
    };

    let (ws, response) = tokio::time::timeout(
        DIAL_TIMEOUT,
        tokio_tungstenite::client_async_tls_with_config(request, tcp, None, Some(connector)),
    )
    .await
    .map_err(|_| TunnelError::DialTimeout(DIAL_TIMEOUT))?
    .map_err(TunnelError::Dial)?;

    debug!(status = response.status().as_u16(), "relay handshake complete");
    Ok(ws)
}

/// Keep-alive and NODELAY on the relay-facing socket.
fn configure_socket(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set keepalive on relay socket");
    }
    if let Err(e) = sock.set_nodelay(true) {
        warn!(error = %e, "failed to set nodelay on relay socket");
    }
}

/// rustls client config trusting the webpki root set.
fn tls_config() -> rustls::ClientConfig {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Resolves when the watch flag flips to true, or when its sender is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|fired| *fired).await;
}
