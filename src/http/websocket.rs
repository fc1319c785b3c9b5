//! WebSocket upgrade and session handling.
//!
//! # Responsibilities
//! - Validate the client handshake (version, key, subprotocols)
//! - Commit the `101 Switching Protocols` head and take over the socket
//! - Translate frames to and from the demand bridge
//!
//! # Frame handling
//! - Close from the peer completes the consumer; the close reply is flushed
//! - Ping is answered with a pong and consumes no demand
//! - Text and binary payloads are one emission each
//!
//! # Session end
//! A close frame is sent when the handler finishes. Non keep-alive
//! connections are dropped right away; otherwise the session waits a bounded
//! time for the peer's close reply.

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{NetError, Result};
use crate::flow::bridge::{self, BridgeProducer, Demand, DemandBridge, Inbound, Prefetch, Readiness};
use crate::http::channel::HttpChannel;
use crate::lifecycle::shutdown::ShutdownListener;
use crate::net::pipeline::Pipeline;
use crate::observability::metrics;

const SUPPORTED_VERSION: &str = "13";
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handshake accepted by [`negotiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Accepted {
    pub accept_key: String,
    pub protocol: Option<String>,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Unsupported version or no common subprotocol (426).
    Version,
    /// Malformed handshake (400).
    BadRequest(String),
}

fn header_tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// `Upgrade: websocket` together with `Connection: upgrade`.
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let upgrade = header_tokens(headers, &header::UPGRADE).any(|t| t.eq_ignore_ascii_case("websocket"));
    let connection = header_tokens(headers, &header::CONNECTION).any(|t| t.eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// First client-offered protocol the server supports.
fn select_protocol(offered: &HeaderMap, supported: Option<&str>) -> std::result::Result<Option<String>, Rejection> {
    let supported: Vec<&str> = supported
        .map(|s| s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    let offered: Vec<&str> = header_tokens(offered, &header::SEC_WEBSOCKET_PROTOCOL).collect();
    if supported.is_empty() || offered.is_empty() {
        return Ok(None);
    }
    offered
        .into_iter()
        .find(|p| supported.iter().any(|s| *s == "*" || s == p))
        .map(|p| Some(p.to_string()))
        .ok_or(Rejection::Version)
}

/// Validate a server-side handshake.
pub(crate) fn negotiate(headers: &HeaderMap, protocols: Option<&str>) -> std::result::Result<Accepted, Rejection> {
    if !is_upgrade_request(headers) {
        return Err(Rejection::BadRequest("missing websocket upgrade headers".into()));
    }
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if version != Some(SUPPORTED_VERSION) {
        return Err(Rejection::Version);
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| v.as_bytes())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Rejection::BadRequest("missing Sec-WebSocket-Key".into()))?;
    let protocol = select_protocol(headers, protocols)?;
    Ok(Accepted {
        accept_key: derive_accept_key(key),
        protocol,
    })
}

impl HttpChannel {
    /// Upgrade this exchange to a WebSocket session.
    ///
    /// Must run before the response head is flushed. A refused handshake is
    /// answered (426 or 400) and reported as `NetError::Upgrade`.
    pub async fn upgrade_websocket(&self, protocols: Option<&str>) -> Result<WebSocketSession> {
        if self.headers_sent() {
            return Err(NetError::Upgrade("cannot upgrade after headers sent".into()));
        }

        let accepted = match negotiate(self.headers(), protocols) {
            Ok(accepted) => accepted,
            Err(Rejection::Version) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::SEC_WEBSOCKET_VERSION,
                    HeaderValue::from_static(SUPPORTED_VERSION),
                );
                self.reject(StatusCode::UPGRADE_REQUIRED, headers);
                return Err(NetError::Upgrade("unsupported version or subprotocol".into()));
            }
            Err(Rejection::BadRequest(reason)) => {
                self.reject(StatusCode::BAD_REQUEST, HeaderMap::new());
                return Err(NetError::Upgrade(reason));
            }
        };

        let on_upgrade = self
            .take_upgrade()
            .ok_or_else(|| NetError::Upgrade("connection already upgraded".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        let accept = HeaderValue::from_str(&accepted.accept_key)
            .map_err(|e| NetError::Upgrade(e.to_string()))?;
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        if let Some(protocol) = &accepted.protocol {
            if let Ok(value) = HeaderValue::from_str(protocol) {
                headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }
        self.commit_switch(headers)?;

        let upgraded = on_upgrade.await?;
        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        metrics::record_websocket_session();
        tracing::debug!(
            request_id = %self.id(),
            remote_addr = %self.remote_addr(),
            protocol = ?accepted.protocol,
            "WebSocket session opened"
        );

        Ok(spawn_session(
            ws,
            SessionConfig {
                prefetch: self.prefetch(),
                pipeline: self.pipeline().clone(),
                keep_alive: self.is_keep_alive(),
                shutdown: Some(self.shutdown_listener()),
                protocol: accepted.protocol,
            },
            Some(self.clone()),
        ))
    }
}

enum SessionOp {
    Send(Message, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

struct SessionInner {
    frames: DemandBridge<Bytes>,
    ops: mpsc::UnboundedSender<SessionOp>,
    prefetch: Prefetch,
    protocol: Option<String>,
    channel: Option<HttpChannel>,
}

/// A live WebSocket session, server or client side. Cheap to clone.
#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<SessionInner>,
}

impl WebSocketSession {
    /// Attach to incoming data-frame payloads with the configured window.
    pub fn receive(&self) -> Result<Inbound<Bytes>> {
        self.inner.frames.attach(Demand::Window(self.inner.prefetch))
    }

    pub fn receive_with(&self, demand: Demand) -> Result<Inbound<Bytes>> {
        self.inner.frames.attach(demand)
    }

    /// Send a binary frame.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.submit(Message::Binary(payload.into())).await
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text: String = text.into();
        self.submit(Message::text(text)).await
    }

    /// Send every payload of a stream as binary frames, in order.
    pub async fn send_all<S>(&self, payloads: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        let mut payloads = std::pin::pin!(payloads);
        while let Some(payload) = payloads.next().await {
            self.send(payload).await?;
        }
        Ok(())
    }

    async fn submit(&self, message: Message) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .ops
            .send(SessionOp::Send(message, ack_tx))
            .map_err(|_| NetError::NotRunning("websocket session closed"))?;
        ack_rx.await.map_err(|_| NetError::RemoteClosed)?
    }

    /// Send a close frame. Closing an ended session is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.ops.send(SessionOp::Close(ack_tx)).is_err() {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.ops.is_closed()
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.inner.protocol.as_deref()
    }

    /// The HTTP exchange this session was upgraded from (server side only).
    pub fn channel(&self) -> Option<&HttpChannel> {
        self.inner.channel.as_ref()
    }
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("protocol", &self.inner.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) struct SessionConfig {
    pub prefetch: Prefetch,
    pub pipeline: Pipeline,
    pub keep_alive: bool,
    pub shutdown: Option<ShutdownListener>,
    pub protocol: Option<String>,
}

/// Start the task that owns `ws` and return its handle.
pub(crate) fn spawn_session<S>(
    ws: WebSocketStream<S>,
    config: SessionConfig,
    channel: Option<HttpChannel>,
) -> WebSocketSession
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (frames, producer) = bridge::channel();
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_session(
        ws,
        producer,
        ops_rx,
        config.pipeline,
        config.keep_alive,
        config.shutdown,
    ));
    WebSocketSession {
        inner: Arc::new(SessionInner {
            frames,
            ops: ops_tx,
            prefetch: config.prefetch,
            protocol: config.protocol,
            channel,
        }),
    }
}

async fn wait_ready(producer: &Option<BridgeProducer<Bytes>>) -> Readiness {
    match producer {
        Some(producer) => producer.ready().await,
        None => pending().await,
    }
}

async fn wait_forced(shutdown: Option<ShutdownListener>) {
    match shutdown {
        Some(mut listener) => listener.forced().await,
        None => pending().await,
    }
}

/// Hand a data frame to the consumer. Returns it when no demand is outstanding.
fn offer(producer: &Option<BridgeProducer<Bytes>>, payload: Bytes) -> Option<Bytes> {
    match producer {
        Some(p) => p.try_emit(payload).err(),
        None => {
            tracing::trace!("No consumer left, dropping websocket frame");
            None
        }
    }
}

fn settle_close(result: std::result::Result<(), WsError>) -> Result<()> {
    match result {
        Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_session<S>(
    mut ws: WebSocketStream<S>,
    producer: BridgeProducer<Bytes>,
    mut ops: mpsc::UnboundedReceiver<SessionOp>,
    pipeline: Pipeline,
    keep_alive: bool,
    shutdown: Option<ShutdownListener>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut producer = Some(producer);
    // One data frame waiting for demand; reads pause while it is held.
    let mut parked: Option<Bytes> = None;
    let mut close_sent = false;
    let mut peer_closed = false;
    let forced = wait_forced(shutdown);
    tokio::pin!(forced);

    loop {
        // Control frames are answered whether or not the consumer asked for data.
        let reading = parked.is_none();
        tokio::select! {
            op = ops.recv() => match op {
                Some(SessionOp::Send(message, ack)) => {
                    let message = match message {
                        Message::Binary(data) => Message::Binary(pipeline.outbound(data)),
                        other => other,
                    };
                    let result = ws.send(message).await.map_err(NetError::from);
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(SessionOp::Close(ack)) => {
                    close_sent = true;
                    let _ = ack.send(settle_close(ws.close(None).await));
                    break;
                }
                None => {
                    close_sent = true;
                    if let Err(e) = settle_close(ws.close(None).await) {
                        tracing::debug!(error = %e, "WebSocket close frame failed");
                    }
                    break;
                }
            },
            readiness = wait_ready(&producer), if !reading => match readiness {
                Readiness::Closed => {
                    producer = None;
                    parked = None;
                }
                Readiness::Demand => {
                    if let Some(payload) = parked.take() {
                        parked = offer(&producer, payload);
                    }
                }
            },
            frame = ws.next(), if reading => match frame {
                Some(Ok(Message::Close(_))) => {
                    // The close reply is queued by the codec; push it out.
                    let _ = ws.flush().await;
                    close_sent = true;
                    peer_closed = true;
                    break;
                }
                Some(Ok(Message::Ping(_))) => {
                    let _ = ws.flush().await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    parked = offer(&producer, pipeline.inbound(message.into_data()));
                }
                Some(Err(e)) => {
                    if let Some(p) = producer.take() {
                        p.error(e.into());
                    }
                    peer_closed = true;
                    break;
                }
                None => {
                    peer_closed = true;
                    break;
                }
            },
            _ = &mut forced => {
                tracing::debug!("WebSocket session force-closed");
                peer_closed = true;
                break;
            }
        }
    }

    drop(producer);
    drop(ops);

    if close_sent && !peer_closed && keep_alive {
        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Peer did not answer the close frame in time");
        }
    }
    tracing::debug!("WebSocket session ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(version: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_str(version).unwrap());
        headers
    }

    #[test]
    fn accepts_version_13_with_the_rfc_sample_key() {
        let accepted = negotiate(&handshake("13"), None).unwrap();
        assert_eq!(accepted.accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(accepted.protocol, None);
    }

    #[test]
    fn other_versions_are_rejected() {
        assert_eq!(negotiate(&handshake("8"), None), Err(Rejection::Version));
    }

    #[test]
    fn missing_key_is_a_bad_request() {
        let mut headers = handshake("13");
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(negotiate(&headers, None), Err(Rejection::BadRequest(_))));
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        assert!(!is_upgrade_request(&HeaderMap::new()));
        assert!(matches!(negotiate(&HeaderMap::new(), None), Err(Rejection::BadRequest(_))));
    }

    #[test]
    fn first_supported_offer_wins() {
        let mut headers = handshake("13");
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt, chat, v2"));
        let accepted = negotiate(&headers, Some("v2,chat")).unwrap();
        assert_eq!(accepted.protocol.as_deref(), Some("chat"));

        let any = negotiate(&headers, Some("*")).unwrap();
        assert_eq!(any.protocol.as_deref(), Some("mqtt"));
    }

    #[test]
    fn no_common_protocol_is_rejected() {
        let mut headers = handshake("13");
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("mqtt"));
        assert_eq!(negotiate(&headers, Some("chat")), Err(Rejection::Version));
        // Nothing configured: offers are ignored.
        assert_eq!(negotiate(&headers, None).unwrap().protocol, None);
    }
}
