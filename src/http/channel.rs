//! Per-request channel handed to HTTP handlers.
//!
//! # Responsibilities
//! - Expose the request head, path parameters and request id
//! - Stream the request body through a demand bridge
//! - Hold the mutable response head until the first flush
//! - Stream the response body through the outbound writer
//!
//! # Design Decisions
//! - Status and headers are last-write-wins until flushed; afterwards
//!   changes fail with `HeadersSent`
//! - Flushing sends the head to hyper through a oneshot so hyper can start
//!   writing while the handler keeps producing the body

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::Stream;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Response, StatusCode, Uri, Version};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{NetError, Result};
use crate::flow::bridge::{self, Demand, DemandBridge, Inbound, Prefetch};
use crate::flow::outbound::Outbound;
use crate::http::body::{self, pump_body, ResponseBody};
use crate::http::multipart::Multipart;
use crate::lifecycle::shutdown::ShutdownListener;
use crate::net::connection::{ConnectionInfo, ConnectionStatus};
use crate::net::pipeline::Pipeline;
use crate::routing::Params;

/// Request id header, read from the request and echoed on the response.
pub const X_REQUEST_ID: &str = "x-request-id";

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    sent: bool,
    head_tx: Option<oneshot::Sender<Response<ResponseBody>>>,
    body: Option<ResponseBody>,
}

struct Inner {
    id: Uuid,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    params: Params,
    info: ConnectionInfo,
    keep_alive: bool,
    prefetch: Prefetch,
    body: DemandBridge<Bytes>,
    response: Mutex<ResponseHead>,
    outbound: Outbound,
    abort_tx: mpsc::Sender<Result<Bytes>>,
    upgrade: Mutex<Option<OnUpgrade>>,
    pipeline: Pipeline,
    shutdown: ShutdownListener,
}

/// Request/response pair for one HTTP exchange. Cheap to clone.
#[derive(Clone)]
pub struct HttpChannel {
    inner: Arc<Inner>,
}

/// Request head fields captured by the dispatcher.
pub(crate) struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Connection-level context shared by every request on that connection.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub info: ConnectionInfo,
    pub keep_alive: bool,
    pub prefetch: Prefetch,
    pub pipeline: Pipeline,
    pub shutdown: ShutdownListener,
}

impl HttpChannel {
    pub(crate) fn new(
        head: RequestHead,
        body_in: Incoming,
        upgrade: OnUpgrade,
        params: Params,
        cx: &ChannelContext,
        head_tx: oneshot::Sender<Response<ResponseBody>>,
    ) -> Self {
        let id = request_id(&head.headers);
        let keep_alive = cx.keep_alive && wants_keep_alive(head.version, &head.headers);

        let (bridge, producer) = bridge::channel();
        tokio::spawn(pump_body(body_in, producer, cx.pipeline.clone()));

        let (sink, response_body, abort_tx) = body::body_channel();
        let outbound = Outbound::spawn(
            sink,
            bridge.state(),
            cx.pipeline.clone(),
            Arc::new(ConnectionStatus::new()),
        );

        let mut response_headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            response_headers.insert(X_REQUEST_ID, value);
        }

        Self {
            inner: Arc::new(Inner {
                id,
                method: head.method,
                uri: head.uri,
                version: head.version,
                headers: head.headers,
                params,
                info: cx.info.clone(),
                keep_alive,
                prefetch: cx.prefetch,
                body: bridge,
                response: Mutex::new(ResponseHead {
                    status: StatusCode::OK,
                    headers: response_headers,
                    sent: false,
                    head_tx: Some(head_tx),
                    body: Some(response_body),
                }),
                outbound,
                abort_tx,
                upgrade: Mutex::new(Some(upgrade)),
                pipeline: cx.pipeline.clone(),
                shutdown: cx.shutdown.clone(),
            }),
        }
    }

    fn response(&self) -> MutexGuard<'_, ResponseHead> {
        self.inner
            .response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ----- request side -----

    /// Request id (from `x-request-id` when it parses, otherwise generated).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn path(&self) -> &str {
        self.inner.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.uri.query()
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// A request header as text, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Path parameter captured by the matching routes.
    ///
    /// Captures of every matched route share one map, so a handler can see
    /// names its own template never declared. On a name collision the route
    /// registered last wins.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.inner.params
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.info.remote_addr
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    /// Attach to the request body using the configured prefetch window.
    pub fn receive(&self) -> Result<Inbound<Bytes>> {
        self.inner.body.attach(Demand::Window(self.inner.prefetch))
    }

    pub fn receive_with(&self, demand: Demand) -> Result<Inbound<Bytes>> {
        self.inner.body.attach(demand)
    }

    /// Decode the request body as `multipart/*`.
    pub fn receive_multipart(&self) -> Result<Multipart> {
        Multipart::decode(self.headers(), self.receive()?)
    }

    // ----- response side -----

    /// Set the response status. Last write before the flush wins.
    pub fn set_status(&self, status: StatusCode) -> Result<()> {
        let mut head = self.response();
        if head.sent {
            return Err(NetError::HeadersSent);
        }
        head.status = status;
        Ok(())
    }

    pub fn status(&self) -> StatusCode {
        self.response().status
    }

    /// Set (replace) a response header.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        let mut head = self.response();
        if head.sent {
            return Err(NetError::HeadersSent);
        }
        head.headers.insert(name, value);
        Ok(())
    }

    /// Append a response header value.
    pub fn add_header(&self, name: HeaderName, value: HeaderValue) -> Result<()> {
        let mut head = self.response();
        if head.sent {
            return Err(NetError::HeadersSent);
        }
        head.headers.append(name, value);
        Ok(())
    }

    /// Snapshot of the pending response headers.
    pub fn response_headers(&self) -> HeaderMap {
        self.response().headers.clone()
    }

    pub fn headers_sent(&self) -> bool {
        self.response().sent
    }

    /// Flush status and headers. Returns `false` if already flushed.
    pub fn send_headers(&self) -> bool {
        self.flush_head(false)
    }

    fn flush_head(&self, empty_body: bool) -> bool {
        let mut head = self.response();
        if head.sent {
            return false;
        }
        head.sent = true;

        let body = match head.body.take() {
            Some(body) if !empty_body => body,
            _ => ResponseBody::empty(),
        };
        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = std::mem::take(&mut head.headers);
        if !self.inner.keep_alive && head.status != StatusCode::SWITCHING_PROTOCOLS {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        if let Some(tx) = head.head_tx.take() {
            if tx.send(response).is_err() {
                tracing::debug!(request_id = %self.inner.id, "Response head dropped, client gone");
            }
        }
        true
    }

    /// Write one body chunk, flushing the head first if needed.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<()> {
        self.send_headers();
        self.inner.outbound.send(chunk.into()).await
    }

    pub async fn send_string(&self, text: impl Into<String>) -> Result<()> {
        self.send(Bytes::from(text.into())).await
    }

    /// Write every chunk of a stream in order.
    pub async fn send_all<S>(&self, chunks: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send,
    {
        self.send_headers();
        self.inner.outbound.send_all(chunks).await
    }

    // ----- crate-internal -----

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub(crate) fn prefetch(&self) -> Prefetch {
        self.inner.prefetch
    }

    pub(crate) fn shutdown_listener(&self) -> ShutdownListener {
        self.inner.shutdown.clone()
    }

    pub(crate) fn take_upgrade(&self) -> Option<OnUpgrade> {
        self.inner
            .upgrade
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Commit a `101 Switching Protocols` head with the given headers.
    pub(crate) fn commit_switch(&self, headers: HeaderMap) -> Result<()> {
        {
            let mut head = self.response();
            if head.sent {
                return Err(NetError::Upgrade("cannot upgrade after headers sent".into()));
            }
            head.status = StatusCode::SWITCHING_PROTOCOLS;
            head.headers.extend(headers);
        }
        self.flush_head(true);
        Ok(())
    }

    /// Respond with `status` and an empty body, unless already flushed.
    pub(crate) fn reject(&self, status: StatusCode, headers: HeaderMap) {
        {
            let mut head = self.response();
            if head.sent {
                return;
            }
            head.status = status;
            head.headers.extend(headers);
        }
        self.flush_head(true);
    }

    /// Flush the head if the handlers never did and end the body.
    pub(crate) async fn finish(&self) {
        self.send_headers();
        self.inner.body.abandon();
        if let Err(e) = self.inner.outbound.close().await {
            tracing::debug!(request_id = %self.inner.id, error = %e, "Response body close failed");
        }
    }

    /// Abort a response whose head was already sent.
    pub(crate) async fn abort(&self, err: NetError) {
        self.inner.body.abandon();
        let _ = self.inner.abort_tx.send(Err(err)).await;
    }
}

impl fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannel")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("remote_addr", &self.inner.info.remote_addr)
            .finish()
    }
}

fn request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

/// HTTP/1.1 defaults to persistent connections, HTTP/1.0 needs an opt-in.
pub(crate) fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();

    if connection.iter().any(|t| t == "close") {
        return false;
    }
    match version {
        Version::HTTP_10 | Version::HTTP_09 => connection.iter().any(|t| t == "keep-alive"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_rules() {
        let mut headers = HeaderMap::new();
        assert!(wants_keep_alive(Version::HTTP_11, &headers));
        assert!(!wants_keep_alive(Version::HTTP_10, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(wants_keep_alive(Version::HTTP_10, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade, close"));
        assert!(!wants_keep_alive(Version::HTTP_11, &headers));
    }

    #[test]
    fn request_id_is_reused_when_valid() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_str(&id.to_string()).unwrap());
        assert_eq!(request_id(&headers), id);

        headers.insert(X_REQUEST_ID, HeaderValue::from_static("not-a-uuid"));
        assert_ne!(request_id(&headers), id);
    }
}
