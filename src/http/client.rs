//! Minimal HTTP/1.1 and WebSocket client.
//!
//! One connection per exchange. Responses are classified before the body
//! is exposed: 3xx and 4xx/5xx become distinguishable errors so a caller
//! awaiting a full response can tell them apart from transport failures.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use url::Url;

use crate::config::ServerOptions;
use crate::error::{NetError, Result};
use crate::flow::bridge::{self, Demand, DemandBridge, Inbound, Prefetch};
use crate::http::body::pump_body;
use crate::http::multipart::Multipart;
use crate::http::websocket::{spawn_session, SessionConfig, WebSocketSession};
use crate::net::pipeline::Pipeline;

fn invalid(message: impl Into<String>) -> NetError {
    NetError::Io(io::Error::new(io::ErrorKind::InvalidInput, message.into()))
}

/// Host, port and authority of a `http`/`ws` URL.
fn endpoint(url: &Url) -> Result<(String, u16, String)> {
    let host = url
        .host_str()
        .ok_or_else(|| invalid(format!("no host in {url}")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid(format!("no port in {url}")))?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.clone(),
    };
    Ok((host, port, authority))
}

/// Client settings shared by every exchange.
#[derive(Debug, Clone)]
pub struct HttpClient {
    connect_timeout: Duration,
    prefetch: Prefetch,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::from_options(&ServerOptions::default())
    }
}

impl HttpClient {
    pub fn new(connect_timeout: Duration, prefetch: Prefetch) -> Self {
        Self {
            connect_timeout,
            prefetch,
        }
    }

    pub fn from_options(options: &ServerOptions) -> Self {
        Self::new(options.connect_timeout(), options.prefetch)
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| NetError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    pub async fn get(&self, url: &str) -> Result<ClientResponse> {
        self.request(Method::GET, url, HeaderMap::new(), None).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<ClientResponse> {
        self.request(Method::POST, url, HeaderMap::new(), Some(body.into()))
            .await
    }

    /// Perform one exchange and classify the status.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<ClientResponse> {
        let url = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        let (host, port, authority) = endpoint(&url)?;
        let stream = self.connect(&host, port).await?;

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Client connection ended with error");
            }
        });

        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let mut request = Request::builder()
            .method(method.clone())
            .uri(target)
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| invalid(e.to_string()))?;
        *request.headers_mut() = headers;
        let host_value = HeaderValue::from_str(&authority).map_err(|e| invalid(e.to_string()))?;
        request.headers_mut().insert(header::HOST, host_value);

        let response = sender.send_request(request).await?;
        let status = response.status();
        tracing::debug!(method = %method, url = %url, status = status.as_u16(), "Client exchange");

        if status.is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(NetError::RedirectResponse { status, location });
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(NetError::ClientErrorResponse { status });
        }

        let (parts, incoming) = response.into_parts();
        let (body, producer) = bridge::channel();
        tokio::spawn(pump_body(incoming, producer, Pipeline::default()));
        Ok(ClientResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            prefetch: self.prefetch,
        })
    }

    /// Open a client WebSocket session.
    pub async fn ws(&self, url: &str, protocols: Option<&str>) -> Result<WebSocketSession> {
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if parsed.scheme() != "ws" {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        let (host, port, _) = endpoint(&parsed)?;
        let stream = self.connect(&host, port).await?;

        let mut request = url.into_client_request()?;
        if let Some(protocols) = protocols {
            let value = protocols
                .parse()
                .map_err(|_| NetError::Upgrade(format!("invalid subprotocol list {protocols}")))?;
            request.headers_mut().insert("sec-websocket-protocol", value);
        }

        let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
        let protocol = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        tracing::debug!(url = %parsed, protocol = ?protocol, "Client WebSocket session opened");

        Ok(spawn_session(
            ws,
            SessionConfig {
                prefetch: self.prefetch,
                pipeline: Pipeline::default(),
                keep_alive: true,
                shutdown: None,
                protocol,
            },
            None,
        ))
    }
}

/// A successful (1xx/2xx) response with a demand-driven body.
#[derive(Debug)]
pub struct ClientResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: DemandBridge<Bytes>,
    prefetch: Prefetch,
}

impl ClientResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn receive(&self) -> Result<Inbound<Bytes>> {
        self.body.attach(Demand::Window(self.prefetch))
    }

    pub fn receive_with(&self, demand: Demand) -> Result<Inbound<Bytes>> {
        self.body.attach(demand)
    }

    /// Collect the whole body.
    pub async fn aggregate(&self) -> Result<Bytes> {
        let mut inbound = self.receive()?;
        let mut out = BytesMut::new();
        while let Some(chunk) = inbound.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    pub fn receive_multipart(&self) -> Result<Multipart> {
        Multipart::decode(&self.headers, self.receive()?)
    }
}
