//! HTTP server setup and request dispatch.
//!
//! # Responsibilities
//! - Register routes (predicate + handler) before start
//! - Serve HTTP/1.1 connections with hyper, upgrades enabled
//! - Run every matching handler for a request, in registration order
//! - Map handler outcomes to responses (404 fall-through, 500 on failure)
//! - Graceful connection close on drain
//! - Observability (metrics, request ids)

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::ServerOptions;
use crate::error::{NetError, Result};
use crate::http::body::ResponseBody;
use crate::http::channel::{ChannelContext, HttpChannel, RequestHead};
use crate::http::files;
use crate::http::websocket::{self, WebSocketSession};
use crate::lifecycle::server::{ServeContext, ServerCore};
use crate::lifecycle::Phase;
use crate::net::connection::TransportKind;
use crate::observability::metrics;
use crate::routing::{HttpPredicate, Predicate, PrefixPredicate, RouteTable};
use crate::transport::tcp::accept_loop;
use crate::transport::ConnectionContext;

/// Type-erased HTTP handler.
pub type HttpHandler = Arc<dyn Fn(HttpChannel) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> HttpHandler
where
    F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |channel| -> BoxFuture<'static, Result<()>> { Box::pin(handler(channel)) })
}

/// HTTP server with multiplexed routing.
pub struct HttpServer {
    core: ServerCore,
    routes: RouteTable<HttpHandler>,
    default: Option<HttpHandler>,
}

impl HttpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            core: ServerCore::new(TransportKind::Http, options),
            routes: RouteTable::new(),
            default: None,
        }
    }

    /// Register a handler for every request `predicate` accepts.
    pub fn route<P, F, Fut>(mut self, predicate: P, handler: F) -> Self
    where
        P: Predicate + 'static,
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.routes.add(predicate, boxed(handler));
        self
    }

    pub fn get<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.route(HttpPredicate::get(path), handler)
    }

    pub fn post<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.route(HttpPredicate::post(path), handler)
    }

    pub fn put<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.route(HttpPredicate::put(path), handler)
    }

    pub fn delete<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.route(HttpPredicate::delete(path), handler)
    }

    /// Serve files below `root` for GET requests under `prefix`.
    pub fn directory(mut self, prefix: &str, root: impl Into<PathBuf>) -> Self {
        let predicate = PrefixPredicate::new(Some(Method::GET), prefix);
        let handler = files::directory_handler(predicate.prefix().to_string(), root.into());
        self.routes.add(predicate, handler);
        self
    }

    /// Serve one file for GET requests on `path`.
    pub fn file(mut self, path: &str, file: impl Into<PathBuf>) -> Self {
        self.routes
            .add(HttpPredicate::get(path), files::file_handler(file.into()));
        self
    }

    /// WebSocket route. Non-upgrade requests get `400 Bad Request`.
    ///
    /// `protocols` is a comma-separated list of supported subprotocols
    /// (`*` accepts any).
    pub fn ws<F, Fut>(mut self, path: &str, handler: F, protocols: Option<&str>) -> Self
    where
        F: Fn(WebSocketSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let protocols: Option<Arc<str>> = protocols.map(Arc::from);
        let handler = Arc::new(handler);
        self.routes.add(
            HttpPredicate::get(path),
            boxed(move |channel: HttpChannel| {
                let protocols = protocols.clone();
                let handler = Arc::clone(&handler);
                async move {
                    if !websocket::is_upgrade_request(channel.headers()) {
                        channel.set_status(StatusCode::BAD_REQUEST)?;
                        return channel.send_string("expected a websocket upgrade").await;
                    }
                    let session = match channel.upgrade_websocket(protocols.as_deref()).await {
                        Ok(session) => session,
                        Err(NetError::Upgrade(reason)) if channel.headers_sent() => {
                            tracing::debug!(request_id = %channel.id(), reason = %reason, "WebSocket upgrade rejected");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    };
                    let outcome = handler(session.clone()).await;
                    if let Err(e) = session.close().await {
                        tracing::debug!(error = %e, "WebSocket close failed");
                    }
                    outcome
                }
            }),
        );
        self
    }

    /// Handler used when no route matches.
    pub fn default_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HttpChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.default = Some(boxed(handler));
        self
    }

    fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            routes: self.routes.clone(),
            default: self.default.clone(),
        })
    }

    /// Bind and start serving. Resolves with the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let dispatcher = self.dispatcher();
        self.core.start(move |ctx| serve(ctx, dispatcher)).await
    }

    /// Like [`start`](Self::start), failing with `StartTimeout` after `timeout`.
    pub async fn start_and_await(&self, timeout: Duration) -> Result<SocketAddr> {
        let dispatcher = self.dispatcher();
        self.core
            .start_within(move |ctx| serve(ctx, dispatcher), timeout)
            .await
    }

    /// Graceful shutdown. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.core.shutdown().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn is_started(&self) -> bool {
        self.phase().is_running()
    }

    pub fn is_terminated(&self) -> bool {
        self.phase().is_terminated()
    }

    pub fn active_connections(&self) -> usize {
        self.core.tracker().active_count()
    }
}

struct Dispatcher {
    routes: RouteTable<HttpHandler>,
    default: Option<HttpHandler>,
}

impl Dispatcher {
    async fn dispatch(&self, mut request: Request<Incoming>, cx: ChannelContext) -> Response<ResponseBody> {
        let start_time = Instant::now();
        let upgrade = hyper::upgrade::on(&mut request);
        let (parts, body) = request.into_parts();
        let method_str = parts.method.to_string();

        let selection = self.routes.select(&parts.method, parts.uri.path());
        let (head_tx, head_rx) = oneshot::channel();
        let head = RequestHead {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        };
        let channel = HttpChannel::new(head, body, upgrade, selection.params, &cx, head_tx);
        let request_id = channel.id();

        let handlers = if selection.handlers.is_empty() {
            self.default.iter().cloned().collect()
        } else {
            selection.handlers
        };
        tracing::debug!(
            request_id = %request_id,
            method = %channel.method(),
            path = %channel.path(),
            handlers = handlers.len(),
            "Dispatching request"
        );
        tokio::spawn(run_chain(channel, handlers));

        let response = match head_rx.await {
            Ok(response) => response,
            Err(_) => {
                tracing::error!(request_id = %request_id, "Handler chain ended without a response");
                let mut response = Response::new(ResponseBody::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        };
        metrics::record_request(&method_str, response.status().as_u16(), start_time);
        response
    }
}

/// Run handlers in order. `NotFound` before the head is flushed falls
/// through; any other failure stops the chain.
async fn run_chain(channel: HttpChannel, handlers: Vec<HttpHandler>) {
    let mut not_found = handlers.is_empty();
    let mut failure = None;

    for handler in handlers {
        let outcome = AssertUnwindSafe(handler(channel.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(NetError::handler("handler panicked")));
        match outcome {
            Ok(()) => {}
            Err(NetError::NotFound(what)) if !channel.headers_sent() => {
                tracing::debug!(request_id = %channel.id(), resource = %what, "Not found, trying next route");
                not_found = true;
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    match failure {
        None => {
            if not_found && !channel.headers_sent() {
                let _ = channel.set_status(StatusCode::NOT_FOUND);
            }
            channel.finish().await;
        }
        Some(e) if e.is_remote_closed() => {
            tracing::debug!(request_id = %channel.id(), "Client went away");
            channel.abort(e).await;
        }
        Some(e) if channel.headers_sent() => {
            tracing::warn!(request_id = %channel.id(), error = %e, "Handler failed after headers were sent");
            channel.abort(e).await;
        }
        Some(e) => {
            tracing::error!(request_id = %channel.id(), error = %e, "Handler failed");
            let _ = channel.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            channel.finish().await;
        }
    }
}

async fn serve(ctx: ServeContext, dispatcher: Arc<Dispatcher>) {
    accept_loop(ctx, TransportKind::Http, move |stream, cx| {
        serve_connection(stream, cx, Arc::clone(&dispatcher))
    })
    .await
}

async fn serve_connection(stream: TcpStream, cx: ConnectionContext, dispatcher: Arc<Dispatcher>) {
    let channel_cx = ChannelContext {
        info: cx.info.clone(),
        keep_alive: cx.options.keep_alive,
        prefetch: cx.options.prefetch,
        pipeline: cx.pipeline(),
        shutdown: cx.shutdown.clone(),
    };
    let service = service_fn(move |request| {
        let dispatcher = Arc::clone(&dispatcher);
        let channel_cx = channel_cx.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(request, channel_cx).await) }
    });

    let connection = http1::Builder::new()
        .keep_alive(cx.options.keep_alive)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    let mut drain = cx.shutdown.clone();
    let mut force = cx.shutdown.clone();
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %cx.info.id, error = %e, "HTTP connection ended with error");
                }
                break;
            }
            _ = drain.draining(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = force.forced() => {
                tracing::debug!(connection_id = %cx.info.id, "HTTP connection force-closed");
                break;
            }
        }
    }
}
