//! RPC server: method registry, dispatch and peer broadcast.
//!
//! Each accepted connection gets a reader loop and a single writer task fed
//! by an unbounded queue. Every request runs in its own task, so a slow
//! handler never blocks the connection and responses may go out in any
//! order. A handler that errors or panics produces an error response; the
//! connection stays open.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::{read_frame, write_frame};
use super::protocol::{
    ErrorObject, Incoming, Notification, PROTOCOL_VERSION, Request, Response, VERSION_METHOD,
};

pub type HandlerResult = Result<Value, ErrorObject>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

struct ServerInner {
    handlers: DashMap<String, Handler>,
    peers: DashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
    next_peer: AtomicU64,
}

/// Cheap to clone; clones share handlers and peers.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    /// Create a server with the built-in `protocol/version` method.
    pub fn new() -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                handlers: DashMap::new(),
                peers: DashMap::new(),
                next_peer: AtomicU64::new(1),
            }),
        };
        server.register_sync(VERSION_METHOD, |_| {
            Ok(json!({
                "protocol": PROTOCOL_VERSION,
                "server": env!("CARGO_PKG_VERSION"),
            }))
        });
        server
    }

    /// Register an async handler, replacing any previous one for `method`.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |params| -> HandlerFuture { Box::pin(handler(params)) });
        self.inner.handlers.insert(method.into(), handler);
    }

    /// Register a synchronous handler.
    pub fn register_sync<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params| {
            let handler = Arc::clone(&handler);
            async move { handler(params) }
        });
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        methods.sort();
        methods
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Send a notification to every connected peer. Returns how many
    /// peers it was queued for.
    pub fn broadcast(&self, kind: &str, data: Value) -> usize {
        let body = match serde_json::to_vec(&Notification::new(kind, data)) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    target: "tincture::rpc::server",
                    "Failed to encode notification {}: {}",
                    kind,
                    e
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.inner.peers.iter() {
            if peer.value().send(body.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(
            target: "tincture::rpc::server",
            "Broadcast {} to {} peers",
            kind,
            delivered
        );
        delivered
    }

    /// Process one frame body and produce the response to send, if any.
    ///
    /// Responses and notifications from peers are accepted and dropped.
    pub async fn handle_message(&self, bytes: &[u8]) -> Option<Response> {
        match Incoming::parse(bytes) {
            Ok(Incoming::Request(request)) => Some(self.dispatch(request).await),
            Ok(Incoming::Response(response)) => {
                debug!(
                    target: "tincture::rpc::server",
                    "Ignoring response from peer (id {})",
                    response.id
                );
                None
            }
            Ok(Incoming::Notification(notification)) => {
                debug!(
                    target: "tincture::rpc::server",
                    "Ignoring notification from peer: {}",
                    notification.kind
                );
                None
            }
            Err((id, error)) => {
                debug!(
                    target: "tincture::rpc::server",
                    "Rejecting message: {}",
                    error
                );
                Some(Response::failure(id, error))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        let Request { id, method, params } = request;

        let handler = self
            .inner
            .handlers
            .get(&method)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            debug!(
                target: "tincture::rpc::server",
                "Unknown method {}",
                method
            );
            return Response::failure(id, ErrorObject::method_not_found(&method));
        };

        // The handler is invoked inside the task so a panic while building
        // its future is caught too.
        let outcome = tokio::spawn(async move { handler(params).await }).await;
        match outcome {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(error)) => {
                warn!(
                    target: "tincture::rpc::server",
                    "Handler {} failed: {}",
                    method,
                    error
                );
                Response::failure(id, error)
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("handler {method} panicked")
                } else {
                    format!("handler {method} was cancelled")
                };
                warn!(target: "tincture::rpc::server", "{}", message);
                Response::failure(
                    id,
                    ErrorObject::internal(message).with_data(json!({ "kind": "internal" })),
                )
            }
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(target: "tincture::rpc::server", "Listening on {}", addr);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "tincture::rpc::server", "Shutting down listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(target: "tincture::rpc::server", "Accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        self.serve_connection(stream, shutdown.child_token());
                    }
                    Err(e) => {
                        warn!(target: "tincture::rpc::server", "Accept failed: {}", e);
                    }
                },
            }
        }
    }

    /// Serve one connection on a background task.
    pub fn serve_connection<S>(&self, stream: S, shutdown: CancellationToken) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move { server.run_connection(stream, shutdown).await })
    }

    async fn run_connection<S>(self, stream: S, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let peer_id = self.inner.next_peer.fetch_add(1, Ordering::Relaxed);
        self.inner.peers.insert(peer_id, tx.clone());

        let writer_shutdown = shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    body = rx.recv() => {
                        let Some(body) = body else { break };
                        if let Err(e) = write_frame(&mut write_half, &body).await {
                            debug!(target: "tincture::rpc::server", "Write failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(body)) => {
                        let server = self.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let Some(response) = server.handle_message(&body).await else {
                                return;
                            };
                            match serde_json::to_vec(&response) {
                                Ok(bytes) => {
                                    let _ = tx.send(bytes);
                                }
                                Err(e) => warn!(
                                    target: "tincture::rpc::server",
                                    "Failed to encode response: {}",
                                    e
                                ),
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "tincture::rpc::server", "Dropping connection: {}", e);
                        break;
                    }
                },
            }
        }

        self.inner.peers.remove(&peer_id);
        drop(tx);
        // In-flight handlers still hold senders; the writer drains their
        // responses and exits once they finish.
        let _ = writer.await;
        info!(target: "tincture::rpc::server", "Connection {} closed", peer_id);
    }
}
