//! RPC client with one logical connection.
//!
//! Requests issued while the socket is down are queued as encoded frames
//! and flushed in issue order once a connection is established. Every
//! request is registered in the pending table before its frame is sent or
//! queued, carries a timeout, and is removed from the table exactly once.
//! When the peer goes away the client retries at a fixed interval up to a
//! bounded number of attempts, then enters the terminal `Exhausted` state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::connection_state::{ConnectionState, ReconnectOutcome};
use super::framing::{read_frame, write_frame};
use super::protocol::{ErrorObject, Incoming, Notification, PROTOCOL_VERSION, Request, VERSION_METHOD};
use crate::error::LockResultExt;
use crate::pending::PendingMap;

/// Pending tag for requests that have not been written to any socket.
/// Live connections use epochs starting at 1.
const QUEUED: u64 = 0;

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request {method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("connection lost before a response arrived")]
    Disconnected,

    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("remote error: {0}")]
    Remote(#[from] ErrorObject),

    #[error("protocol mismatch: client speaks {client}, server speaks {server}")]
    ProtocolMismatch { client: u32, server: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

struct Link {
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    epoch: u64,
    queue: VecDeque<(u64, Vec<u8>)>,
}

struct ClientInner {
    addr: String,
    options: ClientOptions,
    pending: PendingMap<Value, ClientError>,
    next_id: AtomicU64,
    next_epoch: AtomicU64,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Notification>,
    reconnecting: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a disconnected client. Requests queue until [`reconnect`]
    /// succeeds.
    ///
    /// [`reconnect`]: RpcClient::reconnect
    pub fn new(addr: impl Into<String>, options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                addr: addr.into(),
                options,
                pending: PendingMap::new(),
                next_id: AtomicU64::new(1),
                next_epoch: AtomicU64::new(1),
                link: Mutex::new(Link {
                    outbound: None,
                    epoch: QUEUED,
                    queue: VecDeque::new(),
                }),
                state,
                notifications,
                reconnecting: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a client and connect, retrying per `options`.
    pub async fn connect(addr: impl Into<String>, options: ClientOptions) -> Result<Self, ClientError> {
        let client = Self::new(addr, options);
        match client.reconnect().await {
            ReconnectOutcome::Connected => Ok(client),
            ReconnectOutcome::Exhausted { attempts } => Err(ClientError::Exhausted { attempts }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions, including the terminal `Exhausted`.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner
            .link
            .lock()
            .recover_poison("RpcClient::queued_count")
            .queue
            .len()
    }

    /// Run one reconnect cycle. Returns immediately if already connected.
    pub async fn reconnect(&self) -> ReconnectOutcome {
        self.inner.reconnect().await
    }

    /// Register and send (or queue) a request, without waiting for it.
    ///
    /// Calls made in sequence reach the server in the same sequence.
    pub fn start_request(&self, method: &str, params: Value) -> Result<PendingCall, ClientError> {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&Request {
            id: Value::from(id),
            method: method.to_string(),
            params,
        })?;

        let rx = {
            let mut link = inner.link.lock().recover_poison("RpcClient::start_request");
            if inner.shutdown.is_cancelled() {
                return Err(ClientError::Closed);
            }
            if !inner.state.borrow().accepts_requests() {
                return Err(ClientError::Exhausted {
                    attempts: inner.options.max_reconnect_attempts,
                });
            }

            let tag = if link.outbound.is_some() {
                link.epoch
            } else {
                QUEUED
            };
            let rx = inner.pending.register(id, tag).ok_or(ClientError::Closed)?;

            let unsent = match &link.outbound {
                Some(tx) => tx.send(body).err().map(|e| e.0),
                None => Some(body),
            };
            if let Some(body) = unsent {
                if tag != QUEUED {
                    inner.pending.retag(id, QUEUED);
                }
                debug!(
                    target: "tincture::rpc::client",
                    "Queued request {} ({}) while disconnected",
                    id,
                    method
                );
                link.queue.push_back((id, body));
            }
            rx
        };

        Ok(PendingCall {
            id,
            method: method.to_string(),
            timeout: inner.options.request_timeout,
            rx,
            inner: Arc::clone(inner),
        })
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.start_request(method, params)?.wait().await
    }

    /// Typed wrapper around [`request`](RpcClient::request).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the server for its protocol version and compare it with ours.
    pub async fn check_protocol_version(&self) -> Result<u32, ClientError> {
        let result = self.request(VERSION_METHOD, Value::Null).await?;
        let server = result
            .get("protocol")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if server != PROTOCOL_VERSION {
            return Err(ClientError::ProtocolMismatch {
                client: PROTOCOL_VERSION,
                server,
            });
        }
        Ok(server)
    }

    /// Stop background tasks and fail everything still waiting.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl ClientInner {
    async fn reconnect(self: &Arc<Self>) -> ReconnectOutcome {
        let _guard = self.reconnecting.lock().await;
        let max = self.options.max_reconnect_attempts;
        let current = *self.state.borrow();
        match current {
            ConnectionState::Connected => return ReconnectOutcome::Connected,
            ConnectionState::Exhausted => return ReconnectOutcome::Exhausted { attempts: max },
            _ => {}
        }

        let mut attempts = 0;
        while attempts < max && !self.shutdown.is_cancelled() {
            attempts += 1;
            self.state.send_replace(ConnectionState::Connecting);
            info!(
                target: "tincture::rpc::client",
                "Connecting to {} (attempt {}/{})",
                self.addr,
                attempts,
                max
            );

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                connected = TcpStream::connect(&self.addr) => connected,
            };
            match connected {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.attach(stream);
                    return ReconnectOutcome::Connected;
                }
                Err(e) => warn!(
                    target: "tincture::rpc::client",
                    "Connection attempt {} to {} failed: {}",
                    attempts,
                    self.addr,
                    e
                ),
            }

            if attempts < max {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.options.reconnect_interval) => {}
                }
            }
        }

        if self.shutdown.is_cancelled() {
            self.state.send_replace(ConnectionState::Disconnected);
            return ReconnectOutcome::Exhausted { attempts };
        }

        error!(
            target: "tincture::rpc::client",
            "Giving up on {} after {} attempts",
            self.addr,
            attempts
        );
        {
            let mut link = self.link.lock().recover_poison("RpcClient::reconnect");
            self.state.send_replace(ConnectionState::Exhausted);
            link.queue.clear();
        }
        self.pending
            .fail_all(|| ClientError::Exhausted { attempts });
        ReconnectOutcome::Exhausted { attempts }
    }

    fn attach(self: &Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        let flushed = {
            let mut link = self.link.lock().recover_poison("RpcClient::attach");
            let mut flushed = 0;
            while let Some((id, body)) = link.queue.pop_front() {
                if !self.pending.retag(id, epoch) {
                    continue;
                }
                let _ = tx.send(body);
                flushed += 1;
            }
            link.outbound = Some(tx);
            link.epoch = epoch;
            flushed
        };
        self.state.send_replace(ConnectionState::Connected);
        info!(
            target: "tincture::rpc::client",
            "Connected to {} (epoch {}, flushed {} queued requests)",
            self.addr,
            epoch,
            flushed
        );

        tokio::spawn(write_loop(write_half, rx, self.shutdown.clone()));
        tokio::spawn(Arc::clone(self).read_loop(BufReader::new(read_half), epoch));
    }

    async fn read_loop(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>, epoch: u64) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(body)) => self.handle_frame(&body),
                    Ok(None) => {
                        debug!(target: "tincture::rpc::client", "Server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(target: "tincture::rpc::client", "Read failed: {}", e);
                        break;
                    }
                },
            }
        }
        self.handle_disconnect(epoch);
    }

    fn handle_frame(&self, body: &[u8]) {
        match Incoming::parse(body) {
            Ok(Incoming::Response(response)) => {
                let Some(id) = response.id.as_u64() else {
                    debug!(
                        target: "tincture::rpc::client",
                        "Dropping response with non-numeric id {}",
                        response.id
                    );
                    return;
                };
                let outcome = response.into_result().map_err(ClientError::Remote);
                if !self.pending.complete(id, outcome) {
                    debug!(
                        target: "tincture::rpc::client",
                        "Dropping orphaned response {}",
                        id
                    );
                }
            }
            Ok(Incoming::Notification(notification)) => {
                // No subscribers is fine.
                let _ = self.notifications.send(notification);
            }
            Ok(Incoming::Request(request)) => {
                debug!(
                    target: "tincture::rpc::client",
                    "Ignoring server-initiated request {}",
                    request.method
                );
            }
            Err((_, e)) => {
                warn!(target: "tincture::rpc::client", "Malformed message: {}", e);
            }
        }
    }

    fn handle_disconnect(self: &Arc<Self>, epoch: u64) {
        {
            let mut link = self.link.lock().recover_poison("RpcClient::handle_disconnect");
            if link.epoch != epoch || link.outbound.is_none() {
                return;
            }
            link.outbound = None;
        }
        let failed = self
            .pending
            .fail_tagged(epoch, || ClientError::Disconnected);
        if self.shutdown.is_cancelled() {
            return;
        }

        self.state.send_replace(ConnectionState::Disconnected);
        warn!(
            target: "tincture::rpc::client",
            "Lost connection to {} ({} in-flight requests failed), reconnecting",
            self.addr,
            failed
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect().await;
        });
    }

    /// Drop a request the caller stopped waiting for.
    fn forget(&self, id: u64) {
        if self.pending.remove(id) {
            self.link
                .lock()
                .recover_poison("RpcClient::forget")
                .queue
                .retain(|(queued, _)| *queued != id);
        }
    }

    fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        {
            let mut link = self.link.lock().recover_poison("RpcClient::close");
            link.outbound = None;
            link.queue.clear();
        }
        let failed = self.pending.fail_all(|| ClientError::Closed);
        debug!(
            target: "tincture::rpc::client",
            "Client for {} closed ({} requests failed)",
            self.addr,
            failed
        );
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            body = rx.recv() => {
                let Some(body) = body else { break };
                if let Err(e) = write_frame(&mut writer, &body).await {
                    warn!(target: "tincture::rpc::client", "Write failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// A request that has been sent or queued. Dropping it abandons the
/// request and removes its pending entry.
pub struct PendingCall {
    id: u64,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
    inner: Arc<ClientInner>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response or the request timeout, whichever comes first.
    pub async fn wait(mut self) -> Result<Value, ClientError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                warn!(
                    target: "tincture::rpc::client",
                    "Request {} ({}) timed out after {:?}",
                    self.id,
                    self.method,
                    self.timeout
                );
                Err(ClientError::Timeout {
                    method: self.method.clone(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.inner.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::METHOD_NOT_FOUND;
    use crate::rpc::server::RpcServer;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn fast_options() -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(20),
            max_reconnect_attempts: 3,
        }
    }

    fn test_server() -> RpcServer {
        let server = RpcServer::new();
        server.register_sync("echo", Ok);
        server.register("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        });
        server
    }

    async fn spawn_server(server: &RpcServer) -> (String, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (addr, serve_on(server, listener))
    }

    fn serve_on(server: &RpcServer, listener: TcpListener) -> CancellationToken {
        let token = CancellationToken::new();
        let server = server.clone();
        let shutdown = token.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await });
        token
    }

    async fn wait_for(client: &RpcClient, state: ConnectionState) {
        let mut rx = client.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn round_trips_a_request() {
        let server = test_server();
        let (addr, _token) = spawn_server(&server).await;
        let client = RpcClient::connect(addr, fast_options()).await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        let result = client.request("echo", json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"a": 1}));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.check_protocol_version().await.unwrap(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn remote_errors_keep_their_code() {
        let server = test_server();
        let (addr, _token) = spawn_server(&server).await;
        let client = RpcClient::connect(addr, fast_options()).await.unwrap();

        let error = client.request("nope", Value::Null).await.unwrap_err();
        assert!(matches!(error, ClientError::Remote(ref e) if e.code == METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn queued_requests_are_delivered_in_issue_order() {
        let server = RpcServer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        server.register_sync("record", move |params| {
            recorder.lock().unwrap().push(params.clone());
            Ok(params)
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = RpcClient::new(addr, fast_options());

        let calls: Vec<PendingCall> = (0..5)
            .map(|n| client.start_request("record", json!(n)).unwrap())
            .collect();
        assert_eq!(client.queued_count(), 5);
        assert_eq!(client.pending_count(), 5);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let _token = serve_on(&server, listener);
        assert_eq!(client.reconnect().await, ReconnectOutcome::Connected);
        assert_eq!(client.queued_count(), 0);

        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.wait().await.unwrap(), json!(n));
        }
        assert_eq!(*seen.lock().unwrap(), (0..5).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_request_is_removed_and_connection_survives() {
        let server = test_server();
        let (addr, _token) = spawn_server(&server).await;
        let options = ClientOptions {
            request_timeout: Duration::from_millis(50),
            ..fast_options()
        };
        let client = RpcClient::connect(addr, options).await.unwrap();

        let error = client.request("slow", Value::Null).await.unwrap_err();
        assert!(matches!(error, ClientError::Timeout { ref method, timeout_ms: 50 } if method == "slow"));
        assert_eq!(client.pending_count(), 0);

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.request("echo", json!(1)).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn dropping_a_pending_call_removes_it() {
        let client = RpcClient::new("127.0.0.1:9", fast_options());
        let call = client.start_request("echo", json!(1)).unwrap();
        assert_eq!(client.pending_count(), 1);
        drop(call);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.queued_count(), 0);
    }

    #[tokio::test]
    async fn exhausting_reconnects_is_terminal() {
        // Grab a free port, then close it so connections are refused.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let client = RpcClient::new(addr, fast_options());
        let queued = client.start_request("echo", json!(1)).unwrap();

        assert_eq!(
            client.reconnect().await,
            ReconnectOutcome::Exhausted { attempts: 3 }
        );
        assert_eq!(client.state(), ConnectionState::Exhausted);
        assert!(matches!(
            queued.wait().await,
            Err(ClientError::Exhausted { attempts: 3 })
        ));
        assert!(matches!(
            client.start_request("echo", json!(2)),
            Err(ClientError::Exhausted { .. })
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn connect_reports_exhaustion() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let result = RpcClient::connect(addr, fast_options()).await;
        assert!(matches!(result, Err(ClientError::Exhausted { attempts: 3 })));
    }

    #[tokio::test]
    async fn reconnects_and_flushes_after_connection_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let options = ClientOptions {
            max_reconnect_attempts: 200,
            ..fast_options()
        };
        let client = RpcClient::connect(addr.clone(), options).await.unwrap();

        // Close the listener before the accepted socket so every reconnect
        // attempt is refused until the real server comes up.
        let (socket, _) = listener.accept().await.unwrap();
        drop(listener);
        drop(socket);
        let mut state = client.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let during = client.start_request("echo", json!("during")).unwrap();
        let after = client.start_request("echo", json!("after")).unwrap();
        assert_eq!(client.queued_count(), 2);

        let server = test_server();
        let listener = TcpListener::bind(&addr).await.unwrap();
        let _token = serve_on(&server, listener);
        wait_for(&client, ConnectionState::Connected).await;

        assert_eq!(during.wait().await.unwrap(), json!("during"));
        assert_eq!(after.wait().await.unwrap(), json!("after"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn notifications_are_published_to_subscribers() {
        let server = test_server();
        let (addr, _token) = spawn_server(&server).await;
        let client = RpcClient::connect(addr, fast_options()).await.unwrap();
        let mut notifications = client.notifications();

        while server.peer_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.broadcast("types:invalidated", json!({"path": "/a.ts"}));

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.kind, "types:invalidated");
        assert_eq!(notification.data["path"], "/a.ts");
    }

    #[tokio::test]
    async fn closing_fails_waiters() {
        let client = RpcClient::new("127.0.0.1:9", fast_options());
        let call = client.start_request("echo", json!(1)).unwrap();
        client.close();
        assert!(matches!(call.wait().await, Err(ClientError::Closed)));
        assert!(matches!(
            client.start_request("echo", json!(2)),
            Err(ClientError::Closed)
        ));
    }
}
