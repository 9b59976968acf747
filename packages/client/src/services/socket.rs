//! Managed socket connection, keyed off the auth token.
//!
//! This service owns exactly one logical connection at a time. A manager
//! task watches the token stream: when the token changes, the previous
//! connection is fully torn down (event bus dropped, pending acks orphaned,
//! socket closed) before a connection for the new token is established.
//! Within one logical connection, transient transport loss is handled by
//! reconnecting with a fixed delay; subscriptions and pending state survive
//! the retry loop and die only when the logical connection is replaced.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

use parlor_shared::protocol::SocketFrame;

use crate::scope::Scope;
use crate::services::messaging::MessagingService;

const RECONNECT_INTERVAL_SECS: u64 = 5;

/// One occurrence of a named server-pushed event.
#[derive(Debug, Clone)]
pub struct SocketEvent {
    /// The event name.
    pub event: String,
    /// The data arguments the server sent.
    pub args: Vec<Value>,
    /// Present when the server expects an acknowledgement for this event.
    pub ack: Option<AckResponder>,
}

/// Handle for acknowledging a server-initiated request/response event.
#[derive(Debug, Clone)]
pub struct AckResponder {
    ack_id: u64,
    outbound: mpsc::UnboundedSender<SocketFrame>,
}

impl AckResponder {
    /// Send the acknowledgement value back to the server.
    pub fn respond(self, value: Value) {
        // The connection may already be gone; an unanswerable ack is dropped.
        let _ = self.outbound.send(SocketFrame::ack(self.ack_id, value));
    }
}

/// Per-connection shared state: the outbound channel, the event bus, and the
/// pending acknowledgement map. All of it is replaced atomically with the
/// connection.
#[derive(Clone)]
struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<SocketFrame>,
    bus: Arc<std::sync::Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SocketEvent>>>>>,
    pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    ack_counter: Arc<AtomicU64>,
    scope: Scope,
    task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ConnectionHandle {
    /// Drop every outstanding ack waiter. Their awaiters resolve to "no
    /// result" rather than hanging on a connection that no longer exists.
    fn orphan_pending(&self) {
        self.pending.lock().expect("pending map poisoned").clear();
    }

    /// Drop every event subscription so subscriber streams end.
    fn drop_subscriptions(&self) {
        self.bus.lock().expect("event bus poisoned").clear();
    }
}

struct SocketInner {
    socket_url: String,
    messaging: MessagingService,
    current: std::sync::Mutex<Option<ConnectionHandle>>,
    connected_tx: watch::Sender<bool>,
    epoch_tx: watch::Sender<u64>,
}

/// Socket connection management service.
#[derive(Clone)]
pub struct SocketService {
    inner: Arc<SocketInner>,
}

impl SocketService {
    /// Create the service and start the connection manager.
    ///
    /// # Arguments
    ///
    /// * `scope` - Lifetime of the service; cancelling it tears everything down
    /// * `socket_url` - The websocket endpoint, e.g. `ws://host:port/ws`
    /// * `token` - Watch of the current auth token
    /// * `messaging` - Sink for user-facing error messages
    pub fn new(
        scope: &Scope,
        socket_url: impl Into<String>,
        token: watch::Receiver<Option<String>>,
        messaging: MessagingService,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (epoch_tx, _) = watch::channel(0u64);
        let inner = Arc::new(SocketInner {
            socket_url: socket_url.into(),
            messaging,
            current: std::sync::Mutex::new(None),
            connected_tx,
            epoch_tx,
        });

        let manager_inner = inner.clone();
        let manager_scope = scope.clone();
        tokio::spawn(run_manager(manager_inner, manager_scope, token));

        Self { inner }
    }

    fn current(&self) -> Option<ConnectionHandle> {
        self.inner.current.lock().expect("connection slot poisoned").clone()
    }

    /// Whether the transport is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Watch of transport-level liveness.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Watch of the logical-connection epoch. The epoch increments each time
    /// a connection is established for a token; consumers use it to know
    /// when to resubscribe to events. Zero means no connection has ever been
    /// created.
    pub fn connection_epochs(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    /// Send a fire-and-forget message on the current connection. Without a
    /// connection this is a no-op that reports the condition; it never
    /// panics or errors.
    pub fn send_message(&self, event: &str, args: Vec<Value>) {
        let Some(handle) = self.current() else {
            tracing::error!(
                "Attempted to send '{}', but no socket exists to send it on.",
                event
            );
            self.inner
                .messaging
                .send_error("Unable to reach the server. Sockets are disconnected.");
            return;
        };
        let _ = handle.outbound.send(SocketFrame::event(event, args));
    }

    /// Send a message and await a single acknowledgement value from the
    /// server. Resolves to `None` when no connection exists, or when the
    /// connection goes away before the server answers. Concurrent calls each
    /// await their own acknowledgement.
    pub async fn send_message_with_response(&self, event: &str, args: Vec<Value>) -> Option<Value> {
        let Some(handle) = self.current() else {
            tracing::error!(
                "Attempted to send '{}', but no socket exists to send it on.",
                event
            );
            self.inner
                .messaging
                .send_error("Unable to reach the server. Sockets are disconnected.");
            return None;
        };

        let ack_id = handle.ack_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        handle
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(ack_id, tx);

        if handle
            .outbound
            .send(SocketFrame::request(event, args, ack_id))
            .is_err()
        {
            handle
                .pending
                .lock()
                .expect("pending map poisoned")
                .remove(&ack_id);
            return None;
        }

        rx.await.ok()
    }

    /// Subscribe to a named server-pushed event on the *current* connection.
    ///
    /// The returned stream goes quiet (ends) when the connection is replaced
    /// or torn down; a fresh call is required against the new connection.
    /// Without a connection, the stream is already ended.
    pub fn subscribe_to_socket_event(&self, event: &str) -> mpsc::UnboundedReceiver<SocketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(handle) = self.current() {
            handle
                .bus
                .lock()
                .expect("event bus poisoned")
                .entry(event.to_string())
                .or_default()
                .push(tx);
        }
        rx
    }

    /// Run `handler` for every occurrence of `event`, resubscribing whenever
    /// the connection is replaced, until the scope is cancelled. This is the
    /// loop every push-event consumer runs in its own task.
    pub async fn for_each_event<F, Fut>(&self, scope: Scope, event: &str, mut handler: F)
    where
        F: FnMut(SocketEvent) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut epochs = self.connection_epochs();
        // Mark the current epoch as seen; subscribe below covers it.
        epochs.borrow_and_update();

        loop {
            let mut events = self.subscribe_to_socket_event(event);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    occurrence = events.recv() => match occurrence {
                        Some(occurrence) => handler(occurrence).await,
                        None => break,
                    },
                }
            }

            // The stream ended: the connection was replaced or none exists
            // yet. Wait for the next connection before resubscribing.
            tokio::select! {
                _ = scope.cancelled() => return,
                changed = epochs.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl SocketInner {
    /// Tear down the current connection, if any: cancel its task, end its
    /// subscriptions, orphan its pending acks, and wait for the transport to
    /// finish closing. The old connection is fully gone before this returns.
    async fn teardown_current(&self) {
        let handle = self.current.lock().expect("connection slot poisoned").take();
        if let Some(handle) = handle {
            tracing::debug!("Tearing down socket connection");
            handle.scope.cancel();
            handle.drop_subscriptions();
            handle.orphan_pending();
            let task = handle.task.lock().expect("task slot poisoned").take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        self.connected_tx.send_replace(false);
    }
}

/// Watches the token stream and swaps the logical connection accordingly.
async fn run_manager(
    inner: Arc<SocketInner>,
    scope: Scope,
    mut token_rx: watch::Receiver<Option<String>>,
) {
    loop {
        let token = token_rx.borrow_and_update().clone();

        // The previous connection always dies before the next one starts.
        inner.teardown_current().await;

        if let Some(token) = token {
            establish(&inner, token);
        }

        tokio::select! {
            _ = scope.cancelled() => {
                inner.teardown_current().await;
                return;
            }
            changed = token_rx.changed() => {
                if changed.is_err() {
                    // Token service is gone; wind down.
                    inner.teardown_current().await;
                    return;
                }
            }
        }
    }
}

/// Create the per-connection state and spawn the connection task.
fn establish(inner: &Arc<SocketInner>, token: String) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle {
        outbound: outbound_tx,
        bus: Arc::new(std::sync::Mutex::new(HashMap::new())),
        pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
        ack_counter: Arc::new(AtomicU64::new(0)),
        scope: Scope::new(),
        task: Arc::new(std::sync::Mutex::new(None)),
    };

    *inner.current.lock().expect("connection slot poisoned") = Some(handle.clone());
    inner.epoch_tx.send_modify(|epoch| *epoch += 1);

    tracing::info!("Creating new socket connection");
    let task = tokio::spawn(run_connection(inner.clone(), token, handle.clone(), outbound_rx));
    *handle.task.lock().expect("task slot poisoned") = Some(task);
}

/// Connect-and-retry loop for one logical connection. Ends only when the
/// connection scope is cancelled (token change or service teardown).
async fn run_connection(
    inner: Arc<SocketInner>,
    token: String,
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<SocketFrame>,
) {
    loop {
        if handle.scope.is_cancelled() {
            return;
        }

        // The handshake itself must not outlive the connection scope, or a
        // slow connect would stall teardown on a token change.
        let connected = tokio::select! {
            _ = handle.scope.cancelled() => return,
            connected = connect(&inner.socket_url, &token) => connected,
        };
        match connected {
            Ok(ws_stream) => {
                tracing::info!("Socket connected");
                inner.connected_tx.send_replace(true);

                let done = run_transport_session(&handle, ws_stream, &mut outbound_rx).await;

                inner.connected_tx.send_replace(false);
                // Requests in flight when the transport dropped can never be
                // answered on the next transport.
                handle.orphan_pending();

                if done {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Socket connection error: {}", e);
            }
        }

        if handle.scope.is_cancelled() {
            return;
        }
        tracing::info!("Reconnecting in {} seconds...", RECONNECT_INTERVAL_SECS);
        tokio::select! {
            _ = handle.scope.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_INTERVAL_SECS)) => {}
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Open the websocket, carrying the token both as a query parameter and as
/// an Authorization header.
async fn connect(
    socket_url: &str,
    token: &str,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let separator = if socket_url.contains('?') { '&' } else { '?' };
    let url = format!("{socket_url}{separator}token={token}");
    let mut request = url.into_client_request()?;
    match HeaderValue::from_str(token) {
        Ok(value) => {
            request.headers_mut().insert("Authorization", value);
        }
        Err(e) => {
            tracing::warn!("Token is not a valid header value ({}); sending without it", e);
        }
    }
    let (ws_stream, _response) = connect_async(request).await?;
    Ok(ws_stream)
}

/// Pump one live transport until it drops or the connection scope ends.
/// Returns `true` when the logical connection is finished (scope cancelled)
/// and `false` when only the transport was lost.
async fn run_transport_session(
    handle: &ConnectionHandle,
    ws_stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<SocketFrame>,
) -> bool {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = handle.scope.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => match frame.to_wire() {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            tracing::warn!("Failed to send socket message: {}", e);
                            return false;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize socket frame: {}", e);
                    }
                },
                // The service itself was dropped.
                None => return true,
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(handle, &text),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("Server closed the connection");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Socket read error: {}", e);
                    return false;
                }
                None => return false,
            }
        }
    }
}

/// Route one incoming frame: acks resolve their waiter, everything else is
/// fanned out on the event bus. A bad frame is logged and dropped; the event
/// stream is never interrupted by one bad event.
fn dispatch(handle: &ConnectionHandle, text: &str) {
    let frame = match SocketFrame::from_wire(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Dropping unparseable socket frame: {}", e);
            return;
        }
    };

    if frame.is_ack() {
        let Some(ack_id) = frame.ack_id else {
            return;
        };
        let value = frame.args.into_iter().next().unwrap_or(Value::Null);
        let waiter = handle
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&ack_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(value);
            }
            None => {
                tracing::debug!("Received ack {} with no waiter; dropping", ack_id);
            }
        }
        return;
    }

    let ack = frame.ack_id.map(|ack_id| AckResponder {
        ack_id,
        outbound: handle.outbound.clone(),
    });

    let mut bus = handle.bus.lock().expect("event bus poisoned");
    let Some(subscribers) = bus.get_mut(&frame.event) else {
        tracing::debug!("No subscribers for socket event '{}'", frame.event);
        return;
    };
    subscribers.retain(|tx| {
        tx.send(SocketEvent {
            event: frame.event.clone(),
            args: frame.args.clone(),
            ack: ack.clone(),
        })
        .is_ok()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_shared::models::UserMessageLevel;

    fn disconnected_service() -> (SocketService, MessagingService, Scope) {
        let scope = Scope::new();
        let messaging = MessagingService::new();
        let (_token_tx, token_rx) = watch::channel(None);
        let service = SocketService::new(
            &scope,
            "ws://127.0.0.1:1/ws",
            token_rx,
            messaging.clone(),
        );
        (service, messaging, scope)
    }

    #[tokio::test]
    async fn test_send_message_without_connection_is_a_reported_noop() {
        // given:
        let (service, messaging, _scope) = disconnected_service();
        let mut user_messages = messaging.subscribe();

        // when:
        service.send_message("sendMainChatMessage", vec![serde_json::json!("hi")]);

        // then:
        let message = user_messages.recv().await.unwrap();
        assert_eq!(message.level, UserMessageLevel::Error);
        assert!(message.content.contains("disconnected"));
    }

    #[tokio::test]
    async fn test_send_with_response_without_connection_resolves_none() {
        // given:
        let (service, _messaging, _scope) = disconnected_service();

        // when:
        let result = service
            .send_message_with_response("sendStartTarotGame", vec![])
            .await;

        // then:
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_yields_an_ended_stream() {
        // given:
        let (service, _messaging, _scope) = disconnected_service();

        // when:
        let mut events = service.subscribe_to_socket_event("receiveChatMessage");

        // then:
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_epoch_starts_at_zero_without_a_token() {
        // given:
        let (service, _messaging, _scope) = disconnected_service();

        // when / then:
        assert_eq!(*service.connection_epochs().borrow(), 0);
        assert!(!service.is_connected());
    }
}
