//! Integration tests running the client services against an in-process
//! stub websocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::Message;

use async_trait::async_trait;
use serde_json::json;

use parlor_client::api::ChatApi;
use parlor_client::audio::NullAudioPlayer;
use parlor_client::error::ApiError;
use parlor_client::scope::Scope;
use parlor_client::services::chat::ChatService;
use parlor_client::services::messaging::MessagingService;
use parlor_client::services::site_settings::SiteSettingsService;
use parlor_client::services::socket::SocketService;
use parlor_shared::models::{
    ChatInfo, ChatMessage, ChatMessageRole, ChatType, ClientChat, Id, TarotGame,
};
use parlor_shared::protocol::{SocketFrame, client_events, server_events};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One accepted websocket connection, as the server sees it.
struct StubConnection {
    /// The token the client presented in the query string.
    token: String,
    /// Frames received from the client.
    frames: mpsc::UnboundedReceiver<SocketFrame>,
    /// Frames to push to the client.
    outgoing: mpsc::UnboundedSender<SocketFrame>,
}

/// Server-side connection lifecycle, tagged with the connection's token.
#[derive(Debug, PartialEq)]
enum StubEvent {
    Opened(String),
    Closed(String),
}

struct StubServer {
    url: String,
    connections: mpsc::UnboundedReceiver<StubConnection>,
    events: mpsc::UnboundedReceiver<StubEvent>,
}

/// Accepts websocket connections and exposes each as a [`StubConnection`].
async fn start_stub_server() -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("stub server address");
    let (conn_tx, connections) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let conn_tx = conn_tx.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let uri = Arc::new(std::sync::Mutex::new(String::new()));
                let uri_capture = uri.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *uri_capture.lock().unwrap() = req.uri().to_string();
                    Ok(resp)
                };
                let ws = match accept_hdr_async(stream, callback).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };

                let token = uri
                    .lock()
                    .unwrap()
                    .split("token=")
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                let (frame_tx, frames) = mpsc::unbounded_channel();
                let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SocketFrame>();
                let _ = event_tx.send(StubEvent::Opened(token.clone()));
                if conn_tx
                    .send(StubConnection {
                        token: token.clone(),
                        frames,
                        outgoing: outgoing_tx,
                    })
                    .is_err()
                {
                    let _ = event_tx.send(StubEvent::Closed(token));
                    return;
                }

                let (mut write, mut read) = ws.split();
                'pump: loop {
                    tokio::select! {
                        frame = outgoing_rx.recv() => match frame {
                            Some(frame) => {
                                let text = frame.to_wire().expect("serialize stub frame");
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break 'pump;
                                }
                            }
                            None => break 'pump,
                        },
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(frame) = SocketFrame::from_wire(&text) {
                                    if frame_tx.send(frame).is_err() {
                                        break 'pump;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break 'pump,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break 'pump,
                        }
                    }
                }
                let _ = event_tx.send(StubEvent::Closed(token));
            });
        }
    });

    StubServer {
        url: format!("ws://{addr}/ws"),
        connections,
        events,
    }
}

async fn next_connection(server: &mut StubServer) -> StubConnection {
    timeout(TEST_TIMEOUT, server.connections.recv())
        .await
        .expect("a connection should arrive")
        .expect("stub server should stay up")
}

async fn next_event(server: &mut StubServer) -> StubEvent {
    timeout(TEST_TIMEOUT, server.events.recv())
        .await
        .expect("a lifecycle event should arrive")
        .expect("stub server should stay up")
}

async fn next_frame(conn: &mut StubConnection) -> SocketFrame {
    timeout(TEST_TIMEOUT, conn.frames.recv())
        .await
        .expect("a frame should arrive")
        .expect("connection should stay open")
}

async fn wait_connected(socket: &SocketService) {
    let mut connected = socket.connected_watch();
    timeout(TEST_TIMEOUT, connected.wait_for(|c| *c))
        .await
        .expect("socket should connect")
        .expect("socket service should stay up");
}

struct SocketFixture {
    socket: SocketService,
    token_tx: watch::Sender<Option<String>>,
    messaging: MessagingService,
    scope: Scope,
}

fn socket_fixture(url: &str) -> SocketFixture {
    let scope = Scope::new();
    let messaging = MessagingService::new();
    let (token_tx, token_rx) = watch::channel(None);
    let socket = SocketService::new(&scope, url, token_rx, messaging.clone());
    SocketFixture {
        socket,
        token_tx,
        messaging,
        scope,
    }
}

/// REST stand-in for flows that never reach the REST layer.
struct UnusedChatApi;

#[async_trait]
impl ChatApi for UnusedChatApi {
    async fn get_main_chat(&self) -> Result<ClientChat, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn start_new_main_chat(&self) -> Result<ClientChat, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn get_chat_by_id(&self, _chat_id: &Id) -> Result<ClientChat, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn get_chat_list(&self) -> Result<Vec<ChatInfo>, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn get_chats_of_type(&self, _chat_type: ChatType) -> Result<Vec<ClientChat>, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn get_tarot_games(&self) -> Result<Vec<TarotGame>, ApiError> {
        Err(ApiError::NotAuthenticated)
    }

    async fn delete_game_by_id(&self, _game_id: &Id) -> Result<(), ApiError> {
        Err(ApiError::NotAuthenticated)
    }
}

#[tokio::test]
async fn test_token_change_replaces_the_connection() {
    // given: a client connected with the first token
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    f.token_tx.send(Some("alpha".to_string())).unwrap();

    let mut first = next_connection(&mut server).await;
    assert_eq!(first.token, "alpha");
    wait_connected(&f.socket).await;

    // when: the token changes
    f.token_tx.send(Some("beta".to_string())).unwrap();

    // then: exactly one new connection arrives, carrying the new token,
    // and the old connection is gone
    let second = next_connection(&mut server).await;
    assert_eq!(second.token, "beta");
    let ended = timeout(TEST_TIMEOUT, first.frames.recv())
        .await
        .expect("old connection should close");
    assert!(ended.is_none());

    f.scope.cancel();
}

#[tokio::test]
async fn test_old_connection_is_closed_before_the_replacement_opens() {
    // given: a client connected with the first token
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    f.token_tx.send(Some("alpha".to_string())).unwrap();
    let _first = next_connection(&mut server).await;
    wait_connected(&f.socket).await;
    assert_eq!(
        next_event(&mut server).await,
        StubEvent::Opened("alpha".to_string())
    );

    // when: the token changes
    f.token_tx.send(Some("beta".to_string())).unwrap();

    // then: the server observes the old connection close strictly before
    // the replacement opens
    assert_eq!(
        next_event(&mut server).await,
        StubEvent::Closed("alpha".to_string())
    );
    assert_eq!(
        next_event(&mut server).await,
        StubEvent::Opened("beta".to_string())
    );

    f.scope.cancel();
}

#[tokio::test]
async fn test_clearing_the_token_tears_the_connection_down() {
    // given:
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    f.token_tx.send(Some("alpha".to_string())).unwrap();
    let mut conn = next_connection(&mut server).await;
    wait_connected(&f.socket).await;

    // when:
    f.token_tx.send(None).unwrap();

    // then:
    let ended = timeout(TEST_TIMEOUT, conn.frames.recv())
        .await
        .expect("connection should close");
    assert!(ended.is_none());
    let mut connected = f.socket.connected_watch();
    timeout(TEST_TIMEOUT, connected.wait_for(|c| !*c))
        .await
        .expect("socket should report disconnected")
        .unwrap();

    f.scope.cancel();
}

#[tokio::test]
async fn test_concurrent_requests_each_get_their_own_answer() {
    // given:
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    f.token_tx.send(Some("alpha".to_string())).unwrap();
    let mut conn = next_connection(&mut server).await;
    wait_connected(&f.socket).await;

    // when: two requests are in flight at once
    let socket_a = f.socket.clone();
    let task_a = tokio::spawn(async move {
        socket_a
            .send_message_with_response(client_events::SEND_CHAT_MESSAGE, vec![json!("one")])
            .await
    });
    let socket_b = f.socket.clone();
    let task_b = tokio::spawn(async move {
        socket_b
            .send_message_with_response(client_events::SEND_CHAT_MESSAGE, vec![json!("two")])
            .await
    });

    // and: the server answers them in reverse arrival order
    let first = next_frame(&mut conn).await;
    let second = next_frame(&mut conn).await;
    for frame in [&second, &first] {
        let ack_id = frame.ack_id.expect("request should carry an ackId");
        conn.outgoing
            .send(SocketFrame::ack(ack_id, json!({"echo": frame.args[0]})))
            .unwrap();
    }

    // then: each caller receives the answer for its own request
    let answer_a = timeout(TEST_TIMEOUT, task_a).await.unwrap().unwrap();
    let answer_b = timeout(TEST_TIMEOUT, task_b).await.unwrap().unwrap();
    let mut echoed: Vec<_> = [answer_a, answer_b]
        .into_iter()
        .map(|answer| answer.expect("answer should arrive")["echo"].clone())
        .collect();
    echoed.sort_by_key(|v| v.as_str().map(str::to_string));
    assert_eq!(echoed, vec![json!("one"), json!("two")]);
    assert_ne!(first.ack_id, second.ack_id);

    f.scope.cancel();
}

#[tokio::test]
async fn test_event_subscription_only_sees_its_event_and_ends_on_replacement() {
    // given:
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    f.token_tx.send(Some("alpha".to_string())).unwrap();
    let conn = next_connection(&mut server).await;
    wait_connected(&f.socket).await;

    let mut events = f
        .socket
        .subscribe_to_socket_event(server_events::RECEIVE_CHAT_MESSAGE);

    // when: the server pushes an unrelated event and then the subscribed one
    conn.outgoing
        .send(SocketFrame::event(
            server_events::RECEIVE_TOAST_MESSAGE,
            vec![json!({"level": "info", "content": "hello"})],
        ))
        .unwrap();
    conn.outgoing
        .send(SocketFrame::event(
            server_events::RECEIVE_CHAT_MESSAGE,
            vec![json!("c1"), json!({"role": "assistant", "content": "hi"})],
        ))
        .unwrap();

    // then: only the subscribed event is delivered
    let event = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event should arrive")
        .expect("stream should be open");
    assert_eq!(event.event, server_events::RECEIVE_CHAT_MESSAGE);
    assert_eq!(event.args[0], json!("c1"));

    // and: replacing the connection ends the stream
    f.token_tx.send(Some("beta".to_string())).unwrap();
    let ended = timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("stream should end");
    assert!(ended.is_none());

    f.scope.cancel();
}

#[tokio::test]
async fn test_sent_message_appears_before_the_pushed_reply() {
    // given: a chat service over a live socket, with one chat loaded
    let mut server = start_stub_server().await;
    let f = socket_fixture(&server.url);
    let (_chat_token_tx, chat_token_rx) = watch::channel(None);
    let chat_service = ChatService::new(
        &f.scope,
        Arc::new(UnusedChatApi),
        f.socket.clone(),
        f.messaging.clone(),
        SiteSettingsService::new(&f.scope, f.socket.clone()),
        Arc::new(NullAudioPlayer),
        chat_token_rx,
    );

    f.token_tx.send(Some("alpha".to_string())).unwrap();
    let mut conn = next_connection(&mut server).await;
    wait_connected(&f.socket).await;

    chat_service
        .add_chat(ClientChat {
            id: Id::new("c1"),
            user_id: Id::new("u1"),
            model: "gpt-4o-mini".to_string(),
            chat_type: ChatType::Main,
            last_access_date: 100,
            creation_date: 100,
            chat_messages: Vec::new(),
        })
        .await;

    // when: the user sends a message and the server replies over the push
    // channel after acknowledging it
    let sender = chat_service.clone();
    let send_task = tokio::spawn(async move {
        sender.send_chat_message(&Id::new("c1"), "how are you?").await;
    });

    let frame = next_frame(&mut conn).await;
    assert_eq!(frame.event, client_events::SEND_CHAT_MESSAGE);
    assert_eq!(frame.args, vec![json!("c1"), json!("how are you?")]);
    conn.outgoing
        .send(SocketFrame::ack(
            frame.ack_id.expect("send should expect an ack"),
            json!({"success": true}),
        ))
        .unwrap();
    timeout(TEST_TIMEOUT, send_task).await.unwrap().unwrap();

    conn.outgoing
        .send(SocketFrame::event(
            server_events::RECEIVE_CHAT_MESSAGE,
            vec![json!("c1"), json!({"role": "assistant", "content": "well, thanks"})],
        ))
        .unwrap();

    // then: the chat log holds the user message first, then the reply
    let mut chats = chat_service.chats_watch();
    timeout(TEST_TIMEOUT, async {
        loop {
            if chats.borrow_and_update()[0].chat_messages.len() == 2 {
                return;
            }
            chats.changed().await.unwrap();
        }
    })
    .await
    .expect("the pushed reply should be reconciled");

    let messages = chat_service.chats()[0].chat_messages.clone();
    assert_eq!(messages[0].role, ChatMessageRole::User);
    assert_eq!(messages[0].content, "how are you?");
    assert_eq!(messages[1], ChatMessage::assistant("well, thanks"));

    f.scope.cancel();
}
