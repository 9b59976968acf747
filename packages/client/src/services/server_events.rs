//! Bridges server status and toast push events into user messages.

use parlor_shared::models::{UserMessage, UserMessageLevel};
use parlor_shared::protocol::server_events;

use crate::scope::Scope;
use crate::services::messaging::MessagingService;
use crate::services::socket::{SocketEvent, SocketService};

/// Forwards `receiveServerStatusMessage` (level + text, titled "AI Message")
/// and `receiveToastMessage` (a full [`UserMessage`]) into the
/// [`MessagingService`], resubscribing across connection replacements.
#[derive(Clone)]
pub struct ServerEventsService {
    messaging: MessagingService,
}

impl ServerEventsService {
    pub fn new(scope: &Scope, socket: SocketService, messaging: MessagingService) -> Self {
        let service = Self { messaging };

        let status_service = service.clone();
        let status_socket = socket.clone();
        let status_scope = scope.clone();
        tokio::spawn(async move {
            status_socket
                .for_each_event(
                    status_scope,
                    server_events::RECEIVE_SERVER_STATUS_MESSAGE,
                    move |event| {
                        let service = status_service.clone();
                        async move { service.on_status_message(event) }
                    },
                )
                .await;
        });

        let toast_service = service.clone();
        let toast_scope = scope.clone();
        tokio::spawn(async move {
            socket
                .for_each_event(
                    toast_scope,
                    server_events::RECEIVE_TOAST_MESSAGE,
                    move |event| {
                        let service = toast_service.clone();
                        async move { service.on_toast_message(event) }
                    },
                )
                .await;
        });

        service
    }

    fn on_status_message(&self, event: SocketEvent) {
        let mut args = event.args.into_iter();
        let level = args
            .next()
            .and_then(|v| serde_json::from_value::<UserMessageLevel>(v).ok())
            .unwrap_or(UserMessageLevel::Info);
        let Some(content) = args.next().and_then(|v| v.as_str().map(str::to_string)) else {
            tracing::warn!("Server status message carried no text");
            return;
        };
        self.messaging
            .send_user_message(UserMessage::with_title(level, content, "AI Message"));
    }

    fn on_toast_message(&self, event: SocketEvent) {
        let Some(raw) = event.args.into_iter().next() else {
            tracing::warn!("Toast event carried no payload");
            return;
        };
        match serde_json::from_value::<UserMessage>(raw) {
            Ok(message) => self.messaging.send_user_message(message),
            Err(e) => tracing::warn!("Could not parse toast message: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, args: Vec<serde_json::Value>) -> SocketEvent {
        SocketEvent {
            event: name.to_string(),
            args,
            ack: None,
        }
    }

    #[tokio::test]
    async fn test_status_message_becomes_titled_user_message() {
        // given:
        let messaging = MessagingService::new();
        let service = ServerEventsService {
            messaging: messaging.clone(),
        };
        let mut rx = messaging.subscribe();

        // when:
        service.on_status_message(event(
            server_events::RECEIVE_SERVER_STATUS_MESSAGE,
            vec![json!("warn"), json!("model is overloaded")],
        ));

        // then:
        let message = rx.recv().await.unwrap();
        assert_eq!(message.level, UserMessageLevel::Warn);
        assert_eq!(message.title.as_deref(), Some("AI Message"));
        assert_eq!(message.content, "model is overloaded");
    }

    #[tokio::test]
    async fn test_toast_message_is_forwarded_verbatim() {
        // given:
        let messaging = MessagingService::new();
        let service = ServerEventsService {
            messaging: messaging.clone(),
        };
        let mut rx = messaging.subscribe();

        // when:
        service.on_toast_message(event(
            server_events::RECEIVE_TOAST_MESSAGE,
            vec![json!({"level": "success", "content": "saved"})],
        ));

        // then:
        let message = rx.recv().await.unwrap();
        assert_eq!(message.level, UserMessageLevel::Success);
        assert_eq!(message.content, "saved");
    }

    #[tokio::test]
    async fn test_malformed_toast_is_dropped_without_panic() {
        // given:
        let messaging = MessagingService::new();
        let service = ServerEventsService {
            messaging: messaging.clone(),
        };

        // when / then:
        service.on_toast_message(event(server_events::RECEIVE_TOAST_MESSAGE, vec![json!(42)]));
    }
}
