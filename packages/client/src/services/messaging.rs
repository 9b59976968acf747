//! User-facing notification fan-out.

use tokio::sync::broadcast;

use parlor_shared::models::{UserMessage, UserMessageLevel};

const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// Broadcasts [`UserMessage`] values to any number of UI listeners.
///
/// Sending is fire-and-forget: when nobody is listening the message is
/// dropped silently.
#[derive(Debug, Clone)]
pub struct MessagingService {
    tx: broadcast::Sender<UserMessage>,
}

impl MessagingService {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit a new user message to inform the user of application state.
    pub fn send_user_message(&self, message: UserMessage) {
        tracing::debug!(
            level = ?message.level,
            "User message: {}",
            message.content
        );
        // No receivers is not an error; the UI may not be listening yet.
        let _ = self.tx.send(message);
    }

    /// Convenience for plain error messages.
    pub fn send_error(&self, content: impl Into<String>) {
        self.send_user_message(UserMessage::new(UserMessageLevel::Error, content));
    }

    /// Convenience for plain info messages.
    pub fn send_info(&self, content: impl Into<String>) {
        self.send_user_message(UserMessage::new(UserMessageLevel::Info, content));
    }

    /// Subscribe to user messages emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<UserMessage> {
        self.tx.subscribe()
    }
}

impl Default for MessagingService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_message() {
        // given:
        let messaging = MessagingService::new();
        let mut rx = messaging.subscribe();

        // when:
        messaging.send_error("something broke");

        // then:
        let message = rx.recv().await.unwrap();
        assert_eq!(message.level, UserMessageLevel::Error);
        assert_eq!(message.content, "something broke");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_does_not_panic() {
        // given:
        let messaging = MessagingService::new();

        // when / then:
        messaging.send_info("nobody is listening");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        // given:
        let messaging = MessagingService::new();
        let mut rx1 = messaging.subscribe();
        let mut rx2 = messaging.subscribe();

        // when:
        messaging.send_user_message(UserMessage::with_title(
            UserMessageLevel::Warn,
            "careful",
            "AI Message",
        ));

        // then:
        assert_eq!(rx1.recv().await.unwrap().title.as_deref(), Some("AI Message"));
        assert_eq!(rx2.recv().await.unwrap().content, "careful");
    }
}
