//! Read-only multicast stream with a cached latest value.
//!
//! Every derived value in the subsystem (main chat, current game chat, site
//! settings) needs both push access (a stream of changes) and pull access
//! (a synchronous snapshot) without each consumer managing its own
//! subscription. [`ReadonlySubject`] provides exactly that: a last-value
//! cache over a broadcast subscription list, built on `tokio::sync::watch`.

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

use crate::scope::Scope;

/// A read-only view over a stream of values: the latest value is always
/// available synchronously, and any number of consumers can watch for
/// changes. Before the source emits for the first time, the value is `None`.
#[derive(Debug, Clone)]
pub struct ReadonlySubject<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> ReadonlySubject<T> {
    /// Wrap a source stream. A forwarder task caches each emission; the task
    /// ends when the stream ends or the scope is cancelled.
    pub fn from_stream<S>(scope: &Scope, source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let scope = scope.clone();
        tokio::spawn(async move {
            let mut source = std::pin::pin!(source);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    item = source.next() => match item {
                        Some(value) => {
                            tx.send_replace(Some(value));
                        }
                        None => break,
                    },
                }
            }
        });
        Self { rx }
    }

    /// Create a subject fed directly through a `watch` sender. Used by
    /// services that compute derived values in their own tasks.
    pub fn channel() -> (watch::Sender<Option<T>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Snapshot of the most recently emitted value.
    pub fn value(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    /// A receiver that observes every subsequent change.
    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;

    #[tokio::test]
    async fn test_value_is_none_before_first_emission() {
        // given:
        let (_tx, subject) = ReadonlySubject::<i32>::channel();

        // when / then:
        assert_eq!(subject.value(), None);
    }

    #[tokio::test]
    async fn test_value_reflects_latest_emission() {
        // given:
        let (tx, subject) = ReadonlySubject::<i32>::channel();

        // when:
        tx.send_replace(Some(1));
        tx.send_replace(Some(2));

        // then:
        assert_eq!(subject.value(), Some(2));
    }

    #[tokio::test]
    async fn test_from_stream_caches_each_value() {
        // given:
        let scope = Scope::new();
        let subject = ReadonlySubject::from_stream(&scope, stream::iter(vec![10, 20, 30]));
        let mut rx = subject.watch();

        // when:
        // Wait until the forwarder has drained the stream.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                rx.changed().await.unwrap();
                if *rx.borrow() == Some(30) {
                    break;
                }
            }
        })
        .await
        .expect("stream should be forwarded");

        // then:
        assert_eq!(subject.value(), Some(30));
    }

    #[tokio::test]
    async fn test_watchers_see_changes_independently() {
        // given:
        let (tx, subject) = ReadonlySubject::<&'static str>::channel();
        let mut watcher_a = subject.watch();
        let mut watcher_b = subject.watch();

        // when:
        tx.send_replace(Some("hello"));

        // then:
        watcher_a.changed().await.unwrap();
        watcher_b.changed().await.unwrap();
        assert_eq!(*watcher_a.borrow(), Some("hello"));
        assert_eq!(*watcher_b.borrow(), Some("hello"));
    }

    #[tokio::test]
    async fn test_cancelled_scope_stops_forwarding() {
        // given:
        let scope = Scope::new();
        let (item_tx, item_rx) = tokio::sync::mpsc::unbounded_channel::<i32>();
        let source = stream::unfold(item_rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        });
        let subject = ReadonlySubject::from_stream(&scope, source);
        let mut rx = subject.watch();

        item_tx.send(1).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(subject.value(), Some(1));

        // when:
        scope.cancel();
        // Give the forwarder a moment to observe cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        item_tx.send(2).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // then:
        assert_eq!(subject.value(), Some(1));
    }
}
