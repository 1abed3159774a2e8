//! Progress event streaming
//!
//! One ordered output channel per turn. The agent loop and individual tool
//! executions write through a cloneable [`EventSink`]; the HTTP layer owns the
//! single reader and relays events to the client in write order. The channel
//! closes exactly once, when the turn task drops its sink.

use crate::models::ProgressEvent;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Single-writer handle onto the turn's event channel. Cloned into tools that
/// have a user-visible loading phase.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventSink {
    /// Append an event. A closed channel means the client went away; the
    /// event is dropped silently so in-flight work can finish.
    pub fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("event channel closed, dropping progress event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create the per-turn event channel.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// Fired by the transport once the final event has passed through the
/// encoder, i.e. every prior event has already been handed to the client.
pub struct FlushNotifier {
    tx: Option<oneshot::Sender<()>>,
}

impl FlushNotifier {
    pub fn notify(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Awaited by the persistence finalizer before committing, replacing the
/// fixed post-finish sleep with an explicit flush acknowledgment.
pub struct FlushHandle {
    rx: oneshot::Receiver<()>,
}

impl FlushHandle {
    /// Resolves on acknowledgment, or after a bounded fallback delay when the
    /// transport never acks (e.g. the client disconnected mid-stream).
    pub async fn wait(self) {
        const FLUSH_FALLBACK: std::time::Duration = std::time::Duration::from_secs(5);

        if tokio::time::timeout(FLUSH_FALLBACK, self.rx).await.is_err() {
            debug!("flush acknowledgment timed out, finalizing anyway");
        }
    }
}

pub fn flush_pair() -> (FlushNotifier, FlushHandle) {
    let (tx, rx) = oneshot::channel();
    (FlushNotifier { tx: Some(tx) }, FlushHandle { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueryLoadingContent, ToolLoadingContent};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_events_preserve_write_order() {
        let (sink, mut rx) = event_channel();

        let user_message_id = Uuid::new_v4();
        sink.emit(ProgressEvent::UserMessageId(user_message_id));
        sink.emit(ProgressEvent::QueryLoading(QueryLoadingContent {
            is_loading: true,
            task_names: vec!["Retrieving AAPL price".to_string()],
        }));
        sink.emit(ProgressEvent::TextDelta("The current".to_string()));
        sink.emit(ProgressEvent::Finish);
        drop(sink);

        let mut observed = Vec::new();
        while let Some(event) = rx.recv().await {
            observed.push(event);
        }

        assert_eq!(observed.len(), 4);
        assert_eq!(observed[0], ProgressEvent::UserMessageId(user_message_id));
        assert!(matches!(observed[1], ProgressEvent::QueryLoading(_)));
        assert!(matches!(observed[2], ProgressEvent::TextDelta(_)));
        assert_eq!(observed[3], ProgressEvent::Finish);
    }

    #[tokio::test]
    async fn test_emit_after_reader_gone_does_not_panic() {
        let (sink, rx) = event_channel();
        drop(rx);

        sink.emit(ProgressEvent::ToolLoading(ToolLoadingContent {
            tool: "searchStocksByFilters".to_string(),
            is_loading: true,
            message: None,
        }));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_flush_handle_resolves_on_notify() {
        let (mut notifier, handle) = flush_pair();
        notifier.notify();
        // Resolves immediately, well inside the fallback window.
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_flush_wait_pends_until_notified() {
        let (mut notifier, handle) = flush_pair();

        let mut wait = tokio_test::task::spawn(handle.wait());
        tokio_test::assert_pending!(wait.poll());

        notifier.notify();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }
}
