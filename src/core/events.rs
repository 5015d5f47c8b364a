//! Fan-out of job events to any number of subscribers.
//!
//! Each subscriber owns an unbounded queue, so a slow consumer never holds up
//! the engine. Publishing and subscribing share one lock, which gives every
//! subscriber the engine's emission order and lets a late subscriber see the
//! terminal event instead of waiting forever.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::warn;

use super::models::LogEntry;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(f64),
    Log(LogEntry),
    Error {
        status: u16,
        kind: ErrorKind,
        detail: String,
    },
    Complete,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete)
    }
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<mpsc::UnboundedSender<JobEvent>>,
    terminal: Option<JobEvent>,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct EventBroadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver an event to every current subscriber.
    ///
    /// A terminal event is delivered once, remembered for late subscribers,
    /// and closes every stream. Anything published after it is dropped.
    pub fn publish(&self, event: JobEvent) {
        let mut inner = self.lock();

        if inner.terminal.is_some() || inner.closed {
            warn!(?event, "Dropping event published after the stream ended");
            return;
        }

        inner.subscribers.retain(|tx| tx.send(event.clone()).is_ok());

        if event.is_terminal() {
            inner.terminal = Some(event);
            inner.subscribers.clear();
        }
    }

    /// Attach a subscriber from this point forward.
    pub fn subscribe(&self) -> EventStream {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();

        match &inner.terminal {
            Some(terminal) => {
                let _ = tx.send(terminal.clone());
            }
            None if inner.closed => {}
            None => inner.subscribers.push(tx),
        }

        EventStream { rx }
    }

    /// End every stream without a terminal event (the producer vanished).
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Receiving end of one subscription. Yields `None` once the stream is over.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send + 'static {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut stream: EventStream) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_subscribers_get_events_in_order() {
        let events = EventBroadcaster::new();
        let a = events.subscribe();
        let b = events.subscribe();

        events.publish(JobEvent::Progress(0.25));
        events.publish(JobEvent::Log(LogEntry::info("one")));
        events.publish(JobEvent::Progress(0.5));
        events.publish(JobEvent::Complete);

        let a = collect(a).await;
        let b = collect(b).await;
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
        assert_eq!(a[0], JobEvent::Progress(0.25));
        assert_eq!(a.last(), Some(&JobEvent::Complete));
    }

    #[tokio::test]
    async fn test_late_subscriber_only_sees_events_after_attach() {
        let events = EventBroadcaster::new();
        events.publish(JobEvent::Progress(0.1));
        let late = events.subscribe();
        events.publish(JobEvent::Progress(0.2));
        events.publish(JobEvent::Complete);

        assert_eq!(
            collect(late).await,
            vec![JobEvent::Progress(0.2), JobEvent::Complete]
        );
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_gets_terminal_and_closes() {
        let events = EventBroadcaster::new();
        events.publish(JobEvent::Error {
            status: 503,
            kind: ErrorKind::BridgeUnreachable,
            detail: "gone".into(),
        });

        let got = collect(events.subscribe()).await;
        assert_eq!(got.len(), 1);
        assert!(got[0].is_terminal());
    }

    #[tokio::test]
    async fn test_only_one_terminal_event() {
        let events = EventBroadcaster::new();
        let stream = events.subscribe();
        events.publish(JobEvent::Complete);
        events.publish(JobEvent::Error {
            status: 500,
            kind: ErrorKind::Internal,
            detail: "late".into(),
        });
        events.publish(JobEvent::Progress(1.0));

        assert_eq!(collect(stream).await, vec![JobEvent::Complete]);
        assert_eq!(collect(events.subscribe()).await, vec![JobEvent::Complete]);
    }

    #[tokio::test]
    async fn test_close_ends_streams_without_terminal() {
        let events = EventBroadcaster::new();
        let stream = events.subscribe();
        events.publish(JobEvent::Progress(0.3));
        events.close();

        assert_eq!(collect(stream).await, vec![JobEvent::Progress(0.3)]);
        assert!(collect(events.subscribe()).await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let events = EventBroadcaster::new();
        let keep = events.subscribe();
        drop(events.subscribe());
        assert_eq!(events.subscriber_count(), 2);

        events.publish(JobEvent::Progress(0.5));
        assert_eq!(events.subscriber_count(), 1);
        drop(keep);
    }
}
