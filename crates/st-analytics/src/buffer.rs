//! Event buffer holding events that cannot leave the process yet.

use crate::types::AnalyticsEvent;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct BufferState {
    events: Vec<AnalyticsEvent>,
    closed: bool,
}

/// What happened to an event offered to the buffer.
#[derive(Debug)]
pub enum Admission {
    /// Queued behind the events already buffered.
    Buffered,
    /// Not queued; the caller may send it right away.
    Bypassed(AnalyticsEvent),
    /// Not queued; the buffer no longer accepts events.
    Closed(AnalyticsEvent),
}

/// FIFO buffer of pending events.
#[derive(Debug, Default)]
pub struct EventBuffer {
    state: Mutex<BufferState>,
}

impl EventBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the back of the buffer.
    pub async fn append(&self, event: AnalyticsEvent) -> Admission {
        self.append_unless(event, || false).await
    }

    /// Buffer `event` unless `bypass` says it may go straight out.
    ///
    /// `bypass` is evaluated while the buffer is locked, so a concurrent
    /// [`drain_all`](Self::drain_all) either sees the event or the caller gets it back.
    pub async fn append_unless(
        &self,
        event: AnalyticsEvent,
        bypass: impl FnOnce() -> bool,
    ) -> Admission {
        let mut state = self.state.lock().await;
        if state.closed {
            return Admission::Closed(event);
        }
        if bypass() {
            return Admission::Bypassed(event);
        }
        state.events.push(event);
        Admission::Buffered
    }

    /// Take every buffered event, oldest first, leaving the buffer empty.
    ///
    /// Still works after [`close`](Self::close), so the last events can be flushed.
    pub async fn drain_all(&self) -> Vec<AnalyticsEvent> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.events)
    }

    /// Refuse all further appends.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Get the number of buffered events.
    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.events.is_empty()
    }
}
