//! Flush driver: routes events to the buffer or the wire, and drains the buffer
//! under the dispatch lock.

use crate::buffer::{Admission, EventBuffer};
use crate::config::DispatchMode;
use crate::gate::ReadinessGate;
use crate::identity::CurrentUser;
use crate::transport::{Transport, EVENTS_PATH, USER_HEADER};
use crate::types::AnalyticsEvent;
use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Owns the event buffer and the dispatch lock.
///
/// Every drain of the buffer happens while `sending` is held, so at most one
/// flush is on the wire at a time and batches leave in the order they were
/// drained. The guard is dropped on every path out of a flush, including
/// transport errors.
pub(crate) struct Dispatcher {
    mode: DispatchMode,
    buffer: EventBuffer,
    sending: Mutex<()>,
    transport: Arc<dyn Transport>,
    user: Arc<CurrentUser>,
    poll_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn new(
        mode: DispatchMode,
        transport: Arc<dyn Transport>,
        user: Arc<CurrentUser>,
    ) -> Self {
        Self {
            mode,
            buffer: EventBuffer::new(),
            sending: Mutex::new(()),
            transport,
            user,
            poll_timer: StdMutex::new(None),
        }
    }

    pub(crate) fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub(crate) async fn pending(&self) -> usize {
        self.buffer.len().await
    }

    /// Hand a freshly built event to the engine.
    ///
    /// Immediate mode sends straight away when the gate is open and buffers
    /// otherwise. Poll mode always buffers. Once closed, events are dropped.
    pub(crate) async fn submit(&self, event: AnalyticsEvent, gate: &ReadinessGate) {
        let admission = match self.mode {
            DispatchMode::Immediate => {
                self.buffer
                    .append_unless(event, || gate.is_dispatch_allowed())
                    .await
            }
            DispatchMode::Poll => self.buffer.append(event).await,
        };

        match admission {
            Admission::Buffered => {}
            Admission::Bypassed(event) => {
                self.transmit_event(event).await;
            }
            Admission::Closed(event) => {
                warn!(
                    event_name = %event.event_name,
                    "client has been shut down, dropping event"
                );
            }
        }
    }

    /// Flush according to the dispatch mode. Returns the number of events delivered.
    pub(crate) async fn flush(&self) -> usize {
        match self.mode {
            DispatchMode::Immediate => self.drain_individually().await,
            DispatchMode::Poll => self.flush_batch().await,
        }
    }

    /// Send every buffered event on its own, oldest first.
    ///
    /// A failed event is logged and dropped; the rest are still sent.
    pub(crate) async fn drain_individually(&self) -> usize {
        if self.buffer.is_empty().await {
            return 0;
        }
        let _sending = self.sending.lock().await;

        let events = self.buffer.drain_all().await;
        if events.is_empty() {
            return 0;
        }

        debug!(event_count = events.len(), "draining buffered events");

        let mut delivered = 0;
        for event in events {
            if self.transmit_event(event).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send the whole buffer as one batch.
    pub(crate) async fn flush_batch(&self) -> usize {
        if self.buffer.is_empty().await {
            return 0;
        }
        let _sending = self.sending.lock().await;

        let events = self.buffer.drain_all().await;
        if events.is_empty() {
            return 0;
        }

        let event_count = events.len();
        info!(event_count, "flushing batch");

        let result = match serde_json::to_value(&events) {
            Ok(payload) => self.post(payload).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => event_count,
            Err(e) => {
                error!(error = %e, event_count, "failed to send batch, discarding");
                0
            }
        }
    }

    async fn transmit_event(&self, event: AnalyticsEvent) -> bool {
        let event_name = event.event_name.clone();

        let result = match serde_json::to_value(&event) {
            Ok(payload) => self.post(payload).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, event_name = %event_name, "failed to send event, discarding");
                false
            }
        }
    }

    async fn post(&self, payload: Value) -> Result<(), Error> {
        let headers = HashMap::from([(USER_HEADER.to_string(), self.user.get())]);
        let response = self.transport.post(EVENTS_PATH, payload, &headers).await?;

        if !response.is_ok() {
            return Err(Error::Status {
                status: response.status,
                body: response.body,
            });
        }
        Ok(())
    }

    // ============================================
    // POLL TIMER
    // ============================================

    /// Start the recurring batch flush.
    pub(crate) fn start_polling(self: &Arc<Self>, period: Duration) {
        let handle = self.spawn_poll_loop(period);
        if let Some(previous) = self.replace_timer(Some(handle)) {
            previous.abort();
        }
    }

    /// Reschedule the recurring flush once any in-flight flush has finished.
    pub(crate) async fn set_poll_interval(self: &Arc<Self>, period: Duration) {
        if self.mode != DispatchMode::Poll {
            warn!("poll interval ignored outside poll mode");
            return;
        }
        if period.is_zero() {
            warn!("poll interval must be non-zero, keeping the current one");
            return;
        }

        let _sending = self.sending.lock().await;
        if self.buffer.is_closed().await {
            warn!("client has been shut down, not rescheduling poll timer");
            return;
        }
        debug!(interval_ms = period.as_millis() as u64, "rescheduling poll timer");
        self.start_polling(period);
    }

    /// Stop accepting events and stop the recurring flush.
    ///
    /// Waits for an in-flight flush first. Events already buffered stay there
    /// for a final [`flush`](Self::flush); later reschedules are refused.
    pub(crate) async fn close(&self) {
        let _sending = self.sending.lock().await;
        self.buffer.close().await;
        if let Some(handle) = self.replace_timer(None) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.poll_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn replace_timer(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        let mut timer = self.poll_timer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *timer, handle)
    }

    fn spawn_poll_loop(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.flush_batch().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use crate::types::EventMeta;
    use serde_json::json;

    fn make_event(name: &str) -> AnalyticsEvent {
        AnalyticsEvent {
            collection_id: "col_1".into(),
            event_name: name.into(),
            event_data: json!({}),
            meta: EventMeta::default(),
            timestamp: 1706400000000,
        }
    }

    fn dispatcher(mode: DispatchMode, transport: Arc<RecordingTransport>) -> Arc<Dispatcher> {
        let user = Arc::new(CurrentUser::new());
        user.set("u_test");
        Arc::new(Dispatcher::new(mode, transport, user))
    }

    fn open_gate() -> ReadinessGate {
        let gate = ReadinessGate::new();
        gate.mark_environment_ready();
        gate.mark_identity_ready();
        gate
    }

    #[tokio::test]
    async fn test_immediate_buffers_while_gate_closed() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());
        let gate = ReadinessGate::new();

        dispatcher.submit(make_event("e1"), &gate).await;

        assert_eq!(transport.call_count(), 0);
        assert_eq!(dispatcher.pending().await, 1);
    }

    #[tokio::test]
    async fn test_immediate_sends_directly_when_open() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());

        dispatcher.submit(make_event("e1"), &open_gate()).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, "events");
        assert_eq!(calls[0].payload["eventName"], "e1");
        assert_eq!(calls[0].headers["x-st-user"], "u_test");
        assert_eq!(dispatcher.pending().await, 0);
    }

    #[tokio::test]
    async fn test_drain_sends_each_event_in_order() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());
        let gate = ReadinessGate::new();

        for name in ["E1", "E2", "E3"] {
            dispatcher.submit(make_event(name), &gate).await;
        }
        assert_eq!(transport.call_count(), 0);

        assert_eq!(dispatcher.drain_individually().await, 3);

        assert_eq!(transport.call_count(), 3);
        assert_eq!(transport.event_names(), ["E1", "E2", "E3"]);
        assert!(transport.calls().iter().all(|c| c.payload.is_object()));
        assert_eq!(dispatcher.pending().await, 0);
    }

    #[tokio::test]
    async fn test_drain_continues_past_failures() {
        let transport = Arc::new(RecordingTransport::new().with_status(500));
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());
        let gate = ReadinessGate::new();

        for name in ["E1", "E2", "E3"] {
            dispatcher.submit(make_event(name), &gate).await;
        }

        assert_eq!(dispatcher.drain_individually().await, 0);
        assert_eq!(transport.call_count(), 3);
        assert_eq!(dispatcher.pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_direct_send_is_not_requeued() {
        let transport = Arc::new(RecordingTransport::new().unreachable());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());

        dispatcher.submit(make_event("e1"), &open_gate()).await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(dispatcher.pending().await, 0);
    }

    #[tokio::test]
    async fn test_poll_mode_ignores_gate() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());

        dispatcher.submit(make_event("e1"), &open_gate()).await;

        assert_eq!(transport.call_count(), 0);
        assert_eq!(dispatcher.pending().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_tick_sends_one_batch() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();
        dispatcher.start_polling(Duration::from_millis(1000));

        for i in 0..5 {
            dispatcher.submit(make_event(&format!("e{i}")), &gate).await;
        }

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.call_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload.as_array().map(Vec::len), Some(5));
        assert_eq!(transport.event_names(), ["e0", "e1", "e2", "e3", "e4"]);
        assert_eq!(dispatcher.pending().await, 0);

        // Empty ticks don't post.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_discarded_and_next_tick_proceeds() {
        let transport = Arc::new(RecordingTransport::new().with_status(500));
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();
        dispatcher.start_polling(Duration::from_millis(1000));

        for name in ["a", "b", "c"] {
            dispatcher.submit(make_event(name), &gate).await;
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(dispatcher.pending().await, 0);

        transport.set_status(200);
        dispatcher.submit(make_event("d"), &gate).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.calls()[1].payload, json!([make_event("d")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_transport_releases_lock() {
        let transport = Arc::new(RecordingTransport::new().unreachable());
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();

        dispatcher.submit(make_event("a"), &gate).await;
        assert_eq!(dispatcher.flush_batch().await, 0);

        dispatcher.submit(make_event("b"), &gate).await;
        assert_eq!(dispatcher.flush_batch().await, 0);

        assert_eq!(transport.call_count(), 2);
        assert_eq!(dispatcher.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flushes_never_overlap() {
        let transport =
            Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(100)));
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();

        let mut handles = vec![];
        for i in 0..10 {
            dispatcher.submit(make_event(&format!("e{i}")), &gate).await;
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move { d.flush_batch().await }));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        dispatcher.flush_batch().await;

        assert_eq!(transport.max_in_flight(), 1);
        let expected: Vec<String> = (0..10).map(|i| format!("e{i}")).collect();
        assert_eq!(transport.event_names(), expected);

        let calls = transport.calls();
        for pair in calls.windows(2) {
            assert!(pair[1].started >= pair[0].finished);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_poll_interval_waits_for_in_flight_flush() {
        let start = Instant::now();
        let transport =
            Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(500)));
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();
        dispatcher.start_polling(Duration::from_millis(1000));

        dispatcher.submit(make_event("first"), &gate).await;

        // Tick at 1000ms starts a flush that lasts until 1500ms.
        tokio::time::sleep_until(start + Duration::from_millis(1200)).await;
        dispatcher.set_poll_interval(Duration::from_millis(2000)).await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(transport.call_count(), 1);

        dispatcher.submit(make_event("second"), &gate).await;

        // New timer runs from 1500ms, so its first tick lands at 3500ms.
        tokio::time::sleep_until(start + Duration::from_millis(3400)).await;
        assert_eq!(transport.call_count(), 1);

        tokio::time::sleep_until(start + Duration::from_millis(4100)).await;
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].started >= calls[0].finished);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_set_poll_interval_ignored_in_immediate_mode() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport);

        dispatcher.set_poll_interval(Duration::from_millis(10)).await;

        assert!(!dispatcher.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_halts_ticks_and_drops_later_events() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();
        dispatcher.start_polling(Duration::from_millis(1000));
        dispatcher.submit(make_event("early"), &gate).await;

        dispatcher.close().await;
        assert!(!dispatcher.is_polling());

        dispatcher.submit(make_event("late"), &gate).await;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(transport.call_count(), 0);
        assert_eq!(dispatcher.pending().await, 1);

        // The final flush still goes out.
        assert_eq!(dispatcher.flush().await, 1);
        assert_eq!(transport.event_names(), ["early"]);
    }

    #[tokio::test]
    async fn test_closed_immediate_dispatcher_does_not_send() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());

        dispatcher.close().await;
        dispatcher.submit(make_event("late"), &open_gate()).await;

        assert_eq!(transport.call_count(), 0);
        assert!(dispatcher.buffer.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_poll_interval_after_close_is_refused() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = dispatcher(DispatchMode::Poll, transport);
        dispatcher.start_polling(Duration::from_millis(1000));

        dispatcher.close().await;
        dispatcher.set_poll_interval(Duration::from_millis(100)).await;

        assert!(!dispatcher.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_queued_behind_close_is_refused() {
        let start = Instant::now();
        let transport =
            Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(500)));
        let dispatcher = dispatcher(DispatchMode::Poll, transport.clone());
        let gate = ReadinessGate::new();
        dispatcher.start_polling(Duration::from_millis(1000));
        dispatcher.submit(make_event("first"), &gate).await;

        // Tick at 1000ms holds the dispatch lock until 1500ms.
        tokio::time::sleep_until(start + Duration::from_millis(1200)).await;
        let closing = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.close().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rescheduling = {
            let d = dispatcher.clone();
            tokio::spawn(async move { d.set_poll_interval(Duration::from_millis(100)).await })
        };
        closing.await.unwrap();
        rescheduling.await.unwrap();

        assert!(!dispatcher.is_polling());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_racing_gate_open_are_delivered_once() {
        for round in 0..20 {
            let transport = Arc::new(RecordingTransport::new());
            let dispatcher = dispatcher(DispatchMode::Immediate, transport.clone());
            let gate = Arc::new(ReadinessGate::new());
            gate.mark_environment_ready();

            let mut handles = vec![];
            for i in 0..50 {
                let d = dispatcher.clone();
                let g = gate.clone();
                handles.push(tokio::spawn(async move {
                    d.submit(make_event(&format!("e{i:02}")), &g).await;
                }));
            }
            let opener = {
                let d = dispatcher.clone();
                let g = gate.clone();
                tokio::spawn(async move {
                    if g.mark_identity_ready() {
                        d.drain_individually().await;
                    }
                })
            };
            for handle in handles {
                handle.await.unwrap();
            }
            opener.await.unwrap();

            // Each event went out exactly once, directly or through the drain.
            let mut names = transport.event_names();
            names.sort();
            let expected: Vec<String> = (0..50).map(|i| format!("e{i:02}")).collect();
            assert_eq!(names, expected, "round {round}");
            assert!(dispatcher.buffer.is_empty().await);
        }
    }
}
