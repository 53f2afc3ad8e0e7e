//! In-memory transport for unit tests.

use crate::transport::{Transport, TransportResponse};
use crate::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Records every post and answers with a configurable status.
#[derive(Debug)]
pub struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    status: AtomicU16,
    body: String,
    delay: Duration,
    unreachable: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
            body: String::new(),
            delay: Duration::ZERO,
            unreachable: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_status(self, status: u16) -> Self {
        self.status.store(status, Ordering::SeqCst);
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Event names in the order they reached the transport, batches flattened.
    pub fn event_names(&self) -> Vec<String> {
        self.calls()
            .iter()
            .flat_map(|call| match &call.payload {
                Value::Array(events) => events.clone(),
                single => vec![single.clone()],
            })
            .filter_map(|event| event["eventName"].as_str().map(String::from))
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(
        &self,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> Result<TransportResponse, Error> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            path: path.into(),
            payload,
            headers: headers.clone(),
            started,
            finished: Instant::now(),
        });

        if self.unreachable {
            return Err(Error::Transport("connection refused".into()));
        }

        Ok(TransportResponse {
            status: self.status.load(Ordering::SeqCst),
            body: self.body.clone(),
        })
    }
}
