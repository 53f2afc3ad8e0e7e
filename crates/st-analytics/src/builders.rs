//! Event builder and property merging.

use crate::types::{AnalyticsEvent, EventMeta};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds.
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Deep-merge `overrides` on top of `base`.
///
/// Objects merge key by key, recursively. Any other value in `overrides`
/// replaces the base value, except `null`, which keeps it.
pub fn merge_properties(base: &Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                let entry = match merged.remove(&key) {
                    Some(existing) => merge_properties(&existing, value),
                    None => value,
                };
                merged.insert(key, entry);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overrides) => overrides,
    }
}

/// Builder for analytics events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_name: String,
    data: Value,
    meta: EventMeta,
    timestamp: Option<i64>,
}

impl EventBuilder {
    pub(crate) fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            data: Value::Object(Map::new()),
            meta: EventMeta::default(),
            timestamp: None,
        }
    }

    /// Replace the event data wholesale.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Add a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Attach the caller's IPv4 address.
    pub fn ip_v4(mut self, ip: impl Into<String>) -> Self {
        self.meta.ip_v4 = Some(ip.into());
        self
    }

    /// Set custom timestamp (milliseconds since epoch).
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Build the event, layering the call data over `global_props`.
    pub(crate) fn build(self, collection_id: &str, global_props: &Value) -> AnalyticsEvent {
        AnalyticsEvent {
            collection_id: collection_id.into(),
            event_name: self.event_name,
            event_data: merge_properties(global_props, self.data),
            meta: self.meta,
            timestamp: self.timestamp.unwrap_or_else(now_ms),
        }
    }
}
