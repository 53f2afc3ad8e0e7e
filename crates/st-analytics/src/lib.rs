//! Buffered, readiness-gated analytics client for Rust.
//!
//! Events are held back until the host environment has loaded and a user id
//! is known (each with a timeout), then delivered either one by one as they
//! happen or in periodic batches.
//!
//! # Example
//!
//! ```rust,ignore
//! use st_analytics::{Analytics, DispatchMode};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), st_analytics::Error> {
//!     let client = Analytics::builder("collection_id", "search_token")
//!         .mode(DispatchMode::Poll)
//!         .poll_interval(Duration::from_secs(5))
//!         .build()?;
//!
//!     client.send_event("signup", json!({ "plan": "pro" })).await;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

mod buffer;
mod builders;
mod client;
mod config;
mod dispatch;
mod error;
mod gate;
mod identity;
mod search;
mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use builders::merge_properties;
pub use client::{Analytics, SendableEvent};
pub use config::{AnalyticsBuilder, Config, DispatchMode, Runtime, API_HOST_ENV};
pub use error::Error;
pub use identity::{
    CollectorIdentity, Cookie, IdentityProvider, IdentityStore, MemoryStore, USER_ID_COOKIE,
};
pub use search::{EMPTY_SEARCH_QUERY_EVENT, SEARCH_QUERY_EVENT};
pub use transport::{HttpTransport, Transport, TransportResponse};
pub use types::{AnalyticsEvent, EventMeta, SearchResponse};
