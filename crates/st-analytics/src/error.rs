//! Error types for the analytics client.

/// Errors that can occur inside the analytics client.
///
/// Only [`AnalyticsBuilder::build`](crate::AnalyticsBuilder::build) returns these to
/// the caller. Everything after construction is logged and absorbed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A custom transport could not deliver the request.
    #[error("Transport failed: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collector answered with something other than 200.
    #[error("Collector returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Identity could not be resolved.
    #[error("Identity resolution failed: {0}")]
    Identity(String),
}
