//! Event types and serialization.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Extra context attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(rename = "ipV4", skip_serializing_if = "Option::is_none")]
    pub ip_v4: Option<String>,
}

/// A single analytics event as the collector receives it.
///
/// Built once when the event is sent and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(rename = "collection")]
    pub collection_id: String,
    pub event_name: String,
    pub event_data: Value,
    pub meta: EventMeta,
    #[serde(rename = "timeStamp")]
    pub timestamp: i64,
}

/// Request body for the identity endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UserIdRequest<'a> {
    pub collection: &'a str,
}

/// Response from the identity endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserIdResponse {
    pub data: UserIdData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdData {
    pub user_id: String,
}

/// A search response, as returned by the search API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub unique_id: String,
    pub query: SearchRequest,
    #[serde(default)]
    pub results: Vec<Value>,
    pub response_time: Number,
    pub total_hits: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The request half of a [`SearchResponse`]. Only the query text is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
