//! Search-specific event payloads.

use crate::types::SearchResponse;
use serde_json::{json, Value};
use tracing::warn;

/// Event name for a search that returned results.
pub const SEARCH_QUERY_EVENT: &str = "searchQuery";

/// Event name for a search that returned nothing.
pub const EMPTY_SEARCH_QUERY_EVENT: &str = "emptySearchQuery";

/// Number of ranked results reported per search.
pub const MAX_REPORTED_RESULTS: usize = 10;

/// Payload for a [`SEARCH_QUERY_EVENT`].
///
/// Reports up to ten top results, each as its rank and the value of `label`
/// in that result.
pub fn search_query_data(response: &SearchResponse, label: &str) -> Value {
    let hits = usize::try_from(response.total_hits).unwrap_or(usize::MAX);
    let items: Vec<Value> = response
        .results
        .iter()
        .take(hits.min(MAX_REPORTED_RESULTS))
        .enumerate()
        .map(|(rank, result)| {
            json!({
                "rank": rank,
                "label": result.get(label).cloned().unwrap_or(Value::Null),
            })
        })
        .collect();

    json!({
        "search": {
            "query": response.query.query,
            "queryId": response.unique_id,
            "responseTime": response.response_time,
            "totalHits": response.total_hits,
            "items": items,
        }
    })
}

/// Payload for an [`EMPTY_SEARCH_QUERY_EVENT`].
pub fn empty_search_data(response: &SearchResponse) -> Value {
    if response.total_hits > 0 {
        warn!(
            query_id = %response.unique_id,
            total_hits = response.total_hits,
            "empty search event reported for a search with results"
        );
    }

    json!({
        "search": {
            "query": response.query.query,
            "queryId": response.unique_id,
            "responseTime": response.response_time,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(total_hits: u64, result_count: usize) -> SearchResponse {
        let results: Vec<Value> = (0..result_count)
            .map(|i| json!({"title": format!("item {i}"), "price": i}))
            .collect();
        serde_json::from_value(json!({
            "uniqueId": "q_1",
            "query": {"query": "shoes"},
            "results": results,
            "responseTime": 12,
            "totalHits": total_hits,
        }))
        .unwrap()
    }

    #[test]
    fn test_search_query_reports_top_ten() {
        let data = search_query_data(&response(40, 20), "title");
        let items = data["search"]["items"].as_array().unwrap();

        assert_eq!(items.len(), 10);
        assert_eq!(items[0], json!({"rank": 0, "label": "item 0"}));
        assert_eq!(items[9], json!({"rank": 9, "label": "item 9"}));
        assert_eq!(data["search"]["query"], "shoes");
        assert_eq!(data["search"]["queryId"], "q_1");
        assert_eq!(data["search"]["responseTime"], 12);
        assert_eq!(data["search"]["totalHits"], 40);
    }

    #[test]
    fn test_search_query_bounded_by_total_hits() {
        let data = search_query_data(&response(3, 20), "title");
        assert_eq!(data["search"]["items"].as_array().unwrap().len(), 3);

        let data = search_query_data(&response(8, 2), "title");
        assert_eq!(data["search"]["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_label_is_null() {
        let data = search_query_data(&response(1, 1), "brand");
        assert_eq!(data["search"]["items"][0]["label"], Value::Null);
    }

    #[test]
    fn test_empty_search_payload() {
        let data = empty_search_data(&response(0, 0));

        assert_eq!(
            data,
            json!({"search": {"query": "shoes", "queryId": "q_1", "responseTime": 12}})
        );
    }

    #[test]
    fn test_empty_search_with_hits_still_builds() {
        let data = empty_search_data(&response(5, 5));
        assert_eq!(data["search"]["queryId"], "q_1");
        assert!(data["search"].get("items").is_none());
    }
}
