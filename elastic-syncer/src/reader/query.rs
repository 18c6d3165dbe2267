//! Search bodies for cursor and offset traversal

use crate::document::SortKey;
use crate::settings::TIMESTAMP_FIELD;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// A point-in-time reference carried by a search
#[derive(Debug, Clone, PartialEq)]
pub struct PitRef {
    pub id: String,
    pub keep_alive: Duration,
}

/// One page fetch. Built by the reader, executed by a `SourceStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    /// Lower bound on `timestamp`, inclusive
    pub from_time: Option<DateTime<Utc>>,
    /// Upper bound on `timestamp`, inclusive
    pub to_time: Option<DateTime<Utc>>,
    pub pit: Option<PitRef>,
    pub search_after: Option<SortKey>,
    /// Offset for paginated traversal
    pub offset: Option<usize>,
    pub size: usize,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, size: usize) -> Self {
        Self {
            index: index.into(),
            from_time: None,
            to_time: None,
            pit: None,
            search_after: None,
            offset: None,
            size,
        }
    }

    /// Range filter on `timestamp`. Present whenever either bound is set;
    /// an unset bound leaves that side open.
    pub fn range_filter(&self) -> Option<Value> {
        if self.from_time.is_none() && self.to_time.is_none() {
            return None;
        }

        let mut bounds = Map::new();
        if let Some(from) = self.from_time {
            bounds.insert("gte".to_string(), json!(from.timestamp_millis()));
        }
        if let Some(to) = self.to_time {
            bounds.insert("lte".to_string(), json!(to.timestamp_millis()));
        }
        bounds.insert("format".to_string(), json!("epoch_millis"));

        Some(json!({ "range": { TIMESTAMP_FIELD: bounds } }))
    }

    /// Request body for `_search`
    pub fn body(&self) -> Value {
        let filters: Vec<Value> = self.range_filter().into_iter().collect();

        let mut body = Map::new();
        body.insert("size".to_string(), json!(self.size));
        body.insert(
            "query".to_string(),
            json!({
                "bool": {
                    "must": { "match_all": {} },
                    "filter": filters,
                }
            }),
        );
        body.insert("sort".to_string(), sort_clause());

        if let Some(pit) = &self.pit {
            body.insert(
                "pit".to_string(),
                json!({
                    "id": pit.id,
                    "keep_alive": keep_alive_param(pit.keep_alive),
                }),
            );
        }
        if let Some(after) = &self.search_after {
            body.insert("search_after".to_string(), json!(after.values()));
        }
        if let Some(offset) = self.offset {
            body.insert("from".to_string(), json!(offset));
        }

        Value::Object(body)
    }
}

/// `timestamp desc, _id desc`. Indices without a mapped `timestamp` sort
/// as if every value were missing instead of failing the query.
pub fn sort_clause() -> Value {
    json!([
        { TIMESTAMP_FIELD: { "order": "desc", "unmapped_type": "date" } },
        { "_id": { "order": "desc" } }
    ])
}

/// Elasticsearch time unit string, e.g. `60s`
pub fn keep_alive_param(keep_alive: Duration) -> String {
    let millis = keep_alive.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_no_window_no_filter() {
        let req = SearchRequest::new("logs", 100);
        assert!(req.range_filter().is_none());
        assert_eq!(req.body()["query"]["bool"]["filter"], json!([]));
    }

    #[test]
    fn test_both_bounds() {
        let mut req = SearchRequest::new("logs", 100);
        req.from_time = Some(ts(1_000));
        req.to_time = Some(ts(2_000));

        assert_eq!(
            req.range_filter().unwrap(),
            json!({ "range": { "timestamp": { "gte": 1000, "lte": 2000, "format": "epoch_millis" } } })
        );
    }

    #[test]
    fn test_single_bound_is_open_on_other_side() {
        let mut req = SearchRequest::new("logs", 100);
        req.from_time = Some(ts(5_000));
        let filter = req.range_filter().unwrap();
        assert_eq!(filter["range"]["timestamp"]["gte"], 5000);
        assert!(filter["range"]["timestamp"].get("lte").is_none());

        let mut req = SearchRequest::new("logs", 100);
        req.to_time = Some(ts(7_000));
        let filter = req.range_filter().unwrap();
        assert_eq!(filter["range"]["timestamp"]["lte"], 7000);
        assert!(filter["range"]["timestamp"].get("gte").is_none());
    }

    #[test]
    fn test_pit_body() {
        let mut req = SearchRequest::new("logs", 50);
        req.pit = Some(PitRef {
            id: "pit-1".to_string(),
            keep_alive: Duration::from_secs(60),
        });
        req.search_after = Some(SortKey(vec![json!(1700000000000i64), json!("doc-9")]));

        let body = req.body();
        assert_eq!(body["size"], 50);
        assert_eq!(body["pit"], json!({ "id": "pit-1", "keep_alive": "60s" }));
        assert_eq!(body["search_after"], json!([1700000000000i64, "doc-9"]));
        assert_eq!(body["sort"][0]["timestamp"]["order"], "desc");
        assert_eq!(body["sort"][1]["_id"]["order"], "desc");
        assert!(body.get("from").is_none());
    }

    #[test]
    fn test_offset_body() {
        let mut req = SearchRequest::new("orders", 100);
        req.offset = Some(200);

        let body = req.body();
        assert_eq!(body["from"], 200);
        assert!(body.get("pit").is_none());
        assert!(body.get("search_after").is_none());
    }

    #[test]
    fn test_keep_alive_param() {
        assert_eq!(keep_alive_param(Duration::from_secs(60)), "60s");
        assert_eq!(keep_alive_param(Duration::from_millis(1500)), "1500ms");
    }
}
