//! Per-turn tool-call deduplication
//!
//! The driving LLM may re-emit a tool call it already issued earlier in the
//! same multi-step loop. Re-executing would double external cost and could
//! return inconsistent results for snapshot-style data, so the first call
//! with a given key wins: its result is recorded and every later structurally
//! identical call reuses it without network I/O, so all LLM-visible results
//! for equal calls are identical.
//!
//! The cache is exclusively owned by one agent-loop invocation. It is never
//! shared across turns and needs no eviction.

use crate::tools::ToolCall;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub struct ToolCallDeduper {
    results: HashMap<String, Value>,
}

impl ToolCallDeduper {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
        }
    }

    /// Recorded result for a previously executed key, if any.
    pub fn cached(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    /// Record the settled result for a key. Tool-error payloads are recorded
    /// too; a retry with identical params gets the identical error back.
    pub fn record(&mut self, key: String, result: Value) {
        self.results.insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl Default for ToolCallDeduper {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical key: tool name plus the hash of the key-sorted serialization of
/// the normalized (defaults applied) parameter object.
pub fn dedup_key(call: &ToolCall) -> String {
    let canonical = canonical_json(&call.normalized_args());

    let mut hasher = Sha256::new();
    hasher.update(call.name().as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());

    format!("{}:{}", call.name(), hex::encode(hasher.finalize()))
}

/// Serialize with object keys sorted recursively so that two structurally
/// equal values always produce the same string.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), sort_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn price_call(ticker: &str) -> ToolCall {
        ToolCall::parse(
            "getStockPrices",
            &json!({
                "ticker": ticker,
                "start_date": "2025-01-01",
                "end_date": "2025-02-01",
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_first_call_misses_then_duplicate_hits() {
        let mut deduper = ToolCallDeduper::new();
        let key = dedup_key(&price_call("AAPL"));

        assert!(deduper.cached(&key).is_none());
        deduper.record(key.clone(), json!({ "price": 230.0 }));

        // The duplicate sees exactly the recorded result.
        assert_eq!(deduper.cached(&key), Some(&json!({ "price": 230.0 })));
        assert_eq!(deduper.len(), 1);
    }

    #[test]
    fn test_different_params_are_distinct() {
        let mut deduper = ToolCallDeduper::new();
        let aapl = dedup_key(&price_call("AAPL"));
        let msft = dedup_key(&price_call("MSFT"));
        assert_ne!(aapl, msft);

        deduper.record(aapl.clone(), json!(1));
        assert!(deduper.cached(&msft).is_none());
    }

    #[test]
    fn test_new_turn_executes_again() {
        let key = dedup_key(&price_call("AAPL"));

        let mut first_turn = ToolCallDeduper::new();
        first_turn.record(key.clone(), json!(1));

        // A fresh deduper models the next turn; identical calls run again.
        let next_turn = ToolCallDeduper::new();
        assert!(next_turn.cached(&key).is_none());
    }

    #[test]
    fn test_canonical_json_ignores_key_order() {
        let a = json!({ "b": 1, "a": { "y": 2, "x": 3 } });
        let b = json!({ "a": { "x": 3, "y": 2 }, "b": 1 });
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_defaults_normalize_into_the_key() {
        // Omitted optional fields take their defaults before keying, so an
        // explicit default and an omitted field collide as duplicates.
        let explicit = ToolCall::parse(
            "getIncomeStatements",
            &json!({ "ticker": "AAPL", "period": "ttm", "limit": 5 }),
        )
        .unwrap();
        let implicit =
            ToolCall::parse("getIncomeStatements", &json!({ "ticker": "AAPL" })).unwrap();

        assert_eq!(dedup_key(&explicit), dedup_key(&implicit));
    }
}
