//! Response-shape adapter for the tRPC endpoints.
//!
//! The remote API answers either with a bare JSON value or with a
//! `{result: {data: ...}}` envelope, and listing endpoints disagree on where
//! the list, the cursor and the identifiers live. Every lookup is an ordered
//! list of extractor strategies; the first one that returns `Some` wins.

use serde_json::Value;

use super::error::ShapeError;

/// One way of pulling a `T` out of a payload.
pub type Extractor<T> = fn(&Value) -> Option<T>;

/// Run `strategies` in order and stop at the first success.
pub fn first_match<T>(value: &Value, strategies: &[Extractor<T>]) -> Option<T> {
    strategies.iter().find_map(|strategy| strategy(value))
}

// ─── Envelope ───────────────────────────────────────────────────────────────

const ENVELOPE: &[Extractor<Value>] = &[result_data, result_object, bare_value];

// `{"result":{"data":null}}` is a procedure that returned null.
fn result_data(v: &Value) -> Option<Value> {
    v.get("result")?.get("data").cloned()
}

fn result_object(v: &Value) -> Option<Value> {
    v.get("result")
        .filter(|r| r.as_object().is_some_and(|o| !o.contains_key("data")))
        .cloned()
}

fn bare_value(v: &Value) -> Option<Value> {
    if v.get("error").is_some() {
        return None;
    }
    Some(v.clone())
}

/// Unwrap one response (or one element of a batched response).
///
/// Returns `None` for an error envelope.
pub fn unwrap_envelope(value: &Value) -> Option<Value> {
    first_match(value, ENVELOPE)
}

// ─── Lists ──────────────────────────────────────────────────────────────────

/// Keys tried, in order, when a listing is wrapped in an object.
pub const LIST_KEYS: &[&str] = &["items", "users", "countries", "articles", "transactions", "results", "data", "result"];

/// Find the item list of a listing response.
pub fn extract_list(value: &Value, keys: &[&str]) -> Result<Vec<Value>, ShapeError> {
    if let Value::Array(items) = value {
        return Ok(items.clone());
    }
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_array).cloned())
        .ok_or_else(|| ShapeError::NoList(keys.join(",")))
}

/// Like [`extract_list`], but also accepts an id-keyed object whose values
/// are all objects (`{"r1": {...}, "r2": {...}}`).
pub fn extract_list_or_map(value: &Value, keys: &[&str]) -> Result<Vec<Value>, ShapeError> {
    if let Ok(items) = extract_list(value, keys) {
        return Ok(items);
    }
    match value {
        Value::Object(map) if !map.is_empty() && map.values().all(Value::is_object) => {
            Ok(map.values().cloned().collect())
        }
        _ => Err(ShapeError::NoList(keys.join(","))),
    }
}

// ─── Scalars ────────────────────────────────────────────────────────────────

/// Follow a dotted path (`"leveling.level"`) through nested objects.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// First path that is present and holds a number (or numeric string).
pub fn number_at(value: &Value, paths: &[&str]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| lookup(value, path).and_then(as_number))
}

/// First path that is present and holds an integer-valued number.
pub fn integer_at(value: &Value, paths: &[&str]) -> Option<i64> {
    paths.iter().find_map(|path| {
        let v = lookup(value, path)?;
        match v {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    })
}

/// First path that is present and holds a non-empty string or a number.
pub fn text_at(value: &Value, paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| lookup(value, path).and_then(as_text))
}

/// Subject identifier of a listed object.
pub fn extract_id(value: &Value) -> Option<String> {
    text_at(value, &["_id", "id", "userId"])
}

/// Continuation cursor of a paginated response.
pub fn extract_cursor(value: &Value) -> Option<String> {
    text_at(value, &["nextCursor", "cursor", "next"])
}

/// Display name of a user-like object, top level first, then nested profiles.
pub fn extract_name(value: &Value) -> Option<String> {
    text_at(
        value,
        &[
            "name",
            "username",
            "displayName",
            "nick",
            "profile.name",
            "profile.username",
            "user.name",
            "user.username",
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_strategies() {
        assert_eq!(unwrap_envelope(&json!({"result": {"data": [1, 2]}})), Some(json!([1, 2])));
        // data missing: the result object itself is the payload
        assert_eq!(
            unwrap_envelope(&json!({"result": {"type": "data"}})),
            Some(json!({"type": "data"}))
        );
        assert_eq!(unwrap_envelope(&json!({"result": {"data": null}})), Some(Value::Null));
        assert_eq!(unwrap_envelope(&json!([1])), Some(json!([1])));
        assert_eq!(unwrap_envelope(&json!({"error": {"code": -32600}})), None);
    }

    #[test]
    fn test_list_extraction_order() {
        let v = json!({"items": [{"id": 1}], "data": [{"id": 2}]});
        assert_eq!(extract_list(&v, LIST_KEYS).unwrap(), vec![json!({"id": 1})]);
        assert!(extract_list(&json!({"count": 3}), LIST_KEYS).is_err());

        let keyed = json!({"r1": {"name": "a"}, "r2": {"name": "b"}});
        assert_eq!(extract_list_or_map(&keyed, LIST_KEYS).unwrap().len(), 2);
        assert!(extract_list_or_map(&json!({"r1": 3}), LIST_KEYS).is_err());
    }

    #[test]
    fn test_numeric_fallback_paths() {
        let paths = ["leveling.level", "level", "rankings.userLevel.value"];
        assert_eq!(integer_at(&json!({"leveling": {"level": 12}}), &paths), Some(12));
        assert_eq!(integer_at(&json!({"level": "7"}), &paths), Some(7));
        // unparseable first candidate falls through to the next path
        assert_eq!(
            integer_at(&json!({"level": "n/a", "rankings": {"userLevel": {"value": 31}}}), &paths),
            Some(31)
        );
        assert_eq!(integer_at(&json!({"other": 1}), &paths), None);
        assert_eq!(number_at(&json!({"a": {"b": "12.5"}}), &["a.b"]), Some(12.5));
    }

    #[test]
    fn test_ids_and_cursor() {
        assert_eq!(extract_id(&json!({"_id": "u1", "id": "u2"})), Some("u1".to_string()));
        assert_eq!(extract_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(extract_id(&json!({"id": ""})), None);
        assert_eq!(extract_cursor(&json!({"cursor": "c2"})), Some("c2".to_string()));
        assert_eq!(extract_cursor(&json!({"nextCursor": null})), None);
        assert_eq!(
            extract_name(&json!({"profile": {"username": "piet"}})),
            Some("piet".to_string())
        );
    }
}
