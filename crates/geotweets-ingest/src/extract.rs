//! Field extraction from loosely-typed records
//!
//! Source records come from two generations of producers. The older one was
//! exported from a document store that wrapped wide integers as
//! `{"$numberLong": "<digits>"}`; every id-shaped field has to accept both
//! that wrapper and a plain JSON number.
//!
//! A missing key and an explicit `null` both read as absent through
//! [`get_optional`]. [`require`] tells them apart: the key must exist, but
//! its value may still be `null`.

use serde_json::{Map, Value};

use crate::error::{IngestError, IngestResult};

/// Tag used by the legacy wide-integer wrapper
pub const NUMBER_LONG: &str = "$numberLong";

pub type Object = Map<String, Value>;

/// Value at `key`, or `None` when the key is missing or `null`
pub fn get_optional<'a>(map: &'a Object, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

/// Value at `key`; the key must exist but the value may be `null`
pub fn require<'a>(map: &'a Object, key: &str) -> IngestResult<Option<&'a Value>> {
    match map.get(key) {
        Some(value) => Ok(Some(value).filter(|v| !v.is_null())),
        None => Err(IngestError::malformed(format!("missing field `{}`", key))),
    }
}

/// Object at `key`; missing, `null` or non-object values are malformed
pub fn require_object<'a>(map: &'a Object, key: &str) -> IngestResult<&'a Object> {
    require(map, key)?
        .and_then(Value::as_object)
        .ok_or_else(|| IngestError::malformed(format!("field `{}` is not an object", key)))
}

/// Turn a possibly-wrapped wide integer into an `i64`
///
/// Absence propagates. Accepts a JSON integer, a `$numberLong` wrapper or a
/// bare numeric string.
pub fn unwrap_legacy_integer(value: Option<&Value>) -> IngestResult<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| IngestError::malformed(format!("{} is not a 64-bit integer", n))),
        Value::String(digits) => parse_digits(digits).map(Some),
        Value::Object(obj) if obj.len() == 1 => match obj.get(NUMBER_LONG) {
            Some(Value::String(digits)) => parse_digits(digits).map(Some),
            Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| {
                IngestError::malformed(format!("{} is not a 64-bit integer", n))
            }),
            _ => Err(IngestError::malformed(format!(
                "unrecognized integer wrapper: {}",
                value
            ))),
        },
        other => Err(IngestError::malformed(format!(
            "expected integer, found {}",
            other
        ))),
    }
}

fn parse_digits(digits: &str) -> IngestResult<i64> {
    digits
        .trim()
        .parse::<i64>()
        .map_err(|e| IngestError::malformed(format!("bad integer {:?}: {}", digits, e)))
}

/// Legacy-unwrapped id that must be present
pub fn require_id(map: &Object, key: &str) -> IngestResult<i64> {
    unwrap_legacy_integer(require(map, key)?)?
        .ok_or_else(|| IngestError::malformed(format!("field `{}` is null", key)))
}

pub fn opt_string(field: &str, value: Option<&Value>) -> IngestResult<Option<String>> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(type_error(field, "string", other)),
    }
}

pub fn opt_bool(field: &str, value: Option<&Value>) -> IngestResult<Option<bool>> {
    match value {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(type_error(field, "bool", other)),
    }
}

pub fn opt_i64(field: &str, value: Option<&Value>) -> IngestResult<Option<i64>> {
    match value {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| type_error(field, "integer", &Value::Number(n.clone()))),
        Some(other) => Err(type_error(field, "integer", other)),
    }
}

/// Required-key string attribute (nullable)
pub fn string_field(map: &Object, key: &str) -> IngestResult<Option<String>> {
    opt_string(key, require(map, key)?)
}

pub fn bool_field(map: &Object, key: &str) -> IngestResult<Option<bool>> {
    opt_bool(key, require(map, key)?)
}

pub fn i64_field(map: &Object, key: &str) -> IngestResult<Option<i64>> {
    opt_i64(key, require(map, key)?)
}

/// Map every element of the array at `key` through `f`
///
/// `None` when the key is absent, so "no collection recorded" stays distinct
/// from an empty collection.
pub fn collect_list<T, F>(map: &Object, key: &str, mut f: F) -> IngestResult<Option<Vec<T>>>
where
    F: FnMut(&Object) -> IngestResult<T>,
{
    let Some(value) = get_optional(map, key) else {
        return Ok(None);
    };

    let items = value
        .as_array()
        .ok_or_else(|| type_error(key, "array", value))?;

    items
        .iter()
        .map(|item| {
            let obj = item
                .as_object()
                .ok_or_else(|| type_error(key, "array of objects", item))?;
            f(obj)
        })
        .collect::<IngestResult<Vec<T>>>()
        .map(Some)
}

fn type_error(field: &str, expected: &str, found: &Value) -> IngestError {
    IngestError::malformed(format!(
        "field `{}`: expected {}, found {}",
        field,
        expected,
        json_kind(found)
    ))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn obj(v: Value) -> Object {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_get_optional_missing_and_null() {
        let m = obj(json!({"a": 1, "b": null}));
        assert_eq!(get_optional(&m, "a"), Some(&json!(1)));
        assert_eq!(get_optional(&m, "b"), None);
        assert_eq!(get_optional(&m, "c"), None);
    }

    #[test]
    fn test_require_distinguishes_missing_from_null() {
        let m = obj(json!({"b": null}));
        assert_eq!(require(&m, "b").unwrap(), None);
        assert!(matches!(require(&m, "c"), Err(IngestError::MalformedRecord(_))));
    }

    #[test]
    fn test_unwrap_legacy_integer_forms() {
        assert_eq!(unwrap_legacy_integer(Some(&json!(42))).unwrap(), Some(42));
        assert_eq!(
            unwrap_legacy_integer(Some(&json!({"$numberLong": "9007199254740993"}))).unwrap(),
            Some(9_007_199_254_740_993)
        );
        assert_eq!(unwrap_legacy_integer(Some(&json!("17"))).unwrap(), Some(17));
        assert_eq!(unwrap_legacy_integer(None).unwrap(), None);
        assert_eq!(unwrap_legacy_integer(Some(&Value::Null)).unwrap(), None);
    }

    #[test]
    fn test_unwrap_legacy_integer_rejects_garbage() {
        assert!(unwrap_legacy_integer(Some(&json!({"$numberLong": "12x"}))).is_err());
        assert!(unwrap_legacy_integer(Some(&json!({"$numberInt": "1"}))).is_err());
        assert!(unwrap_legacy_integer(Some(&json!(1.5))).is_err());
        assert!(unwrap_legacy_integer(Some(&json!([1]))).is_err());
    }

    #[test]
    fn test_collect_list_absent_vs_empty() {
        let m = obj(json!({"hashtags": []}));
        let text = |o: &Object| string_field(o, "text");
        assert_eq!(collect_list(&m, "hashtags", text).unwrap(), Some(vec![]));
        assert_eq!(collect_list(&m, "urls", text).unwrap(), None);
    }

    #[test]
    fn test_collect_list_preserves_order() {
        let m = obj(json!({"hashtags": [{"text": "b"}, {"text": "a"}]}));
        let tags = collect_list(&m, "hashtags", |o| string_field(o, "text")).unwrap();
        assert_eq!(tags, Some(vec![Some("b".to_string()), Some("a".to_string())]));
    }

    #[test]
    fn test_typed_fields_reject_wrong_types() {
        let m = obj(json!({"verified": "yes", "count": "3", "name": 5}));
        assert!(bool_field(&m, "verified").is_err());
        assert!(i64_field(&m, "count").is_err());
        assert!(string_field(&m, "name").is_err());
    }

    proptest! {
        #[test]
        fn prop_legacy_integer_round_trip(n in any::<i64>()) {
            let wrapped = json!({ NUMBER_LONG: n.to_string() });
            let plain = json!(n);
            prop_assert_eq!(unwrap_legacy_integer(Some(&wrapped)).unwrap(), Some(n));
            prop_assert_eq!(unwrap_legacy_integer(Some(&plain)).unwrap(), Some(n));
        }
    }
}
