//! JSON encoding of documents.
//!
//! Two fidelity levels are supported:
//!
//! | Value      | canonical                          | relaxed                |
//! |------------|------------------------------------|------------------------|
//! | date       | `{"$date": "2024-01-02T03:04:05Z"}` | `"2024-01-02T03:04:05Z"` |
//! | object id  | `{"$oid": "<24 hex>"}`             | `"<24 hex>"`           |
//! | binary     | `{"$binary": "<base64>"}`          | `"<base64>"`           |
//! | NaN / ±inf | `{"$numberDouble": "NaN"}`         | `"NaN"`                |
//!
//! Dates outside years 1-9999 have no RFC 3339 form and are written as
//! `{"$date": {"$numberLong": "<epoch millis>"}}`. A nested document whose
//! only key starts with `$` would read back as a wrapper, so canonical output
//! escapes it as `{"$doc": {...}}`.
//!
//! Canonical output decodes back to the same [`Value`]; relaxed output is
//! plain JSON and typed values come back as strings.

use super::value::{Document, ObjectId, Value};
use crate::utils::DecodeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number};

/// How typed values are written to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fidelity {
    #[default]
    Canonical,
    Relaxed,
}

impl std::fmt::Display for Fidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fidelity::Canonical => f.write_str("canonical"),
            Fidelity::Relaxed => f.write_str("relaxed"),
        }
    }
}

fn double_label(v: f64) -> &'static str {
    if v.is_nan() {
        "NaN"
    } else if v > 0.0 {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn wrap(key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    serde_json::Value::Object(map)
}

pub fn value_to_json(value: &Value, fidelity: Fidelity) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Double(v) => match Number::from_f64(*v) {
            Some(n) => Json::Number(n),
            None => match fidelity {
                Fidelity::Canonical => wrap("$numberDouble", Json::String(double_label(*v).into())),
                Fidelity::Relaxed => Json::String(double_label(*v).into()),
            },
        },
        Value::String(s) => Json::String(s.clone()),
        Value::DateTime(dt) => {
            let text = dt.to_rfc3339_opts(SecondsFormat::AutoSi, true);
            match fidelity {
                Fidelity::Canonical if (1..=9999).contains(&dt.year()) => {
                    wrap("$date", Json::String(text))
                }
                Fidelity::Canonical => wrap(
                    "$date",
                    wrap("$numberLong", Json::String(dt.timestamp_millis().to_string())),
                ),
                Fidelity::Relaxed => Json::String(text),
            }
        }
        Value::Binary(bytes) => {
            let text = BASE64.encode(bytes);
            match fidelity {
                Fidelity::Canonical => wrap("$binary", Json::String(text)),
                Fidelity::Relaxed => Json::String(text),
            }
        }
        Value::ObjectId(oid) => match fidelity {
            Fidelity::Canonical => wrap("$oid", Json::String(oid.to_hex())),
            Fidelity::Relaxed => Json::String(oid.to_hex()),
        },
        Value::Array(items) => {
            Json::Array(items.iter().map(|v| value_to_json(v, fidelity)).collect())
        }
        Value::Document(doc) => {
            let map = document_to_map(doc, fidelity);
            if fidelity == Fidelity::Canonical && looks_like_wrapper(&map) {
                wrap("$doc", Json::Object(map))
            } else {
                Json::Object(map)
            }
        }
    }
}

fn looks_like_wrapper(map: &Map<String, serde_json::Value>) -> bool {
    map.len() == 1 && map.keys().all(|k| k.starts_with('$'))
}

fn document_to_map(doc: &Document, fidelity: Fidelity) -> Map<String, serde_json::Value> {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        map.insert(key.to_string(), value_to_json(value, fidelity));
    }
    map
}

pub fn document_to_json(doc: &Document, fidelity: Fidelity) -> serde_json::Value {
    serde_json::Value::Object(document_to_map(doc, fidelity))
}

/// Decode a single-key `$`-wrapper, or `None` if `map` is an ordinary object.
fn decode_wrapper(map: &Map<String, serde_json::Value>) -> Option<Result<Value, DecodeError>> {
    if map.len() != 1 {
        return None;
    }
    let (key, inner) = map.iter().next()?;
    let text = inner.as_str();
    let decoded = match (key.as_str(), text) {
        ("$date", Some(text)) => DateTime::parse_from_rfc3339(text)
            .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
            .map_err(|e| DecodeError(format!("invalid $date {text:?}: {e}"))),
        ("$date", None) => decode_epoch_millis(inner),
        ("$doc", None) => match inner {
            serde_json::Value::Object(fields) => map_to_document(fields.clone(), Fidelity::Canonical)
                .map(Value::Document),
            _ => Err(DecodeError("$doc must hold an object".to_string())),
        },
        ("$oid", Some(text)) => text.parse::<ObjectId>().map(Value::ObjectId),
        ("$binary", Some(text)) => BASE64
            .decode(text)
            .map(Value::Binary)
            .map_err(|e| DecodeError(format!("invalid $binary: {e}"))),
        ("$numberDouble", Some(text)) => match text {
            "NaN" => Ok(Value::Double(f64::NAN)),
            "Infinity" => Ok(Value::Double(f64::INFINITY)),
            "-Infinity" => Ok(Value::Double(f64::NEG_INFINITY)),
            other => other
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| DecodeError(format!("invalid $numberDouble {other:?}"))),
        },
        ("$oid" | "$binary" | "$numberDouble", None) => {
            Err(DecodeError(format!("{key} must hold a string")))
        }
        ("$doc", Some(_)) => Err(DecodeError("$doc must hold an object".to_string())),
        _ => return None,
    };
    Some(decoded)
}

/// `{"$numberLong": "<millis>"}` inside a `$date`.
fn decode_epoch_millis(inner: &serde_json::Value) -> Result<Value, DecodeError> {
    let millis = inner
        .get("$numberLong")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DecodeError("$date must hold a string or {\"$numberLong\": ...}".to_string()))?;
    millis
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(Value::DateTime)
        .ok_or_else(|| DecodeError(format!("invalid $date millis {millis:?}")))
}

pub fn value_from_json(json: serde_json::Value, fidelity: Fidelity) -> Result<Value, DecodeError> {
    use serde_json::Value as Json;

    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| value_from_json(v, fidelity))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(map) => {
            if fidelity == Fidelity::Canonical {
                if let Some(decoded) = decode_wrapper(&map) {
                    return decoded;
                }
            }
            Value::Document(map_to_document(map, fidelity)?)
        }
    })
}

fn map_to_document(
    map: Map<String, serde_json::Value>,
    fidelity: Fidelity,
) -> Result<Document, DecodeError> {
    let mut doc = Document::new();
    for (key, value) in map {
        doc.insert(key, value_from_json(value, fidelity)?);
    }
    Ok(doc)
}

pub fn document_from_json(json: serde_json::Value, fidelity: Fidelity) -> Result<Document, DecodeError> {
    match json {
        serde_json::Value::Object(map) => map_to_document(map, fidelity),
        other => Err(DecodeError(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Compact canonical JSON rendering of a value, for messages and reports.
pub fn render_value(value: &Value) -> String {
    value_to_json(value, Fidelity::Canonical).to_string()
}

/// Encode a document as a single JSON line (no trailing newline).
pub fn encode_line(doc: &Document, fidelity: Fidelity) -> Result<Vec<u8>, DecodeError> {
    serde_json::to_vec(&document_to_json(doc, fidelity)).map_err(|e| DecodeError(e.to_string()))
}

/// Decode one JSON line produced by [`encode_line`].
pub fn decode_line(line: &[u8], fidelity: Fidelity) -> Result<Document, DecodeError> {
    let json: serde_json::Value =
        serde_json::from_slice(line).map_err(|e| DecodeError(e.to_string()))?;
    document_from_json(json, fidelity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn typed_document() -> Document {
        let nested = Document::new().with("street", "Main").with("zip", 12345);
        Document::new()
            .with("_id", "65a1f0c2e4b0a1b2c3d4e5f6".parse::<ObjectId>().unwrap())
            .with("created", Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap())
            .with("payload", Value::Binary(vec![0, 1, 2, 254, 255]))
            .with("ratio", 0.25)
            .with("whole", 3.0)
            .with("weird", f64::INFINITY)
            .with("tags", vec!["a", "b"])
            .with("address", nested)
            .with("missing", Value::Null)
    }

    #[test]
    fn test_canonical_round_trip_preserves_types_and_order() {
        let doc = typed_document();
        let line = encode_line(&doc, Fidelity::Canonical).unwrap();
        let back = decode_line(&line, Fidelity::Canonical).unwrap();

        assert_eq!(back, doc);
        assert_eq!(
            back.keys().collect::<Vec<_>>(),
            vec!["_id", "created", "payload", "ratio", "whole", "weird", "tags", "address", "missing"]
        );
    }

    #[test]
    fn test_canonical_nan_round_trip() {
        let doc = Document::new().with("x", f64::NAN);
        let line = encode_line(&doc, Fidelity::Canonical).unwrap();
        let back = decode_line(&line, Fidelity::Canonical).unwrap();
        match back.get("x") {
            Some(Value::Double(v)) => assert!(v.is_nan()),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_relaxed_stringifies_typed_values() {
        let doc = typed_document();
        let json = document_to_json(&doc, Fidelity::Relaxed);

        assert_eq!(json["_id"], "65a1f0c2e4b0a1b2c3d4e5f6");
        assert_eq!(json["created"], "2024-01-02T03:04:05Z");
        assert_eq!(json["weird"], "Infinity");

        let back = document_from_json(json, Fidelity::Relaxed).unwrap();
        assert_eq!(
            back.get("_id"),
            Some(&Value::String("65a1f0c2e4b0a1b2c3d4e5f6".into()))
        );
    }

    #[test]
    fn test_relaxed_decoding_ignores_wrappers() {
        let json = serde_json::json!({"when": {"$date": "2024-01-02T03:04:05Z"}});
        let doc = document_from_json(json, Fidelity::Relaxed).unwrap();
        assert!(matches!(doc.get("when"), Some(Value::Document(_))));
    }

    #[test]
    fn test_invalid_wrapper_is_rejected() {
        let json = serde_json::json!({"when": {"$date": "yesterday"}});
        assert!(document_from_json(json, Fidelity::Canonical).is_err());

        let json = serde_json::json!({"id": {"$oid": 42}});
        assert!(document_from_json(json, Fidelity::Canonical).is_err());
    }

    fn canonical_round_trip(doc: &Document) -> Document {
        let line = encode_line(doc, Fidelity::Canonical).unwrap();
        decode_line(&line, Fidelity::Canonical).unwrap()
    }

    #[test]
    fn test_dollar_keyed_documents_stay_documents() {
        let doc = Document::new()
            .with("_id", 1)
            .with("filter", Document::new().with("$date", "soon"))
            .with("ref", Document::new().with("$oid", "65a1f0c2e4b0a1b2c3d4e5f6"))
            .with(
                "query",
                Document::new().with("$or", vec![Value::from(Document::new().with("$doc", 1))]),
            )
            .with("wrapped", Document::new().with("$doc", Document::new().with("a", 1)));

        assert_eq!(canonical_round_trip(&doc), doc);
        assert!(matches!(
            canonical_round_trip(&doc).get("ref"),
            Some(Value::Document(_))
        ));
    }

    #[test]
    fn test_multi_key_dollar_document_is_not_escaped() {
        let doc = Document::new().with("range", Document::new().with("$gt", 1).with("$lt", 5));
        let json = document_to_json(&doc, Fidelity::Canonical);
        assert_eq!(json["range"]["$gt"], 1);
        assert_eq!(canonical_round_trip(&doc), doc);
    }

    #[test]
    fn test_dates_outside_rfc3339_range_round_trip() {
        let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap();
        let doc = Document::new().with("expires", far).with("last", last);

        let json = document_to_json(&doc, Fidelity::Canonical);
        assert_eq!(
            json["expires"]["$date"]["$numberLong"],
            far.timestamp_millis().to_string()
        );
        assert_eq!(json["last"]["$date"], "9999-12-31T23:59:59Z");
        assert_eq!(canonical_round_trip(&doc), doc);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        let err = document_from_json(serde_json::json!([1, 2]), Fidelity::Canonical).unwrap_err();
        assert!(err.0.contains("an array"));
    }
}
