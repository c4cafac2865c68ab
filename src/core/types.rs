use std::collections::HashMap;
use std::fmt;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};

/// Table-global document id, assigned in strictly increasing order and never reused.
pub type DocId = u32;

/// Typed request value, produced where requests are parsed and coerced per field kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    Str(String),
}

impl Value {
    /// Convert a JSON scalar; `null` becomes the empty string, compound values are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Value::Str(String::new())),
            serde_json::Value::Bool(b) => Ok(Value::Str(b.to_string())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int64(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float64(f))
                } else {
                    Err(Error::invalid_argument(format!("unsupported number {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            other => Err(Error::invalid_argument(format!(
                "expected a scalar value, got {}",
                other
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Str(s) if s.is_empty())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A document's field values keyed by field name.
pub type Document = HashMap<String, Value>;

/// Materialized search hit or point lookup result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocInfo {
    pub doc_id: DocId,
    pub weight: u16,
    pub fields: HashMap<String, String>,
}

impl DocInfo {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(|s| s.as_str())
    }
}

/// Build a `Document` from `(field, value)` pairs.
pub fn document<I, K, V>(pairs: I) -> Document
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Parse a JSON object of scalar values into a `Document`.
pub fn document_from_json(value: &serde_json::Value) -> Result<Document> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::invalid_argument("document must be a JSON object"))?;
    object
        .iter()
        .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_documents() {
        let doc = document_from_json(&json!({
            "pk": "10001",
            "age": 20,
            "score": 1.5,
            "vip": true,
            "note": null
        }))
        .unwrap();
        assert_eq!(doc["pk"], Value::Str("10001".into()));
        assert_eq!(doc["age"], Value::Int64(20));
        assert_eq!(doc["score"], Value::Float64(1.5));
        assert_eq!(doc["vip"], Value::Str("true".into()));
        assert!(doc["note"].is_empty());

        assert!(document_from_json(&json!({"tags": ["a"]})).is_err());
        assert!(document_from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn display_matches_stored_text() {
        assert_eq!(Value::from(42i64).to_string(), "42");
        assert_eq!(Value::from("x").to_string(), "x");
        let doc = document([("a", 1i64), ("b", 2i64)]);
        assert_eq!(doc.len(), 2);
    }
}
