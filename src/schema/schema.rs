use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::search::filter::FilterOp;

/// Forward-index sentinel for a missing or invalid numeric value.
pub const MISSING_NUMBER: i64 = 0xFFFF_FFFF;

/// Format used when a `Date` value is rendered back to a string.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Field kinds. Each kind fixes whether an inverted index exists, how values are
/// split into terms, how the forward index stores values and which filters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Primary,
    WholeString,
    Tokenized,
    ListString,
    SingleCharString,
    PureText,
    Integer,
    Date,
    Gather,
}

/// How a field value becomes terms in the inverted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermRule {
    /// The whole value is one term.
    Whole,
    /// `;`-separated list, one term per element.
    List,
    /// One term per distinct code point.
    SingleChar,
    /// Tokenizer output with term-frequency weights.
    Tokenized,
}

impl FieldKind {
    pub fn term_rule(self) -> Option<TermRule> {
        match self {
            FieldKind::Primary | FieldKind::WholeString | FieldKind::Gather => Some(TermRule::Whole),
            FieldKind::ListString => Some(TermRule::List),
            FieldKind::SingleCharString => Some(TermRule::SingleChar),
            FieldKind::Tokenized => Some(TermRule::Tokenized),
            FieldKind::PureText | FieldKind::Integer | FieldKind::Date => None,
        }
    }

    pub fn has_inverted(self) -> bool {
        self.term_rule().is_some()
    }

    /// Numeric kinds store their value inline in the forward array.
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Date)
    }

    /// Kinds whose forward values may be overwritten in place.
    pub fn is_updatable(self) -> bool {
        self.is_numeric()
    }

    pub fn permits(self, op: FilterOp) -> bool {
        if self.is_numeric() {
            op.is_numeric()
        } else {
            op.is_string()
        }
    }

    /// Coerce a request value into the forward storage form of this kind.
    /// Empty values become the missing marker rather than an error.
    pub fn coerce(self, field: &str, value: &Value) -> Result<StoredValue> {
        match self {
            FieldKind::Integer => coerce_integer(field, value).map(StoredValue::Number),
            FieldKind::Date => coerce_date(field, value).map(StoredValue::Number),
            _ => Ok(StoredValue::Text(value.to_string())),
        }
    }
}

/// A value in the shape the forward index stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Number(i64),
    Text(String),
}

impl StoredValue {
    pub fn missing(kind: FieldKind) -> Self {
        if kind.is_numeric() {
            StoredValue::Number(MISSING_NUMBER)
        } else {
            StoredValue::Text(String::new())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            StoredValue::Number(_) => None,
        }
    }
}

fn coerce_integer(field: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Int64(i) => Ok(*i),
        Value::Float64(f) => Ok((f * 100.0) as i64),
        Value::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(MISSING_NUMBER);
            }
            if let Ok(i) = s.parse::<i64>() {
                return Ok(i);
            }
            s.parse::<f64>()
                .map(|f| (f * 100.0) as i64)
                .map_err(|_| Error::type_mismatch(field, format!("'{}' is not an integer", s)))
        }
    }
}

fn coerce_date(field: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Int64(i) => Ok(*i),
        Value::Float64(f) => Ok(*f as i64),
        Value::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(MISSING_NUMBER);
            }
            parse_date(s).ok_or_else(|| Error::type_mismatch(field, format!("'{}' is not a date", s)))
        }
    }
}

/// Parse a date literal into unix seconds, interpreting naive forms in local time.
pub fn parse_date(s: &str) -> Option<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Some(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    let naive = NaiveDateTime::parse_from_str(s, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Local.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp())
}

/// Render unix seconds as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_date(secs: i64) -> Option<String> {
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format(DATE_FORMAT).to_string())
}

/// Serializable per-field metadata stored in partition and table metas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub forward_offset: u64,
    #[serde(default)]
    pub forward_doc_count: u64,
    #[serde(default)]
    pub dict_offset: u64,
    #[serde(default)]
    pub dict_len: u64,
}

impl FieldSummary {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        FieldSummary {
            name: name.to_string(),
            kind,
            forward_offset: 0,
            forward_doc_count: 0,
            dict_offset: 0,
            dict_len: 0,
        }
    }

    /// Same field identity, on-disk location dropped.
    pub fn schema_only(&self) -> Self {
        FieldSummary::new(&self.name, self.kind)
    }
}

/// Field and table names end up in file names.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "{} name '{}' must match [A-Za-z0-9_]+",
            what, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_coercion_rules() {
        let kind = FieldKind::Integer;
        assert_eq!(kind.coerce("age", &Value::Int64(20)).unwrap(), StoredValue::Number(20));
        assert_eq!(kind.coerce("age", &Value::Float64(1.5)).unwrap(), StoredValue::Number(150));
        assert_eq!(kind.coerce("age", &Value::from(" 30 ")).unwrap(), StoredValue::Number(30));
        assert_eq!(kind.coerce("age", &Value::from("")).unwrap(), StoredValue::Number(MISSING_NUMBER));
        assert!(kind.coerce("age", &Value::from("old")).is_err());
    }

    #[test]
    fn string_kinds_stringify() {
        let kind = FieldKind::WholeString;
        assert_eq!(kind.coerce("pk", &Value::Int64(10001)).unwrap(), StoredValue::Text("10001".into()));
        assert_eq!(kind.coerce("x", &Value::Float64(2.5)).unwrap(), StoredValue::Text("2.5".into()));
    }

    #[test]
    fn date_round_trips_through_local_time() {
        let secs = parse_date("2021-03-04 05:06:07").unwrap();
        assert_eq!(format_date(secs).unwrap(), "2021-03-04 05:06:07");
        assert_eq!(parse_date("1600000000"), Some(1_600_000_000));
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn kind_tables() {
        assert!(FieldKind::Primary.has_inverted());
        assert!(!FieldKind::PureText.has_inverted());
        assert!(!FieldKind::Date.has_inverted());
        assert!(FieldKind::Integer.permits(FilterOp::Between));
        assert!(!FieldKind::Integer.permits(FilterOp::Prefix));
        assert!(FieldKind::Tokenized.permits(FilterOp::Contains));
    }

    #[test]
    fn names_are_file_safe() {
        assert!(validate_name("table", "t_1").is_ok());
        assert!(validate_name("table", "../x").is_err());
        assert!(validate_name("table", "").is_err());
    }
}
