use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::schema::schema::{parse_date, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "prefix")]
    Prefix,
    #[serde(rename = "suffix")]
    Suffix,
    #[serde(rename = "contains")]
    Contains,
}

impl FilterOp {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FilterOp::Eq
                | FilterOp::Ne
                | FilterOp::Gt
                | FilterOp::Lt
                | FilterOp::Between
                | FilterOp::In
                | FilterOp::NotIn
        )
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            FilterOp::Eq
                | FilterOp::Ne
                | FilterOp::In
                | FilterOp::NotIn
                | FilterOp::Prefix
                | FilterOp::Suffix
                | FilterOp::Contains
        )
    }

    /// Negative predicates are the only ones a missing value can satisfy.
    pub fn is_negative(self) -> bool {
        matches!(self, FilterOp::Ne | FilterOp::NotIn)
    }
}

/// Filter as it arrives in a search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range_ints: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range_strs: Vec<String>,
}

impl Filter {
    fn new(field: &str, op: FilterOp) -> Self {
        Filter {
            field: field.to_string(),
            op,
            str: None,
            int: None,
            begin: None,
            end: None,
            range_ints: Vec::new(),
            range_strs: Vec::new(),
        }
    }

    pub fn int(field: &str, op: FilterOp, value: i64) -> Self {
        Filter {
            int: Some(value),
            ..Filter::new(field, op)
        }
    }

    pub fn text(field: &str, op: FilterOp, value: &str) -> Self {
        Filter {
            str: Some(value.to_string()),
            ..Filter::new(field, op)
        }
    }

    /// Inclusive range `[begin, end]`.
    pub fn between(field: &str, begin: i64, end: i64) -> Self {
        Filter {
            begin: Some(begin),
            end: Some(end),
            ..Filter::new(field, FilterOp::Between)
        }
    }

    pub fn in_ints(field: &str, negate: bool, values: Vec<i64>) -> Self {
        let op = if negate { FilterOp::NotIn } else { FilterOp::In };
        Filter {
            range_ints: values,
            ..Filter::new(field, op)
        }
    }

    pub fn in_strs(field: &str, negate: bool, values: Vec<String>) -> Self {
        let op = if negate { FilterOp::NotIn } else { FilterOp::In };
        Filter {
            range_strs: values,
            ..Filter::new(field, op)
        }
    }

    /// Check the operator against the field kind and pick the operands it needs.
    pub fn compile(&self, kind: FieldKind) -> Result<CompiledFilter> {
        if !kind.permits(self.op) {
            return Err(Error::unsupported(format!(
                "operator {:?} not supported on {:?} field '{}'",
                self.op, kind, self.field
            )));
        }

        let operand = if kind.is_numeric() {
            let scalar = |name: &str| -> Result<i64> {
                self.int
                    .or_else(|| {
                        if kind == FieldKind::Date {
                            self.str.as_deref().and_then(parse_date)
                        } else {
                            self.str.as_deref().and_then(|s| s.trim().parse().ok())
                        }
                    })
                    .ok_or_else(|| self.missing_operand(name))
            };
            match self.op {
                FilterOp::Between => {
                    let begin = self.begin.ok_or_else(|| self.missing_operand("begin"))?;
                    let end = self.end.ok_or_else(|| self.missing_operand("end"))?;
                    Operand::Range(begin, end)
                }
                FilterOp::In | FilterOp::NotIn => Operand::Ints(self.range_ints.clone()),
                _ => Operand::Int(scalar("int")?),
            }
        } else {
            match self.op {
                FilterOp::In | FilterOp::NotIn => Operand::Strs(self.range_strs.clone()),
                _ => Operand::Str(self.str.clone().ok_or_else(|| self.missing_operand("str"))?),
            }
        };

        Ok(CompiledFilter {
            field: self.field.clone(),
            op: self.op,
            operand,
        })
    }

    fn missing_operand(&self, name: &str) -> Error {
        Error::invalid_argument(format!(
            "filter {:?} on '{}' requires '{}'",
            self.op, self.field, name
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Range(i64, i64),
    Ints(Vec<i64>),
    Str(String),
    Strs(Vec<String>),
}

/// Filter validated against its field's kind.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub field: String,
    pub op: FilterOp,
    pub operand: Operand,
}

impl CompiledFilter {
    /// `None` is a missing value: it satisfies only negative predicates.
    pub fn matches_number(&self, value: Option<i64>) -> bool {
        let Some(v) = value else {
            return self.op.is_negative();
        };
        match (&self.op, &self.operand) {
            (FilterOp::Eq, Operand::Int(a)) => v == *a,
            (FilterOp::Ne, Operand::Int(a)) => v != *a,
            (FilterOp::Gt, Operand::Int(a)) => v > *a,
            (FilterOp::Lt, Operand::Int(a)) => v < *a,
            (FilterOp::Between, Operand::Range(a, b)) => v >= *a && v <= *b,
            (FilterOp::In, Operand::Ints(list)) => list.contains(&v),
            (FilterOp::NotIn, Operand::Ints(list)) => !list.contains(&v),
            _ => false,
        }
    }

    pub fn matches_text(&self, value: Option<&str>) -> bool {
        let Some(v) = value else {
            return self.op.is_negative();
        };
        match (&self.op, &self.operand) {
            (FilterOp::Eq, Operand::Str(a)) => v == a,
            (FilterOp::Ne, Operand::Str(a)) => v != a,
            (FilterOp::Prefix, Operand::Str(a)) => v.starts_with(a.as_str()),
            (FilterOp::Suffix, Operand::Str(a)) => v.ends_with(a.as_str()),
            (FilterOp::Contains, Operand::Str(a)) => v.contains(a.as_str()),
            (FilterOp::In, Operand::Strs(list)) => list.iter().any(|s| s == v),
            (FilterOp::NotIn, Operand::Strs(list)) => !list.iter().any(|s| s == v),
            _ => false,
        }
    }
}
