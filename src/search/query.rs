use serde::{Deserialize, Serialize};
use crate::search::filter::Filter;

/// `field` must contain `value` (tokenized fields: every sub-term of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermClause {
    pub field: String,
    pub value: String,
}

/// Conjunction of term clauses, narrowed by filters. With no non-empty clause
/// every live document is a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub clauses: Vec<TermClause>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(field: &str, value: &str) -> Self {
        Query::new().and(field, value)
    }

    pub fn and(mut self, field: &str, value: &str) -> Self {
        self.clauses.push(TermClause {
            field: field.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Clauses that actually constrain the result.
    pub fn active_clauses(&self) -> impl Iterator<Item = &TermClause> {
        self.clauses.iter().filter(|c| !c.value.is_empty())
    }
}

/// Single-field search request as it arrives from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub table: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl From<SearchRequest> for Query {
    fn from(request: SearchRequest) -> Self {
        let mut query = Query {
            clauses: Vec::new(),
            filters: request.filters,
        };
        if !request.field.is_empty() {
            query = query.and(&request.field, &request.value);
        }
        query
    }
}
