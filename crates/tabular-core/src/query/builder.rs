//! Query construction.
//!
//! Only table and column *names* are ever interpolated into query text, and
//! only after they have been matched against the table's resolved columns.
//! Every user-supplied value is a bound parameter.

use std::collections::HashSet;

use super::{BoundValue, CompiledQuery, QuerySpec};
use crate::error::{Result, TabularError};
use crate::store::quote_ident;

/// Escape character used in every generated `LIKE` clause.
const LIKE_ESCAPE: char = '\\';

/// The data query plus its matching filtered-count query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryPlan {
    /// Ordered, paginated data query
    pub data: CompiledQuery,
    /// `COUNT(*)` over the same predicate, without pagination
    pub count: CompiledQuery,
    /// True when the plan carries a WHERE clause
    pub filtered: bool,
}

/// Builds compiled queries for one table with known columns.
pub struct QueryBuilder<'a> {
    table: &'a str,
    columns: &'a [String],
    known: HashSet<&'a str>,
}

impl<'a> QueryBuilder<'a> {
    /// Create a builder for `table` with its resolved, ordered `columns`.
    pub fn new(table: &'a str, columns: &'a [String]) -> Self {
        Self {
            table,
            columns,
            known: columns.iter().map(String::as_str).collect(),
        }
    }

    /// Compile `spec` into a data query and a count query.
    ///
    /// Deterministic: the same spec and columns always produce byte-identical
    /// SQL and parameters.
    pub fn build(&self, spec: &QuerySpec) -> Result<QueryPlan> {
        let table = quote_ident(self.table);
        let (predicate, mut params) = self.predicate(spec);

        let where_clause = predicate
            .as_ref()
            .map(|p| format!(" WHERE {}", p))
            .unwrap_or_default();

        let count = CompiledQuery {
            sql: format!("SELECT COUNT(*) FROM {}{}", table, where_clause),
            params: params.clone(),
        };

        let mut sql = format!("SELECT * FROM {}{}", table, where_clause);
        if let Some(order) = self.order_by(spec) {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        match (spec.limit, spec.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ?");
                params.push(BoundValue::Integer(bound_to_i64("limit", limit)?));
                if let Some(offset) = offset {
                    sql.push_str(" OFFSET ?");
                    params.push(BoundValue::Integer(bound_to_i64("offset", offset)?));
                }
            }
            (None, Some(offset)) => {
                // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(BoundValue::Integer(bound_to_i64("offset", offset)?));
            }
            (None, None) => {}
        }

        Ok(QueryPlan {
            data: CompiledQuery { sql, params },
            count,
            filtered: predicate.is_some(),
        })
    }

    fn predicate(&self, spec: &QuerySpec) -> (Option<String>, Vec<BoundValue>) {
        let mut groups = Vec::new();
        let mut params = Vec::new();

        if let Some(term) = spec.search_value.as_deref().filter(|t| !t.is_empty()) {
            if !self.columns.is_empty() {
                let pattern = like_pattern(term);
                let clauses: Vec<String> = self
                    .columns
                    .iter()
                    .map(|column| {
                        params.push(BoundValue::Text(pattern.clone()));
                        like_clause(column)
                    })
                    .collect();
                groups.push(format!("({})", clauses.join(" OR ")));
            }
        }

        let filters: Vec<String> = spec
            .column_filters
            .iter()
            .filter(|(column, value)| !value.is_empty() && self.known.contains(column.as_str()))
            .map(|(column, value)| {
                params.push(BoundValue::Text(like_pattern(value)));
                like_clause(column)
            })
            .collect();
        if !filters.is_empty() {
            groups.push(format!("({})", filters.join(" AND ")));
        }

        if groups.is_empty() {
            (None, params)
        } else {
            (Some(groups.join(" AND ")), params)
        }
    }

    fn order_by(&self, spec: &QuerySpec) -> Option<String> {
        let resolved = spec
            .sort_column
            .as_deref()
            .filter(|c| self.known.contains(c));

        match resolved {
            Some(column) => Some(format!("{} {}", quote_ident(column), spec.sort_order.as_sql())),
            None => self
                .columns
                .first()
                .map(|first| format!("{} ASC", quote_ident(first))),
        }
    }
}

fn like_clause(column: &str) -> String {
    format!("{} LIKE ? ESCAPE '{}'", quote_ident(column), LIKE_ESCAPE)
}

/// Wraps `term` in `%...%`, escaping LIKE metacharacters so it matches as a
/// literal substring.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for ch in term.chars() {
        if ch == LIKE_ESCAPE || ch == '%' || ch == '_' {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn bound_to_i64(name: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| TabularError::InvalidQuerySpec(format!("{} {} is out of range", name, value)))
}
