use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;
use crate::query::proposal::MAX_SQL_LENGTH;
use crate::security::events;
use crate::Nl2SqlError;

/// Words that must not appear anywhere in a statement, as whole words
const BANNED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "alter", "drop", "truncate", "create", "grant", "revoke",
    "comment", "vacuum", "analyze",
];

static SELECT_PREFIX_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^SELECT\s").unwrap()
});

static BANNED_KEYWORD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", BANNED_KEYWORDS.join("|"))).unwrap()
});

/// Read-only gate run on fully rewritten SQL, before anything reaches the
/// database.
///
/// The keyword checks apply to the whole text, literals included. When the
/// statement parses, its structure must also be a single plain query.
pub struct SafetyValidator {
    /// Longest statement accepted, in bytes
    max_length: usize,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyValidator {
    pub fn new() -> Self {
        Self { max_length: MAX_SQL_LENGTH }
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Check `sql`, auditing any rejection under `request_id`.
    pub fn validate(&self, sql: &str, request_id: Option<&str>) -> Result<(), Nl2SqlError> {
        match self.rejection_reason(sql) {
            None => Ok(()),
            Some(reason) => {
                events::unsafe_query(request_id, sql, &reason);
                Err(Nl2SqlError::UnsafeQuery {
                    sql: sql.to_string(),
                    reason,
                })
            }
        }
    }

    /// Why `sql` is rejected, or `None` when it is an acceptable read.
    pub fn rejection_reason(&self, sql: &str) -> Option<String> {
        let trimmed = sql.trim();

        if trimmed.len() > self.max_length {
            return Some(format!("statement too long: {} bytes (max: {})", trimmed.len(), self.max_length));
        }
        if !SELECT_PREFIX_REGEX.is_match(trimmed) {
            return Some("only SELECT statements are allowed".to_string());
        }
        if trimmed.contains(';') {
            return Some("semicolons are not allowed".to_string());
        }
        if let Some(m) = BANNED_KEYWORD_REGEX.find(trimmed) {
            return Some(format!("forbidden keyword '{}'", m.as_str().to_uppercase()));
        }

        Self::structural_rejection(trimmed)
    }

    fn structural_rejection(sql: &str) -> Option<String> {
        let dialect = PostgreSqlDialect {};
        let statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                // The database reports real syntax errors at EXPLAIN time
                debug!("Structural check skipped, SQL did not parse: {}", e);
                return None;
            }
        };

        match statements.as_slice() {
            [Statement::Query(query)] => Self::query_rejection(query),
            [_] => Some("statement is not a query".to_string()),
            _ => Some(format!("expected one statement, found {}", statements.len())),
        }
    }

    fn query_rejection(query: &Query) -> Option<String> {
        if !query.locks.is_empty() {
            return Some("row locking clauses are not allowed".to_string());
        }
        Self::set_expr_rejection(&query.body)
    }

    fn set_expr_rejection(body: &SetExpr) -> Option<String> {
        match body {
            SetExpr::Select(select) if select.into.is_some() => Some("SELECT INTO is not allowed".to_string()),
            SetExpr::Select(_) => None,
            SetExpr::Query(inner) => Self::query_rejection(inner),
            SetExpr::SetOperation { left, right, .. } => {
                Self::set_expr_rejection(left).or_else(|| Self::set_expr_rejection(right))
            }
            _ => Some("query body is not a SELECT".to_string()),
        }
    }
}
