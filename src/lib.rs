//! Safety pipeline for LLM-proposed SQL.
//!
//! An untrusted `{sql, params, explanation}` proposal is qualified against a
//! live schema snapshot, cleaned of spurious qualifiers, normalized for enum
//! synonyms, gated to a single read-only `SELECT`, converted to named
//! parameters and finally EXPLAINed and executed under statement timeouts
//! and a row cap.

pub mod catalog;
pub mod config;
pub mod query;
pub mod security;
pub mod session;
pub mod translator;

use thiserror::Error;

pub use catalog::{CatalogState, SchemaCatalog, SchemaSnapshot, SynonymTable};
pub use config::Config;
pub use query::{ExecutionGuard, NormalizedQuery, ProposedQuery, QueryPipeline};

/// Errors surfaced by every stage of the pipeline.
///
/// Variants carrying SQL hold the transformed statement so callers can show
/// why a query was rejected.
#[derive(Error, Debug)]
pub enum Nl2SqlError {
    #[error("Malformed proposal: {reason}")]
    MalformedProposal { reason: String, raw: String },

    #[error("Unsafe query rejected ({reason}): {sql}")]
    UnsafeQuery { sql: String, reason: String },

    #[error("Ambiguous table '{table}': present in schemas {}", schemas.join(", "))]
    AmbiguousTable { table: String, schemas: Vec<String> },

    #[error("Schema catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("SQL invalid: {message} (sql: {sql})")]
    SqlInvalid { sql: String, message: String },

    #[error("Database error: {message}")]
    DatabaseError { sql: Option<String>, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Nl2SqlError {
    /// Stable tag for the error class, suitable for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Nl2SqlError::MalformedProposal { .. } => "malformed_proposal",
            Nl2SqlError::UnsafeQuery { .. } => "unsafe_query",
            Nl2SqlError::AmbiguousTable { .. } => "ambiguous_table",
            Nl2SqlError::CatalogUnavailable(_) => "catalog_unavailable",
            Nl2SqlError::SqlInvalid { .. } => "sql_invalid",
            Nl2SqlError::DatabaseError { .. } => "database_error",
            Nl2SqlError::Config(_) => "config",
            Nl2SqlError::Io(_) => "io",
        }
    }

    /// The SQL text attached to this error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Nl2SqlError::UnsafeQuery { sql, .. } | Nl2SqlError::SqlInvalid { sql, .. } => Some(sql),
            Nl2SqlError::DatabaseError { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Nl2SqlError::MalformedProposal {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Wrap a driver error raised outside of a specific statement.
    pub(crate) fn database(err: tokio_postgres::Error, sql: Option<&str>) -> Self {
        Nl2SqlError::DatabaseError {
            sql: sql.map(str::to_string),
            message: server_message(&err),
        }
    }
}

/// The server's own message when the error came from Postgres, otherwise the
/// driver's description.
pub(crate) fn server_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Nl2SqlError>;
