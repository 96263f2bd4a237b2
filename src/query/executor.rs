use std::error::Error;
use std::sync::Arc;
use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::Row;
use tracing::{debug, info};
use crate::query::params::{JsonParam, NormalizedQuery};
use crate::session::{PgPool, PooledClient};
use crate::translator::lexical::matches_outside_literals;
use crate::{server_message, Nl2SqlError};

static LIMIT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bLIMIT\b").unwrap()
});

/// Append `LIMIT <row_limit>` unless the statement already has a LIMIT
/// outside string literals.
pub fn with_row_cap(sql: &str, row_limit: usize) -> String {
    if matches_outside_literals(sql, &LIMIT_REGEX) {
        sql.to_string()
    } else {
        format!("{} LIMIT {}", sql.trim_end(), row_limit)
    }
}

/// Column names plus rows converted to JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows were left unread because the row cap was reached
    pub truncated: bool,
}

/// Database side of the pipeline: plan check and bounded execution.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// `EXPLAIN` the query; failure means the SQL is invalid.
    async fn explain(&self, query: &NormalizedQuery) -> Result<Vec<String>, Nl2SqlError>;

    /// Execute the query with the row cap applied.
    async fn run(&self, query: &NormalizedQuery) -> Result<QueryResult, Nl2SqlError>;

    fn row_limit(&self) -> usize;
}

/// Runs validated queries on pooled connections under per-statement
/// timeouts.
pub struct ExecutionGuard {
    pool: Arc<PgPool>,
    explain_timeout_ms: u64,
    statement_timeout_ms: u64,
    row_limit: usize,
}

impl ExecutionGuard {
    pub fn new(pool: Arc<PgPool>, explain_timeout_ms: u64, statement_timeout_ms: u64, row_limit: usize) -> Self {
        Self {
            pool,
            explain_timeout_ms,
            statement_timeout_ms,
            row_limit,
        }
    }

    /// Check out a connection with `statement_timeout` set for this use.
    async fn checkout(&self, timeout_ms: u64) -> Result<PooledClient, Nl2SqlError> {
        let conn = self.pool.acquire().await?;
        if let Err(e) = conn.set_statement_timeout(timeout_ms).await {
            conn.release_after_error(&e);
            return Err(Nl2SqlError::database(e, None));
        }
        Ok(conn)
    }

    /// Read at most `row_limit` rows; the flag reports unread rows left on
    /// the wire.
    async fn fetch(
        &self,
        conn: &PooledClient,
        sql: &str,
        values: &[JsonParam],
    ) -> Result<(Vec<String>, Vec<Vec<Value>>, bool), tokio_postgres::Error> {
        let statement = conn.prepare(sql).await?;
        let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();

        let stream = conn
            .query_raw(&statement, values.iter().map(|v| v as &dyn ToSql))
            .await?;
        pin_mut!(stream);

        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            if rows.len() >= self.row_limit {
                return Ok((columns, rows, true));
            }
            rows.push(row_values(&row)?);
        }
        Ok((columns, rows, false))
    }
}

#[async_trait]
impl SqlExecutor for ExecutionGuard {
    async fn explain(&self, query: &NormalizedQuery) -> Result<Vec<String>, Nl2SqlError> {
        let (sql, values) = query.bind_postgres()?;
        let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let invalid = |e: tokio_postgres::Error| Nl2SqlError::SqlInvalid {
            sql: query.sql.clone(),
            message: server_message(&e),
        };

        let conn = self.checkout(self.explain_timeout_ms).await?;
        let rows = match conn.query(format!("EXPLAIN {}", sql).as_str(), &params).await {
            Ok(rows) => {
                conn.release();
                rows
            }
            Err(e) => {
                conn.release_after_error(&e);
                return Err(invalid(e));
            }
        };

        let plan = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        debug!("EXPLAIN returned {} plan lines", plan.len());
        Ok(plan)
    }

    async fn run(&self, query: &NormalizedQuery) -> Result<QueryResult, Nl2SqlError> {
        let capped = NormalizedQuery {
            sql: with_row_cap(&query.sql, self.row_limit),
            params: query.params.clone(),
        };
        let (sql, values) = capped.bind_postgres()?;
        let failed = |e: tokio_postgres::Error| Nl2SqlError::database(e, Some(&capped.sql));

        let conn = self.checkout(self.statement_timeout_ms).await?;
        let (columns, rows, truncated) = match self.fetch(&conn, &sql, &values).await {
            Ok(fetched) => fetched,
            Err(e) => {
                conn.release_after_error(&e);
                return Err(failed(e));
            }
        };

        if truncated {
            // Unread rows are still in flight; the connection is not reused
            drop(conn);
        } else {
            conn.release();
        }

        info!("Query returned {} rows{}", rows.len(), if truncated { " (truncated)" } else { "" });
        Ok(QueryResult { columns, rows, truncated })
    }

    fn row_limit(&self) -> usize {
        self.row_limit
    }
}

/// Enum labels as text; the binary format of an enum is its label.
struct EnumLabel(String);

impl<'a> FromSql<'a> for EnumLabel {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(EnumLabel(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
    }
}

fn opt<T, F>(value: Option<T>, convert: F) -> Value
where
    F: FnOnce(T) -> Value,
{
    value.map(convert).unwrap_or(Value::Null)
}

/// Convert one result row to JSON values, column by column.
pub fn row_values(row: &Row) -> Result<Vec<Value>, tokio_postgres::Error> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = match *ty {
            Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)?, Value::Bool),
            Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx)?, Value::from),
            Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx)?, Value::from),
            Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx)?, Value::from),
            Type::OID => opt(row.try_get::<_, Option<u32>>(idx)?, Value::from),
            Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx)?, |v| Value::from(v as f64)),
            Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx)?, Value::from),
            Type::NUMERIC => opt(row.try_get::<_, Option<Decimal>>(idx)?, |v| Value::String(v.to_string())),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                opt(row.try_get::<_, Option<String>>(idx)?, Value::String)
            }
            Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx)?, |v| Value::String(v.to_string())),
            Type::TIME => opt(row.try_get::<_, Option<chrono::NaiveTime>>(idx)?, |v| Value::String(v.to_string())),
            Type::TIMESTAMP => opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?, |v| {
                Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }),
            Type::TIMESTAMPTZ => opt(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?, |v| {
                Value::String(v.to_rfc3339())
            }),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?.unwrap_or(Value::Null),
            Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx)?, |v| Value::String(v.to_string())),
            _ if matches!(ty.kind(), Kind::Enum(_)) => {
                opt(row.try_get::<_, Option<EnumLabel>>(idx)?, |v| Value::String(v.0))
            }
            _ => {
                debug!("No JSON conversion for column '{}' of type {}", column.name(), ty);
                Value::Null
            }
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_row_cap_appended() {
        assert_eq!(
            with_row_cap("SELECT first_name FROM employee.employees WHERE hire_date = CURRENT_DATE", 100),
            "SELECT first_name FROM employee.employees WHERE hire_date = CURRENT_DATE LIMIT 100"
        );
        assert_eq!(with_row_cap("SELECT 1  \n", 5), "SELECT 1 LIMIT 5");
    }

    #[test]
    fn test_existing_limit_kept() {
        let sql = "SELECT * FROM employee.employees ORDER BY hire_date DESC limit 10";
        assert_eq!(with_row_cap(sql, 100), sql);
        let sql = "SELECT * FROM employee.employees LIMIT :p1";
        assert_eq!(with_row_cap(sql, 100), sql);
    }

    #[test]
    fn test_limit_inside_literal_or_identifier_ignored() {
        assert_eq!(
            with_row_cap("SELECT * FROM t WHERE note = 'over limit'", 100),
            "SELECT * FROM t WHERE note = 'over limit' LIMIT 100"
        );
        assert_eq!(
            with_row_cap("SELECT credit_limit FROM t", 100),
            "SELECT credit_limit FROM t LIMIT 100"
        );
    }
}
