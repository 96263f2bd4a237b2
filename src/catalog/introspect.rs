use std::sync::Arc;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use crate::catalog::snapshot::{CatalogRow, SchemaSnapshot};
use crate::session::{PgPool, PooledClient};
use crate::Nl2SqlError;

/// Columns of the whitelisted schemas, with enum labels aggregated in enum
/// sort order for user-defined enum types.
const SNAPSHOT_QUERY: &str = "
    SELECT
        c.table_schema::text,
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.udt_name::text,
        CASE
            WHEN c.data_type = 'USER-DEFINED' THEN
                (SELECT string_agg(e.enumlabel::text, ', ' ORDER BY e.enumsortorder)
                 FROM pg_type t
                 JOIN pg_namespace n ON n.oid = t.typnamespace
                 JOIN pg_enum e ON t.oid = e.enumtypid
                 WHERE t.typname = c.udt_name AND n.nspname = c.udt_schema)
            ELSE NULL
        END AS enum_values
    FROM information_schema.columns c
    WHERE c.table_schema::text = ANY($1)
    ORDER BY c.table_schema, c.table_name, c.ordinal_position
    LIMIT $2";

/// Source of schema snapshots.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    async fn load(&self) -> Result<SchemaSnapshot, Nl2SqlError>;
}

/// Introspects `information_schema` through the connection pool.
pub struct PgSchemaLoader {
    pool: Arc<PgPool>,
    schemas: Vec<String>,
    max_columns: i64,
    statement_timeout_ms: u64,
}

impl PgSchemaLoader {
    pub fn new(pool: Arc<PgPool>, schemas: Vec<String>, max_columns: usize, statement_timeout_ms: u64) -> Self {
        Self {
            pool,
            schemas,
            max_columns: i64::try_from(max_columns).unwrap_or(i64::MAX),
            statement_timeout_ms,
        }
    }

    pub fn statement_timeout_ms(&self) -> u64 {
        self.statement_timeout_ms
    }

    /// Check out a connection bounded by the catalog statement timeout.
    async fn checkout(&self) -> Result<PooledClient, Nl2SqlError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Nl2SqlError::CatalogUnavailable(e.to_string()))?;
        if let Err(e) = conn.set_statement_timeout(self.statement_timeout_ms).await {
            conn.release_after_error(&e);
            return Err(Nl2SqlError::CatalogUnavailable(crate::server_message(&e)));
        }
        Ok(conn)
    }

    /// Connection and catalog facts used to debug an empty or odd snapshot.
    pub async fn diagnostics(&self, default_schema: &str) -> Result<CatalogDiagnostics, Nl2SqlError> {
        let conn = self.checkout().await?;

        let database: String = conn
            .query_one("SELECT current_database()::text", &[])
            .await
            .map_err(|e| Nl2SqlError::database(e, None))?
            .get(0);

        let schemata: Vec<String> = conn
            .query("SELECT schema_name::text FROM information_schema.schemata ORDER BY 1", &[])
            .await
            .map_err(|e| Nl2SqlError::database(e, None))?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let default_schema_tables: i64 = conn
            .query_one(
                "SELECT count(*) FROM information_schema.tables WHERE table_schema::text = $1",
                &[&default_schema],
            )
            .await
            .map_err(|e| Nl2SqlError::database(e, None))?
            .get(0);

        conn.release();

        Ok(CatalogDiagnostics {
            database,
            schemata,
            default_schema: default_schema.to_string(),
            default_schema_tables,
            snapshot_tables: None,
        })
    }
}

#[async_trait]
impl SchemaLoader for PgSchemaLoader {
    async fn load(&self) -> Result<SchemaSnapshot, Nl2SqlError> {
        debug!(
            "Introspecting schemas {:?} (max {} columns, timeout {}ms)",
            self.schemas, self.max_columns, self.statement_timeout_ms
        );

        let conn = self.checkout().await?;
        let rows = match conn.query(SNAPSHOT_QUERY, &[&self.schemas, &self.max_columns]).await {
            Ok(rows) => {
                conn.release();
                rows
            }
            Err(e) => {
                conn.release_after_error(&e);
                return Err(Nl2SqlError::CatalogUnavailable(crate::server_message(&e)));
            }
        };

        let snapshot = SchemaSnapshot::from_rows(rows.iter().map(|row| CatalogRow {
            table_schema: row.get(0),
            table_name: row.get(1),
            column_name: row.get(2),
            data_type: row.get(3),
            udt_name: row.get(4),
            enum_values: row.get(5),
        }));

        info!(
            "Loaded schema snapshot: {} tables, {} columns",
            snapshot.tables.len(),
            snapshot.column_count()
        );
        Ok(snapshot)
    }
}

/// Serves a fixed snapshot; used for tests and offline rewriting.
pub struct StaticSchemaLoader {
    snapshot: SchemaSnapshot,
}

impl StaticSchemaLoader {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SchemaLoader for StaticSchemaLoader {
    async fn load(&self) -> Result<SchemaSnapshot, Nl2SqlError> {
        Ok(self.snapshot.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogDiagnostics {
    pub database: String,
    pub schemata: Vec<String>,
    pub default_schema: String,
    pub default_schema_tables: i64,
    /// Tables in the cached snapshot, when one is loaded
    pub snapshot_tables: Option<usize>,
}
