use std::path::PathBuf;
use std::time::Duration;
use clap::Args;
use tracing::warn;
use crate::catalog::SynonymTable;
use crate::Nl2SqlError;

/// Settings shared by every command; each flag has an environment fallback.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string (falls back to DATABASE_URL)
    #[arg(long, env = "NL2SQL_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Schema used for tie-breaking and for tables missing from the snapshot
    #[arg(long, default_value = "employee", env = "NL2SQL_DEFAULT_SCHEMA")]
    pub default_schema: String,

    /// Comma-separated whitelist of schemas to introspect
    #[arg(long, default_value = "employee", value_delimiter = ',', env = "NL2SQL_SCHEMAS")]
    pub schemas: Vec<String>,

    /// Rows appended as LIMIT when a query has none; also the read cap
    #[arg(long, default_value = "100", env = "NL2SQL_ROW_LIMIT")]
    pub row_limit: usize,

    /// statement_timeout for query execution, in milliseconds
    #[arg(long, default_value = "8000", env = "NL2SQL_STATEMENT_TIMEOUT_MS")]
    pub statement_timeout_ms: u64,

    /// statement_timeout for EXPLAIN, in milliseconds
    #[arg(long, default_value = "5000", env = "NL2SQL_EXPLAIN_TIMEOUT_MS")]
    pub explain_timeout_ms: u64,

    /// statement_timeout for catalog introspection, in milliseconds
    #[arg(long, default_value = "10000", env = "NL2SQL_CATALOG_TIMEOUT_MS")]
    pub catalog_timeout_ms: u64,

    /// Maximum number of columns loaded into the schema snapshot
    #[arg(long, default_value = "4000", env = "NL2SQL_MAX_COLUMNS")]
    pub max_columns: usize,

    /// Seconds a schema snapshot stays fresh
    #[arg(long, default_value = "300", env = "NL2SQL_SCHEMA_TTL_SECS")]
    pub schema_ttl_secs: u64,

    /// Maximum number of pooled database connections
    #[arg(long, default_value = "5", env = "NL2SQL_POOL_SIZE")]
    pub pool_size: usize,

    /// TOML/JSON/YAML file with a [synonyms] table extending the built-in one
    #[arg(long, env = "NL2SQL_SYNONYMS")]
    pub synonyms: Option<PathBuf>,

    /// Character budget for the schema JSON in the prompt context
    #[arg(long, default_value = "60000", env = "NL2SQL_PROMPT_MAX_CHARS")]
    pub prompt_max_chars: usize,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info", env = "NL2SQL_LOG_LEVEL")]
    pub log_level: String,
}

impl Config {
    /// Connection string from `--database-url`/`NL2SQL_DATABASE_URL`, then
    /// `DATABASE_URL`.
    pub fn database_url(&self) -> Result<String, Nl2SqlError> {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                Nl2SqlError::Config("no database URL: set NL2SQL_DATABASE_URL or DATABASE_URL".to_string())
            })
    }

    pub fn schema_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_ttl_secs)
    }

    pub fn load_synonyms(&self) -> Result<SynonymTable, Nl2SqlError> {
        SynonymTable::load(self.synonyms.as_deref())
    }

    pub fn validate(&self) -> Result<(), Nl2SqlError> {
        if self.schemas.iter().all(|s| s.trim().is_empty()) {
            return Err(Nl2SqlError::Config("schema whitelist is empty".to_string()));
        }
        if self.row_limit == 0 {
            return Err(Nl2SqlError::Config("row limit must be positive".to_string()));
        }
        if self.statement_timeout_ms == 0 || self.explain_timeout_ms == 0 || self.catalog_timeout_ms == 0 {
            return Err(Nl2SqlError::Config("statement timeouts must be positive".to_string()));
        }
        if self.pool_size == 0 {
            return Err(Nl2SqlError::Config("pool size must be positive".to_string()));
        }
        if !self.schema_whitelist().contains(&self.default_schema) {
            warn!(
                "Default schema '{}' is not in the whitelist {:?}; it is only used for unknown tables",
                self.default_schema, self.schemas
            );
        }
        Ok(())
    }

    /// Whitelisted schema names, trimmed and without blanks.
    pub fn schema_whitelist(&self) -> Vec<String> {
        self.schemas
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
