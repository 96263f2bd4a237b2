//! Runs the whole pipeline against a live PostgreSQL.
//!
//! Skipped unless NL2SQL_TEST_DATABASE_URL points at a database the test
//! user may create schemas in.

use std::sync::Arc;
use std::time::Duration;
use std::collections::BTreeMap;
use nl2sql_guard::catalog::{PgSchemaLoader, SchemaCatalog, SchemaLoader, SynonymTable};
use nl2sql_guard::query::{ExecutionGuard, NormalizedQuery, QueryPipeline, SqlExecutor};
use nl2sql_guard::session::PgPool;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

fn database_url() -> Option<String> {
    let _ = env_logger::builder().is_test(true).try_init();
    match std::env::var("NL2SQL_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("NL2SQL_TEST_DATABASE_URL not set, skipping");
            None
        }
    }
}

struct TestSchema {
    pool: Arc<PgPool>,
    name: String,
}

impl TestSchema {
    async fn create(url: &str) -> Self {
        let pool = Arc::new(PgPool::new_with_size(url, 2));
        let name = format!("nl2sql_test_{}", Uuid::new_v4().simple());

        let conn = pool.acquire().await.expect("connect to test database");
        conn.batch_execute(&format!(
            "CREATE SCHEMA {schema};
             CREATE TYPE {schema}.employment_status AS ENUM ('intern', 'probation', 'permanent', 'contract');
             CREATE TABLE {schema}.departments (dept_id integer PRIMARY KEY, dept_name text NOT NULL);
             CREATE TABLE {schema}.employees (
                 emp_id integer PRIMARY KEY,
                 first_name text NOT NULL,
                 dept_id integer REFERENCES {schema}.departments(dept_id),
                 hire_date date NOT NULL,
                 salary numeric(12, 2),
                 status {schema}.employment_status NOT NULL
             );
             INSERT INTO {schema}.departments VALUES (1, 'Engineering'), (2, 'Finance');
             INSERT INTO {schema}.employees VALUES
                 (1, 'Sari', 1, '2024-02-01', 9500000.00, 'intern'),
                 (2, 'Budi', 1, '2021-06-15', 15000000.00, 'permanent'),
                 (3, 'Dewi', 2, '2024-03-10', NULL, 'intern'),
                 (4, 'Agus', 2, '2019-01-07', 21000000.00, 'contract');",
            schema = name
        ))
        .await
        .expect("create test schema");
        conn.release();

        Self { pool, name }
    }

    fn loader(&self, catalog_timeout_ms: u64) -> PgSchemaLoader {
        PgSchemaLoader::new(self.pool.clone(), vec![self.name.clone()], 4000, catalog_timeout_ms)
    }

    async fn statement_timeout(&self) -> String {
        let conn = self.pool.acquire().await.expect("connect to test database");
        let value: String = conn.query_one("SHOW statement_timeout", &[]).await.expect("show").get(0);
        conn.release();
        value
    }

    fn pipeline(&self, row_limit: usize) -> QueryPipeline {
        let loader = Arc::new(self.loader(10_000));
        let catalog = Arc::new(SchemaCatalog::new(loader, Duration::from_secs(60)));
        let guard = ExecutionGuard::new(self.pool.clone(), 5000, 8000, row_limit);
        QueryPipeline::new(catalog, Arc::new(SynonymTable::builtin()), Arc::new(guard), self.name.clone())
    }

    async fn drop_schema(self) {
        let conn = self.pool.acquire().await.expect("connect to test database");
        conn.batch_execute(&format!("DROP SCHEMA {} CASCADE", self.name))
            .await
            .expect("drop test schema");
        conn.release();
        assert_eq!(self.pool.idle_connections(), 1);
        self.pool.close_idle();
        assert_eq!(self.pool.idle_connections(), 0);
    }
}

#[tokio::test]
async fn test_pipeline_against_postgres() {
    let Some(url) = database_url() else {
        return;
    };
    let schema = TestSchema::create(&url).await;
    let pipeline = schema.pipeline(100);

    // Snapshot picked up the enum labels
    let state = pipeline.catalog().get().await.unwrap();
    let key = format!("{}.employees", schema.name);
    assert_eq!(
        state.enums.get(&key, "status").map(|labels| labels.to_vec()),
        Some(vec![
            "intern".to_string(),
            "probation".to_string(),
            "permanent".to_string(),
            "contract".to_string(),
        ])
    );

    let outcome = pipeline
        .execute(
            r#"{"sql": "SELECT e.first_name, e.status, e.hire_date FROM employees e WHERE e.status = 'magang' AND e.dept_id = $1 ORDER BY e.emp_id", "params": [1]}"#,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.prepared.final_sql,
        format!(
            "SELECT first_name, status, hire_date FROM {}.employees e WHERE status = 'intern' AND dept_id = :p1 ORDER BY emp_id LIMIT 100",
            schema.name
        )
    );
    assert!(!outcome.plan.is_empty());

    let result = outcome.result.unwrap();
    assert_eq!(result.columns, vec!["first_name", "status", "hire_date"]);
    assert_eq!(result.rows, vec![vec![json!("Sari"), json!("intern"), json!("2024-02-01")]]);
    assert!(!result.truncated);

    schema.drop_schema().await;
}

#[tokio::test]
async fn test_row_cap_and_invalid_sql_against_postgres() {
    let Some(url) = database_url() else {
        return;
    };
    let schema = TestSchema::create(&url).await;
    let pipeline = schema.pipeline(2);

    let outcome = pipeline
        .execute(r#"{"sql": "SELECT first_name, salary FROM employees ORDER BY emp_id LIMIT 10"}"#)
        .await
        .unwrap();
    let result = outcome.result.unwrap();
    assert_eq!(result.rows.len(), 2);
    assert!(result.truncated);
    assert_eq!(result.rows[0], vec![json!("Sari"), json!("9500000.00")]);

    let err = pipeline
        .execute(r#"{"sql": "SELECT missing_column FROM employees"}"#)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sql_invalid");
    assert!(err.to_string().contains("missing_column"));
    // Rejected EXPLAIN leaves the session usable
    assert_eq!(schema.pool.idle_connections(), 1);

    let err = pipeline
        .check(r#"{"sql": "SELECT * FROM employees WHERE hire_date > :since", "params": {"since": "2023-01-01"}}"#)
        .await;
    assert!(err.is_ok(), "{:?}", err.err());

    schema.drop_schema().await;
}

#[tokio::test]
async fn test_catalog_queries_run_under_timeout() {
    let Some(url) = database_url() else {
        return;
    };
    let schema = TestSchema::create(&url).await;
    let loader = schema.loader(7000);

    let snapshot = loader.load().await.unwrap();
    assert_eq!(snapshot.tables.len(), 2);
    assert_eq!(schema.pool.idle_connections(), 1);
    assert_eq!(schema.statement_timeout().await, "7s");

    let diagnostics = schema.loader(1500).diagnostics(&schema.name).await.unwrap();
    assert_eq!(diagnostics.default_schema_tables, 2);
    assert_eq!(schema.statement_timeout().await, "1500ms");

    schema.drop_schema().await;
}

#[tokio::test]
async fn test_timed_out_statement_keeps_connection() {
    let Some(url) = database_url() else {
        return;
    };
    let schema = TestSchema::create(&url).await;
    let guard = ExecutionGuard::new(schema.pool.clone(), 5000, 100, 10);

    let err = guard
        .run(&NormalizedQuery {
            sql: "SELECT pg_sleep(2)".to_string(),
            params: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "database_error");
    assert!(err.to_string().contains("statement timeout"), "{}", err);
    assert_eq!(schema.pool.idle_connections(), 1);

    let result = guard
        .run(&NormalizedQuery {
            sql: format!("SELECT dept_name FROM {}.departments ORDER BY dept_id", schema.name),
            params: BTreeMap::new(),
        })
        .await
        .unwrap();
    assert_eq!(result.rows, vec![vec![json!("Engineering")], vec![json!("Finance")]]);

    schema.drop_schema().await;
}
