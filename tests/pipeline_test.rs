use std::sync::Arc;
use async_trait::async_trait;
use nl2sql_guard::catalog::{ColumnInfo, SchemaCatalog, SchemaSnapshot, SynonymTable, TableInfo};
use nl2sql_guard::query::{NormalizedQuery, QueryPipeline, QueryResult, SqlExecutor};
use nl2sql_guard::Nl2SqlError;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

/// Records every statement it is handed instead of talking to a database.
#[derive(Default)]
struct RecordingExecutor {
    explained: Mutex<Vec<NormalizedQuery>>,
    executed: Mutex<Vec<NormalizedQuery>>,
    reject_explain: bool,
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn explain(&self, query: &NormalizedQuery) -> Result<Vec<String>, Nl2SqlError> {
        self.explained.lock().push(query.clone());
        if self.reject_explain {
            return Err(Nl2SqlError::SqlInvalid {
                sql: query.sql.clone(),
                message: "relation \"employee.nonexistent\" does not exist".to_string(),
            });
        }
        Ok(vec!["Seq Scan on employees".to_string()])
    }

    async fn run(&self, query: &NormalizedQuery) -> Result<QueryResult, Nl2SqlError> {
        self.executed.lock().push(query.clone());
        Ok(QueryResult {
            columns: vec!["first_name".to_string()],
            rows: vec![vec![json!("Sari")], vec![json!("Budi")]],
            truncated: false,
        })
    }

    fn row_limit(&self) -> usize {
        100
    }
}

fn column(name: &str, data_type: &str) -> ColumnInfo {
    ColumnInfo {
        name: name.to_string(),
        data_type: data_type.to_string(),
        underlying_type_name: data_type.to_string(),
        enum_values: None,
    }
}

fn table(schema: &str, name: &str, columns: Vec<ColumnInfo>) -> TableInfo {
    TableInfo {
        schema: schema.to_string(),
        name: name.to_string(),
        columns,
    }
}

fn hr_snapshot() -> SchemaSnapshot {
    SchemaSnapshot::new(vec![
        table(
            "employee",
            "employees",
            vec![
                column("emp_id", "integer"),
                column("first_name", "text"),
                column("dept_id", "integer"),
                column("hire_date", "date"),
                ColumnInfo {
                    name: "status".to_string(),
                    data_type: "USER-DEFINED".to_string(),
                    underlying_type_name: "employment_status".to_string(),
                    enum_values: Some(vec![
                        "intern".to_string(),
                        "probation".to_string(),
                        "permanent".to_string(),
                        "contract".to_string(),
                    ]),
                },
            ],
        ),
        table("employee", "departments", vec![column("dept_id", "integer"), column("dept_name", "text")]),
        table("hr", "assets", vec![column("asset_id", "integer")]),
        table("finance", "assets", vec![column("asset_id", "integer")]),
    ])
}

fn pipeline_with(executor: Arc<RecordingExecutor>) -> QueryPipeline {
    QueryPipeline::new(
        Arc::new(SchemaCatalog::from_snapshot(hr_snapshot())),
        Arc::new(SynonymTable::builtin()),
        executor,
        "employee",
    )
}

#[tokio::test]
async fn test_simple_select_is_qualified_and_capped() {
    let _ = env_logger::builder().is_test(true).try_init();

    let executor = Arc::new(RecordingExecutor::default());
    let pipeline = pipeline_with(executor.clone());

    let outcome = pipeline
        .execute(r#"{"sql": "SELECT first_name FROM employees WHERE hire_date = CURRENT_DATE", "params": []}"#)
        .await
        .unwrap();

    assert_eq!(
        outcome.prepared.final_sql,
        "SELECT first_name FROM employee.employees WHERE hire_date = CURRENT_DATE LIMIT 100"
    );
    assert!(outcome.prepared.normalized.params.is_empty());
    assert_eq!(outcome.plan, vec!["Seq Scan on employees".to_string()]);

    let result = outcome.result.unwrap();
    assert_eq!(result.columns, vec!["first_name".to_string()]);
    assert_eq!(result.rows.len(), 2);

    assert_eq!(executor.explained.lock().len(), 1);
    let executed = executor.executed.lock();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].sql, outcome.prepared.final_sql);
}

#[tokio::test]
async fn test_model_output_in_prose_with_synonym_and_named_params() {
    let executor = Arc::new(RecordingExecutor::default());
    let pipeline = pipeline_with(executor.clone());

    let raw = "Berikut query-nya:\n```json\n{\"sql\": \"SELECT e.first_name FROM employees e WHERE e.status = 'magang' AND e.dept_id = :dept\", \"params\": {\"dept\": 4}, \"explanation\": \"Karyawan magang di departemen 4\"}\n```";
    let outcome = pipeline.execute(raw).await.unwrap();

    assert_eq!(
        outcome.prepared.final_sql,
        "SELECT first_name FROM employee.employees e WHERE status = 'intern' AND dept_id = :pdept LIMIT 100"
    );
    assert_eq!(outcome.prepared.normalized.params.get("pdept"), Some(&json!(4)));
    assert_eq!(outcome.prepared.explanation, "Karyawan magang di departemen 4");
}

#[tokio::test]
async fn test_join_keeps_column_qualifiers() {
    let executor = Arc::new(RecordingExecutor::default());
    let pipeline = pipeline_with(executor);

    let outcome = pipeline
        .check(
            r#"{"sql": "SELECT e.first_name, d.dept_name FROM employees e JOIN departments d ON e.dept_id = d.dept_id WHERE e.hire_date > public.NOW() - INTERVAL '30 days' LIMIT 10"}"#,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.prepared.final_sql,
        "SELECT e.first_name, d.dept_name FROM employee.employees e JOIN employee.departments d ON e.dept_id = d.dept_id WHERE e.hire_date > NOW() - INTERVAL '30 days' LIMIT 10"
    );
    assert!(outcome.result.is_none());
}

#[tokio::test]
async fn test_unsafe_proposal_never_reaches_database() {
    let executor = Arc::new(RecordingExecutor::default());
    let pipeline = pipeline_with(executor.clone());

    for raw in [
        r#"{"sql": "DELETE FROM employees WHERE emp_id = 1"}"#,
        r#"{"sql": "SELECT 1; DROP TABLE employees"}"#,
        r#"{"sql": "SELECT * FROM employees FOR UPDATE"}"#,
        r#"{"sql": "SELECT * INTO backup FROM employees"}"#,
    ] {
        let err = pipeline.execute(raw).await.unwrap_err();
        assert_eq!(err.kind(), "unsafe_query", "{raw}");
        assert!(err.sql().is_some());
    }

    assert!(executor.explained.lock().is_empty());
    assert!(executor.executed.lock().is_empty());
}

#[tokio::test]
async fn test_malformed_output_is_reported() {
    let executor = Arc::new(RecordingExecutor::default());
    let pipeline = pipeline_with(executor.clone());

    let err = pipeline.execute("I could not produce a query for that.").await.unwrap_err();
    match err {
        Nl2SqlError::MalformedProposal { raw, .. } => assert_eq!(raw, "I could not produce a query for that."),
        other => panic!("expected MalformedProposal, got {:?}", other),
    }

    let err = pipeline
        .execute(r#"{"sql": "SELECT first_name FROM employees WHERE dept_id = $2", "params": [1]}"#)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "malformed_proposal");
    assert!(executor.explained.lock().is_empty());
}

#[tokio::test]
async fn test_ambiguous_table_is_an_error() {
    let pipeline = pipeline_with(Arc::new(RecordingExecutor::default()));

    let err = pipeline.execute(r#"{"sql": "SELECT asset_id FROM assets"}"#).await.unwrap_err();
    match err {
        Nl2SqlError::AmbiguousTable { table, schemas } => {
            assert_eq!(table, "assets");
            assert_eq!(schemas, vec!["finance".to_string(), "hr".to_string()]);
        }
        other => panic!("expected AmbiguousTable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_explain_failure_stops_execution() {
    let executor = Arc::new(RecordingExecutor {
        reject_explain: true,
        ..Default::default()
    });
    let pipeline = pipeline_with(executor.clone());

    let err = pipeline
        .execute(r#"{"sql": "SELECT * FROM nonexistent", "params": []}"#)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sql_invalid");
    assert_eq!(err.sql(), Some("SELECT * FROM employee.nonexistent LIMIT 100"));
    assert_eq!(executor.explained.lock().len(), 1);
    assert!(executor.executed.lock().is_empty());
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let pipeline = pipeline_with(Arc::new(RecordingExecutor::default()));
    let raw = r#"{"sql": "SELECT 1"}"#;

    let first = pipeline.check(raw).await.unwrap();
    let second = pipeline.check(raw).await.unwrap();
    assert_ne!(first.request_id, second.request_id);
}
