use std::sync::Arc;
use std::time::Instant;
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;
use crate::catalog::{CatalogState, SchemaCatalog, SynonymTable};
use crate::query::executor::{with_row_cap, QueryResult, SqlExecutor};
use crate::query::params::{NormalizedQuery, ParamStyleNormalizer};
use crate::query::proposal::ProposedQuery;
use crate::security::{events, SafetyValidator};
use crate::translator::{EnumSynonymNormalizer, QualifierStripper, TableQualifier};
use crate::Nl2SqlError;

/// A proposal after rewriting, validation and parameter normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedQuery {
    /// SQL after qualification, stripping and synonym normalization; this is
    /// the text the safety gate accepted
    pub qualified_sql: String,
    /// Executed SQL: `:pX` placeholders and the row cap applied
    pub final_sql: String,
    pub normalized: NormalizedQuery,
    pub explanation: String,
}

/// Everything a caller gets back from one request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub request_id: String,
    pub prepared: PreparedQuery,
    pub plan: Vec<String>,
    /// `None` when the query was only checked
    pub result: Option<QueryResult>,
}

/// Takes raw model output to an executed, bounded, read-only query.
///
/// Stages run in a fixed order: table qualification, qualifier stripping,
/// enum synonym normalization, the safety gate, parameter normalization,
/// then EXPLAIN and execution. Any failure stops the request.
pub struct QueryPipeline {
    catalog: Arc<SchemaCatalog>,
    synonyms: Arc<SynonymTable>,
    executor: Arc<dyn SqlExecutor>,
    validator: SafetyValidator,
    default_schema: String,
}

impl QueryPipeline {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        synonyms: Arc<SynonymTable>,
        executor: Arc<dyn SqlExecutor>,
        default_schema: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            synonyms,
            executor,
            validator: SafetyValidator::new(),
            default_schema: default_schema.into(),
        }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    /// Rewrite and validate `proposal` against the current catalog.
    pub async fn prepare(&self, proposal: &ProposedQuery) -> Result<PreparedQuery, Nl2SqlError> {
        let state = self.catalog.get().await?;
        self.prepare_with_state(&state, proposal, None)
    }

    /// Rewrite and validate `proposal` against a given catalog state.
    pub fn prepare_with_state(
        &self,
        state: &CatalogState,
        proposal: &ProposedQuery,
        request_id: Option<&str>,
    ) -> Result<PreparedQuery, Nl2SqlError> {
        let qualifier = TableQualifier::new(&state.tables, &self.default_schema);
        let qualified = match qualifier.translate_query(&proposal.sql) {
            Ok(sql) => sql,
            Err(e) => {
                if let Nl2SqlError::AmbiguousTable { table, schemas } = &e {
                    events::ambiguous_table(request_id, table, schemas);
                }
                return Err(e);
            }
        };

        let stripped = QualifierStripper::translate_query(&qualified);
        let rewritten = EnumSynonymNormalizer::new(&state.enums, &self.synonyms).translate_query(&stripped);
        debug!("Rewritten SQL: {}", rewritten);

        self.validator.validate(&rewritten, request_id)?;

        let mut normalized = ParamStyleNormalizer::normalize(&rewritten, &proposal.params).inspect_err(|e| {
            if let Nl2SqlError::MalformedProposal { reason, raw } = e {
                events::malformed_proposal(request_id, reason, raw);
            }
        })?;
        normalized.sql = with_row_cap(&normalized.sql, self.executor.row_limit());

        Ok(PreparedQuery {
            qualified_sql: rewritten,
            final_sql: normalized.sql.clone(),
            normalized,
            explanation: proposal.explanation.clone(),
        })
    }

    /// Parse, prepare, EXPLAIN and execute raw model output.
    pub async fn execute(&self, raw: &str) -> Result<PipelineOutcome, Nl2SqlError> {
        self.process(raw, true).await
    }

    /// Parse, prepare and EXPLAIN raw model output without executing it.
    pub async fn check(&self, raw: &str) -> Result<PipelineOutcome, Nl2SqlError> {
        self.process(raw, false).await
    }

    async fn process(&self, raw: &str, execute: bool) -> Result<PipelineOutcome, Nl2SqlError> {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("nl2sql_request", request_id = %request_id);
        self.process_request(raw, execute, &request_id).instrument(span).await
    }

    async fn process_request(&self, raw: &str, execute: bool, request_id: &str) -> Result<PipelineOutcome, Nl2SqlError> {
        let rid = Some(request_id);

        let proposal = ProposedQuery::from_llm_output(raw).inspect_err(|e| {
            if let Nl2SqlError::MalformedProposal { reason, raw } = e {
                events::malformed_proposal(rid, reason, raw);
            }
        })?;

        let state = self.catalog.get().await?;
        let prepared = self.prepare_with_state(&state, &proposal, rid)?;
        info!("Prepared SQL: {}", prepared.final_sql);

        let plan = self.executor.explain(&prepared.normalized).await.inspect_err(|e| {
            if let Nl2SqlError::SqlInvalid { sql, message } = e {
                events::explain_failed(rid, sql, message);
            }
        })?;

        if !execute {
            return Ok(PipelineOutcome {
                request_id: request_id.to_string(),
                prepared,
                plan,
                result: None,
            });
        }

        let started = Instant::now();
        let result = match self.executor.run(&prepared.normalized).await {
            Ok(result) => result,
            Err(e) => {
                events::query_failed(rid, &prepared.final_sql, &e.to_string());
                return Err(e);
            }
        };
        events::query_executed(
            rid,
            &prepared.final_sql,
            result.rows.len(),
            result.truncated,
            started.elapsed().as_millis() as u64,
        );

        Ok(PipelineOutcome {
            request_id: request_id.to_string(),
            prepared,
            plan,
            result: Some(result),
        })
    }
}
