// Proposal parsing, parameter normalization, guarded execution and the
// end-to-end pipeline
pub mod executor;
pub mod params;
pub mod pipeline;
pub mod proposal;

pub use executor::{with_row_cap, ExecutionGuard, QueryResult, SqlExecutor};
pub use params::{JsonParam, NormalizedQuery, ParamStyleNormalizer};
pub use pipeline::{PipelineOutcome, PreparedQuery, QueryPipeline};
pub use proposal::{ProposalParams, ProposedQuery, MAX_SQL_LENGTH};
