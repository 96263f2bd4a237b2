use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Maximum number of bytes of SQL kept in an audit record
const MAX_QUERY_LOG_LENGTH: usize = 1000;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditSeverity {
    /// Normal pipeline activity (executed queries)
    Info,
    /// Recoverable problems (malformed proposals, EXPLAIN failures, stale catalog)
    Warning,
    /// Rejected attempts to run non-read-only SQL
    High,
}

impl fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditSeverity::Info => write!(f, "INFO"),
            AuditSeverity::Warning => write!(f, "WARNING"),
            AuditSeverity::High => write!(f, "HIGH"),
        }
    }
}

/// Types of audit events emitted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    MalformedProposal,
    UnsafeQuery,
    AmbiguousTable,
    ExplainFailed,
    QueryExecuted,
    QueryFailed,
    CatalogUnavailable,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventType::MalformedProposal => write!(f, "MALFORMED_PROPOSAL"),
            AuditEventType::UnsafeQuery => write!(f, "UNSAFE_QUERY"),
            AuditEventType::AmbiguousTable => write!(f, "AMBIGUOUS_TABLE"),
            AuditEventType::ExplainFailed => write!(f, "EXPLAIN_FAILED"),
            AuditEventType::QueryExecuted => write!(f, "QUERY_EXECUTED"),
            AuditEventType::QueryFailed => write!(f, "QUERY_FAILED"),
            AuditEventType::CatalogUnavailable => write!(f, "CATALOG_UNAVAILABLE"),
        }
    }
}

/// Structured audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unix timestamp in microseconds
    pub timestamp: u64,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    /// Pipeline request the event belongs to
    pub request_id: Option<String>,
    /// SQL at the stage that produced the event (truncated)
    pub query: Option<String>,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity, message: String) -> Self {
        Self {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64,
            event_type,
            severity,
            request_id: None,
            query: None,
            message,
            metadata: HashMap::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        self.request_id = request_id.map(str::to_string);
        self
    }

    /// Attach SQL, truncated on a character boundary
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(if query.len() > MAX_QUERY_LOG_LENGTH {
            let mut end = MAX_QUERY_LOG_LENGTH;
            while !query.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... [TRUNCATED]", &query[..end])
        } else {
            query.to_string()
        });
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// ISO 8601 rendering of the timestamp
    pub fn formatted_timestamp(&self) -> String {
        let secs = self.timestamp / 1_000_000;
        let micros = self.timestamp % 1_000_000;

        match chrono::DateTime::from_timestamp(secs as i64, (micros * 1000) as u32) {
            Some(datetime) => datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            None => format!("invalid-timestamp-{}", self.timestamp),
        }
    }
}

/// Configuration for audit logging
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Emit one JSON object per event instead of a key=value line
    pub json_format: bool,
    /// Include SQL text in records
    pub log_queries: bool,
    pub min_severity: AuditSeverity,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            json_format: true,
            log_queries: true,
            min_severity: AuditSeverity::Info,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
}

impl AuditConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = env_flag("NL2SQL_AUDIT_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(json) = env_flag("NL2SQL_AUDIT_JSON_FORMAT") {
            config.json_format = json;
        }
        if let Some(log_queries) = env_flag("NL2SQL_AUDIT_LOG_QUERIES") {
            config.log_queries = log_queries;
        }
        if let Ok(val) = std::env::var("NL2SQL_AUDIT_MIN_SEVERITY") {
            config.min_severity = match val.to_uppercase().as_str() {
                "WARNING" => AuditSeverity::Warning,
                "HIGH" => AuditSeverity::High,
                _ => AuditSeverity::Info,
            };
        }

        config
    }
}

/// Audit logging statistics
#[derive(Debug, Default, Clone)]
pub struct AuditStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub serialization_errors: u64,
}

/// Writes audit records to the `nl2sql_audit` tracing target
pub struct AuditLogger {
    config: AuditConfig,
    stats: RwLock<AuditStats>,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::with_config(AuditConfig::default())
    }

    pub fn with_config(config: AuditConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(AuditStats::default()),
        }
    }

    pub fn log_event(&self, mut event: AuditEvent) {
        if !self.config.enabled || event.severity < self.config.min_severity {
            return;
        }
        if !self.config.log_queries {
            event.query = None;
        }

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type.to_string()).or_insert(0) += 1;
        }

        if self.config.json_format {
            self.write_json_event(&event);
        } else {
            self.write_text_event(&event);
        }
    }

    fn write_json_event(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "nl2sql_audit", "{}", json),
            Err(e) => {
                self.stats.write().serialization_errors += 1;
                error!("Failed to serialize audit event: {}", e);
            }
        }
    }

    fn write_text_event(&self, event: &AuditEvent) {
        let request = event.request_id.as_deref().unwrap_or("none");
        let query = event
            .query
            .as_ref()
            .map(|q| format!(" query=\"{}\"", q))
            .unwrap_or_default();
        let mut metadata: Vec<String> = event.metadata.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        metadata.sort();
        let metadata = if metadata.is_empty() {
            String::new()
        } else {
            format!(" metadata=[{}]", metadata.join(" "))
        };

        let line = format!(
            "NL2SQL_AUDIT timestamp={} severity={} type={} request={}{}{} message=\"{}\"",
            event.formatted_timestamp(),
            event.severity,
            event.event_type,
            request,
            query,
            metadata,
            event.message
        );

        match event.severity {
            AuditSeverity::Info => info!(target: "nl2sql_audit", "{}", line),
            AuditSeverity::Warning | AuditSeverity::High => warn!(target: "nl2sql_audit", "{}", line),
        }
    }

    pub fn get_stats(&self) -> AuditStats {
        self.stats.read().clone()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_AUDIT_LOGGER: std::sync::OnceLock<AuditLogger> = std::sync::OnceLock::new();

/// Process-wide audit logger configured from `NL2SQL_AUDIT_*`
pub fn global_audit_logger() -> &'static AuditLogger {
    GLOBAL_AUDIT_LOGGER.get_or_init(|| AuditLogger::with_config(AuditConfig::from_env()))
}

pub fn log_audit_event(event: AuditEvent) {
    global_audit_logger().log_event(event);
}

/// Convenience functions for the events each pipeline stage emits
pub mod events {
    use super::*;

    pub fn malformed_proposal(request_id: Option<&str>, reason: &str, raw: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::MalformedProposal,
                AuditSeverity::Warning,
                format!("Malformed proposal: {}", reason),
            )
            .with_request_id(request_id)
            .with_query(raw),
        );
    }

    pub fn unsafe_query(request_id: Option<&str>, sql: &str, reason: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::UnsafeQuery,
                AuditSeverity::High,
                format!("Unsafe query rejected: {}", reason),
            )
            .with_request_id(request_id)
            .with_query(sql)
            .with_metadata("reason", reason),
        );
    }

    pub fn ambiguous_table(request_id: Option<&str>, table: &str, schemas: &[String]) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::AmbiguousTable,
                AuditSeverity::Warning,
                format!("Table '{}' exists in several schemas", table),
            )
            .with_request_id(request_id)
            .with_metadata("table", table)
            .with_metadata("schemas", schemas.join(",")),
        );
    }

    pub fn explain_failed(request_id: Option<&str>, sql: &str, message: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::ExplainFailed,
                AuditSeverity::Warning,
                format!("EXPLAIN failed: {}", message),
            )
            .with_request_id(request_id)
            .with_query(sql),
        );
    }

    pub fn query_executed(request_id: Option<&str>, sql: &str, rows: usize, truncated: bool, duration_ms: u64) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::QueryExecuted,
                AuditSeverity::Info,
                format!("Query returned {} rows in {}ms", rows, duration_ms),
            )
            .with_request_id(request_id)
            .with_query(sql)
            .with_metadata("rows", rows)
            .with_metadata("truncated", truncated)
            .with_metadata("duration_ms", duration_ms),
        );
    }

    pub fn query_failed(request_id: Option<&str>, sql: &str, message: &str) {
        log_audit_event(
            AuditEvent::new(
                AuditEventType::QueryFailed,
                AuditSeverity::Warning,
                format!("Query failed: {}", message),
            )
            .with_request_id(request_id)
            .with_query(sql),
        );
    }

    pub fn catalog_unavailable(message: &str) {
        log_audit_event(AuditEvent::new(
            AuditEventType::CatalogUnavailable,
            AuditSeverity::Warning,
            format!("Schema catalog refresh failed: {}", message),
        ));
    }
}
