// Read-only gate and audit trail for proposed SQL
pub mod audit_logger;
pub mod safety_validator;

pub use audit_logger::{
    AuditConfig, AuditEvent, AuditEventType, AuditLogger, AuditSeverity, AuditStats,
    global_audit_logger, log_audit_event, events,
};

pub use safety_validator::SafetyValidator;
