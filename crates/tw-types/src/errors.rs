use thiserror::Error;
use uuid::Uuid;

/// Main error type for the Tripwire risk core
#[derive(Error, Debug)]
pub enum TwError {
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("System unsafe: {0}")]
    Unsafe(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised at the ingress boundary of the market & position store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Unknown instrument: {instrument_id}")]
    UnknownInstrument { instrument_id: String },

    #[error("Invalid fill: {reason}")]
    InvalidFill { reason: String },

    #[error("Invalid tick: {reason}")]
    InvalidTick { reason: String },

    #[error("Store is not accepting events")]
    NotAccepting,
}

/// Rule configuration and evaluation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Rule misconfigured: {rule_id}: {message}")]
    Misconfig { rule_id: String, message: String },

    #[error("Invalid metric path: {path}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("Duplicate rule id: {rule_id}")]
    DuplicateRuleId { rule_id: String },

    #[error("Rule not found: {rule_id}")]
    NotFound { rule_id: String },

    #[error("Rule set rejected: {}", errors.join("; "))]
    Rejected { errors: Vec<String> },
}

/// Alert lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert not found: {alert_id}")]
    NotFound { alert_id: Uuid },

    #[error("Invalid alert transition for {alert_id}: {from} -> {to}")]
    InvalidTransition {
        alert_id: Uuid,
        from: String,
        to: String,
    },
}

/// Isolation state machine errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IsolationError {
    #[error("Isolation action not found: {action_id}")]
    NotFound { action_id: Uuid },

    #[error("Invalid isolation transition for {action_id}: {message}")]
    InvalidTransition { action_id: Uuid, message: String },

    #[error("Principal not authorized: {principal}")]
    Unauthorized { principal: String },
}

/// Append-only journal errors. Any of these is fatal to the alert manager.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal IO failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Journal corrupt at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Journal replay inconsistent at record {seq}: {message}")]
    Inconsistent { seq: u64, message: String },
}

/// Notification transport errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Transport error on {sink}: {message}")]
    Transport { sink: String, message: String },
}

/// Order-router egress errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("Isolation request rejected: {reason}")]
    Rejected { reason: String },

    #[error("Unknown isolation action: {action_id}")]
    Unknown { action_id: Uuid },

    #[error("Router transport error: {message}")]
    Transport { message: String },
}

/// Start-up configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to read configuration {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },
}

impl TwError {
    /// Stable kind label used by the control plane's structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            TwError::Ingest(IngestError::UnknownInstrument { .. }) => "UnknownInstrument",
            TwError::Ingest(IngestError::InvalidFill { .. }) => "InvalidFill",
            TwError::Ingest(IngestError::InvalidTick { .. }) => "InvalidTick",
            TwError::Ingest(IngestError::NotAccepting) => "NotAccepting",
            TwError::Rule(RuleError::NotFound { .. }) => "RuleNotFound",
            TwError::Rule(_) => "RuleMisconfig",
            TwError::Alert(AlertError::NotFound { .. }) => "AlertNotFound",
            TwError::Alert(AlertError::InvalidTransition { .. }) => "InvalidTransition",
            TwError::Isolation(IsolationError::NotFound { .. }) => "IsolationNotFound",
            TwError::Isolation(IsolationError::InvalidTransition { .. }) => "InvalidTransition",
            TwError::Isolation(IsolationError::Unauthorized { .. }) => "Unauthorized",
            TwError::Journal(_) => "JournalFailure",
            TwError::Sink(_) => "TransportError",
            TwError::Router(_) => "RouterError",
            TwError::Config(_) => "ConfigError",
            TwError::Io(_) => "IoError",
            TwError::Serialization(_) => "SerializationError",
            TwError::Unsafe(_) => "SystemUnsafe",
            TwError::Unavailable(_) => "Unavailable",
            TwError::Internal(_) => "Internal",
        }
    }
}

/// Result type alias for Tripwire operations
pub type TwResult<T> = Result<T, TwError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TwError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigError::Invalid { message: format!($($arg)*) }
    };
}
