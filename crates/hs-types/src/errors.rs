use thiserror::Error;

/// Main error type for the HyperSweep system
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Proposer error: {0}")]
    Proposer(#[from] ProposerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Experiment suspended at user's request")]
    Suspended,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Job-level errors.
///
/// Environment problems (missing script, wrong permissions) are
/// configuration mistakes and never retried; execution problems are
/// retried up to the job's budget.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Working folder {path} does not exist")]
    MissingWorkdir { path: String },

    #[error("Job script {script} does not exist")]
    MissingScript { script: String },

    #[error("Job script {script} is not executable, try `chmod u+x {script}`")]
    NotExecutable { script: String },

    #[error("Job {jid} execution failed: {message}")]
    Execution { jid: i64, message: String },

    #[error("Job {jid} produced no result marker")]
    MissingMarker { jid: i64 },
}

/// Resource-related errors
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource type not implemented: {rtype}")]
    UnknownType { rtype: String },

    #[error("No mapping entry for resource {rid}")]
    MissingMapping { rid: i64 },

    #[error("Invalid host spec {host}: username@host is the minimal requirement")]
    BadHostSpec { host: String },

    #[error("Resource manager is suspended, not accepting jobs")]
    Suspended,
}

/// Proposer-related errors
#[derive(Error, Debug)]
pub enum ProposerError {
    #[error("Proposer not implemented: {name}")]
    UnknownName { name: String },

    #[error("Trial {tid} is not known to the proposer")]
    UnknownTrial { tid: i64 },

    #[error("Operation not supported by this proposer: {operation}")]
    Unsupported { operation: String },

    #[error("Failed to persist proposer state: {message}")]
    Persistence { message: String },

    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },
}

/// Store/connector errors, fatal to the experiment when they escape.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connector is closed")]
    Closed,

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: i64 },
}

/// Result type alias for HyperSweep operations
pub type HsResult<T> = Result<T, HsError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}
