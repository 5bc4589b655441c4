use thiserror::Error;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro platform.
///
/// Validation, capacity, routing, conflict and not-found errors are raised
/// synchronously before any state change. Timeouts and worker failures are
/// normally captured into an execution result instead of being returned.
#[derive(Error, Debug)]
pub enum MaestroError {
    /// Malformed input, rejected before any state change.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configured ceiling has been reached.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// No agent satisfies a dispatch request.
    #[error("Routing error: {0}")]
    Routing(String),

    /// The operation would violate an invariant.
    #[error("Conflict error: {0}")]
    Conflict(String),

    /// Unknown identifier.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A run exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The wrapped worker's own failure, message preserved.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Stable lowercase tag for events, metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MaestroError::Validation(_) => "validation",
            MaestroError::Capacity(_) => "capacity",
            MaestroError::Routing(_) => "routing",
            MaestroError::Conflict(_) => "conflict",
            MaestroError::NotFound(_) => "not_found",
            MaestroError::Timeout(_) => "timeout",
            MaestroError::Worker(_) => "worker",
            MaestroError::Config(_) => "config",
            MaestroError::Json(_) => "json",
            MaestroError::Io(_) => "io",
        }
    }
}
