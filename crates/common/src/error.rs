use thiserror::Error;

/// Canonical tidal error taxonomy used across crates.
///
/// Classification guidance:
/// - [`TidalError::Plan`]: malformed or unsupported plan shapes discovered while compiling
/// - [`TidalError::Execution`]: runtime operator evaluation, decode/encode, or data-shape failures
/// - [`TidalError::Constraint`]: user-visible constraint violations that abort the pipeline
/// - [`TidalError::TxnConflict`]: write-write conflicts surfaced unchanged from the txn layer
/// - [`TidalError::Rpc`]: inter-CN transport failures after the retry policy is exhausted
/// - [`TidalError::ResourceExhausted`]: pool/pipe capacity failures, surfaced with context
/// - [`TidalError::Cancelled`]: the statement context was cancelled mid-flight
/// - [`TidalError::Nyi`]: valid request for a plan shape this compiler does not build yet
/// - [`TidalError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum TidalError {
    /// Query plan is malformed or inconsistent.
    ///
    /// Examples:
    /// - a SINK node with no registered receiver
    /// - a non-equi right join that the planner should have rewritten
    /// - an empty rowset for a value scan
    #[error("plan error: {0}")]
    Plan(String),

    /// Runtime execution failures after compilation succeeded.
    ///
    /// Examples:
    /// - expression evaluation/type mismatch at runtime
    /// - batch decode failures on the remote receive path
    /// - a reader returning a batch with an unexpected schema
    #[error("execution error: {0}")]
    Execution(String),

    /// User-visible constraint violation; aborts the pipeline and is reported directly.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Write-write transaction conflict, surfaced unchanged.
    #[error("txn conflict: {0}")]
    TxnConflict(String),

    /// Inter-CN pipeline transport failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Memory pool or channel capacity exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The statement context was cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// Valid request for a feature/shape not implemented in the current version.
    #[error("not yet implemented: {0}")]
    Nyi(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidalError {
    /// Whether this error class is shown to the user verbatim
    /// (constraint and conflict errors carry their own message contract).
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Constraint(_) | Self::TxnConflict(_))
    }

    /// Whether the remote dispatcher may retry once before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Standard tidal result alias.
pub type Result<T> = std::result::Result<T, TidalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_errors_are_user_visible() {
        let err = TidalError::Constraint("column 'a' cannot be null".to_string());
        assert!(err.is_user_visible());
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "constraint violation: column 'a' cannot be null"
        );
    }

    #[test]
    fn rpc_errors_are_transient() {
        assert!(TidalError::Rpc("connection reset".to_string()).is_transient());
        assert!(!TidalError::Cancelled.is_transient());
    }
}
