use thiserror::Error;

/// Error taxonomy for the monitor core.
///
/// Periodic tasks never terminate on `TransientIo` or `Invariant`; the
/// HTTP layer maps each kind to a status code and hides internal detail
/// behind a correlation id.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Malformed caller input. No state was mutated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity lookup by id came back empty.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Store busy, sampler timeout, or similar retryable condition.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// A detected invariant violation; the current unit of work aborts
    /// but the owning task keeps running.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Unrecoverable startup failure (store open, migration, data dir).
    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl MonitorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Stable category label used in API error bodies and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::TransientIo(_) => "transient",
            Self::Invariant(_) => "invariant",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Whether a caller may usefully retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(MonitorError::validation("x").category(), "validation");
        assert_eq!(MonitorError::not_found("app", 3).category(), "not_found");
        assert_eq!(
            MonitorError::TransientIo("busy".into()).category(),
            "transient"
        );
        assert_eq!(
            MonitorError::Invariant("count mismatch".into()).category(),
            "invariant"
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(MonitorError::TransientIo("busy".into()).retryable());
        assert!(!MonitorError::validation("x").retryable());
        assert!(!MonitorError::not_found("domain", 1).retryable());
    }

    #[test]
    fn test_not_found_display() {
        let err = MonitorError::not_found("application", 42);
        assert_eq!(err.to_string(), "application 42 not found");
    }
}
