//! Engine error taxonomy.
//!
//! Every failure an operation can surface maps onto one response status:
//! bad caller input is a `WARNING`, everything else is an `ERROR`.

use hostprov_reconcile::RequestStatus;
use thiserror::Error;

use crate::provider::{ProviderError, ProviderErrorKind};
use crate::state::StoreError;
use crate::templates::TemplateError;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or unsatisfiable caller input. Nothing was persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The provider kept failing after retries.
    #[error("provider unavailable: {0}")]
    ProviderTransient(String),

    /// The provider rejected the call outright (auth, quota, bad template).
    #[error("provider error: {0}")]
    ProviderFatal(String),

    /// The store could not be read back and could not be quarantined.
    #[error("store corrupt: {0}")]
    PersistenceCorrupt(String),

    /// A machine exceeded its creation window.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl EngineError {
    /// Response status this error is reported with.
    pub fn response_status(&self) -> RequestStatus {
        match self {
            Self::InvalidInput(_) => RequestStatus::Warning,
            _ => RequestStatus::Error,
        }
    }

    /// Short machine-readable reason, used as a structured log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ProviderTransient(_) => "provider_transient",
            Self::ProviderFatal(_) => "provider_fatal",
            Self::PersistenceCorrupt(_) => "persistence_corrupt",
            Self::Timeout(_) => "timeout",
            Self::Store(_) => "store",
            Self::Template(_) => "template",
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::Transient => Self::ProviderTransient(err.message),
            ProviderErrorKind::Fatal | ProviderErrorKind::NotFound => {
                Self::ProviderFatal(err.message)
            }
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { .. } => Self::PersistenceCorrupt(err.to_string()),
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_invalid_input_is_a_warning() {
        let err = EngineError::InvalidInput("machineCount must be at least 1".into());
        assert_eq!(err.response_status(), RequestStatus::Warning);
        assert_eq!(err.reason_code(), "invalid_input");
    }

    #[rstest]
    #[case::transient(ProviderError::transient("throttled"), "provider_transient")]
    #[case::fatal(ProviderError::fatal("AuthFailure"), "provider_fatal")]
    #[case::not_found(ProviderError::not_found("InvalidInstanceID"), "provider_fatal")]
    fn test_provider_errors_map_by_kind(#[case] err: ProviderError, #[case] reason: &str) {
        let message = err.message.clone();
        let err = EngineError::from(err);
        assert_eq!(err.reason_code(), reason);
        assert_eq!(err.response_status(), RequestStatus::Error);
        assert!(err.to_string().ends_with(&message));
    }
}
