use std::time::Duration;

use opreq_store::StoreError;

use crate::poll::PollError;

/// Reconcile failures. `Conflict` is normally absorbed by the status retry loop and
/// `DeadlineExceeded` is turned into a requeue by the orchestration loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("timed out waiting for the condition after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("installation of {component} failed: {reason}")]
    InstallationFailure { component: String, reason: String },
    #[error("teardown of {component} failed: {source}")]
    TeardownFailure {
        component: String,
        #[source]
        source: StoreError,
    },
    #[error("operand {operand}: {reason}")]
    InvalidOperand { operand: String, reason: String },
    #[error(transparent)]
    Store(StoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_deadline(&self) -> bool { matches!(self, Self::DeadlineExceeded(_)) }

    /// Short label for metrics.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::DeadlineExceeded(_) => "deadline",
            Self::InstallationFailure { .. } => "installation",
            Self::TeardownFailure { .. } => "teardown",
            Self::InvalidOperand { .. } => "invalid_operand",
            Self::Store(_) => "store",
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::NotFound(e.to_string()),
            StoreError::Conflict { .. } => Self::Conflict(e.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<PollError<Error>> for Error {
    fn from(e: PollError<Error>) -> Self {
        match e {
            PollError::DeadlineExceeded(waited) => Self::DeadlineExceeded(waited),
            PollError::Failed(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opreq_core::{OperandRegistry, Record};

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let kind = OperandRegistry::kind();
        assert!(Error::from(StoreError::not_found(&kind, "ns", "reg")).is_not_found());
        assert!(matches!(Error::from(StoreError::conflict(&kind, "ns", "reg", "stale")), Error::Conflict(_)));
        assert!(matches!(Error::from(StoreError::Backend("boom".into())), Error::Store(_)));
    }

    #[test]
    fn poll_errors_unwrap_into_reconcile_errors() {
        let e: Error = PollError::<Error>::DeadlineExceeded(Duration::from_secs(600)).into();
        assert!(e.is_deadline());
        let e: Error = PollError::Failed(Error::NotFound("x".into())).into();
        assert!(e.is_not_found());
    }
}
