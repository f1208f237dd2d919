use thiserror::Error;

use crate::machine::MachineError;

/// Errors that end a dispatch cycle.
///
/// Per-machine failures are carried as [`MachineError`] and isolated by the
/// passes; only the variants here abort the remaining work.
#[derive(Debug, Error)]
pub enum BaristaError {
    #[error("An order needs at least one product")]
    EmptyOrder,

    #[error("Failed to resolve machine address {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Gave up updating {0} after repeated concurrent modification")]
    Conflict(String),

    #[error("Cycle exceeded its deadline of {0}s")]
    CycleTimeout(u64),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, BaristaError>;

/// Classifies a per-job failure for the cycle report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The machine could not be reached or timed out.
    Transport,
    /// The machine answered, but not with something we could use.
    Protocol,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "Transport"),
            FailureKind::Protocol => write!(f, "Protocol"),
        }
    }
}

impl From<&MachineError> for FailureKind {
    fn from(err: &MachineError) -> Self {
        match err {
            MachineError::NetworkError(_) => FailureKind::Transport,
            _ => FailureKind::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_error_display() {
        let err = BaristaError::Resolve {
            address: "http://coffee:1337".into(),
            reason: "no addresses".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to resolve machine address http://coffee:1337: no addresses"
        );
    }

    #[test]
    fn machine_errors_classify() {
        let api = MachineError::ApiError {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(FailureKind::from(&api), FailureKind::Protocol);

        let invalid = MachineError::InvalidResponse("missing jobId".into());
        assert_eq!(FailureKind::from(&invalid), FailureKind::Protocol);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BaristaError>();
    }
}
