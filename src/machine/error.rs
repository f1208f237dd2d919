//! Error types for talking to a coffee machine over HTTP.

use thiserror::Error;

/// Errors that can occur on a single call to a machine.
///
/// None of these abort a cycle on their own: the passes log them, record
/// them in the report and move on to the next job or machine.
#[derive(Debug, Error)]
pub enum MachineError {
    /// `GET /status` answered with something other than 200.
    #[error("machine unavailable (status {status})")]
    Unavailable { status: u16 },

    /// Any other non-success status on start or retrieve.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The body was not the JSON we expected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The machine address cannot be turned into a request URL.
    #[error("invalid machine address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Connection refused, DNS, timeout and friends.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        let err = MachineError::Unavailable { status: 503 };
        assert_eq!(err.to_string(), "machine unavailable (status 503)");
    }

    #[test]
    fn api_error_display() {
        let err = MachineError::ApiError {
            status: 404,
            message: "no such job".into(),
        };
        assert_eq!(err.to_string(), "API error (status 404): no such job");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MachineError>();
    }
}
