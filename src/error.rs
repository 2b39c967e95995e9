//! Dispatch error taxonomy.
//!
//! Every way a single section call can fail. None of these are fatal to a
//! run: the dispatcher records them in the section's ledger row as
//! `"<kind>: <message>"` and moves on.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The call did not finish within the per-call timeout.
    #[error("no completion within {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Connection failure or other transport-level error.
    #[error("{0}")]
    Transport(String),

    /// Non-2xx response from the service.
    #[error("HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// The response stream carried something that is not a valid chunk.
    #[error("{0}")]
    Stream(String),

    /// The accumulated answer is not valid JSON.
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
}

impl DispatchError {
    /// Stable short name for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Transport(_) => "transport",
            DispatchError::Api { .. } => "api_status",
            DispatchError::Stream(_) => "stream",
            DispatchError::InvalidJson(_) => "invalid_json",
        }
    }

    /// The diagnostic stored in a failed ledger row.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    pub(crate) fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            DispatchError::Timeout(timeout)
        } else {
            DispatchError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_format() {
        let e = DispatchError::Timeout(Duration::from_secs(600));
        assert_eq!(e.diagnostic(), "timeout: no completion within 600s");

        let e = DispatchError::Api {
            status: 429,
            body: "rate limited".into(),
        };
        assert_eq!(e.diagnostic(), "api_status: HTTP 429: rate limited");

        let e: DispatchError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(e.diagnostic().starts_with("invalid_json: "));
    }
}
