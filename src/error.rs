//! Crate-level error taxonomy. Variants mirror the error-handling design's
//! classification: transient/rate-limit are locally retried by callers before
//! ever surfacing here; the rest propagate as typed values the caller branches on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient exchange/network failure: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("signal validation failed at check {check}: {reason}")]
    Validation { check: &'static str, reason: String },

    #[error("stop could not be set after fill on {symbol}, compensating close required")]
    ExecutionPostFill { symbol: String },

    #[error("book integrity violated for {symbol}: {reason}")]
    Integrity { symbol: String, reason: String },

    #[error("safety condition triggered: {reason}")]
    Safety { reason: String },

    #[error("programming invariant violated: {detail}")]
    Invariant { detail: String },
}

impl EngineError {
    pub fn validation(check: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            check,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_check_name() {
        let err = EngineError::validation("max_concurrent_positions", "5 >= 5");
        match err {
            EngineError::Validation { check, .. } => assert_eq!(check, "max_concurrent_positions"),
            _ => panic!("wrong variant"),
        }
    }
}
