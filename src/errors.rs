// Error taxonomy for the auction engine.
use rust_decimal::Decimal;
use std::fmt;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone)]
pub enum EngineError {
    // Validation errors: rejected immediately, no state change
    Validation(String),

    // Debit aborted, no bid created
    InsufficientFunds { available: Decimal, required: Decimal },

    // Unknown bid/slot/event/wallet id
    NotFound { kind: &'static str, id: String },

    // e.g. rejecting an already-played bid
    InvalidTransition { from: String, to: String },

    // Operator action on an already-resolved record
    Conflict(String),

    // External metadata lookup failed; degrades to an empty result
    Transient(String),

    // Unknown
    Internal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation failed: {}", msg),
            Self::InsufficientFunds { available, required } => {
                write!(f, "Insufficient funds: have {}, need {}", available, required)
            }
            Self::NotFound { kind, id } => write!(f, "{} {} not found", kind, id),
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid transition: {} -> {}", from, to)
            }
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::Transient(msg) => write!(f, "Transient dependency error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

// Error code mapping for API responses
impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Conflict(_) => "CONFLICT",
            Self::Transient(_) => "TRANSIENT_DEPENDENCY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// User errors are terminal: the engine never retries them, the caller
    /// fixes the input (or tops up) and resubmits.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InsufficientFunds { .. }
                | Self::InvalidTransition { .. }
                | Self::Conflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::InsufficientFunds {
            available: Decimal::from(40),
            required: Decimal::from(60),
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert!(err.is_user_error());

        let err2 = EngineError::Transient("deezer timeout".to_string());
        assert_eq!(err2.error_code(), "TRANSIENT_DEPENDENCY");
        assert!(!err2.is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::InvalidTransition {
            from: "played".to_string(),
            to: "rejected".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid transition: played -> rejected");
    }
}
