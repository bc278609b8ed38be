//! Bus errors

use thiserror::Error;

/// Errors raised when the bus is misused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Invalid event pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("Cannot throttle '{event}': {reason}")]
    Throttle { event: String, reason: &'static str },
}

pub type BusResult<T> = Result<T, BusError>;
