//! Crate-wide error kinds.
//!
//! Every fallible operation in the runtime returns [`CoreResult`], a plain
//! `Result` over [`CoreError`].  The variants mirror the places a call can
//! fail: configuration and construction, provider transport, tool dispatch,
//! the agent loop's own bounds, and cooperative cancellation.  Errors never
//! cross component boundaries as panics; streaming is the one place where
//! failures travel as `Err` items inside the chunk stream instead.

use std::error::Error;
use std::fmt;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds produced by the runtime core.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Configuration was missing, malformed, or failed validation.
    Config(String),
    /// A provider transport or decode failure during `complete` or stream setup.
    Provider(String),
    /// A tool-server connection or protocol failure.
    Tool(String),
    /// The agent loop reached its tool-round bound.
    MaxToolRounds(usize),
    /// The in-flight turn was cancelled.
    Aborted,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CoreError::Provider(msg) => write!(f, "Provider error: {}", msg),
            CoreError::Tool(msg) => write!(f, "Tool error: {}", msg),
            CoreError::MaxToolRounds(n) => write!(f, "Max tool rounds reached ({})", n),
            CoreError::Aborted => write!(f, "Aborted"),
        }
    }
}

impl Error for CoreError {}

impl CoreError {
    /// True when this error represents cancellation rather than a real failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, CoreError::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_bound() {
        let err = CoreError::MaxToolRounds(3);
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn aborted_displays_exactly() {
        assert_eq!(CoreError::Aborted.to_string(), "Aborted");
        assert!(CoreError::Aborted.is_aborted());
        assert!(!CoreError::Provider("x".into()).is_aborted());
    }
}
