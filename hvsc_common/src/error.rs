//! Core error taxonomy.
//!
//! Every control path (manual setpoint, ramp protocol, trip recovery)
//! reports failures through `CoreError` so callers can distinguish
//! input errors, refused operations, and protocol aborts. The recovery
//! supervisor retries only on kinds marked recoverable.

use thiserror::Error;

/// Errors raised by the HVSC control core.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed numeric input; corrected in place by the caller.
    #[error("invalid value: {0}")]
    Validation(String),

    /// One or more safety checks refused the operation.
    #[error("safety check(s) failed: {}", failed.join(", "))]
    Safety {
        /// Names of the failing checks.
        failed: Vec<String>,
    },

    /// A condition referenced a name outside the allowed set.
    #[error("check '{check}': name '{name}' in '{condition}' is not defined")]
    Name {
        check: String,
        name: String,
        condition: String,
    },

    /// A condition failed to parse.
    #[error("check '{check}': syntax error in '{condition}'")]
    Syntax { check: String, condition: String },

    /// The operation is not permitted in the present state (channel
    /// not powered, or manual controls locked out by trip recovery).
    #[error("{what}")]
    Permission { what: String },

    /// A convergence or recovery wait exceeded its bound.
    #[error("timeout while {what}")]
    Timeout { what: String },

    /// The device driver reported a communication failure.
    #[error("device communication failure: {0}")]
    Comm(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Refusal because a channel that must be powered is off.
    pub fn not_powered(channel: &str) -> Self {
        Self::Permission {
            what: format!("channel '{channel}' is not powered on"),
        }
    }

    /// Refusal because trip recovery holds the manual-control lockout.
    pub fn locked_out() -> Self {
        Self::Permission {
            what: "manual ramp controls are locked by trip recovery".into(),
        }
    }

    /// Whether the trip-recovery supervisor may retry after this error.
    ///
    /// Only transient protocol outcomes qualify; malformed conditions,
    /// refused checks, and driver failures abort recovery outright.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Permission { .. } | Self::Timeout { .. })
    }
}
