//! Error types for the CryoCon 22C control core.
//!
//! This module defines the primary error type, [`CryoconError`], using the
//! `thiserror` crate. Every fallible operation in the crate returns the
//! [`Result`] alias defined here.
//!
//! ## Error Hierarchy
//!
//! Variants fall into three broad categories:
//!
//! 1. **Transport errors** - `Connection`, `CommunicationTimeout`,
//!    `NotConnected`: the instrument could not be reached or did not answer
//!    within the configured window. Surfaced as-is; the core never retries,
//!    because retrying a write whose completion status is unknown risks
//!    applying it twice.
//! 2. **Validation errors** - `UnknownChannel`, `UnknownLoop`,
//!    `SetPointOutOfRange`, `InvalidRange`, `InvalidThresholds`, `Config`:
//!    rejected locally before any byte reaches the instrument.
//! 3. **Instrument-state errors** - `Discovery`, `Topology`,
//!    `WriteVerification`, `CommandNotApplied`, `Protocol`: the instrument
//!    answered, but its reported state is inconsistent, unparseable, or does
//!    not reflect the change that was just issued.

use crate::protocol::HeaterRange;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, CryoconError>;

/// Primary error type for the CryoCon 22C control core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryoconError {
    /// Opening or closing the transport connection failed.
    ///
    /// **Error Type**: Usually permanent - wrong port path, device off,
    /// cable unplugged, or the port held by another process.
    ///
    /// **Recovery Strategy**: Check the port path and hardware, then call
    /// `connect()` again. The core never reconnects on its own.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A query did not produce a complete response line within the
    /// configured timeout.
    ///
    /// If the timed-out query carried a write, its effect on the instrument
    /// is unknown; callers must re-query state before deciding to reissue.
    ///
    /// **Error Type**: Transient or permanent - a slow instrument, a baud
    /// mismatch, and a dead connection all look the same from here.
    ///
    /// **Recovery Strategy**: Caller policy. The core performs no automatic
    /// retry anywhere, preserving the at-most-one-write invariant.
    #[error("Communication timeout after {0:?}")]
    CommunicationTimeout(std::time::Duration),

    /// An operation was issued before `connect()` or after `disconnect()`.
    #[error("Not connected to instrument")]
    NotConnected,

    /// Loop discovery failed before a single loop could be read.
    ///
    /// The instrument is unreachable or not in the expected mode; the
    /// controller cannot initialize without a topology.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// The instrument reported an inconsistent channel/loop topology.
    ///
    /// Fatal to initialization: a partial registry is never exposed, so the
    /// controller refuses to come up until the instrument configuration is
    /// fixed (e.g. a loop source naming a channel that does not exist, or an
    /// input channel no loop drives).
    #[error("Inconsistent instrument topology: {0}")]
    Topology(String),

    /// Caller referenced a channel id or name that was never discovered.
    ///
    /// Local validation; the instrument is never contacted.
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    /// Caller referenced a loop id that was never discovered.
    ///
    /// Local validation; the instrument is never contacted.
    #[error("Unknown loop {0}")]
    UnknownLoop(u8),

    /// Requested set point exceeds the loop's configured maximum.
    ///
    /// Validated before any instrument write.
    #[error("Set point {requested} exceeds maximum {max} for loop {loop_id}")]
    SetPointOutOfRange {
        /// The rejected set-point value.
        requested: f64,
        /// The loop's configured maximum set point.
        max: f64,
        /// The loop the write was addressed to.
        loop_id: u8,
    },

    /// Requested range token is outside the fixed `{low, mid, hi}` set.
    ///
    /// Validated before any instrument write.
    #[error("Invalid range token '{0}' (expected one of: low, mid, hi)")]
    InvalidRange(String),

    /// Auto-range thresholds violate `0 <= low < high <= 1`.
    #[error("Invalid auto-range thresholds: low {low}, high {high}")]
    InvalidThresholds {
        /// Lower power-fraction threshold.
        low: f64,
        /// Upper power-fraction threshold.
        high: f64,
    },

    /// A value write was issued but the read-back does not match.
    ///
    /// The write's actual effect is unknown to the caller and must be
    /// treated as unconfirmed. Never silently retried.
    #[error("Write verification failed for {command}: wrote '{requested}', read back '{actual}'")]
    WriteVerification {
        /// The command that carried the write.
        command: String,
        /// The value that was written, as formatted on the wire.
        requested: String,
        /// The value the instrument reported afterwards.
        actual: String,
    },

    /// A state-transition command was issued but the re-read state does not
    /// reflect it (e.g. `control` issued, yet `control?` still reports off).
    #[error("Command '{command}' not applied: instrument still reports '{actual}'")]
    CommandNotApplied {
        /// The state-transition command that was issued.
        command: String,
        /// The state the instrument reported on re-read.
        actual: String,
    },

    /// A response could not be parsed into the expected type or range.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration file could not be read or its values are invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CryoconError {
    /// Build a `WriteVerification` error for a range write.
    pub(crate) fn range_mismatch(loop_id: u8, requested: HeaterRange, actual: &str) -> Self {
        CryoconError::WriteVerification {
            command: format!("loop {loop_id}:range"),
            requested: requested.token().to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryoconError::UnknownChannel("c".into());
        assert_eq!(err.to_string(), "Unknown channel 'c'");

        let err = CryoconError::SetPointOutOfRange {
            requested: 500.0,
            max: 475.0,
            loop_id: 1,
        };
        assert_eq!(
            err.to_string(),
            "Set point 500 exceeds maximum 475 for loop 1"
        );
    }

    #[test]
    fn test_verification_error_display() {
        let err = CryoconError::WriteVerification {
            command: "loop 1:setpt".into(),
            requested: "20.000".into(),
            actual: "15.000".into(),
        };
        assert!(err.to_string().contains("wrote '20.000'"));
        assert!(err.to_string().contains("read back '15.000'"));
    }
}
