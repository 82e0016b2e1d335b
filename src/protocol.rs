//! Wire vocabulary for the CryoCon 22C.
//!
//! Reference: CryoCon Model 22C User's Manual (remote command set)
//!
//! Protocol Overview:
//! - Format: SCPI-style ASCII commands, case-insensitive
//! - Baud: 9600, 8N1, no flow control
//! - Terminator: CRLF (`\r\n`) in both directions
//! - Queries: `input? {ch}` (temperature), `input {ch}:name?`,
//!   `input {ch}:units?`, `loop {n}:source?`, `loop {n}:maxset?`,
//!   `loop {n}:setpt?`, `loop {n}:range?`, `loop {n}:outpwr?`,
//!   `control?`, `system:lock?`
//! - Writes: `loop {n}:setpt {v}`, `loop {n}:range {r}`, `control`, `stop`,
//!   `system:lock {on|off}`
//!
//! Writes are issued in query form like everything else: the instrument
//! answers every line it receives, and consuming that answer is what keeps
//! command and response in lock-step. A response left in the buffer would be
//! mistaken for the answer to the next query and corrupt every read after
//! it, so this module only ever describes single query/response exchanges.
//!
//! Numeric responses that represent temperatures carry the input channel's
//! unit as a suffix (e.g. `475.000K`); [`parse_temperature`] strips it.
//! Output power is reported as a percentage of full scale by most firmware
//! revisions but as a bare fraction by some; [`parse_output_fraction`]
//! normalizes both to `[0, 1]`.

use crate::error::{CryoconError, Result};
use std::fmt;
use std::str::FromStr;

/// Line terminator used in both directions on the wire.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Input channels present on the 22C (two-input model).
pub const INPUT_CHANNELS: [char; 2] = ['a', 'b'];

/// Highest loop slot probed during discovery. Loops 1 and 2 are the main
/// heater outputs; 3 and 4 exist only with option boards installed.
pub const MAX_LOOP_SLOTS: u8 = 4;

/// Decimal precision the firmware uses when reporting set points.
///
/// Read-back verification formats both sides with this precision before
/// comparing, so float round-tripping through instrument text never causes
/// a spurious mismatch.
pub const SETPOINT_DECIMALS: usize = 3;

// =============================================================================
// Command builders
// =============================================================================

/// `input {ch}:name?` - user-assigned display name of an input channel.
pub(crate) fn channel_name_query(channel: char) -> String {
    format!("input {channel}:name?")
}

/// `input {ch}:units?` - unit symbol of an input channel (K, C, F, or S).
pub(crate) fn channel_units_query(channel: char) -> String {
    format!("input {channel}:units?")
}

/// `input? {ch}` - current measured temperature of an input channel.
pub(crate) fn temperature_query(channel: char) -> String {
    format!("input? {channel}")
}

/// `loop {n}:source?` - input channel feeding a loop.
pub(crate) fn loop_source_query(loop_id: u8) -> String {
    format!("loop {loop_id}:source?")
}

/// `loop {n}:maxset?` - maximum allowed set point of a loop.
pub(crate) fn loop_max_setpoint_query(loop_id: u8) -> String {
    format!("loop {loop_id}:maxset?")
}

/// `loop {n}:setpt?` - current set point of a loop.
pub(crate) fn set_point_query(loop_id: u8) -> String {
    format!("loop {loop_id}:setpt?")
}

/// `loop {n}:setpt {v}` - set-point write, value pre-formatted.
pub(crate) fn set_point_write(loop_id: u8, formatted_value: &str) -> String {
    format!("loop {loop_id}:setpt {formatted_value}")
}

/// `loop {n}:range?` - current output range of a loop.
pub(crate) fn range_query(loop_id: u8) -> String {
    format!("loop {loop_id}:range?")
}

/// `loop {n}:range {r}` - range write.
pub(crate) fn range_write(loop_id: u8, range: HeaterRange) -> String {
    format!("loop {loop_id}:range {}", range.token())
}

/// `loop {n}:outpwr?` - current output power of a loop.
pub(crate) fn output_power_query(loop_id: u8) -> String {
    format!("loop {loop_id}:outpwr?")
}

/// `control?` - whether the controller is engaged.
pub(crate) fn control_query() -> String {
    "control?".to_string()
}

/// `control` - engage all control loops.
pub(crate) fn engage_command() -> String {
    "control".to_string()
}

/// `stop` - disengage all control loops.
pub(crate) fn stop_command() -> String {
    "stop".to_string()
}

/// `system:lock?` - whether the front-panel keypad is locked.
pub(crate) fn lock_query() -> String {
    "system:lock?".to_string()
}

/// `system:lock {on|off}` - lock or release the front-panel keypad.
pub(crate) fn lock_write(lock: bool) -> String {
    format!("system:lock {}", if lock { "on" } else { "off" })
}

// =============================================================================
// HeaterRange
// =============================================================================

/// Output range of a control loop, ordered `Low < Mid < Hi`.
///
/// The instrument reports range tokens in upper case (`LOW`, `MID`, `HI`)
/// and accepts them in any case; the wire token is always sent lower case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaterRange {
    /// Lowest output scale.
    Low,
    /// Middle output scale.
    Mid,
    /// Full output scale.
    Hi,
}

impl HeaterRange {
    /// Wire token for this range.
    pub fn token(&self) -> &'static str {
        match self {
            HeaterRange::Low => "low",
            HeaterRange::Mid => "mid",
            HeaterRange::Hi => "hi",
        }
    }

    /// Next range up the scale, or `None` at the top.
    pub fn step_up(&self) -> Option<HeaterRange> {
        match self {
            HeaterRange::Low => Some(HeaterRange::Mid),
            HeaterRange::Mid => Some(HeaterRange::Hi),
            HeaterRange::Hi => None,
        }
    }

    /// Next range down the scale, or `None` at the bottom.
    pub fn step_down(&self) -> Option<HeaterRange> {
        match self {
            HeaterRange::Hi => Some(HeaterRange::Mid),
            HeaterRange::Mid => Some(HeaterRange::Low),
            HeaterRange::Low => None,
        }
    }

    /// Parse a range token reported by the instrument.
    ///
    /// An unrecognized token out of the instrument is a [`CryoconError::Protocol`]
    /// error, unlike [`HeaterRange::from_str`] which flags bad *caller* input
    /// as [`CryoconError::InvalidRange`].
    pub(crate) fn from_instrument(raw: &str) -> Result<HeaterRange> {
        let token = raw.trim();
        token.parse().map_err(|_| {
            CryoconError::Protocol(format!("unexpected range token '{token}' from instrument"))
        })
    }
}

impl FromStr for HeaterRange {
    type Err = CryoconError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(HeaterRange::Low),
            "mid" => Ok(HeaterRange::Mid),
            "hi" => Ok(HeaterRange::Hi),
            other => Err(CryoconError::InvalidRange(other.to_string())),
        }
    }
}

impl fmt::Display for HeaterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// True if a response marks an unconfigured/absent entity.
///
/// The instrument answers `NONE` for an unconfigured loop source and `NAK`
/// for commands it cannot service; an empty line means the same for loop
/// probing purposes.
pub(crate) fn is_absent(raw: &str) -> bool {
    let token = raw.trim();
    token.is_empty()
        || token.eq_ignore_ascii_case("none")
        || token.eq_ignore_ascii_case("nak")
}

/// Parse a temperature-valued response, stripping any trailing unit suffix.
///
/// `475.000K` parses to 475.0; a faulted sensor reading (the instrument
/// sends dots, e.g. `.......`) or any other non-numeric payload is a
/// [`CryoconError::Protocol`] error.
pub(crate) fn parse_temperature(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CryoconError::Protocol("empty temperature response".into()));
    }

    let numeric = trimmed
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim();
    numeric.parse::<f64>().map_err(|_| {
        CryoconError::Protocol(format!("cannot parse temperature from '{trimmed}'"))
    })
}

/// Parse an `on`/`off` state response.
pub(crate) fn parse_on_off(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(CryoconError::Protocol(format!(
            "expected 'on' or 'off', got '{other}'"
        ))),
    }
}

/// Parse an output-power response and normalize it to a fraction in `[0, 1]`.
///
/// Values already in `[0, 1]` pass through (fraction-reporting firmware,
/// with 1.0 meaning full scale); values in `(1, 100]` are divided by 100
/// (percent-reporting firmware). Anything negative, above 100, or
/// non-numeric is a [`CryoconError::Protocol`] error.
pub(crate) fn parse_output_fraction(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let value = trimmed.parse::<f64>().map_err(|_| {
        CryoconError::Protocol(format!("cannot parse output power from '{trimmed}'"))
    })?;

    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else if value > 1.0 && value <= 100.0 {
        Ok(value / 100.0)
    } else {
        Err(CryoconError::Protocol(format!(
            "output power {value} outside 0-100 band"
        )))
    }
}

/// Format a set point the way it is sent on the wire.
pub(crate) fn format_setpoint(value: f64) -> String {
    format!("{value:.prec$}", prec = SETPOINT_DECIMALS)
}

/// Compare a requested set point against the instrument's read-back.
///
/// Both sides are formatted with the firmware's display precision first, so
/// text round-tripping (e.g. `20.0` sent, `20.000K` read back) never
/// produces a spurious mismatch.
pub(crate) fn setpoint_matches(requested: f64, read_back: f64) -> bool {
    format_setpoint(requested) == format_setpoint(read_back)
}
