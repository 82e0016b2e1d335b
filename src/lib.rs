//! Control core for the CryoCon Model 22C cryogenic temperature controller.
//!
//! The 22C exposes two measurement inputs (`a`, `b`) and up to four control
//! loops over a 9600-baud serial line speaking an SCPI-style ASCII protocol.
//! This crate provides:
//!
//! - [`Cryocon22c`]: session driver - connect, discover the channel/loop
//!   topology, read temperatures and set points, change set points and
//!   heater ranges with read-back verification, engage/stop control, manage
//!   the keypad lock
//! - [`Registry`]: the per-session topology cache built at connect time
//! - auto-range passes ([`Cryocon22c::auto_adjust_range`]) that step heater
//!   ranges one level at a time based on live output power
//! - [`SerialTransport`] for real hardware and [`MockTransport`] for tests
//!
//! The instrument offers no request identifiers or framing beyond CRLF, so
//! the driver keeps the wire in lock-step: one command, one response,
//! always consumed. State-changing commands are never trusted blindly;
//! each one is followed by a read of the affected state, and a mismatch is
//! an error.
//!
//! # Usage
//!
//! ```rust,no_run
//! use cryocon_22c::{Cryocon22c, CryoconConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CryoconConfig::from_file("cryocon.toml")?;
//!     let controller = Cryocon22c::from_config(&config);
//!
//!     controller.connect().await?;
//!     let temp = controller.temperature('a').await?;
//!     println!("channel a: {temp:.3}");
//!
//!     controller.set_temperature('a', 77.35).await?;
//!     controller.enable().await?;
//!
//!     controller.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod autorange;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod serial;
pub mod transport;

pub use autorange::{RangeAdjustment, Thresholds, DEFAULT_HIGH_THRESHOLD, DEFAULT_LOW_THRESHOLD};
pub use config::{AutoRangeConfig, CryoconConfig};
pub use controller::Cryocon22c;
pub use error::{CryoconError, Result};
pub use protocol::HeaterRange;
pub use registry::{Channel, Loop, Registry};
pub use serial::{DynSerial, SerialPortIO, SerialTransport};
pub use transport::{InstrumentTransport, MockTransport};
