//! High-level CryoCon 22C driver.
//!
//! [`Cryocon22c`] owns a transport and runs one session over it:
//!
//! 1. `connect` opens the link, discovers the channel/loop topology into a
//!    [`Registry`], and locks the front-panel keypad so nobody edits set
//!    points from under the session.
//! 2. Accessors and commands run strictly one query at a time. Every line
//!    sent to the instrument - including state-changing commands - is
//!    consumed together with its response, keeping the wire in lock-step.
//! 3. `disconnect` releases the keypad and closes the link; the registry
//!    dies with the session.
//!
//! Only topology (names, units, loop bindings, maximum set points) is
//! cached. Anything that can change on the instrument - temperatures, set
//! points, ranges, output power, engage and lock state - is re-read on
//! every call, and every state-changing command is verified by reading the
//! state back. A command the instrument acknowledged but did not apply
//! surfaces as an error here instead of as silent drift.

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::CryoconConfig;
use crate::error::{CryoconError, Result};
use crate::protocol::{self, HeaterRange};
use crate::registry::{Channel, Loop, Registry};
use crate::serial::SerialTransport;
use crate::transport::InstrumentTransport;

/// Driver for one CryoCon 22C over an [`InstrumentTransport`].
pub struct Cryocon22c<T: InstrumentTransport> {
    transport: T,
    registry: RwLock<Option<Registry>>,
}

impl Cryocon22c<SerialTransport> {
    /// Driver over a serial link described by `config`.
    ///
    /// The port is not opened until [`Cryocon22c::connect`].
    #[must_use]
    pub fn from_config(config: &CryoconConfig) -> Self {
        Self::new(SerialTransport::from_config(config))
    }
}

impl<T: InstrumentTransport> Cryocon22c<T> {
    /// Driver over an already-constructed transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            registry: RwLock::new(None),
        }
    }

    /// Opens the link, discovers the topology, and locks the keypad.
    ///
    /// No partial sessions: if discovery or the keypad lock fails, the
    /// link is closed again and the error propagated. Calling this on an
    /// established session is a no-op.
    ///
    /// # Errors
    ///
    /// [`CryoconError::Connection`] when the link cannot be opened,
    /// [`CryoconError::Discovery`] / [`CryoconError::Topology`] when the
    /// instrument's configuration cannot be mapped.
    #[instrument(skip(self), err)]
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }

        self.transport.connect().await?;

        let registry = match Registry::discover(&self.transport).await {
            Ok(registry) => registry,
            Err(e) => {
                let _ = self.transport.disconnect().await;
                return Err(e);
            }
        };

        if let Err(e) = self.lock(true).await {
            let _ = self.transport.disconnect().await;
            return Err(e);
        }

        *self.registry.write().await = Some(registry);
        info!("session established, keypad locked");
        Ok(())
    }

    /// Releases the keypad and closes the link.
    ///
    /// The keypad release is best effort: a dead instrument must not keep
    /// the port open, so a failure there is logged and the link closed
    /// anyway.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> Result<()> {
        if !self.transport.is_connected().await {
            *self.registry.write().await = None;
            return Ok(());
        }

        if let Err(e) = self.lock(false).await {
            warn!(error = %e, "keypad lock not released on disconnect");
        }

        *self.registry.write().await = None;
        self.transport.disconnect().await
    }

    /// True while a session (open link plus discovered topology) exists.
    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await && self.registry.read().await.is_some()
    }

    /// Discovered input channels, in letter order.
    pub async fn channels(&self) -> Result<Vec<Channel>> {
        Ok(self.topology().await?.channels().cloned().collect())
    }

    /// Discovered control loops, in slot order.
    pub async fn loops(&self) -> Result<Vec<Loop>> {
        Ok(self.topology().await?.loops().cloned().collect())
    }

    /// Resolve a letter, canonical token (`cha`), or user-assigned channel
    /// name to its letter identifier.
    pub async fn resolve_name(&self, name: &str) -> Result<char> {
        self.topology().await?.resolve_name(name)
    }

    /// Maximum set point of the loop driving `channel`, in the channel's
    /// unit. Fixed per session, so served from the registry.
    pub async fn max_setpoint(&self, channel: char) -> Result<f64> {
        Ok(self.topology().await?.resolve(channel)?.max_setpoint)
    }

    /// Name, unit, and loop binding of one channel, from the registry.
    pub async fn channel_info(&self, channel: char) -> Result<Channel> {
        Ok(self.topology().await?.channel(channel)?.clone())
    }

    /// Live temperature reading of an input channel.
    ///
    /// # Errors
    ///
    /// A faulted sensor (the instrument reports dots instead of a number)
    /// surfaces as [`CryoconError::Protocol`].
    #[instrument(skip(self), err)]
    pub async fn temperature(&self, channel: char) -> Result<f64> {
        let channel = self.topology().await?.channel(channel)?.id;
        let raw = self
            .transport
            .query(&protocol::temperature_query(channel))
            .await?;
        protocol::parse_temperature(&raw)
    }

    /// Current set point of the loop driving `channel`, read live.
    #[instrument(skip(self), err)]
    pub async fn set_point(&self, channel: char) -> Result<f64> {
        let owner = self.topology().await?.resolve(channel)?.id;
        let raw = self
            .transport
            .query(&protocol::set_point_query(owner))
            .await?;
        protocol::parse_temperature(&raw)
    }

    /// Changes the set point of the loop driving `channel` and confirms
    /// the instrument took it.
    ///
    /// The value is checked against the loop's maximum set point before
    /// anything is written; an out-of-range request reaches the wire
    /// never. After the write, the set point is read back and compared at
    /// the firmware's display precision.
    ///
    /// # Errors
    ///
    /// [`CryoconError::SetPointOutOfRange`] before any write,
    /// [`CryoconError::WriteVerification`] when the read-back disagrees
    /// with the request.
    #[instrument(skip(self), err)]
    pub async fn set_temperature(&self, channel: char, value: f64) -> Result<()> {
        let owner = self.topology().await?.resolve(channel)?.clone();
        if !value.is_finite() || value > owner.max_setpoint {
            return Err(CryoconError::SetPointOutOfRange {
                requested: value,
                max: owner.max_setpoint,
                loop_id: owner.id,
            });
        }

        let formatted = protocol::format_setpoint(value);
        self.transport
            .query(&protocol::set_point_write(owner.id, &formatted))
            .await?;

        let raw = self
            .transport
            .query(&protocol::set_point_query(owner.id))
            .await?;
        let read_back = protocol::parse_temperature(&raw)?;
        if !protocol::setpoint_matches(value, read_back) {
            return Err(CryoconError::WriteVerification {
                command: protocol::set_point_write(owner.id, &formatted),
                requested: formatted,
                actual: raw.trim().to_string(),
            });
        }

        info!(channel = %channel, loop_id = owner.id, set_point = %formatted, "set point confirmed");
        Ok(())
    }

    /// Current output range of a loop, read live.
    #[instrument(skip(self), err)]
    pub async fn range(&self, loop_id: u8) -> Result<HeaterRange> {
        self.topology().await?.loop_by_id(loop_id)?;
        let raw = self.transport.query(&protocol::range_query(loop_id)).await?;
        HeaterRange::from_instrument(&raw)
    }

    /// Changes a loop's output range and confirms the instrument took it.
    ///
    /// # Errors
    ///
    /// [`CryoconError::UnknownLoop`] before any write,
    /// [`CryoconError::WriteVerification`] when the read-back range is not
    /// the requested one.
    #[instrument(skip(self), err)]
    pub async fn set_range(&self, loop_id: u8, range: HeaterRange) -> Result<()> {
        self.topology().await?.loop_by_id(loop_id)?;
        self.transport
            .query(&protocol::range_write(loop_id, range))
            .await?;

        let raw = self.transport.query(&protocol::range_query(loop_id)).await?;
        if HeaterRange::from_instrument(&raw)? != range {
            return Err(CryoconError::range_mismatch(loop_id, range, raw.trim()));
        }

        info!(loop_id, range = %range, "heater range confirmed");
        Ok(())
    }

    /// Live output power of a loop as a fraction of full scale in `[0, 1]`.
    #[instrument(skip(self), err)]
    pub async fn output_fraction(&self, loop_id: u8) -> Result<f64> {
        self.topology().await?.loop_by_id(loop_id)?;
        let raw = self
            .transport
            .query(&protocol::output_power_query(loop_id))
            .await?;
        protocol::parse_output_fraction(&raw)
    }

    /// Whether the control loops are engaged, read live.
    pub async fn enabled(&self) -> Result<bool> {
        self.ensure_connected().await?;
        let raw = self.transport.query(&protocol::control_query()).await?;
        protocol::parse_on_off(&raw)
    }

    /// Engages all control loops and confirms the instrument reports them
    /// on.
    ///
    /// # Errors
    ///
    /// [`CryoconError::CommandNotApplied`] when the instrument still
    /// reports control off afterwards.
    #[instrument(skip(self), err)]
    pub async fn enable(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.transport.query(&protocol::engage_command()).await?;
        if !self.enabled().await? {
            return Err(CryoconError::CommandNotApplied {
                command: protocol::engage_command(),
                actual: "off".to_string(),
            });
        }
        info!("control loops engaged");
        Ok(())
    }

    /// Stops all control loops and confirms the instrument reports them
    /// off.
    #[instrument(skip(self), err)]
    pub async fn disable(&self) -> Result<()> {
        self.ensure_connected().await?;
        self.transport.query(&protocol::stop_command()).await?;
        if self.enabled().await? {
            return Err(CryoconError::CommandNotApplied {
                command: protocol::stop_command(),
                actual: "on".to_string(),
            });
        }
        info!("control loops stopped");
        Ok(())
    }

    /// Whether the front-panel keypad is locked, read live.
    pub async fn locked(&self) -> Result<bool> {
        self.ensure_connected().await?;
        let raw = self.transport.query(&protocol::lock_query()).await?;
        protocol::parse_on_off(&raw)
    }

    /// Locks or releases the front-panel keypad and confirms the state.
    #[instrument(skip(self), err)]
    pub async fn lock(&self, lock: bool) -> Result<()> {
        self.ensure_connected().await?;
        self.transport.query(&protocol::lock_write(lock)).await?;
        let actual = self.locked().await?;
        if actual != lock {
            return Err(CryoconError::CommandNotApplied {
                command: protocol::lock_write(lock),
                actual: if actual { "on" } else { "off" }.to_string(),
            });
        }
        debug!(locked = lock, "keypad lock state confirmed");
        Ok(())
    }

    /// Snapshot of the discovered topology for this session.
    pub(crate) async fn topology(&self) -> Result<Registry> {
        self.registry
            .read()
            .await
            .clone()
            .ok_or(CryoconError::NotConnected)
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.transport.is_connected().await {
            Ok(())
        } else {
            Err(CryoconError::NotConnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    /// Wire exchange for a full `connect`: 2-loop discovery, then the
    /// keypad lock command and its confirmation read.
    async fn script_connect(mock: &MockTransport) {
        mock.push_response("CHA").await;
        mock.push_response("475.000K").await;
        mock.push_response("CHB").await;
        mock.push_response("350.000K").await;
        mock.push_response("NONE").await;
        mock.push_response("Cold Finger").await;
        mock.push_response("K").await;
        mock.push_response("Radiation Shield").await;
        mock.push_response("K").await;
        mock.push_response("").await; // ack for system:lock on
        mock.push_response("on").await;
    }

    async fn connected_controller() -> Cryocon22c<MockTransport> {
        let mock = MockTransport::new();
        script_connect(&mock).await;
        let controller = Cryocon22c::new(mock);
        controller.connect().await.unwrap();
        controller.transport.clear_commands().await;
        controller
    }

    #[tokio::test]
    async fn connect_discovers_topology_and_locks_keypad() {
        let mock = MockTransport::new();
        script_connect(&mock).await;
        let controller = Cryocon22c::new(mock.clone());

        controller.connect().await.unwrap();

        assert!(controller.is_connected().await);
        let commands = mock.commands().await;
        assert_eq!(commands[commands.len() - 2], "system:lock on");
        assert_eq!(commands[commands.len() - 1], "system:lock?");
        assert_eq!(mock.remaining_responses().await, 0);
    }

    #[tokio::test]
    async fn operations_before_connect_report_not_connected() {
        let controller = Cryocon22c::new(MockTransport::new());
        assert!(matches!(
            controller.temperature('a').await,
            Err(CryoconError::NotConnected)
        ));
        assert!(matches!(
            controller.set_range(1, HeaterRange::Hi).await,
            Err(CryoconError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn out_of_range_set_point_writes_nothing() {
        let controller = connected_controller().await;

        let err = controller.set_temperature('a', 600.0).await.unwrap_err();
        assert!(matches!(
            err,
            CryoconError::SetPointOutOfRange { loop_id: 1, .. }
        ));
        // Rejected locally: nothing reached the wire.
        assert!(controller.transport.commands().await.is_empty());
    }

    #[tokio::test]
    async fn nan_set_point_writes_nothing() {
        let controller = connected_controller().await;

        assert!(controller.set_temperature('a', f64::NAN).await.is_err());
        assert!(controller.transport.commands().await.is_empty());
    }

    #[tokio::test]
    async fn range_write_is_verified_by_read_back() {
        let controller = connected_controller().await;
        controller.transport.push_response("").await; // ack
        controller.transport.push_response("MID").await; // read-back disagrees

        let err = controller.set_range(1, HeaterRange::Hi).await.unwrap_err();
        assert!(matches!(err, CryoconError::WriteVerification { .. }));

        let commands = controller.transport.commands().await;
        assert_eq!(commands, vec!["loop 1:range hi", "loop 1:range?"]);
    }

    #[tokio::test]
    async fn unknown_loop_is_rejected_before_any_write() {
        let controller = connected_controller().await;

        assert!(matches!(
            controller.set_range(9, HeaterRange::Low).await,
            Err(CryoconError::UnknownLoop(9))
        ));
        assert!(controller.transport.commands().await.is_empty());
    }

    #[tokio::test]
    async fn disable_verifies_the_stop_took() {
        let controller = connected_controller().await;
        controller.transport.push_response("").await; // ack for stop
        controller.transport.push_response("on").await; // still engaged

        assert!(matches!(
            controller.disable().await,
            Err(CryoconError::CommandNotApplied { .. })
        ));
    }

    #[tokio::test]
    async fn failed_discovery_closes_the_link_again() {
        let mock = MockTransport::new();
        mock.push_response("NONE").await; // no loops configured
        let controller = Cryocon22c::new(mock.clone());

        assert!(matches!(
            controller.connect().await,
            Err(CryoconError::Discovery(_))
        ));
        assert!(!mock.is_connected().await);
        assert!(!controller.is_connected().await);
    }
}
