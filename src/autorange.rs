//! Heater auto-range pass.
//!
//! The 22C does not re-range its heater outputs on its own: when a control
//! loop saturates (output power pinned near 100 %) or idles (output power
//! near zero) the operator is expected to move `loop {n}:range` up or down
//! one step. This module automates that judgement as a polling-friendly
//! pass: read the live output fraction for every loop of interest, compare
//! it against a dead band, and step the range at most once per loop per
//! pass.
//!
//! A single step per pass is deliberate. Range changes alter the loop gain,
//! so the controller needs time to settle before the output fraction means
//! anything again. Callers that poll (the CLI `auto-range` command, a
//! monitoring daemon) converge over successive passes instead of slewing
//! in one.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::controller::Cryocon22c;
use crate::error::{CryoconError, Result};
use crate::protocol::HeaterRange;
use crate::registry::Loop;
use crate::transport::InstrumentTransport;

/// Default lower dead-band edge: step down when the output fraction falls
/// below 9 %.
pub const DEFAULT_LOW_THRESHOLD: f64 = 0.09;

/// Default upper dead-band edge: step up when the output fraction rises
/// above 95 %.
pub const DEFAULT_HIGH_THRESHOLD: f64 = 0.95;

/// Validated dead-band thresholds for the auto-range pass.
///
/// Both edges are output fractions in `[0, 1]` and the band must be
/// non-empty (`low < high`); [`Thresholds::new`] rejects anything else so
/// a pass can never start with a band that would oscillate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    low: f64,
    high: f64,
}

impl Thresholds {
    /// Builds a threshold pair, enforcing `0 <= low < high <= 1`.
    ///
    /// # Errors
    ///
    /// Returns [`CryoconError::InvalidThresholds`] when the ordering or
    /// bounds are violated.
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(CryoconError::InvalidThresholds { low, high });
        }
        Ok(Self { low, high })
    }

    /// Lower dead-band edge as an output fraction.
    #[must_use]
    pub fn low(&self) -> f64 {
        self.low
    }

    /// Upper dead-band edge as an output fraction.
    #[must_use]
    pub fn high(&self) -> f64 {
        self.high
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_THRESHOLD,
            high: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

/// Outcome of one auto-range pass for a single control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeAdjustment {
    /// The output fraction sat inside the dead band, or the range was
    /// already at the end stop in the direction the fraction pointed.
    Unchanged,
    /// The range was stepped exactly one level and the change was
    /// confirmed by reading it back.
    Stepped {
        /// Range before the step.
        from: HeaterRange,
        /// Range after the step.
        to: HeaterRange,
    },
}

impl<T: InstrumentTransport> Cryocon22c<T> {
    /// Runs one auto-range pass over the given channels.
    ///
    /// `channels` selects which input channels to consider; `None` means
    /// every discovered channel. Channels sharing a control loop are
    /// deduplicated so the loop is examined and stepped at most once, and
    /// every requested channel is reported with the outcome of its owning
    /// loop. A channel that cannot be resolved gets its own `Err` entry
    /// instead of failing the whole pass.
    ///
    /// # Errors
    ///
    /// Returns [`CryoconError::NotConnected`] when no session is open.
    /// Per-loop read or write failures are confined to the affected
    /// channels' entries in the returned map.
    pub async fn auto_adjust_range(
        &self,
        thresholds: Thresholds,
        channels: Option<&[char]>,
    ) -> Result<BTreeMap<char, Result<RangeAdjustment>>> {
        let registry = self.topology().await?;
        let requested: Vec<char> = match channels {
            Some(list) => list.iter().map(|c| c.to_ascii_lowercase()).collect(),
            None => registry.channel_ids(),
        };

        // Group the requested channels by owning loop, keeping first-seen
        // order, so a shared loop is only touched once per pass.
        let mut groups: Vec<(Loop, Vec<char>)> = Vec::new();
        let mut outcomes: BTreeMap<char, Result<RangeAdjustment>> = BTreeMap::new();
        for id in requested {
            match registry.resolve(id) {
                Ok(owner) => {
                    if let Some((_, members)) =
                        groups.iter_mut().find(|(l, _)| l.id == owner.id)
                    {
                        members.push(id);
                    } else {
                        groups.push((owner.clone(), vec![id]));
                    }
                }
                Err(e) => {
                    outcomes.insert(id, Err(e));
                }
            }
        }

        for (owner, members) in groups {
            let outcome = self.adjust_loop(&owner, thresholds).await;
            for id in members {
                outcomes.insert(id, outcome.clone());
            }
        }
        Ok(outcomes)
    }

    /// Examines one loop and steps its range at most once.
    async fn adjust_loop(&self, owner: &Loop, thresholds: Thresholds) -> Result<RangeAdjustment> {
        let range = self.range(owner.id).await?;
        let fraction = self.output_fraction(owner.id).await?;

        let target = if fraction > thresholds.high() {
            range.step_up()
        } else if fraction < thresholds.low() {
            range.step_down()
        } else {
            None
        };

        match target {
            Some(to) => {
                self.set_range(owner.id, to).await?;
                info!(
                    loop_id = owner.id,
                    output = format_args!("{:.1}%", fraction * 100.0),
                    from = %range,
                    to = %to,
                    "stepped heater range"
                );
                Ok(RangeAdjustment::Stepped { from: range, to })
            }
            None => {
                debug!(
                    loop_id = owner.id,
                    output = format_args!("{:.1}%", fraction * 100.0),
                    range = %range,
                    "heater range left unchanged"
                );
                Ok(RangeAdjustment::Unchanged)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_match_documented_dead_band() {
        let t = Thresholds::default();
        assert!((t.low() - 0.09).abs() < f64::EPSILON);
        assert!((t.high() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn thresholds_reject_inverted_band() {
        let err = Thresholds::new(0.9, 0.1).unwrap_err();
        assert!(matches!(
            err,
            CryoconError::InvalidThresholds { low, high }
                if (low - 0.9).abs() < f64::EPSILON && (high - 0.1).abs() < f64::EPSILON
        ));
    }

    #[test]
    fn thresholds_reject_out_of_bounds_edges() {
        assert!(Thresholds::new(-0.1, 0.5).is_err());
        assert!(Thresholds::new(0.1, 1.5).is_err());
        assert!(Thresholds::new(0.5, 0.5).is_err());
    }

    #[test]
    fn thresholds_accept_full_span() {
        let t = Thresholds::new(0.0, 1.0).unwrap();
        assert!((t.low() - 0.0).abs() < f64::EPSILON);
        assert!((t.high() - 1.0).abs() < f64::EPSILON);
    }
}
