//! Channel/loop topology discovery.
//!
//! The instrument's physical topology is authoritative; the [`Registry`] is
//! a cache of it, built once per connection and discarded on disconnect.
//! Discovery runs in two phases:
//!
//! 1. Loop slots are probed upward from 1 (`loop {n}:source?` then
//!    `loop {n}:maxset?`), stopping at the first slot that reports no
//!    configured input. The number of configured loops defines N.
//! 2. Each input channel letter is queried for its user-assigned name and
//!    unit, then tied to the lowest-numbered loop whose source feeds it.
//!
//! Any inconsistency between the two phases (a loop sourcing a channel that
//! does not exist, or a channel no loop drives) aborts discovery with
//! [`CryoconError::Topology`]; a partial registry is never exposed.
//!
//! Besides the letter identifiers, channels are reachable by alias: the
//! canonical source token (`cha`) and the user-assigned display name both
//! resolve case-insensitively through [`Registry::resolve_name`].

use crate::error::{CryoconError, Result};
use crate::protocol::{self, INPUT_CHANNELS, MAX_LOOP_SLOTS};
use crate::transport::InstrumentTransport;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A measurement input discovered at connect time.
///
/// Immutable for the session; only the owning loop's set point (held on the
/// instrument, not here) changes after discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Letter identifier (`a`, `b`).
    pub id: char,
    /// User-assigned display name; may be the factory default.
    pub name: String,
    /// Unit symbol the channel reports in (`K`, `C`, `F`, or `S`).
    pub unit: String,
    /// Loop driven by this channel's measurement.
    pub loop_id: u8,
}

/// A control loop discovered at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// Slot number, starting at 1.
    pub id: u8,
    /// Lowercased source token as reported by the instrument (`cha`).
    pub source: String,
    /// Maximum allowed set point, in the source channel's unit.
    pub max_setpoint: f64,
}

/// Immutable channel/loop topology for one connection.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    channels: BTreeMap<char, Channel>,
    loops: BTreeMap<u8, Loop>,
    aliases: BTreeMap<String, char>,
}

impl Registry {
    /// Run both discovery phases and assemble the registry.
    pub async fn discover<T: InstrumentTransport + ?Sized>(transport: &T) -> Result<Registry> {
        let loops = Self::discover_loops(transport).await?;
        let channels = Self::discover_channels(transport, &loops).await?;

        let mut aliases = BTreeMap::new();
        for channel in channels.values() {
            // First writer wins, in ascending channel order. An earlier
            // channel's user name can claim a later channel's letter or
            // canonical token; an alias is never overwritten.
            aliases
                .entry(channel.id.to_string())
                .or_insert(channel.id);
            aliases
                .entry(format!("ch{}", channel.id))
                .or_insert(channel.id);
            let name = channel.name.trim().to_ascii_lowercase();
            if !name.is_empty() {
                aliases.entry(name).or_insert(channel.id);
            }
        }

        info!(
            loops = loops.len(),
            channels = channels.len(),
            "instrument topology discovered"
        );

        Ok(Registry {
            channels,
            loops: loops.into_iter().map(|l| (l.id, l)).collect(),
            aliases,
        })
    }

    /// Probe loop slots upward from 1, stopping at the first absent slot.
    ///
    /// Fails with [`CryoconError::Discovery`] if even the first loop cannot
    /// be read; any failure on a later slot (either query, or an
    /// unparseable maximum) ends the probe, like an unconfigured slot does.
    pub async fn discover_loops<T: InstrumentTransport + ?Sized>(
        transport: &T,
    ) -> Result<Vec<Loop>> {
        let mut loops = Vec::new();

        for id in 1..=MAX_LOOP_SLOTS {
            let source = match transport.query(&protocol::loop_source_query(id)).await {
                Ok(response) => response,
                Err(e) if id == 1 => {
                    return Err(CryoconError::Discovery(format!(
                        "cannot read loop 1 source: {e}"
                    )));
                }
                Err(e) => {
                    debug!(loop_id = id, error = %e, "loop probe ended");
                    break;
                }
            };

            if protocol::is_absent(&source) {
                debug!(loop_id = id, "no source configured, probe ends");
                break;
            }

            let max_setpoint = match transport
                .query(&protocol::loop_max_setpoint_query(id))
                .await
                .and_then(|raw| protocol::parse_temperature(&raw))
            {
                Ok(value) => value,
                Err(e) if id == 1 => {
                    return Err(CryoconError::Discovery(format!(
                        "cannot read loop 1 maximum set point: {e}"
                    )));
                }
                Err(e) => {
                    debug!(loop_id = id, error = %e, "loop probe ended");
                    break;
                }
            };

            loops.push(Loop {
                id,
                source: source.trim().to_ascii_lowercase(),
                max_setpoint,
            });
        }

        if loops.is_empty() {
            return Err(CryoconError::Discovery(
                "no configured loops found".to_string(),
            ));
        }

        Ok(loops)
    }

    /// Query every input channel's name and unit and tie it to its loop.
    ///
    /// A channel no loop drives, or a loop sourcing an unknown channel, is
    /// a [`CryoconError::Topology`] error.
    pub async fn discover_channels<T: InstrumentTransport + ?Sized>(
        transport: &T,
        loops: &[Loop],
    ) -> Result<BTreeMap<char, Channel>> {
        for l in loops {
            if source_to_channel(&l.source).is_none() {
                return Err(CryoconError::Topology(format!(
                    "loop {} source '{}' does not match any input channel",
                    l.id, l.source
                )));
            }
        }

        let mut channels = BTreeMap::new();
        for &id in INPUT_CHANNELS.iter() {
            let name = transport.query(&protocol::channel_name_query(id)).await?;
            let unit = transport.query(&protocol::channel_units_query(id)).await?;

            // Lowest loop id wins when several loops share a source,
            // matching the instrument's own precedence.
            let loop_id = loops
                .iter()
                .find(|l| source_to_channel(&l.source) == Some(id))
                .map(|l| l.id)
                .ok_or_else(|| {
                    CryoconError::Topology(format!(
                        "input channel '{id}' is not driven by any loop"
                    ))
                })?;

            channels.insert(
                id,
                Channel {
                    id,
                    name: name.trim().to_string(),
                    unit: unit.trim().to_string(),
                    loop_id,
                },
            );
        }

        Ok(channels)
    }

    /// Loop driving the given channel.
    pub fn resolve(&self, channel_id: char) -> Result<&Loop> {
        let channel = self.channel(channel_id)?;
        self.loops.get(&channel.loop_id).ok_or_else(|| {
            CryoconError::Topology(format!(
                "channel '{}' references undiscovered loop {}",
                channel.id, channel.loop_id
            ))
        })
    }

    /// Channel by letter identifier, case-insensitive.
    pub fn channel(&self, channel_id: char) -> Result<&Channel> {
        self.channels
            .get(&channel_id.to_ascii_lowercase())
            .ok_or_else(|| CryoconError::UnknownChannel(channel_id.to_string()))
    }

    /// Loop by slot number.
    pub fn loop_by_id(&self, loop_id: u8) -> Result<&Loop> {
        self.loops
            .get(&loop_id)
            .ok_or(CryoconError::UnknownLoop(loop_id))
    }

    /// Resolve a letter, canonical token (`cha`), or user-assigned name to
    /// a channel identifier, case-insensitively.
    pub fn resolve_name(&self, name: &str) -> Result<char> {
        let key = name.trim().to_ascii_lowercase();
        self.aliases
            .get(&key)
            .copied()
            .ok_or_else(|| CryoconError::UnknownChannel(name.trim().to_string()))
    }

    /// Discovered channels in letter order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Discovered loops in slot order.
    pub fn loops(&self) -> impl Iterator<Item = &Loop> {
        self.loops.values()
    }

    /// Letter identifiers of all discovered channels, in order.
    pub fn channel_ids(&self) -> Vec<char> {
        self.channels.keys().copied().collect()
    }
}

/// Map a loop source token to the input channel letter it names.
///
/// The instrument reports sources as `CHA`/`CHB`; a bare letter is accepted
/// too. Anything else is no channel of this instrument.
fn source_to_channel(token: &str) -> Option<char> {
    let lower = token.trim().to_ascii_lowercase();
    let letter = lower.strip_prefix("ch").unwrap_or(&lower);
    let mut chars = letter.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if INPUT_CHANNELS.contains(&c) => Some(c),
        _ => None,
    }
}
