//! Signal filtering for raw ranging samples
//!
//! Every (peer, channel) pair owns an independent [`ScalarKalman`]. Distance
//! and bearing are additionally protected by a slew guard: a measurement that
//! jumps too far from the smoothed value only nudges the estimate instead of
//! running the full filter step. Direction axes are smoothed individually and
//! the bearing is derived from the smoothed horizontal components.

pub mod kalman;

pub use kalman::ScalarKalman;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{FilterSettings, NoiseTuning};
use crate::identity::PeerId;
use crate::ranging::RawSample;

/// Smoothed, UI-ready ranging estimate for one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredEstimate {
    /// Meters
    pub distance: Option<f64>,
    /// Smoothed direction vector (x right, y up, z toward the viewer)
    pub direction: Option<[f64; 3]>,
    /// Degrees in (-180, 180]
    pub bearing_degrees: Option<f64>,
    pub last_update: DateTime<Utc>,
}

/// Independent filter channels per peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterChannel {
    Distance,
    DirectionX,
    DirectionY,
    DirectionZ,
    Bearing,
}

#[derive(Debug, Clone, Copy)]
enum JumpRule {
    /// Suspect when the change exceeds this fraction of the smoothed value
    Relative(f64),
    /// Suspect when the change exceeds this absolute amount
    Absolute(f64),
}

#[derive(Debug, Clone)]
struct SlewGuard {
    rule: JumpRule,
    nudge: f64,
}

/// One channel: estimator, optional slew guard, optional angular wrapping
#[derive(Debug, Clone)]
struct ChannelFilter {
    kalman: ScalarKalman,
    guard: Option<SlewGuard>,
    angular: bool,
}

impl ChannelFilter {
    fn update(&mut self, raw: f64) -> f64 {
        if !self.kalman.is_initialized() {
            let seed = if self.angular { normalize_degrees(raw) } else { raw };
            return self.kalman.seed(seed);
        }

        let current = self.kalman.estimate();
        let residual = if self.angular {
            normalize_degrees(raw - current)
        } else {
            raw - current
        };

        let suspect = self.guard.as_ref().and_then(|guard| {
            let threshold = match guard.rule {
                JumpRule::Relative(ratio) => ratio * current.abs(),
                JumpRule::Absolute(limit) => limit,
            };
            (residual.abs() > threshold).then_some(guard.nudge)
        });

        let mut smoothed = match suspect {
            Some(fraction) => self.kalman.nudge(residual, fraction),
            None => self.kalman.update_residual(residual),
        };

        if self.angular {
            smoothed = normalize_degrees(smoothed);
            self.kalman.set_estimate(smoothed);
        }

        smoothed
    }
}

/// Filter bank for all peers.
///
/// Owned by the ranging session manager; it is the only writer.
#[derive(Debug)]
pub struct SignalFilter {
    settings: FilterSettings,
    channels: HashMap<(PeerId, FilterChannel), ChannelFilter>,
    estimates: HashMap<PeerId, FilteredEstimate>,
}

impl SignalFilter {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            settings,
            channels: HashMap::new(),
            estimates: HashMap::new(),
        }
    }

    /// Feed one raw value into the (peer, channel) filter and return the smoothed value
    pub fn update(&mut self, peer: &PeerId, channel: FilterChannel, raw: f64) -> f64 {
        let settings = &self.settings;
        self.channels
            .entry((peer.clone(), channel))
            .or_insert_with(|| new_channel(settings, channel))
            .update(raw)
    }

    /// Smooth a raw engine sample into the peer's estimate.
    ///
    /// Returns `None` when the sample carries neither distance nor direction.
    pub fn process_sample(
        &mut self,
        peer: &PeerId,
        sample: &RawSample,
        timestamp: DateTime<Utc>,
    ) -> Option<FilteredEstimate> {
        let distance = sample
            .distance
            .filter(|d| d.is_finite())
            .map(|d| self.update(peer, FilterChannel::Distance, d.max(0.0)).max(0.0));

        let direction = sample
            .direction
            .filter(|v| v.iter().all(|c| c.is_finite()))
            .map(|[x, y, z]| {
                [
                    self.update(peer, FilterChannel::DirectionX, x),
                    self.update(peer, FilterChannel::DirectionY, y),
                    self.update(peer, FilterChannel::DirectionZ, z),
                ]
            });

        if distance.is_none() && direction.is_none() {
            return None;
        }

        let bearing = direction.map(|[x, _, z]| {
            let raw = bearing_from_direction(x, z);
            self.update(peer, FilterChannel::Bearing, raw)
        });

        let estimate = match self.estimates.get(peer) {
            Some(previous) => FilteredEstimate {
                distance: distance.or(previous.distance),
                direction: direction.or(previous.direction),
                bearing_degrees: bearing.or(previous.bearing_degrees),
                last_update: timestamp.max(previous.last_update),
            },
            None => FilteredEstimate {
                distance,
                direction,
                bearing_degrees: bearing,
                last_update: timestamp,
            },
        };

        self.estimates.insert(peer.clone(), estimate.clone());
        Some(estimate)
    }

    /// Latest estimate for a peer
    pub fn estimate(&self, peer: &PeerId) -> Option<&FilteredEstimate> {
        self.estimates.get(peer)
    }

    /// Forget everything about a peer; the next sample starts fresh
    pub fn reset(&mut self, peer: &PeerId) {
        self.channels.retain(|(p, _), _| p != peer);
        self.estimates.remove(peer);
    }
}

fn new_channel(settings: &FilterSettings, channel: FilterChannel) -> ChannelFilter {
    let (tuning, guard, angular): (NoiseTuning, Option<SlewGuard>, bool) = match channel {
        FilterChannel::Distance => (
            settings.distance,
            Some(SlewGuard {
                rule: JumpRule::Relative(settings.distance_jump_ratio),
                nudge: settings.distance_nudge,
            }),
            false,
        ),
        FilterChannel::DirectionX | FilterChannel::DirectionY | FilterChannel::DirectionZ => {
            (settings.direction, None, false)
        }
        FilterChannel::Bearing => (
            settings.bearing,
            Some(SlewGuard {
                rule: JumpRule::Absolute(settings.bearing_jump_degrees),
                nudge: settings.bearing_nudge,
            }),
            true,
        ),
    };

    ChannelFilter {
        kalman: ScalarKalman::new(tuning),
        guard,
        angular,
    }
}

/// Bearing of a direction vector's horizontal components, degrees in (-180, 180].
///
/// 0 is straight ahead (-z), positive to the right (+x).
pub fn bearing_from_direction(x: f64, z: f64) -> f64 {
    normalize_degrees(x.atan2(-z).to_degrees())
}

/// Map any angle into (-180, 180]
pub fn normalize_degrees(angle: f64) -> f64 {
    let mut wrapped = angle % 360.0;
    if wrapped <= -180.0 {
        wrapped += 360.0;
    } else if wrapped > 180.0 {
        wrapped -= 360.0;
    }
    wrapped
}
