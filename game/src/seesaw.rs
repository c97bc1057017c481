//! Scoring timeline for one scale or switch element.
//!
//! Two plate sensors report which end of the element is down. Every change of
//! the resulting owner opens or closes an [`Ownership`] interval, and the
//! score queries clip those intervals against a phase window, doubling any
//! overlap with an applicable boost power up.

use std::time::Instant;

use crate::Alliance;
use crate::power_up::{PowerUpEffect, PowerUpRegistry};

/// A scale or alliance switch. A red or blue kind marks the alliance switch;
/// `Neither` marks the scale.
pub struct Seesaw {
    pub kind: Alliance,
    near_is_red: bool,
    ownerships: Vec<Ownership>,
}

/// One contiguous interval during which a single alliance held the seesaw.
struct Ownership {
    owned_by: Alliance,
    window: OwnershipWindow,
}

/// The time span of an ownership. An open window belongs to whoever holds
/// the seesaw right now; only the last ownership can be open.
enum OwnershipWindow {
    Open { start: Instant },
    Closed { start: Instant, end: Instant },
}

impl Seesaw {
    pub fn new(kind: Alliance) -> Seesaw {
        Seesaw {
            kind,
            near_is_red: true,
            ownerships: Vec::new(),
        }
    }

    /// Sets which side of the element belongs to which alliance. True means
    /// the plate nearest the scoring table is red. Must be set before sensor
    /// readings are fed in.
    pub fn set_sidedness(&mut self, near_is_red: bool) {
        self.near_is_red = near_is_red;
    }

    /// Feeds one `[near, far]` plate reading into the timeline.
    pub fn update_state(&mut self, sensors: [bool; 2], power_ups: &PowerUpRegistry, now: Instant) {
        // An applicable force power up grants ownership regardless of the
        // plates.
        let force = power_ups
            .active_power_up(now)
            .filter(|p| p.effect == PowerUpEffect::Force && p.applies_to(self.kind));
        let owned_by = match force {
            Some(power_up) => power_up.alliance,
            None => self.alliance_from_sensors(sensors),
        };

        if owned_by == self.owned_by() {
            return;
        }
        if let Some(last) = self.ownerships.last_mut() {
            if let OwnershipWindow::Open { start } = last.window {
                last.window = OwnershipWindow::Closed { start, end: now };
            }
        }
        if owned_by != Alliance::Neither {
            self.ownerships.push(Ownership {
                owned_by,
                window: OwnershipWindow::Open { start: now },
            });
        }
    }

    /// The alliance currently holding the seesaw.
    pub fn owned_by(&self) -> Alliance {
        match self.ownerships.last() {
            Some(ownership) if matches!(ownership.window, OwnershipWindow::Open { .. }) => {
                ownership.owned_by
            }
            _ => Alliance::Neither,
        }
    }

    /// Seconds red held this seesaw within `[start, end]`, with seconds under
    /// an applicable red boost counted twice.
    pub fn red_seconds(&self, power_ups: &PowerUpRegistry, start: Instant, end: Instant) -> f64 {
        self.alliance_seconds(Alliance::Red, power_ups, start, end)
    }

    /// Seconds blue held this seesaw within `[start, end]`, with seconds
    /// under an applicable blue boost counted twice.
    pub fn blue_seconds(&self, power_ups: &PowerUpRegistry, start: Instant, end: Instant) -> f64 {
        self.alliance_seconds(Alliance::Blue, power_ups, start, end)
    }

    fn alliance_seconds(
        &self,
        owned_by: Alliance,
        power_ups: &PowerUpRegistry,
        start: Instant,
        end: Instant,
    ) -> f64 {
        self.ownerships
            .iter()
            .filter(|ownership| ownership.owned_by == owned_by)
            .map(|ownership| self.ownership_seconds(ownership, power_ups, start, end))
            .sum()
    }

    /// The scoring value of one ownership clipped to `[start, end]`.
    fn ownership_seconds(
        &self,
        ownership: &Ownership,
        power_ups: &PowerUpRegistry,
        start: Instant,
        end: Instant,
    ) -> f64 {
        let (owned_start, owned_end) = match ownership.window {
            OwnershipWindow::Open { start } => (start, end),
            OwnershipWindow::Closed { start, end: closed } => (start, closed),
        };
        let clipped_start = owned_start.max(start);
        let clipped_end = owned_end.min(end);
        if clipped_start >= clipped_end {
            return 0.0;
        }
        let mut seconds = (clipped_end - clipped_start).as_secs_f64();

        // Count the overlap with an applicable boost a second time.
        if let Some(boost) = power_ups.boost_for(self.kind, ownership.owned_by) {
            let boost_start = boost.start_time.max(clipped_start);
            let boost_end = boost.end_time().min(clipped_end);
            if boost_end > boost_start {
                seconds += (boost_end - boost_start).as_secs_f64();
            }
        }
        seconds
    }

    /// Maps a plate reading onto the owning alliance. A balanced element, or
    /// one with both plates down, is owned by neither.
    fn alliance_from_sensors(&self, sensors: [bool; 2]) -> Alliance {
        let [near, far] = sensors;
        if near == far {
            return Alliance::Neither;
        }
        if near == self.near_is_red {
            Alliance::Red
        } else {
            Alliance::Blue
        }
    }
}
