//! Time-bounded score modifiers and the per-match ledger of their uses.

use std::time::{Duration, Instant};

use crate::Alliance;

/// How long a played force or boost stays active.
pub const POWER_UP_DURATION: Duration = Duration::from_secs(10);

/// The three cube-funded effects a vault can play.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerUpEffect {
    Force,
    Levitate,
    Boost,
}

impl PowerUpEffect {
    /// Effect name as used in sound cues and display payloads.
    pub fn name(self) -> &'static str {
        match self {
            PowerUpEffect::Force => "force",
            PowerUpEffect::Levitate => "levitate",
            PowerUpEffect::Boost => "boost",
        }
    }
}

/// One played power up with its activation window.
#[derive(Clone, Debug)]
pub struct PowerUp {
    pub alliance: Alliance,
    pub effect: PowerUpEffect,
    pub level: u8,
    pub start_time: Instant,
    pub duration: Duration,
}

impl PowerUp {
    pub fn end_time(&self) -> Instant {
        self.start_time + self.duration
    }

    /// Whether this power up reaches the given seesaw. Level 2 and up covers
    /// the scale; levels 1 and 3 cover the playing alliance's own switch.
    pub fn applies_to(&self, seesaw_kind: Alliance) -> bool {
        if seesaw_kind == Alliance::Neither {
            self.level >= 2
        } else {
            seesaw_kind == self.alliance && (self.level == 1 || self.level == 3)
        }
    }
}

/// Ledger of every power up played during the current match. Owned by the
/// arena and rebuilt on every match load.
#[derive(Default)]
pub struct PowerUpRegistry {
    uses: Vec<PowerUp>,
}

impl PowerUpRegistry {
    pub fn new() -> PowerUpRegistry {
        PowerUpRegistry::default()
    }

    /// The power up whose activation window covers `now`. At most one can
    /// exist because concurrent activations are refused.
    pub fn active_power_up(&self, now: Instant) -> Option<&PowerUp> {
        self.uses
            .iter()
            .find(|p| p.start_time <= now && now < p.end_time())
    }

    /// Records a new activation. Returns false, leaving the ledger untouched,
    /// while any other power up is still active.
    pub fn activate(&mut self, power_up: PowerUp) -> bool {
        if self.active_power_up(power_up.start_time).is_some() {
            return false;
        }
        self.uses.push(power_up);
        true
    }

    /// Clears the ledger for a new match.
    pub fn reset(&mut self) {
        self.uses.clear();
    }

    /// The first played boost that covers the given seesaw while the given
    /// alliance holds it.
    pub fn boost_for(&self, seesaw_kind: Alliance, owned_by: Alliance) -> Option<&PowerUp> {
        self.uses.iter().find(|p| {
            p.effect == PowerUpEffect::Boost && p.alliance == owned_by && p.applies_to(seesaw_kind)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power_up(effect: PowerUpEffect, alliance: Alliance, level: u8, start: Instant) -> PowerUp {
        PowerUp {
            alliance,
            effect,
            level,
            start_time: start,
            duration: POWER_UP_DURATION,
        }
    }

    #[test]
    fn applicability_matrix() {
        let base = Instant::now();
        for level in 1..=3u8 {
            let red = power_up(PowerUpEffect::Force, Alliance::Red, level, base);
            assert_eq!(red.applies_to(Alliance::Neither), level >= 2);
            assert_eq!(red.applies_to(Alliance::Red), level == 1 || level == 3);
            assert!(!red.applies_to(Alliance::Blue));
        }
    }

    #[test]
    fn active_window_is_half_open() {
        let base = Instant::now();
        let mut registry = PowerUpRegistry::new();
        assert!(registry.activate(power_up(PowerUpEffect::Force, Alliance::Red, 1, base)));

        assert!(registry.active_power_up(base).is_some());
        assert!(
            registry
                .active_power_up(base + Duration::from_secs(9))
                .is_some()
        );
        assert!(
            registry
                .active_power_up(base + POWER_UP_DURATION)
                .is_none()
        );
    }

    #[test]
    fn concurrent_activation_is_refused() {
        let base = Instant::now();
        let mut registry = PowerUpRegistry::new();
        assert!(registry.activate(power_up(PowerUpEffect::Force, Alliance::Red, 1, base)));
        assert!(!registry.activate(power_up(
            PowerUpEffect::Boost,
            Alliance::Blue,
            2,
            base + Duration::from_secs(5)
        )));

        // Once the first window has lapsed a new activation goes through.
        assert!(registry.activate(power_up(
            PowerUpEffect::Boost,
            Alliance::Blue,
            2,
            base + Duration::from_secs(11)
        )));
    }

    #[test]
    fn boost_lookup_filters_by_alliance_and_seesaw() {
        let base = Instant::now();
        let mut registry = PowerUpRegistry::new();
        assert!(registry.activate(power_up(PowerUpEffect::Boost, Alliance::Red, 2, base)));

        assert!(registry.boost_for(Alliance::Neither, Alliance::Red).is_some());
        assert!(registry.boost_for(Alliance::Neither, Alliance::Blue).is_none());
        // A level 2 boost does not reach the switches.
        assert!(registry.boost_for(Alliance::Red, Alliance::Red).is_none());
    }

    #[test]
    fn reset_clears_the_ledger() {
        let base = Instant::now();
        let mut registry = PowerUpRegistry::new();
        registry.activate(power_up(PowerUpEffect::Force, Alliance::Red, 1, base));
        registry.reset();
        assert!(registry.active_power_up(base).is_none());
    }
}
