//! Per-alliance vault: cube inventory and the pushbuttons that play power
//! ups.

use std::time::Instant;

use crate::Alliance;
use crate::power_up::{POWER_UP_DURATION, PowerUp, PowerUpEffect, PowerUpRegistry};

/// Millimeters one cube takes off a column's ultrasonic reading.
const CUBE_HEIGHT_MM: u16 = 280;
/// Ultrasonic reading of an empty vault column.
const EMPTY_COLUMN_MM: u16 = 900;

/// The cube columns and buttons on one alliance's vault.
pub struct Vault {
    pub alliance: Alliance,
    pub force_cubes: u8,
    pub levitate_cubes: u8,
    pub boost_cubes: u8,
    pub force_power_up: Option<PowerUp>,
    pub boost_power_up: Option<PowerUp>,
    pub levitate_played: bool,
    last_buttons: [bool; 3],
    newly_played: Option<PowerUpEffect>,
}

impl Vault {
    pub fn new(alliance: Alliance) -> Vault {
        Vault {
            alliance,
            force_cubes: 0,
            levitate_cubes: 0,
            boost_cubes: 0,
            force_power_up: None,
            boost_power_up: None,
            levitate_played: false,
            last_buttons: [false; 3],
            newly_played: None,
        }
    }

    /// Converts an ultrasonic distance down to the top of a cube stack into a
    /// cube count.
    pub fn cube_count_from_distance(distance_mm: u16) -> u8 {
        let filled = EMPTY_COLUMN_MM.saturating_sub(distance_mm);
        (((filled + CUBE_HEIGHT_MM / 2) / CUBE_HEIGHT_MM).min(3)) as u8
    }

    /// Sets the cube inventory as read from the field.
    pub fn update_cubes(&mut self, force: u8, levitate: u8, boost: u8) {
        self.force_cubes = force.min(3);
        self.levitate_cubes = levitate.min(3);
        self.boost_cubes = boost.min(3);
    }

    /// Feeds the three pushbutton states in. A rising edge on a button whose
    /// column holds cubes plays the effect at a level equal to the cube
    /// count, unless that effect was already played this match or another
    /// power up is still active.
    pub fn update_buttons(
        &mut self,
        power_ups: &mut PowerUpRegistry,
        force: bool,
        levitate: bool,
        boost: bool,
        now: Instant,
    ) {
        let buttons = [force, levitate, boost];
        let rising = [
            force && !self.last_buttons[0],
            levitate && !self.last_buttons[1],
            boost && !self.last_buttons[2],
        ];
        self.last_buttons = buttons;

        if rising[0] && self.force_cubes > 0 && self.force_power_up.is_none() {
            let power_up = self.build_power_up(PowerUpEffect::Force, self.force_cubes, now);
            if power_ups.activate(power_up.clone()) {
                self.force_power_up = Some(power_up);
                self.newly_played = Some(PowerUpEffect::Force);
            }
        }
        if rising[1] && self.levitate_cubes > 0 && !self.levitate_played {
            // Levitate is scored directly and holds no activation window, but
            // it still may not be played over another active power up.
            if power_ups.active_power_up(now).is_none() {
                self.levitate_played = true;
                self.newly_played = Some(PowerUpEffect::Levitate);
            }
        }
        if rising[2] && self.boost_cubes > 0 && self.boost_power_up.is_none() {
            let power_up = self.build_power_up(PowerUpEffect::Boost, self.boost_cubes, now);
            if power_ups.activate(power_up.clone()) {
                self.boost_power_up = Some(power_up);
                self.newly_played = Some(PowerUpEffect::Boost);
            }
        }
    }

    /// The effect played since the last call, reported once.
    pub fn check_for_newly_played_power_up(&mut self) -> Option<PowerUpEffect> {
        self.newly_played.take()
    }

    fn build_power_up(&self, effect: PowerUpEffect, level: u8, now: Instant) -> PowerUp {
        PowerUp {
            alliance: self.alliance,
            effect,
            level,
            start_time: now,
            duration: POWER_UP_DURATION,
        }
    }
}
