//! Phase durations and the cumulative timeline of a match.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// The configurable length of each match phase, in seconds. Thresholds are
/// cumulative sums measured from the start of the warmup.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MatchTiming {
    pub warmup_duration_sec: u32,
    pub auto_duration_sec: u32,
    pub pause_duration_sec: u32,
    pub teleop_duration_sec: u32,
    pub endgame_time_left_sec: u32,
}

impl Default for MatchTiming {
    fn default() -> MatchTiming {
        MatchTiming {
            warmup_duration_sec: 0,
            auto_duration_sec: 15,
            pause_duration_sec: 3,
            teleop_duration_sec: 135,
            endgame_time_left_sec: 30,
        }
    }
}

impl MatchTiming {
    /// Seconds from match start at which the autonomous period begins.
    pub fn warmup_end_sec(&self) -> f64 {
        self.warmup_duration_sec as f64
    }

    /// Seconds from match start at which the pause begins.
    pub fn auto_end_sec(&self) -> f64 {
        (self.warmup_duration_sec + self.auto_duration_sec) as f64
    }

    /// Seconds from match start at which teleop begins.
    pub fn pause_end_sec(&self) -> f64 {
        (self.warmup_duration_sec + self.auto_duration_sec + self.pause_duration_sec) as f64
    }

    /// Seconds from match start at which the endgame begins.
    pub fn endgame_start_sec(&self) -> f64 {
        self.pause_end_sec() + (self.teleop_duration_sec - self.endgame_time_left_sec) as f64
    }

    /// Seconds from match start at which the match ends.
    pub fn match_end_sec(&self) -> f64 {
        self.pause_end_sec() + self.teleop_duration_sec as f64
    }

    /// The instant teleop scoring starts accruing from.
    pub fn teleop_start_time(&self, match_start: Instant) -> Instant {
        match_start
            + Duration::from_secs(
                (self.warmup_duration_sec + self.auto_duration_sec + self.pause_duration_sec)
                    as u64,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_cumulative() {
        let timing = MatchTiming {
            warmup_duration_sec: 5,
            auto_duration_sec: 15,
            pause_duration_sec: 3,
            teleop_duration_sec: 135,
            endgame_time_left_sec: 30,
        };
        assert_eq!(timing.warmup_end_sec(), 5.0);
        assert_eq!(timing.auto_end_sec(), 20.0);
        assert_eq!(timing.pause_end_sec(), 23.0);
        assert_eq!(timing.endgame_start_sec(), 128.0);
        assert_eq!(timing.match_end_sec(), 158.0);
    }

    #[test]
    fn teleop_starts_after_the_pause() {
        let timing = MatchTiming::default();
        let start = Instant::now();
        assert_eq!(
            timing.teleop_start_time(start),
            start + Duration::from_secs(18)
        );
    }
}
