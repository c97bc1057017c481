//! Realtime score bookkeeping for one alliance.

use serde::{Deserialize, Serialize};

/// Points one vaulted cube is worth.
const VAULT_CUBE_POINTS: i64 = 5;
/// Points credited for each foul committed by the opposing alliance.
const FOUL_POINTS: i64 = 25;

/// The live score snapshot for one alliance. Structural equality decides
/// whether a tick publishes a score update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub auto_ownership_points: i64,
    pub teleop_ownership_points: i64,
    pub fouls: u32,
    pub force_cubes: u8,
    pub force_played: bool,
    pub levitate_cubes: u8,
    pub levitate_played: bool,
    pub boost_cubes: u8,
    pub boost_played: bool,
}

/// Totals derived from a score snapshot, as shown to audiences.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScoreSummary {
    pub auto_points: i64,
    pub ownership_points: i64,
    pub vault_points: i64,
    pub foul_points: i64,
    pub score: i64,
}

impl Score {
    /// Folds the snapshot into display totals. Fouls committed by the
    /// opponent credit this alliance.
    pub fn summarize(&self, opponent_fouls: u32) -> ScoreSummary {
        let ownership_points = self.auto_ownership_points + self.teleop_ownership_points;
        let vault_points =
            VAULT_CUBE_POINTS * (self.force_cubes + self.levitate_cubes + self.boost_cubes) as i64;
        let foul_points = FOUL_POINTS * opponent_fouls as i64;
        ScoreSummary {
            auto_points: self.auto_ownership_points,
            ownership_points,
            vault_points,
            foul_points,
            score: ownership_points + vault_points + foul_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_totals() {
        let score = Score {
            auto_ownership_points: 20,
            teleop_ownership_points: 95,
            force_cubes: 2,
            force_played: true,
            levitate_cubes: 3,
            levitate_played: true,
            boost_cubes: 1,
            ..Score::default()
        };
        let summary = score.summarize(2);
        assert_eq!(summary.auto_points, 20);
        assert_eq!(summary.ownership_points, 115);
        assert_eq!(summary.vault_points, 30);
        assert_eq!(summary.foul_points, 50);
        assert_eq!(summary.score, 195);
    }

    #[test]
    fn equality_is_field_wise() {
        let a = Score::default();
        let mut b = Score::default();
        assert_eq!(a, b);
        b.boost_played = true;
        assert_ne!(a, b);
    }
}
