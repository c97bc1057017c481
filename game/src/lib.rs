//! Match-play rules shared between the field server and its tooling.
//! It covers:
//! - [`Seesaw`]: the ownership timeline of a scale or switch element
//! - [`PowerUpRegistry`]: the ledger of played force/levitate/boost effects
//! - [`Vault`]: cube inventory and button-triggered power up plays
//! - [`Score`]: the realtime score snapshot and its display summary
//! - [`MatchTiming`]: phase durations and the cumulative match timeline
//!
//! Everything in here is pure state driven by sensor readings and the
//! current time; all I/O lives in the server crate.

pub mod power_up;
pub mod score;
pub mod seesaw;
pub mod specific_data;
pub mod timing;
pub mod vault;

pub use power_up::{PowerUp, PowerUpEffect, PowerUpRegistry};
pub use score::{Score, ScoreSummary};
pub use seesaw::Seesaw;
pub use specific_data::{generate_game_specific_data, is_valid_game_specific_data};
pub use timing::MatchTiming;
pub use vault::Vault;

use serde::{Deserialize, Serialize};

/// The side a station, seesaw or power up belongs to. `Neither` marks
/// neutral things such as the scale or a balanced element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alliance {
    Neither,
    Red,
    Blue,
}
