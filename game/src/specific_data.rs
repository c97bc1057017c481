//! The near-side assignment pair revealed at match start.
//!
//! Two characters over {'L', 'R'}: index 0 is the switch near side, index 1
//! the scale near side. 'L' puts the red plate nearest the scoring table.

use rand::Rng;

/// Draws a fresh assignment for the switches and the scale.
pub fn generate_game_specific_data() -> String {
    let mut rng = rand::thread_rng();
    (0..2)
        .map(|_| if rng.r#gen::<bool>() { 'L' } else { 'R' })
        .collect()
}

/// Exactly two characters, each 'L' or 'R'.
pub fn is_valid_game_specific_data(data: &str) -> bool {
    data.len() == 2 && data.chars().all(|c| c == 'L' || c == 'R')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_only_two_plate_letters() {
        assert!(is_valid_game_specific_data("LL"));
        assert!(is_valid_game_specific_data("LR"));
        assert!(is_valid_game_specific_data("RR"));
        assert!(!is_valid_game_specific_data(""));
        assert!(!is_valid_game_specific_data("L"));
        assert!(!is_valid_game_specific_data("LRL"));
        assert!(!is_valid_game_specific_data("LX"));
        assert!(!is_valid_game_specific_data("lr"));
    }

    #[test]
    fn generated_data_is_always_valid() {
        for _ in 0..100 {
            assert!(is_valid_game_specific_data(&generate_game_specific_data()));
        }
    }
}
