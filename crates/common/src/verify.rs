//! Win verification.
//!
//! The same predicate gates the player's claim button and is re-run by the
//! host on every incoming claim.

use thiserror::Error;

use crate::card::{Card, PunchSet};
use crate::pattern::{is_free, required_cells, PatternId};
use crate::{Ball, MAX_BALL};

/// Why a set of punched cells does not make a win.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    #[error("no pattern selected")]
    NoPattern,

    #[error("pattern not complete")]
    PatternIncomplete,

    #[error("invalid punched cell detected")]
    InvalidPunch,
}

/// Check that `punched` completes the active pattern on `card` and that every
/// punched number was actually called.
///
/// The center cell is exempt from both passes.
pub fn verify(
    card: &Card,
    punched: PunchSet,
    drawn: &[Ball],
    pattern: Option<PatternId>,
    custom: Option<&[usize]>,
) -> Result<(), ClaimRejection> {
    let required = required_cells(pattern, custom);
    if required.is_empty() {
        return Err(ClaimRejection::NoPattern);
    }

    if required
        .iter()
        .any(|index| !is_free(*index) && !punched.contains(*index))
    {
        return Err(ClaimRejection::PatternIncomplete);
    }

    let called = DrawnMask::from_balls(drawn);
    for index in punched.indexes().filter(|i| !is_free(*i)) {
        match card.number(index) {
            Some(number) if called.contains(number) => {}
            _ => return Err(ClaimRejection::InvalidPunch),
        }
    }

    Ok(())
}

/// Membership bitmap over 1..=75.
#[derive(Debug, Clone, Copy, Default)]
struct DrawnMask(u128);

impl DrawnMask {
    fn from_balls(balls: &[Ball]) -> Self {
        let mut mask = 0u128;
        for ball in balls.iter().filter(|b| (1..=MAX_BALL).contains(*b)) {
            mask |= 1u128 << ball;
        }
        DrawnMask(mask)
    }

    fn contains(self, ball: Ball) -> bool {
        ball <= MAX_BALL && self.0 & (1u128 << ball) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FREE_CELL;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn card() -> Card {
        Card::generate("verify-fixture")
    }

    fn numbers_at(card: &Card, indexes: &[usize]) -> Vec<Ball> {
        indexes.iter().filter_map(|i| card.number(*i)).collect()
    }

    #[test]
    fn missing_pattern_is_rejected() {
        let card = card();
        let result = verify(&card, PunchSet::with_free(), &[], None, None);
        assert_eq!(result, Err(ClaimRejection::NoPattern));
        let result = verify(&card, PunchSet::with_free(), &[], Some(PatternId::None), None);
        assert_eq!(result, Err(ClaimRejection::NoPattern));
        let result = verify(&card, PunchSet::with_free(), &[], Some(PatternId::Custom), Some(&[][..]));
        assert_eq!(result, Err(ClaimRejection::NoPattern));
    }

    #[test]
    fn horizontal_with_uncalled_middle_is_incomplete() {
        let card = card();
        let row = [0, 1, 3, 4];
        let drawn = numbers_at(&card, &row);
        let punched: PunchSet = row.iter().copied().chain([FREE_CELL]).collect();

        let result = verify(&card, punched, &drawn, Some(PatternId::Horizontal), None);
        assert_eq!(result.unwrap_err().to_string(), "pattern not complete");
    }

    #[test]
    fn extra_uncalled_punch_is_invalid() {
        let card = card();
        let row = [0, 1, 2, 3, 4];
        let drawn = numbers_at(&card, &row);
        let punched: PunchSet = row.iter().copied().chain([FREE_CELL, 10]).collect();

        let result = verify(&card, punched, &drawn, Some(PatternId::Horizontal), None);
        assert_eq!(result.unwrap_err().to_string(), "invalid punched cell detected");

        let honest: PunchSet = row.iter().copied().chain([FREE_CELL]).collect();
        assert!(verify(&card, honest, &drawn, Some(PatternId::Horizontal), None).is_ok());
    }

    #[test]
    fn free_center_counts_toward_diagonals() {
        let card = card();
        let cells = [0, 6, 18, 24];
        let drawn = numbers_at(&card, &cells);
        let punched: PunchSet = cells.iter().copied().collect();
        assert!(verify(&card, punched, &drawn, Some(PatternId::Diagonal1), None).is_ok());
    }

    #[test]
    fn custom_pattern_uses_snapshot_cells() {
        let card = card();
        let custom = [7, 17];
        let drawn = numbers_at(&card, &custom);
        let punched: PunchSet = custom.iter().copied().collect();
        assert!(verify(&card, punched, &drawn, Some(PatternId::Custom), Some(&custom[..])).is_ok());
        assert_eq!(
            verify(&card, PunchSet::EMPTY, &drawn, Some(PatternId::Custom), Some(&custom[..])),
            Err(ClaimRejection::PatternIncomplete)
        );
    }

    #[test]
    fn forged_card_with_blank_cell_is_invalid() {
        let mut cells = *card().cells();
        cells[3] = None;
        let forged = Card::from_cells(cells);
        let drawn = numbers_at(&forged, &[0, 1, 2, 4]);
        let punched: PunchSet = [0, 1, 2, 3, 4].into_iter().collect();
        assert_eq!(
            verify(&forged, punched, &drawn, Some(PatternId::Horizontal), None),
            Err(ClaimRejection::InvalidPunch)
        );
    }

    /// Reference predicate: valid iff every required non-center cell is
    /// punched and every punched non-center cell was called.
    fn oracle(card: &Card, punched: PunchSet, drawn: &[Ball], required: &[usize]) -> bool {
        let complete = required
            .iter()
            .all(|i| *i == FREE_CELL || punched.contains(*i));
        let honest = punched
            .indexes()
            .filter(|i| *i != FREE_CELL)
            .all(|i| card.number(i).is_some_and(|n| drawn.contains(&n)));
        complete && honest
    }

    #[test]
    fn matches_oracle_over_enumerated_punches() {
        let card = card();
        let pattern = PatternId::Horizontal;
        // Row 0 plus cells 5..=9, of which 5 and 7 are called.
        let cells: Vec<usize> = (0..10).collect();
        let drawn = numbers_at(&card, &[0, 1, 2, 3, 4, 5, 7]);

        for bits in 0u32..(1u32 << cells.len()) {
            let punched: PunchSet = cells
                .iter()
                .filter(|i| bits & (1u32 << **i) != 0)
                .copied()
                .chain([FREE_CELL])
                .collect();
            let expected = oracle(&card, punched, &drawn, pattern.indexes());
            let actual = verify(&card, punched, &drawn, Some(pattern), None).is_ok();
            assert_eq!(actual, expected, "punch mask {:#b}", punched.mask());
        }
    }

    #[test]
    fn matches_oracle_over_random_punch_space() {
        let card = card();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..20_000 {
            let drawn: Vec<Ball> = (1..=MAX_BALL).filter(|_| rng.random_bool(0.6)).collect();
            let punched = PunchSet::from_mask(rng.random::<u32>());
            for pattern in [PatternId::Horizontal, PatternId::X, PatternId::AroundTheWorld] {
                let expected = oracle(&card, punched, &drawn, pattern.indexes());
                let actual = verify(&card, punched, &drawn, Some(pattern), None).is_ok();
                assert_eq!(actual, expected, "{pattern} mask {:#b}", punched.mask());
            }
        }
    }
}
