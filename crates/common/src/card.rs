//! Deterministic 5x5 cards and punch sets.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Ball, FREE_CELL, GRID_CELLS};

/// Numbers per column, B through O.
const COLUMN_RANGES: [(Ball, Ball); 5] = [(1, 15), (16, 30), (31, 45), (46, 60), (61, 75)];

/// A row-major 5x5 card. The center cell is free and holds no number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Card([Option<Ball>; GRID_CELLS]);

impl Card {
    /// Generate the card for `seed`. The same seed always yields the same card.
    pub fn generate(seed: &str) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(seed.as_bytes()));
        let mut rng = StdRng::from_seed(digest);
        let mut cells = [None; GRID_CELLS];

        for (column, (start, end)) in COLUMN_RANGES.iter().enumerate() {
            let mut pool: Vec<Ball> = (*start..=*end).collect();
            pool.shuffle(&mut rng);
            for (row, number) in pool.into_iter().take(5).enumerate() {
                cells[row * 5 + column] = Some(number);
            }
        }
        cells[FREE_CELL] = None;

        Card(cells)
    }

    /// Seed for a player's card: one card per room, client and card version.
    pub fn seed_for(room_id: &str, client_id: &str, card_version: u32) -> String {
        format!("{room_id}:{client_id}:{card_version}")
    }

    pub fn for_player(room_id: &str, client_id: &str, card_version: u32) -> Self {
        Self::generate(&Self::seed_for(room_id, client_id, card_version))
    }

    pub fn from_cells(cells: [Option<Ball>; GRID_CELLS]) -> Self {
        Card(cells)
    }

    pub fn number(&self, index: usize) -> Option<Ball> {
        self.0.get(index).copied().flatten()
    }

    pub fn cells(&self) -> &[Option<Ball>; GRID_CELLS] {
        &self.0
    }
}

/// Set of punched cells as a 25-bit mask.
///
/// Serialized as the sorted list of punched indexes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(from = "Vec<usize>", into = "Vec<usize>")]
pub struct PunchSet(u32);

const GRID_MASK: u32 = (1u32 << GRID_CELLS) - 1;

impl PunchSet {
    pub const EMPTY: PunchSet = PunchSet(0);

    /// A fresh card: only the free center is covered.
    pub fn with_free() -> Self {
        PunchSet(1u32 << FREE_CELL)
    }

    pub fn from_mask(mask: u32) -> Self {
        PunchSet(mask & GRID_MASK)
    }

    pub fn mask(self) -> u32 {
        self.0
    }

    pub fn contains(self, index: usize) -> bool {
        index < GRID_CELLS && self.0 & (1u32 << index) != 0
    }

    pub fn insert(&mut self, index: usize) {
        if index < GRID_CELLS {
            self.0 |= 1u32 << index;
        }
    }

    pub fn remove(&mut self, index: usize) {
        if index < GRID_CELLS {
            self.0 &= !(1u32 << index);
        }
    }

    /// Flip a cell. The free center never un-punches.
    pub fn toggle(&mut self, index: usize) {
        if index == FREE_CELL {
            self.insert(index);
        } else if self.contains(index) {
            self.remove(index);
        } else {
            self.insert(index);
        }
    }

    pub fn indexes(self) -> impl Iterator<Item = usize> {
        (0..GRID_CELLS).filter(move |i| self.contains(*i))
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Cells as the per-cell boolean vector used by device storage.
    pub fn to_flags(self) -> Vec<bool> {
        (0..GRID_CELLS).map(|i| self.contains(i)).collect()
    }

    /// Parse a boolean vector; anything that is not exactly one flag per cell
    /// is rejected.
    pub fn from_flags(flags: &[bool]) -> Option<Self> {
        if flags.len() != GRID_CELLS {
            return None;
        }
        let mut set = PunchSet::EMPTY;
        for (index, punched) in flags.iter().enumerate() {
            if *punched {
                set.insert(index);
            }
        }
        Some(set)
    }
}

impl From<Vec<usize>> for PunchSet {
    fn from(indexes: Vec<usize>) -> Self {
        indexes.into_iter().collect()
    }
}

impl From<PunchSet> for Vec<usize> {
    fn from(set: PunchSet) -> Self {
        set.indexes().collect()
    }
}

impl FromIterator<usize> for PunchSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = PunchSet::EMPTY;
        for index in iter {
            set.insert(index);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_card() {
        let a = Card::for_player("abc123", "client-1", 1);
        let b = Card::for_player("abc123", "client-1", 1);
        let c = Card::for_player("abc123", "client-1", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn columns_respect_bingo_ranges() {
        let card = Card::generate("room:client:1");
        assert_eq!(card.number(FREE_CELL), None);
        for index in 0..GRID_CELLS {
            if index == FREE_CELL {
                continue;
            }
            let (start, end) = COLUMN_RANGES[index % 5];
            let number = card.number(index).unwrap();
            assert!((start..=end).contains(&number), "cell {index} = {number}");
        }
        let mut numbers: Vec<Ball> = card.cells().iter().flatten().copied().collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), GRID_CELLS - 1);
    }

    #[test]
    fn free_cell_cannot_be_unpunched() {
        let mut punched = PunchSet::with_free();
        punched.toggle(FREE_CELL);
        assert!(punched.contains(FREE_CELL));
        punched.toggle(3);
        assert!(punched.contains(3));
        punched.toggle(3);
        assert!(!punched.contains(3));
    }

    #[test]
    fn punch_set_serializes_as_indexes() {
        let punched: PunchSet = vec![12, 0, 4, 99].into();
        assert_eq!(serde_json::to_string(&punched).unwrap(), "[0,4,12]");
        let back: PunchSet = serde_json::from_str("[4,0,12]").unwrap();
        assert_eq!(back, punched);
    }

    #[test]
    fn flags_must_cover_every_cell() {
        assert!(PunchSet::from_flags(&[true; 3]).is_none());
        let flags = PunchSet::with_free().to_flags();
        assert_eq!(PunchSet::from_flags(&flags), Some(PunchSet::with_free()));
    }
}
