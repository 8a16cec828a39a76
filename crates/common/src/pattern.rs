//! Win patterns: named index tables and custom index sets over the 5x5 grid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{FREE_CELL, GRID_CELLS};

/// Identifier of the active win pattern.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PatternId {
    None,
    Horizontal,
    Vertical,
    Diagonal1,
    Diagonal2,
    X,
    Blackout,
    AroundTheWorld,
    Custom,
}

const HORIZONTAL: [usize; 5] = [0, 1, 2, 3, 4];
const VERTICAL: [usize; 5] = [0, 5, 10, 15, 20];
const DIAGONAL_1: [usize; 5] = [0, 6, 12, 18, 24];
const DIAGONAL_2: [usize; 5] = [4, 8, 12, 16, 20];
const X_SHAPE: [usize; 9] = [0, 4, 6, 8, 12, 16, 18, 20, 24];
const BLACKOUT: [usize; GRID_CELLS] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
];
const AROUND_THE_WORLD: [usize; 16] = [0, 1, 2, 3, 4, 9, 14, 19, 24, 23, 22, 21, 20, 15, 10, 5];

impl PatternId {
    /// Every pattern, in menu order.
    pub const ALL: [PatternId; 9] = [
        PatternId::None,
        PatternId::Horizontal,
        PatternId::Vertical,
        PatternId::Diagonal1,
        PatternId::Diagonal2,
        PatternId::X,
        PatternId::Blackout,
        PatternId::AroundTheWorld,
        PatternId::Custom,
    ];

    /// Fixed index table of a named pattern. `None` and `Custom` have no
    /// fixed cells.
    pub fn indexes(self) -> &'static [usize] {
        match self {
            PatternId::None | PatternId::Custom => &[],
            PatternId::Horizontal => &HORIZONTAL,
            PatternId::Vertical => &VERTICAL,
            PatternId::Diagonal1 => &DIAGONAL_1,
            PatternId::Diagonal2 => &DIAGONAL_2,
            PatternId::X => &X_SHAPE,
            PatternId::Blackout => &BLACKOUT,
            PatternId::AroundTheWorld => &AROUND_THE_WORLD,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PatternId::None => "No Pattern",
            PatternId::Horizontal => "Horizontal Line",
            PatternId::Vertical => "Vertical Line",
            PatternId::Diagonal1 => "Diagonal TL-BR",
            PatternId::Diagonal2 => "Diagonal TR-BL",
            PatternId::X => "X Pattern",
            PatternId::Blackout => "Blackout",
            PatternId::AroundTheWorld => "Around the World",
            PatternId::Custom => "Custom",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatternId::None => "none",
            PatternId::Horizontal => "horizontal",
            PatternId::Vertical => "vertical",
            PatternId::Diagonal1 => "diagonal1",
            PatternId::Diagonal2 => "diagonal2",
            PatternId::X => "x",
            PatternId::Blackout => "blackout",
            PatternId::AroundTheWorld => "aroundTheWorld",
            PatternId::Custom => "custom",
        }
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pattern: {0}")]
pub struct UnknownPattern(pub String);

impl FromStr for PatternId {
    type Err = UnknownPattern;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        PatternId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| UnknownPattern(value.to_string()))
    }
}

/// Resolve the cells a win requires.
///
/// An absent pattern, `none`, or an empty custom set all resolve to no cells,
/// which the verifier treats as "no pattern selected".
pub fn required_cells<'a>(pattern: Option<PatternId>, custom: Option<&'a [usize]>) -> &'a [usize] {
    match pattern {
        Some(PatternId::Custom) => custom.unwrap_or(&[]),
        Some(named) => named.indexes(),
        None => &[],
    }
}

/// Sort, dedupe and bound a custom index set.
pub fn normalize_custom(indexes: &[usize]) -> Vec<usize> {
    let mut cells: Vec<usize> = indexes.iter().copied().filter(|i| *i < GRID_CELLS).collect();
    cells.sort_unstable();
    cells.dedup();
    cells
}

/// True when `index` is the always-covered center cell.
pub fn is_free(index: usize) -> bool {
    index == FREE_CELL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_tables_stay_on_the_grid() {
        for pattern in PatternId::ALL {
            assert!(pattern.indexes().iter().all(|i| *i < GRID_CELLS), "{pattern}");
        }
        assert_eq!(PatternId::Blackout.indexes().len(), GRID_CELLS);
        assert_eq!(PatternId::AroundTheWorld.indexes().len(), 16);
    }

    #[test]
    fn wire_names_round_trip_through_from_str() {
        for pattern in PatternId::ALL {
            let json = serde_json::to_string(&pattern).unwrap();
            assert_eq!(json, format!("\"{}\"", pattern.as_str()));
            assert_eq!(pattern.as_str().parse::<PatternId>().unwrap(), pattern);
        }
        assert!("zigzag".parse::<PatternId>().is_err());
    }

    #[test]
    fn required_cells_for_custom_uses_explicit_set() {
        let custom = vec![3, 7];
        assert_eq!(required_cells(Some(PatternId::Custom), Some(custom.as_slice())), &[3, 7]);
        assert!(required_cells(Some(PatternId::Custom), None).is_empty());
        assert!(required_cells(Some(PatternId::None), Some(custom.as_slice())).is_empty());
        assert!(required_cells(None, None).is_empty());
        assert_eq!(required_cells(Some(PatternId::Horizontal), Some(custom.as_slice())), &HORIZONTAL);
    }

    #[test]
    fn normalize_custom_sorts_dedupes_and_bounds() {
        assert_eq!(normalize_custom(&[24, 3, 3, 99, 0]), vec![0, 3, 24]);
    }
}
