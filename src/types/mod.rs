//! Core data types of the pair store

mod coordinates;
mod permutation;

pub use coordinates::{CoordinateSet, Coordinates};
pub use permutation::{Permutation, NUM_PERMUTATIONS};

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// One stored fact column pair `(t1, t2)`
pub type Pair = (i64, i64);

/// Physical layout of one binary pair table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Strategy {
    /// Row-major, one (t1, t2) record per pair
    Row,
    /// Fixed-width t1 block, pointer/count block, t2 block
    Column,
    /// Variable-length groups: t1 once, then a run of t2
    Cluster,
    /// Column with per-group byte width and offsets
    NewColumn,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Row,
        Strategy::Column,
        Strategy::Cluster,
        Strategy::NewColumn,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            Strategy::Row => 0,
            Strategy::Column => 1,
            Strategy::Cluster => 2,
            Strategy::NewColumn => 3,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Strategy::Row),
            1 => Ok(Strategy::Column),
            2 => Ok(Strategy::Cluster),
            3 => Ok(Strategy::NewColumn),
            other => Err(StorageError::Corruption(format!(
                "Unknown table strategy tag {}",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Row => "row",
            Strategy::Column => "column",
            Strategy::Cluster => "cluster",
            Strategy::NewColumn => "newcolumn",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tags() {
        for strategy in Strategy::ALL {
            assert_eq!(Strategy::from_u8(strategy.as_u8()).unwrap(), strategy);
        }
        assert!(Strategy::from_u8(9).is_err());
    }
}
