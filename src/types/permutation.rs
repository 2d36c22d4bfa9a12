use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

pub const NUM_PERMUTATIONS: usize = 6;

/// One of the six orderings under which the fact set is indexed.
///
/// The first component is the tree key; the remaining two are the
/// `(t1, t2)` columns of that key's pair table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permutation {
    Spo,
    Sop,
    Pso,
    Pos,
    Osp,
    Ops,
}

impl Permutation {
    pub const ALL: [Permutation; NUM_PERMUTATIONS] = [
        Permutation::Spo,
        Permutation::Sop,
        Permutation::Pso,
        Permutation::Pos,
        Permutation::Osp,
        Permutation::Ops,
    ];

    pub fn index(self) -> usize {
        match self {
            Permutation::Spo => 0,
            Permutation::Sop => 1,
            Permutation::Pso => 2,
            Permutation::Pos => 3,
            Permutation::Osp => 4,
            Permutation::Ops => 5,
        }
    }

    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL.get(index).copied().ok_or_else(|| {
            StorageError::Corruption(format!("Permutation index {} out of range", index))
        })
    }

    /// File prefix of this permutation's pair-table files
    pub fn name(self) -> &'static str {
        match self {
            Permutation::Spo => "spo",
            Permutation::Sop => "sop",
            Permutation::Pso => "pso",
            Permutation::Pos => "pos",
            Permutation::Osp => "osp",
            Permutation::Ops => "ops",
        }
    }

    /// Reorder a triple into `(key, t1, t2)`
    pub fn order(self, s: i64, p: i64, o: i64) -> (i64, i64, i64) {
        match self {
            Permutation::Spo => (s, p, o),
            Permutation::Sop => (s, o, p),
            Permutation::Pso => (p, s, o),
            Permutation::Pos => (p, o, s),
            Permutation::Osp => (o, s, p),
            Permutation::Ops => (o, p, s),
        }
    }
}
