use super::{CursorType, PairSource, TableCursor};
use crate::types::Pair;
use crate::Result;
use std::sync::Arc;

/// Sorted in-memory pairs
#[derive(Debug, Clone)]
pub struct ArraySource {
    pairs: Arc<[Pair]>,
}

impl ArraySource {
    pub fn new(pairs: Arc<[Pair]>) -> Self {
        debug_assert!(pairs.windows(2).all(|w| w[0] <= w[1]));
        Self { pairs }
    }

    pub fn pairs(&self) -> &Arc<[Pair]> {
        &self.pairs
    }
}

impl PairSource for ArraySource {
    type Pos = usize;

    fn start(&self) -> usize {
        0
    }

    fn read(&mut self, pos: usize) -> Result<Option<(Pair, usize)>> {
        Ok(self.pairs.get(pos).map(|pair| (*pair, pos + 1)))
    }

    fn seek(&mut self, from: usize, target: Pair) -> Result<usize> {
        let from = from.min(self.pairs.len());
        Ok(from + self.pairs[from..].partition_point(|pair| *pair < target))
    }

    fn remaining(&self, pos: usize) -> u64 {
        self.pairs.len().saturating_sub(pos) as u64
    }

    fn supports_groups(&self) -> bool {
        true
    }

    fn read_group(&mut self, pos: usize) -> Result<Option<(Pair, usize)>> {
        let Some(&(t1, _)) = self.pairs.get(pos) else {
            return Ok(None);
        };
        let len = self.pairs[pos..].partition_point(|pair| pair.0 == t1);
        Ok(Some(((t1, len as i64), pos + len)))
    }
}

/// Cursor over sorted in-memory pairs
pub type ArrayPairCursor = TableCursor<ArraySource>;

impl TableCursor<ArraySource> {
    pub fn from_pairs(pairs: impl Into<Arc<[Pair]>>) -> Self {
        TableCursor::new(ArraySource::new(pairs.into()), CursorType::Array)
    }

    /// Cursor over a materialized table held by the pair cache
    pub fn cached(pairs: Arc<[Pair]>) -> Self {
        TableCursor::new(ArraySource::new(pairs), CursorType::Cached)
    }
}
