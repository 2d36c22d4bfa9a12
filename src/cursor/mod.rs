//! Pair cursors
//!
//! Every reader over a pair table, an in-memory array or an aggregation
//! exposes the same forward-only [`PairCursor`] interface used by merge and
//! nested-loop joins.
//!
//! ## Positioning
//! A cursor sits *between* rows. `next()` moves over one row and makes it
//! current (`value1()` / `value2()`); `has_next()` may probe ahead but is
//! idempotent until `next()` consumes. Seeks never move backward: they
//! place the cursor just before the first not-yet-consumed row that is
//! `>=` the target, so the following `next()` yields it.
//!
//! ## Checkpoints
//! `mark()` saves the outer checkpoint. The inner checkpoint always tracks
//! the start of the current row's group (rows sharing `value1`).
//! `reset(Checkpoint::Outer)` / `reset(Checkpoint::Inner)` rewind so the
//! next `next()` re-yields the rows after that point.

mod aggregate;
mod array;
mod table_cursor;

pub use aggregate::AggregatePairCursor;
pub use array::{ArrayPairCursor, ArraySource};
pub use table_cursor::{PairSource, TableCursor};

use crate::types::Pair;
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorType {
    Row,
    Column,
    Cluster,
    NewColumn,
    Array,
    Aggregate,
    Cached,
}

/// Saved position restored by [`PairCursor::reset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Position saved by `mark()`
    Outer = 0,
    /// Start of the current row's group
    Inner = 1,
}

impl Checkpoint {
    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            0 => Ok(Checkpoint::Outer),
            1 => Ok(Checkpoint::Inner),
            other => Err(StorageError::InvalidArgument(format!(
                "Unknown checkpoint flag {}",
                other
            ))),
        }
    }
}

pub trait PairCursor: Send {
    fn cursor_type(&self) -> CursorType;

    /// First term of the current row
    fn value1(&self) -> i64;

    /// Second term of the current row (the group size once
    /// [`ignore_second_column`](Self::ignore_second_column) is active)
    fn value2(&self) -> i64;

    fn has_next(&mut self) -> Result<bool>;

    /// Consume the next row. Fails when there is none.
    fn next(&mut self) -> Result<()>;

    /// Seek to the first remaining row with `t1 >= c1`.
    ///
    /// Returns whether that row has `t1 == c1`.
    fn move_to_closest_first_term(&mut self, c1: i64) -> Result<bool>;

    /// Seek to the first remaining row `>= (c1, c2)`.
    ///
    /// Returns whether that row has `t1 == c1`. When the current row is
    /// already past `c1` nothing moves and the result is `false`.
    fn move_to_closest_second_term(&mut self, c1: i64, c2: i64) -> Result<bool>;

    fn mark(&mut self);

    fn reset(&mut self, checkpoint: Checkpoint) -> Result<()>;

    /// Remaining rows: exact where the layout knows it, otherwise an
    /// estimate that never grows while the cursor advances
    fn get_card(&mut self) -> u64;

    /// Restrict the cursor to the group with `t1 == c1`
    fn set_constraint1(&mut self, c1: i64) -> Result<()>;

    /// Only yield rows with `t2 == c2`
    fn set_constraint2(&mut self, c2: i64);

    /// Yield one row per group: `(t1, rows in group)`
    fn ignore_second_column(&mut self) -> Result<()> {
        Err(StorageError::Unsupported(format!(
            "{:?} cursor cannot ignore the second column",
            self.cursor_type()
        )))
    }

    /// Rewind to the first row and drop constraints and checkpoints
    fn clear(&mut self);
}

/// Drain a cursor into a vector of `(value1, value2)`
pub fn collect_pairs(cursor: &mut dyn PairCursor) -> Result<Vec<Pair>> {
    let mut out = Vec::new();
    while cursor.has_next()? {
        cursor.next()?;
        out.push((cursor.value1(), cursor.value2()));
    }
    Ok(out)
}
