//! Cursor state machine shared by every layout
//!
//! A layout only has to describe how to decode the row at a position
//! ([`PairSource`]); lookahead, seeking, constraints, checkpoints and
//! cardinality bookkeeping live here once.

use super::{Checkpoint, CursorType, PairCursor};
use crate::types::Pair;
use crate::{Result, StorageError};

/// Row decoder behind a [`TableCursor`]
pub trait PairSource: Send {
    /// Decoding position. Carries whatever state decoding the next row needs
    /// (delta bases, group bounds).
    type Pos: Copy + Send + std::fmt::Debug;

    /// Position before the first row
    fn start(&self) -> Self::Pos;

    /// Decode the row at `pos`, returning it and the position after it
    fn read(&mut self, pos: Self::Pos) -> Result<Option<(Pair, Self::Pos)>>;

    /// Jump towards the first row `>= target` at or after `from`.
    ///
    /// May stop short of it (the cursor scans the rest) but must never go
    /// past it. The default does not jump at all.
    fn seek(&mut self, from: Self::Pos, _target: Pair) -> Result<Self::Pos> {
        Ok(from)
    }

    /// Rows left from `pos`
    fn remaining(&self, pos: Self::Pos) -> u64;

    fn supports_groups(&self) -> bool {
        false
    }

    /// Decode the whole group starting at `pos` as `(t1, rows in group)`
    fn read_group(&mut self, _pos: Self::Pos) -> Result<Option<(Pair, Self::Pos)>> {
        Err(StorageError::Unsupported(
            "layout cannot skip over groups".into(),
        ))
    }

    /// Groups left from `pos` (an upper bound is fine)
    fn remaining_groups(&self, pos: Self::Pos) -> u64 {
        self.remaining(pos)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark<P> {
    pos: P,
    current: Option<Pair>,
    group_start: P,
}

pub struct TableCursor<S: PairSource> {
    source: S,
    kind: CursorType,
    /// Position of the next unconsumed row
    pos: S::Pos,
    current: Option<Pair>,
    /// The row at `pos`, once probed
    lookahead: Option<(Pair, S::Pos)>,
    group_start: S::Pos,
    outer: Option<Mark<S::Pos>>,
    constraint1: Option<i64>,
    constraint2: Option<i64>,
    grouped: bool,
    card: u64,
}

impl<S: PairSource> TableCursor<S> {
    pub fn new(source: S, kind: CursorType) -> Self {
        let start = source.start();
        Self {
            source,
            kind,
            pos: start,
            current: None,
            lookahead: None,
            group_start: start,
            outer: None,
            constraint1: None,
            constraint2: None,
            grouped: false,
            card: u64::MAX,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn read_at(&mut self, pos: S::Pos) -> Result<Option<(Pair, S::Pos)>> {
        if self.grouped {
            self.source.read_group(pos)
        } else {
            self.source.read(pos)
        }
    }

    /// Consume rows below `target` without yielding them
    fn advance_to(&mut self, target: Pair) -> Result<bool> {
        if let Some((pair, _)) = self.lookahead {
            if pair >= target {
                return Ok(pair.0 == target.0);
            }
        }

        if let Some((_, after)) = self.lookahead.take() {
            self.pos = after;
        }
        if !self.grouped && self.constraint1.map_or(true, |c1| target.0 <= c1) {
            self.pos = self.source.seek(self.pos, target)?;
        }

        while self.has_next()? {
            if let Some((pair, after)) = self.lookahead {
                if pair >= target {
                    return Ok(pair.0 == target.0);
                }
                self.lookahead = None;
                self.pos = after;
            }
        }
        Ok(false)
    }

    fn restore(&mut self, mark: Mark<S::Pos>) {
        self.pos = mark.pos;
        self.current = mark.current;
        self.group_start = mark.group_start;
        self.lookahead = None;
        self.card = u64::MAX;
    }
}

impl<S: PairSource> PairCursor for TableCursor<S> {
    fn cursor_type(&self) -> CursorType {
        self.kind
    }

    fn value1(&self) -> i64 {
        self.current.map_or(0, |p| p.0)
    }

    fn value2(&self) -> i64 {
        self.current.map_or(0, |p| p.1)
    }

    fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.lookahead.is_some() {
                return Ok(true);
            }

            let Some((pair, after)) = self.read_at(self.pos)? else {
                return Ok(false);
            };

            if let Some(c1) = self.constraint1 {
                if pair.0 != c1 {
                    return Ok(false);
                }
            }
            if let Some(c2) = self.constraint2 {
                if !self.grouped && pair.1 != c2 {
                    self.pos = after;
                    continue;
                }
            }

            self.lookahead = Some((pair, after));
            return Ok(true);
        }
    }

    fn next(&mut self) -> Result<()> {
        if !self.has_next()? {
            return Err(StorageError::InvalidArgument(format!(
                "next() on an exhausted {:?} cursor",
                self.kind
            )));
        }
        let Some((pair, after)) = self.lookahead.take() else {
            return Ok(());
        };

        if self.current.map(|c| c.0) != Some(pair.0) {
            self.group_start = self.pos;
        }
        self.current = Some(pair);
        self.pos = after;
        Ok(())
    }

    fn move_to_closest_first_term(&mut self, c1: i64) -> Result<bool> {
        self.advance_to((c1, i64::MIN))
    }

    fn move_to_closest_second_term(&mut self, c1: i64, c2: i64) -> Result<bool> {
        if let Some(current) = self.current {
            if current.0 > c1 {
                return Ok(false);
            }
        }
        self.advance_to((c1, c2))
    }

    fn mark(&mut self) {
        self.outer = Some(Mark {
            pos: self.pos,
            current: self.current,
            group_start: self.group_start,
        });
    }

    fn reset(&mut self, checkpoint: Checkpoint) -> Result<()> {
        match checkpoint {
            Checkpoint::Outer => {
                let mark = self.outer.ok_or_else(|| {
                    StorageError::InvalidArgument("reset to an outer mark that was never set".into())
                })?;
                self.restore(mark);
            }
            Checkpoint::Inner => {
                let group_start = self.group_start;
                self.restore(Mark {
                    pos: group_start,
                    current: None,
                    group_start,
                });
            }
        }
        Ok(())
    }

    fn get_card(&mut self) -> u64 {
        let estimate = if self.grouped {
            self.source.remaining_groups(self.pos)
        } else {
            self.source.remaining(self.pos)
        };
        self.card = self.card.min(estimate);
        self.card
    }

    fn set_constraint1(&mut self, c1: i64) -> Result<()> {
        self.constraint1 = None;
        self.advance_to((c1, i64::MIN))?;
        self.constraint1 = Some(c1);
        self.lookahead = None;
        Ok(())
    }

    fn set_constraint2(&mut self, c2: i64) {
        self.constraint2 = Some(c2);
        self.lookahead = None;
    }

    fn ignore_second_column(&mut self) -> Result<()> {
        if !self.source.supports_groups() {
            return Err(StorageError::Unsupported(format!(
                "{:?} cursor cannot ignore the second column",
                self.kind
            )));
        }
        if self.current.is_some() {
            return Err(StorageError::InvalidArgument(
                "ignore_second_column must be set before the first row is read".into(),
            ));
        }
        self.grouped = true;
        self.lookahead = None;
        self.card = u64::MAX;
        Ok(())
    }

    fn clear(&mut self) {
        let start = self.source.start();
        self.pos = start;
        self.current = None;
        self.lookahead = None;
        self.group_start = start;
        self.outer = None;
        self.constraint1 = None;
        self.constraint2 = None;
        self.grouped = false;
        self.card = u64::MAX;
    }
}
