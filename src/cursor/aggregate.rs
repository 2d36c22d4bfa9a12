use super::{ArraySource, CursorType, PairCursor, TableCursor};
use crate::types::Pair;
use crate::{Result, StorageError};

/// Cursor yielding `(t1, rows in group)` for every group of another cursor
pub type AggregatePairCursor = TableCursor<ArraySource>;

impl TableCursor<ArraySource> {
    /// Count the groups of `inner`, consuming it.
    ///
    /// Layouts that can skip groups are asked to do so; others are read row
    /// by row.
    pub fn over(mut inner: Box<dyn PairCursor>) -> Result<Self> {
        let mut groups: Vec<Pair> = Vec::new();

        let grouped = match inner.ignore_second_column() {
            Ok(()) => true,
            Err(StorageError::Unsupported(_)) => false,
            Err(e) => return Err(e),
        };
        if grouped {
            while inner.has_next()? {
                inner.next()?;
                groups.push((inner.value1(), inner.value2()));
            }
        } else {
            while inner.has_next()? {
                inner.next()?;
                let t1 = inner.value1();
                match groups.last_mut() {
                    Some(last) if last.0 == t1 => last.1 += 1,
                    _ => groups.push((t1, 1)),
                }
            }
        }

        Ok(TableCursor::new(
            ArraySource::new(groups.into()),
            CursorType::Aggregate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{collect_pairs, ArrayPairCursor, Checkpoint};

    /// Array cursor whose group skipping fails with the given error
    struct RowOnly(ArrayPairCursor, fn() -> StorageError);

    impl PairCursor for RowOnly {
        fn cursor_type(&self) -> CursorType {
            CursorType::Row
        }
        fn value1(&self) -> i64 {
            self.0.value1()
        }
        fn value2(&self) -> i64 {
            self.0.value2()
        }
        fn has_next(&mut self) -> Result<bool> {
            self.0.has_next()
        }
        fn next(&mut self) -> Result<()> {
            self.0.next()
        }
        fn move_to_closest_first_term(&mut self, c1: i64) -> Result<bool> {
            self.0.move_to_closest_first_term(c1)
        }
        fn move_to_closest_second_term(&mut self, c1: i64, c2: i64) -> Result<bool> {
            self.0.move_to_closest_second_term(c1, c2)
        }
        fn mark(&mut self) {
            self.0.mark()
        }
        fn reset(&mut self, checkpoint: Checkpoint) -> Result<()> {
            self.0.reset(checkpoint)
        }
        fn get_card(&mut self) -> u64 {
            self.0.get_card()
        }
        fn set_constraint1(&mut self, c1: i64) -> Result<()> {
            self.0.set_constraint1(c1)
        }
        fn set_constraint2(&mut self, c2: i64) {
            self.0.set_constraint2(c2)
        }
        fn ignore_second_column(&mut self) -> Result<()> {
            Err((self.1)())
        }
        fn clear(&mut self) {
            self.0.clear()
        }
    }

    fn unsupported() -> StorageError {
        StorageError::Unsupported("row layout".into())
    }

    fn corrupt() -> StorageError {
        StorageError::Corruption("bad group header".into())
    }

    fn pairs() -> Vec<Pair> {
        vec![(1, 10), (1, 11), (2, 20), (5, 50), (5, 51), (5, 52)]
    }

    #[test]
    fn test_counts_groups() {
        let inner = Box::new(ArrayPairCursor::from_pairs(pairs()));
        let mut cursor = AggregatePairCursor::over(inner).unwrap();
        assert_eq!(cursor.cursor_type(), CursorType::Aggregate);
        assert_eq!(
            collect_pairs(&mut cursor).unwrap(),
            vec![(1, 2), (2, 1), (5, 3)]
        );
    }

    #[test]
    fn test_counts_rows_when_groups_cannot_be_skipped() {
        let mut row_only = RowOnly(ArrayPairCursor::from_pairs(pairs()), unsupported);
        assert!(matches!(
            row_only.ignore_second_column(),
            Err(StorageError::Unsupported(_))
        ));

        let mut cursor = AggregatePairCursor::over(Box::new(row_only)).unwrap();
        assert!(cursor.move_to_closest_first_term(2).unwrap());
        assert_eq!(collect_pairs(&mut cursor).unwrap(), vec![(2, 1), (5, 3)]);
    }

    #[test]
    fn test_source_errors_are_not_taken_for_unsupported() {
        let row_only = RowOnly(ArrayPairCursor::from_pairs(pairs()), corrupt);
        assert!(matches!(
            AggregatePairCursor::over(Box::new(row_only)),
            Err(StorageError::Corruption(_))
        ));
    }
}
