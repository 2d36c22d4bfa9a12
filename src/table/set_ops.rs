//! Set difference over first terms
//!
//! `column_not_in(a, b)` keeps the rows of `a` whose t1 does not occur in
//! `b`. Both first-term blocks are sorted, so one merge pass suffices.
//! Only the column layouts expose a random-access first-term block; every
//! other pairing is rejected.

use super::{ColumnSource, NewColumnSource, TableReader};
use crate::cursor::ArrayPairCursor;
use crate::types::Pair;
use crate::{Result, StorageError};
use tracing::trace;

/// NewColumn pairing, named `<a form><b form>` with 1 = grouped, 2 = flat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NewColumnVariant {
    V11,
    V12,
    V21,
    V22,
}

impl NewColumnVariant {
    fn of(a: &NewColumnSource, b: &NewColumnSource) -> Self {
        match (a.is_flat(), b.is_flat()) {
            (false, false) => NewColumnVariant::V11,
            (false, true) => NewColumnVariant::V12,
            (true, false) => NewColumnVariant::V21,
            (true, true) => NewColumnVariant::V22,
        }
    }

    /// A flat `b` stores one entry per t1, so its first-term block is
    /// dense enough to gallop over.
    fn walk(self) -> Walk {
        match self {
            NewColumnVariant::V11 | NewColumnVariant::V21 => Walk::Step,
            NewColumnVariant::V12 | NewColumnVariant::V22 => Walk::Gallop,
        }
    }
}

/// How the `b` side advances to the next candidate t1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    /// One group at a time
    Step,
    /// Doubling jumps then binary search
    Gallop,
}

pub fn column_not_in(a: &TableReader, b: &TableReader) -> Result<ArrayPairCursor> {
    let pairs = match (a, b) {
        (TableReader::Column(a), TableReader::Column(b)) => column_column(a, b)?,
        (TableReader::NewColumn(a), TableReader::NewColumn(b)) => {
            let variant = NewColumnVariant::of(a, b);
            trace!(?variant, "table.not_in");
            let b_first = |g| b.first_term(g);
            if a.is_flat() {
                // Flat rows of `a` are single values
                merge(
                    a.n_groups(),
                    |g| a.first_term(g),
                    b.n_groups(),
                    b_first,
                    variant.walk(),
                    |g, out| {
                        out.push((a.first_term(g)?, a.second_term(g, 0)?));
                        Ok(())
                    },
                )?
            } else {
                // Grouped rows of `a` are copied group by group
                merge(
                    a.n_groups(),
                    |g| a.first_term(g),
                    b.n_groups(),
                    b_first,
                    variant.walk(),
                    |g, out| a.push_group(g, out),
                )?
            }
        }
        (a, b) => {
            return Err(StorageError::Unsupported(format!(
                "column_not_in over {} and {} tables",
                a.strategy().name(),
                b.strategy().name()
            )))
        }
    };
    Ok(ArrayPairCursor::from_pairs(pairs))
}

fn column_column(a: &ColumnSource, b: &ColumnSource) -> Result<Vec<Pair>> {
    merge(
        a.n_groups(),
        |g| a.first_term(g),
        b.n_groups(),
        |g| b.first_term(g),
        Walk::Step,
        |g, out| a.push_group(g, out),
    )
}

/// Emit every group of `a` whose first term is missing from `b`
fn merge<FA, FB, E>(
    a_groups: usize,
    a_first: FA,
    b_groups: usize,
    b_first: FB,
    walk: Walk,
    mut emit: E,
) -> Result<Vec<Pair>>
where
    FA: Fn(usize) -> Result<i64>,
    FB: Fn(usize) -> Result<i64>,
    E: FnMut(usize, &mut Vec<Pair>) -> Result<()>,
{
    let mut out = Vec::new();
    let mut j = 0;

    for g in 0..a_groups {
        let t1 = a_first(g)?;
        j = match walk {
            Walk::Step => step(j, b_groups, t1, &b_first)?,
            Walk::Gallop => gallop(j, b_groups, t1, &b_first)?,
        };
        if j >= b_groups || b_first(j)? != t1 {
            emit(g, &mut out)?;
        }
    }
    Ok(out)
}

/// First index at or after `j` whose term is `>= t1`, scanning linearly
fn step<F>(mut j: usize, n: usize, t1: i64, first: &F) -> Result<usize>
where
    F: Fn(usize) -> Result<i64>,
{
    while j < n && first(j)? < t1 {
        j += 1;
    }
    Ok(j)
}

/// Same result as [`step`], found in O(log d) reads for a distance d
fn gallop<F>(j: usize, n: usize, t1: i64, first: &F) -> Result<usize>
where
    F: Fn(usize) -> Result<i64>,
{
    if j >= n || first(j)? >= t1 {
        return Ok(j);
    }
    // first(lo) < t1 holds throughout
    let mut lo = j;
    let mut span = 1;
    let mut hi = j + 1;
    while hi < n && first(hi)? < t1 {
        lo = hi;
        span *= 2;
        hi = lo + span;
    }
    let mut hi = hi.min(n);
    let mut lo = lo + 1;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if first(mid)? < t1 {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RowCompression;
    use crate::cursor::{collect_pairs, CursorType, PairCursor};
    use crate::storage::MultiFileStorage;
    use crate::table::test_support::{buffer, storage};
    use crate::table::{ColumnWriter, NewColumnWriter, RowWriter, TableSummary};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(storage: &Arc<MultiFileStorage>, summary: &TableSummary) -> TableReader {
        TableReader::open(
            storage,
            summary.file,
            summary.offset,
            summary.n_elements,
            summary.strategy,
            summary.index.clone().map(Arc::new),
        )
        .unwrap()
    }

    #[test]
    fn test_column_not_in() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        let a = ColumnWriter::write(
            &storage,
            &buffer(&[(1, 10), (1, 11), (2, 20), (4, 40), (5, 50), (5, 51)]),
        )
        .unwrap();
        let b = ColumnWriter::write(&storage, &buffer(&[(2, 0), (3, 0), (5, 7)])).unwrap();

        let mut cursor = column_not_in(&open(&storage, &a), &open(&storage, &b)).unwrap();
        assert_eq!(cursor.cursor_type(), CursorType::Array);
        assert_eq!(
            collect_pairs(&mut cursor).unwrap(),
            vec![(1, 10), (1, 11), (4, 40)]
        );
    }

    #[test]
    fn test_new_column_variants() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        let grouped_a = NewColumnWriter::write(
            &storage,
            &buffer(&[(1, 1), (1, 2), (3, 3), (6, 6), (6, 7)]),
        )
        .unwrap();
        let flat_a =
            NewColumnWriter::write(&storage, &buffer(&[(1, 1), (3, 3), (6, 6)])).unwrap();
        let grouped_b =
            NewColumnWriter::write(&storage, &buffer(&[(3, 0), (3, 1), (9, 9)])).unwrap();
        let flat_b = NewColumnWriter::write(&storage, &buffer(&[(1, 0), (6, 0)])).unwrap();

        let run = |a: &TableSummary, b: &TableSummary| {
            let mut cursor = column_not_in(&open(&storage, a), &open(&storage, b)).unwrap();
            collect_pairs(&mut cursor).unwrap()
        };

        assert_eq!(run(&grouped_a, &grouped_b), vec![(1, 1), (1, 2), (6, 6), (6, 7)]);
        assert_eq!(run(&grouped_a, &flat_b), vec![(3, 3)]);
        assert_eq!(run(&flat_a, &grouped_b), vec![(1, 1), (6, 6)]);
        assert_eq!(run(&flat_a, &flat_b), vec![(3, 3)]);
    }

    #[test]
    fn test_other_layouts_unsupported() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        let row = RowWriter::write(&storage, RowCompression::default(), 4, &buffer(&[(1, 1)]))
            .unwrap();
        let column = ColumnWriter::write(&storage, &buffer(&[(1, 1)])).unwrap();

        assert!(matches!(
            column_not_in(&open(&storage, &row), &open(&storage, &column)),
            Err(StorageError::Unsupported(_))
        ));
        assert!(matches!(
            column_not_in(&open(&storage, &column), &open(&storage, &row)),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_gallop_matches_step() {
        let terms: Vec<i64> = (0..300).map(|i| i * 3).collect();
        let first = |g: usize| Ok(terms[g]);
        for j in [0, 1, 17, 150, 299, 300] {
            for t1 in [-1, 0, 2, 3, 4, 450, 451, 896, 897, 898, 2000] {
                assert_eq!(
                    gallop(j, terms.len(), t1, &first).unwrap(),
                    step(j, terms.len(), t1, &first).unwrap(),
                    "j={j} t1={t1}"
                );
            }
        }
        assert_eq!(gallop(0, 0, 5, &first).unwrap(), 0);
    }

    #[test]
    fn test_long_flat_b() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 22);
        let evens: Vec<Pair> = (0..1000).map(|i| (i * 2, 0)).collect();
        let flat_b = NewColumnWriter::write(&storage, &buffer(&evens)).unwrap();

        let grouped: Vec<Pair> = (0..700).map(|i| (i / 3, i)).collect();
        let flat: Vec<Pair> = (0..400).map(|i| (i * 5, i)).collect();
        let grouped_a = NewColumnWriter::write(&storage, &buffer(&grouped)).unwrap();
        let flat_a = NewColumnWriter::write(&storage, &buffer(&flat)).unwrap();

        let expect = |rows: &[Pair]| -> Vec<Pair> {
            rows.iter()
                .copied()
                .filter(|&(t1, _)| t1 % 2 != 0 || t1 >= 2000)
                .collect()
        };
        for (a, rows) in [(&grouped_a, &grouped), (&flat_a, &flat)] {
            let mut cursor =
                column_not_in(&open(&storage, a), &open(&storage, &flat_b)).unwrap();
            assert_eq!(collect_pairs(&mut cursor).unwrap(), expect(rows));
        }
    }
}
