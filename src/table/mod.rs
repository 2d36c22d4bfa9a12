//! Binary pair tables
//!
//! Every key of a permutation owns one table of `(t1, t2)` pairs sorted by
//! `t1` then `t2`. Four layouts trade space for seek speed:
//!
//! | Layout      | Shape                                           | Seek          |
//! |-------------|-------------------------------------------------|---------------|
//! | `Row`       | one record per pair, may span files             | FileIndex     |
//! | `Column`    | fixed-width t1 / pointer / t2 blocks            | binary search |
//! | `Cluster`   | varint groups, t1 once per group                | FileIndex     |
//! | `NewColumn` | per-group byte width, or a flat t2 block        | binary search |
//!
//! Writers buffer the whole table, compute extrema, then emit it.
//! Single-blob layouts start with their total length as a `u32`.

mod builder;
mod cluster;
mod column;
mod new_column;
mod row;
mod set_ops;

pub use builder::TableBuilder;
pub use cluster::{ClusterSource, ClusterWriter};
pub use column::{ColumnSource, ColumnWriter};
pub use new_column::{NewColumnSource, NewColumnWriter};
pub use row::{RowSource, RowWriter};
pub use set_ops::column_not_in;

use crate::cursor::{CursorType, PairCursor, TableCursor};
use crate::encoding::get_u32;
use crate::storage::{Buffer, FileId, FileIndex, MultiFileStorage};
use crate::types::{Pair, Strategy};
use crate::{Result, StorageError};
use std::sync::Arc;

/// Where a finished table landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub file: FileId,
    pub offset: u64,
    pub n_elements: u64,
    pub n_groups: u64,
    pub strategy: Strategy,
    pub index: Option<FileIndex>,
}

pub trait PairTableWriter {
    fn start_append(&mut self) -> Result<()>;

    /// Add one pair. `t1` must not decrease; `t2` must increase within a group.
    fn append(&mut self, t1: i64, t2: i64) -> Result<()>;

    fn stop_append(&mut self) -> Result<TableSummary>;
}

/// Pairs of one table under construction
#[derive(Debug, Default, Clone)]
pub struct PairBuffer {
    pairs: Vec<Pair>,
    n_groups: u64,
    max_group: u64,
    current_group: u64,
}

impl PairBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, t1: i64, t2: i64) -> Result<()> {
        match self.pairs.last() {
            Some(&(p1, _)) if t1 < p1 => {
                return Err(StorageError::InvalidData(format!(
                    "First term {} appended after {}",
                    t1, p1
                )))
            }
            Some(&(p1, p2)) if t1 == p1 => {
                if t2 <= p2 {
                    return Err(StorageError::InvalidData(format!(
                        "Second term {} appended after {} in group {}",
                        t2, p2, t1
                    )));
                }
                self.current_group += 1;
            }
            _ => {
                self.n_groups += 1;
                self.current_group = 1;
            }
        }
        self.max_group = self.max_group.max(self.current_group);
        self.pairs.push((t1, t2));
        Ok(())
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn len(&self) -> u64 {
        self.pairs.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn n_groups(&self) -> u64 {
        self.n_groups
    }

    pub fn max_group(&self) -> u64 {
        self.max_group
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.n_groups = 0;
        self.max_group = 0;
        self.current_group = 0;
    }

    /// `(t1, rows)` for every group in order
    pub fn groups(&self) -> Groups<'_> {
        Groups { rest: &self.pairs }
    }

    pub(crate) fn ensure_not_empty(&self) -> Result<()> {
        if self.pairs.is_empty() {
            return Err(StorageError::InvalidData(
                "Refusing to write an empty pair table".into(),
            ));
        }
        Ok(())
    }
}

pub struct Groups<'a> {
    rest: &'a [Pair],
}

impl<'a> Iterator for Groups<'a> {
    type Item = (i64, &'a [Pair]);

    fn next(&mut self) -> Option<Self::Item> {
        let t1 = self.rest.first()?.0;
        let len = self.rest.partition_point(|p| p.0 == t1);
        let (group, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some((t1, group))
    }
}

/// Append a single-blob table: `[total_len u32][body]`
pub(crate) fn append_blob(storage: &MultiFileStorage, body: &[u8]) -> Result<(FileId, u64)> {
    let total = body.len() + 4;
    if total as u64 > storage.config().max_file_size || total > u32::MAX as usize {
        return Err(StorageError::ResourceExhausted(format!(
            "Table blob of {} bytes does not fit in one file",
            total
        )));
    }
    let mut blob = Vec::with_capacity(total);
    blob.extend_from_slice(&(total as u32).to_le_bytes());
    blob.extend_from_slice(body);
    storage.append(&blob)
}

/// Pin a whole single-blob table, length prefix included
pub(crate) fn load_blob(storage: &MultiFileStorage, file: FileId, offset: u64) -> Result<Buffer> {
    let total = {
        let prefix = storage.get_buffer(file, offset, 4)?;
        let mut pos = 0;
        get_u32(&prefix, &mut pos)? as usize
    };
    if total < 4 {
        return Err(StorageError::Corruption(format!(
            "Table blob at {}:{} declares {} bytes",
            file, offset, total
        )));
    }
    storage.get_buffer(file, offset, total)
}

/// Reader over one stored table
pub enum TableReader {
    Row(RowSource),
    Column(ColumnSource),
    Cluster(ClusterSource),
    NewColumn(NewColumnSource),
}

impl TableReader {
    pub fn open(
        storage: &Arc<MultiFileStorage>,
        file: FileId,
        offset: u64,
        n_elements: u64,
        strategy: Strategy,
        index: Option<Arc<FileIndex>>,
    ) -> Result<Self> {
        Ok(match strategy {
            Strategy::Row => {
                TableReader::Row(RowSource::open(storage.clone(), file, offset, n_elements, index)?)
            }
            Strategy::Column => TableReader::Column(ColumnSource::open(storage, file, offset)?),
            Strategy::Cluster => {
                TableReader::Cluster(ClusterSource::open(storage, file, offset, index)?)
            }
            Strategy::NewColumn => {
                TableReader::NewColumn(NewColumnSource::open(storage, file, offset)?)
            }
        })
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            TableReader::Row(_) => Strategy::Row,
            TableReader::Column(_) => Strategy::Column,
            TableReader::Cluster(_) => Strategy::Cluster,
            TableReader::NewColumn(_) => Strategy::NewColumn,
        }
    }

    pub fn cursor(self) -> Box<dyn PairCursor> {
        match self {
            TableReader::Row(source) => Box::new(TableCursor::new(source, CursorType::Row)),
            TableReader::Column(source) => Box::new(TableCursor::new(source, CursorType::Column)),
            TableReader::Cluster(source) => {
                Box::new(TableCursor::new(source, CursorType::Cluster))
            }
            TableReader::NewColumn(source) => {
                Box::new(TableCursor::new(source, CursorType::NewColumn))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{FileConfig, PoolConfig};
    use crate::storage::MemoryPool;
    use tempfile::TempDir;

    pub fn storage(dir: &TempDir, max_file_size: u64) -> Arc<MultiFileStorage> {
        let pool = Arc::new(MemoryPool::new(PoolConfig {
            max_bytes: 64 << 20,
            max_open_files: 64,
        }));
        MultiFileStorage::create(
            dir.path(),
            "spo",
            FileConfig {
                max_file_size,
                initial_map_size: 256,
            },
            pool,
        )
        .unwrap()
    }

    pub fn buffer(pairs: &[Pair]) -> PairBuffer {
        let mut buffer = PairBuffer::new();
        for (t1, t2) in pairs {
            buffer.push(*t1, *t2).unwrap();
        }
        buffer
    }

    /// Groups of various sizes including a big one, negative values and
    /// wide gaps
    pub fn mixed_pairs() -> Vec<Pair> {
        let mut pairs = vec![(-7, -100), (-7, 3), (0, 0), (1, 1 << 40)];
        for t2 in 0..90 {
            pairs.push((5, t2 * 3));
        }
        for t1 in 6..40 {
            pairs.push((t1, t1 * 7));
            if t1 % 3 == 0 {
                pairs.push((t1, t1 * 7 + 1));
            }
        }
        pairs.push((1 << 50, i64::MAX));
        pairs
    }

    pub fn scenario_pairs() -> Vec<Pair> {
        vec![(1, 10), (1, 11), (2, 20), (5, 50), (5, 51), (5, 52)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_tracks_groups() {
        let buffer = test_support::buffer(&test_support::scenario_pairs());
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.n_groups(), 3);
        assert_eq!(buffer.max_group(), 3);

        let groups: Vec<(i64, usize)> = buffer.groups().map(|(t1, g)| (t1, g.len())).collect();
        assert_eq!(groups, vec![(1, 2), (2, 1), (5, 3)]);
    }

    #[test]
    fn test_buffer_rejects_disorder() {
        let mut buffer = PairBuffer::new();
        buffer.push(2, 5).unwrap();
        assert!(matches!(buffer.push(1, 9), Err(StorageError::InvalidData(_))));
        assert!(matches!(buffer.push(2, 5), Err(StorageError::InvalidData(_))));
        assert!(matches!(buffer.push(2, 4), Err(StorageError::InvalidData(_))));
        buffer.push(2, 6).unwrap();
        buffer.push(3, -1).unwrap();
        assert_eq!(buffer.n_groups(), 2);
    }

    #[test]
    fn test_empty_buffer_rejected() {
        assert!(PairBuffer::new().ensure_not_empty().is_err());
    }
}
