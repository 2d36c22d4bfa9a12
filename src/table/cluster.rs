//! Cluster layout
//!
//! ```text
//! [len u32][n_groups varint][n_elements varint][flags u8]
//! per group: [t1 delta varint][count varint][payload_len varint][payload]
//! ```
//!
//! The t1 delta is zigzagged against the previous group (0 before the
//! first). A payload holds the group's t2 values as varints: the first one
//! zigzagged, the rest as plain deltas when [`FLAG_DELTA`] is set.
//!
//! A first-level FileIndex gets an entry every `first_index_size` groups
//! (key t1, absolute group offset). Groups longer than
//! `additional_index_threshold` get a nested index keyed by t2 with an
//! entry every `additional_index_step` elements.

use super::{append_blob, load_blob, PairBuffer, PairTableWriter, TableSummary};
use crate::config::TableConfig;
use crate::cursor::PairSource;
use crate::encoding::{get_u8, get_varint, put_varint, unzigzag, zigzag};
use crate::storage::{Buffer, FileId, FileIndex, MultiFileStorage};
use crate::types::{Pair, Strategy};
use crate::{Result, StorageError};
use std::sync::Arc;

pub const FLAG_DELTA: u8 = 0x01;

/// Offset of the body inside a blob (after the length prefix)
const BODY_AT: u64 = 4;

pub struct ClusterWriter {
    storage: Arc<MultiFileStorage>,
    first_index_size: usize,
    additional_index_threshold: usize,
    additional_index_step: usize,
    buffer: PairBuffer,
}

impl ClusterWriter {
    pub fn new(storage: Arc<MultiFileStorage>, config: &TableConfig) -> Self {
        Self {
            storage,
            first_index_size: config.first_index_size,
            additional_index_threshold: config.additional_index_threshold,
            additional_index_step: config.additional_index_step,
            buffer: PairBuffer::new(),
        }
    }

    pub(crate) fn write(
        storage: &MultiFileStorage,
        config: &TableConfig,
        buffer: &PairBuffer,
    ) -> Result<TableSummary> {
        buffer.ensure_not_empty()?;
        let first_index_size = config.first_index_size.max(1);
        let step = config.additional_index_step.max(1);

        let mut body = Vec::new();
        put_varint(&mut body, buffer.n_groups());
        put_varint(&mut body, buffer.len());
        body.push(FLAG_DELTA);

        // (key, offset in body) of index entries, resolved after the append
        let mut first_level: Vec<(i64, u64)> = Vec::new();
        let mut nested: Vec<(i64, Vec<(i64, u64)>)> = Vec::new();

        let mut payload = Vec::new();
        let mut prev_t1 = 0i64;
        for (g, (t1, rows)) in buffer.groups().enumerate() {
            if g > 0 && g % first_index_size == 0 {
                first_level.push((t1, body.len() as u64));
            }

            payload.clear();
            let mut element_offsets = Vec::new();
            let mut prev_t2 = 0i64;
            for (j, &(_, t2)) in rows.iter().enumerate() {
                if j > 0 && j % step == 0 && rows.len() > config.additional_index_threshold {
                    element_offsets.push((t2, payload.len() as u64));
                }
                if j == 0 {
                    put_varint(&mut payload, zigzag(t2));
                } else {
                    put_varint(&mut payload, t2.wrapping_sub(prev_t2) as u64);
                }
                prev_t2 = t2;
            }

            put_varint(&mut body, zigzag(t1.wrapping_sub(prev_t1)));
            put_varint(&mut body, rows.len() as u64);
            put_varint(&mut body, payload.len() as u64);
            let payload_at = body.len() as u64;
            body.extend_from_slice(&payload);

            if !element_offsets.is_empty() {
                let entries = element_offsets
                    .into_iter()
                    .map(|(t2, at)| (t2, payload_at + at))
                    .collect();
                nested.push((t1, entries));
            }
            prev_t1 = t1;
        }

        let (file, offset) = append_blob(storage, &body)?;
        let base = offset + BODY_AT;

        let mut index = FileIndex::new();
        for (key, at) in first_level {
            index.add(key, file, base + at)?;
        }
        for (t1, entries) in nested {
            let mut group_index = FileIndex::new();
            for (key, at) in entries {
                group_index.add(key, file, base + at)?;
            }
            index.set_additional_index(t1, group_index);
        }
        let has_index = !index.is_empty() || index.num_additional() > 0;

        Ok(TableSummary {
            file,
            offset,
            n_elements: buffer.len(),
            n_groups: buffer.n_groups(),
            strategy: Strategy::Cluster,
            index: has_index.then_some(index),
        })
    }
}

impl PairTableWriter for ClusterWriter {
    fn start_append(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn append(&mut self, t1: i64, t2: i64) -> Result<()> {
        self.buffer.push(t1, t2)
    }

    fn stop_append(&mut self) -> Result<TableSummary> {
        let config = TableConfig {
            first_index_size: self.first_index_size,
            additional_index_threshold: self.additional_index_threshold,
            additional_index_step: self.additional_index_step,
            ..TableConfig::default()
        };
        let summary = Self::write(&self.storage, &config, &self.buffer)?;
        self.buffer.clear();
        Ok(summary)
    }
}

/// Decoding position inside a Cluster blob
#[derive(Debug, Clone, Copy)]
pub struct ClusterPos {
    /// Blob offset of the next group header or t2 varint
    off: usize,
    /// End of the current group's payload; `off < group_end` while inside it
    group_end: usize,
    t1: i64,
    prev2: i64,
    /// Value at `off` known from an index entry (t1 at a header, t2 inside)
    anchor: Option<i64>,
    /// Elements consumed (a lower bound after index jumps)
    index: u64,
    groups: u64,
}

struct GroupHeader {
    t1: i64,
    count: u64,
    payload_at: usize,
    payload_end: usize,
}

pub struct ClusterSource {
    blob: Buffer,
    base: u64,
    data_at: usize,
    n_groups: u64,
    n_elements: u64,
    delta: bool,
    index: Option<Arc<FileIndex>>,
}

impl ClusterSource {
    pub fn open(
        storage: &MultiFileStorage,
        file: FileId,
        offset: u64,
        index: Option<Arc<FileIndex>>,
    ) -> Result<Self> {
        let blob = load_blob(storage, file, offset)?;
        let mut pos = BODY_AT as usize;
        let n_groups = get_varint(&blob, &mut pos)?;
        let n_elements = get_varint(&blob, &mut pos)?;
        let flags = get_u8(&blob, &mut pos)?;

        Ok(Self {
            blob,
            base: offset,
            data_at: pos,
            n_groups,
            n_elements,
            delta: flags & FLAG_DELTA != 0,
            index,
        })
    }

    fn header(&self, pos: &ClusterPos) -> Result<GroupHeader> {
        let mut at = pos.off;
        let delta = unzigzag(get_varint(&self.blob, &mut at)?);
        let t1 = pos.anchor.unwrap_or_else(|| pos.t1.wrapping_add(delta));
        let count = get_varint(&self.blob, &mut at)?;
        let len = get_varint(&self.blob, &mut at)? as usize;
        let payload_end = at + len;
        if count == 0 || payload_end > self.blob.len() {
            return Err(StorageError::Corruption(format!(
                "Cluster group at blob offset {} has {} elements over {} bytes",
                pos.off, count, len
            )));
        }
        Ok(GroupHeader {
            t1,
            count,
            payload_at: at,
            payload_end,
        })
    }

    /// Blob offset of an index entry, if it lies inside this blob
    fn entry_offset(&self, index: &FileIndex, i: usize) -> Option<usize> {
        let abs = index.pos(i);
        let rel = abs.checked_sub(self.base)? as usize;
        (rel >= self.data_at && rel < self.blob.len()).then_some(rel)
    }

    fn skip_group(pos: ClusterPos, header: &GroupHeader) -> ClusterPos {
        ClusterPos {
            off: header.payload_end,
            group_end: header.payload_end,
            t1: header.t1,
            prev2: 0,
            anchor: None,
            index: pos.index + header.count,
            groups: pos.groups + 1,
        }
    }

    /// Finish the current group without decoding values
    fn leave_group(&self, pos: ClusterPos) -> Result<ClusterPos> {
        let mut at = pos.off;
        let mut left = 0u64;
        while at < pos.group_end {
            get_varint(&self.blob, &mut at)?;
            left += 1;
        }
        Ok(ClusterPos {
            off: pos.group_end,
            anchor: None,
            index: pos.index + left,
            ..pos
        })
    }
}

impl PairSource for ClusterSource {
    type Pos = ClusterPos;

    fn start(&self) -> ClusterPos {
        ClusterPos {
            off: self.data_at,
            group_end: self.data_at,
            t1: 0,
            prev2: 0,
            anchor: None,
            index: 0,
            groups: 0,
        }
    }

    fn read(&mut self, pos: ClusterPos) -> Result<Option<(Pair, ClusterPos)>> {
        let mut pos = pos;
        let first_in_group = pos.off >= pos.group_end;
        if first_in_group {
            if pos.off >= self.blob.len() {
                return Ok(None);
            }
            let header = self.header(&pos)?;
            pos.off = header.payload_at;
            pos.group_end = header.payload_end;
            pos.t1 = header.t1;
            pos.anchor = None;
            pos.groups += 1;
        }

        let raw = get_varint(&self.blob, &mut pos.off)?;
        let t2 = match pos.anchor.take() {
            Some(t2) => t2,
            None if first_in_group || !self.delta => unzigzag(raw),
            None => pos.prev2.wrapping_add(raw as i64),
        };
        if pos.off > pos.group_end {
            return Err(StorageError::Corruption(format!(
                "Cluster value runs past its group end {}",
                pos.group_end
            )));
        }
        pos.prev2 = t2;
        pos.index += 1;
        Ok(Some(((pos.t1, t2), pos)))
    }

    fn seek(&mut self, from: ClusterPos, (c1, c2): Pair) -> Result<ClusterPos> {
        let mut pos = from;
        if pos.off < pos.group_end {
            if pos.t1 >= c1 {
                return Ok(pos);
            }
            pos = self.leave_group(pos)?;
        }

        // Jump through the first-level index
        if let Some(index) = self.index.clone() {
            if let Some(i) = index.floor(c1) {
                if let Some(off) = self.entry_offset(&index, i) {
                    if off > pos.off {
                        let key = index.key(i);
                        pos = ClusterPos {
                            off,
                            group_end: off,
                            t1: key,
                            prev2: 0,
                            anchor: Some(key),
                            index: pos.index.max(i as u64 + 1),
                            groups: pos.groups.max(i as u64 + 1),
                        };
                    }
                }
            }
        }

        // Skip whole groups below c1
        let header = loop {
            if pos.off >= self.blob.len() {
                return Ok(pos);
            }
            let header = self.header(&pos)?;
            if header.t1 >= c1 {
                break header;
            }
            pos = Self::skip_group(pos, &header);
        };

        if header.t1 != c1 || c2 == i64::MIN {
            return Ok(pos);
        }

        // Jump inside a large group through its nested index
        let Some(nested) = self.index.as_ref().and_then(|i| i.additional_idx(c1)) else {
            return Ok(pos);
        };
        let Some(j) = nested.floor(c2) else {
            return Ok(pos);
        };
        let Some(off) = self.entry_offset(nested, j) else {
            return Ok(pos);
        };
        if off <= header.payload_at || off >= header.payload_end {
            return Ok(pos);
        }

        let key = nested.key(j);
        Ok(ClusterPos {
            off,
            group_end: header.payload_end,
            t1: c1,
            prev2: key,
            anchor: Some(key),
            index: pos.index + j as u64 + 1,
            groups: pos.groups + 1,
        })
    }

    fn remaining(&self, pos: ClusterPos) -> u64 {
        self.n_elements.saturating_sub(pos.index)
    }

    fn supports_groups(&self) -> bool {
        true
    }

    fn read_group(&mut self, pos: ClusterPos) -> Result<Option<(Pair, ClusterPos)>> {
        if pos.off < pos.group_end {
            let left = self.leave_group(pos)?;
            let count = left.index - pos.index;
            return Ok(Some(((pos.t1, count as i64), left)));
        }
        if pos.off >= self.blob.len() {
            return Ok(None);
        }
        let header = self.header(&pos)?;
        Ok(Some((
            (header.t1, header.count as i64),
            Self::skip_group(pos, &header),
        )))
    }

    fn remaining_groups(&self, pos: ClusterPos) -> u64 {
        self.n_groups.saturating_sub(pos.groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{collect_pairs, Checkpoint, CursorType, PairCursor, TableCursor};
    use crate::table::test_support::{buffer, mixed_pairs, scenario_pairs, storage};
    use tempfile::TempDir;

    fn config() -> TableConfig {
        TableConfig {
            first_index_size: 4,
            additional_index_threshold: 32,
            additional_index_step: 8,
            ..TableConfig::default()
        }
    }

    fn write(pairs: &[Pair]) -> (TempDir, TableSummary, TableCursor<ClusterSource>) {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        let summary = ClusterWriter::write(&storage, &config(), &buffer(pairs)).unwrap();
        let source = ClusterSource::open(
            &storage,
            summary.file,
            summary.offset,
            summary.index.clone().map(Arc::new),
        )
        .unwrap();
        (dir, summary, TableCursor::new(source, CursorType::Cluster))
    }

    #[test]
    fn test_roundtrip() {
        let pairs = mixed_pairs();
        let (_dir, summary, mut cursor) = write(&pairs);
        assert_eq!(summary.strategy, Strategy::Cluster);
        assert_eq!(collect_pairs(&mut cursor).unwrap(), pairs);
    }

    #[test]
    fn test_builds_nested_index_for_large_group() {
        let (_dir, summary, _) = write(&mixed_pairs());
        let index = summary.index.unwrap();
        assert!(!index.is_empty());

        // Group 5 holds 90 elements
        let nested = index.additional_idx(5).unwrap();
        assert_eq!(nested.len(), 11);
        assert_eq!(nested.key(0), 24);
        assert!(index.additional_idx(6).is_none());
    }

    #[test]
    fn test_seeks_through_both_index_levels() {
        let pairs = mixed_pairs();
        let (_dir, _, mut cursor) = write(&pairs);

        assert!(cursor.move_to_closest_second_term(5, 200).unwrap());
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (5, 201));
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (5, 204));

        assert!(cursor.move_to_closest_first_term(30).unwrap());
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (30, 210));
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (30, 211));

        assert!(!cursor.move_to_closest_second_term(31, 1000).unwrap());
        cursor.next().unwrap();
        assert_eq!(cursor.value1(), 32);
    }

    #[test]
    fn test_every_seek_target_matches_linear_scan() {
        let pairs = mixed_pairs();
        let (_dir, _, mut cursor) = write(&pairs);
        for &(t1, t2) in pairs.iter().step_by(7) {
            cursor.clear();
            assert!(cursor.move_to_closest_second_term(t1, t2).unwrap());
            cursor.next().unwrap();
            assert_eq!((cursor.value1(), cursor.value2()), (t1, t2));
        }
    }

    #[test]
    fn test_groups_and_checkpoints() {
        let (_dir, _, mut cursor) = write(&scenario_pairs());
        cursor.next().unwrap();
        cursor.next().unwrap();
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (2, 20));
        cursor.next().unwrap();
        cursor.next().unwrap();
        cursor.reset(Checkpoint::Inner).unwrap();
        cursor.next().unwrap();
        assert_eq!((cursor.value1(), cursor.value2()), (5, 50));

        cursor.clear();
        cursor.ignore_second_column().unwrap();
        assert_eq!(
            collect_pairs(&mut cursor).unwrap(),
            vec![(1, 2), (2, 1), (5, 3)]
        );
    }
}
