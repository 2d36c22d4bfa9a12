//! Column layout
//!
//! ```text
//! [len u32][n_groups varint][n_elements varint][w_first][w_ptr][w_count][w_second]
//! [t1 × n_groups]                 (w_first bytes each)
//! [(start, count) × n_groups]     (w_ptr + w_count bytes each)
//! [t2 × n_elements]               (w_second bytes each)
//! ```
//!
//! Values are zigzagged; every block uses the smallest width that holds
//! its largest value. Fixed widths make both terms binary searchable.

use super::{append_blob, load_blob, PairBuffer, PairTableWriter, TableSummary};
use crate::cursor::PairSource;
use crate::encoding::{bytes_needed, get_fixed, get_u8, get_varint, put_fixed, put_varint, unzigzag, zigzag};
use crate::storage::{Buffer, FileId, MultiFileStorage};
use crate::types::{Pair, Strategy};
use crate::{Result, StorageError};
use std::sync::Arc;

pub struct ColumnWriter {
    storage: Arc<MultiFileStorage>,
    buffer: PairBuffer,
}

impl ColumnWriter {
    pub fn new(storage: Arc<MultiFileStorage>) -> Self {
        Self {
            storage,
            buffer: PairBuffer::new(),
        }
    }

    pub(crate) fn encode(buffer: &PairBuffer) -> Result<Vec<u8>> {
        buffer.ensure_not_empty()?;
        let pairs = buffer.pairs();

        let max_first = buffer.groups().map(|(t1, _)| zigzag(t1)).max().unwrap_or(0);
        let max_second = pairs.iter().map(|p| zigzag(p.1)).max().unwrap_or(0);
        let w_first = bytes_needed(max_first);
        let w_ptr = bytes_needed(buffer.len());
        let w_count = bytes_needed(buffer.max_group());
        let w_second = bytes_needed(max_second);

        let mut out = Vec::new();
        put_varint(&mut out, buffer.n_groups());
        put_varint(&mut out, buffer.len());
        out.extend_from_slice(&[w_first, w_ptr, w_count, w_second]);

        for (t1, _) in buffer.groups() {
            put_fixed(&mut out, zigzag(t1), w_first)?;
        }
        let mut start = 0u64;
        for (_, rows) in buffer.groups() {
            put_fixed(&mut out, start, w_ptr)?;
            put_fixed(&mut out, rows.len() as u64, w_count)?;
            start += rows.len() as u64;
        }
        for &(_, t2) in pairs {
            put_fixed(&mut out, zigzag(t2), w_second)?;
        }
        Ok(out)
    }

    pub(crate) fn write(storage: &MultiFileStorage, buffer: &PairBuffer) -> Result<TableSummary> {
        let body = Self::encode(buffer)?;
        let (file, offset) = append_blob(storage, &body)?;
        Ok(TableSummary {
            file,
            offset,
            n_elements: buffer.len(),
            n_groups: buffer.n_groups(),
            strategy: Strategy::Column,
            index: None,
        })
    }
}

impl PairTableWriter for ColumnWriter {
    fn start_append(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn append(&mut self, t1: i64, t2: i64) -> Result<()> {
        self.buffer.push(t1, t2)
    }

    fn stop_append(&mut self) -> Result<TableSummary> {
        let summary = Self::write(&self.storage, &self.buffer)?;
        self.buffer.clear();
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnPos {
    group: usize,
    elem: u64,
}

pub struct ColumnSource {
    blob: Buffer,
    n_groups: usize,
    n_elements: u64,
    w_first: u8,
    w_ptr: u8,
    w_count: u8,
    w_second: u8,
    first_at: usize,
    ptr_at: usize,
    second_at: usize,
}

impl ColumnSource {
    pub fn open(storage: &MultiFileStorage, file: FileId, offset: u64) -> Result<Self> {
        let blob = load_blob(storage, file, offset)?;
        let mut pos = 4;
        let n_groups = get_varint(&blob, &mut pos)? as usize;
        let n_elements = get_varint(&blob, &mut pos)?;
        let w_first = get_u8(&blob, &mut pos)?;
        let w_ptr = get_u8(&blob, &mut pos)?;
        let w_count = get_u8(&blob, &mut pos)?;
        let w_second = get_u8(&blob, &mut pos)?;

        let first_at = pos;
        let ptr_at = first_at + n_groups * w_first as usize;
        let second_at = ptr_at + n_groups * (w_ptr as usize + w_count as usize);
        let end = second_at + n_elements as usize * w_second as usize;
        if end != blob.len() {
            return Err(StorageError::Corruption(format!(
                "Column table at {}:{} is {} bytes, layout needs {}",
                file,
                offset,
                blob.len(),
                end
            )));
        }

        Ok(Self {
            blob,
            n_groups,
            n_elements,
            w_first,
            w_ptr,
            w_count,
            w_second,
            first_at,
            ptr_at,
            second_at,
        })
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn n_elements(&self) -> u64 {
        self.n_elements
    }

    pub fn first_term(&self, group: usize) -> Result<i64> {
        let at = self.first_at + group * self.w_first as usize;
        Ok(unzigzag(get_fixed(&self.blob, at, self.w_first)?))
    }

    /// `(start element, count)` of a group
    pub fn group(&self, group: usize) -> Result<(u64, u64)> {
        let at = self.ptr_at + group * (self.w_ptr as usize + self.w_count as usize);
        let start = get_fixed(&self.blob, at, self.w_ptr)?;
        let count = get_fixed(&self.blob, at + self.w_ptr as usize, self.w_count)?;
        Ok((start, count))
    }

    pub fn second_term(&self, elem: u64) -> Result<i64> {
        let at = self.second_at + elem as usize * self.w_second as usize;
        Ok(unzigzag(get_fixed(&self.blob, at, self.w_second)?))
    }

    /// Append every row of `group` to `out`
    pub fn push_group(&self, group: usize, out: &mut Vec<Pair>) -> Result<()> {
        let t1 = self.first_term(group)?;
        let (start, count) = self.group(group)?;
        for elem in start..start + count {
            out.push((t1, self.second_term(elem)?));
        }
        Ok(())
    }

    /// Group holding `elem`, starting the search at `group`
    fn normalize(&self, mut group: usize, elem: u64) -> Result<usize> {
        while group < self.n_groups {
            let (start, count) = self.group(group)?;
            if elem < start + count {
                break;
            }
            group += 1;
        }
        Ok(group)
    }
}

impl PairSource for ColumnSource {
    type Pos = ColumnPos;

    fn start(&self) -> ColumnPos {
        ColumnPos { group: 0, elem: 0 }
    }

    fn read(&mut self, pos: ColumnPos) -> Result<Option<(Pair, ColumnPos)>> {
        if pos.elem >= self.n_elements {
            return Ok(None);
        }
        let group = self.normalize(pos.group, pos.elem)?;
        let pair = (self.first_term(group)?, self.second_term(pos.elem)?);
        Ok(Some((
            pair,
            ColumnPos {
                group,
                elem: pos.elem + 1,
            },
        )))
    }

    fn seek(&mut self, from: ColumnPos, (c1, c2): Pair) -> Result<ColumnPos> {
        if from.elem >= self.n_elements {
            return Ok(from);
        }

        // First group with t1 >= c1
        let (mut lo, mut hi) = (from.group, self.n_groups);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.first_term(mid)? < c1 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == self.n_groups {
            return Ok(ColumnPos {
                group: lo,
                elem: self.n_elements,
            });
        }

        let group = lo;
        let (start, count) = self.group(group)?;
        let first = if group == from.group {
            start.max(from.elem)
        } else {
            start
        };
        if self.first_term(group)? != c1 {
            return Ok(ColumnPos { group, elem: first });
        }

        // First element with t2 >= c2 inside the group
        let (mut lo, mut hi) = (first, (start + count).max(first));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.second_term(mid)? < c2 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(ColumnPos { group, elem: lo })
    }

    fn remaining(&self, pos: ColumnPos) -> u64 {
        self.n_elements.saturating_sub(pos.elem)
    }

    fn supports_groups(&self) -> bool {
        true
    }

    fn read_group(&mut self, pos: ColumnPos) -> Result<Option<(Pair, ColumnPos)>> {
        if pos.elem >= self.n_elements {
            return Ok(None);
        }
        let group = self.normalize(pos.group, pos.elem)?;
        let (start, count) = self.group(group)?;
        let end = start + count;
        Ok(Some((
            (self.first_term(group)?, (end - pos.elem) as i64),
            ColumnPos {
                group: group + 1,
                elem: end,
            },
        )))
    }

    fn remaining_groups(&self, pos: ColumnPos) -> u64 {
        self.n_groups.saturating_sub(pos.group) as u64
    }
}
