//! NewColumn layout
//!
//! Grouped form (`flat = 0`):
//! ```text
//! [len u32][n_groups varint][n_elements varint][0][w_first][w_offset][w_count]
//! [t1 × n_groups]
//! [(data offset, count) × n_groups]
//! data: per group [w u8][t2 × count, w bytes each]
//! ```
//!
//! Flat form (`flat = 1`, every group has exactly one element):
//! ```text
//! [len u32][n_groups varint][n_elements varint][1][w_first][w_second]
//! [t1 × n_groups][t2 × n_groups]
//! ```
//!
//! Each group picks its own t2 width, so a few large values do not widen
//! the whole table.

use super::{append_blob, load_blob, PairBuffer, PairTableWriter, TableSummary};
use crate::cursor::PairSource;
use crate::encoding::{bytes_needed, get_fixed, get_u8, get_varint, put_fixed, put_varint, unzigzag, zigzag};
use crate::storage::{Buffer, FileId, MultiFileStorage};
use crate::types::{Pair, Strategy};
use crate::{Result, StorageError};
use std::sync::Arc;

pub struct NewColumnWriter {
    storage: Arc<MultiFileStorage>,
    buffer: PairBuffer,
}

impl NewColumnWriter {
    pub fn new(storage: Arc<MultiFileStorage>) -> Self {
        Self {
            storage,
            buffer: PairBuffer::new(),
        }
    }

    pub(crate) fn encode(buffer: &PairBuffer) -> Result<Vec<u8>> {
        buffer.ensure_not_empty()?;
        let flat = buffer.n_groups() == buffer.len();
        let max_first = buffer.groups().map(|(t1, _)| zigzag(t1)).max().unwrap_or(0);
        let w_first = bytes_needed(max_first);

        let mut out = Vec::new();
        put_varint(&mut out, buffer.n_groups());
        put_varint(&mut out, buffer.len());

        if flat {
            let max_second = buffer.pairs().iter().map(|p| zigzag(p.1)).max().unwrap_or(0);
            let w_second = bytes_needed(max_second);
            out.extend_from_slice(&[1, w_first, w_second]);
            for &(t1, _) in buffer.pairs() {
                put_fixed(&mut out, zigzag(t1), w_first)?;
            }
            for &(_, t2) in buffer.pairs() {
                put_fixed(&mut out, zigzag(t2), w_second)?;
            }
            return Ok(out);
        }

        let mut data = Vec::new();
        let mut meta = Vec::with_capacity(buffer.n_groups() as usize);
        for (_, rows) in buffer.groups() {
            let w = bytes_needed(rows.iter().map(|p| zigzag(p.1)).max().unwrap_or(0));
            meta.push((data.len() as u64, rows.len() as u64));
            data.push(w);
            for &(_, t2) in rows {
                put_fixed(&mut data, zigzag(t2), w)?;
            }
        }

        let w_offset = bytes_needed(meta.last().map_or(0, |m| m.0));
        let w_count = bytes_needed(buffer.max_group());
        out.extend_from_slice(&[0, w_first, w_offset, w_count]);
        for (t1, _) in buffer.groups() {
            put_fixed(&mut out, zigzag(t1), w_first)?;
        }
        for (offset, count) in meta {
            put_fixed(&mut out, offset, w_offset)?;
            put_fixed(&mut out, count, w_count)?;
        }
        out.extend_from_slice(&data);
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
            strategy: Strategy::NewColumn,
            index: None,
        })
    }
}

impl PairTableWriter for NewColumnWriter {
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
pub struct NewColumnPos {
    group: usize,
    /// Element inside `group`
    elem: u64,
    /// Elements consumed (a lower bound after a seek)
    index: u64,
}

enum Shape {
    Grouped {
        w_offset: u8,
        w_count: u8,
        ptr_at: usize,
        data_at: usize,
    },
    Flat {
        w_second: u8,
        second_at: usize,
    },
}

pub struct NewColumnSource {
    blob: Buffer,
    n_groups: usize,
    n_elements: u64,
    w_first: u8,
    first_at: usize,
    shape: Shape,
}

impl NewColumnSource {
    pub fn open(storage: &MultiFileStorage, file: FileId, offset: u64) -> Result<Self> {
        let blob = load_blob(storage, file, offset)?;
        let mut pos = 4;
        let n_groups = get_varint(&blob, &mut pos)? as usize;
        let n_elements = get_varint(&blob, &mut pos)?;
        let flat = get_u8(&blob, &mut pos)?;
        let w_first = get_u8(&blob, &mut pos)?;

        let (shape, first_at, min_len) = match flat {
            0 => {
                let w_offset = get_u8(&blob, &mut pos)?;
                let w_count = get_u8(&blob, &mut pos)?;
                let first_at = pos;
                let ptr_at = first_at + n_groups * w_first as usize;
                let data_at = ptr_at + n_groups * (w_offset as usize + w_count as usize);
                (
                    Shape::Grouped {
                        w_offset,
                        w_count,
                        ptr_at,
                        data_at,
                    },
                    first_at,
                    data_at,
                )
            }
            1 => {
                let w_second = get_u8(&blob, &mut pos)?;
                let first_at = pos;
                let second_at = first_at + n_groups * w_first as usize;
                (
                    Shape::Flat {
                        w_second,
                        second_at,
                    },
                    first_at,
                    second_at + n_groups * w_second as usize,
                )
            }
            other => {
                return Err(StorageError::Corruption(format!(
                    "NewColumn table at {}:{} has form tag {}",
                    file, offset, other
                )))
            }
        };

        if min_len > blob.len() {
            return Err(StorageError::Corruption(format!(
                "NewColumn table at {}:{} is {} bytes, layout needs at least {}",
                file,
                offset,
                blob.len(),
                min_len
            )));
        }

        Ok(Self {
            blob,
            n_groups,
            n_elements,
            w_first,
            first_at,
            shape,
        })
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.shape, Shape::Flat { .. })
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn first_term(&self, group: usize) -> Result<i64> {
        let at = self.first_at + group * self.w_first as usize;
        Ok(unzigzag(get_fixed(&self.blob, at, self.w_first)?))
    }

    pub fn count(&self, group: usize) -> Result<u64> {
        match self.shape {
            Shape::Flat { .. } => Ok(1),
            Shape::Grouped {
                w_offset,
                w_count,
                ptr_at,
                ..
            } => {
                let at = ptr_at + group * (w_offset as usize + w_count as usize);
                get_fixed(&self.blob, at + w_offset as usize, w_count)
            }
        }
    }

    pub fn second_term(&self, group: usize, elem: u64) -> Result<i64> {
        match self.shape {
            Shape::Flat {
                w_second,
                second_at,
            } => {
                let at = second_at + group * w_second as usize;
                Ok(unzigzag(get_fixed(&self.blob, at, w_second)?))
            }
            Shape::Grouped {
                w_offset,
                w_count,
                ptr_at,
                data_at,
            } => {
                let at = ptr_at + group * (w_offset as usize + w_count as usize);
                let data = data_at + get_fixed(&self.blob, at, w_offset)? as usize;
                let mut pos = data;
                let w = get_u8(&self.blob, &mut pos)?;
                let at = pos + elem as usize * w as usize;
                Ok(unzigzag(get_fixed(&self.blob, at, w)?))
            }
        }
    }

    /// Append every row of `group` to `out`
    pub fn push_group(&self, group: usize, out: &mut Vec<Pair>) -> Result<()> {
        let t1 = self.first_term(group)?;
        for elem in 0..self.count(group)? {
            out.push((t1, self.second_term(group, elem)?));
        }
        Ok(())
    }

    /// First group at or after `pos` that still has elements
    fn normalize(&self, mut pos: NewColumnPos) -> Result<Option<NewColumnPos>> {
        while pos.group < self.n_groups {
            if pos.elem < self.count(pos.group)? {
                return Ok(Some(pos));
            }
            pos.group += 1;
            pos.elem = 0;
        }
        Ok(None)
    }
}

impl PairSource for NewColumnSource {
    type Pos = NewColumnPos;

    fn start(&self) -> NewColumnPos {
        NewColumnPos {
            group: 0,
            elem: 0,
            index: 0,
        }
    }

    fn read(&mut self, pos: NewColumnPos) -> Result<Option<(Pair, NewColumnPos)>> {
        let Some(pos) = self.normalize(pos)? else {
            return Ok(None);
        };
        let pair = (
            self.first_term(pos.group)?,
            self.second_term(pos.group, pos.elem)?,
        );
        Ok(Some((
            pair,
            NewColumnPos {
                elem: pos.elem + 1,
                index: pos.index + 1,
                ..pos
            },
        )))
    }

    fn seek(&mut self, from: NewColumnPos, (c1, c2): Pair) -> Result<NewColumnPos> {
        let (mut lo, mut hi) = (from.group, self.n_groups);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.first_term(mid)? < c1 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= self.n_groups {
            return Ok(NewColumnPos {
                group: self.n_groups,
                elem: 0,
                index: self.n_elements,
            });
        }

        let group = lo;
        let base = if group == from.group { from.elem } else { 0 };
        let count = self.count(group)?;
        let mut elem = base;
        if self.first_term(group)? == c1 {
            let mut hi = count.max(base);
            while elem < hi {
                let mid = elem + (hi - elem) / 2;
                if self.second_term(group, mid)? < c2 {
                    elem = mid + 1;
                } else {
                    hi = mid;
                }
            }
        }

        let index = if group == from.group {
            from.index + (elem - from.elem)
        } else {
            // Rest of the starting group, at least one row per skipped group
            let rest = if from.group < self.n_groups {
                self.count(from.group)?.saturating_sub(from.elem)
            } else {
                0
            };
            from.index + rest + (group - from.group - 1) as u64 + elem
        };
        Ok(NewColumnPos { group, elem, index })
    }

    fn remaining(&self, pos: NewColumnPos) -> u64 {
        self.n_elements.saturating_sub(pos.index)
    }

    fn supports_groups(&self) -> bool {
        true
    }

    fn read_group(&mut self, pos: NewColumnPos) -> Result<Option<(Pair, NewColumnPos)>> {
        let Some(pos) = self.normalize(pos)? else {
            return Ok(None);
        };
        let left = self.count(pos.group)? - pos.elem;
        Ok(Some((
            (self.first_term(pos.group)?, left as i64),
            NewColumnPos {
                group: pos.group + 1,
                elem: 0,
                index: pos.index + left,
            },
        )))
    }

    fn remaining_groups(&self, pos: NewColumnPos) -> u64 {
        self.n_groups.saturating_sub(pos.group) as u64
    }
}
