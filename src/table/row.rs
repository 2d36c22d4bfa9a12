//! Row layout
//!
//! ```text
//! header: [mode u8][w1 u8][w2 u8][end_file u16][end_pos u32]
//! rows:   [f1][f2] ...
//! ```
//!
//! `mode` packs the [`RowCompression`]. In delta mode `f1` is the difference
//! from the previous row's t1 and `f2` the difference from the previous t2
//! of the same group (the raw t2 at a group start). Fields are zigzagged
//! and stored fixed-width (`w1`/`w2` bytes), as LEB128 varints, or as
//! MSB-first varints.
//!
//! Rows are appended one at a time, so a table may continue in the next
//! file when the current one fills up. The end position is patched into
//! the header once the last row is written.

use super::{PairBuffer, PairTableWriter, TableSummary};
use crate::config::{DiffMode, RowCompression, TableConfig, WidthMode};
use crate::cursor::PairSource;
use crate::encoding::{
    bytes_needed, get_alt_varint, get_fixed, get_u16, get_u32, get_u8, get_varint,
    put_alt_varint, put_fixed, put_varint, unzigzag, zigzag,
};
use crate::storage::{Buffer, FileId, FileIndex, MultiFileStorage};
use crate::types::{Pair, Strategy};
use crate::{Result, StorageError};
use std::sync::Arc;
use tracing::trace;

const HEADER_LEN: u64 = 9;
const END_OFFSET: u64 = 3;

fn row_fields(diff: DiffMode, prev: Option<Pair>, (t1, t2): Pair) -> (u64, u64) {
    match diff {
        DiffMode::NoDiff => (zigzag(t1), zigzag(t2)),
        DiffMode::Delta => {
            let (p1, p2) = prev.unwrap_or((0, 0));
            let group_start = prev.map_or(true, |p| p.0 != t1);
            let f2 = if group_start { t2 } else { t2.wrapping_sub(p2) };
            (zigzag(t1.wrapping_sub(p1)), zigzag(f2))
        }
    }
}

fn put_field(out: &mut Vec<u8>, width_mode: WidthMode, value: u64, width: u8) -> Result<()> {
    match width_mode {
        WidthMode::Fixed => put_fixed(out, value, width)?,
        WidthMode::Varint => put_varint(out, value),
        WidthMode::AltVarint => put_alt_varint(out, value),
    }
    Ok(())
}

fn get_field(buf: &[u8], pos: &mut usize, width_mode: WidthMode, width: u8) -> Result<u64> {
    match width_mode {
        WidthMode::Fixed => {
            let value = get_fixed(buf, *pos, width)?;
            *pos += width as usize;
            Ok(value)
        }
        WidthMode::Varint => get_varint(buf, pos),
        WidthMode::AltVarint => get_alt_varint(buf, pos),
    }
}

pub struct RowWriter {
    storage: Arc<MultiFileStorage>,
    compression: RowCompression,
    first_index_size: usize,
    buffer: PairBuffer,
}

impl RowWriter {
    pub fn new(storage: Arc<MultiFileStorage>, config: &TableConfig) -> Self {
        Self {
            storage,
            compression: config.row_compression,
            first_index_size: config.first_index_size,
            buffer: PairBuffer::new(),
        }
    }

    pub(crate) fn write(
        storage: &MultiFileStorage,
        compression: RowCompression,
        first_index_size: usize,
        buffer: &PairBuffer,
    ) -> Result<TableSummary> {
        buffer.ensure_not_empty()?;
        let pairs = buffer.pairs();

        // Pass 1: field widths
        let (mut max1, mut max2) = (0u64, 0u64);
        let mut prev = None;
        for &pair in pairs {
            let (f1, f2) = row_fields(compression.diff, prev, pair);
            max1 = max1.max(f1);
            max2 = max2.max(f2);
            prev = Some(pair);
        }
        let (w1, w2) = (bytes_needed(max1), bytes_needed(max2));

        let mut header = vec![compression.to_byte(), w1, w2];
        header.extend_from_slice(&[0u8; 6]);
        let (header_file, header_pos) = storage.append(&header)?;

        // Pass 2: rows
        let mut index = FileIndex::new();
        let mut since_entry = 0usize;
        let mut prev = None;
        let mut end = (header_file, header_pos + HEADER_LEN);
        let mut row = Vec::with_capacity(20);

        for &pair in pairs {
            row.clear();
            let (f1, f2) = row_fields(compression.diff, prev, pair);
            put_field(&mut row, compression.width, f1, w1)?;
            put_field(&mut row, compression.width, f2, w2)?;

            let (file, pos) = storage.append(&row)?;
            let group_start = prev.map_or(true, |p: Pair| p.0 != pair.0);
            if group_start && since_entry >= first_index_size {
                index.add(pair.0, file, pos)?;
                since_entry = 0;
            }
            since_entry += 1;
            prev = Some(pair);
            end = (file, pos + row.len() as u64);
        }

        let mut patch = Vec::with_capacity(6);
        patch.extend_from_slice(&end.0.to_le_bytes());
        patch.extend_from_slice(&(end.1 as u32).to_le_bytes());
        storage.overwrite_at(header_file, header_pos + END_OFFSET, &patch)?;

        trace!(
            file = header_file,
            offset = header_pos,
            end_file = end.0,
            end_pos = end.1,
            rows = pairs.len(),
            index_entries = index.len(),
            "table.row.write"
        );

        Ok(TableSummary {
            file: header_file,
            offset: header_pos,
            n_elements: buffer.len(),
            n_groups: buffer.n_groups(),
            strategy: Strategy::Row,
            index: (!index.is_empty()).then_some(index),
        })
    }
}

impl PairTableWriter for RowWriter {
    fn start_append(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn append(&mut self, t1: i64, t2: i64) -> Result<()> {
        self.buffer.push(t1, t2)
    }

    fn stop_append(&mut self) -> Result<TableSummary> {
        let summary = Self::write(
            &self.storage,
            self.compression,
            self.first_index_size,
            &self.buffer,
        )?;
        self.buffer.clear();
        Ok(summary)
    }
}

/// Decoding position inside a Row table
#[derive(Debug, Clone, Copy)]
pub struct RowPos {
    file: FileId,
    offset: u64,
    /// Rows consumed so far (a lower bound after an index jump)
    index: u64,
    prev1: i64,
    prev2: i64,
    /// t1 of the row at this position, known from an index entry
    anchor: Option<i64>,
    first: bool,
}

pub struct RowSource {
    storage: Arc<MultiFileStorage>,
    compression: RowCompression,
    w1: u8,
    w2: u8,
    header_file: FileId,
    header_pos: u64,
    end_file: FileId,
    end_pos: u64,
    n_elements: u64,
    index: Option<Arc<FileIndex>>,
    /// Pinned bytes of the file being read: (file, first offset, bytes)
    segment: Option<(FileId, u64, Buffer)>,
}

impl RowSource {
    pub fn open(
        storage: Arc<MultiFileStorage>,
        file: FileId,
        offset: u64,
        n_elements: u64,
        index: Option<Arc<FileIndex>>,
    ) -> Result<Self> {
        let (compression, w1, w2, end_file, end_pos) = {
            let header = storage.get_buffer(file, offset, HEADER_LEN as usize)?;
            let mut pos = 0;
            let compression = RowCompression::from_byte(get_u8(&header, &mut pos)?)?;
            let w1 = get_u8(&header, &mut pos)?;
            let w2 = get_u8(&header, &mut pos)?;
            let end_file = get_u16(&header, &mut pos)?;
            let end_pos = get_u32(&header, &mut pos)? as u64;
            (compression, w1, w2, end_file, end_pos)
        };

        if end_file < file || (end_file == file && end_pos < offset + HEADER_LEN) {
            return Err(StorageError::Corruption(format!(
                "Row table at {}:{} ends before it starts ({}:{})",
                file, offset, end_file, end_pos
            )));
        }

        Ok(Self {
            storage,
            compression,
            w1,
            w2,
            header_file: file,
            header_pos: offset,
            end_file,
            end_pos,
            n_elements,
            index,
            segment: None,
        })
    }

    /// Readable range of `file` for this table
    fn bounds(&self, file: FileId) -> Result<(u64, u64)> {
        let start = if file == self.header_file {
            self.header_pos + HEADER_LEN
        } else {
            0
        };
        let end = if file == self.end_file {
            self.end_pos
        } else {
            self.storage.size_file(file)?
        };
        Ok((start, end.max(start)))
    }

    fn ensure_segment(&mut self, file: FileId) -> Result<()> {
        if matches!(&self.segment, Some((f, _, _)) if *f == file) {
            return Ok(());
        }
        let (start, end) = self.bounds(file)?;
        let buffer = self
            .storage
            .get_buffer(file, start, (end - start) as usize)?;
        self.segment = Some((file, start, buffer));
        Ok(())
    }
}

impl PairSource for RowSource {
    type Pos = RowPos;

    fn start(&self) -> RowPos {
        RowPos {
            file: self.header_file,
            offset: self.header_pos + HEADER_LEN,
            index: 0,
            prev1: 0,
            prev2: 0,
            anchor: None,
            first: true,
        }
    }

    fn read(&mut self, mut pos: RowPos) -> Result<Option<(Pair, RowPos)>> {
        loop {
            if pos.file == self.end_file && pos.offset >= self.end_pos {
                return Ok(None);
            }
            let (_, end) = self.bounds(pos.file)?;
            if pos.offset < end {
                break;
            }
            if pos.file >= self.end_file {
                return Err(StorageError::Corruption(format!(
                    "Row table at {}:{} runs past its end",
                    self.header_file, self.header_pos
                )));
            }
            // Continue in the next file
            pos.file += 1;
            pos.offset = 0;
        }

        self.ensure_segment(pos.file)?;
        let Some((_, seg_start, buffer)) = &self.segment else {
            return Err(StorageError::Corruption("row segment missing".into()));
        };

        let mut rel = (pos.offset - *seg_start) as usize;
        let f1 = get_field(buffer, &mut rel, self.compression.width, self.w1)?;
        let f2 = get_field(buffer, &mut rel, self.compression.width, self.w2)?;
        let consumed = rel as u64 - (pos.offset - *seg_start);

        let (t1, t2) = match self.compression.diff {
            DiffMode::NoDiff => (unzigzag(f1), unzigzag(f2)),
            DiffMode::Delta => {
                let t1 = pos
                    .anchor
                    .unwrap_or_else(|| pos.prev1.wrapping_add(unzigzag(f1)));
                let group_start = pos.first || pos.anchor.is_some() || t1 != pos.prev1;
                let t2 = if group_start {
                    unzigzag(f2)
                } else {
                    pos.prev2.wrapping_add(unzigzag(f2))
                };
                (t1, t2)
            }
        };

        let next = RowPos {
            file: pos.file,
            offset: pos.offset + consumed,
            index: pos.index + 1,
            prev1: t1,
            prev2: t2,
            anchor: None,
            first: false,
        };
        Ok(Some(((t1, t2), next)))
    }

    fn seek(&mut self, from: RowPos, target: Pair) -> Result<RowPos> {
        let Some(index) = &self.index else {
            return Ok(from);
        };
        let Some(i) = index.floor(target.0) else {
            return Ok(from);
        };

        let (file, offset) = (index.file(i), index.pos(i));
        if (file, offset) <= (from.file, from.offset) {
            return Ok(from);
        }

        let key = index.key(i);
        Ok(RowPos {
            file,
            offset,
            index: from.index.max(i as u64 + 1),
            prev1: key,
            prev2: 0,
            anchor: Some(key),
            first: false,
        })
    }

    fn remaining(&self, pos: RowPos) -> u64 {
        self.n_elements.saturating_sub(pos.index)
    }
}
