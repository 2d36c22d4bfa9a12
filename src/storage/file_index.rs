//! FileIndex: sparse `key -> (file, pos)` map with binary search
//!
//! Table writers add one entry every N rows or groups; readers binary
//! search for the closest entry at or below a key and scan from there.
//! Keys are strictly ascending. A group that is itself very large may carry
//! an additional index, keyed by the group's first term, that locates its
//! second terms the same way.
//!
//! ## Serialized layout
//! ```text
//! [count: u32]
//! [key deltas: zigzag varint × count]
//! [files: i16 LE × count]
//! [positions: i32 LE × count]
//! [n_additional: u32] ([key: i64 LE][nested block]) × n_additional
//! ```

use super::checksum::{self, Magic};
use crate::encoding::{get_u16, get_u32, get_u64, get_varint, put_varint, unzigzag, zigzag};
use crate::{Result, StorageError};
use std::collections::BTreeMap;
use std::path::Path;

const FILE_INDEX_MAGIC: Magic = *b"TFIX";

const MIN_CAPACITY: usize = 128;
const DOUBLING_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    keys: Vec<i64>,
    files: Vec<i16>,
    positions: Vec<i32>,
    additional: BTreeMap<i64, FileIndex>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.keys.capacity()
    }

    fn grow(&mut self) {
        let cap = self.keys.capacity();
        let target = if cap < MIN_CAPACITY {
            MIN_CAPACITY
        } else if cap < DOUBLING_LIMIT {
            cap * 2
        } else {
            cap + cap / 2
        };
        let extra = target - self.keys.len();
        self.keys.reserve_exact(extra);
        self.files.reserve_exact(extra);
        self.positions.reserve_exact(extra);
    }

    /// Append an entry. Keys must arrive strictly ascending.
    pub fn add(&mut self, key: i64, file: u16, pos: u64) -> Result<()> {
        if let Some(&last) = self.keys.last() {
            if key <= last {
                return Err(StorageError::InvalidData(format!(
                    "FileIndex key {} added after {}",
                    key, last
                )));
            }
        }
        let pos = i32::try_from(pos).map_err(|_| {
            StorageError::InvalidData(format!("FileIndex position {} beyond i32 range", pos))
        })?;

        if self.keys.len() == self.keys.capacity() {
            self.grow();
        }
        self.keys.push(key);
        self.files.push(file as i16);
        self.positions.push(pos);
        Ok(())
    }

    pub fn key(&self, i: usize) -> i64 {
        self.keys[i]
    }

    pub fn file(&self, i: usize) -> u16 {
        self.files[i] as u16
    }

    pub fn pos(&self, i: usize) -> u64 {
        self.positions[i] as u64
    }

    pub fn keys(&self) -> &[i64] {
        &self.keys
    }

    /// `Ok(i)` when `key` is entry `i`, `Err(insertion_point)` otherwise
    pub fn search(&self, key: i64) -> std::result::Result<usize, usize> {
        self.keys.binary_search(&key)
    }

    /// Position of `key`, or `-(insertion_point) - 1` on a miss
    pub fn idx(&self, key: i64) -> i64 {
        self.idx_from(0, key)
    }

    /// Like [`idx`](Self::idx), searching only entries `start..`
    pub fn idx_from(&self, start: usize, key: i64) -> i64 {
        let start = start.min(self.keys.len());
        match self.keys[start..].binary_search(&key) {
            Ok(i) => (start + i) as i64,
            Err(i) => -((start + i) as i64) - 1,
        }
    }

    /// Greatest entry whose key is `<= key`
    pub fn floor(&self, key: i64) -> Option<usize> {
        match self.search(key) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    pub fn set_additional_index(&mut self, key: i64, index: FileIndex) {
        self.additional.insert(key, index);
    }

    pub fn additional_idx(&self, key: i64) -> Option<&FileIndex> {
        self.additional.get(&key)
    }

    pub fn num_additional(&self) -> usize {
        self.additional.len()
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.keys.len() as u32).to_le_bytes());

        let mut prev = 0i64;
        for &key in &self.keys {
            put_varint(out, zigzag(key.wrapping_sub(prev)));
            prev = key;
        }
        for &file in &self.files {
            out.extend_from_slice(&file.to_le_bytes());
        }
        for &pos in &self.positions {
            out.extend_from_slice(&pos.to_le_bytes());
        }

        out.extend_from_slice(&(self.additional.len() as u32).to_le_bytes());
        for (key, nested) in &self.additional {
            out.extend_from_slice(&key.to_le_bytes());
            nested.serialize(out);
        }
    }

    pub fn deserialize(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let count = get_u32(buf, pos)? as usize;
        // Every entry needs at least 7 bytes; reject counts the buffer cannot hold
        if count > buf.len().saturating_sub(*pos) / 7 + 1 {
            return Err(StorageError::Corruption(format!(
                "FileIndex count {} exceeds remaining {} bytes",
                count,
                buf.len() - *pos
            )));
        }

        let mut keys = Vec::with_capacity(count);
        let mut prev = 0i64;
        for _ in 0..count {
            let key = prev.wrapping_add(unzigzag(get_varint(buf, pos)?));
            if !keys.is_empty() && key <= prev {
                return Err(StorageError::Corruption(format!(
                    "FileIndex keys out of order: {} after {}",
                    key, prev
                )));
            }
            keys.push(key);
            prev = key;
        }

        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            files.push(get_u16(buf, pos)? as i16);
        }
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            positions.push(get_u32(buf, pos)? as i32);
        }

        let n_additional = get_u32(buf, pos)?;
        let mut additional = BTreeMap::new();
        for _ in 0..n_additional {
            let key = get_u64(buf, pos)? as i64;
            additional.insert(key, FileIndex::deserialize(buf, pos)?);
        }

        Ok(Self {
            keys,
            files,
            positions,
            additional,
        })
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut payload = Vec::new();
        self.serialize(&mut payload);
        checksum::write_framed(path, FILE_INDEX_MAGIC, &payload)
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let payload = checksum::read_framed(path, FILE_INDEX_MAGIC)?;
        let mut pos = 0;
        let index = Self::deserialize(&payload, &mut pos)?;
        if pos != payload.len() {
            return Err(StorageError::Corruption(format!(
                "{} trailing bytes after FileIndex",
                payload.len() - pos
            )));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sample() -> FileIndex {
        let mut index = FileIndex::new();
        index.add(-50, 0, 0).unwrap();
        index.add(3, 0, 120).unwrap();
        index.add(10, 1, 8).unwrap();
        index.add(1 << 40, 2, 4096).unwrap();
        index
    }

    #[test]
    fn test_idx_hit_and_miss() {
        let index = sample();
        assert_eq!(index.idx(3), 1);
        assert_eq!(index.idx(-51), -1);
        assert_eq!(index.idx(4), -3);
        assert_eq!(index.idx(i64::MAX), -5);

        assert_eq!(index.idx_from(2, 10), 2);
        assert_eq!(index.idx_from(2, 3), -3);
        assert_eq!(index.idx_from(9, 3), -5);
    }

    #[test]
    fn test_floor() {
        let index = sample();
        assert_eq!(index.floor(-60), None);
        assert_eq!(index.floor(-50), Some(0));
        assert_eq!(index.floor(9), Some(1));
        assert_eq!(index.floor(i64::MAX), Some(3));
        assert_eq!((index.file(2), index.pos(2)), (1, 8));
    }

    #[test]
    fn test_out_of_order_add_rejected() {
        let mut index = sample();
        assert!(matches!(
            index.add(10, 0, 0),
            Err(StorageError::InvalidData(_))
        ));
        assert!(index.add(1 << 41, 0, 1 << 33).is_err());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_capacity_growth() {
        let mut index = FileIndex::new();
        index.add(0, 0, 0).unwrap();
        assert_eq!(index.capacity(), 128);
        for k in 1..=128 {
            index.add(k, 0, 0).unwrap();
        }
        assert_eq!(index.capacity(), 256);
    }

    #[test]
    fn test_serialize_with_additional() {
        let mut index = sample();
        let mut nested = FileIndex::new();
        nested.add(100, 1, 16).unwrap();
        nested.add(200, 1, 64).unwrap();
        index.set_additional_index(10, nested.clone());

        let mut buf = Vec::new();
        index.serialize(&mut buf);
        let mut pos = 0;
        let decoded = FileIndex::deserialize(&buf, &mut pos).unwrap();

        assert_eq!(pos, buf.len());
        assert_eq!(decoded, index);
        assert_eq!(decoded.additional_idx(10), Some(&nested));
        assert!(decoded.additional_idx(3).is_none());
    }

    #[test]
    fn test_file_roundtrip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spo.fidx");
        let index = sample();
        index.write_to_file(&path).unwrap();
        assert_eq!(FileIndex::read_from_file(&path).unwrap(), index);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(FileIndex::read_from_file(&path).is_err());
    }

    proptest! {
        #[test]
        fn prop_idx_matches_linear_scan(
            keys in proptest::collection::btree_set(-10_000i64..10_000, 0..300),
            probes in proptest::collection::vec(-11_000i64..11_000, 1..50),
        ) {
            let keys: Vec<i64> = keys.into_iter().collect();
            let mut index = FileIndex::new();
            for (i, key) in keys.iter().enumerate() {
                index.add(*key, (i % 3) as u16, i as u64 * 10).unwrap();
            }

            for probe in probes {
                let insertion = keys.iter().filter(|k| **k < probe).count();
                let expected = if keys.get(insertion) == Some(&probe) {
                    insertion as i64
                } else {
                    -(insertion as i64) - 1
                };
                prop_assert_eq!(index.idx(probe), expected);

                let floor = keys.iter().rposition(|k| *k <= probe);
                prop_assert_eq!(index.floor(probe), floor);
            }
        }
    }
}
