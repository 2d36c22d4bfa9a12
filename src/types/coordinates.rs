use super::{Permutation, Strategy, NUM_PERMUTATIONS};
use crate::encoding::{get_u16, get_u32, get_u8, get_varint, put_varint};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Locates one permutation's pair table for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    pub permutation: Permutation,
    pub element_count: u64,
    pub file: u16,
    pub offset: u32,
    pub strategy: Strategy,
}

impl Coordinates {
    pub fn new(
        permutation: Permutation,
        element_count: u64,
        file: u16,
        offset: u32,
        strategy: Strategy,
    ) -> Self {
        Self {
            permutation,
            element_count,
            file,
            offset,
            strategy,
        }
    }
}

/// All coordinates of one key, at most one per permutation.
///
/// Absent permutations are `None`; there is no sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinateSet {
    slots: [Option<Coordinates>; NUM_PERMUTATIONS],
}

impl CoordinateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(coords: Coordinates) -> Self {
        let mut set = Self::new();
        set.insert(coords);
        set
    }

    /// Store `coords` in its permutation slot, returning the previous value
    pub fn insert(&mut self, coords: Coordinates) -> Option<Coordinates> {
        self.slots[coords.permutation.index()].replace(coords)
    }

    /// Overlay every present slot of `other` onto `self`
    pub fn merge(&mut self, other: &CoordinateSet) {
        for coords in other.iter() {
            self.insert(*coords);
        }
    }

    pub fn get(&self, perm: Permutation) -> Option<&Coordinates> {
        self.slots[perm.index()].as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coordinates> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn mask(&self) -> u8 {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u8, |mask, (i, _)| mask | (1 << i))
    }

    /// Packed form: presence bitmask, then per present slot
    /// `[count varint][file u16][offset u32][strategy u8]`
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.mask());
        for coords in self.iter() {
            put_varint(out, coords.element_count);
            out.extend_from_slice(&coords.file.to_le_bytes());
            out.extend_from_slice(&coords.offset.to_le_bytes());
            out.push(coords.strategy.as_u8());
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let mask = get_u8(buf, pos)?;
        if mask >> NUM_PERMUTATIONS != 0 {
            return Err(StorageError::Corruption(format!(
                "Invalid coordinate mask 0x{:02X}",
                mask
            )));
        }

        let mut set = Self::new();
        for (i, perm) in Permutation::ALL.iter().enumerate() {
            if mask & (1 << i) == 0 {
                continue;
            }
            let element_count = get_varint(buf, pos)?;
            let file = get_u16(buf, pos)?;
            let offset = get_u32(buf, pos)?;
            let strategy = Strategy::from_u8(get_u8(buf, pos)?)?;
            set.insert(Coordinates::new(*perm, element_count, file, offset, strategy));
        }
        Ok(set)
    }
}
