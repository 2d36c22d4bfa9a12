//! Integer encodings shared by the pair tables, the FileIndex and the tree
//!
//! - Varint (LEB128): 7 data bits per byte, low groups first, high bit = more
//! - Alternate varint: 7 data bits per byte, high groups first, high bit = more
//! - Zigzag: maps signed deltas onto small unsigned values
//! - Fixed width: 1..=8 little-endian bytes, width chosen per block

use crate::{Result, StorageError};

/// Maximum bytes of an encoded u64 varint
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` as LEB128 varint
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 varint at `*pos`, advancing `*pos`
pub fn get_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StorageError::Corruption("Incomplete varint".into()))?;
        *pos += 1;

        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 64 {
            return Err(StorageError::Corruption("Varint overflow".into()));
        }
    }
}

/// Encoded length of `value` as varint (both varint flavors have the same length)
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` with the most significant 7-bit group first
pub fn put_alt_varint(out: &mut Vec<u8>, value: u64) {
    let len = varint_len(value);
    for i in (0..len).rev() {
        let mut byte = ((value >> (7 * i)) & 0x7F) as u8;
        if i != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
}

/// Decode an alternate varint at `*pos`, advancing `*pos`
pub fn get_alt_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for _ in 0..MAX_VARINT_LEN {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StorageError::Corruption("Incomplete alternate varint".into()))?;
        *pos += 1;

        value = (value << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StorageError::Corruption("Alternate varint overflow".into()))
}

#[inline]
pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Minimal number of bytes (1..=8) that hold `max`
pub fn bytes_needed(max: u64) -> u8 {
    let bits = 64 - max.leading_zeros();
    (bits.div_ceil(8)).max(1) as u8
}

/// Append the low `width` bytes of `value` (little endian)
pub fn put_fixed(out: &mut Vec<u8>, value: u64, width: u8) -> Result<()> {
    check_width(width)?;
    let bytes = value.to_le_bytes();
    out.extend_from_slice(&bytes[..width as usize]);
    Ok(())
}

/// Read `width` little-endian bytes at byte offset `pos`
#[inline]
pub fn get_fixed(buf: &[u8], pos: usize, width: u8) -> Result<u64> {
    check_width(width)?;
    let end = pos + width as usize;
    let src = buf.get(pos..end).ok_or_else(|| {
        StorageError::Corruption(format!(
            "Fixed-width read [{}, {}) past buffer of {} bytes",
            pos,
            end,
            buf.len()
        ))
    })?;
    let mut bytes = [0u8; 8];
    bytes[..width as usize].copy_from_slice(src);
    Ok(u64::from_le_bytes(bytes))
}

/// A width of 0 means "no data" and is never valid inside a table
#[inline]
pub fn check_width(width: u8) -> Result<()> {
    if width == 0 || width > 8 {
        return Err(StorageError::InvalidData(format!(
            "Invalid field byte width {}",
            width
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *buf
        .get(*pos)
        .ok_or_else(|| StorageError::Corruption(format!("Read past end at {}", pos)))?;
    *pos += 1;
    Ok(byte)
}

pub fn get_u16(buf: &[u8], pos: &mut usize) -> Result<u16> {
    let value = get_fixed(buf, *pos, 2)? as u16;
    *pos += 2;
    Ok(value)
}

pub fn get_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let value = get_fixed(buf, *pos, 4)? as u32;
    *pos += 4;
    Ok(value)
}

pub fn get_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let value = get_fixed(buf, *pos, 8)?;
    *pos += 8;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));

            let mut pos = 0;
            assert_eq!(get_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_alt_varint_is_msb_first() {
        let mut buf = Vec::new();
        put_alt_varint(&mut buf, 300);
        // 300 = 0b10_0101100 -> [0x82, 0x2C]
        assert_eq!(buf, vec![0x82, 0x2C]);

        let mut pos = 0;
        assert_eq!(get_alt_varint(&buf, &mut pos).unwrap(), 300);

        let mut buf = Vec::new();
        put_alt_varint(&mut buf, u64::MAX);
        let mut pos = 0;
        assert_eq!(get_alt_varint(&buf, &mut pos).unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated_varint_is_corruption() {
        let mut pos = 0;
        assert!(matches!(
            get_varint(&[0x80, 0x80], &mut pos),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_zigzag() {
        for value in [0i64, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            assert_eq!(unzigzag(zigzag(value)), value);
        }
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
    }

    #[test]
    fn test_bytes_needed() {
        assert_eq!(bytes_needed(0), 1);
        assert_eq!(bytes_needed(255), 1);
        assert_eq!(bytes_needed(256), 2);
        assert_eq!(bytes_needed(u32::MAX as u64), 4);
        assert_eq!(bytes_needed(u64::MAX), 8);
    }

    #[test]
    fn test_fixed_width() {
        let mut buf = Vec::new();
        put_fixed(&mut buf, 0x0102_0304, 3).unwrap();
        assert_eq!(buf, vec![0x04, 0x03, 0x02]);
        assert_eq!(get_fixed(&buf, 0, 3).unwrap(), 0x02_0304);

        assert!(matches!(
            put_fixed(&mut buf, 1, 0),
            Err(StorageError::InvalidData(_))
        ));
        assert!(get_fixed(&buf, 1, 4).is_err());
    }
}
