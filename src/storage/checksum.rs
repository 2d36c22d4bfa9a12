//! Checksummed metadata blobs
//!
//! The tree superblock, the per-permutation FileIndex blob and standalone
//! FileIndex files are each written in one frame (the store's `store.json`
//! is plain JSON):
//!
//! ```text
//! [magic: 4][payload_len: u32][payload][crc32(payload): u32]
//! ```
//!
//! Frames are written to a temporary file and renamed over the target, so a
//! reader sees either the old or the new blob.

use crate::{Result, StorageError};
use crc32fast::Hasher;
use std::io::Write;
use std::path::Path;

pub type Magic = [u8; 4];

const FRAME_OVERHEAD: usize = 4 + 4 + 4;

/// CRC32 of `data`
pub fn compute(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Check `data` against an expected checksum
pub fn verify(data: &[u8], expected: u32) -> Result<()> {
    let actual = compute(data);
    if actual != expected {
        return Err(StorageError::Corruption(format!(
            "Checksum mismatch over {} bytes: expected 0x{:08X}, got 0x{:08X}",
            data.len(),
            expected,
            actual
        )));
    }
    Ok(())
}

pub fn encode_framed(magic: Magic, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&compute(payload).to_le_bytes());
    out
}

/// Validate a frame and return its payload
pub fn decode_framed(magic: Magic, encoded: &[u8]) -> Result<&[u8]> {
    if encoded.len() < FRAME_OVERHEAD {
        return Err(StorageError::Corruption(format!(
            "Metadata frame too short ({} bytes)",
            encoded.len()
        )));
    }
    if encoded[..4] != magic {
        return Err(StorageError::Corruption(format!(
            "Bad magic {:?}, expected {:?}",
            &encoded[..4],
            magic
        )));
    }

    let len = u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]) as usize;
    if encoded.len() != FRAME_OVERHEAD + len {
        return Err(StorageError::Corruption(format!(
            "Metadata frame declares {} payload bytes but holds {}",
            len,
            encoded.len() - FRAME_OVERHEAD
        )));
    }

    let payload = &encoded[8..8 + len];
    let tail = &encoded[8 + len..];
    verify(payload, u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]))?;
    Ok(payload)
}

/// Write a framed blob, replacing `path` atomically
pub fn write_framed<P: AsRef<Path>>(path: P, magic: Magic, payload: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&encode_framed(magic, payload))?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a framed blob and return its verified payload
pub fn read_framed<P: AsRef<Path>>(path: P, magic: Magic) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let encoded = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            StorageError::NotFound(format!("Metadata file {}", path.display()))
        }
        _ => StorageError::Io(e),
    })?;
    Ok(decode_framed(magic, &encoded)?.to_vec())
}
