//! Append-only storage spread over numbered files
//!
//! Files are named `<prefix>.<id>` with `u16` ids. Writes go to the current
//! file until the next append would cross `max_file_size`, then a new file
//! is started and the old one is finalized (truncated and re-mapped
//! read-only on demand).
//!
//! Every open mapping is registered with the shared [`MemoryPool`]. The
//! current append file stays pinned; finalized files are evictable and are
//! re-opened on the next access. A [`Buffer`] pins its file for as long as
//! it lives and keeps the mapping itself alive, so eviction only ever drops
//! the storage's reference.

use super::mapped_file::{MappedFile, Mapping};
use super::memory_pool::{BlockId, EvictionOwner, MemoryPool};
use crate::config::FileConfig;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub type FileId = u16;

/// Attempts to pin a file that keeps getting evicted under us
const MAX_PIN_ATTEMPTS: usize = 4;

/// A pinned view of bytes inside one file
pub struct Buffer {
    map: Option<Arc<Mapping>>,
    start: usize,
    len: usize,
    pin: Option<(Arc<MemoryPool>, BlockId)>,
}

impl Buffer {
    fn empty() -> Self {
        Self {
            map: None,
            start: 0,
            len: 0,
            pin: None,
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.map {
            // SAFETY: the range was checked against the content length and
            // the mapping length when the buffer was created, and the Arc
            // keeps the mapping alive
            Some(map) => unsafe {
                std::slice::from_raw_parts(map.as_ptr().add(self.start), self.len)
            },
            None => &[],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some((pool, block)) = self.pin.take() {
            pool.release_lock(block);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    file: Option<Arc<MappedFile>>,
    block: Option<BlockId>,
}

pub struct MultiFileStorage {
    dir: PathBuf,
    prefix: String,
    config: FileConfig,
    pool: Arc<MemoryPool>,
    writable: bool,
    slots: RwLock<Vec<Slot>>,
    /// File currently appended to
    current: Mutex<Option<FileId>>,
    self_ref: Weak<MultiFileStorage>,
}

impl MultiFileStorage {
    /// Start a fresh, writable storage, removing stale files with `prefix`
    pub fn create<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        config: FileConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut id: u32 = 0;
        loop {
            let path = Self::path_of(&dir, prefix, id);
            if !path.exists() {
                break;
            }
            std::fs::remove_file(&path)?;
            id += 1;
        }

        Ok(Self::build(dir, prefix, config, pool, true, 0))
    }

    /// Open an existing storage read-only, discovering files `0, 1, ...`
    pub fn open<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        config: FileConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        let mut count: u32 = 0;
        while count <= FileId::MAX as u32 && Self::path_of(&dir, prefix, count).exists() {
            count += 1;
        }

        debug!(dir = %dir.display(), prefix, files = count, "storage.open");
        Ok(Self::build(dir, prefix, config, pool, false, count as usize))
    }

    fn build(
        dir: PathBuf,
        prefix: &str,
        config: FileConfig,
        pool: Arc<MemoryPool>,
        writable: bool,
        files: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            dir,
            prefix: prefix.to_string(),
            config,
            pool,
            writable,
            slots: RwLock::new((0..files).map(|_| Slot::default()).collect()),
            current: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    fn path_of(dir: &Path, prefix: &str, id: u32) -> PathBuf {
        dir.join(format!("{}.{}", prefix, id))
    }

    pub fn file_path(&self, id: FileId) -> PathBuf {
        Self::path_of(&self.dir, &self.prefix, id as u32)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn num_files(&self) -> usize {
        self.slots.read().len()
    }

    pub fn current_file(&self) -> Option<FileId> {
        *self.current.lock()
    }

    fn owner_ref(&self) -> Weak<dyn EvictionOwner> {
        self.self_ref.clone()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StorageError::Unsupported(format!(
                "Storage '{}' is opened read-only",
                self.prefix
            )))
        }
    }

    /// Finalize the current file (if any) and start a new one
    pub fn create_new_file(&self) -> Result<FileId> {
        self.ensure_writable()?;
        let mut current = self.current.lock();
        self.roll(&mut current)
    }

    fn roll(&self, current: &mut Option<FileId>) -> Result<FileId> {
        if let Some(old) = current.take() {
            self.finalize(old)?;
        }

        let next = self.slots.read().len();
        if next > FileId::MAX as usize {
            return Err(StorageError::ResourceExhausted(format!(
                "Storage '{}' ran out of file ids",
                self.prefix
            )));
        }
        let id = next as FileId;

        let file = Arc::new(MappedFile::create(
            self.file_path(id),
            self.config.initial_map_size,
        )?);
        let block = self
            .pool
            .register(file.capacity() as usize, self.owner_ref(), id as usize)?;
        if let Err(e) = self.pool.add_lock(block) {
            self.pool.unregister(block);
            return Err(e);
        }

        self.slots.write().push(Slot {
            file: Some(file),
            block: Some(block),
        });
        *current = Some(id);

        debug!(prefix = %self.prefix, file = id, "storage.roll_file");
        Ok(id)
    }

    fn finalize(&self, id: FileId) -> Result<()> {
        let (file, block) = {
            let mut slots = self.slots.write();
            match slots.get_mut(id as usize) {
                Some(slot) => (slot.file.take(), slot.block.take()),
                None => (None, None),
            }
        };
        if let Some(block) = block {
            self.pool.unregister(block);
        }
        if let Some(file) = file {
            file.close()?;
            debug!(prefix = %self.prefix, file = id, len = file.len(), "storage.finalize_file");
        }
        Ok(())
    }

    /// File the next append of `len` bytes goes to, rolling if needed
    fn target_file(&self, current: &mut Option<FileId>, len: u64) -> Result<(FileId, Arc<MappedFile>)> {
        if len > self.config.max_file_size {
            return Err(StorageError::ResourceExhausted(format!(
                "Append of {} bytes exceeds the file size cap of {} bytes",
                len, self.config.max_file_size
            )));
        }

        if let Some(id) = *current {
            if let Some(file) = self.current_mapping(id) {
                let used = file.len();
                if used == 0 || used + len <= self.config.max_file_size {
                    return Ok((id, file));
                }
            }
        }

        let id = self.roll(current)?;
        let file = self.current_mapping(id).ok_or_else(|| {
            StorageError::Corruption(format!("Fresh file {} of '{}' vanished", id, self.prefix))
        })?;
        Ok((id, file))
    }

    fn current_mapping(&self, id: FileId) -> Option<Arc<MappedFile>> {
        self.slots
            .read()
            .get(id as usize)
            .and_then(|slot| slot.file.clone())
    }

    fn current_block(&self, id: FileId) -> Option<BlockId> {
        self.slots.read().get(id as usize).and_then(|slot| slot.block)
    }

    /// Append `bytes`, returning where they landed
    pub fn append(&self, bytes: &[u8]) -> Result<(FileId, u64)> {
        self.ensure_writable()?;
        let mut current = self.current.lock();
        let (id, file) = self.target_file(&mut current, bytes.len() as u64)?;

        let capacity = file.capacity_after_append(bytes.len() as u64);
        if capacity != file.capacity() {
            if let Some(block) = self.current_block(id) {
                self.pool.resize(block, capacity as usize)?;
            }
        }

        let pos = file.append(bytes)?;
        Ok((id, pos))
    }

    /// Where an append of `len` bytes will land, rolling now if it must
    pub fn reserve(&self, len: u64) -> Result<(FileId, u64)> {
        self.ensure_writable()?;
        let mut current = self.current.lock();
        let (id, file) = self.target_file(&mut current, len)?;
        Ok((id, file.len()))
    }

    /// Patch bytes that were already written
    pub fn overwrite_at(&self, id: FileId, pos: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let (file, _) = self.ensure_open(id)?;
        file.write_at(pos, bytes)
    }

    /// Pin and return `len` bytes at `pos` of file `id`
    pub fn get_buffer(&self, id: FileId, pos: u64, len: usize) -> Result<Buffer> {
        if len == 0 {
            let size = self.size_file(id)?;
            if pos > size {
                return Err(StorageError::InvalidData(format!(
                    "Probe at {} outside file {} of '{}' ({} bytes)",
                    pos, id, self.prefix, size
                )));
            }
            return Ok(Buffer::empty());
        }

        for _ in 0..MAX_PIN_ATTEMPTS {
            let (file, block) = self.ensure_open(id)?;
            if self.pool.add_lock(block).is_err() {
                self.drop_slot_if(id, block);
                continue;
            }

            match file.slice(pos, len) {
                Ok(Some(mapping)) if pos as usize + len > mapping.len() => {
                    self.pool.release_lock(block);
                    return Err(StorageError::Corruption(format!(
                        "Range {}+{} of file {} of '{}' lies past its {} byte mapping",
                        pos,
                        len,
                        id,
                        self.prefix,
                        mapping.len()
                    )));
                }
                Ok(map) => {
                    return Ok(Buffer {
                        map,
                        start: pos as usize,
                        len,
                        pin: Some((self.pool.clone(), block)),
                    })
                }
                Err(e) => {
                    self.pool.release_lock(block);
                    if file.is_closed() {
                        self.drop_slot_if(id, block);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        warn!(prefix = %self.prefix, file = id, "storage.pin_failed");
        Err(StorageError::ResourceExhausted(format!(
            "File {} of '{}' was evicted {} times while pinning",
            id, self.prefix, MAX_PIN_ATTEMPTS
        )))
    }

    /// Content length of file `id`
    pub fn size_file(&self, id: FileId) -> Result<u64> {
        {
            let slots = self.slots.read();
            let slot = slots.get(id as usize).ok_or_else(|| self.no_such_file(id))?;
            if let Some(file) = &slot.file {
                return Ok(file.len());
            }
        }
        Ok(std::fs::metadata(self.file_path(id))?.len())
    }

    fn no_such_file(&self, id: FileId) -> StorageError {
        StorageError::InvalidData(format!(
            "File id {} outside storage '{}' ({} files)",
            id,
            self.prefix,
            self.num_files()
        ))
    }

    fn ensure_open(&self, id: FileId) -> Result<(Arc<MappedFile>, BlockId)> {
        {
            let slots = self.slots.read();
            let slot = slots.get(id as usize).ok_or_else(|| self.no_such_file(id))?;
            if let (Some(file), Some(block)) = (&slot.file, slot.block) {
                return Ok((file.clone(), block));
            }
        }

        let file = Arc::new(MappedFile::open_existing(
            self.file_path(id),
            self.writable,
        )?);
        let bytes = (file.capacity() as usize).max(1);
        let block = self.pool.register(bytes, self.owner_ref(), id as usize)?;

        let mut slots = self.slots.write();
        let slot = &mut slots[id as usize];
        if let (Some(existing), Some(existing_block)) = (&slot.file, slot.block) {
            // Another reader mapped it first
            let found = (existing.clone(), existing_block);
            drop(slots);
            self.pool.unregister(block);
            return Ok(found);
        }
        slot.file = Some(file.clone());
        slot.block = Some(block);
        Ok((file, block))
    }

    fn drop_slot_if(&self, id: FileId, block: BlockId) {
        let stale = {
            let mut slots = self.slots.write();
            match slots.get_mut(id as usize) {
                Some(slot) if slot.block == Some(block) => {
                    slot.block = None;
                    slot.file.take()
                }
                _ => None,
            }
        };
        drop(stale);
    }

    /// Flush the current file's written bytes
    pub fn sync(&self) -> Result<()> {
        let current = *self.current.lock();
        if let Some(id) = current {
            if let Some(file) = self.current_mapping(id) {
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Finalize the current file and release every mapping
    pub fn close(&self) -> Result<()> {
        {
            let mut current = self.current.lock();
            if let Some(id) = current.take() {
                self.finalize(id)?;
            }
        }

        let open: Vec<(Option<Arc<MappedFile>>, Option<BlockId>)> = {
            let mut slots = self.slots.write();
            slots
                .iter_mut()
                .map(|slot| (slot.file.take(), slot.block.take()))
                .collect()
        };
        for (file, block) in open {
            if let Some(block) = block {
                self.pool.unregister(block);
            }
            drop(file);
        }
        Ok(())
    }
}

impl EvictionOwner for MultiFileStorage {
    fn on_evict(&self, slot: usize) {
        let evicted = {
            let mut slots = self.slots.write();
            match slots.get_mut(slot) {
                Some(entry) => {
                    entry.block = None;
                    entry.file.take()
                }
                None => None,
            }
        };
        if evicted.is_some() {
            debug!(prefix = %self.prefix, file = slot, "storage.evict_file");
        }
    }
}

impl Drop for MultiFileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(prefix = %self.prefix, error = %e, "storage.close_on_drop_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use tempfile::TempDir;

    fn file_config(max_file_size: u64) -> FileConfig {
        FileConfig {
            max_file_size,
            initial_map_size: 64,
        }
    }

    fn pool(max_bytes: usize, max_open_files: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool::new(PoolConfig {
            max_bytes,
            max_open_files,
        }))
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let storage =
            MultiFileStorage::create(dir.path(), "spo", file_config(1024), pool(1 << 20, 16))
                .unwrap();

        let (f1, p1) = storage.append(b"hello").unwrap();
        let (f2, p2) = storage.append(b"world").unwrap();
        assert_eq!((f1, p1), (0, 0));
        assert_eq!((f2, p2), (0, 5));

        let buf = storage.get_buffer(0, 3, 4).unwrap();
        assert_eq!(&buf[..], b"lowo");
        assert_eq!(storage.size_file(0).unwrap(), 10);
    }

    #[test]
    fn test_rolls_when_file_is_full() {
        let dir = TempDir::new().unwrap();
        let storage =
            MultiFileStorage::create(dir.path(), "pos", file_config(100), pool(1 << 20, 16))
                .unwrap();

        storage.append(&[1u8; 60]).unwrap();
        let (file, pos) = storage.append(&[2u8; 60]).unwrap();
        assert_eq!((file, pos), (1, 0));
        assert_eq!(storage.num_files(), 2);

        // Exactly filling a file does not roll
        let (file, pos) = storage.append(&[3u8; 40]).unwrap();
        assert_eq!((file, pos), (1, 60));

        // Finalized file is still readable
        let buf = storage.get_buffer(0, 0, 60).unwrap();
        assert!(buf.iter().all(|b| *b == 1));
        assert_eq!(storage.size_file(0).unwrap(), 60);
    }

    #[test]
    fn test_oversized_append_rejected() {
        let dir = TempDir::new().unwrap();
        let storage =
            MultiFileStorage::create(dir.path(), "osp", file_config(32), pool(1 << 20, 16))
                .unwrap();
        let err = storage.append(&[0u8; 33]).unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_reserve_predicts_append() {
        let dir = TempDir::new().unwrap();
        let storage =
            MultiFileStorage::create(dir.path(), "sop", file_config(100), pool(1 << 20, 16))
                .unwrap();
        storage.append(&[0u8; 90]).unwrap();

        let reserved = storage.reserve(20).unwrap();
        assert_eq!(reserved, (1, 0));
        assert_eq!(storage.append(&[0u8; 20]).unwrap(), reserved);
    }

    #[test]
    fn test_overwrite_in_current_and_finalized_file() {
        let dir = TempDir::new().unwrap();
        let storage =
            MultiFileStorage::create(dir.path(), "pso", file_config(16), pool(1 << 20, 16))
                .unwrap();
        storage.append(b"aaaaaaaaaaaa").unwrap();
        storage.append(b"bbbbbbbbbbbb").unwrap();

        storage.overwrite_at(1, 2, b"XY").unwrap();
        storage.overwrite_at(0, 0, b"Z").unwrap();

        assert_eq!(&storage.get_buffer(1, 0, 4).unwrap()[..], b"bbXY");
        assert_eq!(&storage.get_buffer(0, 0, 2).unwrap()[..], b"Za");
        assert!(storage.overwrite_at(1, 11, b"toolong").is_err());
    }

    #[test]
    fn test_reopen_read_only() {
        let dir = TempDir::new().unwrap();
        {
            let storage =
                MultiFileStorage::create(dir.path(), "ops", file_config(8), pool(1 << 20, 16))
                    .unwrap();
            storage.append(b"12345678").unwrap();
            storage.append(b"abcd").unwrap();
            storage.close().unwrap();
        }

        let storage =
            MultiFileStorage::open(dir.path(), "ops", file_config(8), pool(1 << 20, 16)).unwrap();
        assert_eq!(storage.num_files(), 2);
        assert_eq!(&storage.get_buffer(1, 0, 4).unwrap()[..], b"abcd");
        assert!(storage.append(b"x").is_err());
        assert!(storage.get_buffer(2, 0, 1).is_err());
    }

    #[test]
    fn test_buffer_survives_eviction() {
        let dir = TempDir::new().unwrap();
        // Room for two open files only
        let storage =
            MultiFileStorage::create(dir.path(), "spo", file_config(8), pool(1 << 20, 2))
                .unwrap();
        for i in 0..4u8 {
            storage.append(&[i; 8]).unwrap();
        }

        let held = storage.get_buffer(0, 0, 8).unwrap();
        // The current file is pinned and file 0 is pinned by `held`, so
        // opening file 1 must fail rather than evict either
        let err = storage.get_buffer(1, 0, 8).unwrap_err();
        assert!(err.is_resource_exhausted());
        assert!(held.iter().all(|b| *b == 0));

        drop(held);
        let buf = storage.get_buffer(1, 0, 8).unwrap();
        assert!(buf.iter().all(|b| *b == 1));
        assert!(storage.pool().len() <= 2);
    }

    #[test]
    fn test_create_clears_stale_files() {
        let dir = TempDir::new().unwrap();
        {
            let storage =
                MultiFileStorage::create(dir.path(), "spo", file_config(4), pool(1 << 20, 16))
                    .unwrap();
            storage.append(b"abcd").unwrap();
            storage.append(b"efgh").unwrap();
        }
        assert!(dir.path().join("spo.1").exists());

        let storage =
            MultiFileStorage::create(dir.path(), "spo", file_config(4), pool(1 << 20, 16))
                .unwrap();
        assert_eq!(storage.num_files(), 0);
        assert!(!dir.path().join("spo.0").exists());
    }
}
