//! Growable memory-mapped file
//!
//! ## Lifecycle
//! ```text
//! create ──append/append/...──> close ──> [truncated to content | deleted if empty]
//!   │        (mapping doubles when full, never shrinks while open)
//! open_existing ──slice/write_at──> drop
//! ```
//!
//! Readers receive an `Arc<Mapping>` together with a range. Growing the
//! file creates a new mapping; mappings already handed out stay valid for
//! the bytes they covered, so a reader never observes a dangling pointer.
//! Appends only touch bytes past the current content length, which no
//! reader can hold.

use crate::{Result, StorageError};
use memmap2::{Mmap, MmapOptions, MmapRaw};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// A live mapping shared with readers
pub(crate) enum Mapping {
    /// Read-only mapping of a finalized file
    Read(Mmap),
    /// Writable mapping of the file being appended to
    Write(MmapRaw),
}

impl Mapping {
    pub(crate) fn as_ptr(&self) -> *const u8 {
        match self {
            Mapping::Read(map) => map.as_ptr(),
            Mapping::Write(map) => map.as_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Mapping::Read(map) => map.len(),
            Mapping::Write(map) => map.len(),
        }
    }
}

struct MapState {
    file: File,
    map: Option<Arc<Mapping>>,
    /// Content length
    len: u64,
    /// Mapped (and allocated) length
    capacity: u64,
    /// Appendable through a writable mapping
    appendable: bool,
    /// The file handle accepts positional writes
    handle_writable: bool,
    closed: bool,
}

pub struct MappedFile {
    path: PathBuf,
    state: Mutex<MapState>,
}

impl MappedFile {
    /// Create (or truncate) a file and map `initial_capacity` bytes of it
    pub fn create<P: AsRef<Path>>(path: P, initial_capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = initial_capacity.max(1);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;
        let map = MmapOptions::new().len(capacity as usize).map_raw(&file)?;

        debug!(path = %path.display(), capacity, "mapped_file.create");

        Ok(Self {
            path,
            state: Mutex::new(MapState {
                file,
                map: Some(Arc::new(Mapping::Write(map))),
                len: 0,
                capacity,
                appendable: true,
                handle_writable: true,
                closed: false,
            }),
        })
    }

    /// Map an existing, finalized file read-only.
    ///
    /// With `allow_writes` the handle is opened read-write so that
    /// [`write_at`](Self::write_at) can patch bytes in place.
    pub fn open_existing<P: AsRef<Path>>(path: P, allow_writes: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(allow_writes)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StorageError::NotFound(format!("Data file {}", path.display()))
                }
                _ => StorageError::Io(e),
            })?;
        let len = file.metadata()?.len();

        let map = if len == 0 {
            None
        } else {
            // SAFETY: data files are only modified through this crate, and
            // readers never access bytes beyond the content length
            let map = unsafe { MmapOptions::new().len(len as usize).map(&file)? };
            Some(Arc::new(Mapping::Read(map)))
        };

        Ok(Self {
            path,
            state: Mutex::new(MapState {
                file,
                map,
                len,
                capacity: len,
                appendable: false,
                handle_writable: allow_writes,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content length
    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mapped length
    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    pub fn is_appendable(&self) -> bool {
        self.state.lock().appendable
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Mapped length after appending `extra` bytes (geometric growth)
    pub fn capacity_after_append(&self, extra: u64) -> u64 {
        let state = self.state.lock();
        Self::grown_capacity(state.capacity, state.len + extra)
    }

    fn grown_capacity(capacity: u64, needed: u64) -> u64 {
        let mut capacity = capacity.max(1);
        while capacity < needed {
            capacity = capacity.saturating_mul(2);
        }
        capacity
    }

    /// Append `bytes`, returning the offset they were written at
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.appendable || state.closed {
            return Err(StorageError::Unsupported(format!(
                "{} is not open for appending",
                self.path.display()
            )));
        }

        let start = state.len;
        let end = start + bytes.len() as u64;
        if end > state.capacity {
            self.grow(&mut state, end)?;
        }

        if !bytes.is_empty() {
            let map = match state.map.as_deref() {
                Some(Mapping::Write(map)) => map,
                _ => {
                    return Err(StorageError::Corruption(format!(
                        "{} lost its writable mapping",
                        self.path.display()
                    )))
                }
            };
            // SAFETY: [start, end) lies inside the mapping (grown above) and
            // past the content length, so no reader holds these bytes
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    map.as_mut_ptr().add(start as usize),
                    bytes.len(),
                );
            }
        }

        state.len = end;
        Ok(start)
    }

    fn grow(&self, state: &mut MapState, needed: u64) -> Result<()> {
        let capacity = Self::grown_capacity(state.capacity, needed);
        state.file.set_len(capacity)?;
        let map = MmapOptions::new().len(capacity as usize).map_raw(&state.file)?;

        trace!(
            path = %self.path.display(),
            old = state.capacity,
            new = capacity,
            "mapped_file.grow"
        );

        // Previously handed out mappings keep the old range alive
        state.map = Some(Arc::new(Mapping::Write(map)));
        state.capacity = capacity;
        Ok(())
    }

    /// Overwrite bytes inside the written content.
    ///
    /// Callers must not overwrite a range a reader currently holds.
    pub fn write_at(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let end = pos + bytes.len() as u64;
        if end > state.len {
            return Err(StorageError::InvalidData(format!(
                "Overwrite [{}, {}) past content length {} of {}",
                pos,
                end,
                state.len,
                self.path.display()
            )));
        }
        if state.closed {
            return Err(StorageError::Unsupported(format!(
                "{} is closed",
                self.path.display()
            )));
        }

        match state.map.as_deref() {
            Some(Mapping::Write(map)) => {
                // SAFETY: range checked against the content length above
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        map.as_mut_ptr().add(pos as usize),
                        bytes.len(),
                    );
                }
                Ok(())
            }
            _ if state.handle_writable => {
                // Shared mappings of the same file observe the write
                state.file.seek(SeekFrom::Start(pos))?;
                state.file.write_all(bytes)?;
                Ok(())
            }
            _ => Err(StorageError::Unsupported(format!(
                "{} is opened read-only",
                self.path.display()
            ))),
        }
    }

    /// Share the mapping covering `[pos, pos + len)`.
    ///
    /// Returns the mapping and the start offset inside it.
    pub(crate) fn slice(&self, pos: u64, len: usize) -> Result<Option<Arc<Mapping>>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StorageError::NotFound(format!(
                "{} was closed",
                self.path.display()
            )));
        }

        let end = pos + len as u64;
        if end > state.len {
            return Err(StorageError::InvalidData(format!(
                "Probe [{}, {}) outside {} ({} bytes)",
                pos,
                end,
                self.path.display(),
                state.len
            )));
        }

        if len == 0 {
            return Ok(None);
        }
        Ok(state.map.clone())
    }

    /// Flush written content to disk
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(Mapping::Write(map)) = state.map.as_deref() {
            if state.len > 0 {
                map.flush_range(0, state.len as usize)?;
            }
        }
        Ok(())
    }

    /// Finalize the file: flush, truncate to content, delete when empty
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        if !state.appendable {
            state.map = None;
            return Ok(());
        }

        if let Some(Mapping::Write(map)) = state.map.as_deref() {
            if state.len > 0 {
                map.flush_range(0, state.len as usize)?;
            }
        }
        state.map = None;

        if state.len == 0 {
            drop(state);
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!(path = %self.path.display(), "mapped_file.delete_empty");
            return Ok(());
        }

        if state.len < state.capacity {
            state.file.set_len(state.len)?;
            state.capacity = state.len;
        }
        state.file.sync_all()?;

        debug!(path = %self.path.display(), len = state.len, "mapped_file.close");
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
