//! Storage layer
//!
//! Append-only data files behind a bounded memory pool, plus the sparse
//! FileIndex used by table readers.

pub mod checksum;
pub mod file_index;
pub mod mapped_file;
pub mod memory_pool;
pub mod multi_file;

pub use file_index::FileIndex;
pub use mapped_file::MappedFile;
pub use memory_pool::{BlockId, EvictionOwner, MemoryPool, PoolStats};
pub use multi_file::{Buffer, FileId, MultiFileStorage};
