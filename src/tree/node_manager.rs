//! Node records on multi-file storage
//!
//! Each record is `[len u32][node bytes]` padded to at least
//! `node_min_bytes`. A node that still fits its extent is rewritten in
//! place; otherwise a fresh extent is appended and the directory entry
//! moves.

use super::node::NodeId;
use crate::encoding::get_u32;
use crate::storage::{Buffer, FileId, MultiFileStorage};
use crate::{Result, StorageError};
use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub file: FileId,
    pub pos: u64,
    /// Bytes reserved for the record, length prefix included
    pub extent: u32,
}

pub struct NodeManager {
    storage: Arc<MultiFileStorage>,
    min_bytes: usize,
    directory: RwLock<AHashMap<NodeId, NodeLocation>>,
}

impl NodeManager {
    pub fn new(
        storage: Arc<MultiFileStorage>,
        min_bytes: usize,
        locations: impl IntoIterator<Item = (NodeId, NodeLocation)>,
    ) -> Self {
        Self {
            storage,
            min_bytes,
            directory: RwLock::new(locations.into_iter().collect()),
        }
    }

    pub fn storage(&self) -> &Arc<MultiFileStorage> {
        &self.storage
    }

    pub fn location(&self, id: NodeId) -> Option<NodeLocation> {
        self.directory.read().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.directory.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.read().is_empty()
    }

    /// Directory snapshot ordered by node id
    pub fn locations(&self) -> Vec<(NodeId, NodeLocation)> {
        let mut all: Vec<_> = self
            .directory
            .read()
            .iter()
            .map(|(id, loc)| (*id, *loc))
            .collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    pub fn write(&self, id: NodeId, body: &[u8]) -> Result<NodeLocation> {
        let needed = body.len() + 4;
        if needed > u32::MAX as usize {
            return Err(StorageError::ResourceExhausted(format!(
                "Node {} record of {} bytes is too large",
                id, needed
            )));
        }

        let mut record = Vec::with_capacity(needed.max(self.min_bytes));
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(body);

        if let Some(loc) = self.location(id) {
            if needed <= loc.extent as usize {
                self.storage.overwrite_at(loc.file, loc.pos, &record)?;
                trace!(node = id, file = loc.file, pos = loc.pos, "tree.node_rewrite");
                return Ok(loc);
            }
        }

        record.resize(needed.max(self.min_bytes), 0);
        let (file, pos) = self.storage.append(&record)?;
        let loc = NodeLocation {
            file,
            pos,
            extent: record.len() as u32,
        };
        self.directory.write().insert(id, loc);
        trace!(node = id, file, pos, extent = loc.extent, "tree.node_append");
        Ok(loc)
    }

    /// Pinned bytes of node `id`
    pub fn read(&self, id: NodeId) -> Result<Buffer> {
        let loc = self
            .location(id)
            .ok_or_else(|| StorageError::NotFound(format!("Tree node {}", id)))?;
        let len = {
            let prefix = self.storage.get_buffer(loc.file, loc.pos, 4)?;
            let mut pos = 0;
            get_u32(&prefix, &mut pos)? as usize
        };
        if len + 4 > loc.extent as usize {
            return Err(StorageError::Corruption(format!(
                "Node {} declares {} bytes in an extent of {}",
                id, len, loc.extent
            )));
        }
        self.storage.get_buffer(loc.file, loc.pos + 4, len)
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileConfig, PoolConfig};
    use crate::storage::MemoryPool;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> NodeManager {
        let pool = Arc::new(MemoryPool::new(PoolConfig::default()));
        let storage = MultiFileStorage::create(
            dir.path(),
            "tree",
            FileConfig {
                max_file_size: 4096,
                initial_map_size: 512,
            },
            pool,
        )
        .unwrap();
        NodeManager::new(storage, 32, Vec::new())
    }

    #[test]
    fn test_rewrite_in_place_when_it_fits() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.write(1, &[1; 10]).unwrap();
        assert_eq!(first.extent, 32);
        let again = manager.write(1, &[2; 20]).unwrap();
        assert_eq!(again, first);
        assert_eq!(&*manager.read(1).unwrap(), &[2u8; 20][..]);

        let moved = manager.write(1, &[3; 40]).unwrap();
        assert_ne!(moved.pos, first.pos);
        assert_eq!(moved.extent, 44);
        assert_eq!(&*manager.read(1).unwrap(), &[3u8; 40][..]);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_missing_node() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(matches!(manager.read(9), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rewrite_in_finalized_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.write(1, &[1; 8]).unwrap();
        manager.storage().create_new_file().unwrap();
        manager.write(2, &[2; 8]).unwrap();

        manager.write(1, &[7; 16]).unwrap();
        assert_eq!(manager.location(1).unwrap().file, 0);
        assert_eq!(&*manager.read(1).unwrap(), &[7u8; 16][..]);
        assert_eq!(manager.locations().len(), 2);
    }
}
