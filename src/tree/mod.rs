//! Term index tree
//!
//! A disk-backed B-tree mapping a key (numeric or textual, fixed per tree)
//! to the [`CoordinateSet`] of that key's pair tables.
//!
//! ## Architecture
//! ```text
//! Memory:  [Arena<Node>] <- id map -> intermediate nodes (resident once loaded)
//!                                     leaves (LRU, evicted to the LeafPool)
//!             ↓ evict / flush
//! Disk:    tree.0, tree.1, ...   node records (NodeManager)
//!          tree.meta             superblock: root, ids, node directory
//! ```
//!
//! Nodes split once they hold more than `max_elements_per_node` keys; the
//! right half moves to a new right sibling and its first key becomes the
//! separator in the parent. There is no delete. A tree reopened from disk
//! is read-only.

mod arena;
mod key;
mod node;
mod node_manager;

pub use arena::Arena;
pub use key::{KeyKind, TreeKey};
pub use node::{Intermediate, Leaf, LeafPool, Node, NodeId};
pub use node_manager::{NodeLocation, NodeManager};

use crate::config::{FileConfig, TreeConfig};
use crate::storage::checksum::{self, Magic};
use crate::storage::{MemoryPool, MultiFileStorage};
use crate::types::{CoordinateSet, Coordinates, Permutation};
use crate::{Result, StorageError};
use ahash::AHashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const NODE_PREFIX: &str = "tree";
const SUPERBLOCK_FILE: &str = "tree.meta";
const SUPERBLOCK_MAGIC: Magic = *b"TTSB";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SuperBlock {
    version: u32,
    key_kind: KeyKind,
    root: Option<NodeId>,
    /// Leftmost leaf; splits only ever add right siblings
    first_leaf: Option<NodeId>,
    next_id: NodeId,
    len: u64,
    height: u32,
    nodes: Vec<(NodeId, NodeLocation)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub keys: u64,
    pub height: u32,
    /// Nodes with a record on disk
    pub stored_nodes: usize,
    pub resident_nodes: usize,
    pub resident_leaves: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaf_evictions: u64,
    pub splits: u64,
    pub leaves_reused: u64,
}

struct TreeState<K: TreeKey> {
    config: TreeConfig,
    manager: Arc<NodeManager>,
    arena: Arena<Node<K>>,
    /// Node id -> arena slot of every resident node
    resident: AHashMap<NodeId, usize>,
    /// Resident leaves in recency order
    leaves: LruCache<NodeId, ()>,
    pool: LeafPool<K>,
    root: Option<NodeId>,
    first_leaf: Option<NodeId>,
    next_id: NodeId,
    len: u64,
    height: u32,
    hits: u64,
    misses: u64,
    evictions: u64,
    splits: u64,
}

impl<K: TreeKey> TreeState<K> {
    fn new(config: TreeConfig, manager: Arc<NodeManager>) -> Self {
        let pool = LeafPool::new(config.leaf_pool_capacity);
        Self {
            config,
            manager,
            arena: Arena::new(),
            resident: AHashMap::new(),
            leaves: LruCache::unbounded(),
            pool,
            root: None,
            first_leaf: None,
            next_id: 0,
            len: 0,
            height: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            splits: 0,
        }
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn not_resident(id: NodeId) -> StorageError {
        StorageError::Corruption(format!("Tree node {} is not resident", id))
    }

    fn node(&self, id: NodeId) -> Result<&Node<K>> {
        let slot = *self.resident.get(&id).ok_or_else(|| Self::not_resident(id))?;
        self.arena.get(slot).ok_or_else(|| Self::not_resident(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<K>> {
        let slot = *self.resident.get(&id).ok_or_else(|| Self::not_resident(id))?;
        self.arena.get_mut(slot).ok_or_else(|| Self::not_resident(id))
    }

    fn admit(&mut self, node: Node<K>) {
        let id = node.id();
        let is_leaf = node.is_leaf();
        let slot = self.arena.insert(node);
        self.resident.insert(id, slot);
        if is_leaf {
            self.leaves.put(id, ());
        }
    }

    /// Make node `id` resident, reading it through the node manager
    fn load(&mut self, id: NodeId) -> Result<()> {
        if self.resident.contains_key(&id) {
            self.leaves.get(&id);
            self.hits += 1;
            return Ok(());
        }
        self.misses += 1;
        let node = {
            let bytes = self.manager.read(id)?;
            Node::decode(id, &bytes, &mut self.pool)?
        };
        self.admit(node);
        Ok(())
    }

    /// Leaf whose range holds `key`, setting parent ids along the way
    fn find_leaf(&mut self, key: &K) -> Result<Option<NodeId>> {
        let Some(mut id) = self.root else {
            return Ok(None);
        };
        let mut parent = None;
        loop {
            self.load(id)?;
            let node = self.node_mut(id)?;
            node.set_parent(parent);
            match node {
                Node::Leaf(_) => return Ok(Some(id)),
                Node::Intermediate(inner) => {
                    parent = Some(id);
                    id = inner.child_for_key(key);
                }
            }
        }
    }

    fn get(&mut self, key: &K) -> Result<Option<CoordinateSet>> {
        let Some(id) = self.find_leaf(key)? else {
            return Ok(None);
        };
        match self.node(id)? {
            Node::Leaf(leaf) => Ok(leaf.get(key).copied()),
            Node::Intermediate(_) => Err(Self::not_a_leaf(id)),
        }
    }

    fn not_a_leaf(id: NodeId) -> StorageError {
        StorageError::Corruption(format!("Tree node {} should be a leaf", id))
    }

    fn not_intermediate(id: NodeId) -> StorageError {
        StorageError::Corruption(format!("Tree node {} should be an intermediate node", id))
    }

    fn put(&mut self, key: K, set: &CoordinateSet) -> Result<()> {
        let id = match self.find_leaf(&key)? {
            Some(id) => id,
            None => {
                let id = self.alloc_id();
                let leaf = self.pool.take(id);
                self.admit(Node::Leaf(leaf));
                self.root = Some(id);
                self.first_leaf = Some(id);
                self.height = 1;
                id
            }
        };

        let (added, len) = match self.node_mut(id)? {
            Node::Leaf(leaf) => (leaf.put(key, set), leaf.keys.len()),
            Node::Intermediate(_) => return Err(Self::not_a_leaf(id)),
        };
        if added {
            self.len += 1;
        }
        if len > self.config.max_elements_per_node {
            self.split_leaf(id)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, id: NodeId) -> Result<()> {
        let right_id = self.alloc_id();
        let mut right = self.pool.take(right_id);
        let parent = match self.node_mut(id)? {
            Node::Leaf(leaf) => {
                let mid = leaf.keys.len() / 2;
                right.keys.extend(leaf.keys.drain(mid..));
                right.values.extend(leaf.values.drain(mid..));
                right.next = leaf.next.replace(right_id);
                right.parent = leaf.parent;
                leaf.modified = true;
                leaf.parent
            }
            Node::Intermediate(_) => return Err(Self::not_a_leaf(id)),
        };
        let sep = right
            .keys
            .first()
            .cloned()
            .ok_or_else(|| StorageError::Corruption(format!("Split of leaf {} left no keys", id)))?;
        self.admit(Node::Leaf(right));
        self.splits += 1;
        debug!(node = id, right = right_id, "tree.split_leaf");
        self.insert_into_parent(parent, id, sep, right_id)
    }

    fn split_intermediate(&mut self, id: NodeId) -> Result<()> {
        let right_id = self.alloc_id();
        let mut right = Intermediate::new(right_id);
        let parent = match self.node_mut(id)? {
            Node::Intermediate(node) => {
                let mid = node.keys.len() / 2;
                right.keys = node.keys.split_off(mid);
                right.children = node.children.split_off(mid);
                right.parent = node.parent;
                node.modified = true;
                node.parent
            }
            Node::Leaf(_) => return Err(Self::not_intermediate(id)),
        };
        let sep = right.keys.first().cloned().ok_or_else(|| {
            StorageError::Corruption(format!("Split of node {} left no keys", id))
        })?;
        let moved = right.children.clone();
        self.admit(Node::Intermediate(right));
        for child in moved {
            if let Some(&slot) = self.resident.get(&child) {
                if let Some(node) = self.arena.get_mut(slot) {
                    node.set_parent(Some(right_id));
                }
            }
        }
        self.splits += 1;
        debug!(node = id, right = right_id, "tree.split_intermediate");
        self.insert_into_parent(parent, id, sep, right_id)
    }

    fn insert_into_parent(
        &mut self,
        parent: Option<NodeId>,
        left: NodeId,
        sep: K,
        right: NodeId,
    ) -> Result<()> {
        let Some(parent) = parent else {
            let first = self.node(left)?.first_key().cloned().ok_or_else(|| {
                StorageError::Corruption(format!("Tree node {} has no keys", left))
            })?;
            let root_id = self.alloc_id();
            let mut root = Intermediate::new(root_id);
            root.keys = vec![first, sep];
            root.children = vec![left, right];
            self.admit(Node::Intermediate(root));
            self.node_mut(left)?.set_parent(Some(root_id));
            self.node_mut(right)?.set_parent(Some(root_id));
            self.root = Some(root_id);
            self.height += 1;
            debug!(root = root_id, height = self.height, "tree.grow_root");
            return Ok(());
        };

        let len = match self.node_mut(parent)? {
            Node::Intermediate(node) => {
                node.insert_after(left, sep, right)?;
                node.keys.len()
            }
            Node::Leaf(_) => return Err(Self::not_intermediate(parent)),
        };
        if len > self.config.max_elements_per_node {
            self.split_intermediate(parent)?;
        }
        Ok(())
    }

    /// Evict least recently used leaves down to the cache capacity
    fn shrink_cache(&mut self) -> Result<()> {
        while self.leaves.len() > self.config.node_cache_capacity {
            let Some((&id, _)) = self.leaves.peek_lru() else {
                break;
            };
            let slot = *self.resident.get(&id).ok_or_else(|| Self::not_resident(id))?;
            if let Some(node) = self.arena.get(slot) {
                if node.is_modified() {
                    self.manager.write(id, &node.encode())?;
                }
            }

            self.leaves.pop_lru();
            self.resident.remove(&id);
            if let Some(Node::Leaf(leaf)) = self.arena.remove(slot) {
                self.pool.give(leaf);
            }
            self.evictions += 1;
            trace!(node = id, "tree.evict_leaf");
        }
        Ok(())
    }

    /// Write every modified resident node
    fn write_dirty(&mut self) -> Result<usize> {
        let mut written = 0;
        for (_, node) in self.arena.iter_mut() {
            if node.is_modified() {
                self.manager.write(node.id(), &node.encode())?;
                node.set_modified(false);
                written += 1;
            }
        }
        Ok(written)
    }

    fn superblock(&self) -> SuperBlock {
        SuperBlock {
            version: FORMAT_VERSION,
            key_kind: K::KIND,
            root: self.root,
            first_leaf: self.first_leaf,
            next_id: self.next_id,
            len: self.len,
            height: self.height,
            nodes: self.manager.locations(),
        }
    }

    fn stats(&self) -> TreeStats {
        TreeStats {
            keys: self.len,
            height: self.height,
            stored_nodes: self.manager.len(),
            resident_nodes: self.arena.len(),
            resident_leaves: self.leaves.len(),
            cache_hits: self.hits,
            cache_misses: self.misses,
            leaf_evictions: self.evictions,
            splits: self.splits,
            leaves_reused: self.pool.reused(),
        }
    }
}

/// Disk-backed ordered map from key to [`CoordinateSet`]
pub struct TermTree<K: TreeKey> {
    dir: PathBuf,
    writable: bool,
    manager: Arc<NodeManager>,
    state: Mutex<TreeState<K>>,
}

impl<K: TreeKey> TermTree<K> {
    /// Start an empty tree in `dir`, replacing any previous one
    pub fn create<P: AsRef<Path>>(
        dir: P,
        config: TreeConfig,
        files: FileConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let storage = MultiFileStorage::create(&dir, NODE_PREFIX, files, pool)?;
        let manager = Arc::new(NodeManager::new(storage, config.node_min_bytes, Vec::new()));
        let tree = Self {
            dir,
            writable: true,
            manager: manager.clone(),
            state: Mutex::new(TreeState::new(config, manager)),
        };
        tree.flush()?;
        Ok(tree)
    }

    /// Open a flushed tree read-only
    pub fn open<P: AsRef<Path>>(
        dir: P,
        config: TreeConfig,
        files: FileConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let payload = checksum::read_framed(dir.join(SUPERBLOCK_FILE), SUPERBLOCK_MAGIC)?;
        let superblock: SuperBlock = bincode::deserialize(&payload)?;
        if superblock.version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported tree format version {}",
                superblock.version
            )));
        }
        if superblock.key_kind != K::KIND {
            return Err(StorageError::InvalidArgument(format!(
                "Tree in {} holds {:?} keys, opened as {:?}",
                dir.display(),
                superblock.key_kind,
                K::KIND
            )));
        }

        let storage = MultiFileStorage::open(&dir, NODE_PREFIX, files, pool)?;
        let manager = Arc::new(NodeManager::new(
            storage,
            config.node_min_bytes,
            superblock.nodes,
        ));
        let mut state = TreeState::new(config, manager.clone());
        state.root = superblock.root;
        state.first_leaf = superblock.first_leaf;
        state.next_id = superblock.next_id;
        state.len = superblock.len;
        state.height = superblock.height;

        debug!(
            dir = %dir.display(),
            keys = state.len,
            height = state.height,
            nodes = manager.len(),
            "tree.open"
        );
        Ok(Self {
            dir,
            writable: false,
            manager,
            state: Mutex::new(state),
        })
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn get(&self, key: &K) -> Result<Option<CoordinateSet>> {
        let mut state = self.state.lock();
        let found = state.get(key)?;
        state.shrink_cache()?;
        Ok(found)
    }

    pub fn get_coordinates(&self, key: &K, perm: Permutation) -> Result<Option<Coordinates>> {
        Ok(self.get(key)?.and_then(|set| set.get(perm).copied()))
    }

    /// Store `coords` in the set of `key`, replacing that permutation's slot
    pub fn put(&self, key: K, coords: Coordinates) -> Result<()> {
        self.put_set(key, &CoordinateSet::single(coords))
    }

    /// Merge every present slot of `set` into the set of `key`
    pub fn put_set(&self, key: K, set: &CoordinateSet) -> Result<()> {
        if !self.writable {
            return Err(StorageError::Unsupported(format!(
                "Tree in {} is opened read-only",
                self.dir.display()
            )));
        }
        let mut state = self.state.lock();
        state.put(key, set)?;
        state.shrink_cache()
    }

    /// Ordered iterator over every entry. Pending node writes are flushed
    /// first; entries put while iterating may or may not be seen.
    pub fn itr(&self) -> Result<TreeItr<K>> {
        let first = {
            let mut state = self.state.lock();
            if self.writable {
                state.write_dirty()?;
            }
            state.first_leaf
        };
        Ok(TreeItr {
            manager: self.manager.clone(),
            next_leaf: first,
            entries: Vec::new().into_iter(),
            pool: LeafPool::new(1),
        })
    }

    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> u32 {
        self.state.lock().height
    }

    pub fn stats(&self) -> TreeStats {
        self.state.lock().stats()
    }

    /// Write modified nodes and the superblock
    pub fn flush(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        let mut state = self.state.lock();
        let written = state.write_dirty()?;
        self.manager.sync()?;

        let payload = bincode::serialize(&state.superblock())?;
        checksum::write_framed(self.dir.join(SUPERBLOCK_FILE), SUPERBLOCK_MAGIC, &payload)?;
        debug!(
            nodes_written = written,
            keys = state.len,
            height = state.height,
            "tree.flush"
        );
        Ok(())
    }

    /// Flush, then release every node file
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.manager.close()
    }
}

impl<K: TreeKey> Drop for TermTree<K> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(dir = %self.dir.display(), error = %e, "tree.flush_on_drop_failed");
        }
    }
}

/// Leaf-to-leaf walk over persisted nodes, bypassing the node cache
pub struct TreeItr<K: TreeKey> {
    manager: Arc<NodeManager>,
    next_leaf: Option<NodeId>,
    entries: std::vec::IntoIter<(K, CoordinateSet)>,
    pool: LeafPool<K>,
}

impl<K: TreeKey> TreeItr<K> {
    fn load(&mut self, id: NodeId) -> Result<()> {
        let node = {
            let bytes = self.manager.read(id)?;
            Node::decode(id, &bytes, &mut self.pool)?
        };
        match node {
            Node::Leaf(mut leaf) => {
                self.next_leaf = leaf.next;
                let entries: Vec<_> = leaf.keys.drain(..).zip(leaf.values.drain(..)).collect();
                self.entries = entries.into_iter();
                self.pool.give(leaf);
                Ok(())
            }
            Node::Intermediate(_) => Err(TreeState::<K>::not_a_leaf(id)),
        }
    }
}

impl<K: TreeKey> Iterator for TreeItr<K> {
    type Item = Result<(K, CoordinateSet)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.entries.next() {
                return Some(Ok(entry));
            }
            let id = self.next_leaf.take()?;
            if let Err(e) = self.load(id) {
                return Some(Err(e));
            }
        }
    }
}
