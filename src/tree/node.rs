//! Tree nodes and their record format
//!
//! ```text
//! Leaf:         [0][n varint][next varint, 0 = none] then n × [key][CoordinateSet]
//! Intermediate: [1][n varint] then n × [separator key][child id varint]
//! ```
//!
//! Separator `i` of an intermediate node is the smallest key routed to
//! child `i`. Parent ids are runtime state set on descent and are not
//! stored.

use super::key::TreeKey;
use crate::encoding::{get_u8, get_varint, put_varint};
use crate::types::CoordinateSet;
use crate::{Result, StorageError};

pub type NodeId = u64;

const TAG_LEAF: u8 = 0;
const TAG_INTERMEDIATE: u8 = 1;

#[derive(Debug)]
pub struct Leaf<K> {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub keys: Vec<K>,
    pub values: Vec<CoordinateSet>,
    /// Right sibling
    pub next: Option<NodeId>,
    pub modified: bool,
}

impl<K: TreeKey> Leaf<K> {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
            modified: true,
        }
    }

    /// Merge `set` into the entry of `key`; true when the key is new
    pub fn put(&mut self, key: K, set: &CoordinateSet) -> bool {
        self.modified = true;
        match self.keys.binary_search(&key) {
            Ok(i) => {
                self.values[i].merge(set);
                false
            }
            Err(i) => {
                self.keys.insert(i, key);
                self.values.insert(i, *set);
                true
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&CoordinateSet> {
        self.keys
            .binary_search(key)
            .ok()
            .map(|i| &self.values[i])
    }

    fn reset(&mut self, id: NodeId) {
        self.id = id;
        self.parent = None;
        self.keys.clear();
        self.values.clear();
        self.next = None;
        self.modified = true;
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_LEAF);
        put_varint(out, self.keys.len() as u64);
        put_varint(out, self.next.map_or(0, |id| id + 1));
        for (key, set) in self.keys.iter().zip(&self.values) {
            key.encode(out);
            set.encode(out);
        }
    }

    fn decode_body(&mut self, buf: &[u8], pos: &mut usize) -> Result<()> {
        let n = get_varint(buf, pos)? as usize;
        self.next = get_varint(buf, pos)?.checked_sub(1);
        for _ in 0..n {
            let key = K::decode(buf, pos)?;
            if let Some(last) = self.keys.last() {
                if *last >= key {
                    return Err(StorageError::Corruption(format!(
                        "Leaf {} keys out of order: {:?} then {:?}",
                        self.id, last, key
                    )));
                }
            }
            self.keys.push(key);
            self.values.push(CoordinateSet::decode(buf, pos)?);
        }
        self.modified = false;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Intermediate<K> {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub keys: Vec<K>,
    pub children: Vec<NodeId>,
    pub modified: bool,
}

impl<K: TreeKey> Intermediate<K> {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            parent: None,
            keys: Vec::new(),
            children: Vec::new(),
            modified: true,
        }
    }

    /// Child whose key range holds `key`
    pub fn child_for_key(&self, key: &K) -> NodeId {
        let idx = self.keys.partition_point(|k| k <= key);
        self.children[idx.saturating_sub(1)]
    }

    /// Insert `right` with separator `sep` just after `left`
    pub fn insert_after(&mut self, left: NodeId, sep: K, right: NodeId) -> Result<()> {
        let at = self
            .children
            .iter()
            .position(|child| *child == left)
            .ok_or_else(|| {
                StorageError::Corruption(format!(
                    "Node {} is not a child of {}",
                    left, self.id
                ))
            })?;
        self.keys.insert(at + 1, sep);
        self.children.insert(at + 1, right);
        self.modified = true;
        Ok(())
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TAG_INTERMEDIATE);
        put_varint(out, self.keys.len() as u64);
        for (key, child) in self.keys.iter().zip(&self.children) {
            key.encode(out);
            put_varint(out, *child);
        }
    }

    fn decode_body(id: NodeId, buf: &[u8], pos: &mut usize) -> Result<Self> {
        let n = get_varint(buf, pos)? as usize;
        if n == 0 {
            return Err(StorageError::Corruption(format!(
                "Intermediate node {} has no children",
                id
            )));
        }
        let mut node = Self::new(id);
        for _ in 0..n {
            node.keys.push(K::decode(buf, pos)?);
            node.children.push(get_varint(buf, pos)?);
        }
        node.modified = false;
        Ok(node)
    }
}

#[derive(Debug)]
pub enum Node<K> {
    Leaf(Leaf<K>),
    Intermediate(Intermediate<K>),
}

impl<K: TreeKey> Node<K> {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Leaf(leaf) => leaf.id,
            Node::Intermediate(node) => node.id,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn is_modified(&self) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.modified,
            Node::Intermediate(node) => node.modified,
        }
    }

    pub fn set_modified(&mut self, modified: bool) {
        match self {
            Node::Leaf(leaf) => leaf.modified = modified,
            Node::Intermediate(node) => node.modified = modified,
        }
    }

    pub fn set_parent(&mut self, parent: Option<NodeId>) {
        match self {
            Node::Leaf(leaf) => leaf.parent = parent,
            Node::Intermediate(node) => node.parent = parent,
        }
    }

    pub fn first_key(&self) -> Option<&K> {
        match self {
            Node::Leaf(leaf) => leaf.keys.first(),
            Node::Intermediate(node) => node.keys.first(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Intermediate(node) => node.keys.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Node::Leaf(leaf) => leaf.encode(&mut out),
            Node::Intermediate(node) => node.encode(&mut out),
        }
        out
    }

    /// Decode a node record, reusing a pooled leaf when it is one
    pub fn decode(id: NodeId, buf: &[u8], pool: &mut LeafPool<K>) -> Result<Self> {
        let mut pos = 0;
        let node = match get_u8(buf, &mut pos)? {
            TAG_LEAF => {
                let mut leaf = pool.take(id);
                if let Err(e) = leaf.decode_body(buf, &mut pos) {
                    pool.give(leaf);
                    return Err(e);
                }
                Node::Leaf(leaf)
            }
            TAG_INTERMEDIATE => Node::Intermediate(Intermediate::decode_body(id, buf, &mut pos)?),
            tag => {
                return Err(StorageError::Corruption(format!(
                    "Node {} has unknown tag {}",
                    id, tag
                )))
            }
        };
        if pos != buf.len() {
            return Err(StorageError::Corruption(format!(
                "Node {} record has {} trailing bytes",
                id,
                buf.len() - pos
            )));
        }
        Ok(node)
    }
}

/// Recycled leaves, so evictions and reloads reuse their allocations
#[derive(Debug)]
pub struct LeafPool<K> {
    free: Vec<Leaf<K>>,
    capacity: usize,
    reused: u64,
}

impl<K: TreeKey> LeafPool<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
            reused: 0,
        }
    }

    pub fn take(&mut self, id: NodeId) -> Leaf<K> {
        match self.free.pop() {
            Some(mut leaf) => {
                leaf.reset(id);
                self.reused += 1;
                leaf
            }
            None => Leaf::new(id),
        }
    }

    pub fn give(&mut self, leaf: Leaf<K>) {
        if self.free.len() < self.capacity {
            self.free.push(leaf);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn reused(&self) -> u64 {
        self.reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Coordinates, Permutation, Strategy};

    fn set(count: u64) -> CoordinateSet {
        CoordinateSet::single(Coordinates::new(
            Permutation::Pos,
            count,
            1,
            count as u32 * 8,
            Strategy::Cluster,
        ))
    }

    #[test]
    fn test_leaf_record() {
        let mut pool = LeafPool::new(2);
        let mut leaf = pool.take(7);
        assert!(leaf.put(30i64, &set(3)));
        assert!(leaf.put(-4, &set(1)));
        assert!(!leaf.put(30, &set(9)));
        leaf.next = Some(12);

        let bytes = Node::Leaf(leaf).encode();
        let Node::Leaf(decoded) = Node::<i64>::decode(7, &bytes, &mut pool).unwrap() else {
            panic!("expected a leaf");
        };
        assert_eq!(decoded.keys, vec![-4, 30]);
        assert_eq!(decoded.get(&30), Some(&set(9)));
        assert_eq!(decoded.next, Some(12));
        assert!(!decoded.modified);
    }

    #[test]
    fn test_intermediate_routing() {
        let mut node = Intermediate::new(1);
        node.keys = vec![0i64, 10, 20];
        node.children = vec![100, 101, 102];
        assert_eq!(node.child_for_key(&-5), 100);
        assert_eq!(node.child_for_key(&9), 100);
        assert_eq!(node.child_for_key(&10), 101);
        assert_eq!(node.child_for_key(&99), 102);

        node.insert_after(101, 15, 103).unwrap();
        assert_eq!(node.children, vec![100, 101, 103, 102]);
        assert_eq!(node.child_for_key(&17), 103);
        assert!(node.insert_after(555, 1, 104).is_err());

        let mut pool = LeafPool::new(0);
        let bytes = Node::Intermediate(node).encode();
        match Node::<i64>::decode(1, &bytes, &mut pool).unwrap() {
            Node::Intermediate(decoded) => {
                assert_eq!(decoded.keys, vec![0, 10, 15, 20]);
                assert_eq!(decoded.children, vec![100, 101, 103, 102]);
            }
            Node::Leaf(_) => panic!("expected an intermediate node"),
        }
    }

    #[test]
    fn test_pool_recycles_leaves() {
        let mut pool: LeafPool<i64> = LeafPool::new(1);
        let mut leaf = pool.take(1);
        leaf.put(5, &set(1));
        pool.give(leaf);
        pool.give(Leaf::new(2));
        assert_eq!(pool.len(), 1);

        let leaf = pool.take(3);
        assert_eq!(leaf.id, 3);
        assert!(leaf.keys.is_empty());
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_bad_tag_is_corruption() {
        let mut pool: LeafPool<i64> = LeafPool::new(1);
        assert!(matches!(
            Node::decode(1, &[9, 0], &mut pool),
            Err(StorageError::Corruption(_))
        ));
    }
}
