//! Bounded Memory Pool
//!
//! Tracks the byte cost of every open file mapping and evicts the
//! least-recently-touched unpinned one when a ceiling is crossed.
//!
//! ## Contract
//! - `register` records a block and its owner; the owner is told through
//!   [`EvictionOwner::on_evict`] when the block is evicted and must clear
//!   its slot (re-creating it on next access)
//! - `add_lock` / `release_lock` pin and unpin; a pinned block is never evicted
//! - the tracked total never exceeds `max_bytes`: when nothing unpinned can
//!   make room the request fails with `ResourceExhausted` and nothing changes
//!
//! Owners are notified after the pool lock is released, so an owner may call
//! back into the pool from `on_evict`.

use crate::config::PoolConfig;
use crate::{Result, StorageError};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Weak;
use tracing::{debug, warn};

/// Handle of one registered block
pub type BlockId = u64;

/// Object that owns evictable blocks
pub trait EvictionOwner: Send + Sync {
    /// The block registered for `slot` was evicted
    fn on_evict(&self, slot: usize);
}

struct Block {
    bytes: usize,
    pins: u32,
    owner: Weak<dyn EvictionOwner>,
    slot: usize,
}

struct Victim {
    id: BlockId,
    owner: Weak<dyn EvictionOwner>,
    slot: usize,
    bytes: usize,
}

/// Pool statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub registered: u64,
    pub evictions: u64,
    pub exhausted: u64,
    pub total_bytes: usize,
    pub blocks: usize,
}

struct PoolInner {
    /// Recency order: most recently touched first
    blocks: LruCache<BlockId, Block>,
    total: usize,
    next_id: BlockId,
    stats: PoolStats,
}

pub struct MemoryPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl MemoryPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                blocks: LruCache::unbounded(),
                total: 0,
                next_id: 1,
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a block of `bytes` owned by `owner` at `slot`.
    ///
    /// May evict older unpinned blocks first.
    pub fn register(
        &self,
        bytes: usize,
        owner: Weak<dyn EvictionOwner>,
        slot: usize,
    ) -> Result<BlockId> {
        if bytes > self.config.max_bytes {
            return Err(StorageError::ResourceExhausted(format!(
                "Block of {} bytes exceeds pool ceiling of {} bytes",
                bytes, self.config.max_bytes
            )));
        }

        let (id, victims) = {
            let mut inner = self.inner.lock();
            let victims = self.make_room(&mut inner, bytes, 1, None)?;

            let id = inner.next_id;
            inner.next_id += 1;
            inner.blocks.put(
                id,
                Block {
                    bytes,
                    pins: 0,
                    owner,
                    slot,
                },
            );
            inner.total += bytes;
            inner.stats.registered += 1;
            (id, victims)
        };

        Self::notify(victims);
        Ok(id)
    }

    /// Change the cost of a registered block (a mapping grew)
    pub fn resize(&self, id: BlockId, bytes: usize) -> Result<()> {
        if bytes > self.config.max_bytes {
            return Err(StorageError::ResourceExhausted(format!(
                "Block of {} bytes exceeds pool ceiling of {} bytes",
                bytes, self.config.max_bytes
            )));
        }

        let victims = {
            let mut inner = self.inner.lock();
            let old = inner
                .blocks
                .peek(&id)
                .map(|b| b.bytes)
                .ok_or_else(|| StorageError::NotFound(format!("Pool block {}", id)))?;

            let victims = if bytes > old {
                self.make_room(&mut inner, bytes - old, 0, Some(id))?
            } else {
                Vec::new()
            };

            if let Some(block) = inner.blocks.peek_mut(&id) {
                block.bytes = bytes;
            }
            inner.total = inner.total - old + bytes;
            victims
        };

        Self::notify(victims);
        Ok(())
    }

    /// Mark a block as recently used
    pub fn touch(&self, id: BlockId) {
        let mut inner = self.inner.lock();
        inner.blocks.promote(&id);
    }

    /// Pin a block. Fails with `NotFound` when it was already evicted.
    pub fn add_lock(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.blocks.get_mut(&id) {
            Some(block) => {
                block.pins += 1;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("Pool block {}", id))),
        }
    }

    /// Unpin a block. Unknown ids are ignored (the block was unregistered).
    pub fn release_lock(&self, id: BlockId) {
        let mut inner = self.inner.lock();
        if let Some(block) = inner.blocks.peek_mut(&id) {
            if block.pins == 0 {
                warn!(block = id, "pool.release_lock.unbalanced");
            } else {
                block.pins -= 1;
            }
        }
    }

    /// Forget a block without notifying its owner (the owner closed it)
    pub fn unregister(&self, id: BlockId) -> Option<usize> {
        let mut inner = self.inner.lock();
        let block = inner.blocks.pop(&id)?;
        inner.total -= block.bytes;
        Some(block.bytes)
    }

    pub fn pin_count(&self, id: BlockId) -> Option<u32> {
        self.inner.lock().blocks.peek(&id).map(|b| b.pins)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().blocks.contains(&id)
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total_bytes: inner.total,
            blocks: inner.blocks.len(),
            ..inner.stats.clone()
        }
    }

    /// Evict oldest unpinned blocks until `extra_bytes` more bytes and
    /// `extra_blocks` more blocks fit. All or nothing.
    fn make_room(
        &self,
        inner: &mut PoolInner,
        extra_bytes: usize,
        extra_blocks: usize,
        exclude: Option<BlockId>,
    ) -> Result<Vec<Victim>> {
        let mut bytes_over = (inner.total + extra_bytes).saturating_sub(self.config.max_bytes);
        let mut blocks_over =
            (inner.blocks.len() + extra_blocks).saturating_sub(self.config.max_open_files);

        if bytes_over == 0 && blocks_over == 0 {
            return Ok(Vec::new());
        }

        // Oldest first
        let mut chosen = Vec::new();
        for (id, block) in inner.blocks.iter().rev() {
            if bytes_over == 0 && blocks_over == 0 {
                break;
            }
            if block.pins > 0 || Some(*id) == exclude {
                continue;
            }
            chosen.push(*id);
            bytes_over = bytes_over.saturating_sub(block.bytes);
            blocks_over = blocks_over.saturating_sub(1);
        }

        if bytes_over > 0 || blocks_over > 0 {
            inner.stats.exhausted += 1;
            warn!(
                total = inner.total,
                requested = extra_bytes,
                ceiling = self.config.max_bytes,
                blocks = inner.blocks.len(),
                "pool.exhausted"
            );
            return Err(StorageError::ResourceExhausted(format!(
                "Memory pool cannot make room for {} bytes: {} of {} bytes in use, all evictable blocks pinned",
                extra_bytes, inner.total, self.config.max_bytes
            )));
        }

        let mut victims = Vec::with_capacity(chosen.len());
        for id in chosen {
            if let Some(block) = inner.blocks.pop(&id) {
                inner.total -= block.bytes;
                inner.stats.evictions += 1;
                victims.push(Victim {
                    id,
                    owner: block.owner,
                    slot: block.slot,
                    bytes: block.bytes,
                });
            }
        }
        Ok(victims)
    }

    fn notify(victims: Vec<Victim>) {
        for victim in victims {
            debug!(
                block = victim.id,
                slot = victim.slot,
                bytes = victim.bytes,
                "pool.evict"
            );
            if let Some(owner) = victim.owner.upgrade() {
                owner.on_evict(victim.slot);
            }
        }
    }
}
