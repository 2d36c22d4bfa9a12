//! tristore storage engine
//!
//! Physical storage beneath a permutation-indexed triple store: sorted
//! integer-pair tables, one set per index permutation, reached through a
//! disk-backed term tree and read through a uniform cursor interface.
//!
//! ## Architecture
//! - Storage layer: size-capped memory-mapped files behind a bounded memory pool
//! - Table layer: Row / Column / Cluster / NewColumn pair-table codecs with a
//!   sparse FileIndex for seeking
//! - Tree layer: B-tree from key to per-permutation coordinates with an LRU
//!   leaf cache
//! - Cursor layer: forward-only seek / mark / reset cursors for merge joins
//!
//! ## Example
//! ```no_run
//! use tristore::{collect_pairs, PairStore, Permutation, StoreConfig};
//!
//! # fn main() -> tristore::Result<()> {
//! let store = PairStore::create("/tmp/partition", StoreConfig::default())?;
//! store.bulk_load(&[(1, 2, 3), (1, 2, 4), (5, 2, 3)])?;
//!
//! let mut cursor = store.cursor(Permutation::Pos, 2, Some(3), None)?;
//! assert_eq!(collect_pairs(cursor.as_mut())?, vec![(3, 1), (3, 5)]);
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cursor;
pub mod encoding;
pub mod storage;
pub mod store;
pub mod table;
pub mod tree;
pub mod types;

mod error;

pub use config::{StoreConfig, StrategyPolicy, TableConfig, TreeConfig};
pub use cursor::{collect_pairs, Checkpoint, CursorType, PairCursor};
pub use error::{Result, StorageError};
pub use store::{PairStore, PermutationTable, Triple};
pub use tree::TermTree;
pub use types::{CoordinateSet, Coordinates, Pair, Permutation, Strategy};
