//! Store configuration
//!
//! Every tunable of the storage core lives in one explicit [`StoreConfig`]
//! that is threaded into the tree, the pair-table writers and the memory
//! pool at construction time. Nothing is read from process-wide state.

use crate::types::{Strategy, NUM_PERMUTATIONS};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest file size a `(file, pos)` coordinate can address (positions are i32).
pub const MAX_ADDRESSABLE_FILE_SIZE: u64 = i32::MAX as u64;

/// Files a store keeps pinned while writing: one per permutation plus the tree.
pub const MIN_OPEN_FILES: usize = NUM_PERMUTATIONS + 1;

/// Term index tree settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// A node splits once it holds more than this many keys
    pub max_elements_per_node: usize,

    /// Minimum byte extent reserved per serialized node (room to grow in place)
    pub node_min_bytes: usize,

    /// Number of leaves kept live in the node cache
    pub node_cache_capacity: usize,

    /// Number of recycled leaf objects kept by the leaf pool
    pub leaf_pool_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_elements_per_node: 1024,
            node_min_bytes: 512,
            node_cache_capacity: 1024,
            leaf_pool_capacity: 256,
        }
    }
}

/// Multi-file storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Files roll over once an append would cross this size
    pub max_file_size: u64,

    /// Initial mapping size of a freshly created file (grows geometrically)
    pub initial_map_size: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            max_file_size: 64 * 1024 * 1024, // 64MB
            initial_map_size: 1024 * 1024,   // 1MB
        }
    }
}

/// Bounded memory pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Ceiling on the bytes of all registered mappings
    pub max_bytes: usize,

    /// Ceiling on the number of registered mappings (open files)
    pub max_open_files: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024, // 1GB
            max_open_files: 256,
        }
    }
}

/// Delta policy of the Row layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffMode {
    /// Store absolute values
    NoDiff,
    /// Store the difference from the previous row
    Delta,
}

/// Field width policy of the Row layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WidthMode {
    /// Minimal fixed width computed over the whole table
    Fixed,
    /// LEB128 varint
    Varint,
    /// MSB-first 7-bit groups
    AltVarint,
}

/// Per-table compression policy of the Row layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowCompression {
    pub diff: DiffMode,
    pub width: WidthMode,
}

impl RowCompression {
    pub const fn new(diff: DiffMode, width: WidthMode) -> Self {
        Self { diff, width }
    }

    /// No compression at all: absolute values, fixed width
    pub const fn none() -> Self {
        Self::new(DiffMode::NoDiff, WidthMode::Fixed)
    }

    /// Packed into the first header byte of a Row table
    pub fn to_byte(self) -> u8 {
        let diff = match self.diff {
            DiffMode::NoDiff => 0,
            DiffMode::Delta => 1,
        };
        let width = match self.width {
            WidthMode::Fixed => 0,
            WidthMode::Varint => 1,
            WidthMode::AltVarint => 2,
        };
        (diff << 4) | width
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        let diff = match byte >> 4 {
            0 => DiffMode::NoDiff,
            1 => DiffMode::Delta,
            other => {
                return Err(StorageError::Corruption(format!(
                    "Unknown row diff mode {}",
                    other
                )))
            }
        };
        let width = match byte & 0x0F {
            0 => WidthMode::Fixed,
            1 => WidthMode::Varint,
            2 => WidthMode::AltVarint,
            other => {
                return Err(StorageError::Corruption(format!(
                    "Unknown row width mode {}",
                    other
                )))
            }
        };
        Ok(Self { diff, width })
    }
}

impl Default for RowCompression {
    fn default() -> Self {
        Self::new(DiffMode::Delta, WidthMode::Varint)
    }
}

/// How the layout of each pair table is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyPolicy {
    /// Every table uses the same layout (Row is used anyway when the
    /// encoded table would not fit in one file)
    Fixed(Strategy),

    /// Choose per table; tables with at most `threshold` rows stay Row
    Adaptive { threshold: u64 },
}

impl Default for StrategyPolicy {
    fn default() -> Self {
        StrategyPolicy::Adaptive { threshold: 64 }
    }
}

/// Pair-table writer/reader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub strategy: StrategyPolicy,

    pub row_compression: RowCompression,

    /// Rows (Row) or groups (Cluster) between two FileIndex entries
    pub first_index_size: usize,

    /// Cluster groups larger than this get a nested index keyed by t2
    pub additional_index_threshold: usize,

    /// Elements between two entries of a nested index
    pub additional_index_step: usize,

    /// Number of small tables kept materialized by the pair cache
    pub cache_capacity: usize,

    /// Tables with at most this many rows are eligible for the pair cache
    pub cache_max_rows: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyPolicy::default(),
            row_compression: RowCompression::default(),
            first_index_size: 1024,
            additional_index_threshold: 4096,
            additional_index_step: 512,
            cache_capacity: 128,
            cache_max_rows: 256,
        }
    }
}

/// Complete configuration of one store partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    pub tree: TreeConfig,
    pub files: FileConfig,
    pub pool: PoolConfig,
    pub tables: TableConfig,
}

impl StoreConfig {
    /// Small limits that make splits, rollovers and evictions happen on
    /// tiny data sets
    pub fn for_testing() -> Self {
        Self {
            tree: TreeConfig {
                max_elements_per_node: 8,
                node_min_bytes: 64,
                node_cache_capacity: 4,
                leaf_pool_capacity: 4,
            },
            files: FileConfig {
                max_file_size: 64 * 1024,
                initial_map_size: 4096,
            },
            pool: PoolConfig {
                max_bytes: 8 * 1024 * 1024,
                max_open_files: 64,
            },
            tables: TableConfig {
                first_index_size: 4,
                additional_index_threshold: 32,
                additional_index_step: 8,
                cache_capacity: 8,
                cache_max_rows: 16,
                ..Default::default()
            },
        }
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.tree.max_elements_per_node < 4 {
            return Err(StorageError::InvalidArgument(format!(
                "max_elements_per_node must be >= 4, got {}",
                self.tree.max_elements_per_node
            )));
        }
        if self.tree.node_cache_capacity == 0 {
            return Err(StorageError::InvalidArgument(
                "node_cache_capacity must be > 0".into(),
            ));
        }
        if self.files.max_file_size == 0 || self.files.max_file_size > MAX_ADDRESSABLE_FILE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "max_file_size must be in 1..={}, got {}",
                MAX_ADDRESSABLE_FILE_SIZE, self.files.max_file_size
            )));
        }
        if self.files.initial_map_size == 0 {
            return Err(StorageError::InvalidArgument(
                "initial_map_size must be > 0".into(),
            ));
        }
        if self.pool.max_bytes == 0 {
            return Err(StorageError::InvalidArgument(
                "memory pool max_bytes must be > 0".into(),
            ));
        }
        if self.pool.max_open_files < MIN_OPEN_FILES {
            return Err(StorageError::InvalidArgument(format!(
                "max_open_files must be >= {}, got {}",
                MIN_OPEN_FILES, self.pool.max_open_files
            )));
        }
        if self.tables.first_index_size == 0 || self.tables.additional_index_step == 0 {
            return Err(StorageError::InvalidArgument(
                "index spacing must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Load a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: StoreConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        StoreConfig::default().validate().unwrap();
        StoreConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_oversized_files() {
        let mut config = StoreConfig::default();
        config.files.max_file_size = MAX_ADDRESSABLE_FILE_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.tree.max_elements_per_node = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_open_file_budget() {
        let mut config = StoreConfig::for_testing();
        config.pool.max_open_files = 6;
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidArgument(_))
        ));

        config.pool.max_open_files = 7;
        config.validate().unwrap();
    }

    #[test]
    fn test_row_compression_byte() {
        for diff in [DiffMode::NoDiff, DiffMode::Delta] {
            for width in [WidthMode::Fixed, WidthMode::Varint, WidthMode::AltVarint] {
                let c = RowCompression::new(diff, width);
                assert_eq!(RowCompression::from_byte(c.to_byte()).unwrap(), c);
            }
        }
        assert!(RowCompression::from_byte(0x23).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let mut config = StoreConfig::for_testing();
        config.tables.strategy = StrategyPolicy::Fixed(Strategy::Cluster);
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
