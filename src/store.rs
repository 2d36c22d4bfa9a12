//! Permutation tables and the partition that ties them to the term tree
//!
//! ## Layout of a store directory
//! ```text
//! store.json        configuration
//! tree/             term tree: key -> coordinates of its six tables
//! spo.0, spo.1 ...  pair tables of one permutation (one set per permutation)
//! spo.fidx          FileIndex blobs of that permutation, keyed by tree key
//! ```
//!
//! A store is bulk loaded once after `create`; `open` gives a read-only
//! view. Each permutation owns its files and its index map, so the six
//! permutations load in parallel and only meet in the tree.

use crate::config::{StoreConfig, TableConfig};
use crate::cursor::{collect_pairs, AggregatePairCursor, ArrayPairCursor, PairCursor};
use crate::encoding::{get_varint, put_varint, unzigzag, zigzag};
use crate::storage::checksum::{self, Magic};
use crate::storage::{FileIndex, MemoryPool, MultiFileStorage, PoolStats};
use crate::table::{self, PairTableWriter, TableBuilder, TableReader};
use crate::tree::{TermTree, TreeStats};
use crate::types::{Coordinates, Pair, Permutation};
use crate::{Result, StorageError};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// `(subject, predicate, object)`
pub type Triple = (i64, i64, i64);

const CONFIG_FILE: &str = "store.json";
const TREE_DIR: &str = "tree";
const INDEX_MAGIC: Magic = *b"TPIX";

/// Pair tables of one permutation
pub struct PermutationTable {
    perm: Permutation,
    index_path: PathBuf,
    storage: Arc<MultiFileStorage>,
    config: TableConfig,
    indexes: DashMap<i64, Arc<FileIndex>>,
}

impl PermutationTable {
    pub fn create<P: AsRef<Path>>(
        dir: P,
        perm: Permutation,
        config: &StoreConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let storage = MultiFileStorage::create(dir, perm.name(), config.files.clone(), pool)?;
        Ok(Self {
            perm,
            index_path: Self::index_path(dir, perm),
            storage,
            config: config.tables.clone(),
            indexes: DashMap::new(),
        })
    }

    pub fn open<P: AsRef<Path>>(
        dir: P,
        perm: Permutation,
        config: &StoreConfig,
        pool: Arc<MemoryPool>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let storage = MultiFileStorage::open(dir, perm.name(), config.files.clone(), pool)?;
        let table = Self {
            perm,
            index_path: Self::index_path(dir, perm),
            storage,
            config: config.tables.clone(),
            indexes: DashMap::new(),
        };
        table.read_indexes()?;
        Ok(table)
    }

    fn index_path(dir: &Path, perm: Permutation) -> PathBuf {
        dir.join(format!("{}.fidx", perm.name()))
    }

    pub fn permutation(&self) -> Permutation {
        self.perm
    }

    pub fn storage(&self) -> &Arc<MultiFileStorage> {
        &self.storage
    }

    /// Number of keys whose table carries a FileIndex
    pub fn num_indexes(&self) -> usize {
        self.indexes.len()
    }

    pub fn writer(&self) -> PermutationWriter<'_> {
        PermutationWriter {
            table: self,
            builder: TableBuilder::new(self.storage.clone(), self.config.clone()),
            key: None,
        }
    }

    pub fn open_reader(&self, key: i64, coords: &Coordinates) -> Result<TableReader> {
        if coords.permutation != self.perm {
            return Err(StorageError::InvalidArgument(format!(
                "Coordinates of {} passed to the {} table",
                coords.permutation.name(),
                self.perm.name()
            )));
        }
        let index = self.indexes.get(&key).map(|entry| entry.value().clone());
        TableReader::open(
            &self.storage,
            coords.file,
            coords.offset as u64,
            coords.element_count,
            coords.strategy,
            index,
        )
    }

    /// Write one table per key of `triples` under this permutation and
    /// record each table in `tree`. Returns `(tables, pairs)`.
    pub fn load(&self, triples: &[Triple], tree: &TermTree<i64>) -> Result<(u64, u64)> {
        let mut rows: Vec<Triple> = triples
            .iter()
            .map(|&(s, p, o)| self.perm.order(s, p, o))
            .collect();
        rows.par_sort_unstable();
        rows.dedup();

        let mut writer = self.writer();
        let mut tables = 0u64;
        let mut rest = rows.as_slice();
        while let Some(&(key, _, _)) = rest.first() {
            let len = rest.partition_point(|row| row.0 == key);
            let (group, tail) = rest.split_at(len);
            rest = tail;

            writer.start_append(key)?;
            for &(_, t1, t2) in group {
                writer.append(t1, t2)?;
            }
            let coords = writer.stop_append()?;
            tree.put(key, coords)?;
            tables += 1;
        }

        debug!(
            perm = self.perm.name(),
            tables,
            pairs = rows.len(),
            files = self.storage.num_files(),
            "store.load_permutation"
        );
        Ok((tables, rows.len() as u64))
    }

    fn write_indexes(&self) -> Result<()> {
        let mut entries: Vec<(i64, Arc<FileIndex>)> = self
            .indexes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);

        let mut payload = Vec::new();
        put_varint(&mut payload, entries.len() as u64);
        for (key, index) in &entries {
            put_varint(&mut payload, zigzag(*key));
            index.serialize(&mut payload);
        }
        checksum::write_framed(&self.index_path, INDEX_MAGIC, &payload)
    }

    fn read_indexes(&self) -> Result<()> {
        let payload = checksum::read_framed(&self.index_path, INDEX_MAGIC)?;
        let mut pos = 0;
        let count = get_varint(&payload, &mut pos)?;
        for _ in 0..count {
            let key = unzigzag(get_varint(&payload, &mut pos)?);
            let index = FileIndex::deserialize(&payload, &mut pos)?;
            self.indexes.insert(key, Arc::new(index));
        }
        if pos != payload.len() {
            return Err(StorageError::Corruption(format!(
                "{} has {} trailing bytes",
                self.index_path.display(),
                payload.len() - pos
            )));
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        if !self.storage.is_writable() {
            return Ok(());
        }
        self.storage.sync()?;
        self.write_indexes()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.storage.close()
    }
}

/// Table writer of one permutation, one key at a time
pub struct PermutationWriter<'a> {
    table: &'a PermutationTable,
    builder: TableBuilder,
    key: Option<i64>,
}

impl PermutationWriter<'_> {
    pub fn start_append(&mut self, key: i64) -> Result<()> {
        if let Some(open) = self.key {
            return Err(StorageError::InvalidArgument(format!(
                "Table of key {} is still open",
                open
            )));
        }
        self.builder.start_append()?;
        self.key = Some(key);
        Ok(())
    }

    pub fn append(&mut self, t1: i64, t2: i64) -> Result<()> {
        if self.key.is_none() {
            return Err(StorageError::InvalidArgument(
                "append outside start_append/stop_append".into(),
            ));
        }
        self.builder.append(t1, t2)
    }

    pub fn stop_append(&mut self) -> Result<Coordinates> {
        let key = self.key.take().ok_or_else(|| {
            StorageError::InvalidArgument("stop_append without start_append".into())
        })?;
        let summary = self.builder.stop_append()?;
        let offset = u32::try_from(summary.offset).map_err(|_| {
            StorageError::InvalidData(format!(
                "Table offset {} does not fit in coordinates",
                summary.offset
            ))
        })?;

        match summary.index {
            Some(index) => {
                self.table.indexes.insert(key, Arc::new(index));
            }
            None => {
                self.table.indexes.remove(&key);
            }
        }
        Ok(Coordinates::new(
            self.table.perm,
            summary.n_elements,
            summary.file,
            offset,
            summary.strategy,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub triples: u64,
    /// Tables written, summed over permutations
    pub tables: u64,
    /// Distinct keys in the tree afterwards
    pub keys: u64,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub tree: TreeStats,
    pub pool: PoolStats,
    /// Data files per permutation, in permutation order
    pub files: Vec<usize>,
    pub cached_tables: usize,
}

/// One partition: six permutation tables and the term tree over their keys
pub struct PairStore {
    dir: PathBuf,
    config: StoreConfig,
    pool: Arc<MemoryPool>,
    tree: TermTree<i64>,
    tables: Vec<PermutationTable>,
    /// Materialized small tables
    cache: Option<Mutex<LruCache<(Permutation, i64), Arc<[Pair]>>>>,
}

impl PairStore {
    /// Start an empty store in `dir`, replacing any previous one
    pub fn create<P: AsRef<Path>>(dir: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        config.save(dir.join(CONFIG_FILE))?;

        let pool = Arc::new(MemoryPool::new(config.pool.clone()));
        let tree = TermTree::create(
            dir.join(TREE_DIR),
            config.tree.clone(),
            config.files.clone(),
            pool.clone(),
        )?;
        let tables = Permutation::ALL
            .iter()
            .map(|perm| PermutationTable::create(&dir, *perm, &config, pool.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(dir = %dir.display(), "store.create");
        Ok(Self::assemble(dir, config, pool, tree, tables))
    }

    /// Open a closed store read-only
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = StoreConfig::load(dir.join(CONFIG_FILE))?;

        let pool = Arc::new(MemoryPool::new(config.pool.clone()));
        let tree = TermTree::open(
            dir.join(TREE_DIR),
            config.tree.clone(),
            config.files.clone(),
            pool.clone(),
        )?;
        let tables = Permutation::ALL
            .iter()
            .map(|perm| PermutationTable::open(&dir, *perm, &config, pool.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(dir = %dir.display(), keys = tree.len(), "store.open");
        Ok(Self::assemble(dir, config, pool, tree, tables))
    }

    fn assemble(
        dir: PathBuf,
        config: StoreConfig,
        pool: Arc<MemoryPool>,
        tree: TermTree<i64>,
        tables: Vec<PermutationTable>,
    ) -> Self {
        let cache = NonZeroUsize::new(config.tables.cache_capacity)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self {
            dir,
            config,
            pool,
            tree,
            tables,
            cache,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_writable(&self) -> bool {
        self.tree.is_writable()
    }

    pub fn tree(&self) -> &TermTree<i64> {
        &self.tree
    }

    pub fn table(&self, perm: Permutation) -> &PermutationTable {
        &self.tables[perm.index()]
    }

    /// Index `triples` under all six permutations, one thread each.
    ///
    /// Duplicate triples are stored once. Loading again adds new tables and
    /// repoints the keys it touches: for each permutation, a key present in
    /// the later load reads only that load's pairs, and its earlier triples
    /// under that permutation are no longer reachable. Keys the later load
    /// does not mention keep their tables.
    pub fn bulk_load(&self, triples: &[Triple]) -> Result<LoadStats> {
        if !self.is_writable() {
            return Err(StorageError::Unsupported(format!(
                "Store in {} is opened read-only",
                self.dir.display()
            )));
        }

        let loaded = self
            .tables
            .par_iter()
            .map(|table| table.load(triples, &self.tree))
            .collect::<Result<Vec<_>>>()?;
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }

        let stats = LoadStats {
            triples: triples.len() as u64,
            tables: loaded.iter().map(|(tables, _)| tables).sum(),
            keys: self.tree.len(),
        };
        info!(
            triples = stats.triples,
            tables = stats.tables,
            keys = stats.keys,
            "store.bulk_load"
        );
        Ok(stats)
    }

    /// Table of `key` under `perm`, or `None` when the key has none
    pub fn reader(&self, perm: Permutation, key: i64) -> Result<Option<TableReader>> {
        match self.tree.get_coordinates(&key, perm)? {
            Some(coords) => Ok(Some(self.table(perm).open_reader(key, &coords)?)),
            None => Ok(None),
        }
    }

    /// Cursor over the rows of `key` under `perm`, restricted to
    /// `t1 == first` and `t2 == second` where given.
    ///
    /// A key without a table yields an empty cursor. Small tables come
    /// from the pair cache.
    pub fn cursor(
        &self,
        perm: Permutation,
        key: i64,
        first: Option<i64>,
        second: Option<i64>,
    ) -> Result<Box<dyn PairCursor>> {
        let mut cursor = self.table_cursor(perm, key)?;
        if let Some(c1) = first {
            cursor.set_constraint1(c1)?;
        }
        if let Some(c2) = second {
            cursor.set_constraint2(c2);
        }
        Ok(cursor)
    }

    fn table_cursor(&self, perm: Permutation, key: i64) -> Result<Box<dyn PairCursor>> {
        let Some(coords) = self.tree.get_coordinates(&key, perm)? else {
            return Ok(Box::new(ArrayPairCursor::from_pairs(Vec::new())));
        };
        let reader = self.table(perm).open_reader(key, &coords)?;

        let cache = match &self.cache {
            Some(cache) if coords.element_count <= self.config.tables.cache_max_rows => cache,
            _ => return Ok(reader.cursor()),
        };
        if let Some(pairs) = cache.lock().get(&(perm, key)) {
            return Ok(Box::new(ArrayPairCursor::cached(pairs.clone())));
        }

        let pairs: Arc<[Pair]> = collect_pairs(reader.cursor().as_mut())?.into();
        cache.lock().put((perm, key), pairs.clone());
        Ok(Box::new(ArrayPairCursor::cached(pairs)))
    }

    /// `(t1, rows with that t1)` over the table of `key`
    pub fn aggregate_cursor(&self, perm: Permutation, key: i64) -> Result<AggregatePairCursor> {
        AggregatePairCursor::over(self.table_cursor(perm, key)?)
    }

    /// Rows of `a_key`'s table whose t1 does not occur in `b_key`'s table
    pub fn column_not_in(
        &self,
        perm: Permutation,
        a_key: i64,
        b_key: i64,
    ) -> Result<Box<dyn PairCursor>> {
        let Some(a) = self.reader(perm, a_key)? else {
            return Ok(Box::new(ArrayPairCursor::from_pairs(Vec::new())));
        };
        match self.reader(perm, b_key)? {
            Some(b) => Ok(Box::new(table::column_not_in(&a, &b)?)),
            None => Ok(a.cursor()),
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            tree: self.tree.stats(),
            pool: self.pool.stats(),
            files: self.tables.iter().map(|t| t.storage.num_files()).collect(),
            cached_tables: self.cache.as_ref().map_or(0, |cache| cache.lock().len()),
        }
    }

    pub fn flush(&self) -> Result<()> {
        for table in &self.tables {
            table.flush()?;
        }
        self.tree.flush()
    }

    pub fn close(&self) -> Result<()> {
        for table in &self.tables {
            table.close()?;
        }
        self.tree.close()?;
        debug!(dir = %self.dir.display(), "store.close");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyPolicy;
    use crate::cursor::CursorType;
    use crate::types::Strategy;
    use tempfile::TempDir;

    fn triples() -> Vec<Triple> {
        let mut triples = Vec::new();
        for s in 0..20 {
            for p in 0..3 {
                for o in 0..(s % 7 + 1) {
                    triples.push((s, p, 100 + o * 3 + p));
                }
            }
        }
        triples.push((0, 0, 100));
        triples
    }

    #[test]
    fn test_bulk_load_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
        let stats = store.bulk_load(&triples()).unwrap();
        assert_eq!(stats.triples, triples().len() as u64);
        // subjects 0..20 (predicates 0..3 reuse their ids), objects 100..=120
        assert_eq!(stats.keys, 20 + 21);

        let pairs = collect_pairs(store.cursor(Permutation::Spo, 6, None, None).unwrap().as_mut())
            .unwrap();
        let expected: Vec<Pair> = (0..3)
            .flat_map(|p| (0..7).map(move |o| (p, 100 + o * 3 + p)))
            .collect();
        assert_eq!(pairs, expected);

        let mut cursor = store.cursor(Permutation::Pos, 1, Some(104), None).unwrap();
        let rows = collect_pairs(cursor.as_mut()).unwrap();
        assert!(rows.iter().all(|&(o, _)| o == 104));
        // every subject except 0, 7 and 14
        assert_eq!(rows.len(), 17);

        let mut missing = store.cursor(Permutation::Osp, 5, None, None).unwrap();
        assert!(!missing.has_next().unwrap());
    }

    #[test]
    fn test_small_tables_come_from_cache() {
        let dir = TempDir::new().unwrap();
        let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
        store.bulk_load(&triples()).unwrap();

        let cursor = store.cursor(Permutation::Spo, 1, None, None).unwrap();
        assert_eq!(cursor.cursor_type(), CursorType::Cached);
        assert_eq!(store.stats().cached_tables, 1);

        // predicate tables hold well over cache_max_rows rows
        let cursor = store.cursor(Permutation::Pso, 1, None, None).unwrap();
        assert_ne!(cursor.cursor_type(), CursorType::Cached);
    }

    #[test]
    fn test_column_not_in_and_aggregate() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::for_testing();
        config.tables.strategy = StrategyPolicy::Fixed(Strategy::Column);
        config.tables.cache_capacity = 0;
        let store = PairStore::create(dir.path(), config).unwrap();
        store
            .bulk_load(&[(1, 10, 5), (1, 11, 6), (1, 12, 7), (2, 11, 9), (2, 13, 9)])
            .unwrap();

        let mut cursor = store.column_not_in(Permutation::Spo, 1, 2).unwrap();
        assert_eq!(collect_pairs(cursor.as_mut()).unwrap(), vec![(10, 5), (12, 7)]);

        let mut cursor = store.column_not_in(Permutation::Spo, 1, 99).unwrap();
        assert_eq!(collect_pairs(cursor.as_mut()).unwrap().len(), 3);

        let mut groups = store.aggregate_cursor(Permutation::Pso, 11).unwrap();
        assert_eq!(collect_pairs(&mut groups).unwrap(), vec![(1, 1), (2, 1)]);
    }

    #[test]
    fn test_reopen_read_only() {
        let dir = TempDir::new().unwrap();
        {
            let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
            store.bulk_load(&triples()).unwrap();
            store.close().unwrap();
        }

        let store = PairStore::open(dir.path()).unwrap();
        assert!(!store.is_writable());
        assert_eq!(store.config(), &StoreConfig::for_testing());
        let mut cursor = store.cursor(Permutation::Ops, 120, None, None).unwrap();
        assert_eq!(
            collect_pairs(cursor.as_mut()).unwrap(),
            vec![(2, 6), (2, 13)]
        );
        assert!(matches!(
            store.bulk_load(&[(1, 2, 3)]),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_writer_misuse() {
        let dir = TempDir::new().unwrap();
        let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
        let mut writer = store.table(Permutation::Spo).writer();
        assert!(matches!(
            writer.append(1, 1),
            Err(StorageError::InvalidArgument(_))
        ));
        writer.start_append(4).unwrap();
        assert!(writer.start_append(5).is_err());
        writer.append(1, 1).unwrap();
        let coords = writer.stop_append().unwrap();
        assert_eq!(coords.permutation, Permutation::Spo);
        assert_eq!(coords.element_count, 1);
        assert!(writer.stop_append().is_err());
    }
}
