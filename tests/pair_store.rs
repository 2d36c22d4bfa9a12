use std::collections::BTreeSet;
use std::sync::{Arc, Once};

use proptest::prelude::*;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use tristore::config::{FileConfig, PoolConfig, RowCompression};
use tristore::storage::{FileIndex, MemoryPool, MultiFileStorage};
use tristore::table::{PairTableWriter, RowWriter, TableBuilder, TableReader, TableSummary};
use tristore::{
    collect_pairs, Checkpoint, Pair, PairStore, Permutation, StoreConfig, Strategy as Layout,
    StrategyPolicy, TableConfig, Triple,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("tristore=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn storage(dir: &TempDir, max_file_size: u64) -> Arc<MultiFileStorage> {
    let pool = Arc::new(MemoryPool::new(PoolConfig {
        max_bytes: 32 << 20,
        max_open_files: 32,
    }));
    MultiFileStorage::create(
        dir.path(),
        "pairs",
        FileConfig {
            max_file_size,
            initial_map_size: 512,
        },
        pool,
    )
    .unwrap()
}

fn write_table(
    storage: &Arc<MultiFileStorage>,
    writer: &mut dyn PairTableWriter,
    pairs: &[Pair],
) -> TableReader {
    writer.start_append().unwrap();
    for (t1, t2) in pairs {
        writer.append(*t1, *t2).unwrap();
    }
    let summary: TableSummary = writer.stop_append().unwrap();
    TableReader::open(
        storage,
        summary.file,
        summary.offset,
        summary.n_elements,
        summary.strategy,
        summary.index.map(Arc::new),
    )
    .unwrap()
}

fn fixed(strategy: Layout) -> TableConfig {
    TableConfig {
        strategy: StrategyPolicy::Fixed(strategy),
        first_index_size: 3,
        additional_index_threshold: 8,
        additional_index_step: 4,
        ..TableConfig::default()
    }
}

#[test]
fn row_scenario_without_compression() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir, 1 << 20);
    let config = TableConfig {
        row_compression: RowCompression::none(),
        ..fixed(Layout::Row)
    };
    let mut writer = RowWriter::new(storage.clone(), &config);
    let reader = write_table(
        &storage,
        &mut writer,
        &[(1, 10), (1, 11), (2, 20), (5, 50), (5, 51), (5, 52)],
    );
    assert_eq!(reader.strategy(), Layout::Row);

    let mut cursor = reader.cursor();
    assert_eq!(cursor.get_card(), 6);
    assert!(cursor.move_to_closest_first_term(5).unwrap());
    cursor.next().unwrap();
    assert_eq!((cursor.value1(), cursor.value2()), (5, 50));
    cursor.next().unwrap();
    assert_eq!((cursor.value1(), cursor.value2()), (5, 51));
    cursor.mark();
    cursor.next().unwrap();
    assert_eq!((cursor.value1(), cursor.value2()), (5, 52));
    cursor.reset(Checkpoint::Outer).unwrap();
    cursor.next().unwrap();
    assert_eq!((cursor.value1(), cursor.value2()), (5, 52));
    assert!(!cursor.has_next().unwrap());
}

#[test]
fn row_cannot_ignore_second_column() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir, 1 << 20);
    let mut writer = TableBuilder::new(storage.clone(), fixed(Layout::Row));
    let reader = write_table(&storage, &mut writer, &[(1, 1), (1, 2)]);
    let mut cursor = reader.cursor();
    assert!(matches!(
        cursor.ignore_second_column(),
        Err(tristore::StorageError::Unsupported(_))
    ));
}

#[test]
fn merge_join_seeks_never_move_backward() {
    let dir = TempDir::new().unwrap();
    let storage = storage(&dir, 1 << 20);
    let pairs: Vec<Pair> = (0..400).map(|i| (i / 5 * 3, i % 5)).collect();

    for strategy in Layout::ALL {
        let mut writer = TableBuilder::new(storage.clone(), fixed(strategy));
        let mut left = write_table(&storage, &mut writer, &pairs).cursor();
        let mut right = write_table(&storage, &mut writer, &pairs).cursor();

        let mut last = i64::MIN;
        let mut target = 0;
        while target < 260 {
            left.move_to_closest_first_term(target).unwrap();
            if !left.has_next().unwrap() {
                break;
            }
            left.next().unwrap();
            assert!(left.value1() >= target, "{:?}", strategy);
            assert!(left.value1() >= last, "{:?}", strategy);
            last = left.value1();

            // the other side lags behind and catches up
            right.move_to_closest_first_term(target / 2).unwrap();
            right.move_to_closest_first_term(target).unwrap();
            right.next().unwrap();
            assert_eq!(right.value1(), left.value1(), "{:?}", strategy);

            // a smaller target afterwards is a no-op
            left.move_to_closest_first_term(target - 7).unwrap();
            if left.has_next().unwrap() {
                left.next().unwrap();
                assert!(left.value1() >= last);
                last = left.value1();
            }
            target += 7;
        }
    }
}

#[test]
fn store_survives_eviction_pressure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::for_testing();
    config.files.max_file_size = 2048;
    config.files.initial_map_size = 512;
    config.pool.max_open_files = 12;
    config.tables.cache_capacity = 0;

    let triples: Vec<Triple> = (0..3000)
        .map(|i| (i % 97, i % 5, (i * 7919) % 1009))
        .collect();
    let store = PairStore::create(dir.path(), config).unwrap();
    store.bulk_load(&triples).unwrap();

    let stats = store.stats();
    assert!(stats.files.iter().all(|files| *files > 1));
    assert!(stats.pool.evictions > 0);
    assert!(stats.pool.blocks <= 12);

    let model: BTreeSet<Triple> = triples.iter().copied().collect();
    for s in (0..97).step_by(8) {
        let expected: Vec<Pair> = model
            .range((s, i64::MIN, i64::MIN)..=(s, i64::MAX, i64::MAX))
            .map(|&(_, p, o)| (p, o))
            .collect();
        let mut cursor = store.cursor(Permutation::Spo, s, None, None).unwrap();
        assert_eq!(collect_pairs(cursor.as_mut()).unwrap(), expected);
    }

    let mut by_object: Vec<Pair> = model
        .iter()
        .filter(|&&(_, p, _)| p == 3)
        .map(|&(s, _, o)| (o, s))
        .collect();
    by_object.sort_unstable();
    let mut cursor = store.cursor(Permutation::Pos, 3, None, None).unwrap();
    assert_eq!(collect_pairs(cursor.as_mut()).unwrap(), by_object);
}

#[test]
fn store_reopens_with_same_contents() {
    let dir = TempDir::new().unwrap();
    let triples: Vec<Triple> = (0..500).map(|i| (i % 13, 100 + i % 4, i)).collect();
    {
        let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
        store.bulk_load(&triples).unwrap();
        store.close().unwrap();
    }

    let store = PairStore::open(dir.path()).unwrap();
    // subjects and predicates share ids with objects
    assert_eq!(store.tree().len(), 500);
    for perm in Permutation::ALL {
        let mut total = 0;
        let keys: BTreeSet<i64> = triples
            .iter()
            .map(|&(s, p, o)| perm.order(s, p, o).0)
            .collect();
        for key in keys {
            let mut cursor = store.cursor(perm, key, None, None).unwrap();
            total += collect_pairs(cursor.as_mut()).unwrap().len();
        }
        assert_eq!(total, triples.len(), "{:?}", perm);
    }
}

#[test]
fn second_load_repoints_touched_keys() {
    let dir = TempDir::new().unwrap();
    let store = PairStore::create(dir.path(), StoreConfig::for_testing()).unwrap();
    store
        .bulk_load(&[(1, 10, 100), (1, 11, 101), (2, 10, 102)])
        .unwrap();
    store.bulk_load(&[(1, 12, 103)]).unwrap();

    let read = |perm, key| {
        let mut cursor = store.cursor(perm, key, None, None).unwrap();
        collect_pairs(cursor.as_mut()).unwrap()
    };
    // subject 1 now points at the second load only
    assert_eq!(read(Permutation::Spo, 1), vec![(12, 103)]);
    assert_eq!(read(Permutation::Spo, 2), vec![(10, 102)]);
    assert_eq!(read(Permutation::Pso, 10), vec![(1, 100), (2, 102)]);
    assert_eq!(read(Permutation::Pso, 12), vec![(1, 103)]);
    assert_eq!(read(Permutation::Osp, 100), vec![(1, 10)]);
}

fn sorted_pairs() -> impl Strategy<Value = Vec<Pair>> {
    prop::collection::vec((-40i64..40, any::<i32>()), 1..250).prop_map(|raw| {
        let set: BTreeSet<Pair> = raw.into_iter().map(|(a, b)| (a, b as i64)).collect();
        set.into_iter().collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_layout_reads_back_what_was_written(pairs in sorted_pairs()) {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        for strategy in Layout::ALL {
            let mut writer = TableBuilder::new(storage.clone(), fixed(strategy));
            let reader = write_table(&storage, &mut writer, &pairs);
            prop_assert_eq!(reader.strategy(), strategy);
            let mut cursor = reader.cursor();
            prop_assert_eq!(collect_pairs(cursor.as_mut()).unwrap(), pairs.clone());
        }
    }

    #[test]
    fn seeks_land_on_first_row_at_or_after_target(
        pairs in sorted_pairs(),
        c1 in -45i64..45,
        c2 in any::<i32>(),
    ) {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir, 1 << 20);
        let target = (c1, c2 as i64);
        let expected = pairs.iter().copied().find(|pair| *pair >= target);
        for strategy in Layout::ALL {
            let mut writer = TableBuilder::new(storage.clone(), fixed(strategy));
            let mut cursor = write_table(&storage, &mut writer, &pairs).cursor();
            let matched = cursor.move_to_closest_second_term(target.0, target.1).unwrap();
            prop_assert_eq!(matched, expected.map_or(false, |pair| pair.0 == c1));
            let found = if cursor.has_next().unwrap() {
                cursor.next().unwrap();
                Some((cursor.value1(), cursor.value2()))
            } else {
                None
            };
            prop_assert_eq!(found, expected, "{:?}", strategy);
        }
    }

    #[test]
    fn file_index_matches_reference_search(
        keys in prop::collection::btree_set(-10_000i64..10_000, 1..300),
        probes in prop::collection::vec(-10_500i64..10_500, 1..50),
    ) {
        let keys: Vec<i64> = keys.into_iter().collect();
        let mut index = FileIndex::new();
        for (i, key) in keys.iter().enumerate() {
            index.add(*key, (i % 3) as u16, i as u64 * 16).unwrap();
        }
        for probe in probes.iter().chain(keys.iter()) {
            let expected = match keys.binary_search(probe) {
                Ok(i) => i as i64,
                Err(i) => -(i as i64) - 1,
            };
            prop_assert_eq!(index.idx(*probe), expected);
        }
    }
}
