use std::path::Path;

use plotkit_storage::{write_new_file, FileDisk, MemoryDisk};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{run_backpropagation, TableSizes};
use crate::bits::{slice_u64, EntryWriter};
use crate::config::BackpropConfig;
use crate::entry_sizes::{EntrySizes, NUM_TABLES, OFFSET_SIZE};
use crate::error::{ConfigError, Phase2Error, SortError};
use crate::test::init_test_logger;

fn encode(fields: &[(u64, usize)], entry_size: usize) -> Vec<u8> {
    let mut entry = vec![0; entry_size];
    let mut writer = EntryWriter::new(&mut entry);
    for &(value, bits) in fields {
        writer.append(value, bits);
    }
    entry
}

/// The tables of a plot as phase 1 leaves them.
struct Plot {
    k: usize,
    entry_sizes: EntrySizes,
    sizes: TableSizes,
    /// `(pos, offset)` of every entry of tables 2 to 7, by table number.
    refs: Vec<Vec<(u64, u64)>>,
    f7: Vec<u64>,
    /// Table contents, by table number.
    tables: Vec<Vec<u8>>,
}

impl Plot {
    /// Builds the tables.  Entries of tables 2 to 6 get random bits after
    /// `pos | offset`, standing in for the metadata phase 1 leaves there.
    fn new(k: usize, table1: Vec<Vec<u8>>, refs: Vec<Vec<(u64, u64)>>, f7: Vec<u64>) -> Self {
        assert_eq!(refs.len(), NUM_TABLES + 1);
        assert_eq!(f7.len(), refs[NUM_TABLES].len());
        let entry_sizes = EntrySizes::new(k as u8);
        let mut rng = StdRng::seed_from_u64(k as u64);

        let mut sizes = TableSizes::default();
        let mut tables: Vec<Vec<u8>> = vec![Vec::new(); NUM_TABLES + 1];
        sizes[1] = table1.len() as u64;
        for entry in &table1 {
            assert_eq!(entry.len(), entry_sizes.get(1));
            tables[1].extend_from_slice(entry);
        }
        for table in 2..NUM_TABLES {
            let entry_size = entry_sizes.get(table);
            sizes[table] = refs[table].len() as u64;
            tables[table] = vec![0; refs[table].len() * entry_size];
            for (entry, &(pos, offset)) in tables[table]
                .chunks_exact_mut(entry_size)
                .zip(&refs[table])
            {
                let mut writer = EntryWriter::new(entry);
                writer.append(pos, k).append(offset, OFFSET_SIZE);
                while writer.bits() < entry_size * 8 {
                    let n = (entry_size * 8 - writer.bits()).min(32);
                    writer.append(rng.gen::<u32>() as u64 >> (32 - n), n);
                }
            }
        }
        sizes[NUM_TABLES] = f7.len() as u64;
        for (&f7, &(pos, offset)) in f7.iter().zip(&refs[NUM_TABLES]) {
            tables[NUM_TABLES].extend(encode(
                &[(f7, k), (pos, k), (offset, OFFSET_SIZE)],
                entry_sizes.get(NUM_TABLES),
            ));
        }

        Self {
            k,
            entry_sizes,
            sizes,
            refs,
            f7,
            tables,
        }
    }

    /// A plot whose tables have at most `max_size` entries, with references
    /// chosen at random.  Table 7 may be empty; the others are not.
    fn random(seed: u64, k: usize, max_size: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let cap = (1u64 << k).min(max_size);
        let mut sizes = [0; NUM_TABLES + 1];
        for size in &mut sizes[1..NUM_TABLES] {
            *size = rng.gen_range(1..=cap);
        }
        sizes[NUM_TABLES] = rng.gen_range(0..=cap);

        let entry_size = EntrySizes::new(k as u8).get(1);
        let table1: Vec<Vec<u8>> = (0..sizes[1])
            .map(|_| (0..entry_size).map(|_| rng.gen()).collect())
            .collect();
        let mut refs: Vec<Vec<(u64, u64)>> = vec![Vec::new(); NUM_TABLES + 1];
        for table in 2..=NUM_TABLES {
            let below = sizes[table - 1];
            refs[table] = (0..sizes[table])
                .map(|_| {
                    let pos = rng.gen_range(0..below);
                    let max_offset = (below - 1 - pos).min((1 << OFFSET_SIZE) - 1);
                    (pos, rng.gen_range(0..=max_offset))
                })
                .collect();
        }
        let f7: Vec<u64> = (0..sizes[NUM_TABLES])
            .map(|_| rng.gen_range(0..1u64 << k))
            .collect();
        Self::new(k, table1, refs, f7)
    }

    fn config(&self, tmp_dir: &Path, log_num_buckets: u32) -> BackpropConfig {
        BackpropConfig::new(self.k as u8, tmp_dir, "plot", log_num_buckets)
    }

    fn disks(&self) -> [MemoryDisk; NUM_TABLES + 1] {
        std::array::from_fn(|table| {
            MemoryDisk::with_data(format!("table{table}"), self.tables[table].clone())
        })
    }

    /// Memory in which no sort bucket can outgrow the sort cache.
    fn ample_memory(&self, log_num_buckets: u32) -> usize {
        let largest = (1..=NUM_TABLES)
            .map(|table| self.sizes[table] as usize * self.entry_sizes.get(table))
            .max()
            .unwrap_or(0);
        4 * (largest + self.entry_sizes.max())
            + self.config(Path::new("."), log_num_buckets).min_memory()
    }

    /// Works out the result of backpropagation the slow way.
    fn expected(&self) -> (TableSizes, Vec<Vec<u8>>) {
        let k = self.k;
        let mut live: Vec<Vec<bool>> = vec![Vec::new(); NUM_TABLES + 1];
        live[NUM_TABLES] = vec![true; self.f7.len()];
        for table in (2..=NUM_TABLES).rev() {
            let mut below = vec![false; self.sizes[table - 1] as usize];
            for (index, &(pos, offset)) in self.refs[table].iter().enumerate() {
                if live[table][index] {
                    below[pos as usize] = true;
                    below[(pos + offset) as usize] = true;
                }
            }
            live[table - 1] = below;
        }
        let ranks: Vec<Vec<u64>> = live
            .iter()
            .map(|live| {
                live.iter()
                    .scan(0, |count, &kept| {
                        let rank = *count;
                        *count += kept as u64;
                        Some(rank)
                    })
                    .collect()
            })
            .collect();
        let remap = |table: usize, (pos, offset): (u64, u64)| {
            let ranks = &ranks[table - 1];
            let new_pos = ranks[pos as usize];
            (new_pos, ranks[(pos + offset) as usize] - new_pos)
        };

        let mut sizes = TableSizes::default();
        let mut tables: Vec<Vec<u8>> = vec![Vec::new(); NUM_TABLES + 1];

        sizes[NUM_TABLES] = self.sizes[NUM_TABLES];
        for (&f7, &r) in self.f7.iter().zip(&self.refs[NUM_TABLES]) {
            let (pos, offset) = remap(NUM_TABLES, r);
            tables[NUM_TABLES].extend(encode(
                &[(f7, k), (pos, k), (offset, OFFSET_SIZE)],
                self.entry_sizes.get(NUM_TABLES),
            ));
        }

        for table in 2..NUM_TABLES {
            let mut kept: Vec<(u64, u64, u64)> = self.refs[table]
                .iter()
                .enumerate()
                .filter(|&(index, _)| live[table][index])
                .enumerate()
                .map(|(sort_key, (_, &r))| {
                    let (pos, offset) = remap(table, r);
                    (pos, offset, sort_key as u64)
                })
                .collect();
            kept.sort_by_key(|&(pos, offset, _)| (pos, offset));
            sizes[table] = kept.len() as u64;
            for (pos, offset, sort_key) in kept {
                tables[table].extend(encode(
                    &[(sort_key, k + 1), (pos, k), (offset, OFFSET_SIZE)],
                    self.entry_sizes.get(table),
                ));
            }
        }

        let entry_size = self.entry_sizes.get(1);
        for (index, entry) in self.tables[1].chunks_exact(entry_size).enumerate() {
            if live[1][index] {
                tables[1].extend_from_slice(entry);
                sizes[1] += 1;
            }
        }
        (sizes, tables)
    }

    /// Runs backpropagation over in-memory tables.
    fn run(
        &self,
        memory: usize,
        log_num_buckets: u32,
    ) -> Result<(TableSizes, Vec<Vec<u8>>), Phase2Error> {
        let tmp = tempfile::tempdir().unwrap();
        let mut disks = self.disks();
        let mut memory = vec![0; memory];
        let sizes = run_backpropagation(
            &mut memory,
            &mut disks,
            &self.sizes,
            &self.config(tmp.path(), log_num_buckets),
        )?;
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        Ok((sizes, disks.into_iter().map(MemoryDisk::into_inner).collect()))
    }

    /// Checks what must hold for any result, without reference to
    /// [`expected`](Self::expected).
    fn check_result(&self, sizes: &TableSizes, tables: &[Vec<u8>]) {
        let k = self.k;
        assert_eq!(sizes[NUM_TABLES], self.sizes[NUM_TABLES]);
        for table in 1..=NUM_TABLES {
            assert!(sizes[table] <= self.sizes[table]);
            assert_eq!(
                tables[table].len() as u64,
                sizes[table] * self.entry_sizes.get(table) as u64
            );
        }

        // Table 7 keeps its order and its `f7` values, and refers to table 6
        // as compacted.
        for (entry, &f7) in tables[NUM_TABLES]
            .chunks_exact(self.entry_sizes.get(NUM_TABLES))
            .zip(&self.f7)
        {
            assert_eq!(slice_u64(entry, 0, k), f7);
            let pos = slice_u64(entry, k, k);
            let offset = slice_u64(entry, 2 * k, OFFSET_SIZE);
            assert!(pos + offset < sizes[NUM_TABLES - 1]);
        }

        // Tables 2 to 6 are sorted by `pos`, carry each sort key once and
        // refer to the compacted table below.
        for table in 2..NUM_TABLES {
            let mut sort_keys = Vec::new();
            let mut last_pos = 0;
            for entry in tables[table].chunks_exact(self.entry_sizes.get(table)) {
                sort_keys.push(slice_u64(entry, 0, k + 1));
                let pos = slice_u64(entry, k + 1, k);
                let offset = slice_u64(entry, 2 * k + 1, OFFSET_SIZE);
                assert!(pos >= last_pos, "table {table} is not sorted by pos");
                assert!(pos + offset < sizes[table - 1]);
                last_pos = pos;
            }
            sort_keys.sort();
            assert_eq!(sort_keys, (0..sizes[table]).collect::<Vec<_>>());
        }
    }
}

/// Table 7 refers to table 6 entries `{0, 1}`, `{2, 3}` and `{3, 4}`, so the
/// last entry of table 6 goes and the others keep their positions.
fn small_plot() -> Plot {
    let mut refs: Vec<Vec<(u64, u64)>> = vec![Vec::new(); NUM_TABLES + 1];
    refs[7] = vec![(0, 1), (2, 1), (3, 1)];
    refs[6] = vec![(0, 1), (1, 1), (2, 2), (4, 0), (1, 0), (5, 0)];
    refs[5] = vec![(0, 0), (3, 1), (1, 0), (0, 4), (2, 0), (1, 1)];
    refs[4] = vec![(0, 0), (0, 0), (3, 0), (1, 0), (1, 0)];
    refs[3] = vec![(1, 2), (0, 0), (2, 0), (4, 0)];
    refs[2] = vec![(0, 7), (2, 0), (5, 0), (2, 1), (6, 0)];
    let table1 = (0..8).map(|i| vec![i, 0xa0 + i]).collect();
    Plot::new(5, table1, refs, vec![3, 7, 30])
}

#[test]
fn small_plot_exact() {
    init_test_logger();
    let plot = small_plot();
    assert_eq!(plot.entry_sizes, EntrySizes::with_sizes([2, 3, 3, 3, 3, 3, 3]));

    for (memory, log_num_buckets) in [(64, 1), (4096, 0), (4096, 2)] {
        let (sizes, tables) = plot.run(memory, log_num_buckets).unwrap();
        assert_eq!(sizes, TableSizes::new([5, 4, 3, 5, 4, 5, 3]));

        let decode = |table: usize| -> Vec<(u64, u64, u64)> {
            tables[table]
                .chunks_exact(3)
                .map(|entry| {
                    (
                        slice_u64(entry, 0, 6),
                        slice_u64(entry, 6, 5),
                        slice_u64(entry, 11, OFFSET_SIZE),
                    )
                })
                .collect()
        };
        // (sort_key, pos, offset)
        assert_eq!(
            decode(6),
            vec![(0, 0, 1), (4, 1, 0), (1, 1, 1), (2, 2, 1), (3, 3, 0)]
        );
        assert_eq!(decode(5), vec![(0, 0, 0), (2, 1, 0), (3, 2, 0), (1, 3, 1)]);
        assert_eq!(
            decode(4),
            vec![(0, 0, 0), (1, 0, 0), (3, 1, 0), (4, 1, 0), (2, 2, 0)]
        );
        assert_eq!(decode(3), vec![(1, 0, 0), (0, 1, 1), (2, 3, 0)]);
        assert_eq!(decode(2), vec![(0, 0, 4), (1, 1, 0), (2, 1, 1), (3, 3, 0)]);

        assert_eq!(&tables[6][..6], &[0x00, 0x00, 0x08, 0x10, 0x20, 0x00]);
        // Table 6 stayed dense, so table 7 is unchanged.
        assert_eq!(tables[7], plot.tables[7]);
        assert_eq!(&tables[7][3..6], &[0x38, 0x80, 0x10]);
        assert_eq!(
            tables[1],
            vec![0, 0xa0, 2, 0xa2, 3, 0xa3, 6, 0xa6, 7, 0xa7]
        );

        plot.check_result(&sizes, &tables);
        assert_eq!((sizes, tables), plot.expected());
    }
}

#[test]
fn file_tables() {
    init_test_logger();
    let plot = Plot::random(1, 9, 400);
    let dir = tempfile::tempdir().unwrap();
    let tmp_dir = dir.path().join("tmp");
    std::fs::create_dir(&tmp_dir).unwrap();

    let paths: Vec<_> = (0..=NUM_TABLES)
        .map(|table| dir.path().join(format!("plot.table{table}.tmp")))
        .collect();
    for (path, table) in paths.iter().zip(&plot.tables) {
        write_new_file(path, table).unwrap();
    }
    let mut disks: [FileDisk; NUM_TABLES + 1] = paths
        .iter()
        .map(|path| FileDisk::open(path).unwrap())
        .collect::<Vec<_>>()
        .try_into()
        .unwrap_or_else(|_| unreachable!());

    let mut memory = vec![0; plot.ample_memory(3)];
    let sizes = run_backpropagation(
        &mut memory,
        &mut disks,
        &plot.sizes,
        &plot.config(&tmp_dir, 3),
    )
    .unwrap();
    drop(disks);

    let tables: Vec<_> = paths
        .iter()
        .map(|path| std::fs::read(path).unwrap())
        .collect();
    plot.check_result(&sizes, &tables);
    assert_eq!((sizes, tables), plot.expected());
    assert_eq!(std::fs::read_dir(&tmp_dir).unwrap().count(), 0);
}

/// A plot in which every entry is kept and every table is already sorted:
/// backpropagation only adds sort keys.  Running it again over the result,
/// read back without the sort keys, leaves tables 1 and 7 byte for byte the
/// same.
#[test]
fn compact_plot_is_unchanged() {
    let n = 300u64;
    let mut refs: Vec<Vec<(u64, u64)>> = vec![Vec::new(); NUM_TABLES + 1];
    for table_refs in &mut refs[2..] {
        *table_refs = (0..n)
            .map(|e| (e, if e % 2 == 0 && e + 1 < n { 1 } else { 0 }))
            .collect();
    }
    let table1 = (0..n).map(|e| vec![e as u8, (e >> 8) as u8, 0x55]).collect();
    let plot = Plot::new(9, table1, refs, (0..n).rev().collect());

    let (sizes, tables) = plot.run(plot.ample_memory(2), 2).unwrap();
    assert_eq!(sizes, plot.sizes);
    assert_eq!(tables[1], plot.tables[1]);
    assert_eq!(tables[7], plot.tables[7]);
    for table in 2..NUM_TABLES {
        for (e, entry) in tables[table]
            .chunks_exact(plot.entry_sizes.get(table))
            .enumerate()
        {
            assert_eq!(slice_u64(entry, 0, 10), e as u64);
            let r = (slice_u64(entry, 10, 9), slice_u64(entry, 19, OFFSET_SIZE));
            assert_eq!(plot.refs[table][e], r);
        }
    }
    assert_eq!((sizes, tables.clone()), plot.expected());

    let table1 = tables[1]
        .chunks_exact(plot.entry_sizes.get(1))
        .map(|entry| entry.to_vec())
        .collect();
    let mut refs: Vec<Vec<(u64, u64)>> = vec![Vec::new(); NUM_TABLES + 1];
    for (table, table_refs) in refs.iter_mut().enumerate().skip(2) {
        let (start, entry_size) = match table {
            NUM_TABLES => (9, plot.entry_sizes.get(NUM_TABLES)),
            _ => (10, plot.entry_sizes.get(table)),
        };
        *table_refs = tables[table]
            .chunks_exact(entry_size)
            .map(|entry| {
                (
                    slice_u64(entry, start, 9),
                    slice_u64(entry, start + 9, OFFSET_SIZE),
                )
            })
            .collect();
    }
    let f7 = tables[NUM_TABLES]
        .chunks_exact(plot.entry_sizes.get(NUM_TABLES))
        .map(|entry| slice_u64(entry, 0, 9))
        .collect();
    let again = Plot::new(9, table1, refs, f7);
    let (sizes_again, tables_again) = again.run(again.ample_memory(1), 1).unwrap();
    assert_eq!(sizes_again, sizes);
    assert_eq!(tables_again[1], tables[1]);
    assert_eq!(tables_again[NUM_TABLES], tables[NUM_TABLES]);
}

/// Table 1 may be larger than `2^k`: the entries past that are reachable
/// only through offsets, and the rest are dropped.
#[test]
fn large_table1() {
    let k = 4;
    let entry_size = EntrySizes::new(k as u8).get(1);
    let table1: Vec<Vec<u8>> = (0..20u8).map(|e| vec![e; entry_size]).collect();
    let mut refs: Vec<Vec<(u64, u64)>> = vec![vec![(0, 0)]; NUM_TABLES + 1];
    refs[2] = vec![(15, 3)];
    let plot = Plot::new(k, table1, refs, vec![1]);
    assert!(plot.sizes[1] > 1 << k);

    let (sizes, tables) = plot.run(256, 0).unwrap();
    assert_eq!(sizes[1], 2);
    assert_eq!(tables[1], [vec![15u8; entry_size], vec![18u8; entry_size]].concat());
    assert_eq!((sizes, tables), plot.expected());
}

/// A sort bucket may take up the whole sort cache, which is half the
/// memory.
#[test]
fn bucket_fills_sort_cache() {
    let plot = Plot::random(5, 10, 1024);
    let largest = (1..=NUM_TABLES)
        .map(|table| plot.sizes[table] as usize * plot.entry_sizes.get(table))
        .max()
        .unwrap();
    let min = plot.config(Path::new("."), 0).min_memory();
    let result = plot.run((largest * 5 / 2).max(min), 0).unwrap();
    assert_eq!(result, plot.expected());
}

#[test]
fn empty_table7_drops_everything() {
    let mut refs: Vec<Vec<(u64, u64)>> = vec![Vec::new(); NUM_TABLES + 1];
    for table_refs in &mut refs[2..NUM_TABLES] {
        *table_refs = vec![(0, 1), (1, 0)];
    }
    let plot = Plot::new(4, vec![vec![1, 2]; 2], refs, Vec::new());
    let (sizes, tables) = plot.run(256, 1).unwrap();
    assert_eq!(sizes, TableSizes::default());
    assert!(tables.iter().all(|table| table.is_empty()));
}

#[test]
fn output_independent_of_memory() {
    init_test_logger();
    let plot = Plot::random(99, 10, 1024);
    let expected = plot.expected();
    let mut successes = 0;
    for log_num_buckets in 0..=4 {
        let ample = plot.ample_memory(log_num_buckets);
        let min = plot.config(Path::new("."), log_num_buckets).min_memory();
        for memory in [min, ample / 16, ample / 4, ample / 2, ample] {
            match plot.run(memory.max(min), log_num_buckets) {
                Ok(result) => {
                    assert_eq!(result, expected);
                    successes += 1;
                }
                Err(Phase2Error::Sort(SortError::BucketTooLarge { .. })) => {
                    assert!(memory < ample);
                }
                Err(error) => panic!("{error}"),
            }
        }
    }
    assert!(successes >= 5);
}

#[test]
fn config_errors() {
    let plot = small_plot();
    let tmp = tempfile::tempdir().unwrap();
    let mut memory = vec![0; 1024];

    let mut disks = plot.disks();
    let missing = tmp.path().join("missing");
    assert_eq!(
        run_backpropagation(&mut memory, &mut disks, &plot.sizes, &plot.config(&missing, 1)),
        Err(Phase2Error::Config(ConfigError::MissingTmpDir(missing)))
    );

    let config = plot.config(tmp.path(), 1);
    let mut small = vec![0; config.min_memory() - 1];
    assert!(matches!(
        run_backpropagation(&mut small, &mut disks, &plot.sizes, &config),
        Err(Phase2Error::Config(ConfigError::MemoryTooSmall { .. }))
    ));

    let mut sizes = plot.sizes;
    sizes[3] += 1;
    assert_eq!(
        run_backpropagation(&mut memory, &mut disks, &sizes, &config),
        Err(Phase2Error::Config(ConfigError::TableTruncated {
            table: 3,
            name: "table3".into(),
            expected: 15,
            actual: 12
        }))
    );

    let mut sizes = plot.sizes;
    sizes[2] = 33;
    assert_eq!(
        run_backpropagation(&mut memory, &mut disks, &sizes, &config),
        Err(Phase2Error::Config(ConfigError::TableTooLarge {
            table: 2,
            size: 33,
            k: 5
        }))
    );

    // Nothing was touched.
    for (disk, table) in disks.iter().zip(&plot.tables) {
        assert_eq!(disk.as_slice(), &table[..]);
    }
}

#[test]
fn dangling_reference() {
    let mut plot = small_plot();
    // Table 6 has 6 entries, so position 4 + 3 is out of range.
    plot.tables[7][3..6].copy_from_slice(&encode(&[(7, 5), (4, 5), (3, OFFSET_SIZE)], 3));
    let tmp = tempfile::tempdir().unwrap();
    let mut disks = plot.disks();
    let mut memory = vec![0; 1024];
    assert_eq!(
        run_backpropagation(&mut memory, &mut disks, &plot.sizes, &plot.config(tmp.path(), 1)),
        Err(Phase2Error::DanglingReference {
            table: 7,
            index: 1,
            pos: 4,
            offset: 3,
            size: 6
        })
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn matches_reference(seed in any::<u64>(), k in 4usize..=10, log_num_buckets in 0u32..4) {
        let plot = Plot::random(seed, k, 600);
        let (sizes, tables) = plot.run(plot.ample_memory(log_num_buckets), log_num_buckets).unwrap();
        plot.check_result(&sizes, &tables);
        prop_assert_eq!((sizes, tables), plot.expected());
    }

    #[test]
    fn small_memory(seed in any::<u64>(), log_num_buckets in 0u32..4, fraction in 1usize..16) {
        let plot = Plot::random(seed, 8, 256);
        let min = plot.config(Path::new("."), log_num_buckets).min_memory();
        let memory = (plot.ample_memory(log_num_buckets) * fraction / 16).max(min);
        match plot.run(memory, log_num_buckets) {
            Ok((sizes, tables)) => {
                plot.check_result(&sizes, &tables);
                prop_assert_eq!((sizes, tables), plot.expected());
            }
            Err(Phase2Error::Sort(SortError::BucketTooLarge { .. })) => {}
            Err(error) => panic!("{error}"),
        }
    }
}
