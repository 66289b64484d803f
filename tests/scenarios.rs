use kira_posdb::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::path::Path;

fn mer(s: &str) -> u64 {
    encode_kmer(s.as_bytes()).unwrap()
}

fn scenario_hits() -> MerList {
    MerList::from_pairs([(mer("ACGT"), 10), (mer("TTTT"), 5), (mer("ACGT"), 20)])
}

fn scenario_db(cfg: BuildConfig) -> PositionDb {
    PositionDb::build(&mut scenario_hits(), cfg).unwrap()
}

fn same_answers(a: &PositionDb, b: &PositionDb, mers: impl IntoIterator<Item = u64>) {
    for m in mers {
        assert_eq!(a.exists_exact(m), b.exists_exact(m), "exists {m:#x}");
        assert_eq!(a.count_exact(m), b.count_exact(m), "count {m:#x}");
        assert_eq!(a.get_exact(m), b.get_exact(m), "positions {m:#x}");
    }
}

#[test]
fn exact_lookup_scenario() {
    for t in 1..8 {
        let db = scenario_db(BuildConfig::new(4).table_bits(t));
        assert_eq!(db.count_exact(mer("ACGT")), 2);
        assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10, 20]));
        assert_eq!(db.get_exact(mer("TTTT")), Some(vec![5]));
        assert!(!db.exists_exact(mer("GGGG")));
        assert_eq!(db.get_exact(mer("GGGG")), None);

        let c = db.counters();
        assert_eq!((c.mers, c.distinct, c.unique, c.entries), (3, 2, 1, 2));
    }
}

#[test]
fn get_exact_into_reuses_buffer() {
    let db = scenario_db(BuildConfig::new(4));
    let mut out = vec![99, 98, 97];
    assert_eq!(db.get_exact_into(mer("TTTT"), &mut out), Some(1));
    assert_eq!(out, vec![5]);
    assert_eq!(db.get_exact_into(mer("GGGG"), &mut out), None);
    assert!(out.is_empty());
}

#[test]
fn filter_keeps_positions_in_range() {
    let mut db = scenario_db(BuildConfig::new(4).table_bits(3));
    db.filter(0, 15);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10]));
    assert_eq!(db.count_exact(mer("ACGT")), 1);
    assert_eq!(db.get_exact(mer("TTTT")), Some(vec![5]));
}

#[test]
fn filter_that_empties_a_mer_makes_it_absent() {
    let mut db = scenario_db(BuildConfig::new(4).table_bits(3));
    db.filter(11, 15);
    for m in ["ACGT", "TTTT"] {
        assert_eq!(db.get_exact(mer(m)), None);
        assert!(!db.exists_exact(mer(m)));
        assert_eq!(db.count_exact(mer(m)), 0);
        assert!(!db.set_count(mer(m), 7));
        assert_eq!(db.get_up_to_n_mismatches(mer(m), 2).unwrap(), None);
    }
    // widening the range again does not resurrect anything
    db.filter(0, u64::MAX);
    assert!(!db.exists_exact(mer("ACGT")));
}

#[test]
fn set_count_overwrites_and_clamps() {
    let mut db = scenario_db(BuildConfig::new(4));
    assert!(!db.set_count(mer("GGGG"), 4));
    assert!(!db.exists_exact(mer("GGGG")));

    assert!(db.set_count(mer("TTTT"), 3));
    assert_eq!(db.count_exact(mer("TTTT")), 3);
    assert_eq!(db.get_exact(mer("TTTT")), Some(vec![5]));

    // size field holds counts up to the number of mers (3 -> 2 bits)
    assert!(db.set_count(mer("ACGT"), 1000));
    assert_eq!(db.count_exact(mer("ACGT")), 3);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10, 20]));

    // zero is raised to one; the mer stays present
    assert!(db.set_count(mer("ACGT"), 0));
    assert!(db.exists_exact(mer("ACGT")));
    assert_eq!(db.count_exact(mer("ACGT")), 1);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10, 20]));
    assert!(db.set_count(mer("ACGT"), 2));
    assert_eq!(db.count_exact(mer("ACGT")), 2);
}

#[test]
fn filter_resets_counts_to_kept_positions() {
    let mut db = scenario_db(BuildConfig::new(4));
    assert!(db.set_count(mer("TTTT"), 3));
    assert!(db.set_count(mer("ACGT"), 1));

    // nothing dropped, counts still follow the positions
    db.filter(0, 100);
    assert_eq!(db.count_exact(mer("TTTT")), 1);
    assert_eq!(db.count_exact(mer("ACGT")), 2);

    assert!(db.set_count(mer("ACGT"), 3));
    db.filter(0, 15);
    assert_eq!(db.count_exact(mer("ACGT")), 1);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10]));
}

#[test]
fn bits_above_the_mer_are_ignored() {
    let mut db = scenario_db(BuildConfig::new(4).table_bits(3));
    let noisy = mer("ACGT") | (0b1011 << 40);
    assert!(db.exists_exact(noisy));
    assert_eq!(db.count_exact(noisy), 2);
    assert_eq!(db.get_exact(noisy), Some(vec![10, 20]));
    assert_eq!(db.get_up_to_n_mismatches(noisy, 0).unwrap(), Some(vec![10, 20]));
    assert!(!db.exists_exact(mer("GGGG") | (1 << 63)));
    assert!(db.set_count(noisy, 1));
    assert_eq!(db.count_exact(mer("ACGT")), 1);
}

#[test]
fn mismatch_lookup_includes_exact_match() {
    let db = scenario_db(BuildConfig::new(4).table_bits(3).max_mismatch(1));
    assert!(db.mismatch_matcher().is_some());
    assert_eq!(db.get_up_to_n_mismatches(mer("ACGT"), 1).unwrap(), Some(vec![10, 20]));
    assert_eq!(db.get_up_to_n_mismatches(mer("ACGA"), 1).unwrap(), Some(vec![10, 20]));
    assert_eq!(db.get_up_to_n_mismatches(mer("ACGA"), 0).unwrap(), None);
    assert_eq!(db.get_up_to_n_mismatches(mer("TTAA"), 1).unwrap(), None);
    assert_eq!(db.get_up_to_n_mismatches(mer("TTAA"), 2).unwrap(), Some(vec![5]));
    // budget beyond the prepared matcher uses a transient one
    assert_eq!(
        db.get_up_to_n_mismatches(mer("AAAA"), 4).unwrap(),
        Some(vec![5, 10, 20])
    );
    // budgets past the mer size behave like the mer size
    assert_eq!(
        db.get_up_to_n_mismatches(mer("GGGG"), 9).unwrap(),
        Some(vec![5, 10, 20])
    );
    let mut out = Vec::new();
    assert!(db.get_up_to_n_mismatches_into(mer("GGGG"), u32::MAX, &mut out).unwrap());
    assert_eq!(out, vec![5, 10, 20]);
}

#[test]
fn mismatch_setup_reports_cost_and_rejects_huge_budgets() {
    let mut db = scenario_db(BuildConfig::new(4));
    let cost = db.set_up_mismatch_matcher(2, 2).unwrap();
    assert!(cost > 0.0);
    assert_eq!(db.max_mismatch(), 2);
    assert!(matches!(db.set_up_mismatch_matcher(5, 2), Err(IndexError::Config(_))));
}

#[test]
fn persistence_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    for layout in [TableLayout::Packed, TableLayout::FullWidth] {
        let db = scenario_db(BuildConfig::new(4).layout(layout).max_mismatch(1));
        let path = dir.path().join(format!("{layout:?}.posdb"));
        db.save_state(&path).unwrap();

        let loaded = PositionDb::open(&path, true).unwrap();
        assert!(loaded.is_loaded());
        assert_eq!(loaded.layout(), layout);
        assert_eq!(loaded.counters(), db.counters());
        assert_eq!(loaded.widths(), db.widths());
        assert_eq!(loaded.table_bits(), db.table_bits());
        assert!(loaded.mismatch_matcher().is_some());
        same_answers(&db, &loaded, (0..256).map(|m| m as u64));
        assert_eq!(
            loaded.get_up_to_n_mismatches(mer("ACGA"), 1).unwrap(),
            Some(vec![10, 20])
        );
    }
}

#[test]
fn filtered_table_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filtered.posdb");
    let mut db = scenario_db(BuildConfig::new(4));
    db.filter(6, 15);
    assert!(db.set_count(mer("ACGT"), 2));
    db.save_state(&path).unwrap();

    let mut other = scenario_db(BuildConfig::new(4).table_bits(2));
    other.load_state(&path, true, true).unwrap();
    same_answers(&db, &other, (0..256).map(|m| m as u64));
    assert!(!other.exists_exact(mer("TTTT")));
    assert_eq!(other.count_exact(mer("ACGT")), 2);
}

#[test]
fn header_only_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.posdb");
    let db = scenario_db(BuildConfig::new(4).mer_skip(0).max_mismatch(1));
    db.save_state(&path).unwrap();

    let hdr = PositionDb::open(&path, false).unwrap();
    assert!(!hdr.is_loaded());
    assert_eq!(hdr.mer_size(), 4);
    assert_eq!(hdr.max_mismatch(), 1);
    assert_eq!(hdr.counters(), db.counters());
    assert!(!hdr.exists_exact(mer("ACGT")));
    assert_eq!(hdr.get_exact(mer("ACGT")), None);
    assert_eq!(hdr.get_up_to_n_mismatches(mer("ACGT"), 1).unwrap(), None);

    let again = dir.path().join("again.posdb");
    assert!(matches!(hdr.save_state(&again), Err(IndexError::NotLoaded)));

    let mut text = Vec::new();
    hdr.print_state(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("merSizeInBases:     4"));
    assert!(text.contains("dataLoaded:         false"));
}

/// Saves the scenario table and returns the raw file bytes.
fn saved_bytes(path: &Path) -> Vec<u8> {
    scenario_db(BuildConfig::new(4).table_bits(3)).save_state(path).unwrap();
    std::fs::read(path).unwrap()
}

fn assert_rejected(path: &Path, bytes: &[u8]) {
    std::fs::write(path, bytes).unwrap();
    let mut db = scenario_db(BuildConfig::new(4));
    let before = db.counters();
    let err = db.load_state(path, false, true).unwrap_err();
    assert!(matches!(err, IndexError::Format(_)), "{err}");
    // the failed load left the table as it was
    assert_eq!(db.counters(), before);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![10, 20]));
}

#[test]
fn corrupted_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.posdb");
    let good = saved_bytes(&path);
    assert_eq!(good.len() as u64 % 4, 0);

    let mut magic = good.clone();
    magic[0] ^= 0xFF;
    assert_rejected(&path, &magic);

    let mut version = good.clone();
    version[4] = 9;
    assert_rejected(&path, &version);

    let mut mer_size = good.clone();
    mer_size[8] = 40;
    assert_rejected(&path, &mer_size);

    assert_rejected(&path, &good[..good.len() - 8]);
    assert_rejected(&path, &good[..40]);

    let mut trailing = good.clone();
    trailing.push(0);
    assert_rejected(&path, &trailing);

    let mut sizes = good.clone();
    sizes[HEADER_BYTES as usize] = sizes[HEADER_BYTES as usize].wrapping_add(1);
    assert_rejected(&path, &sizes);

    // the position store is the last word: [len=2 | 10 | 20] in 5-bit fields
    let store_at = good.len() - 8;
    let store = u64::from_le_bytes(good[store_at..].try_into().unwrap());
    assert_eq!(store & 0x1F, 2);
    for len in [0u64, 0x1F] {
        let mut bad = good.clone();
        bad[store_at..].copy_from_slice(&((store & !0x1F) | len).to_le_bytes());
        assert_rejected(&path, &bad);
    }
}

#[test]
fn list_length_overflow_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wide.posdb");
    let hits = [(mer("ACGT"), u64::MAX), (mer("ACGT"), 1), (mer("TTTT"), 5)];
    let db = PositionDb::build(&mut MerList::from_pairs(hits), BuildConfig::new(4)).unwrap();
    assert_eq!(db.widths().store_width(), 64);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![u64::MAX, 1]));
    db.save_state(&path).unwrap();

    // three 64-bit store fields close the file; the first is the list length
    let mut bytes = std::fs::read(&path).unwrap();
    let len_at = bytes.len() - 24;
    assert_eq!(&bytes[len_at..len_at + 8], &2u64.to_le_bytes());
    bytes[len_at..len_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    assert_rejected(&path, &bytes);
}

#[test]
fn open_expecting_checks_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.posdb");
    scenario_db(BuildConfig::new(4)).save_state(&path).unwrap();

    assert!(matches!(
        PositionDb::open_expecting(&path, 5, 0, 0, true),
        Err(IndexError::Config(_))
    ));
    assert!(matches!(
        PositionDb::open_expecting(&path, 4, 1, 0, true),
        Err(IndexError::Config(_))
    ));
    let db = PositionDb::open_expecting(&path, 4, 0, 1, true).unwrap();
    assert_eq!(db.max_mismatch(), 1);
    assert_eq!(db.get_up_to_n_mismatches(mer("ACGA"), 1).unwrap(), Some(vec![10, 20]));
}

#[test]
fn mask_only_and_count_filters() {
    let acgt = mer("ACGT");
    let tttt = mer("TTTT");

    let mask: HashSet<u64> = [acgt].into();
    let db = Builder::new(BuildConfig::new(4))
        .mask(&mask)
        .build(&mut scenario_hits())
        .unwrap();
    assert!(!db.exists_exact(acgt));
    assert!(db.exists_exact(tttt));
    assert_eq!(db.counters().mers, 1);

    let only: HashSet<u64> = [acgt].into();
    let db = Builder::new(BuildConfig::new(4))
        .only(&only)
        .build(&mut scenario_hits())
        .unwrap();
    assert_eq!(db.get_exact(acgt), Some(vec![10, 20]));
    assert!(!db.exists_exact(tttt));

    let counts: HashMap<u64, u64> = [(acgt, 2), (tttt, 1)].into();
    let db = Builder::new(BuildConfig::new(4).min_count(2))
        .counts(&counts)
        .build(&mut scenario_hits())
        .unwrap();
    assert!(db.exists_exact(acgt));
    assert!(!db.exists_exact(tttt));

    let db = Builder::new(BuildConfig::new(4).max_count(1))
        .counts(&counts)
        .build(&mut scenario_hits())
        .unwrap();
    assert!(!db.exists_exact(acgt));
    assert!(db.exists_exact(tttt));

    // canonical set: AAAA stands for TTTT too
    let canon = Canonical(HashSet::from([mer("AAAA")]));
    let db = Builder::new(BuildConfig::new(4))
        .mask(&canon)
        .build(&mut scenario_hits())
        .unwrap();
    assert!(!db.exists_exact(tttt));
    assert!(db.exists_exact(acgt));
}

#[test]
fn skip_samples_every_other_mer() {
    let seq = b"ACGTACGTAC";
    let mut all = SequenceMers::new(seq, 4).unwrap();
    let db = PositionDb::build(&mut all, BuildConfig::new(4)).unwrap();
    assert_eq!(db.get_exact(mer("CGTA")), Some(vec![1, 5]));
    assert_eq!(db.counters().mers, 7);

    let mut every_other = SequenceMers::new(seq, 4).unwrap();
    let db = PositionDb::build(&mut every_other, BuildConfig::new(4).mer_skip(1)).unwrap();
    assert_eq!(db.mer_skip(), 1);
    assert_eq!(db.counters().mers, 4);
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![0, 4]));
    assert_eq!(db.get_exact(mer("GTAC")), Some(vec![2, 6]));
    assert!(!db.exists_exact(mer("CGTA")));
}

#[test]
fn ambiguous_bases_reset_the_window() {
    let mut mers = SequenceMers::new(b"ACGTNACGTTT", 4).unwrap();
    let db = PositionDb::build(&mut mers, BuildConfig::new(4)).unwrap();
    assert_eq!(db.get_exact(mer("ACGT")), Some(vec![0, 5]));
    assert!(!db.exists_exact(mer("TACG")));
    assert_eq!(db.counters().mers, 4);
}

#[test]
fn empty_source_builds_an_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.posdb");
    let db = PositionDb::build(&mut MerList::default(), BuildConfig::new(8)).unwrap();
    assert_eq!(db.counters(), Counters::default());
    assert!(!db.exists_exact(0));
    assert_eq!(db.get_up_to_n_mismatches(0, 2).unwrap(), None);

    db.save_state(&path).unwrap();
    let loaded = PositionDb::open(&path, true).unwrap();
    assert_eq!(loaded.counters(), Counters::default());
    assert_eq!(loaded.get_exact(0), None);
}

#[test]
fn invalid_configurations_are_rejected() {
    let err = PositionDb::build(&mut scenario_hits(), BuildConfig::new(33)).unwrap_err();
    assert!(matches!(err, IndexError::Config(_)));
    assert!(PositionDb::build(&mut scenario_hits(), BuildConfig::new(0)).is_err());
    assert!(PositionDb::build(&mut scenario_hits(), BuildConfig::new(4).max_mismatch(5)).is_err());
    assert!(PositionDb::build(&mut scenario_hits(), BuildConfig::new(4).table_bits(8)).is_err());
    assert!(
        PositionDb::build(&mut scenario_hits(), BuildConfig::new(4).min_count(3).max_count(2))
            .is_err()
    );
    assert!(SequenceMers::new(b"ACGT", 33).is_err());
}

/// Replays a different stream on every pass.
struct Drifting {
    pass: u64,
    i: u64,
}

impl MerSource for Drifting {
    fn next_hit(&mut self) -> Option<MerHit> {
        if self.i >= 3 + self.pass {
            return None;
        }
        self.i += 1;
        Some(MerHit {
            mer: 0b1011,
            position: self.i,
        })
    }

    fn rewind(&mut self) -> Result<(), IndexError> {
        if self.i > 0 {
            self.pass += 1;
        }
        self.i = 0;
        Ok(())
    }

    fn approximate_mers(&self) -> u64 {
        3
    }
}

#[test]
fn changing_source_between_passes_fails() {
    let mut src = Drifting { pass: 0, i: 0 };
    let err = PositionDb::build(&mut src, BuildConfig::new(4)).unwrap_err();
    assert!(matches!(err, IndexError::SourceMismatch(_)), "{err}");
}

fn random_bases(rng: &mut StdRng, n: usize) -> Vec<u8> {
    (0..n).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect()
}

#[test]
fn larger_sequence_against_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut seq = random_bases(&mut rng, 20_000);
    // plant repeats
    let repeat = seq[100..112].to_vec();
    for at in [5_000, 9_000, 15_000] {
        seq[at..at + 12].copy_from_slice(&repeat);
    }

    let k = 12;
    let mut reference = HashMap::<u64, Vec<u64>>::new();
    for (i, w) in seq.windows(k).enumerate() {
        reference.entry(encode_kmer(w).unwrap()).or_default().push(i as u64);
    }

    for cfg in [
        BuildConfig::new(k as u32),
        BuildConfig::new(k as u32).max_memory_mb(1).threads(2),
        BuildConfig::new(k as u32).layout(TableLayout::FullWidth).table_bits(16),
    ] {
        let mut mers = SequenceMers::new(&seq, k).unwrap();
        let db = PositionDb::build(&mut mers, cfg).unwrap();
        assert_eq!(db.counters().distinct, reference.len() as u64);
        for (m, positions) in &reference {
            assert_eq!(db.get_exact(*m).as_ref(), Some(positions));
        }
        let planted = db.get_exact(encode_kmer(&repeat).unwrap()).unwrap();
        for at in [100, 5_000, 9_000, 15_000] {
            assert!(planted.contains(&at));
        }
    }
}

#[test]
fn concurrent_readers_agree() {
    let mut rng = StdRng::seed_from_u64(11);
    let seq = random_bases(&mut rng, 5_000);
    let mut mers = SequenceMers::new(&seq, 10).unwrap();
    let db = PositionDb::build(&mut mers, BuildConfig::new(10).max_mismatch(1)).unwrap();
    let queries: Vec<u64> = seq.windows(10).map(|w| encode_kmer(w).unwrap()).collect();

    let serial: Vec<_> = queries
        .iter()
        .map(|&q| db.get_up_to_n_mismatches(q, 1).unwrap())
        .collect();
    std::thread::scope(|s| {
        for t in 0..4 {
            let (db, queries, serial) = (&db, &queries, &serial);
            s.spawn(move || {
                for (i, &q) in queries.iter().enumerate().skip(t).step_by(4) {
                    assert!(db.exists_exact(q));
                    assert_eq!(db.get_up_to_n_mismatches(q, 1).unwrap(), serial[i]);
                }
            });
        }
    });
}

#[test]
fn table_sizing_respects_budget() {
    let small = choose_table_bits(24, 1_000_000, 0, TableLayout::Packed);
    assert!(small >= 1 && small < 24);
    let budget = choose_table_bits(24, 1_000_000, 64, TableLayout::Packed);
    assert!(budget >= 1 && budget <= 20);
    assert!(estimate_bits(24, budget, 1_000_000, TableLayout::Packed) <= 64 * 8 * 1024 * 1024);
    // nothing fits: fall back to the smallest estimate
    assert_eq!(choose_table_bits(24, 1_000_000, 1, TableLayout::Packed), small);
}
