use kira_posdb::*;
use proptest::prelude::*;
use std::collections::HashMap;

/// Reference index: mer → positions in stream order.
fn naive_index(hits: &[(u64, u64)]) -> HashMap<u64, Vec<u64>> {
    let mut h = HashMap::<u64, Vec<u64>>::new();
    for &(mer, pos) in hits {
        h.entry(mer).or_default().push(pos);
    }
    h
}

fn hits_strategy() -> impl Strategy<Value = (u32, Vec<(u64, u64)>)> {
    (1u32..=8).prop_flat_map(|k| {
        let full = encode::mer_mask(k as usize);
        // few distinct mers so repeats are common
        let mers = prop::collection::vec(0..=full, 1..24);
        (
            Just(k),
            mers.prop_flat_map(|pool| {
                prop::collection::vec((prop::sample::select(pool), 0u64..5000), 0..200)
            }),
        )
    })
}

fn build(hits: &[(u64, u64)], cfg: BuildConfig) -> PositionDb {
    let mut src = MerList::from_pairs(hits.iter().copied());
    PositionDb::build(&mut src, cfg).unwrap()
}

proptest! {
    #[test]
    fn prop_codec_inverts(k in 1u32..=32, t_frac in 0.0f64..1.0, m in any::<u64>()) {
        let mer_bits = 2 * k;
        let t = 1 + ((mer_bits - 1) as f64 * t_frac) as u32;
        let t = t.min(mer_bits - 1);
        let codec = BitCodec::new(k, t).unwrap();
        let m = m & encode::mer_mask(k as usize);
        let h = codec.hash(m);
        prop_assert!(h < (1u64 << t));
        prop_assert_eq!(codec.rebuild(h, codec.check(m)), m);
    }

    #[test]
    fn prop_exact_lookup_matches_reference((k, hits) in hits_strategy(), probe in any::<u64>()) {
        let db = build(&hits, BuildConfig::new(k));
        let reference = naive_index(&hits);

        prop_assert_eq!(db.counters().mers, hits.len() as u64);
        prop_assert_eq!(db.counters().distinct, reference.len() as u64);
        prop_assert_eq!(
            db.counters().unique,
            reference.values().filter(|v| v.len() == 1).count() as u64
        );
        for (mer, positions) in &reference {
            let got = db.get_exact(*mer);
            prop_assert_eq!(got.as_ref(), Some(positions));
            prop_assert_eq!(db.count_exact(*mer), positions.len() as u64);
            prop_assert!(db.exists_exact(*mer));
        }
        let probe = probe & encode::mer_mask(k as usize);
        if !reference.contains_key(&probe) {
            prop_assert_eq!(db.get_exact(probe), None);
            prop_assert!(!db.exists_exact(probe));
            prop_assert_eq!(db.count_exact(probe), 0);
        }
    }

    #[test]
    fn prop_mismatch_matches_brute_force(
        (k, hits) in hits_strategy().prop_filter("k >= 4", |(k, _)| *k >= 4),
        n in 0u32..=2,
        query in any::<u64>(),
    ) {
        let db = build(&hits, BuildConfig::new(k));
        let reference = naive_index(&hits);
        let q = query & encode::mer_mask(k as usize);

        let mut expected: Vec<u64> = reference
            .iter()
            .filter(|(m, _)| base_mismatches(**m, q, k as usize) <= n)
            .flat_map(|(_, p)| p.iter().copied())
            .collect();
        expected.sort_unstable();
        expected.dedup();

        let got = db.get_up_to_n_mismatches(q, n).unwrap();
        if expected.is_empty() {
            prop_assert_eq!(got, None);
        } else {
            prop_assert_eq!(got, Some(expected));
        }
    }

    #[test]
    fn prop_filter_keeps_only_range(
        (k, hits) in hits_strategy(),
        lo in 0u64..5000,
        span in 0u64..5000,
    ) {
        let hi = lo + span;
        let mut db = build(&hits, BuildConfig::new(k));
        db.filter(lo, hi);
        for (mer, positions) in naive_index(&hits) {
            let kept: Vec<u64> = positions.into_iter().filter(|p| (lo..=hi).contains(p)).collect();
            if kept.is_empty() {
                prop_assert_eq!(db.get_exact(mer), None);
                prop_assert!(!db.exists_exact(mer));
            } else {
                prop_assert_eq!(db.count_exact(mer), kept.len() as u64);
                prop_assert_eq!(db.get_exact(mer), Some(kept));
            }
        }
    }
}
