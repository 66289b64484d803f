//! LSD radix sort for `u64` keys with a paired values array.
//! 8-bit passes, only as many as the key width needs. Stable via counting +
//! prefix sums, so equal keys keep their input order.

/// Sort `keys` (each below `2^key_bits`) ascending and permute `vals`
/// accordingly. Temporary buffers are allocated once and reused across passes.
pub fn radix_sort_pairs_u64(keys: &mut [u64], vals: &mut [u64], key_bits: u32) {
    debug_assert_eq!(keys.len(), vals.len());
    let n = keys.len();
    if n <= 1 {
        return;
    }
    // Tiny buckets are the common case; insertion sort is stable too.
    if n <= 32 {
        insertion_sort_pairs(keys, vals);
        return;
    }

    let mut tmp_keys = vec![0u64; n];
    let mut tmp_vals = vec![0u64; n];

    let passes = key_bits.div_ceil(8).max(1);
    for pass in 0..passes {
        let shift = pass * 8;
        let mut counts = [0usize; 256];

        for &k in keys.iter() {
            counts[((k >> shift) & 0xFF) as usize] += 1;
        }

        // Prefix sums -> positions
        let mut sum = 0usize;
        for c in counts.iter_mut() {
            let tmp = *c;
            *c = sum;
            sum += tmp;
        }

        for i in 0..n {
            let k = keys[i];
            let b = ((k >> shift) & 0xFF) as usize;
            let pos = counts[b];
            tmp_keys[pos] = k;
            tmp_vals[pos] = vals[i];
            counts[b] = pos + 1;
        }

        keys.copy_from_slice(&tmp_keys);
        vals.copy_from_slice(&tmp_vals);
    }
}

fn insertion_sort_pairs(keys: &mut [u64], vals: &mut [u64]) {
    for i in 1..keys.len() {
        let (k, v) = (keys[i], vals[i]);
        let mut j = i;
        while j > 0 && keys[j - 1] > k {
            keys[j] = keys[j - 1];
            vals[j] = vals[j - 1];
            j -= 1;
        }
        keys[j] = k;
        vals[j] = v;
    }
}
