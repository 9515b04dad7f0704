use proptest::prelude::*;

use crate::memory::AllocKind;
use crate::types::{Backend, ReduceOp, VarType};
use crate::{reduce, sync_thread};

const B: Backend = Backend::Cpu;

fn upload<T: bytemuck::Pod>(values: &[T]) -> u64 {
    let bytes: &[u8] = bytemuck::cast_slice(values);
    let ptr = crate::malloc(AllocKind::HostAsync, bytes.len()).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len()) };
    ptr
}

fn download<T: bytemuck::Pod + Default + Clone>(ptr: u64, count: usize) -> Vec<T> {
    sync_thread(B).unwrap();
    let mut out = vec![T::default(); count];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
    unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, bytes.as_mut_ptr(), bytes.len()) };
    out
}

fn scratch(bytes: usize) -> u64 {
    crate::malloc(AllocKind::HostAsync, bytes).unwrap()
}

#[test]
fn reduce_sum_small() {
    let _g = super::setup();
    let input = upload(&[1u32, 2, 3, 4, 5]);
    let out = scratch(4);
    reduce::reduce(B, VarType::U32, ReduceOp::Add, input, 5, out).unwrap();
    assert_eq!(download::<u32>(out, 1), vec![15]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn reduce_sum_multi_block() {
    let _g = super::setup();
    let n = 100_000u32;
    let values = vec![1u32; n as usize];
    let input = upload(&values);
    let out = scratch(4);
    reduce::reduce(B, VarType::U32, ReduceOp::Add, input, n, out).unwrap();
    assert_eq!(download::<u32>(out, 1), vec![n]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn reduce_min_max_mul() {
    let _g = super::setup();
    let input = upload(&[7i32, -3, 9, 2]);
    let out = scratch(4);
    reduce::reduce(B, VarType::I32, ReduceOp::Min, input, 4, out).unwrap();
    assert_eq!(download::<i32>(out, 1), vec![-3]);
    reduce::reduce(B, VarType::I32, ReduceOp::Max, input, 4, out).unwrap();
    assert_eq!(download::<i32>(out, 1), vec![9]);
    reduce::reduce(B, VarType::I32, ReduceOp::Mul, input, 4, out).unwrap();
    assert_eq!(download::<i32>(out, 1), vec![-378]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn reduce_float_matches_reference() {
    let _g = super::setup();
    let values: Vec<f64> = (0..50_000).map(|i| (i % 97) as f64 * 0.125).collect();
    let reference: f64 = values.iter().sum();
    let input = upload(&values);
    let out = scratch(8);
    reduce::reduce(B, VarType::F64, ReduceOp::Add, input, values.len() as u32, out).unwrap();
    let got = download::<f64>(out, 1)[0];
    assert!((got - reference).abs() < 1e-6 * reference.abs().max(1.0));
    crate::free(input);
    crate::free(out);
}

#[test]
fn reduce_rejects_float_bitwise_ops() {
    let _g = super::setup();
    let input = upload(&[1.0f32; 4]);
    let out = scratch(4);
    let err = reduce::reduce(B, VarType::F32, ReduceOp::And, input, 4, out).unwrap_err();
    assert!(matches!(err, crate::Error::BackendCapability(_)));
    crate::free(input);
    crate::free(out);
}

#[test]
fn all_any_with_padding_tail() {
    let _g = super::setup();
    // Six bytes leave a two-byte tail that must be padded with the identity.
    let ones = upload(&[1u8, 1, 1, 1, 1, 1]);
    assert!(reduce::all(B, ones, 6).unwrap());
    assert!(reduce::any(B, ones, 6).unwrap());
    crate::free(ones);

    let mixed = upload(&[1u8, 1, 0, 1, 1, 1]);
    assert!(!reduce::all(B, mixed, 6).unwrap());
    assert!(reduce::any(B, mixed, 6).unwrap());
    crate::free(mixed);

    let zeros = upload(&[0u8; 6]);
    assert!(!reduce::any(B, zeros, 6).unwrap());
    crate::free(zeros);
}

#[test]
fn prefix_sum_exclusive_inclusive() {
    let _g = super::setup();
    let input = upload(&[1u32, 2, 3, 4]);
    let out = scratch(16);
    reduce::prefix_sum(B, VarType::U32, true, input, 4, out).unwrap();
    assert_eq!(download::<u32>(out, 4), vec![0, 1, 3, 6]);
    reduce::prefix_sum(B, VarType::U32, false, input, 4, out).unwrap();
    assert_eq!(download::<u32>(out, 4), vec![1, 3, 6, 10]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn prefix_sum_in_place_multi_block() {
    let _g = super::setup();
    let n = 100_000u32;
    let values = vec![1u32; n as usize];
    let buf = upload(&values);
    reduce::prefix_sum(B, VarType::U32, true, buf, n, buf).unwrap();
    let out = download::<u32>(buf, n as usize);
    assert_eq!(out[0], 0);
    assert_eq!(out[1], 1);
    assert_eq!(out[65_537], 65_537);
    assert_eq!(out[(n - 1) as usize], n - 1);
    crate::free(buf);
}

#[test]
fn prefix_sum_f32() {
    let _g = super::setup();
    let input = upload(&[0.5f32, 1.5, 2.0]);
    let out = scratch(12);
    reduce::prefix_sum(B, VarType::F32, false, input, 3, out).unwrap();
    assert_eq!(download::<f32>(out, 3), vec![0.5, 2.0, 4.0]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn compress_basic() {
    let _g = super::setup();
    let input = upload(&[1u8, 0, 1, 1, 0]);
    let out = scratch(5 * 4);
    let count = reduce::compress(B, input, 5, out).unwrap();
    assert_eq!(count, 3);
    assert_eq!(download::<u32>(out, 3), vec![0, 2, 3]);
    crate::free(input);
    crate::free(out);
}

#[test]
fn mkperm_spec_example() {
    let _g = super::setup();
    let values = [2u32, 0, 2, 1, 0, 2];
    let input = upload(&values);
    let perm = scratch(6 * 4);
    let offsets = scratch(4 * 4 * 4);
    let unique = reduce::mkperm(B, input, 6, 3, perm, Some(offsets)).unwrap();
    assert_eq!(unique, 3);

    let p = download::<u32>(perm, 6);
    let sorted: Vec<u32> = p.iter().map(|&i| values[i as usize]).collect();
    assert_eq!(sorted, vec![0, 0, 1, 2, 2, 2]);

    let rows = download::<u32>(offsets, 16);
    assert_eq!(&rows[0..4], &[0, 0, 2, 0]);
    assert_eq!(&rows[4..8], &[1, 2, 1, 0]);
    assert_eq!(&rows[8..12], &[2, 3, 3, 0]);
    assert_eq!(rows[12], 3);

    crate::free(input);
    crate::free(perm);
    crate::free(offsets);
}

#[test]
fn mkperm_rejects_zero_buckets() {
    let _g = super::setup();
    let input = upload(&[0u32]);
    let perm = scratch(4);
    assert!(reduce::mkperm(B, input, 1, 0, perm, None).is_err());
    crate::free(input);
    crate::free(perm);
}

#[test]
fn block_copy_and_sum() {
    let _g = super::setup();
    let input = upload(&[1u32, 2, 3]);
    let expanded = scratch(6 * 4);
    reduce::block_copy(B, VarType::U32, input, expanded, 3, 2).unwrap();
    assert_eq!(download::<u32>(expanded, 6), vec![1, 1, 2, 2, 3, 3]);

    let collapsed = scratch(3 * 4);
    reduce::block_sum(B, VarType::U32, expanded, collapsed, 3, 2).unwrap();
    assert_eq!(download::<u32>(collapsed, 3), vec![2, 4, 6]);

    // block_size == 1 degenerates to a copy.
    let copy = scratch(3 * 4);
    reduce::block_copy(B, VarType::U32, input, copy, 3, 1).unwrap();
    assert_eq!(download::<u32>(copy, 3), vec![1, 2, 3]);

    crate::free(input);
    crate::free(expanded);
    crate::free(collapsed);
    crate::free(copy);
}

#[test]
fn reduce_expanded_folds_stripes() {
    let _g = super::setup();
    let buf = upload(&[1u32, 2, 3, 4, 10, 20, 30, 40, 100, 200, 300, 400]);
    reduce::reduce_expanded(VarType::U32, ReduceOp::Add, buf, 3, 4).unwrap();
    assert_eq!(download::<u32>(buf, 4), vec![111, 222, 333, 444]);
    crate::free(buf);
}

#[test]
fn poke_writes_single_element() {
    let _g = super::setup();
    let buf = upload(&[0u32; 4]);
    reduce::poke(B, buf + 8, 4, 7).unwrap();
    assert_eq!(download::<u32>(buf, 4), vec![0, 0, 7, 0]);
    assert!(reduce::poke(B, buf, 3, 0).is_err());
    crate::free(buf);
}

#[test]
fn aggregate_literals_and_pointers() {
    let _g = super::setup();
    let dst = upload(&[0u8; 16]);
    let source = 0xaabbu16;
    let entries = vec![
        reduce::AggregationEntry { src: 0x11, offset: 0, size: 1 },
        reduce::AggregationEntry { src: 0x2233, offset: 2, size: 2 },
        reduce::AggregationEntry {
            src: &source as *const u16 as u64,
            offset: 4,
            size: -2,
        },
        reduce::AggregationEntry { src: 0xdeadbeef, offset: 8, size: 4 },
    ];
    reduce::aggregate(B, dst, entries).unwrap();
    sync_thread(B).unwrap();
    let out = download::<u8>(dst, 16);
    assert_eq!(out[0], 0x11);
    assert_eq!(u16::from_le_bytes([out[2], out[3]]), 0x2233);
    assert_eq!(u16::from_le_bytes([out[4], out[5]]), 0xaabb);
    assert_eq!(u32::from_le_bytes([out[8], out[9], out[10], out[11]]), 0xdeadbeef);
    crate::free(dst);
}

#[test]
fn host_func_runs_after_stream_work() {
    let _g = super::setup();
    let buf = upload(&[0u32; 1]);
    crate::state::with_ts(B, |ts| crate::backend::memset_async(ts, buf, 1, 4, 42)).unwrap();
    let observed = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let o = observed.clone();
    reduce::enqueue_host_func(
        B,
        Box::new(move || {
            let value = unsafe { *(buf as *const u32) };
            o.store(value, std::sync::atomic::Ordering::Release);
        }),
    )
    .unwrap();
    sync_thread(B).unwrap();
    assert_eq!(observed.load(std::sync::atomic::Ordering::Acquire), 42);
    crate::free(buf);
}

#[test]
fn memset_widths_and_zero_collapse() {
    let _g = super::setup();
    let buf = upload(&[0u64; 4]);
    crate::state::with_ts(B, |ts| {
        crate::backend::memset_async(ts, buf, 4, 8, 0x1122334455667788)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(download::<u64>(buf, 4), vec![0x1122334455667788; 4]);

    crate::state::with_ts(B, |ts| {
        crate::backend::memset_async(ts, buf, 4, 8, 0)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(download::<u64>(buf, 4), vec![0; 4]);

    let err = crate::state::with_ts(B, |ts| crate::backend::memset_async(ts, buf, 1, 3, 0));
    assert!(err.is_err());
    crate::free(buf);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prefix_sum_round_trip(values in proptest::collection::vec(0u32..1000, 1..500)) {
        let _g = super::setup();
        let n = values.len();
        let input = upload(&values);
        let exc = scratch(n * 4);
        let inc = scratch(n * 4);
        reduce::prefix_sum(B, VarType::U32, true, input, n as u32, exc).unwrap();
        reduce::prefix_sum(B, VarType::U32, false, input, n as u32, inc).unwrap();
        let s = download::<u32>(exc, n);
        let t = download::<u32>(inc, n);
        prop_assert_eq!(s[0], 0);
        for i in 0..n {
            let prev = if i > 0 { t[i - 1] } else { 0 };
            prop_assert_eq!(t[i] - prev, values[i]);
            if i + 1 < n {
                prop_assert_eq!(s[i + 1] - s[i], values[i]);
            }
        }
        crate::free(input);
        crate::free(exc);
        crate::free(inc);
    }

    #[test]
    fn compress_equivalence(values in proptest::collection::vec(0u8..2, 1..2000)) {
        let _g = super::setup();
        let n = values.len();
        let input = upload(&values);
        let out = scratch(n * 4);
        let count = reduce::compress(B, input, n as u32, out).unwrap();
        let expected: u32 = values.iter().map(|&b| b as u32).sum();
        prop_assert_eq!(count, expected);
        let indices = download::<u32>(out, count as usize);
        for w in indices.windows(2) {
            prop_assert!(w[0] < w[1]);
        }
        for &i in &indices {
            prop_assert_eq!(values[i as usize], 1);
        }
        crate::free(input);
        crate::free(out);
    }

    #[test]
    fn mkperm_permutation_correctness(
        values in proptest::collection::vec(0u32..17, 1..3000),
    ) {
        let _g = super::setup();
        let n = values.len();
        let input = upload(&values);
        let perm = scratch(n * 4);
        let offsets = scratch((17 + 1) * 4 * 4);
        let unique = reduce::mkperm(B, input, n as u32, 17, perm, Some(offsets)).unwrap();

        let p = download::<u32>(perm, n);
        let mut seen = vec![false; n];
        for &i in &p {
            prop_assert!(!seen[i as usize]);
            seen[i as usize] = true;
        }
        let sorted: Vec<u32> = p.iter().map(|&i| values[i as usize]).collect();
        for w in sorted.windows(2) {
            prop_assert!(w[0] <= w[1]);
        }

        let mut distinct = values.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(unique as usize, distinct.len());

        let rows = download::<u32>(offsets, (unique as usize) * 4);
        let mut covered = 0u32;
        for r in rows.chunks(4) {
            prop_assert_eq!(r[1], covered);
            covered += r[2];
        }
        prop_assert_eq!(covered as usize, n);

        crate::free(input);
        crate::free(perm);
        crate::free(offsets);
    }
}
