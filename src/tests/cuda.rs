//! CUDA-backend tests; they bail out silently on machines without a device.

use crate::memory::AllocKind;
use crate::types::{Backend, ReduceOp, VarType};
use crate::var::Var;
use crate::{reduce, Loop};

const B: Backend = Backend::Cuda;

fn cuda_available() -> bool {
    crate::sync_thread(B).is_ok()
}

#[test]
fn cuda_arithmetic_chain() {
    let _g = super::setup();
    if !cuda_available() {
        return;
    }
    let x = Var::counter(B, 1024).unwrap();
    let three = Var::literal_u32(B, 3, 1).unwrap();
    let out = x.mul(&three).unwrap().to_vec_u32().unwrap();
    assert_eq!(out[0], 0);
    assert_eq!(out[1023], 3069);
}

#[test]
fn cuda_reduce_and_scan() {
    let _g = super::setup();
    if !cuda_available() {
        return;
    }
    let n = 100_000usize;
    let values = vec![1u32; n];
    let bytes: &[u8] = bytemuck::cast_slice(&values);
    let input = crate::malloc(AllocKind::Device, bytes.len()).unwrap();
    let out = crate::malloc(AllocKind::HostPinned, 4).unwrap();
    crate::state::with_ts(B, |ts| {
        crate::backend::memcpy(ts, input, bytes.as_ptr() as u64, bytes.len())
    })
    .unwrap();

    reduce::reduce(B, VarType::U32, ReduceOp::Add, input, n as u32, out).unwrap();
    crate::sync_thread(B).unwrap();
    assert_eq!(unsafe { *(out as *const u32) }, n as u32);

    reduce::prefix_sum(B, VarType::U32, true, input, n as u32, input).unwrap();
    let mut host = vec![0u32; n];
    crate::state::with_ts(B, |ts| {
        crate::backend::memcpy(ts, host.as_mut_ptr() as u64, input, n * 4)
    })
    .unwrap();
    assert_eq!(host[0], 0);
    assert_eq!(host[n - 1], (n - 1) as u32);

    crate::free(input);
    crate::free(out);
}

#[test]
fn cuda_compress_and_mkperm() {
    let _g = super::setup();
    if !cuda_available() {
        return;
    }
    let values = [2u32, 0, 2, 1, 0, 2];
    let bytes: &[u8] = bytemuck::cast_slice(&values);
    let input = crate::malloc(AllocKind::Device, bytes.len()).unwrap();
    let perm = crate::malloc(AllocKind::Device, 6 * 4).unwrap();
    let offsets = crate::malloc(AllocKind::HostPinned, 4 * 4 * 4).unwrap();
    crate::state::with_ts(B, |ts| {
        crate::backend::memcpy(ts, input, bytes.as_ptr() as u64, bytes.len())
    })
    .unwrap();

    let unique = reduce::mkperm(B, input, 6, 3, perm, Some(offsets)).unwrap();
    assert_eq!(unique, 3);
    let mut p = vec![0u32; 6];
    crate::state::with_ts(B, |ts| {
        crate::backend::memcpy(ts, p.as_mut_ptr() as u64, perm, 6 * 4)
    })
    .unwrap();
    let sorted: Vec<u32> = p.iter().map(|&i| values[i as usize]).collect();
    assert_eq!(sorted, vec![0, 0, 1, 2, 2, 2]);

    let mask = [1u8, 0, 1, 1, 0, 1];
    let mask_dev = crate::malloc(AllocKind::Device, 64).unwrap();
    let out = crate::malloc(AllocKind::Device, 6 * 4).unwrap();
    crate::state::with_ts(B, |ts| {
        crate::backend::memcpy(ts, mask_dev, mask.as_ptr() as u64, 6)
    })
    .unwrap();
    let count = reduce::compress(B, mask_dev, 6, out).unwrap();
    assert_eq!(count, 4);

    crate::free(input);
    crate::free(perm);
    crate::free(offsets);
    crate::free(mask_dev);
    crate::free(out);
}

#[test]
fn cuda_counted_loop() {
    let _g = super::setup();
    if !cuda_available() {
        return;
    }
    for record in [true, false] {
        crate::set_flag(crate::JitFlag::LoopRecord, record);
        let mut x = Var::counter(B, 10).unwrap();
        let mut z = Var::literal_f32(B, 1.0, 1).unwrap();
        let five = Var::literal_u32(B, 5, 1).unwrap();
        let one = Var::literal_u32(B, 1, 1).unwrap();
        let one_f = Var::literal_f32(B, 1.0, 1).unwrap();

        let mut l = Loop::new("cuda-counted", &mut [&mut x, &mut z]).unwrap();
        loop {
            let m = x.lt(&five).unwrap();
            if !l.cond(&m, &mut [&mut x, &mut z]).unwrap() {
                break;
            }
            x = x.add(&one).unwrap();
            z = z.add(&one_f).unwrap();
        }

        assert_eq!(x.to_vec_u32().unwrap(), vec![5, 5, 5, 5, 5, 5, 6, 7, 8, 9]);
        assert_eq!(
            z.to_vec_f32().unwrap(),
            vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 1.0, 1.0, 1.0, 1.0]
        );
    }
    crate::set_flag(crate::JitFlag::LoopRecord, true);
}
