//! Parallel primitives: reductions, prefix sums, stream compaction,
//! bucketed permutation, block replication/summation, and the host-function
//! queue. Every entry point dispatches on the backend; the host paths are
//! block-decomposed over the task pool, the device paths launch the builtin
//! kernels from `backend::cuda`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use half::f16;
use num_traits::{Bounded, Float, One, PrimInt, WrappingAdd, WrappingMul, Zero};
use tracing::debug;

use crate::backend::{self, cpu, cuda, cpu_blocks, memset_async, submit_cpu, submit_gpu};
use crate::error::{raise, Error, Result};
use crate::memory::{self, AllocKind};
use crate::state::{self, ThreadState};
use crate::types::{Backend, KernelType, ReduceOp, VarType};

/// One record of an `aggregate` batch. A negative `size` means `src` is a
/// pointer to `|size|` bytes; a positive one means `src` holds the value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AggregationEntry {
    pub src: u64,
    pub offset: u32,
    pub size: i32,
}

// ====================================================================
// Host reduction kernels
// ====================================================================

type Reduction = fn(u64, u32, u32, u64);

fn r_sum_int<T: WrappingAdd + Zero + Copy>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::zero();
    for i in start..end {
        acc = acc.wrapping_add(unsafe { &*p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_sum_float<T: Float>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::zero();
    for i in start..end {
        acc = acc + unsafe { *p.add(i as usize) };
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_mul_int<T: WrappingMul + One + Copy>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::one();
    for i in start..end {
        acc = acc.wrapping_mul(unsafe { &*p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_mul_float<T: Float>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::one();
    for i in start..end {
        acc = acc * unsafe { *p.add(i as usize) };
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_min_int<T: Ord + Bounded + Copy>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::max_value();
    for i in start..end {
        acc = acc.min(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_max_int<T: Ord + Bounded + Copy>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::min_value();
    for i in start..end {
        acc = acc.max(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_min_float<T: Float>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::infinity();
    for i in start..end {
        acc = acc.min(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_max_float<T: Float>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::neg_infinity();
    for i in start..end {
        acc = acc.max(unsafe { *p.add(i as usize) });
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_and<T: PrimInt>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = !T::zero();
    for i in start..end {
        acc = acc & unsafe { *p.add(i as usize) };
    }
    unsafe { *(out as *mut T) = acc };
}

fn r_or<T: PrimInt>(ptr: u64, start: u32, end: u32, out: u64) {
    let p = ptr as *const T;
    let mut acc = T::zero();
    for i in start..end {
        acc = acc | unsafe { *p.add(i as usize) };
    }
    unsafe { *(out as *mut T) = acc };
}

fn unsupported(ty: VarType, op: ReduceOp) -> Error {
    Error::BackendCapability(format!(
        "reduce(): no kernel for type={}, op={}",
        ty.name(),
        op.name()
    ))
}

fn reduce_create(ty: VarType, op: ReduceOp) -> Result<Reduction> {
    macro_rules! int_case {
        ($t:ty) => {
            Ok(match op {
                ReduceOp::Add => r_sum_int::<$t>,
                ReduceOp::Mul => r_mul_int::<$t>,
                ReduceOp::Min => r_min_int::<$t>,
                ReduceOp::Max => r_max_int::<$t>,
                ReduceOp::And => r_and::<$t>,
                ReduceOp::Or => r_or::<$t>,
            })
        };
    }
    macro_rules! float_case {
        ($t:ty) => {
            match op {
                ReduceOp::Add => Ok(r_sum_float::<$t> as Reduction),
                ReduceOp::Mul => Ok(r_mul_float::<$t> as Reduction),
                ReduceOp::Min => Ok(r_min_float::<$t> as Reduction),
                ReduceOp::Max => Ok(r_max_float::<$t> as Reduction),
                _ => Err(unsupported(ty, op)),
            }
        };
    }
    match ty {
        VarType::I8 => int_case!(i8),
        VarType::U8 | VarType::Bool => int_case!(u8),
        VarType::I16 => int_case!(i16),
        VarType::U16 => int_case!(u16),
        VarType::I32 => int_case!(i32),
        VarType::U32 => int_case!(u32),
        VarType::I64 => int_case!(i64),
        VarType::U64 => int_case!(u64),
        VarType::F16 => float_case!(f16),
        VarType::F32 => float_case!(f32),
        VarType::F64 => float_case!(f64),
        _ => Err(unsupported(ty, op)),
    }
}

// ====================================================================
// Reduction
// ====================================================================

pub fn reduce(backend: Backend, ty: VarType, op: ReduceOp, input: u64, size: u32, out: u64) -> Result<()> {
    if size == 0 {
        raise!("reduce(): size cannot be zero");
    }
    state::with_ts(backend, |ts| reduce_in(ts, ty, op, input, size, out))
}

fn reduce_in(ts: &mut ThreadState, ty: VarType, op: ReduceOp, input: u64, size: u32, out: u64) -> Result<()> {
    debug!(ty = ty.name(), op = op.name(), size, "reduce");
    let tsize = ty.size();
    match ts.backend {
        Backend::Cuda => {
            if ty == VarType::F16 {
                return Err(unsupported(ty, op));
            }
            let name = format!("reduce_{}_{}", op.name(), ty.name());
            let source = cuda::reduction_source(&name, op, ty)?;
            let func = {
                let mut st = state::lock();
                cuda::builtin(&mut st, &name, move || source)?
            };
            let thread_count = 1024u32;
            let shared = thread_count * tsize as u32;
            let block_count = size.div_ceil(thread_count).min(1024).max(1);

            if size <= thread_count {
                let params = [input, size as u64, out];
                submit_gpu(ts, KernelType::Reduce, &func, 1, thread_count, shared, &params, size)?;
            } else {
                let temp = {
                    let mut st = state::lock();
                    memory::malloc(&mut st, AllocKind::Device, block_count as usize * tsize)?
                };
                let params = [input, size as u64, temp];
                submit_gpu(
                    ts,
                    KernelType::Reduce,
                    &func,
                    block_count,
                    thread_count,
                    shared,
                    &params,
                    size,
                )?;
                let params = [temp, block_count as u64, out];
                submit_gpu(ts, KernelType::Reduce, &func, 1, thread_count, shared, &params, size)?;
                let mut st = state::lock();
                memory::free(&mut st, temp);
            }
            Ok(())
        }
        Backend::Cpu => {
            let reduction = reduce_create(ty, op)?;
            let (block_size, blocks) = cpu_blocks(size);
            let target = if blocks > 1 {
                let mut st = state::lock();
                memory::malloc(&mut st, AllocKind::HostAsync, blocks as usize * tsize)?
            } else {
                out
            };
            let tsize64 = tsize as u64;
            submit_cpu(ts, KernelType::Reduce, size, blocks, move |index| {
                let start = index * block_size;
                let end = (start + block_size).min(size);
                reduction(input, start, end, target + index as u64 * tsize64);
            });
            if blocks > 1 {
                reduce_in(ts, ty, op, target, blocks, out)?;
                let mut st = state::lock();
                memory::free(&mut st, target);
            }
            Ok(())
        }
    }
}

// ====================================================================
// Boolean all/any
// ====================================================================

fn all_any(backend: Backend, values: u64, size: u32, is_all: bool) -> Result<bool> {
    if size == 0 {
        return Ok(is_all);
    }
    state::with_ts(backend, |ts| {
        let reduced_size = size.div_ceil(4);
        let trailing = reduced_size * 4 - size;
        debug!(size, all = is_all, "bool reduction");

        // Pad to a word boundary with the identity so the array can be
        // reinterpreted as u32.
        if trailing > 0 {
            memset_async(ts, values + size as u64, trailing, 1, is_all as u64)?;
        }

        let kind = match ts.backend {
            Backend::Cuda => AllocKind::HostPinned,
            Backend::Cpu => AllocKind::HostAsync,
        };
        let out = {
            let mut st = state::lock();
            memory::malloc(&mut st, kind, 4)?
        };
        let op = if is_all { ReduceOp::And } else { ReduceOp::Or };
        reduce_in(ts, VarType::U32, op, values, reduced_size, out)?;
        backend::sync_thread(ts)?;
        let word = unsafe { *(out as *const [u8; 4]) };
        {
            let mut st = state::lock();
            memory::free(&mut st, out);
        }
        Ok(if is_all {
            word.iter().all(|&b| b != 0)
        } else {
            word.iter().any(|&b| b != 0)
        })
    })
}

/// True when every byte of the mask is non-zero. May write up to three
/// padding bytes past the end, which allocations from this runtime allow.
pub fn all(backend: Backend, values: u64, size: u32) -> Result<bool> {
    all_any(backend, values, size, true)
}

/// True when any byte of the mask is non-zero.
pub fn any(backend: Backend, values: u64, size: u32) -> Result<bool> {
    all_any(backend, values, size, false)
}

// ====================================================================
// Prefix sum
// ====================================================================

type ScanP1 = fn(u64, u32, u32, u32, u64);
type ScanP2 = fn(u64, u64, u32, u32, u32, u64, bool);

fn scan_p1_int<T: WrappingAdd + Zero + Copy>(input: u64, start: u32, end: u32, index: u32, scratch: u64) {
    let p = input as *const T;
    let mut acc = T::zero();
    for i in start..end {
        acc = acc.wrapping_add(unsafe { &*p.add(i as usize) });
    }
    unsafe { *(scratch as *mut T).add(index as usize) = acc };
}

fn scan_p1_float<T: Float>(input: u64, start: u32, end: u32, index: u32, scratch: u64) {
    let p = input as *const T;
    let mut acc = T::zero();
    for i in start..end {
        acc = acc + unsafe { *p.add(i as usize) };
    }
    unsafe { *(scratch as *mut T).add(index as usize) = acc };
}

fn scan_p2_int<T: WrappingAdd + Zero + Copy>(
    input: u64,
    output: u64,
    start: u32,
    end: u32,
    index: u32,
    scratch: u64,
    exclusive: bool,
) {
    let p = input as *const T;
    let o = output as *mut T;
    let mut acc = if scratch != 0 {
        unsafe { *(scratch as *const T).add(index as usize) }
    } else {
        T::zero()
    };
    if exclusive {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            unsafe { *o.add(i as usize) = acc };
            acc = acc.wrapping_add(&value);
        }
    } else {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            acc = acc.wrapping_add(&value);
            unsafe { *o.add(i as usize) = acc };
        }
    }
}

fn scan_p2_float<T: Float>(
    input: u64,
    output: u64,
    start: u32,
    end: u32,
    index: u32,
    scratch: u64,
    exclusive: bool,
) {
    let p = input as *const T;
    let o = output as *mut T;
    let mut acc = if scratch != 0 {
        unsafe { *(scratch as *const T).add(index as usize) }
    } else {
        T::zero()
    };
    if exclusive {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            unsafe { *o.add(i as usize) = acc };
            acc = acc + value;
        }
    } else {
        for i in start..end {
            let value = unsafe { *p.add(i as usize) };
            acc = acc + value;
            unsafe { *o.add(i as usize) = acc };
        }
    }
}

fn scan_type(ty: VarType) -> Result<VarType> {
    let ty = match ty {
        VarType::I32 => VarType::U32,
        VarType::I64 => VarType::U64,
        other => other,
    };
    if !matches!(ty, VarType::U32 | VarType::U64 | VarType::F32 | VarType::F64) {
        raise!("prefix_sum(): type {} is not supported", ty.name());
    }
    Ok(ty)
}

fn scan_create(ty: VarType) -> (ScanP1, ScanP2) {
    match ty {
        VarType::U32 => (scan_p1_int::<u32>, scan_p2_int::<u32>),
        VarType::U64 => (scan_p1_int::<u64>, scan_p2_int::<u64>),
        VarType::F32 => (scan_p1_float::<f32>, scan_p2_float::<f32>),
        _ => (scan_p1_float::<f64>, scan_p2_float::<f64>),
    }
}

/// Inclusive or exclusive prefix sum; `output` may alias `input`.
pub fn prefix_sum(
    backend: Backend,
    ty: VarType,
    exclusive: bool,
    input: u64,
    size: u32,
    output: u64,
) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let ty = scan_type(ty)?;
    state::with_ts(backend, |ts| prefix_sum_in(ts, ty, exclusive, input, size, output))
}

fn prefix_sum_in(
    ts: &mut ThreadState,
    ty: VarType,
    exclusive: bool,
    input: u64,
    size: u32,
    output: u64,
) -> Result<()> {
    let isize = ty.size();
    match ts.backend {
        Backend::Cuda => {
            debug!(ty = ty.name(), exclusive, size, "prefix_sum (device)");
            if size == 1 {
                if exclusive {
                    memset_async(ts, output, 1, isize as u32, 0)?;
                } else if input != output {
                    backend::memcpy_async(ts, output, input, isize)?;
                }
            } else if (isize == 4 && size <= 4096) || (isize == 8 && size < 2048) {
                let items_per_thread = if isize == 8 { 2 } else { 4 };
                let thread_count = cuda::round_pow2(size.div_ceil(items_per_thread));
                let shared = thread_count * 2 * isize as u32;
                let kind = if exclusive { "exc" } else { "inc" };
                let name = format!("scan_{kind}_small_{}", ty.name());
                let source = cuda::scan_small_source(&name, ty, exclusive, items_per_thread);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                let params = [input, output, size as u64];
                submit_gpu(ts, KernelType::Other, &func, 1, thread_count, shared, &params, size)?;
            } else if isize == 4 {
                // Decoupled look-back over a scratch buffer of per-block
                // partials with a 32-entry padding preface.
                let thread_count = 128u32;
                let items_per_block = thread_count * 16;
                let block_count = size.div_ceil(items_per_block);
                let scratch_items = block_count + 32;
                let shared = thread_count * 2 * isize as u32;
                let scratch = {
                    let mut st = state::lock();
                    memory::malloc(&mut st, AllocKind::Device, scratch_items as usize * 8)?
                };

                let init = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, "scan_large_init", || {
                        cuda::SCAN_LARGE_INIT.to_string()
                    })?
                };
                let (blocks_init, threads_init) = cuda::launch_config(scratch_items, 1024);
                let params = [scratch, scratch_items as u64];
                submit_gpu(
                    ts,
                    KernelType::Other,
                    &init,
                    blocks_init,
                    threads_init,
                    0,
                    &params,
                    scratch_items,
                )?;

                let kind = if exclusive { "exc" } else { "inc" };
                let name = format!("scan_{kind}_large_{}", ty.name());
                let source = cuda::scan_large_source(&name, ty, exclusive);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                let params = [input, output, size as u64, scratch];
                submit_gpu(
                    ts,
                    KernelType::Other,
                    &func,
                    block_count,
                    thread_count,
                    shared,
                    &params,
                    size,
                )?;
                let mut st = state::lock();
                memory::free(&mut st, scratch);
            } else {
                // 64-bit elements: per-block totals, recursive scan of the
                // partials, then a seeded second pass.
                let thread_count = 128u32;
                let items_per_block = thread_count * 8;
                let block_count = size.div_ceil(items_per_block);
                let shared = thread_count * 2 * isize as u32;
                let partials = {
                    let mut st = state::lock();
                    memory::malloc(&mut st, AllocKind::Device, block_count as usize * isize)?
                };

                let name = format!("scan_block_sums_{}", ty.name());
                let source = cuda::scan_block_sums_source(&name, ty);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                let params = [input, partials, size as u64];
                submit_gpu(
                    ts,
                    KernelType::Other,
                    &func,
                    block_count,
                    thread_count,
                    shared,
                    &params,
                    size,
                )?;

                prefix_sum_in(ts, ty, true, partials, block_count, partials)?;

                let kind = if exclusive { "exc" } else { "inc" };
                let name = format!("scan_apply_{kind}_{}", ty.name());
                let source = cuda::scan_apply_source(&name, ty, exclusive);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                let params = [input, output, size as u64, partials];
                submit_gpu(
                    ts,
                    KernelType::Other,
                    &func,
                    block_count,
                    thread_count,
                    shared,
                    &params,
                    size,
                )?;
                let mut st = state::lock();
                memory::free(&mut st, partials);
            }
            Ok(())
        }
        Backend::Cpu => {
            let (block_size, blocks) = cpu_blocks(size);
            debug!(ty = ty.name(), exclusive, size, block_size, blocks, "prefix_sum");
            let (p1, p2) = scan_create(ty);

            let mut scratch = 0u64;
            if blocks > 1 {
                scratch = {
                    let mut st = state::lock();
                    memory::malloc(&mut st, AllocKind::HostAsync, blocks as usize * isize)?
                };
                let scratch_ptr = scratch;
                submit_cpu(ts, KernelType::Other, size, blocks, move |index| {
                    let start = index * block_size;
                    let end = (start + block_size).min(size);
                    p1(input, start, end, index, scratch_ptr);
                });
                prefix_sum_in(ts, ty, true, scratch, blocks, scratch)?;
            }

            let scratch_ptr = scratch;
            submit_cpu(ts, KernelType::Other, size, blocks, move |index| {
                let start = index * block_size;
                let end = (start + block_size).min(size);
                p2(input, output, start, end, index, scratch_ptr, exclusive);
            });

            if scratch != 0 {
                let mut st = state::lock();
                memory::free(&mut st, scratch);
            }
            Ok(())
        }
    }
}

// ====================================================================
// Stream compaction
// ====================================================================

/// Write the indices of non-zero mask bytes to `output`; returns the count.
pub fn compress(backend: Backend, input: u64, size: u32, output: u64) -> Result<u32> {
    if size == 0 {
        return Ok(0);
    }
    state::with_ts(backend, |ts| match ts.backend {
        Backend::Cuda => compress_cuda(ts, input, size, output),
        Backend::Cpu => compress_cpu(ts, input, size, output),
    })
}

fn compress_cuda(ts: &mut ThreadState, input: u64, size: u32, output: u64) -> Result<u32> {
    let count_out = {
        let mut st = state::lock();
        memory::malloc(&mut st, AllocKind::HostPinned, 4)?
    };
    if size <= 4096 {
        let items_per_thread = 4u32;
        let thread_count = cuda::round_pow2(size.div_ceil(items_per_thread));
        let shared = thread_count * 2 * 4;
        let trailer = thread_count * items_per_thread - size;
        debug!(size, thread_count, "compress (small)");
        if trailer > 0 {
            memset_async(ts, input + size as u64, trailer, 1, 0)?;
        }
        let func = {
            let mut st = state::lock();
            cuda::builtin(&mut st, "compress_small", || cuda::COMPRESS_SMALL.to_string())?
        };
        let params = [input, output, size as u64, count_out];
        submit_gpu(ts, KernelType::Other, &func, 1, thread_count, shared, &params, size)?;
    } else {
        let thread_count = 128u32;
        let items_per_block = thread_count * 16;
        let block_count = size.div_ceil(items_per_block);
        let scratch_items = block_count + 32;
        let shared = thread_count * 2 * 4;
        let trailer = items_per_block * block_count - size;
        debug!(size, block_count, "compress (large)");
        let scratch = {
            let mut st = state::lock();
            memory::malloc(&mut st, AllocKind::Device, scratch_items as usize * 8)?
        };
        let init = {
            let mut st = state::lock();
            cuda::builtin(&mut st, "scan_large_init", || cuda::SCAN_LARGE_INIT.to_string())?
        };
        let (blocks_init, threads_init) = cuda::launch_config(scratch_items, 1024);
        let params = [scratch, scratch_items as u64];
        submit_gpu(
            ts,
            KernelType::Other,
            &init,
            blocks_init,
            threads_init,
            0,
            &params,
            scratch_items,
        )?;
        if trailer > 0 {
            memset_async(ts, input + size as u64, trailer, 1, 0)?;
        }
        let func = {
            let mut st = state::lock();
            cuda::builtin(&mut st, "compress_large", || cuda::COMPRESS_LARGE.to_string())?
        };
        let params = [input, output, size as u64, scratch, count_out];
        submit_gpu(
            ts,
            KernelType::Other,
            &func,
            block_count,
            thread_count,
            shared,
            &params,
            size,
        )?;
        let mut st = state::lock();
        memory::free(&mut st, scratch);
    }
    backend::sync_thread(ts)?;
    let count = unsafe { *(count_out as *const u32) };
    let mut st = state::lock();
    memory::free(&mut st, count_out);
    Ok(count)
}

fn compress_cpu(ts: &mut ThreadState, input: u64, size: u32, output: u64) -> Result<u32> {
    let (block_size, blocks) = cpu_blocks(size);
    debug!(size, block_size, blocks, "compress");
    let count_out = Arc::new(AtomicU32::new(0));

    let mut scratch = 0u64;
    if blocks > 1 {
        scratch = {
            let mut st = state::lock();
            memory::malloc(&mut st, AllocKind::HostAsync, blocks as usize * 4)?
        };
        let scratch_ptr = scratch;
        submit_cpu(ts, KernelType::Other, size, blocks, move |index| {
            let start = index * block_size;
            let end = (start + block_size).min(size);
            let mut accum = 0u32;
            for i in start..end {
                accum += unsafe { *(input as *const u8).add(i as usize) } as u32;
            }
            unsafe { *(scratch_ptr as *mut u32).add(index as usize) = accum };
        });
        prefix_sum_in(ts, VarType::U32, true, scratch, blocks, scratch)?;
    }

    let scratch_ptr = scratch;
    let count = count_out.clone();
    submit_cpu(ts, KernelType::Other, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let mut accum = if scratch_ptr != 0 {
            unsafe { *(scratch_ptr as *const u32).add(index as usize) }
        } else {
            0
        };
        for i in start..end {
            let value = unsafe { *(input as *const u8).add(i as usize) } as u32;
            if value != 0 {
                unsafe { *(output as *mut u32).add(accum as usize) = i };
            }
            accum += value;
        }
        if end == size {
            count.store(accum, Ordering::Release);
        }
    });

    if scratch != 0 {
        let mut st = state::lock();
        memory::free(&mut st, scratch);
    }
    backend::sync_thread(ts)?;
    Ok(count_out.load(Ordering::Acquire))
}

// ====================================================================
// Bucketed permutation
// ====================================================================

/// Reorder `input` (bucket ids below `bucket_count`) into a stably grouped
/// permutation. When `offsets` is given it receives `(bucket, start, size,
/// 0)` rows for every non-empty bucket plus a final row whose first slot is
/// the number of distinct buckets; the buffer must be host-visible and hold
/// `bucket_count + 1` rows. Returns the distinct-bucket count (zero when no
/// offsets table was requested).
pub fn mkperm(
    backend: Backend,
    input: u64,
    size: u32,
    bucket_count: u32,
    perm: u64,
    offsets: Option<u64>,
) -> Result<u32> {
    if size == 0 {
        return Ok(0);
    }
    if bucket_count == 0 {
        raise!("mkperm(): bucket_count cannot be zero");
    }
    state::with_ts(backend, |ts| match ts.backend {
        Backend::Cuda => mkperm_cuda(ts, input, size, bucket_count, perm, offsets),
        Backend::Cpu => mkperm_cpu(ts, input, size, bucket_count, perm, offsets),
    })
}

fn mkperm_cuda(
    ts: &mut ThreadState,
    input: u64,
    size: u32,
    bucket_count: u32,
    perm: u64,
    offsets: Option<u64>,
) -> Result<u32> {
    const WARP_SIZE: u32 = 32;
    let (sm_count, shared_memory_bytes) = {
        let st = state::lock();
        let cuda = st.cuda.as_ref().expect("cuda globals");
        (cuda.sm_count, cuda.shared_memory_bytes)
    };

    // One block per SM at most; full warps only.
    let thread_count = 1024u32;
    let block_count = size.div_ceil(thread_count).min(sm_count.max(1)).max(1);
    let warp_count = thread_count / WARP_SIZE;

    let bucket_size_1 = bucket_count as usize * 4;
    let mut bucket_size_all = bucket_size_1 * block_count as usize;

    // Pick the histogram variant by shared-memory footprint.
    let (mode, shared_size, variant) = if bucket_size_1 * warp_count as usize
        <= shared_memory_bytes as usize
    {
        bucket_size_all *= warp_count as usize;
        (0u32, (bucket_size_1 * warp_count as usize) as u32, "tiny")
    } else if bucket_size_1 <= shared_memory_bytes as usize {
        (1u32, bucket_size_1 as u32, "small")
    } else {
        (2u32, 0u32, "large")
    };
    let needs_transpose = bucket_size_1 != bucket_size_all;
    let rows = (bucket_size_all / bucket_size_1) as u32;

    let (buckets_1, buckets_2, counter) = {
        let mut st = state::lock();
        let b1 = memory::malloc(&mut st, AllocKind::Device, bucket_size_all)?;
        let b2 = if needs_transpose {
            memory::malloc(&mut st, AllocKind::Device, bucket_size_all)?
        } else {
            b1
        };
        let counter = if offsets.is_some() {
            memory::malloc(&mut st, AllocKind::Device, 4)?
        } else {
            0
        };
        (b1, b2, counter)
    };
    if counter != 0 {
        memset_async(ts, counter, 1, 4, 0)?;
    }
    if mode == 2 {
        memset_async(ts, buckets_1, bucket_size_all as u32, 1, 0)?;
    }

    let size_per_block = size.div_ceil(block_count).div_ceil(WARP_SIZE) * WARP_SIZE;
    debug!(
        size,
        bucket_count, block_count, thread_count, size_per_block, variant, shared_size, "mkperm"
    );

    // Phase 1: per-block (or per-warp) occurrence counts.
    let p1_name = format!("mkperm_phase1_{variant}");
    let p1_src = cuda::mkperm_phase1_source(&p1_name, mode);
    let phase_1 = {
        let mut st = state::lock();
        cuda::builtin(&mut st, &p1_name, move || p1_src)?
    };
    let params = [input, buckets_1, size as u64, size_per_block as u64, bucket_count as u64];
    submit_gpu(
        ts,
        KernelType::CallReduce,
        &phase_1,
        block_count,
        thread_count,
        shared_size,
        &params,
        size,
    )?;

    // Phase 2: exclusive scan in bucket-major order.
    if needs_transpose {
        transpose_u32(ts, buckets_1, buckets_2, rows, bucket_count)?;
    }
    prefix_sum_in(
        ts,
        VarType::U32,
        true,
        buckets_2,
        (bucket_size_all / 4) as u32,
        buckets_2,
    )?;
    if needs_transpose {
        transpose_u32(ts, buckets_2, buckets_1, bucket_count, rows)?;
    }

    // Phase 3: collect the non-empty buckets.
    if let Some(offsets) = offsets {
        let (blocks_3, threads_3) = cuda::launch_config(bucket_count, 1024);
        let rounded = bucket_count.div_ceil(threads_3) * threads_3;
        let phase_3 = {
            let mut st = state::lock();
            cuda::builtin(&mut st, "mkperm_phase3", || cuda::MKPERM_PHASE3.to_string())?
        };
        let params = [
            buckets_1,
            bucket_count as u64,
            rounded as u64,
            size as u64,
            counter,
            offsets,
        ];
        submit_gpu(
            ts,
            KernelType::CallReduce,
            &phase_3,
            blocks_3,
            threads_3,
            threads_3 * 4,
            &params,
            size,
        )?;
        backend::memcpy_async(ts, offsets + 16 * bucket_count as u64, counter, 4)?;
        ts.cuda.as_ref().expect("cuda thread state").record_event()?;
    }

    // Phase 4: claim destinations and write the permutation.
    let p4_name = format!("mkperm_phase4_{variant}");
    let p4_src = cuda::mkperm_phase4_source(&p4_name, mode);
    let phase_4 = {
        let mut st = state::lock();
        cuda::builtin(&mut st, &p4_name, move || p4_src)?
    };
    let params = [input, buckets_1, perm, size as u64, size_per_block as u64, bucket_count as u64];
    submit_gpu(
        ts,
        KernelType::CallReduce,
        &phase_4,
        block_count,
        thread_count,
        shared_size,
        &params,
        size,
    )?;

    let unique_count = if let Some(offsets) = offsets {
        ts.cuda.as_ref().expect("cuda thread state").sync_event()?;
        unsafe { *((offsets + 16 * bucket_count as u64) as *const u32) }
    } else {
        0
    };

    let mut st = state::lock();
    memory::free(&mut st, buckets_1);
    if needs_transpose {
        memory::free(&mut st, buckets_2);
    }
    if counter != 0 {
        memory::free(&mut st, counter);
    }
    Ok(unique_count)
}

fn transpose_u32(ts: &mut ThreadState, input: u64, output: u64, rows: u32, cols: u32) -> Result<()> {
    let func = {
        let mut st = state::lock();
        cuda::builtin(&mut st, "transpose_u32", || cuda::TRANSPOSE_U32.to_string())?
    };
    let blocks = (cols.div_ceil(16), rows.div_ceil(16));
    debug!(rows, cols, "transpose");
    let params = [input, output, rows as u64, cols as u64];
    let thread = ts.cuda.as_ref().expect("cuda thread state");
    cuda::launch_dims(&thread.stream, &func, blocks, (16, 16), 16 * 17 * 4, &params)
}

fn mkperm_cpu(
    ts: &mut ThreadState,
    input: u64,
    size: u32,
    bucket_count: u32,
    perm: u64,
    offsets: Option<u64>,
) -> Result<u32> {
    let pool = cpu::pool_size();
    let (block_size, blocks) = if pool > 1 {
        // Spread across cores, but keep blocks reasonably large.
        let blocks = pool * 4;
        let block_size = size.div_ceil(blocks).max(crate::backend::POOL_BLOCK_SIZE);
        (block_size, size.div_ceil(block_size))
    } else {
        (size, 1)
    };
    debug!(size, bucket_count, block_size, blocks, "mkperm");

    let buckets = {
        let mut st = state::lock();
        memory::malloc(
            &mut st,
            AllocKind::HostAsync,
            blocks as usize * bucket_count as usize * 4,
        )?
    };
    let unique_count = Arc::new(AtomicU32::new(0));

    // Phase 1: per-block histograms.
    submit_cpu(ts, KernelType::CallReduce, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let local = unsafe {
            std::slice::from_raw_parts_mut(
                (buckets as *mut u32).add((index * bucket_count) as usize),
                bucket_count as usize,
            )
        };
        local.fill(0);
        for i in start..end {
            let b = unsafe { *(input as *const u32).add(i as usize) };
            local[b as usize] += 1;
        }
    });

    // Serial accumulation in bucket-major order, collecting offsets.
    let unique = unique_count.clone();
    let offsets_ptr = offsets.unwrap_or(0);
    submit_cpu(ts, KernelType::CallReduce, size, 1, move |_| {
        let mut sum = 0u32;
        let mut unique_local = 0u32;
        for b in 0..bucket_count {
            let mut sum_local = 0u32;
            for j in 0..blocks {
                let slot = unsafe { (buckets as *mut u32).add((j * bucket_count + b) as usize) };
                let value = unsafe { *slot };
                unsafe { *slot = sum + sum_local };
                sum_local += value;
            }
            if sum_local > 0 {
                if offsets_ptr != 0 {
                    let row = unsafe { (offsets_ptr as *mut u32).add(unique_local as usize * 4) };
                    unsafe {
                        *row = b;
                        *row.add(1) = sum;
                        *row.add(2) = sum_local;
                        *row.add(3) = 0;
                    }
                }
                unique_local += 1;
                sum += sum_local;
            }
        }
        if offsets_ptr != 0 {
            unsafe { *(offsets_ptr as *mut u32).add(bucket_count as usize * 4) = unique_local };
        }
        unique.store(unique_local, Ordering::Release);
    });

    let local_task = ts.task.clone();

    // Phase 2: write permutation entries.
    submit_cpu(ts, KernelType::CallReduce, size, blocks, move |index| {
        let start = index * block_size;
        let end = (start + block_size).min(size);
        let local = unsafe { (buckets as *mut u32).add((index * bucket_count) as usize) };
        for i in start..end {
            let b = unsafe { *(input as *const u32).add(i as usize) };
            let slot = unsafe { local.add(b as usize) };
            let dst = unsafe { *slot };
            unsafe {
                *slot = dst + 1;
                *(perm as *mut u32).add(dst as usize) = i;
            }
        }
    });

    {
        let mut st = state::lock();
        memory::free(&mut st, buckets);
    }

    if let Some(task) = local_task {
        task.wait();
    }
    Ok(unique_count.load(Ordering::Acquire))
}

// ====================================================================
// Block copy / block sum
// ====================================================================

type BlockOp = fn(u64, u64, u32, u32, u32);

fn block_copy_op<T: Copy>(input: u64, output: u64, start: u32, end: u32, block: u32) {
    let p = input as *const T;
    let o = output as *mut T;
    for i in start..end {
        let value = unsafe { *p.add(i as usize) };
        for j in 0..block {
            unsafe { *o.add((i * block + j) as usize) = value };
        }
    }
}

fn block_sum_int<T: WrappingAdd + Zero + Copy>(input: u64, output: u64, start: u32, end: u32, block: u32) {
    let p = input as *const T;
    let o = output as *mut T;
    for i in start..end {
        let mut sum = T::zero();
        for j in 0..block {
            sum = sum.wrapping_add(unsafe { &*p.add((i * block + j) as usize) });
        }
        unsafe { *o.add(i as usize) = sum };
    }
}

fn block_sum_float<T: Float>(input: u64, output: u64, start: u32, end: u32, block: u32) {
    let p = input as *const T;
    let o = output as *mut T;
    for i in start..end {
        let mut sum = T::zero();
        for j in 0..block {
            sum = sum + unsafe { *p.add((i * block + j) as usize) };
        }
        unsafe { *o.add(i as usize) = sum };
    }
}

fn block_op_create(ty: VarType, is_sum: bool) -> Result<BlockOp> {
    Ok(match (ty.make_unsigned(), is_sum) {
        (VarType::U8, false) => block_copy_op::<u8>,
        (VarType::U16, false) => block_copy_op::<u16>,
        (VarType::U32, false) => block_copy_op::<u32>,
        (VarType::U64, false) => block_copy_op::<u64>,
        (VarType::F32, false) => block_copy_op::<f32>,
        (VarType::F64, false) => block_copy_op::<f64>,
        (VarType::U8, true) => block_sum_int::<u8>,
        (VarType::U16, true) => block_sum_int::<u16>,
        (VarType::U32, true) => block_sum_int::<u32>,
        (VarType::U64, true) => block_sum_int::<u64>,
        (VarType::F32, true) => block_sum_float::<f32>,
        (VarType::F64, true) => block_sum_float::<f64>,
        _ => raise!("block op: unsupported type {}", ty.name()),
    })
}

/// Replicate each of `size` input elements into `block_size` consecutive
/// output slots.
pub fn block_copy(
    backend: Backend,
    ty: VarType,
    input: u64,
    output: u64,
    size: u32,
    block_size: u32,
) -> Result<()> {
    if block_size == 0 {
        raise!("block_copy(): block_size cannot be zero");
    }
    debug!(ty = ty.name(), size, block_size, "block_copy");
    state::with_ts(backend, |ts| {
        if block_size == 1 {
            return backend::memcpy_async(ts, output, input, size as usize * ty.size());
        }
        match ts.backend {
            Backend::Cuda => {
                let total = size * block_size;
                let ty = ty.make_unsigned();
                let name = format!("block_copy_{}", ty.name());
                let source = cuda::block_copy_source(&name, ty);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                let (blocks, threads) = cuda::launch_config(total, 1024);
                let params = [input, output, total as u64, block_size as u64];
                submit_gpu(ts, KernelType::Other, &func, blocks, threads, 0, &params, total)
            }
            Backend::Cpu => {
                let op = block_op_create(ty, false)?;
                let (unit, units) = cpu_blocks(size);
                submit_cpu(ts, KernelType::Other, size, units, move |index| {
                    let start = index * unit;
                    let end = (start + unit).min(size);
                    op(input, output, start, end, block_size);
                });
                Ok(())
            }
        }
    })
}

/// Sum each `block_size`-sized input run into one output slot.
pub fn block_sum(
    backend: Backend,
    ty: VarType,
    input: u64,
    output: u64,
    size: u32,
    block_size: u32,
) -> Result<()> {
    if block_size == 0 {
        raise!("block_sum(): block_size cannot be zero");
    }
    debug!(ty = ty.name(), size, block_size, "block_sum");
    state::with_ts(backend, |ts| {
        if block_size == 1 {
            return backend::memcpy_async(ts, output, input, size as usize * ty.size());
        }
        match ts.backend {
            Backend::Cuda => {
                let ty = ty.make_unsigned();
                if !matches!(ty.size(), 4 | 8) {
                    return Err(Error::BackendCapability(format!(
                        "block_sum(): no kernel for type={}",
                        ty.name()
                    )));
                }
                let total = size * block_size;
                let name = format!("block_sum_{}", ty.name());
                let source = cuda::block_sum_source(&name, ty);
                let func = {
                    let mut st = state::lock();
                    cuda::builtin(&mut st, &name, move || source)?
                };
                memset_async(ts, output, size * ty.size() as u32, 1, 0)?;
                let (blocks, threads) = cuda::launch_config(total, 1024);
                let params = [input, output, total as u64, block_size as u64];
                submit_gpu(ts, KernelType::Other, &func, blocks, threads, 0, &params, total)
            }
            Backend::Cpu => {
                let op = block_op_create(ty, true)?;
                let (unit, units) = cpu_blocks(size);
                submit_cpu(ts, KernelType::Other, size, units, move |index| {
                    let start = index * unit;
                    let end = (start + unit).min(size);
                    op(input, output, start, end, block_size);
                });
                Ok(())
            }
        }
    })
}

// ====================================================================
// Expanded reduction
// ====================================================================

type ReduceExpanded = fn(u64, u32, u32, u32, u32);

macro_rules! reduce_expanded_impl {
    ($name:ident, $t:ty, $fold:expr) => {
        fn $name(ptr: u64, start: u32, end: u32, exp: u32, size: u32) {
            let p = ptr as *mut $t;
            let fold = $fold;
            // 128-element inner blocks help the compiler vectorize.
            const BLOCK: u32 = 128;
            let mut i = start;
            while i + BLOCK <= end {
                for j in 1..exp {
                    for k in 0..BLOCK {
                        unsafe {
                            let at = (i + k) as usize;
                            let other = *p.add(at + (j * size) as usize);
                            *p.add(at) = fold(*p.add(at), other);
                        }
                    }
                }
                i += BLOCK;
            }
            while i < end {
                for j in 1..exp {
                    unsafe {
                        let other = *p.add(i as usize + (j * size) as usize);
                        *p.add(i as usize) = fold(*p.add(i as usize), other);
                    }
                }
                i += 1;
            }
        }
    };
}

reduce_expanded_impl!(re_sum_u32, u32, |a: u32, b: u32| a.wrapping_add(b));
reduce_expanded_impl!(re_sum_u64, u64, |a: u64, b: u64| a.wrapping_add(b));
reduce_expanded_impl!(re_sum_f32, f32, |a: f32, b: f32| a + b);
reduce_expanded_impl!(re_sum_f64, f64, |a: f64, b: f64| a + b);
reduce_expanded_impl!(re_mul_u32, u32, |a: u32, b: u32| a.wrapping_mul(b));
reduce_expanded_impl!(re_mul_u64, u64, |a: u64, b: u64| a.wrapping_mul(b));
reduce_expanded_impl!(re_mul_f32, f32, |a: f32, b: f32| a * b);
reduce_expanded_impl!(re_mul_f64, f64, |a: f64, b: f64| a * b);
reduce_expanded_impl!(re_min_u32, u32, |a: u32, b: u32| a.min(b));
reduce_expanded_impl!(re_min_u64, u64, |a: u64, b: u64| a.min(b));
reduce_expanded_impl!(re_min_f32, f32, |a: f32, b: f32| a.min(b));
reduce_expanded_impl!(re_min_f64, f64, |a: f64, b: f64| a.min(b));
reduce_expanded_impl!(re_max_u32, u32, |a: u32, b: u32| a.max(b));
reduce_expanded_impl!(re_max_u64, u64, |a: u64, b: u64| a.max(b));
reduce_expanded_impl!(re_max_f32, f32, |a: f32, b: f32| a.max(b));
reduce_expanded_impl!(re_max_f64, f64, |a: f64, b: f64| a.max(b));
reduce_expanded_impl!(re_and_u32, u32, |a: u32, b: u32| a & b);
reduce_expanded_impl!(re_and_u64, u64, |a: u64, b: u64| a & b);
reduce_expanded_impl!(re_or_u32, u32, |a: u32, b: u32| a | b);
reduce_expanded_impl!(re_or_u64, u64, |a: u64, b: u64| a | b);

fn reduce_expanded_create(ty: VarType, op: ReduceOp) -> Result<ReduceExpanded> {
    use ReduceOp::*;
    Ok(match (ty.make_unsigned(), op) {
        (VarType::U32, Add) => re_sum_u32,
        (VarType::U64, Add) => re_sum_u64,
        (VarType::F32, Add) => re_sum_f32,
        (VarType::F64, Add) => re_sum_f64,
        (VarType::U32, Mul) => re_mul_u32,
        (VarType::U64, Mul) => re_mul_u64,
        (VarType::F32, Mul) => re_mul_f32,
        (VarType::F64, Mul) => re_mul_f64,
        (VarType::U32, Min) => re_min_u32,
        (VarType::U64, Min) => re_min_u64,
        (VarType::F32, Min) => re_min_f32,
        (VarType::F64, Min) => re_min_f64,
        (VarType::U32, Max) => re_max_u32,
        (VarType::U64, Max) => re_max_u64,
        (VarType::F32, Max) => re_max_f32,
        (VarType::F64, Max) => re_max_f64,
        (VarType::U32, And) => re_and_u32,
        (VarType::U64, And) => re_and_u64,
        (VarType::U32, Or) => re_or_u32,
        (VarType::U64, Or) => re_or_u64,
        _ => return Err(unsupported(ty, op)),
    })
}

/// Fold `exp` contiguous stripes of a length-`size` array into the first
/// stripe, in place. Host-side helper for expanded scatter targets.
pub fn reduce_expanded(ty: VarType, op: ReduceOp, ptr: u64, exp: u32, size: u32) -> Result<()> {
    if size == 0 {
        raise!("reduce_expanded(): size cannot be zero");
    }
    debug!(ty = ty.name(), op = op.name(), exp, size, "reduce_expanded");
    let kernel = reduce_expanded_create(ty, op)?;
    state::with_ts(Backend::Cpu, |ts| {
        let (block_size, blocks) = cpu_blocks(size);
        submit_cpu(ts, KernelType::Reduce, size, blocks, move |index| {
            let start = index * block_size;
            let end = (start + block_size).min(size);
            kernel(ptr, start, end, exp, size);
        });
        Ok(())
    })
}

// ====================================================================
// Poke, aggregate, host functions
// ====================================================================

/// Asynchronously overwrite a single element of 1, 2, 4, or 8 bytes.
pub fn poke(backend: Backend, dst: u64, size: u32, value: u64) -> Result<()> {
    if !matches!(size, 1 | 2 | 4 | 8) {
        raise!("poke(): only size=1, 2, 4 or 8 is supported");
    }
    debug!(dst, size, "poke");
    state::with_ts(backend, |ts| match ts.backend {
        Backend::Cuda => {
            let name = format!("poke_{size}");
            let source = cuda::poke_source(&name, size);
            let func = {
                let mut st = state::lock();
                cuda::builtin(&mut st, &name, move || source)?
            };
            let params = [dst, value];
            submit_gpu(ts, KernelType::Other, &func, 1, 1, 0, &params, 1)
        }
        Backend::Cpu => {
            submit_cpu(ts, KernelType::Other, size, 1, move |_| unsafe {
                match size {
                    1 => *(dst as *mut u8) = value as u8,
                    2 => *(dst as *mut u16) = value as u16,
                    4 => *(dst as *mut u32) = value as u32,
                    _ => *(dst as *mut u64) = value,
                }
            });
            Ok(())
        }
    })
}

/// Write a batch of heterogeneous small values to offsets inside `dst`.
/// The batch is released once the writes have been issued.
pub fn aggregate(backend: Backend, dst: u64, entries: Vec<AggregationEntry>) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let size = entries.len() as u32;
    state::with_ts(backend, |ts| match ts.backend {
        Backend::Cuda => {
            let bytes = entries.len() * std::mem::size_of::<AggregationEntry>();
            let device = {
                let mut st = state::lock();
                memory::malloc(&mut st, AllocKind::Device, bytes)?
            };
            backend::memcpy(ts, device, entries.as_ptr() as u64, bytes)?;
            let func = {
                let mut st = state::lock();
                cuda::builtin(&mut st, "aggregate", || cuda::AGGREGATE.to_string())?
            };
            let (blocks, threads) = cuda::launch_config(size, 1024);
            debug!(size, blocks, threads, "aggregate (device)");
            let params = [dst, device, size as u64];
            submit_gpu(ts, KernelType::Other, &func, blocks, threads, 0, &params, 1)?;
            let mut st = state::lock();
            memory::free(&mut st, device);
            Ok(())
        }
        Backend::Cpu => {
            debug!(size, "aggregate");
            submit_cpu(ts, KernelType::Other, size, 1, move |_| {
                for e in &entries {
                    let out = (dst + e.offset as u64) as *mut u8;
                    unsafe {
                        match e.size {
                            1 => *out = e.src as u8,
                            2 => *(out as *mut u16) = e.src as u16,
                            4 => *(out as *mut u32) = e.src as u32,
                            8 => *(out as *mut u64) = e.src,
                            -1 => *out = *(e.src as *const u8),
                            -2 => *(out as *mut u16) = *(e.src as *const u16),
                            -4 => *(out as *mut u32) = *(e.src as *const u32),
                            -8 => *(out as *mut u64) = *(e.src as *const u64),
                            _ => (),
                        }
                    }
                }
            });
            Ok(())
        }
    })
}

unsafe extern "C" fn host_func_trampoline(payload: *mut std::ffi::c_void) {
    let f: Box<Box<dyn FnOnce() + Send>> = unsafe { Box::from_raw(payload as *mut _) };
    f();
}

/// Run a host function after all previously enqueued work on this thread's
/// stream.
pub fn enqueue_host_func(backend: Backend, func: Box<dyn FnOnce() + Send>) -> Result<()> {
    state::with_ts(backend, |ts| match ts.backend {
        Backend::Cuda => {
            let thread = ts.cuda.as_ref().expect("cuda thread state");
            thread.ctx.bind_to_thread()?;
            let payload = Box::into_raw(Box::new(func)) as *mut std::ffi::c_void;
            let result = unsafe {
                cudarc::driver::sys::cuLaunchHostFunc(
                    thread.stream.cu_stream(),
                    Some(host_func_trampoline),
                    payload,
                )
                .result()
            };
            if let Err(err) = result {
                // Reclaim the payload if the driver never took it.
                drop(unsafe { Box::from_raw(payload as *mut Box<dyn FnOnce() + Send>) });
                return Err(err.into());
            }
            Ok(())
        }
        Backend::Cpu => {
            if ts.task.is_none() {
                func();
                return Ok(());
            }
            let slot = std::sync::Mutex::new(Some(func));
            submit_cpu(ts, KernelType::Other, 1, 1, move |_| {
                if let Some(f) = slot.lock().unwrap().take() {
                    f();
                }
            });
            Ok(())
        }
    })
}
