//! Uniform operations over the two execution backends.
//!
//! Every mutating call enqueues onto the calling thread's serial stream of
//! work (a CUDA stream or the CPU task chain); synchronization is explicit.
//! None of these functions may be called while the global lock is held,
//! since several of them acquire it internally or block.

pub mod cpu;
pub mod cuda;

use cudarc::driver::sys;
use tracing::trace;

use crate::error::{raise, Result};
use crate::kernel::{HistoryTiming, KernelHistoryEntry};
use crate::state::{self, flag, JitFlag, ThreadState};
use crate::types::{Backend, KernelType};

/// Work-unit granularity of the CPU backend, in elements.
pub const POOL_BLOCK_SIZE: u32 = 16384;

/// Split `size` elements into parallel blocks for the host pool.
pub fn cpu_blocks(size: u32) -> (u32, u32) {
    if cpu::pool_size() > 1 && size > POOL_BLOCK_SIZE {
        (POOL_BLOCK_SIZE, size.div_ceil(POOL_BLOCK_SIZE))
    } else {
        (size.max(1), 1)
    }
}

/// Enqueue a parallel CPU task behind the thread's current tail.
pub fn submit_cpu(
    ts: &mut ThreadState,
    kernel_type: KernelType,
    width: u32,
    units: u32,
    f: impl Fn(u32) + Send + Sync + 'static,
) {
    let task = cpu::submit(ts.task.as_ref(), units.max(1), f);

    if flag(JitFlag::LaunchBlocking) {
        task.wait();
    }

    if flag(JitFlag::KernelHistory) {
        let mut state = state::lock();
        state.history.push(KernelHistoryEntry {
            backend: Backend::Cpu,
            kernel_type,
            hash: 0,
            size: width,
            input_count: 1,
            output_count: 1,
            timing: HistoryTiming::Task(task.clone()),
        });
    }

    ts.task = Some(task);
}

/// Launch a GPU kernel on the thread's stream, honoring the blocking-launch
/// and history flags.
pub fn submit_gpu(
    ts: &ThreadState,
    kernel_type: KernelType,
    func: &cudarc::driver::CudaFunction,
    blocks: u32,
    threads: u32,
    shared_mem: u32,
    params: &[u64],
    width: u32,
) -> Result<()> {
    let thread = ts.cuda.as_ref().expect("gpu submission on a cpu thread state");

    let events = if flag(JitFlag::KernelHistory) {
        let pair = crate::kernel::EventPair::new(thread.ctx.clone())?;
        pair.record_start(&thread.stream)?;
        Some(pair)
    } else {
        None
    };

    cuda::launch(&thread.stream, func, blocks, threads, shared_mem, params)?;

    if flag(JitFlag::LaunchBlocking) {
        thread.stream.synchronize()?;
    }

    if let Some(pair) = events {
        pair.record_end(&thread.stream)?;
        let mut state = state::lock();
        state.history.push(KernelHistoryEntry {
            backend: Backend::Cuda,
            kernel_type,
            hash: 0,
            size: width,
            input_count: 1,
            output_count: 1,
            timing: HistoryTiming::CudaEvents(pair),
        });
    }
    Ok(())
}

/// Fill `size` elements of width `isize` at `ptr` with a constant.
pub fn memset_async(ts: &mut ThreadState, ptr: u64, size: u32, isize: u32, value: u64) -> Result<()> {
    if !matches!(isize, 1 | 2 | 4 | 8) {
        raise!("memset_async(): invalid element size {isize} (must be 1, 2, 4, or 8)");
    }
    trace!(ptr, size, isize, "memset_async");
    if size == 0 {
        return Ok(());
    }

    // An all-zero pattern collapses to a byte memset.
    let (mut size, mut isize, value) = (size as usize, isize, value);
    let masked = if isize == 8 {
        value
    } else {
        value & ((1u64 << (isize * 8)) - 1)
    };
    if masked == 0 {
        size *= isize as usize;
        isize = 1;
    }

    match ts.backend {
        Backend::Cuda => {
            let thread = ts.cuda.as_ref().expect("cuda thread state");
            thread.ctx.bind_to_thread()?;
            let stream = thread.stream.cu_stream();
            unsafe {
                match isize {
                    1 => sys::cuMemsetD8Async(ptr, masked as u8, size, stream).result()?,
                    2 => sys::cuMemsetD16Async(ptr, masked as u16, size, stream).result()?,
                    4 => sys::cuMemsetD32Async(ptr, masked as u32, size, stream).result()?,
                    _ => {
                        let func = {
                            let mut state = state::lock();
                            cuda::builtin(&mut state, "fill_u64", || {
                                cuda::FILL_U64.to_string()
                            })?
                        };
                        let (blocks, threads) = cuda::launch_config(size as u32, 1024);
                        let params = [ptr, size as u64, value];
                        return submit_gpu(
                            ts,
                            KernelType::Other,
                            &func,
                            blocks,
                            threads,
                            0,
                            &params,
                            size as u32,
                        );
                    }
                }
            }
            Ok(())
        }
        Backend::Cpu => {
            let width = size as u32;
            submit_cpu(ts, KernelType::Other, width, 1, move |_| unsafe {
                match isize {
                    1 => std::slice::from_raw_parts_mut(ptr as *mut u8, size).fill(masked as u8),
                    2 => std::slice::from_raw_parts_mut(ptr as *mut u16, size).fill(masked as u16),
                    4 => std::slice::from_raw_parts_mut(ptr as *mut u32, size).fill(masked as u32),
                    _ => std::slice::from_raw_parts_mut(ptr as *mut u64, size).fill(value),
                }
            });
            Ok(())
        }
    }
}

/// Synchronous copy; waits for prior work on the thread's stream first.
pub fn memcpy(ts: &mut ThreadState, dst: u64, src: u64, size: usize) -> Result<()> {
    sync_thread(ts)?;
    match ts.backend {
        Backend::Cuda => {
            let thread = ts.cuda.as_ref().expect("cuda thread state");
            thread.ctx.bind_to_thread()?;
            unsafe { sys::cuMemcpy(dst, src, size).result()? };
        }
        Backend::Cpu => unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
        },
    }
    Ok(())
}

/// Asynchronous copy ordered on the thread's stream.
pub fn memcpy_async(ts: &mut ThreadState, dst: u64, src: u64, size: usize) -> Result<()> {
    match ts.backend {
        Backend::Cuda => {
            let thread = ts.cuda.as_ref().expect("cuda thread state");
            thread.ctx.bind_to_thread()?;
            unsafe {
                sys::cuMemcpyAsync(dst, src, size, thread.stream.cu_stream()).result()?;
            }
        }
        Backend::Cpu => {
            submit_cpu(ts, KernelType::Other, size as u32, 1, move |_| unsafe {
                std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
            });
        }
    }
    Ok(())
}

/// Wait for everything previously enqueued by this thread. The global lock
/// must not be held.
pub fn sync_thread(ts: &mut ThreadState) -> Result<()> {
    match ts.backend {
        Backend::Cuda => {
            let thread = ts.cuda.as_ref().expect("cuda thread state");
            thread.stream.synchronize()?;
        }
        Backend::Cpu => {
            if let Some(task) = &ts.task {
                task.wait();
            }
        }
    }
    Ok(())
}
