//! Pooled allocator shared by both backends.
//!
//! Allocations are handed out as raw pointer-sized integers so they can be
//! stored in variables and kernel parameter vectors uniformly. Freed blocks
//! return to a size-classed pool instead of the system; reuse is safe
//! because work on a thread's stream/task chain executes in submission
//! order. `trim` releases the pools, which the out-of-memory retry path
//! uses before giving up.

use std::alloc::Layout;

use cudarc::driver::sys;
use cudarc::driver::CudaSlice;
use cudarc::driver::DevicePtr;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{raise, Error, Result};
use crate::state::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    Host,
    HostAsync,
    HostPinned,
    Device,
    Managed,
    ManagedReadMostly,
}

impl AllocKind {
    pub fn is_host(self) -> bool {
        matches!(self, AllocKind::Host | AllocKind::HostAsync)
    }
}

enum Backing {
    Host { layout: Layout },
    Pinned,
    Device { _slice: CudaSlice<u8> },
    Managed,
}

struct Allocation {
    kind: AllocKind,
    size: usize,
    backing: Backing,
}

#[derive(Default)]
pub struct AllocState {
    entries: FxHashMap<u64, Allocation>,
    pools: FxHashMap<(AllocKind, usize), Vec<u64>>,
}

const ALLOC_ALIGN: usize = 64;

fn round_size(size: usize) -> usize {
    size.max(1).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN
}

pub fn malloc(state: &mut State, kind: AllocKind, size: usize) -> Result<u64> {
    if size == 0 {
        raise!("malloc(): zero-sized allocation requested");
    }
    let rounded = round_size(size);
    if let Some(ptr) = state
        .alloc
        .pools
        .get_mut(&(kind, rounded))
        .and_then(|p| p.pop())
    {
        trace!(kind = ?kind, size, ptr, "malloc reuse");
        return Ok(ptr);
    }

    let (ptr, backing) = match kind {
        AllocKind::Host | AllocKind::HostAsync => {
            let layout = Layout::from_size_align(rounded, ALLOC_ALIGN)
                .map_err(|e| Error::InvalidInput(format!("malloc(): bad layout: {e}")))?;
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                raise!("malloc(): host allocation of {rounded} bytes failed");
            }
            (ptr as u64, Backing::Host { layout })
        }
        AllocKind::HostPinned => {
            if state.cuda.is_none() {
                // No driver loaded; pageable memory serves the same role.
                return malloc(state, AllocKind::Host, size);
            }
            let mut ptr = std::ptr::null_mut();
            unsafe { sys::cuMemAllocHost_v2(&mut ptr, rounded) }.result()?;
            (ptr as u64, Backing::Pinned)
        }
        AllocKind::Device => {
            let cuda = state
                .cuda
                .as_ref()
                .expect("device allocation without an initialized CUDA backend");
            let slice = cuda.stream.alloc_zeros::<u8>(rounded)?;
            let ptr = slice.device_ptr(&cuda.stream).0;
            (ptr, Backing::Device { _slice: slice })
        }
        AllocKind::Managed | AllocKind::ManagedReadMostly => {
            let mut dptr = 0;
            unsafe { sys::cuMemAllocManaged(&mut dptr, rounded, 1 /* GLOBAL */) }.result()?;
            (dptr, Backing::Managed)
        }
    };

    trace!(kind = ?kind, size, ptr, "malloc");
    state.alloc.entries.insert(
        ptr,
        Allocation {
            kind,
            size: rounded,
            backing,
        },
    );
    Ok(ptr)
}

/// Return an allocation to its pool. Passing zero is a no-op.
pub fn free(state: &mut State, ptr: u64) {
    if ptr == 0 {
        return;
    }
    let Some(alloc) = state.alloc.entries.get(&ptr) else {
        panic!("free(): unknown pointer 0x{ptr:x}");
    };
    let key = (alloc.kind, alloc.size);
    state.alloc.pools.entry(key).or_default().push(ptr);
}

fn release(alloc: Allocation, ptr: u64) {
    match alloc.backing {
        Backing::Host { layout } => unsafe { std::alloc::dealloc(ptr as *mut u8, layout) },
        Backing::Pinned => unsafe {
            let _ = sys::cuMemFreeHost(ptr as *mut std::ffi::c_void);
        },
        Backing::Device { .. } => (), // freed when the slice drops
        Backing::Managed => unsafe {
            let _ = sys::cuMemFree_v2(ptr);
        },
    }
}

/// Release every pooled block back to the system.
pub fn trim(state: &mut State) {
    let pools = std::mem::take(&mut state.alloc.pools);
    let mut released = 0usize;
    for ((_, _), ptrs) in pools {
        for ptr in ptrs {
            if let Some(alloc) = state.alloc.entries.remove(&ptr) {
                released += alloc.size;
                release(alloc, ptr);
            }
        }
    }
    if released > 0 {
        trace!(released, "trim");
    }
}

/// Size in bytes of a live allocation.
pub fn alloc_size(state: &State, ptr: u64) -> Option<usize> {
    state.alloc.entries.get(&ptr).map(|a| a.size)
}
