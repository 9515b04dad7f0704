//! Process-wide runtime state and per-thread evaluation state.
//!
//! One coarse mutex (`lock()`) serializes graph mutation. Everything that
//! must block (module loads, event waits, task waits) is called with the
//! lock dropped; callers re-resolve variables afterwards since ids are the
//! only stable handle across suspension points.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::backend::cpu::Task;
use crate::backend::cuda::{CudaGlobals, CudaThread};
use crate::error::Result;
use crate::extra::Extra;
use crate::kernel::{KernelCache, KernelHistoryEntry};
use crate::memory::AllocState;
use crate::types::Backend;
use crate::var::{CseKey, Variable};

/// Runtime behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JitFlag {
    /// Capture loops symbolically instead of unrolling them wavefront-style.
    LoopRecord = 1 << 0,
    /// Permit dead-state elimination in recorded loops (currently advisory).
    LoopOptimize = 1 << 1,
    /// Synchronize with the backend after every kernel submission.
    LaunchBlocking = 1 << 2,
    /// Capture a history entry per launched kernel.
    KernelHistory = 1 << 3,
    /// Side effects are being collected for a recorded construct.
    PostponeSideEffects = 1 << 4,
    /// A symbolic recording is in progress; `eval` must not flush side effects.
    Recording = 1 << 5,
    /// Route CUDA kernels through OptiX.
    ForceOptiX = 1 << 6,
    /// Dump generated kernel text to stderr.
    PrintIR = 1 << 7,
}

static FLAGS: AtomicU32 =
    AtomicU32::new(JitFlag::LoopRecord as u32 | JitFlag::LoopOptimize as u32);

pub fn set_flag(flag: JitFlag, value: bool) {
    if value {
        FLAGS.fetch_or(flag as u32, Ordering::Relaxed);
    } else {
        FLAGS.fetch_and(!(flag as u32), Ordering::Relaxed);
    }
}

pub fn flag(flag: JitFlag) -> bool {
    FLAGS.load(Ordering::Relaxed) & flag as u32 != 0
}

pub fn flags() -> u32 {
    FLAGS.load(Ordering::Relaxed)
}

/// Everything guarded by the global mutex.
#[derive(Default)]
pub struct State {
    pub vars: FxHashMap<u32, Variable>,
    pub var_counter: u32,
    pub cse: FxHashMap<CseKey, u32>,
    pub extra: FxHashMap<u32, Extra>,
    pub alloc: AllocState,
    pub kernels: KernelCache,
    pub history: Vec<KernelHistoryEntry>,
    pub cuda: Option<CudaGlobals>,
}

static STATE: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::default()));

pub fn lock() -> MutexGuard<'static, State> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-thread evaluation state. Owned by exactly one thread; the global
/// mutex still guards any graph access performed through it.
pub struct ThreadState {
    pub backend: Backend,
    pub device: i32,
    /// Variables the user asked to evaluate.
    pub scheduled: Vec<u32>,
    /// Pending side-effect producers (scatters, recorded loop ends).
    pub side_effects: Vec<u32>,
    /// Masks pushed by in-flight loops; scatters conjoin with the top entry.
    pub mask_stack: Vec<u32>,
    pub cuda: Option<CudaThread>,
    /// Tail of this thread's ordered CPU task chain.
    pub task: Option<Task>,
}

impl ThreadState {
    fn new(backend: Backend) -> Result<Self> {
        let (cuda, device) = match backend {
            Backend::Cuda => {
                let (ctx, stream) = {
                    let mut state = lock();
                    CudaGlobals::get_or_init(&mut state)?
                };
                (Some(CudaThread::new(ctx, stream)?), 0)
            }
            Backend::Cpu => (None, -1),
        };
        Ok(ThreadState {
            backend,
            device,
            scheduled: Vec::new(),
            side_effects: Vec::new(),
            mask_stack: Vec::new(),
            cuda,
            task: None,
        })
    }
}

thread_local! {
    static TS_CPU: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
    static TS_CUDA: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

/// Run `f` with this thread's state for `backend`, creating it on first use.
///
/// Only public entry points may call this; internal code receives
/// `&mut ThreadState` so the thread-local is never borrowed twice.
pub fn with_ts<R>(backend: Backend, f: impl FnOnce(&mut ThreadState) -> Result<R>) -> Result<R> {
    let cell = match backend {
        Backend::Cpu => &TS_CPU,
        Backend::Cuda => &TS_CUDA,
    };
    cell.with(|c| {
        let mut slot = c.borrow_mut();
        if slot.is_none() {
            *slot = Some(ThreadState::new(backend)?);
        }
        f(slot.as_mut().expect("thread state just initialized"))
    })
}
