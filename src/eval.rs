//! Trace evaluator: schedule construction, kernel assembly, compilation
//! cache, launch, and post-evaluation cleanup.
//!
//! The scratch buffers below are process-level state reused across
//! evaluations, guarded by their own mutex which is held for the whole
//! evaluation; the global graph lock is taken and released in phases so
//! blocking work (module loads, task waits) runs without it.

use itertools::Itertools;
use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::backend::{self, cpu, cuda, POOL_BLOCK_SIZE};
use crate::codegen::{self, KERNEL_PREFIX, OPTIX_PREFIX};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelData, KernelKey};
use crate::memory::{self, AllocKind};
use crate::state::{self, flag, JitFlag, State, ThreadState};
use crate::types::{Backend, KernelType, VarType};
use crate::var::{self, ParamType, Stmt};
use crate::vm::CpuProgram;

/// One entry of the flattened evaluation order.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledVariable {
    pub size: u32,
    pub index: u32,
}

/// Contiguous run of the schedule sharing one evaluation size.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledGroup {
    pub size: u32,
    pub start: u32,
    pub end: u32,
}

#[derive(Default)]
struct EvalScratch {
    schedule: Vec<ScheduledVariable>,
    groups: Vec<ScheduledGroup>,
    visited: FxHashSet<(u32, u32)>,
    params: Vec<u64>,
}

static EVAL: Lazy<Mutex<EvalScratch>> = Lazy::new(|| Mutex::new(EvalScratch::default()));

/// Inline kernel parameters beyond this count are staged through memory.
const CUDA_ARG_LIMIT: usize = 512;

/// Pre-order DFS from one root; every node is scheduled under the root's
/// size so scalars fold into their consumer's group.
fn traverse(state: &mut State, scratch: &mut EvalScratch, size: u32, index: u32) {
    if !scratch.visited.insert((size, index)) {
        return;
    }
    let (dep, extra) = {
        let v = var::var(state, index);
        (v.dep, v.extra)
    };
    for d in dep {
        if d == 0 {
            break;
        }
        traverse(state, scratch, size, d);
    }
    if extra {
        let aux = state
            .extra
            .get(&index)
            .map(|e| e.dep.clone())
            .unwrap_or_default();
        for d in aux {
            if d != 0 {
                traverse(state, scratch, size, d);
            }
        }
    }
    // First visit under any size resets the output flag.
    if scratch.visited.insert((0, index)) {
        var::var_mut(state, index).output_flag = false;
    }
    scratch.schedule.push(ScheduledVariable { size, index });
}

struct AssembledGroup {
    text: String,
    hash: u128,
    program: Option<CpuProgram>,
    uses_optix: bool,
    /// Device-side staging buffer for oversized parameter vectors.
    staged: u64,
}

/// Build the parameter vector and register assignment for one group, then
/// emit and hash the kernel text.
fn assemble(
    state: &mut State,
    ts: &mut ThreadState,
    scratch: &mut EvalScratch,
    group: ScheduledGroup,
) -> Result<AssembledGroup> {
    let backend = ts.backend;
    scratch.params.clear();
    let mut uses_optix = backend == Backend::Cuda && flag(JitFlag::ForceOptiX);

    let mut n_regs: u32;
    match backend {
        Backend::Cuda => {
            scratch.params.push(group.size as u64);
            n_regs = 4;
        }
        Backend::Cpu => {
            // Slots for the kernel entry, packed launch sizes, and the
            // instrumentation handle.
            scratch.params.extend_from_slice(&[0, 0, 0]);
            n_regs = 1;
        }
    }

    let mut n_in = 0u32;
    let mut n_out = 0u32;
    let mut n_se = 0u32;

    for i in group.start..group.end {
        let index = scratch.schedule[i as usize].index;
        let (v_backend, size, ty, data, stmt, out_flag, se_flag, optix, rc_ext, rc_int, rc_se) = {
            let v = var::var(state, index);
            (
                v.backend,
                v.size,
                v.ty,
                v.data,
                v.stmt,
                v.output_flag,
                v.side_effect,
                v.optix,
                v.ref_count_ext,
                v.ref_count_int,
                v.ref_count_se,
            )
        };
        if v_backend != backend {
            panic!("assemble(): r{index} scheduled on the wrong backend");
        }
        if rc_ext == 0 && rc_int == 0 {
            panic!("assemble(): schedule contains unreferenced variable r{index}");
        }
        if size != 1 && size != group.size {
            panic!(
                "assemble(): r{index} has incompatible size ({size} and {})",
                group.size
            );
        }
        if data == 0 && stmt == Stmt::None {
            panic!("assemble(): r{index} has no statement");
        }
        if data != 0 && matches!(stmt, Stmt::Literal(_)) {
            panic!("assemble(): r{index} is simultaneously literal and evaluated");
        }
        if data == 0 && rc_se != 0 {
            panic!("assemble(): dirty variable r{index} encountered");
        }

        let param_offset = (scratch.params.len() * 8) as u32;
        let param_type;
        if data != 0 {
            param_type = ParamType::Input;
            scratch.params.push(data);
            n_in += 1;
        } else if out_flag && size == group.size {
            let isize = ty.size();
            let mut dsize = group.size as usize * isize;
            // Pad small host elements so out-of-bounds gathers stay in the
            // allocation.
            if backend == Backend::Cpu && isize < 4 {
                dsize += 4 - isize;
            }
            let kind = match backend {
                Backend::Cuda => AllocKind::Device,
                Backend::Cpu => AllocKind::HostAsync,
            };
            let ptr = memory::malloc(state, kind, dsize)?;
            let v = var::var_mut(state, index);
            v.data = ptr;
            param_type = ParamType::Output;
            scratch.params.push(ptr);
            n_out += 1;
        } else if let (Stmt::Literal(value), VarType::Ptr) = (stmt, ty) {
            param_type = ParamType::Input;
            scratch.params.push(value);
            n_in += 1;
        } else {
            param_type = ParamType::Register;
            n_se += se_flag as u32;
            uses_optix |= optix;
        }

        let v = var::var_mut(state, index);
        v.param_offset = param_offset;
        v.param_type = param_type;
        v.reg_index = n_regs;
        n_regs += 1;
    }

    if n_regs > 0xFFFFF {
        warn!(
            n_regs,
            "assemble(): the generated kernel uses an unusually large number \
             of registers and will likely not run efficiently; consider \
             calling eval() more frequently"
        );
    }

    // Oversized parameter vectors travel through a device buffer.
    let mut staged = 0u64;
    if backend == Backend::Cuda && (uses_optix || scratch.params.len() > CUDA_ARG_LIMIT) {
        let bytes = scratch.params.len() * 8;
        let host = memory::malloc(state, AllocKind::HostPinned, bytes)?;
        staged = memory::malloc(state, AllocKind::Device, bytes)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                scratch.params.as_ptr() as *const u8,
                host as *mut u8,
                bytes,
            );
        }
        backend::memcpy_async(ts, staged, host, bytes)?;
        memory::free(state, host);
        scratch.params.clear();
        scratch.params.push(staged);
    }

    let ids: Vec<u32> = scratch.schedule[group.start as usize..group.end as usize]
        .iter()
        .map(|sv| sv.index)
        .collect();
    let param_bytes = scratch.params.len() * 8;
    let mut assembly = codegen::assemble(
        state,
        backend,
        &ids,
        param_bytes,
        staged != 0,
        uses_optix,
        n_regs,
    )?;

    let hash = codegen::hash_kernel(&assembly.text);
    codegen::rewrite_kernel_name(&mut assembly.text, hash);

    if flag(JitFlag::PrintIR) {
        eprintln!("{}", assembly.text);
    }

    info!(
        hash = format_args!("{:016x}", (hash >> 64) as u64),
        n = group.size,
        n_in,
        out = n_out + n_se,
        ops = n_regs,
        "assembled kernel"
    );

    Ok(AssembledGroup {
        text: assembly.text,
        hash,
        program: assembly.program,
        uses_optix,
        staged,
    })
}

/// Look up (or compile) the kernel for an assembled group and launch it.
fn run(
    mut state: MutexGuard<'static, State>,
    ts: &mut ThreadState,
    scratch: &mut EvalScratch,
    group: ScheduledGroup,
    assembled: &AssembledGroup,
) -> Result<()> {
    let backend = ts.backend;
    let key = KernelKey {
        hash: assembled.hash,
        device: ts.device,
        flags: 0,
    };

    let kernel = if let Some(kernel) = state.kernels.lookup(&key) {
        state.kernels.hits += 1;
        kernel
    } else {
        let cache_dir = state.kernels.cache_dir();
        let disk = cache_dir
            .as_ref()
            .and_then(|dir| crate::kernel::kernel_load(dir, backend, assembled.hash));
        let soft_hit = disk.is_some();

        let kernel = match backend {
            Backend::Cuda => {
                if assembled.uses_optix {
                    return Err(Error::BackendCapability(
                        "run(): OptiX compilation support is not enabled".to_string(),
                    ));
                }
                let ctx = ts
                    .cuda
                    .as_ref()
                    .expect("cuda thread state")
                    .ctx
                    .clone();
                let make_ptx = || cudarc::nvrtc::Ptx::from_src(assembled.text.as_str());

                // Module loads block; release the lock while the driver works
                // and retry once after trimming the allocator on OOM.
                drop(state);
                let mut module = ctx.load_module(make_ptx());
                if let Err(err) = &module {
                    if err.0 == cudarc::driver::sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
                        {
                            let mut st = state::lock();
                            memory::trim(&mut st);
                        }
                        module = ctx.load_module(make_ptx());
                    }
                }
                let module = module?;
                let name = format!(
                    "{}{:032x}",
                    if assembled.uses_optix { OPTIX_PREFIX } else { KERNEL_PREFIX },
                    assembled.hash
                );
                let func = module.load_function(&name).map_err(|_| {
                    Error::BackendCapability(format!("run(): could not locate kernel {name}"))
                })?;
                let block_size = match &disk {
                    Some((_, block_size)) => *block_size,
                    None => cuda::occupancy_block_size(&func, &module)?,
                };
                state = state::lock();

                if !soft_hit {
                    if let Some(dir) = &cache_dir {
                        if let Err(err) = crate::kernel::kernel_write(
                            dir,
                            &assembled.text,
                            backend,
                            assembled.hash,
                            &[],
                            block_size,
                        ) {
                            warn!("kernel cache write failed: {err}");
                        }
                    }
                }

                Kernel {
                    data: KernelData::Cuda {
                        _module: module,
                        func,
                        block_size,
                    },
                    size: assembled.text.len(),
                }
            }
            Backend::Cpu => {
                let program = match &disk {
                    Some((payload, _)) => CpuProgram::from_bytes(payload).ok_or_else(|| {
                        Error::BackendCapability(
                            "run(): corrupt cached kernel payload".to_string(),
                        )
                    })?,
                    None => assembled
                        .program
                        .clone()
                        .expect("host assembly always carries a program"),
                };
                let payload = program.to_bytes();
                if !soft_hit {
                    if let Some(dir) = &cache_dir {
                        if let Err(err) = crate::kernel::kernel_write(
                            dir,
                            &assembled.text,
                            backend,
                            assembled.hash,
                            &payload,
                            POOL_BLOCK_SIZE,
                        ) {
                            warn!("kernel cache write failed: {err}");
                        }
                    }
                }
                Kernel {
                    data: KernelData::Cpu {
                        program: std::sync::Arc::new(program),
                    },
                    size: payload.len(),
                }
            }
        };

        if soft_hit {
            state.kernels.soft_misses += 1;
        } else {
            state.kernels.hard_misses += 1;
        }
        debug!(
            cache = if soft_hit { "soft miss" } else { "hard miss" },
            bytes = kernel.size,
            "kernel installed"
        );
        state.kernels.insert(key, kernel.clone());
        kernel
    };
    state.kernels.launches += 1;
    drop(state);

    match &kernel.data {
        KernelData::Cuda { func, block_size, .. } => {
            let threads = (*block_size).max(32);
            let blocks = group.size.div_ceil(threads).max(1);
            backend::submit_gpu(
                ts,
                KernelType::Jit,
                func,
                blocks,
                threads,
                0,
                &scratch.params,
                group.size,
            )?;
        }
        KernelData::Cpu { program } => {
            let size = group.size;
            let blocks = size.div_ceil(POOL_BLOCK_SIZE).max(1);
            let mut params = scratch.params.clone();
            let program = program.clone();
            params[0] = std::sync::Arc::as_ptr(&program) as u64;
            params[1] = ((POOL_BLOCK_SIZE as u64) << 32) | size as u64;
            trace!(blocks, size, "scheduling host kernel");
            backend::submit_cpu(ts, KernelType::Jit, size, blocks, move |index| {
                let start = index * POOL_BLOCK_SIZE;
                let end = (start + POOL_BLOCK_SIZE).min(size);
                program.exec(start, end, &params);
            });
        }
    }

    // The staging buffer is dead once the launch has been enqueued.
    if assembled.staged != 0 {
        let mut st = state::lock();
        memory::free(&mut st, assembled.staged);
    }
    Ok(())
}

/// Release internal edges of everything the evaluation materialized.
fn cleanup(scratch: &mut EvalScratch) {
    let mut state = state::lock();
    for i in 0..scratch.schedule.len() {
        let index = scratch.schedule[i].index;
        let Some(v) = state.vars.get_mut(&index) else {
            continue;
        };
        v.reg_index = 0;
        if !(v.output_flag || v.side_effect) {
            continue;
        }

        if v.extra {
            let callback = state
                .extra
                .get_mut(&index)
                .and_then(|e| e.callback.take().map(|cb| (cb, e.callback_internal)));
            if let Some((mut cb, internal)) = callback {
                if internal {
                    cb(index, false);
                } else {
                    // External callbacks run without the lock.
                    drop(state);
                    cb(index, false);
                    state = state::lock();
                }
                if let Some(e) = state.extra.get_mut(&index) {
                    e.callback = Some(cb);
                }
            }
        }

        let key = state.vars.get_mut(&index).and_then(|v| v.cse_key.take());
        if let Some(key) = key {
            if state.cse.get(&key) == Some(&index) {
                state.cse.remove(&key);
            }
        }
        if !state.vars.contains_key(&index) {
            continue;
        }

        let v = var::var_mut(&mut state, index);
        if v.is_literal() && v.data == 0 {
            panic!("cleanup(): unexpected literal variable r{index}");
        }
        let dep = v.dep;
        let side_effect = v.side_effect;
        v.dep = [0; 4];
        v.stmt = Stmt::None;
        v.output_flag = false;
        v.side_effect = false;

        if side_effect {
            var::dec_ref_ext(&mut state, index);
        }
        for d in dep {
            var::dec_ref_int(&mut state, d);
        }
    }
}

/// Evaluate everything queued on the calling thread's state.
pub fn eval_thread(ts: &mut ThreadState) -> Result<()> {
    if ts.scheduled.is_empty() && (ts.side_effects.is_empty() || flag(JitFlag::Recording)) {
        return Ok(());
    }

    // Serialize evaluations while keeping the graph lock droppable.
    let mut scratch = EVAL.lock().unwrap_or_else(|e| e.into_inner());
    scratch.schedule.clear();
    scratch.groups.clear();
    scratch.visited.clear();

    {
        let mut state = state::lock();
        for j in 0..2 {
            if j == 1 && flag(JitFlag::Recording) {
                break;
            }
            let source = if j == 0 {
                std::mem::take(&mut ts.scheduled)
            } else {
                std::mem::take(&mut ts.side_effects)
            };
            for index in source {
                if !state.vars.contains_key(&index) {
                    continue;
                }
                let (rc_ext, data, size, ty) = {
                    let v = var::var(&state, index);
                    (v.ref_count_ext, v.data, v.size, v.ty)
                };
                if rc_ext == 0 || data != 0 {
                    continue;
                }
                traverse(&mut state, &mut scratch, size, index);
                var::var_mut(&mut state, index).output_flag = ty != VarType::Void;
            }
        }
    }

    if scratch.schedule.is_empty() {
        return Ok(());
    }

    scratch
        .schedule
        .sort_by(|a, b| b.size.cmp(&a.size).then(a.index.cmp(&b.index)));

    // Contiguous equal-size prefixes become kernels.
    let mut start = 0u32;
    for i in 1..scratch.schedule.len() as u32 {
        if scratch.schedule[(i - 1) as usize].size != scratch.schedule[i as usize].size {
            let size = scratch.schedule[start as usize].size;
            scratch.groups.push(ScheduledGroup {
                size,
                start,
                end: i,
            });
            start = i;
        }
    }
    let size = scratch.schedule[start as usize].size;
    let end = scratch.schedule.len() as u32;
    scratch.groups.push(ScheduledGroup { size, start, end });

    info!(
        kernels = scratch.groups.len(),
        sizes = %scratch.groups.iter().map(|g| g.size).format(", "),
        "eval: launching"
    );

    let mut tasks: Vec<cpu::Task> = Vec::new();
    let groups = scratch.groups.clone();
    for group in groups {
        let assembled = {
            let mut state = state::lock();
            assemble(&mut state, ts, &mut scratch, group)?
        };
        run(state::lock(), ts, &mut scratch, group, &assembled)?;
        if ts.backend == Backend::Cpu {
            if let Some(task) = &ts.task {
                tasks.push(task.clone());
            }
        }
    }

    if ts.backend == Backend::Cpu && tasks.len() > 1 {
        // Merge the per-group launches into a single successor.
        ts.task = Some(cpu::barrier(&tasks));
    }

    debug!("eval: cleaning up");
    cleanup(&mut scratch);
    info!("eval: done");
    Ok(())
}
