//! CUDA driver wrapper: context/stream/event plumbing, raw kernel launches,
//! and the table of builtin primitive kernels compiled through nvrtc.

use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{
    sys::{self, CUevent, CUfunction},
    CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::state::State;
use crate::types::{ReduceOp, VarType};

/// Process-wide driver state, created on first use of the CUDA backend.
pub struct CudaGlobals {
    pub ctx: Arc<CudaContext>,
    pub stream: Arc<CudaStream>,
    pub device: i32,
    pub sm_count: u32,
    pub shared_memory_bytes: u32,
    builtins: FxHashMap<String, (Arc<CudaModule>, CudaFunction)>,
}

impl CudaGlobals {
    /// Initialize the driver if needed and hand out the shared context and
    /// stream for a new thread state.
    pub fn get_or_init(state: &mut State) -> Result<(Arc<CudaContext>, Arc<CudaStream>)> {
        if state.cuda.is_none() {
            let ctx = CudaContext::new(0)?;
            ctx.bind_to_thread()?;
            ctx.set_flags(sys::CUctx_flags::CU_CTX_SCHED_BLOCKING_SYNC)?;
            let stream = ctx.default_stream();
            let sm_count = ctx.attribute(
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
            )? as u32;
            let shared_memory_bytes = ctx.attribute(
                sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            )? as u32;
            debug!(sm_count, shared_memory_bytes, "cuda backend initialized");
            state.cuda = Some(CudaGlobals {
                ctx,
                stream,
                device: 0,
                sm_count,
                shared_memory_bytes,
                builtins: FxHashMap::default(),
            });
        }
        let cuda = state.cuda.as_ref().expect("cuda globals just initialized");
        Ok((cuda.ctx.clone(), cuda.stream.clone()))
    }
}

/// Per-thread CUDA state: the serial stream all of this thread's work is
/// enqueued on, plus one reusable event for host-visible synchronization.
pub struct CudaThread {
    pub ctx: Arc<CudaContext>,
    pub stream: Arc<CudaStream>,
    event: CUevent,
}

// The raw event is only touched from its owning thread.
unsafe impl Send for CudaThread {}

impl CudaThread {
    pub fn new(ctx: Arc<CudaContext>, stream: Arc<CudaStream>) -> Result<Self> {
        ctx.bind_to_thread()?;
        let mut event = MaybeUninit::uninit();
        unsafe {
            sys::cuEventCreate(
                event.as_mut_ptr(),
                sys::CUevent_flags::CU_EVENT_DEFAULT as u32,
            )
            .result()?;
        }
        Ok(CudaThread {
            ctx,
            stream,
            event: unsafe { event.assume_init() },
        })
    }

    /// Record the thread's event on its stream.
    pub fn record_event(&self) -> Result<()> {
        unsafe { sys::cuEventRecord(self.event, self.stream.cu_stream()).result()? };
        Ok(())
    }

    /// Block the host until the recorded event has completed. Callers must
    /// have released the global lock.
    pub fn sync_event(&self) -> Result<()> {
        unsafe { sys::cuEventSynchronize(self.event).result()? };
        Ok(())
    }
}

impl Drop for CudaThread {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        unsafe {
            let _ = sys::cuEventDestroy_v2(self.event);
        }
    }
}

/// Recover the bare `CUfunction` handle from a `CudaFunction`.
///
/// `cuOccupancyMaxPotentialBlockSize` has no safe counterpart, and cudarc
/// keeps the driver handle private, paired with an `Arc` clone of the
/// owning module so the function cannot outlive it. That makes the wrapper
/// exactly two words, but their order is unspecified, so rather than
/// assuming an offset both words are read and the one holding the module
/// reference is ruled out: an `Arc<T>` is a pointer to its heap block,
/// which places `T` right after the two reference counts, and every clone
/// shares that block with the `Arc<CudaModule>` the caller already holds.
fn raw_function(func: &CudaFunction, module: &Arc<CudaModule>) -> CUfunction {
    assert_eq!(
        std::mem::size_of::<CudaFunction>(),
        2 * std::mem::size_of::<usize>(),
        "CudaFunction layout changed; cannot recover the driver handle"
    );
    let words: [usize; 2] = unsafe { std::mem::transmute_copy(func) };
    let module_word = Arc::as_ptr(module) as usize - 2 * std::mem::size_of::<usize>();
    let raw = if words[0] == module_word { words[1] } else { words[0] };
    raw as CUfunction
}

/// Ask the driver for the occupancy-optimal block size of a function.
pub fn occupancy_block_size(func: &CudaFunction, module: &Arc<CudaModule>) -> Result<u32> {
    let mut min_grid = 0i32;
    let mut block_size = 0i32;
    unsafe {
        sys::cuOccupancyMaxPotentialBlockSize(
            &mut min_grid,
            &mut block_size,
            raw_function(func, module),
            None,
            0,
            0,
        )
        .result()?;
    }
    Ok(block_size as u32)
}

pub fn round_pow2(mut value: u32) -> u32 {
    value = value.max(1) - 1;
    value |= value >> 1;
    value |= value >> 2;
    value |= value >> 4;
    value |= value >> 8;
    value |= value >> 16;
    value + 1
}

/// Pick `(block_count, thread_count)` for a width-`size` launch.
pub fn launch_config(size: u32, block_size: u32) -> (u32, u32) {
    let threads = round_pow2(size.min(block_size)).min(block_size).max(32);
    let blocks = size.div_ceil(threads).max(1);
    (blocks, threads)
}

/// Launch a kernel with a flat vector of pointer-sized parameters.
pub fn launch(
    stream: &CudaStream,
    func: &CudaFunction,
    blocks: u32,
    threads: u32,
    shared_mem: u32,
    params: &[u64],
) -> Result<()> {
    launch_dims(stream, func, (blocks, 1), (threads, 1), shared_mem, params)
}

/// Two-dimensional launch, used by the transpose step of `mkperm`.
pub fn launch_dims(
    stream: &CudaStream,
    func: &CudaFunction,
    grid: (u32, u32),
    block: (u32, u32),
    shared_mem: u32,
    params: &[u64],
) -> Result<()> {
    let cfg = LaunchConfig {
        grid_dim: (grid.0, grid.1, 1),
        block_dim: (block.0, block.1, 1),
        shared_mem_bytes: shared_mem,
    };
    let mut builder = stream.launch_builder(func);
    for p in params {
        builder.arg(p);
    }
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Look up a builtin kernel, compiling and caching it on first use.
pub fn builtin(state: &mut State, name: &str, source: impl FnOnce() -> String) -> Result<CudaFunction> {
    let cuda = state
        .cuda
        .as_mut()
        .expect("builtin kernel requested without an initialized CUDA backend");
    if let Some((_, func)) = cuda.builtins.get(name) {
        return Ok(func.clone());
    }
    let src = source();
    trace!(name, "compiling builtin kernel");
    let ptx = compile_ptx(&src)?;
    let module = cuda.ctx.load_module(ptx)?;
    let func = module.load_function(name).map_err(|_| {
        Error::BackendCapability(format!("builtin kernel {name} missing from module"))
    })?;
    cuda.builtins
        .insert(name.to_string(), (module, func.clone()));
    Ok(func)
}

// ====================================================================
// Builtin kernel sources. Generated as CUDA C and compiled per device;
// names encode the specialization so the cache key is just the name.
// ====================================================================

const PREAMBLE: &str = "\
typedef unsigned char u8;
typedef unsigned short u16;
typedef unsigned int u32;
typedef unsigned long long u64;
";

fn reduce_expr(op: ReduceOp, ty: VarType, a: &str, b: &str) -> Result<String> {
    let int = ty.is_int();
    Ok(match op {
        ReduceOp::Add => format!("{a} + {b}"),
        ReduceOp::Mul => format!("{a} * {b}"),
        ReduceOp::Min if ty.is_float() => format!("fmin({a}, {b})"),
        ReduceOp::Max if ty.is_float() => format!("fmax({a}, {b})"),
        ReduceOp::Min => format!("{a} < {b} ? {a} : {b}"),
        ReduceOp::Max => format!("{a} > {b} ? {a} : {b}"),
        ReduceOp::And | ReduceOp::Or if !int => {
            return Err(Error::BackendCapability(format!(
                "reduce(): no kernel for type={}, op={}",
                ty.name(),
                op.name()
            )))
        }
        ReduceOp::And => format!("{a} & {b}"),
        ReduceOp::Or => format!("{a} | {b}"),
    })
}

fn identity_expr(op: ReduceOp, ty: VarType) -> String {
    if ty.is_float() {
        let bits = op.identity(ty);
        let value = match ty {
            VarType::F32 => f32::from_bits(bits as u32) as f64,
            _ => f64::from_bits(bits),
        };
        if value.is_infinite() {
            format!(
                "{}(1.0/0.0)",
                if value < 0.0 { "-" } else { "" }
            )
        } else {
            format!("({}) {}", ty.cuda(), value)
        }
    } else {
        format!("({}) 0x{:x}ull", ty.cuda(), op.identity(ty))
    }
}

/// Tree reduction; one value per block, re-launched on the partials when the
/// input spans more than one block.
pub fn reduction_source(name: &str, op: ReduceOp, ty: VarType) -> Result<String> {
    let t = ty.cuda();
    let expr = reduce_expr(op, ty, "acc", "v")?;
    let tree = reduce_expr(op, ty, "sh[tid]", "sh[tid + s]")?;
    let ident = identity_expr(op, ty);
    Ok(format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, u32 n, {t} *out) {{
    extern __shared__ unsigned char shared_raw[];
    {t} *sh = ({t} *) shared_raw;
    u32 tid = threadIdx.x;
    {t} acc = {ident};
    for (u32 i = blockIdx.x * blockDim.x + tid; i < n; i += blockDim.x * gridDim.x) {{
        {t} v = in[i];
        acc = {expr};
    }}
    sh[tid] = acc;
    __syncthreads();
    for (u32 s = blockDim.x / 2; s > 0; s >>= 1) {{
        if (tid < s)
            sh[tid] = {tree};
        __syncthreads();
    }}
    if (tid == 0)
        out[blockIdx.x] = sh[0];
}}
"#
    ))
}

/// Single-block scan: each thread owns a contiguous run of `items_per_thread`
/// elements; thread totals go through a ping-pong Hillis-Steele scan.
pub fn scan_small_source(name: &str, ty: VarType, exclusive: bool, items_per_thread: u32) -> String {
    let t = ty.cuda();
    let write = if exclusive {
        "out[i] = carry; carry += v;"
    } else {
        "carry += v; out[i] = carry;"
    };
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *out, u32 n) {{
    extern __shared__ unsigned char shared_raw[];
    {t} *sh = ({t} *) shared_raw;
    const u32 ipt = {items_per_thread};
    u32 tid = threadIdx.x, nt = blockDim.x;
    {t} values[{items_per_thread}];
    {t} sum = ({t}) 0;
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = tid * ipt + j;
        {t} v = i < n ? in[i] : ({t}) 0;
        values[j] = v;
        sum += v;
    }}
    sh[tid] = sum;
    __syncthreads();
    u32 rd = 0, wr = nt;
    for (u32 offset = 1; offset < nt; offset <<= 1) {{
        {t} v = sh[rd + tid];
        if (tid >= offset)
            v += sh[rd + tid - offset];
        sh[wr + tid] = v;
        __syncthreads();
        u32 tmp = rd; rd = wr; wr = tmp;
    }}
    {t} carry = tid > 0 ? sh[rd + tid - 1] : ({t}) 0;
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = tid * ipt + j;
        if (i < n) {{
            {t} v = values[j];
            {write}
        }}
    }}
}}
"#
    )
}

/// Prepare the look-back scratch: flag the 32-entry padding preface as
/// resolved prefixes of zero, clear the rest.
pub const SCAN_LARGE_INIT: &str = r#"
typedef unsigned int u32;
typedef unsigned long long u64;
extern "C" __global__ void scan_large_init(u64 *scratch, u32 n) {
    u32 i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n)
        scratch[i] = i < 32 ? 2ull : 0ull;
}
"#;

/// Decoupled look-back scan for 32-bit elements. Each scratch word packs the
/// published value in the upper half and a status flag (1 = aggregate,
/// 2 = inclusive prefix) in the lower bits.
pub fn scan_large_source(name: &str, ty: VarType, exclusive: bool) -> String {
    let t = ty.cuda();
    let (to_bits, from_bits) = if ty == VarType::F32 {
        ("__float_as_uint", "__uint_as_float")
    } else {
        ("(u32)", "(u32)")
    };
    let write = if exclusive {
        "out[i] = carry; carry += v;"
    } else {
        "carry += v; out[i] = carry;"
    };
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *out, u32 n, u64 *scratch) {{
    extern __shared__ unsigned char shared_raw[];
    {t} *sh = ({t} *) shared_raw;
    const u32 ipt = 16;
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 base = blockIdx.x * nt * ipt;
    {t} values[16];
    {t} sum = ({t}) 0;
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = base + tid * ipt + j;
        {t} v = i < n ? in[i] : ({t}) 0;
        values[j] = v;
        sum += v;
    }}
    sh[tid] = sum;
    __syncthreads();
    u32 rd = 0, wr = nt;
    for (u32 offset = 1; offset < nt; offset <<= 1) {{
        {t} v = sh[rd + tid];
        if (tid >= offset)
            v += sh[rd + tid - offset];
        sh[wr + tid] = v;
        __syncthreads();
        u32 tmp = rd; rd = wr; wr = tmp;
    }}
    {t} aggregate = sh[rd + nt - 1];
    __shared__ {t} block_prefix;
    if (tid == 0) {{
        u64 *slot = scratch + 32 + blockIdx.x;
        atomicExch(slot, ((u64) {to_bits}(aggregate) << 32) | 1ull);
        {t} prefix = ({t}) 0;
        for (long long p = (long long) blockIdx.x - 1;; --p) {{
            u64 entry = atomicAdd(scratch + 32 + p, 0ull);
            u32 flag = (u32) (entry & 3ull);
            if (flag == 0) {{ ++p; continue; }}
            prefix += {from_bits}((u32) (entry >> 32));
            if (flag == 2)
                break;
        }}
        atomicExch(slot, ((u64) {to_bits}(prefix + aggregate) << 32) | 2ull);
        block_prefix = prefix;
    }}
    __syncthreads();
    {t} carry = block_prefix + (tid > 0 ? sh[rd + tid - 1] : ({t}) 0);
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = base + tid * ipt + j;
        if (i < n) {{
            {t} v = values[j];
            {write}
        }}
    }}
}}
"#
    )
}

/// Per-block totals for the 64-bit large-scan scheme.
pub fn scan_block_sums_source(name: &str, ty: VarType) -> String {
    let t = ty.cuda();
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *partials, u32 n) {{
    extern __shared__ unsigned char shared_raw[];
    {t} *sh = ({t} *) shared_raw;
    const u32 ipt = 8;
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 base = blockIdx.x * nt * ipt;
    {t} sum = ({t}) 0;
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = base + tid * ipt + j;
        if (i < n)
            sum += in[i];
    }}
    sh[tid] = sum;
    __syncthreads();
    for (u32 s = nt / 2; s > 0; s >>= 1) {{
        if (tid < s)
            sh[tid] += sh[tid + s];
        __syncthreads();
    }}
    if (tid == 0)
        partials[blockIdx.x] = sh[0];
}}
"#
    )
}

/// Second pass of the 64-bit scheme: in-block scan seeded with the scanned
/// block partial.
pub fn scan_apply_source(name: &str, ty: VarType, exclusive: bool) -> String {
    let t = ty.cuda();
    let write = if exclusive {
        "out[i] = carry; carry += v;"
    } else {
        "carry += v; out[i] = carry;"
    };
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *out, u32 n, const {t} *partials) {{
    extern __shared__ unsigned char shared_raw[];
    {t} *sh = ({t} *) shared_raw;
    const u32 ipt = 8;
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 base = blockIdx.x * nt * ipt;
    {t} values[8];
    {t} sum = ({t}) 0;
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = base + tid * ipt + j;
        {t} v = i < n ? in[i] : ({t}) 0;
        values[j] = v;
        sum += v;
    }}
    sh[tid] = sum;
    __syncthreads();
    u32 rd = 0, wr = nt;
    for (u32 offset = 1; offset < nt; offset <<= 1) {{
        {t} v = sh[rd + tid];
        if (tid >= offset)
            v += sh[rd + tid - offset];
        sh[wr + tid] = v;
        __syncthreads();
        u32 tmp = rd; rd = wr; wr = tmp;
    }}
    {t} carry = partials[blockIdx.x] + (tid > 0 ? sh[rd + tid - 1] : ({t}) 0);
    for (u32 j = 0; j < ipt; ++j) {{
        u32 i = base + tid * ipt + j;
        if (i < n) {{
            {t} v = values[j];
            {write}
        }}
    }}
}}
"#
    )
}

/// Mask compression, single block.
pub const COMPRESS_SMALL: &str = r#"
typedef unsigned char u8;
typedef unsigned int u32;
extern "C" __global__ void compress_small(const u8 *in, u32 *out, u32 n, u32 *count_out) {
    extern __shared__ unsigned char shared_raw[];
    u32 *sh = (u32 *) shared_raw;
    const u32 ipt = 4;
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 values[4];
    u32 sum = 0;
    for (u32 j = 0; j < ipt; ++j) {
        u32 i = tid * ipt + j;
        u32 v = i < n ? (u32) in[i] : 0u;
        values[j] = v;
        sum += v;
    }
    sh[tid] = sum;
    __syncthreads();
    u32 rd = 0, wr = nt;
    for (u32 offset = 1; offset < nt; offset <<= 1) {
        u32 v = sh[rd + tid];
        if (tid >= offset)
            v += sh[rd + tid - offset];
        sh[wr + tid] = v;
        __syncthreads();
        u32 tmp = rd; rd = wr; wr = tmp;
    }
    u32 carry = tid > 0 ? sh[rd + tid - 1] : 0u;
    for (u32 j = 0; j < ipt; ++j) {
        u32 i = tid * ipt + j;
        if (i < n && values[j])
            out[carry] = i;
        carry += values[j];
    }
    if (tid == nt - 1)
        *count_out = sh[rd + nt - 1];
}
"#;

/// Mask compression over the look-back scratch.
pub const COMPRESS_LARGE: &str = r#"
typedef unsigned char u8;
typedef unsigned int u32;
typedef unsigned long long u64;
extern "C" __global__ void compress_large(const u8 *in, u32 *out, u32 n, u64 *scratch,
                                          u32 *count_out) {
    extern __shared__ unsigned char shared_raw[];
    u32 *sh = (u32 *) shared_raw;
    const u32 ipt = 16;
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 base = blockIdx.x * nt * ipt;
    u32 values[16];
    u32 sum = 0;
    for (u32 j = 0; j < ipt; ++j) {
        u32 i = base + tid * ipt + j;
        u32 v = i < n ? (u32) in[i] : 0u;
        values[j] = v;
        sum += v;
    }
    sh[tid] = sum;
    __syncthreads();
    u32 rd = 0, wr = nt;
    for (u32 offset = 1; offset < nt; offset <<= 1) {
        u32 v = sh[rd + tid];
        if (tid >= offset)
            v += sh[rd + tid - offset];
        sh[wr + tid] = v;
        __syncthreads();
        u32 tmp = rd; rd = wr; wr = tmp;
    }
    u32 aggregate = sh[rd + nt - 1];
    __shared__ u32 block_prefix;
    if (tid == 0) {
        u64 *slot = scratch + 32 + blockIdx.x;
        atomicExch(slot, ((u64) aggregate << 32) | 1ull);
        u32 prefix = 0;
        for (long long p = (long long) blockIdx.x - 1;; --p) {
            u64 entry = atomicAdd(scratch + 32 + p, 0ull);
            u32 flag = (u32) (entry & 3ull);
            if (flag == 0) { ++p; continue; }
            prefix += (u32) (entry >> 32);
            if (flag == 2)
                break;
        }
        atomicExch(slot, ((u64) (prefix + aggregate) << 32) | 2ull);
        block_prefix = prefix;
    }
    __syncthreads();
    u32 carry = block_prefix + (tid > 0 ? sh[rd + tid - 1] : 0u);
    for (u32 j = 0; j < ipt; ++j) {
        u32 i = base + tid * ipt + j;
        if (i < n && values[j])
            out[carry] = i;
        carry += values[j];
    }
    if (blockIdx.x == gridDim.x - 1 && tid == nt - 1)
        *count_out = block_prefix + sh[rd + nt - 1];
}
"#;

/// Histogram phase of the bucketed permutation.
///
/// `mode` 0 = tiny (one histogram row per warp), 1 = small (one shared row
/// per block), 2 = large (global rows, zero-initialized by the caller).
pub fn mkperm_phase1_source(name: &str, mode: u32) -> String {
    let decl = match mode {
        0 => "extern __shared__ u32 sh[];\n    u32 *hist = sh + (threadIdx.x / 32) * bucket_count;",
        1 => "extern __shared__ u32 sh[];\n    u32 *hist = sh;",
        _ => "u32 *hist = buckets + blockIdx.x * bucket_count;",
    };
    let zero_shared = if mode < 2 {
        r#"
    u32 shared_entries = bucket_count * (SH_ROWS);
    for (u32 b = threadIdx.x; b < shared_entries; b += blockDim.x)
        sh[b] = 0;
    __syncthreads();
"#
    } else {
        ""
    };
    let sh_rows = if mode == 0 { "blockDim.x / 32" } else { "1u" };
    let flush = if mode < 2 {
        format!(
            r#"
    __syncthreads();
    u32 out_rows = {sh_rows};
    for (u32 b = threadIdx.x; b < bucket_count * out_rows; b += blockDim.x)
        buckets[(blockIdx.x * out_rows) * bucket_count + b] = sh[b];
"#
        )
    } else {
        String::new()
    };
    let zero_shared = zero_shared.replace("SH_ROWS", sh_rows);
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const u32 *ptr, u32 *buckets, u32 n, u32 size_per_block,
                                  u32 bucket_count) {{
    {decl}
    {zero_shared}
    u32 warp = threadIdx.x / 32, lane = threadIdx.x % 32;
    u32 warp_count = blockDim.x / 32;
    u32 block_start = blockIdx.x * size_per_block;
    u32 block_end = block_start + size_per_block;
    if (block_end > n) block_end = n;
    u32 span = size_per_block / warp_count;
    span = (span + 31u) / 32u * 32u;
    u32 wstart = block_start + warp * span;
    u32 wend = wstart + span;
    if (wend > block_end) wend = block_end;
    for (u32 i = wstart + lane; i < wend; i += 32)
        atomicAdd(&hist[ptr[i]], 1u);
    {flush}
}}
"#
    )
}

/// Offsets-collection phase: one thread per bucket, ranks of non-empty
/// buckets promoted through a shared scan and a global counter.
pub const MKPERM_PHASE3: &str = r#"
typedef unsigned int u32;
extern "C" __global__ void mkperm_phase3(const u32 *buckets, u32 bucket_count,
                                         u32 bucket_count_rounded, u32 n, u32 *counter,
                                         u32 *offsets) {
    extern __shared__ u32 sh[];
    u32 tid = threadIdx.x, nt = blockDim.x;
    u32 b = blockIdx.x * nt + tid;
    u32 start = 0, length = 0;
    if (b < bucket_count) {
        start = buckets[b];
        u32 next = b + 1 < bucket_count ? buckets[b + 1] : n;
        length = next - start;
    }
    u32 flag = length > 0 ? 1u : 0u;
    sh[tid] = flag;
    __syncthreads();
    for (u32 offset = 1; offset < nt; offset <<= 1) {
        u32 v = sh[tid];
        __syncthreads();
        if (tid + offset < nt)
            sh[tid + offset] += v;
        __syncthreads();
    }
    u32 inclusive = sh[tid];
    u32 total = sh[nt - 1];
    __shared__ u32 block_base;
    if (tid == nt - 1)
        block_base = atomicAdd(counter, total);
    __syncthreads();
    if (flag) {
        u32 rank = block_base + inclusive - 1;
        offsets[rank * 4 + 0] = b;
        offsets[rank * 4 + 1] = start;
        offsets[rank * 4 + 2] = length;
        offsets[rank * 4 + 3] = 0;
    }
}
"#;

/// Scatter phase of the bucketed permutation. Lanes claim destinations in
/// lane order so the result stays stable within each warp.
pub fn mkperm_phase4_source(name: &str, mode: u32) -> String {
    let (decl, load) = match mode {
        0 => (
            "extern __shared__ u32 sh[];",
            r#"
    u32 sh_rows = blockDim.x / 32;
    for (u32 b = threadIdx.x; b < bucket_count * sh_rows; b += blockDim.x)
        sh[b] = buckets[blockIdx.x * sh_rows * bucket_count + b];
    __syncthreads();
    u32 *hist = sh + (threadIdx.x / 32) * bucket_count;
"#,
        ),
        1 => (
            "extern __shared__ u32 sh[];",
            r#"
    for (u32 b = threadIdx.x; b < bucket_count; b += blockDim.x)
        sh[b] = buckets[blockIdx.x * bucket_count + b];
    __syncthreads();
    u32 *hist = sh;
"#,
        ),
        _ => ("", "\n    u32 *hist = buckets + blockIdx.x * bucket_count;\n"),
    };
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const u32 *ptr, u32 *buckets, u32 *perm, u32 n,
                                  u32 size_per_block, u32 bucket_count) {{
    {decl}
    {load}
    u32 warp = threadIdx.x / 32, lane = threadIdx.x % 32;
    u32 warp_count = blockDim.x / 32;
    u32 block_start = blockIdx.x * size_per_block;
    u32 block_end = block_start + size_per_block;
    if (block_end > n) block_end = n;
    u32 span = size_per_block / warp_count;
    span = (span + 31u) / 32u * 32u;
    u32 wstart = block_start + warp * span;
    u32 wend = wstart + span;
    if (wend > block_end) wend = block_end;
    u32 trips = wend > wstart ? (wend - wstart + 31u) / 32u : 0u;
    for (u32 t = 0; t < trips; ++t) {{
        u32 i = wstart + t * 32u + lane;
        bool active = i < wend;
        u32 bucket = active ? ptr[i] : 0u;
        for (u32 l = 0; l < 32; ++l) {{
            if (lane == l && active) {{
                u32 dst = atomicAdd(&hist[bucket], 1u);
                perm[dst] = i;
            }}
            __syncwarp();
        }}
    }}
}}
"#
    )
}

/// 16x16 tiled transpose with a padded column to dodge bank conflicts.
pub const TRANSPOSE_U32: &str = r#"
typedef unsigned int u32;
extern "C" __global__ void transpose_u32(const u32 *in, u32 *out, u32 rows, u32 cols) {
    __shared__ u32 tile[16][17];
    u32 c = blockIdx.x * 16 + threadIdx.x;
    u32 r = blockIdx.y * 16 + threadIdx.y;
    if (r < rows && c < cols)
        tile[threadIdx.y][threadIdx.x] = in[r * cols + c];
    __syncthreads();
    c = blockIdx.y * 16 + threadIdx.x;
    r = blockIdx.x * 16 + threadIdx.y;
    if (r < cols && c < rows)
        out[r * rows + c] = tile[threadIdx.x][threadIdx.y];
}
"#;

/// 8-byte memset; the narrower widths map onto driver memsets.
pub const FILL_U64: &str = r#"
typedef unsigned int u32;
typedef unsigned long long u64;
extern "C" __global__ void fill_u64(u64 *out, u32 n, u64 value) {
    for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += blockDim.x * gridDim.x)
        out[i] = value;
}
"#;

/// Replicate each input element across a contiguous output block.
pub fn block_copy_source(name: &str, ty: VarType) -> String {
    let t = ty.cuda();
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *out, u32 n, u32 block) {{
    for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += blockDim.x * gridDim.x)
        out[i] = in[i / block];
}}
"#
    )
}

/// Accumulate contiguous blocks into one output slot each; the output must
/// be zero-initialized by the caller.
pub fn block_sum_source(name: &str, ty: VarType) -> String {
    let t = ty.cuda();
    format!(
        r#"{PREAMBLE}
extern "C" __global__ void {name}(const {t} *in, {t} *out, u32 n, u32 block) {{
    for (u32 i = blockIdx.x * blockDim.x + threadIdx.x; i < n; i += blockDim.x * gridDim.x)
        atomicAdd(out + i / block, in[i]);
}}
"#
    )
}

pub fn poke_source(name: &str, size: u32) -> String {
    let t = match size {
        1 => "unsigned char",
        2 => "unsigned short",
        4 => "unsigned int",
        _ => "unsigned long long",
    };
    format!(
        r#"
extern "C" __global__ void {name}({t} *out, {t} value) {{
    *out = value;
}}
"#
    )
}

/// Positionally addressed write-out of a heterogeneous batch.
pub const AGGREGATE: &str = r#"
typedef unsigned char u8;
typedef unsigned short u16;
typedef unsigned int u32;
typedef unsigned long long u64;
struct AggEntry {
    u64 src;
    u32 offset;
    int size;
};
extern "C" __global__ void aggregate(u8 *dst_base, const AggEntry *agg, u32 n) {
    u32 i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n)
        return;
    AggEntry e = agg[i];
    u8 *dst = dst_base + e.offset;
    switch (e.size) {
        case 1: *(u8 *) dst = (u8) e.src; break;
        case 2: *(u16 *) dst = (u16) e.src; break;
        case 4: *(u32 *) dst = (u32) e.src; break;
        case 8: *(u64 *) dst = (u64) e.src; break;
        case -1: *(u8 *) dst = *(const u8 *) e.src; break;
        case -2: *(u16 *) dst = *(const u16 *) e.src; break;
        case -4: *(u32 *) dst = *(const u32 *) e.src; break;
        case -8: *(u64 *) dst = *(const u64 *) e.src; break;
        default: break;
    }
}
"#;
