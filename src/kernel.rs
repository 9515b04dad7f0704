//! Compiled-kernel cache and kernel history.
//!
//! Cache entries are keyed by the 128-bit content hash of the kernel text
//! combined with the device id and backend flags. A miss first consults the
//! disk cache (keyed by the same hash); only a secondary miss pays for
//! compilation. File layout per entry: source text, a fixed header, the
//! compiled payload, and an xxh3-64 checksum trailer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::{
    sys::{self, CUevent},
    CudaContext, CudaFunction, CudaModule, CudaStream,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::backend::cpu::Task;
use crate::error::Result;
use crate::types::{Backend, KernelType};
use crate::vm::CpuProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub hash: u128,
    pub device: i32,
    pub flags: u64,
}

#[derive(Clone)]
pub enum KernelData {
    Cuda {
        _module: Arc<CudaModule>,
        func: CudaFunction,
        /// Occupancy-preferred block size, queried once at install time.
        block_size: u32,
    },
    Cpu {
        program: Arc<CpuProgram>,
    },
}

#[derive(Clone)]
pub struct Kernel {
    pub data: KernelData,
    /// Compiled payload size in bytes (for logging and the disk header).
    pub size: usize,
}

#[derive(Default)]
pub struct KernelCache {
    map: FxHashMap<KernelKey, Kernel>,
    pub hits: u64,
    pub soft_misses: u64,
    pub hard_misses: u64,
    pub launches: u64,
    cache_dir: Option<PathBuf>,
    cache_dir_resolved: bool,
}

impl KernelCache {
    pub fn lookup(&mut self, key: &KernelKey) -> Option<Kernel> {
        self.map.get(key).cloned()
    }

    pub fn insert(&mut self, key: KernelKey, kernel: Kernel) {
        self.map.insert(key, kernel);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn set_cache_dir(&mut self, dir: Option<PathBuf>) {
        self.cache_dir = dir;
        self.cache_dir_resolved = true;
    }

    pub fn cache_dir(&mut self) -> Option<PathBuf> {
        if !self.cache_dir_resolved {
            self.cache_dir = default_cache_dir();
            self.cache_dir_resolved = true;
        }
        self.cache_dir.clone()
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("SMELT_CACHE_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".smelt"))
}

const FILE_MAGIC: u32 = 0x736d_6c74; // "smlt"
const FILE_VERSION: u32 = 1;

fn entry_path(dir: &Path, backend: Backend, hash: u128) -> PathBuf {
    let tag = match backend {
        Backend::Cuda => "cuda",
        Backend::Cpu => "cpu",
    };
    dir.join(format!("{tag}-{hash:032x}.kernel"))
}

/// Serialize one cache entry.
pub fn kernel_write(
    dir: &Path,
    source: &str,
    backend: Backend,
    hash: u128,
    payload: &[u8],
    block_size: u32,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut buf = Vec::with_capacity(source.len() + payload.len() + 64);
    buf.extend_from_slice(&FILE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
    buf.extend_from_slice(&hash.to_le_bytes());
    buf.push(match backend {
        Backend::Cuda => 1,
        Backend::Cpu => 0,
    });
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&block_size.to_le_bytes());
    buf.extend_from_slice(&(source.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(source.as_bytes());
    buf.extend_from_slice(payload);
    let checksum = xxh3_64(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());

    // Write-then-rename so a concurrent reader never sees a torn entry.
    let path = entry_path(dir, backend, hash);
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, &path)?;
    debug!(?path, bytes = buf.len(), "kernel cache write");
    Ok(())
}

/// Load a previously compiled payload, verifying the checksum and header.
pub fn kernel_load(dir: &Path, backend: Backend, hash: u128) -> Option<(Vec<u8>, u32)> {
    let path = entry_path(dir, backend, hash);
    let bytes = std::fs::read(&path).ok()?;
    if bytes.len() < 48 + 8 {
        return None;
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 8);
    let checksum = u64::from_le_bytes(trailer.try_into().ok()?);
    if xxh3_64(body) != checksum {
        warn!(?path, "kernel cache entry failed checksum, ignoring");
        return None;
    }
    if u32::from_le_bytes(body[0..4].try_into().ok()?) != FILE_MAGIC
        || u32::from_le_bytes(body[4..8].try_into().ok()?) != FILE_VERSION
    {
        return None;
    }
    if u128::from_le_bytes(body[8..24].try_into().ok()?) != hash {
        return None;
    }
    let block_size = u32::from_le_bytes(body[28..32].try_into().ok()?);
    let source_len = u64::from_le_bytes(body[32..40].try_into().ok()?) as usize;
    let payload_len = u64::from_le_bytes(body[40..48].try_into().ok()?) as usize;
    if body.len() != 48 + source_len + payload_len {
        return None;
    }
    let payload = body[48 + source_len..].to_vec();
    Some((payload, block_size))
}

// ====================================================================
// Kernel history
// ====================================================================

/// Begin/end timing events for one GPU launch.
pub struct EventPair {
    ctx: Arc<CudaContext>,
    start: CUevent,
    end: CUevent,
}

// Events are only queried/destroyed with their context bound.
unsafe impl Send for EventPair {}

impl EventPair {
    pub fn new(ctx: Arc<CudaContext>) -> Result<EventPair> {
        ctx.bind_to_thread()?;
        let mut start = std::mem::MaybeUninit::uninit();
        let mut end = std::mem::MaybeUninit::uninit();
        unsafe {
            sys::cuEventCreate(
                start.as_mut_ptr(),
                sys::CUevent_flags::CU_EVENT_DEFAULT as u32,
            )
            .result()?;
            sys::cuEventCreate(end.as_mut_ptr(), sys::CUevent_flags::CU_EVENT_DEFAULT as u32)
                .result()?;
        }
        Ok(EventPair {
            ctx,
            start: unsafe { start.assume_init() },
            end: unsafe { end.assume_init() },
        })
    }

    pub fn record_start(&self, stream: &CudaStream) -> Result<()> {
        unsafe { sys::cuEventRecord(self.start, stream.cu_stream()).result()? };
        Ok(())
    }

    pub fn record_end(&self, stream: &CudaStream) -> Result<()> {
        unsafe { sys::cuEventRecord(self.end, stream.cu_stream()).result()? };
        Ok(())
    }

    /// Elapsed kernel time; synchronizes on the end event.
    pub fn elapsed_ms(&self) -> Result<f32> {
        self.ctx.bind_to_thread()?;
        let mut ms = 0.0f32;
        unsafe {
            sys::cuEventSynchronize(self.end).result()?;
            sys::cuEventElapsedTime(&mut ms, self.start, self.end).result()?;
        }
        Ok(ms)
    }
}

impl Drop for EventPair {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        unsafe {
            let _ = sys::cuEventDestroy_v2(self.start);
            let _ = sys::cuEventDestroy_v2(self.end);
        }
    }
}

pub enum HistoryTiming {
    CudaEvents(EventPair),
    /// Retained task handle; `is_done` doubles as a completion probe.
    Task(Task),
}

pub struct KernelHistoryEntry {
    pub backend: Backend,
    pub kernel_type: KernelType,
    /// Content hash for JIT kernels, zero for builtin launches.
    pub hash: u128,
    pub size: u32,
    pub input_count: u32,
    pub output_count: u32,
    pub timing: HistoryTiming,
}
