use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

mod cache;
mod cuda;
mod loops;
mod primitives;
mod trace;

static GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
static CACHE_DIR: Lazy<tempfile::TempDir> =
    Lazy::new(|| tempfile::tempdir().expect("test cache dir"));

/// Tests share global runtime state (flags, caches, counters), so they run
/// one at a time and point the disk cache at a scratch directory. Set
/// `SMELT_LOG` to get tracing output from a test run.
pub(crate) fn setup() -> MutexGuard<'static, ()> {
    static LOGGING: std::sync::Once = std::sync::Once::new();
    LOGGING.call_once(|| {
        if let Ok(filter) = std::env::var("SMELT_LOG") {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        }
    });
    let guard = GUARD.lock().unwrap_or_else(|e| e.into_inner());
    crate::set_kernel_cache_dir(Some(CACHE_DIR.path().to_path_buf()));
    crate::set_flag(crate::JitFlag::LaunchBlocking, false);
    crate::set_flag(crate::JitFlag::KernelHistory, false);
    crate::set_flag(crate::JitFlag::PrintIR, false);
    guard
}
