use thiserror::Error;

/// Faults surfaced to the caller.
///
/// Internal invariant breaches (a scheduled variable without a statement, a
/// dirty variable reaching assembly, ...) are not representable here: they
/// panic, since the graph can no longer be trusted.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller violated a documented contract (inconsistent loop sizes,
    /// invalid element size, zero bucket count, ...). Nothing was mutated.
    #[error("{0}")]
    InvalidInput(String),

    /// No kernel specialization exists for the requested type/op pair, or a
    /// backend feature (e.g. OptiX compilation) is not available.
    #[error("{0}")]
    BackendCapability(String),

    /// The CUDA driver rejected an operation.
    #[error("driver error: {0}")]
    Driver(#[from] cudarc::driver::DriverError),

    /// nvrtc failed to compile a builtin kernel.
    #[error("compile error: {0}")]
    Compile(#[from] cudarc::nvrtc::CompileError),

    /// Disk cache I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable fault at the offending call site.
macro_rules! raise {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::InvalidInput(format!($($arg)*)))
    };
}

pub(crate) use raise;
