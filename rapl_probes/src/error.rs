use std::io;

use thiserror::Error;

use crate::DomainId;

/// Everything that can go wrong while sampling the energy counters.
///
/// `Unsupported`, `PermissionDenied` and `Config` are fatal: reissuing the
/// bracket will not help. `Unavailable` and `CounterAnomaly` only invalidate
/// the current measurement window.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplingError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("counter unavailable: {0}")]
    Unavailable(String),
    #[error("a measurement session is already active")]
    AlreadyActive,
    #[error("no measurement session is active")]
    NotActive,
    #[error("implausible counter values for {domain}: start {start}, end {end}")]
    CounterAnomaly { domain: DomainId, start: u64, end: u64 },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SamplingError {
    /// Classifies an I/O error raised while opening or reading a counter interface.
    pub fn from_io(err: &io::Error, context: impl std::fmt::Display) -> SamplingError {
        let msg = format!("{context}: {err}");
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::Unsupported => SamplingError::Unsupported(msg),
            io::ErrorKind::PermissionDenied => SamplingError::PermissionDenied(msg),
            _ => match err.raw_os_error() {
                // EPERM, returned by perf_event_open when perf_event_paranoid forbids it
                Some(1) => SamplingError::PermissionDenied(msg),
                // ENODEV, ENOENT, EOPNOTSUPP
                Some(2) | Some(19) | Some(95) => SamplingError::Unsupported(msg),
                _ => SamplingError::Unavailable(msg),
            },
        }
    }

    /// Classifies an error coming out of the discovery functions, which use `anyhow`.
    pub fn from_discovery(err: anyhow::Error) -> SamplingError {
        match err.chain().find_map(|cause| cause.downcast_ref::<io::Error>()) {
            Some(io_err) => SamplingError::from_io(io_err, format!("{err:#}")),
            None => SamplingError::Unsupported(format!("{err:#}")),
        }
    }

    /// Status code reported through the foreign-function boundary. Zero is reserved for success.
    pub fn status_code(&self) -> i32 {
        match self {
            SamplingError::Unsupported(_) => 1,
            SamplingError::PermissionDenied(_) => 2,
            SamplingError::Unavailable(_) => 3,
            SamplingError::AlreadyActive => 4,
            SamplingError::NotActive => 5,
            SamplingError::CounterAnomaly { .. } => 6,
            SamplingError::Config(_) => 7,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SamplingError::Unsupported(_) | SamplingError::PermissionDenied(_) | SamplingError::Config(_)
        )
    }
}
