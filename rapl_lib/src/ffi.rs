//! The C ABI of the library.
//!
//! Harnesses load `librapl_lib.so` (or `rapl_lib.dll`) and call `start_rapl` and `stop_rapl`
//! around each run of the workload. `start_rapl` returns a status code, `stop_rapl` returns
//! nothing: the measurements are retrieved with `rapl_result_count` and `rapl_get_result`,
//! and are also written by the configured output (a CSV file by default).
//!
//! Status codes: 0 is a success, see [`SamplingError::status_code`] for the others,
//! [`STATUS_PANIC`] if the library panicked and [`STATUS_INVALID_ARGUMENT`] for a bad
//! argument to `rapl_get_result`.

use std::{
    ffi::c_char,
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::warn;
use rapl_probes::SamplingError;

use crate::{
    config::Config,
    output::ResultSink,
    sampling::{self, SamplingCore},
    session::MeasurementResult,
};

pub const STATUS_OK: i32 = 0;
pub const STATUS_PANIC: i32 = 8;
pub const STATUS_INVALID_ARGUMENT: i32 = 9;

/// One measurement, as seen from C.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RaplResult {
    pub socket: u32,
    /// Index of the domain: 0 = package, 1 = pp0, 2 = pp1, 3 = dram, 4 = platform
    pub domain: u32,
    pub energy_uj: u64,
    pub duration_us: u64,
    /// 1 if the counter has wrapped around during the session
    pub wrapped: u8,
}

/// State shared by all the entry points.
struct Global {
    /// Created by the first call to `begin_session`
    core: Option<SamplingCore>,
    /// Fatal error raised while creating the core, returned without retrying
    fatal_error: Option<SamplingError>,
    /// Last error that occured while there was no core to record it
    early_error: Option<SamplingError>,
}

static GLOBAL: Mutex<Global> = Mutex::new(Global {
    core: None,
    fatal_error: None,
    early_error: None,
});

/// Where the results go, locked separately so that the output I/O never blocks a transition.
static SINK: Mutex<Option<ResultSink>> = Mutex::new(None);

impl Global {
    fn begin(&mut self) -> Result<(), SamplingError> {
        if let Some(core) = self.core.as_mut() {
            return core.begin_session();
        }

        // fatal errors will occur again, don't try to rebuild the core every time
        if let Some(err) = &self.fatal_error {
            self.early_error = Some(err.clone());
            return Err(err.clone());
        }
        init_logger();
        match Config::from_env().and_then(|config| sampling::open(&config)) {
            Ok((core, sink)) => {
                *lock(&SINK) = Some(sink);
                self.early_error = None;
                self.core.insert(core).begin_session()
            }
            Err(e) => {
                warn!("Failed to initialize the RAPL sampling core: {e}");
                if e.is_fatal() {
                    self.fatal_error = Some(e.clone());
                }
                self.early_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Ends the session and returns a copy of its results, empty if it failed.
    fn end(&mut self) -> Vec<MeasurementResult> {
        match self.core.as_mut() {
            Some(core) => core.end_session().map(<[_]>::to_vec).unwrap_or_default(),
            None => {
                warn!("{}", SamplingError::NotActive);
                self.early_error = Some(SamplingError::NotActive);
                Vec::new()
            }
        }
    }

    fn last_error(&self) -> Option<&SamplingError> {
        match &self.core {
            Some(core) => core.last_error(),
            None => self.early_error.as_ref(),
        }
    }
}

fn init_logger() {
    let env = env_logger::Env::new().filter_or(crate::config::ENV_LOG, "warn");
    // the host process may already have a logger
    let _ = env_logger::Builder::from_env(env).try_init();
}

fn lock<T>(mutex: &'static Mutex<T>) -> MutexGuard<'static, T> {
    // the state is consistent between two calls, even if one of them panicked
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn global() -> MutexGuard<'static, Global> {
    lock(&GLOBAL)
}

fn write_results(results: &[MeasurementResult]) {
    if results.is_empty() {
        return;
    }
    if let Some(sink) = lock(&SINK).as_mut() {
        if let Err(e) = sink.write(results) {
            warn!("Failed to write the measurements: {e}");
        }
    }
}

/// Runs `f` without letting a panic cross the FFI boundary.
fn guarded<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(on_panic)
}

fn status_of(res: Result<(), SamplingError>) -> i32 {
    match res {
        Ok(()) => STATUS_OK,
        Err(e) => e.status_code(),
    }
}

/// Starts a measurement session. Returns 0 on success, a non-zero status code otherwise.
#[no_mangle]
pub extern "C" fn begin_session() -> i32 {
    guarded(STATUS_PANIC, || status_of(global().begin()))
}

/// Ends the current measurement session.
#[no_mangle]
pub extern "C" fn end_session() {
    guarded((), || {
        // the bracket is closed and the global state released before any output
        let results = global().end();
        write_results(&results);
    })
}

/// Same as [`begin_session`], under the name used by the existing harnesses.
#[no_mangle]
pub extern "C" fn start_rapl() -> i32 {
    begin_session()
}

/// Same as [`end_session`], under the name used by the existing harnesses.
#[no_mangle]
pub extern "C" fn stop_rapl() {
    end_session()
}

/// Status code of the last call to `begin_session` or `end_session`.
#[no_mangle]
pub extern "C" fn rapl_last_status() -> i32 {
    guarded(STATUS_PANIC, || global().last_error().map_or(STATUS_OK, SamplingError::status_code))
}

/// Number of results of the last session, 0 if it failed.
#[no_mangle]
pub extern "C" fn rapl_result_count() -> u32 {
    guarded(0, || {
        global()
            .core
            .as_ref()
            .map_or(0, |core| core.last_results().len() as u32)
    })
}

/// Copies the result number `index` of the last session into `out`.
/// Returns 0 on success, [`STATUS_INVALID_ARGUMENT`] if there is no such result or `out` is null.
///
/// # Safety
///
/// `out` must be null or point to a valid, writable `RaplResult`.
#[no_mangle]
pub unsafe extern "C" fn rapl_get_result(index: u32, out: *mut RaplResult) -> i32 {
    if out.is_null() {
        return STATUS_INVALID_ARGUMENT;
    }
    let res = guarded(None, || {
        let global = global();
        let core = global.core.as_ref()?;
        let r = core.last_results().get(index as usize)?;
        Some(RaplResult {
            socket: r.domain.socket,
            domain: r.domain.domain as u32,
            energy_uj: r.energy_uj,
            duration_us: r.duration_us(),
            wrapped: r.wrapped as u8,
        })
    });
    match res {
        Some(r) => {
            // Safety: checked non-null above, validity is up to the caller
            unsafe { out.write(r) };
            STATUS_OK
        }
        None => STATUS_INVALID_ARGUMENT,
    }
}

/// Writes the message of the last error, NUL-terminated, into `buf` (truncated to `len` bytes).
/// Returns the length of the full message without the NUL byte, 0 if there was no error.
///
/// # Safety
///
/// `buf` must be null or point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn rapl_last_error_message(buf: *mut c_char, len: usize) -> usize {
    let msg = guarded(String::from("panic in the RAPL library"), || {
        global().last_error().map(|e| e.to_string()).unwrap_or_default()
    });
    if !buf.is_null() && len > 0 {
        let n = msg.len().min(len - 1);
        // Safety: the caller guarantees that buf has at least len bytes, and n < len
        unsafe {
            std::ptr::copy_nonoverlapping(msg.as_ptr() as *const c_char, buf, n);
            buf.add(n).write(0);
        }
    }
    msg.len()
}

#[cfg(test)]
mod tests {
    use std::ffi::{c_char, CStr};

    use rapl_probes::{synthetic::SyntheticSource, DomainId, RaplDomainType, SamplingError};

    use super::*;

    #[test]
    fn test_results_through_the_abi() {
        // the unit tests of this crate never go through the lazy initialization
        let pkg = DomainId::package(0);
        let dram = DomainId::new(1, RaplDomainType::Dram);
        let mut src = SyntheticSource::new(&[pkg, dram], 100, 5, 1_000);
        src.script(dram, [996, 3]); // wraps: (1000 - 996) + 3 + 1 = 8 units
        global().core = Some(SamplingCore::new(Box::new(src)));

        assert_eq!(start_rapl(), STATUS_OK);
        stop_rapl();
        assert_eq!(rapl_last_status(), STATUS_OK);
        assert_eq!(rapl_result_count(), 2);

        let mut out = RaplResult::default();
        assert_eq!(unsafe { rapl_get_result(0, &mut out) }, STATUS_OK);
        assert_eq!((out.socket, out.domain, out.energy_uj, out.wrapped), (0, 0, 5, 0));
        assert_eq!(unsafe { rapl_get_result(1, &mut out) }, STATUS_OK);
        assert_eq!((out.socket, out.domain, out.energy_uj, out.wrapped), (1, 3, 8, 1));

        assert_eq!(unsafe { rapl_get_result(2, &mut out) }, STATUS_INVALID_ARGUMENT);
        assert_eq!(unsafe { rapl_get_result(0, std::ptr::null_mut()) }, STATUS_INVALID_ARGUMENT);
        assert_eq!(out.socket, 1, "a failed call must not touch the output");

        // no active session anymore
        stop_rapl();
        let not_active = SamplingError::NotActive;
        assert_eq!(rapl_last_status(), not_active.status_code());
        assert_eq!(rapl_result_count(), 0);

        let full_len = not_active.to_string().len();
        let mut buf = [0x7f as c_char; 4];
        let len = unsafe { rapl_last_error_message(buf.as_mut_ptr(), buf.len()) };
        assert_eq!(len, full_len);
        let truncated = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(truncated.to_str().unwrap(), &not_active.to_string()[..3]);

        let mut big = [0 as c_char; 64];
        let len = unsafe { rapl_last_error_message(big.as_mut_ptr(), big.len()) };
        assert_eq!(len, full_len);
        assert_eq!(unsafe { CStr::from_ptr(big.as_ptr()) }.to_str().unwrap(), not_active.to_string());
    }
}
