//! The exported functions share one global state: everything is checked in a single test.

use std::ffi::{c_char, CStr};

use rapl_lib::ffi::{
    begin_session, end_session, rapl_get_result, rapl_last_error_message, rapl_last_status, rapl_result_count,
    start_rapl, stop_rapl, RaplResult, STATUS_INVALID_ARGUMENT, STATUS_OK,
};
use rapl_lib::SamplingError;

fn last_error_message() -> String {
    let mut buf = [0 as c_char; 512];
    let len = unsafe { rapl_last_error_message(buf.as_mut_ptr(), buf.len()) };
    let msg = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned();
    assert_eq!(len, msg.len());
    msg
}

#[test]
fn ffi_contract() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("RAPL_LIB_OUTPUT", "csv");
    std::env::set_var("RAPL_LIB_CSV_PATH", dir.path().join("ffi.csv"));
    let not_active = SamplingError::NotActive.status_code();

    // stop before any start
    stop_rapl();
    assert_eq!(rapl_last_status(), not_active);
    assert_eq!(rapl_result_count(), 0);
    assert!(!last_error_message().is_empty());

    let mut out = RaplResult::default();
    assert_eq!(unsafe { rapl_get_result(0, &mut out) }, STATUS_INVALID_ARGUMENT);
    assert_eq!(unsafe { rapl_get_result(0, std::ptr::null_mut()) }, STATUS_INVALID_ARGUMENT);
    assert_eq!(unsafe { rapl_last_error_message(std::ptr::null_mut(), 0) }, last_error_message().len());

    let status = start_rapl();
    assert_eq!(status, rapl_last_status());

    if status == STATUS_OK {
        // RAPL is readable on this machine
        assert_eq!(begin_session(), SamplingError::AlreadyActive.status_code());
        assert_eq!(rapl_last_status(), SamplingError::AlreadyActive.status_code());

        end_session();
        assert_eq!(rapl_last_status(), STATUS_OK);
        assert_eq!(last_error_message(), "");
        let count = rapl_result_count();
        assert!(count >= 1);
        assert_eq!(unsafe { rapl_get_result(0, &mut out) }, STATUS_OK);
        assert_eq!(out.domain, 0); // package, the default domain
        assert_eq!(unsafe { rapl_get_result(count, &mut out) }, STATUS_INVALID_ARGUMENT);

        let csv = std::fs::read_to_string(dir.path().join("ffi.csv")).unwrap();
        assert!(csv.starts_with("domain,socket,energy_uj,duration_us,wrapped\n"));
        assert_eq!(csv.lines().count(), 1 + count as usize);
    } else {
        // no RAPL here, or not enough privileges: the failure is observable
        assert!(!last_error_message().is_empty());
        assert_eq!(rapl_result_count(), 0);

        // the bracket was never opened
        stop_rapl();
        assert_eq!(rapl_last_status(), not_active);
        assert_eq!(rapl_result_count(), 0);
    }

    // the library stays usable for the next bracket
    let again = start_rapl();
    assert_eq!(again, rapl_last_status());
    if status == STATUS_OK {
        assert_eq!(again, STATUS_OK);
    }
    if again == STATUS_OK {
        stop_rapl();
        assert_eq!(rapl_last_status(), STATUS_OK);
    }
}
