//! Fatal-path tests: double free and free of a non-allocated pointer.
//!
//! Both conditions abort the process, so each scenario runs in a
//! subprocess: we re-exec the test binary with a scenario env var, then
//! assert that the child died abnormally and printed the expected
//! diagnostic on stderr.

use shadowmalloc::api;
use shadowmalloc::trace::StackTrace;

fn test_trace() -> StackTrace {
    StackTrace::from_pcs(&[0x1001, 0x2002])
}

/// Run the current test binary with `SHADOWMALLOC_SCENARIO` set and check
/// that it aborts with `expected_msg` on stderr.
fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let output = std::process::Command::new(&exe)
        .env("SHADOWMALLOC_SCENARIO", scenario_name)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess");

    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have aborted, but exited \
         successfully. stderr:\n{}",
        scenario_name,
        stderr
    );
    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. \
         Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

/// When the scenario env var is set, run the requested scenario (which
/// aborts) instead of asserting anything.
#[test]
fn scenario_driver() {
    let scenario = match std::env::var("SHADOWMALLOC_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation.
    };

    match scenario.as_str() {
        "double_free" => scenario_double_free(),
        "free_unallocated" => scenario_free_unallocated(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

fn scenario_double_free() {
    unsafe {
        let p = api::malloc(16, &test_trace());
        assert!(!p.is_null());
        api::free(p, &test_trace());
        // Second free must report and abort.
        api::free(p, &test_trace());
    }
    unreachable!("double free did not abort");
}

fn scenario_free_unallocated() {
    // A zeroed, suitably aligned stack buffer: the header window before
    // the "pointer" reads as state 0, which is no valid chunk state.
    let mut buf = [0u64; 64];
    unsafe {
        let p = (buf.as_mut_ptr() as *mut u8).add(256);
        api::free(p, &test_trace());
    }
    unreachable!("invalid free did not abort");
}

#[test]
fn double_free_aborts_with_both_traces() {
    expect_abort_subprocess("double_free", "attempting double-free");
}

#[test]
fn double_free_report_describes_the_region() {
    // The double-free diagnostic includes the region description with the
    // original free trace attached.
    expect_abort_subprocess("double_free", "freed by thread");
}

#[test]
fn free_of_unallocated_pointer_aborts() {
    expect_abort_subprocess("free_unallocated", "not malloc()-ed");
}
