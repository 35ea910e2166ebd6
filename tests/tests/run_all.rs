//! Hosted entry point for the suite runner: runs the registry from a
//! normal process via `cargo test`.

use vport_lib::klog_register_backend;
use vport_tests::{TestRunSummary, tests_run_all};

fn stdout_backend(args: core::fmt::Arguments<'_>) {
    println!("{args}");
}

#[test]
fn run_all_suites() {
    // IrqMutex executes cli/sti; grant I/O privilege so the suite can run
    // in userspace (requires root).
    let rc = unsafe { libc::iopl(3) };
    assert_eq!(rc, 0, "iopl(3) failed; the suite runner must run as root");

    // Route klog away from the COM1 port fallback.
    klog_register_backend(stdout_backend);

    let mut summary = TestRunSummary::default();
    let status = tests_run_all(&mut summary);
    assert_eq!(
        status, 0,
        "{} of {} tests failed",
        summary.failed, summary.total_tests
    );
}
