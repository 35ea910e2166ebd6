use super::TestResult;
use crate::{klog_debug, klog_error, klog_info};

/// Run one test function and log the outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => klog_debug!("TEST PASS: {}", name),
        TestResult::Fail => klog_error!("TEST FAIL: {}", name),
        TestResult::Skipped => klog_info!("TEST SKIP: {}", name),
    }
    result
}
