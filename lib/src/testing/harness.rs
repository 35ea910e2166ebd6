// Test harness types: TestSuiteResult, TestSuiteDesc, TestRunSummary.
// Suites are declared with define_test_suite! and collected into a static
// slice by the tests crate.

/// Maximum number of test suites a summary can hold.
pub const HARNESS_MAX_SUITES: usize = 16;

/// Result of executing a single test suite.
#[derive(Clone, Copy)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl Default for TestSuiteResult {
    fn default() -> Self {
        Self {
            name: "",
            total: 0,
            passed: 0,
            failed: 0,
        }
    }
}

impl TestSuiteResult {
    /// Fill in results from a (passed, total) pair.
    pub fn fill(&mut self, passed: u32, total: u32) {
        self.total = total;
        self.passed = passed;
        self.failed = total.saturating_sub(passed);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

pub type SuiteRunnerFn = fn(&mut TestSuiteResult) -> i32;

#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: &'static str,
    pub run: Option<SuiteRunnerFn>,
}

/// Aggregated results from running all test suites.
#[derive(Clone, Copy)]
pub struct TestRunSummary {
    pub suites: [TestSuiteResult; HARNESS_MAX_SUITES],
    pub suite_count: usize,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
}

impl Default for TestRunSummary {
    fn default() -> Self {
        Self {
            suites: [TestSuiteResult::default(); HARNESS_MAX_SUITES],
            suite_count: 0,
            total_tests: 0,
            passed: 0,
            failed: 0,
        }
    }
}

impl TestRunSummary {
    /// Add results from a single suite to the summary.
    pub fn add_suite_result(&mut self, result: &TestSuiteResult) {
        if self.suite_count < HARNESS_MAX_SUITES {
            self.suites[self.suite_count] = *result;
            self.suite_count += 1;
        }
        self.total_tests = self.total_tests.saturating_add(result.total);
        self.passed = self.passed.saturating_add(result.passed);
        self.failed = self.failed.saturating_add(result.failed);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}
