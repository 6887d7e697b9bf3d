// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test and suite results.
//!
//! A [`TestResult`] is created once per completed attempt; a [`SuiteResult`]
//! is sealed when the suite completes and aggregates its tests' counters.

use crate::{
    manifest::{Suite, Test},
    sut::HostInfo,
};
use regex::Regex;
use std::{sync::LazyLock, time::Duration};

static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Summary:\npassed\s*(?P<passed>\d+)\nfailed\s*(?P<failed>\d+)\nbroken\s*(?P<broken>\d+)\nskipped\s*(?P<skipped>\d+)\nwarnings\s*(?P<warnings>\d+)\n",
    )
    .expect("summary regex is valid")
});

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]+[a-zA-Z]").expect("ansi regex is valid"));

/// Results of a single test execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResult {
    /// The executed test.
    pub test: Test,
    /// Number of TPASS.
    pub passed: u64,
    /// Number of TFAIL.
    pub failed: u64,
    /// Number of TBROK.
    pub broken: u64,
    /// Number of TSKIP.
    pub skipped: u64,
    /// Number of TWARN.
    pub warnings: u64,
    /// Execution time of the test.
    pub exec_time: Duration,
    /// Return code of the executed command.
    pub retcode: i32,
    /// Captured stdout, decoded with UTF-8 replacement.
    pub stdout: String,
}

impl TestResult {
    /// Builds a result from a command execution.
    ///
    /// Counters come from the canonical LTP summary block when present,
    /// falling back to counting `TPASS`/`TFAIL`/`TSKIP`/`TBROK`/`TWARN`
    /// occurrences, and finally to inferring a single outcome from the
    /// return code (0 pass, 4 warn, 32 skip, else fail). With `error` set
    /// the test is additionally marked broken.
    pub fn from_output(
        test: &Test,
        stdout: &str,
        retcode: i32,
        exec_time: Duration,
        error: bool,
    ) -> Self {
        let stdout = ANSI_RE.replace_all(stdout, "").into_owned();

        let (passed, failed, mut broken, skipped, warnings) =
            if let Some(caps) = SUMMARY_RE.captures(&stdout) {
                (
                    parse_counter(&caps, "passed"),
                    parse_counter(&caps, "failed"),
                    parse_counter(&caps, "broken"),
                    parse_counter(&caps, "skipped"),
                    parse_counter(&caps, "warnings"),
                )
            } else {
                let mut passed = stdout.matches("TPASS").count() as u64;
                let mut failed = stdout.matches("TFAIL").count() as u64;
                let mut skipped = stdout.matches("TSKIP").count() as u64;
                let broken = stdout.matches("TBROK").count() as u64;
                let mut warnings = stdout.matches("TWARN").count() as u64;

                if passed == 0 && failed == 0 && skipped == 0 && broken == 0 && warnings == 0 {
                    // no results in stdout: probably an old test implementation
                    // that only reports through its return code
                    match retcode {
                        0 => passed = 1,
                        4 => warnings = 1,
                        32 => skipped = 1,
                        _ if !error => failed = 1,
                        _ => {}
                    }
                }

                (passed, failed, broken, skipped, warnings)
            };

        if error {
            broken = 1;
        }

        TestResult {
            test: test.clone(),
            passed,
            failed,
            broken,
            skipped,
            warnings,
            exec_time,
            retcode,
            stdout,
        }
    }
}

/// Results of a whole testing suite, sealed once the suite completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuiteResult {
    /// The executed suite.
    pub suite: Suite,
    /// Per-test results, in completion order.
    pub tests: Vec<TestResult>,
    /// Host information collected from the SUT.
    pub host: HostInfo,
    /// Total execution time, summed over every scheduler pass.
    pub exec_time: Duration,
}

impl SuiteResult {
    /// Total number of TPASS across all tests.
    pub fn passed(&self) -> u64 {
        self.tests.iter().map(|t| t.passed).sum()
    }

    /// Total number of TFAIL across all tests.
    pub fn failed(&self) -> u64 {
        self.tests.iter().map(|t| t.failed).sum()
    }

    /// Total number of TBROK across all tests.
    pub fn broken(&self) -> u64 {
        self.tests.iter().map(|t| t.broken).sum()
    }

    /// Total number of TSKIP across all tests.
    pub fn skipped(&self) -> u64 {
        self.tests.iter().map(|t| t.skipped).sum()
    }

    /// Total number of TWARN across all tests.
    pub fn warnings(&self) -> u64 {
        self.tests.iter().map(|t| t.warnings).sum()
    }
}

fn parse_counter(caps: &regex::Captures<'_>, name: &str) -> u64 {
    caps.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_def(name: &str) -> Test {
        Test {
            name: name.into(),
            command: "mybin".into(),
            arguments: vec![],
            parallelizable: false,
        }
    }

    #[test]
    fn counters_from_summary_block() {
        let stdout = "some output\n\
            Summary:\n\
            passed   2\n\
            failed   1\n\
            broken   0\n\
            skipped  3\n\
            warnings 4\n";

        let res =
            TestResult::from_output(&test_def("t"), stdout, 0, Duration::from_secs(1), false);
        assert_eq!(
            (res.passed, res.failed, res.broken, res.skipped, res.warnings),
            (2, 1, 0, 3, 4)
        );
    }

    #[test]
    fn counters_from_markers() {
        let stdout = "t 1 TPASS: ok\nt 2 TPASS: ok\nt 3 TFAIL: bad\nt 4 TSKIP: skip\n";
        let res =
            TestResult::from_output(&test_def("t"), stdout, 0, Duration::from_secs(1), false);
        assert_eq!(
            (res.passed, res.failed, res.broken, res.skipped, res.warnings),
            (2, 1, 0, 1, 0)
        );
    }

    #[test]
    fn counters_from_return_code() {
        for (retcode, expected) in [
            (0, (1, 0, 0, 0, 0)),
            (4, (0, 0, 0, 0, 1)),
            (32, (0, 0, 0, 1, 0)),
            (2, (0, 1, 0, 0, 0)),
        ] {
            let res = TestResult::from_output(
                &test_def("t"),
                "no markers here",
                retcode,
                Duration::ZERO,
                false,
            );
            assert_eq!(
                (res.passed, res.failed, res.broken, res.skipped, res.warnings),
                expected,
                "retcode {retcode}"
            );
        }
    }

    #[test]
    fn error_marks_broken() {
        let res = TestResult::from_output(&test_def("t"), "", -1, Duration::ZERO, true);
        assert_eq!(res.broken, 1);
        assert_eq!(res.failed, 0);
        assert_eq!(res.retcode, -1);
    }

    #[test]
    fn ansi_escapes_are_stripped() {
        let stdout = "t 1 \x1b[1;32mTPASS\x1b[0m: ok\n";
        let res = TestResult::from_output(&test_def("t"), stdout, 0, Duration::ZERO, false);
        assert_eq!(res.passed, 1);
        assert!(!res.stdout.contains('\x1b'));
    }

    #[test]
    fn suite_counters_aggregate() {
        let suite = Suite {
            name: "s".into(),
            tests: vec![test_def("a"), test_def("b")],
        };
        let tests = vec![
            TestResult::from_output(&test_def("a"), "TPASS\nTPASS\n", 0, Duration::ZERO, false),
            TestResult::from_output(&test_def("b"), "TFAIL\n", 1, Duration::ZERO, false),
        ];
        let res = SuiteResult {
            suite,
            tests,
            host: HostInfo::default(),
            exec_time: Duration::from_secs(3),
        };

        assert_eq!(res.passed(), 2);
        assert_eq!(res.failed(), 1);
        assert_eq!(res.broken(), 0);
    }
}
