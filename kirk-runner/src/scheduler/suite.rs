// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite scheduling.
//!
//! Iterates over suites serially, rebooting the SUT when a test run ends in
//! a catastrophic kernel state and replaying the tests that have no result
//! yet.

use crate::{
    errors::{SchedulerError, SutError},
    events::{Event, EventBus},
    manifest::{Suite, Test},
    results::{SuiteResult, TestResult},
    scheduler::{POISONED, SchedulerOptions, SutStdoutSink, TestScheduler},
    sut::Sut,
};
use regex::Regex;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::time::timeout;
use tracing::{debug, info};

/// Start attempts granted to the SUT after a catastrophic failure.
const RESTART_RETRIES: usize = 10;

/// Schedules testing suites, checking for kernel status and rebooting the
/// SUT when it misbehaves.
pub struct SuiteScheduler {
    sut: Arc<dyn Sut>,
    bus: EventBus,
    suite_timeout: Duration,
    skip_tests: Option<Regex>,
    scheduler: TestScheduler,
    results: Mutex<Vec<SuiteResult>>,
    stop: AtomicBool,
    lock: tokio::sync::Mutex<()>,
}

impl SuiteScheduler {
    /// Creates a scheduler running suites on `sut`.
    pub fn new(sut: Arc<dyn Sut>, bus: EventBus, options: &SchedulerOptions) -> Self {
        let scheduler = TestScheduler::new(sut.clone(), bus.clone(), options);

        SuiteScheduler {
            sut,
            bus,
            suite_timeout: options.suite_timeout,
            skip_tests: options.skip_tests.clone(),
            scheduler,
            results: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Results of the scheduled suites, reset at every
    /// [`schedule`](Self::schedule) call.
    pub fn results(&self) -> Vec<SuiteResult> {
        self.results.lock().expect(POISONED).clone()
    }

    /// Stops the suites execution and the inner test scheduler.
    pub async fn stop(&self) {
        // nothing to do unless a schedule is in flight
        if self.lock.try_lock().is_ok() {
            return;
        }

        info!("stopping suites execution");

        self.stop.store(true, Ordering::SeqCst);
        self.scheduler.stop().await;

        let _guard = self.lock.lock().await;

        self.stop.store(false, Ordering::SeqCst);

        info!("suites execution has stopped");
    }

    /// Schedules and executes a list of suites, serially.
    pub async fn schedule(&self, suites: &[Suite]) -> Result<(), SchedulerError> {
        if suites.is_empty() {
            return Err(SchedulerError::EmptyJobs);
        }

        let _guard = self.lock.lock().await;

        self.results.lock().expect(POISONED).clear();

        for suite in suites {
            self.run_suite(suite).await?;
        }

        Ok(())
    }

    /// Reboots the SUT after a catastrophic kernel state.
    async fn restart_sut(&self) -> Result<(), SutError> {
        info!("rebooting SUT");

        self.bus
            .fire(Event::SutRestart {
                sut: self.sut.name().to_string(),
            })
            .await;

        let sink = SutStdoutSink::new(self.bus.clone(), self.sut.name());

        self.scheduler.stop().await;
        self.sut.stop(&sink).await?;
        self.sut.ensure_start(&sink, RESTART_RETRIES).await?;

        info!("SUT rebooted");

        Ok(())
    }

    /// Runs a single testing suite and appends its sealed result.
    async fn run_suite(&self, suite: &Suite) -> Result<(), SchedulerError> {
        info!(suite = %suite.name, "running suite");

        self.bus
            .fire(Event::SuiteStarted {
                suite: suite.clone(),
            })
            .await;

        let tests: Vec<Test> = suite
            .tests
            .iter()
            .filter(|test| {
                let skipped = self
                    .skip_tests
                    .as_ref()
                    .is_some_and(|regex| regex.is_match(&test.name));
                if skipped {
                    info!(test = %test.name, "ignoring test");
                }

                !skipped
            })
            .cloned()
            .collect();

        let mut tests_results: Vec<TestResult> = Vec::new();
        let mut tests_left = tests.clone();
        let mut exec_time = Duration::ZERO;
        let mut timed_out = false;

        while !self.stop.load(Ordering::SeqCst) && !tests_left.is_empty() {
            let start = Instant::now();
            let pass = timeout(self.suite_timeout, self.scheduler.schedule(&tests_left)).await;
            exec_time += start.elapsed();

            match pass {
                Ok(Ok(())) => {
                    tests_results.extend(self.scheduler.results());
                }
                Ok(Err(err)) if err.is_kernel_error() => {
                    debug!(error = %err, "kernel error, restarting the SUT");
                    tests_results.extend(self.scheduler.results());
                    self.restart_sut().await?;
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    info!(suite = %suite.name, "testing suite timed out");

                    self.bus
                        .fire(Event::SuiteTimeout {
                            suite: suite.clone(),
                            timeout: self.suite_timeout,
                        })
                        .await;

                    tests_results.extend(self.scheduler.results());
                    timed_out = true;
                }
            }

            // replay whatever has no result yet
            tests_left = tests
                .iter()
                .filter(|test| {
                    !tests_results
                        .iter()
                        .any(|result| result.test.name == test.name)
                })
                .cloned()
                .collect();

            if timed_out {
                // whatever is left will never run
                for test in &tests_left {
                    tests_results.push(TestResult {
                        test: test.clone(),
                        passed: 0,
                        failed: 0,
                        broken: 0,
                        skipped: 1,
                        warnings: 0,
                        exec_time: Duration::ZERO,
                        retcode: 32,
                        stdout: String::new(),
                    });
                }

                break;
            }
        }

        let host = self.sut.info().await?;

        let results = SuiteResult {
            suite: suite.clone(),
            tests: tests_results,
            host,
            exec_time,
        };

        self.bus
            .fire(Event::SuiteCompleted {
                results: results.clone(),
            })
            .await;

        self.results.lock().expect(POISONED).push(results);

        info!(suite = %suite.name, "suite completed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sut::{NullSink, stub::{StubCommand, StubSut}};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    fn make_suite(name: &str, count: usize) -> Suite {
        Suite {
            name: name.to_string(),
            tests: (0..count)
                .map(|i| Test {
                    name: format!("test{i:02}"),
                    command: format!("cmd{i:02}"),
                    arguments: vec![],
                    parallelizable: false,
                })
                .collect(),
        }
    }

    async fn started_stub() -> Arc<StubSut> {
        let sut = Arc::new(StubSut::new());
        sut.start(&NullSink).await.unwrap();
        sut
    }

    #[tokio::test]
    async fn suite_results_are_sealed_with_host_info() {
        let sut = started_stub().await;
        let sched = SuiteScheduler::new(sut.clone(), EventBus::new(), &SchedulerOptions::default());

        sched.schedule(&[make_suite("mysuite", 3)]).await.unwrap();

        let results = sched.results();
        assert_eq!(results.len(), 1);

        let suite_res = &results[0];
        assert_eq!(suite_res.suite.name, "mysuite");
        assert_eq!(suite_res.tests.len(), 3);
        assert_eq!(suite_res.passed(), 3);
        assert_eq!(suite_res.host.distro, "stub-linux");
        assert!(suite_res.exec_time > Duration::ZERO);
    }

    #[tokio::test]
    async fn kernel_panic_restarts_sut_and_replays_residual() {
        let sut = started_stub().await;
        sut.set_behavior(
            "cmd00",
            StubCommand {
                panic_once: true,
                ..StubCommand::default()
            },
        );

        let bus = EventBus::new();
        let panics = Arc::new(Mutex::new(0usize));
        bus.register("kernel_panic", {
            let panics = panics.clone();
            move |_event| {
                let panics = panics.clone();
                async move {
                    *panics.lock().unwrap() += 1;
                    Ok(())
                }
                .boxed()
            }
        });
        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        let sched = SuiteScheduler::new(sut.clone(), bus.clone(), &SchedulerOptions::default());
        sched.schedule(&[make_suite("mysuite", 3)]).await.unwrap();

        bus.stop().await;
        consumer.await.unwrap().unwrap();

        // one reboot on top of the initial start
        assert_eq!(sut.start_count(), 2);
        assert_eq!(*panics.lock().unwrap(), 1);

        let results = sched.results();
        assert_eq!(results[0].tests.len(), 3);

        let broken = results[0]
            .tests
            .iter()
            .find(|result| result.test.name == "test00")
            .expect("panicking test has a result");
        assert_eq!(broken.broken, 1);
        assert_eq!(broken.retcode, -1);

        // the residual ran to completion after the reboot
        for name in ["test01", "test02"] {
            let result = results[0]
                .tests
                .iter()
                .find(|result| result.test.name == name)
                .expect("residual test has a result");
            assert_eq!(result.passed, 1);
        }
    }

    #[tokio::test]
    async fn suite_timeout_zero_skips_everything() {
        let sut = started_stub().await;
        let sched = SuiteScheduler::new(
            sut.clone(),
            EventBus::new(),
            &SchedulerOptions {
                suite_timeout: Duration::ZERO,
                ..SchedulerOptions::default()
            },
        );

        sched.schedule(&[make_suite("mysuite", 3)]).await.unwrap();

        let results = sched.results();
        assert_eq!(results[0].tests.len(), 3);
        for result in &results[0].tests {
            assert_eq!(result.skipped, 1);
            assert_eq!(result.retcode, 32);
            assert_eq!(result.exec_time, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn suite_timeout_skips_the_slow_tail() {
        let sut = started_stub().await;
        sut.set_behavior(
            "cmd01",
            StubCommand {
                delay: Duration::from_secs(2),
                ..StubCommand::default()
            },
        );

        let sched = SuiteScheduler::new(
            sut.clone(),
            EventBus::new(),
            &SchedulerOptions {
                suite_timeout: Duration::from_millis(500),
                ..SchedulerOptions::default()
            },
        );

        sched.schedule(&[make_suite("mysuite", 2)]).await.unwrap();

        let results = sched.results();
        let first = results[0]
            .tests
            .iter()
            .find(|result| result.test.name == "test00")
            .expect("fast test completed");
        assert_eq!(first.passed, 1);

        let second = results[0]
            .tests
            .iter()
            .find(|result| result.test.name == "test01")
            .expect("slow test was skipped");
        assert_eq!(second.skipped, 1);
        assert_eq!(second.retcode, 32);
        assert_eq!(second.exec_time, Duration::ZERO);
    }

    #[tokio::test]
    async fn skip_regex_filters_tests() {
        let sut = started_stub().await;
        let mut suite = make_suite("mysuite", 2);
        suite.tests.push(Test {
            name: "other".to_string(),
            command: "cmd-other".to_string(),
            arguments: vec![],
            parallelizable: false,
        });

        let sched = SuiteScheduler::new(
            sut.clone(),
            EventBus::new(),
            &SchedulerOptions {
                skip_tests: Some(Regex::new("^test").unwrap()),
                ..SchedulerOptions::default()
            },
        );

        sched.schedule(&[suite]).await.unwrap();

        let results = sched.results();
        assert_eq!(results[0].tests.len(), 1);
        assert_eq!(results[0].tests[0].test.name, "other");
    }
}
