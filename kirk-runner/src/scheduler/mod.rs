// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test scheduling.
//!
//! [`TestScheduler`] executes a list of tests under a bounded worker pool,
//! classifying each execution outcome against kernel health.
//! [`SuiteScheduler`] wraps it, iterating over suites and rebooting the SUT
//! on catastrophic failures.

mod suite;

pub use suite::SuiteScheduler;

use crate::{
    errors::{SchedulerError, SutError},
    events::{Event, EventBus},
    manifest::Test,
    results::TestResult,
    sut::{IoSink, NullSink, Sut},
};
use async_trait::async_trait;
use regex::Regex;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::Semaphore,
    task::{AbortHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info};

const POISONED: &str = "scheduler lock poisoned";

/// Options shared by the test and suite schedulers.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Timeout before stopping a single test execution.
    pub exec_timeout: Duration,
    /// Timeout before stopping a testing suite.
    pub suite_timeout: Duration,
    /// Maximum number of workers running tests in parallel.
    pub max_workers: usize,
    /// Force parallel execution of all tests.
    pub force_parallel: bool,
    /// Tests whose name matches are excluded from execution.
    pub skip_tests: Option<Regex>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            exec_timeout: Duration::from_secs(3600),
            suite_timeout: Duration::from_secs(3600),
            max_workers: 1,
            force_parallel: false,
            skip_tests: None,
        }
    }
}

/// How a single test execution ended, measured against kernel health.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TestStatus {
    Ok,
    TestTimeout,
    KernelPanic,
    KernelTainted,
    KernelTimeout,
}

/// Mirrors test stdout to the event bus while accumulating it.
pub(crate) struct TestStdoutSink {
    bus: EventBus,
    test: Test,
    buffer: Mutex<Vec<u8>>,
}

impl TestStdoutSink {
    pub(crate) fn new(bus: EventBus, test: Test) -> Self {
        TestStdoutSink {
            bus,
            test,
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().expect(POISONED)).into_owned()
    }
}

#[async_trait]
impl IoSink for TestStdoutSink {
    async fn write(&self, data: &[u8]) {
        self.buffer.lock().expect(POISONED).extend_from_slice(data);
        self.bus
            .fire(Event::TestStdout {
                test: self.test.clone(),
                data: String::from_utf8_lossy(data).into_owned(),
            })
            .await;
    }
}

/// Mirrors raw SUT stdout to the event bus.
pub(crate) struct SutStdoutSink {
    bus: EventBus,
    sut: String,
}

impl SutStdoutSink {
    pub(crate) fn new(bus: EventBus, sut: &str) -> Self {
        SutStdoutSink {
            bus,
            sut: sut.to_string(),
        }
    }
}

#[async_trait]
impl IoSink for SutStdoutSink {
    async fn write(&self, data: &[u8]) {
        self.bus
            .fire(Event::SutStdout {
                sut: self.sut.clone(),
                data: String::from_utf8_lossy(data).into_owned(),
            })
            .await;
    }
}

struct SchedInner {
    sut: Arc<dyn Sut>,
    bus: EventBus,
    timeout: Duration,
    max_workers: usize,
    force_parallel: bool,
    results: Mutex<Vec<TestResult>>,
    stop: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    schedule_lock: tokio::sync::Mutex<()>,
}

/// Schedules and runs LTP tests, taking into account the status of the
/// kernel during their execution, as well as test timeouts.
pub struct TestScheduler {
    inner: Arc<SchedInner>,
}

impl TestScheduler {
    /// Deadline of the liveness probe that decides between a test timeout
    /// and an unresponsive kernel.
    const PING_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a scheduler running tests on `sut`.
    pub fn new(sut: Arc<dyn Sut>, bus: EventBus, options: &SchedulerOptions) -> Self {
        TestScheduler {
            inner: Arc::new(SchedInner {
                sut,
                bus,
                timeout: options.exec_timeout,
                max_workers: options.max_workers.max(1),
                force_parallel: options.force_parallel,
                results: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                schedule_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Results of the current schedule, in completion order.
    ///
    /// The list is reset at every [`schedule`](Self::schedule) call and
    /// populated as tests complete. Consumers must look up by test name.
    pub fn results(&self) -> Vec<TestResult> {
        self.inner.results.lock().expect(POISONED).clone()
    }

    /// Cancels every in-flight test and waits for the schedule to unwind.
    ///
    /// Results already appended remain available.
    pub async fn stop(&self) {
        if self.inner.tasks.lock().expect(POISONED).is_empty() {
            return;
        }

        info!("stopping tests execution");

        self.inner.stop.store(true, Ordering::SeqCst);

        for handle in self.inner.tasks.lock().expect(POISONED).drain(..) {
            handle.abort();
        }

        let _guard = self.inner.schedule_lock.lock().await;

        self.inner.stop.store(false, Ordering::SeqCst);

        info!("tests execution has stopped");
    }

    /// Schedules and executes a list of tests.
    ///
    /// Unless force-parallel is set, parallelizable tests run first through
    /// a pool of `max_workers`, then the serial cohort runs through a pool
    /// of one.
    pub async fn schedule(&self, tests: &[Test]) -> Result<(), SchedulerError> {
        if tests.is_empty() {
            return Err(SchedulerError::EmptyJobs);
        }

        let _guard = self.inner.schedule_lock.lock().await;

        self.inner.tasks.lock().expect(POISONED).clear();
        self.inner.results.lock().expect(POISONED).clear();

        let ret = if self.inner.force_parallel {
            self.run_pool(tests.to_vec(), self.inner.max_workers).await
        } else {
            let parallel: Vec<Test> = tests
                .iter()
                .filter(|test| test.parallelizable)
                .cloned()
                .collect();
            let serial: Vec<Test> = tests
                .iter()
                .filter(|test| !test.parallelizable)
                .cloned()
                .collect();

            match self.run_pool(parallel, self.inner.max_workers).await {
                Ok(()) => self.run_pool(serial, 1).await,
                err => err,
            }
        };

        self.inner.tasks.lock().expect(POISONED).clear();

        ret
    }

    async fn run_pool(&self, tests: Vec<Test>, workers: usize) -> Result<(), SchedulerError> {
        if tests.is_empty() {
            return Ok(());
        }

        info!(tests = tests.len(), workers, "scheduling tests");

        let sem = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();

        {
            let mut tasks = self.inner.tasks.lock().expect(POISONED);
            for test in tests {
                let inner = self.inner.clone();
                let sem = sem.clone();
                let handle = set.spawn(inner.run_test(test, sem));
                tasks.push(handle);
            }
        }

        let mut first_err: Option<SchedulerError> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        debug!(error = %err, "cancelling outstanding tests");
                        set.abort_all();
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                    // cancelled tasks are expected on stop and error paths
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SchedInner {
    /// Runs a single test and appends its result.
    async fn run_test(
        self: Arc<Self>,
        test: Test,
        sem: Arc<Semaphore>,
    ) -> Result<(), SchedulerError> {
        let Ok(_permit) = sem.acquire().await else {
            return Ok(());
        };
        if self.stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!(test = %test.name, "running test");

        self.bus
            .fire(Event::TestStarted { test: test.clone() })
            .await;
        self.write_kmsg(&test).await?;

        let sink = TestStdoutSink::new(self.bus.clone(), test.clone());
        let cmd = test.full_command();
        let start = Instant::now();

        let mut status = TestStatus::Ok;
        let mut tainted_messages = Vec::new();
        let mut outcome = None;

        let taint_before = self.sut.tainted_info().await?.0;

        match timeout(self.timeout, self.sut.run_command(&cmd, &sink)).await {
            Ok(Ok(ret)) => {
                let (taint_after, messages) = self.sut.tainted_info().await?;
                if taint_after != taint_before {
                    info!(test = %test.name, ?messages, "recognized kernel taint");
                    status = TestStatus::KernelTainted;
                    tainted_messages = messages;
                }

                outcome = Some(ret);
            }
            Ok(Err(SutError::KernelPanic)) => {
                info!(test = %test.name, "recognized kernel panic");
                status = TestStatus::KernelPanic;
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_elapsed) => {
                status = TestStatus::TestTimeout;

                self.bus
                    .fire(Event::TestTimedOut {
                        test: test.clone(),
                        timeout: self.timeout,
                    })
                    .await;

                info!(test = %test.name, "test timed out, checking if SUT is still replying");

                match timeout(TestScheduler::PING_TIMEOUT, self.sut.ping()).await {
                    Ok(Ok(_)) => info!("SUT replied"),
                    _ => status = TestStatus::KernelTimeout,
                }
            }
        }

        // collect the result before raising kernel errors, so the suite
        // scheduler doesn't replay this test after the restart
        let results = match &outcome {
            Some(ret) => TestResult::from_output(
                &test,
                &ret.stdout_lossy(),
                ret.returncode,
                ret.exec_time,
                ret.returncode == -1,
            ),
            None => TestResult::from_output(&test, &sink.output_lossy(), -1, start.elapsed(), true),
        };

        self.results.lock().expect(POISONED).push(results.clone());

        match status {
            TestStatus::KernelTainted => {
                self.bus
                    .fire(Event::KernelTainted {
                        messages: tainted_messages,
                    })
                    .await;
                Err(SchedulerError::KernelTainted)
            }
            TestStatus::KernelPanic => {
                self.bus.fire(Event::KernelPanic).await;
                Err(SchedulerError::KernelPanic)
            }
            TestStatus::KernelTimeout => {
                self.bus.fire(Event::SutNotResponding).await;
                Err(SchedulerError::KernelTimeout)
            }
            TestStatus::Ok | TestStatus::TestTimeout => {
                self.bus
                    .fire(Event::TestCompleted { results })
                    .await;

                info!(test = %test.name, "test completed");

                Ok(())
            }
        }
    }

    /// When running as root, logs the test line to `/dev/kmsg` for
    /// post-mortem correlation.
    async fn write_kmsg(&self, test: &Test) -> Result<(), SchedulerError> {
        let ret = self.sut.run_command("id -u", &NullSink).await?;
        if ret.stdout_lossy().trim_end() != "0" {
            debug!("can't write on /dev/kmsg from user");
            return Ok(());
        }

        let arg0 = std::env::args().next().unwrap_or_else(|| "kirk".to_string());
        let message = format!(
            "{}[{}]: starting test {} ({})",
            arg0,
            std::process::id(),
            test.name,
            test.full_command(),
        );

        self.sut
            .run_command(&format!("echo -n \"{message}\" > /dev/kmsg"), &NullSink)
            .await?;

        Ok(())
    }
}
