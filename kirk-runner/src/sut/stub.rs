// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scriptable SUT used by the scheduler and session tests.

use crate::{
    errors::SutError,
    sut::{CommandOutcome, ConfigOption, IoSink, Sut, SutConfig},
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::time::sleep;

/// Scripted behavior of a single command.
#[derive(Clone, Debug, Default)]
pub(crate) struct StubCommand {
    /// How long the command takes.
    pub delay: Duration,
    /// What the command prints.
    pub stdout: String,
    /// Its exit code.
    pub returncode: i32,
    /// Taint code the kernel moves to after this command.
    pub taint: Option<u64>,
    /// Print `Kernel panic` and fail, on the first execution only.
    pub panic_once: bool,
}

/// A SUT whose commands are scripted per test.
///
/// Unknown commands succeed silently; the probes used by the generic
/// `info`/`tainted_info` implementations get canned replies, so the default
/// trait implementations are exercised as-is.
pub(crate) struct StubSut {
    running: AtomicBool,
    fail_ping: AtomicBool,
    parallel: AtomicBool,
    behaviors: Mutex<HashMap<String, StubCommand>>,
    files: Mutex<HashMap<Utf8PathBuf, Vec<u8>>>,
    taint_code: Mutex<u64>,
    start_count: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl Default for StubSut {
    fn default() -> Self {
        StubSut {
            running: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            parallel: AtomicBool::new(true),
            behaviors: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            taint_code: Mutex::new(0),
            start_count: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }
}

impl StubSut {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_parallel(&self, parallel: bool) {
        self.parallel.store(parallel, Ordering::SeqCst);
    }

    pub(crate) fn set_behavior(&self, command: &str, behavior: StubCommand) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
    }

    pub(crate) fn set_file(&self, path: impl Into<Utf8PathBuf>, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), content.to_vec());
    }

    pub(crate) fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// Highest number of commands ever observed in flight.
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// How many times `start` succeeded.
    pub(crate) fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    fn canned_reply(&self, command: &str) -> Option<String> {
        let reply = match command {
            "id -u" => "1000\n".to_string(),
            "cat /proc/sys/kernel/tainted" => {
                format!("{}\n", self.taint_code.lock().unwrap())
            }
            r#". /etc/os-release; echo "$ID""# => "stub-linux\n".to_string(),
            r#". /etc/os-release; echo "$VERSION_ID""# => "1.0\n".to_string(),
            "uname -s -r -v" => "Linux 6.0 #1 SMP\n".to_string(),
            "uname -m" | "uname -p" => "x86_64\n".to_string(),
            "cat /proc/meminfo" => {
                "MemTotal:       16384 kB\nSwapTotal:      1024 kB\n".to_string()
            }
            _ => return None,
        };

        Some(reply)
    }
}

#[async_trait]
impl Sut for StubSut {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn config_help(&self) -> &'static [ConfigOption] {
        &[]
    }

    fn setup(&self, _config: SutConfig) -> Result<(), SutError> {
        Ok(())
    }

    fn parallel_execution(&self) -> bool {
        self.parallel.load(Ordering::SeqCst)
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(SutError::Transport("SUT is not replying".to_string()));
        }

        Ok(Duration::from_millis(1))
    }

    async fn start(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if self.is_running().await {
            return Err(SutError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        self.start_count.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn stop(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        self.running.store(false, Ordering::SeqCst);
        // a rebooted kernel comes back untainted
        *self.taint_code.lock().unwrap() = 0;

        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<CommandOutcome, SutError> {
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }

        if let Some(stdout) = self.canned_reply(command) {
            iobuffer.write(stdout.as_bytes()).await;

            return Ok(CommandOutcome {
                command: command.to_string(),
                stdout: stdout.into_bytes(),
                returncode: 0,
                exec_time: Duration::from_millis(1),
            });
        }

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or_default();

        let concurrent = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(concurrent, Ordering::SeqCst);

        sleep(behavior.delay).await;

        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if behavior.panic_once {
            if let Some(found) = self.behaviors.lock().unwrap().get_mut(command) {
                found.panic_once = false;
            }

            iobuffer.write(b"Kernel panic - not syncing\n").await;

            return Err(SutError::KernelPanic);
        }

        if let Some(taint) = behavior.taint {
            *self.taint_code.lock().unwrap() = taint;
        }

        iobuffer.write(behavior.stdout.as_bytes()).await;

        Ok(CommandOutcome {
            command: command.to_string(),
            stdout: behavior.stdout.into_bytes(),
            returncode: behavior.returncode,
            exec_time: behavior.delay.max(Duration::from_millis(1)),
        })
    }

    async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError> {
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }

        self.files
            .lock()
            .unwrap()
            .get(target_path)
            .cloned()
            .ok_or_else(|| SutError::FileNotFound(target_path.to_path_buf()))
    }
}
