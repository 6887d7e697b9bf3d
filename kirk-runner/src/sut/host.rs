// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SUT implementation using the host's shell.

use crate::{
    errors::SutError,
    sut::{CommandOutcome, ConfigOption, IoSink, Sut, SutConfig},
};
use async_trait::async_trait;
use bstr::ByteSlice;
use camino::{Utf8Path, Utf8PathBuf};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    os::unix::process::ExitStatusExt,
    process::Stdio,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{io::AsyncReadExt, process::Command, time::sleep};
use tracing::{debug, info};

const POISONED: &str = "host SUT lock poisoned";

/// Removes the process from the live list and kills its whole group.
///
/// Lives in a guard so that a cancelled `run_command` still cleans up.
struct ProcGuard<'a> {
    procs: &'a Mutex<Vec<i32>>,
    pid: i32,
}

impl Drop for ProcGuard<'_> {
    fn drop(&mut self) {
        let _ = killpg(Pid::from_raw(self.pid), Signal::SIGKILL);
        self.procs
            .lock()
            .expect(POISONED)
            .retain(|pid| *pid != self.pid);
    }
}

/// SUT implementation spawning commands in fresh process groups via a
/// shell.
#[derive(Debug, Default)]
pub struct HostSut {
    cwd: Mutex<Option<Utf8PathBuf>>,
    env: Mutex<Option<BTreeMap<String, String>>>,
    running: AtomicBool,
    procs: Mutex<Vec<i32>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl HostSut {
    const BUFSIZE: usize = 1024;

    /// Creates an unconfigured host SUT.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sut for HostSut {
    fn name(&self) -> &'static str {
        "host"
    }

    fn config_help(&self) -> &'static [ConfigOption] {
        // cwd and env are given by the session, so no options are needed
        &[]
    }

    fn setup(&self, config: SutConfig) -> Result<(), SutError> {
        info!("initialize SUT");

        *self.cwd.lock().expect(POISONED) = config.cwd;
        *self.env.lock().expect(POISONED) = if config.env.is_empty() {
            None
        } else {
            Some(config.env)
        };

        Ok(())
    }

    fn parallel_execution(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }

        let ret = self.run_command("test .", &super::NullSink).await?;

        Ok(ret.exec_time)
    }

    async fn start(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if self.is_running().await {
            return Err(SutError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn stop(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if !self.is_running().await {
            return Ok(());
        }

        info!("stopping SUT");

        let pids: Vec<i32> = self.procs.lock().expect(POISONED).clone();
        if !pids.is_empty() {
            info!(count = pids.len(), "terminating processes");

            for pid in pids {
                let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            }

            while !self.procs.lock().expect(POISONED).is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        }

        // join any outstanding fetch
        let _guard = self.fetch_lock.lock().await;

        self.running.store(false, Ordering::SeqCst);

        info!("SUT has stopped");

        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<CommandOutcome, SutError> {
        if command.is_empty() {
            return Err(SutError::Config("command is empty".to_string()));
        }
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }

        debug!(command, "executing command");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);

        if let Some(cwd) = self.cwd.lock().expect(POISONED).clone() {
            cmd.current_dir(cwd);
        }
        if let Some(env) = self.env.lock().expect(POISONED).clone() {
            cmd.env_clear();
            cmd.envs(env);
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .map(|id| id as i32)
            .ok_or_else(|| SutError::Transport("child process has no pid".to_string()))?;

        self.procs.lock().expect(POISONED).push(pid);
        let guard = ProcGuard {
            procs: &self.procs,
            pid,
        };

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SutError::Transport("child process has no stdout".to_string()))?;

        let start = Instant::now();
        let mut acc: Vec<u8> = Vec::new();
        let mut chunk = [0u8; Self::BUFSIZE];

        let streamed: Result<bool, std::io::Error> = async {
            let mut panic = false;

            loop {
                let read = stdout.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }

                acc.extend_from_slice(&chunk[..read]);
                iobuffer.write(&chunk[..read]).await;

                let window = acc.len().saturating_sub(2 * Self::BUFSIZE);
                if acc[window..].contains_str("Kernel panic") {
                    panic = true;
                    break;
                }
            }

            Ok(panic)
        }
        .await;

        // kill the whole group before reaping; a no-op when the process
        // already exited on its own
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        let status = child.wait().await;
        let exec_time = start.elapsed();
        drop(guard);

        let panic = streamed?;
        let status = status?;

        if panic {
            debug!(command, "kernel panic recognized in stdout");
            return Err(SutError::KernelPanic);
        }

        let returncode = status
            .code()
            .or_else(|| status.signal().map(|sig| -sig))
            .unwrap_or(-1);

        debug!(command, returncode, "command executed");

        Ok(CommandOutcome {
            command: command.to_string(),
            stdout: acc,
            returncode,
            exec_time,
        })
    }

    async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError> {
        if !target_path.is_file() {
            return Err(SutError::FileNotFound(target_path.to_path_buf()));
        }
        if !self.is_running().await {
            return Err(SutError::NotRunning);
        }

        let _guard = self.fetch_lock.lock().await;

        debug!(path = %target_path, "downloading file");

        let data = tokio::fs::read(target_path).await?;

        debug!(path = %target_path, bytes = data.len(), "file copied");

        Ok(data)
    }
}
