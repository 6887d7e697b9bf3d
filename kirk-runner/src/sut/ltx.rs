// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SUT implementation using LTX as executor.

use crate::{
    errors::{LtxError, SutError},
    ltx::{
        monotonic_ns,
        protocol::{self, Request},
        session::{LtxSession, Reply},
    },
    sut::{CommandOutcome, ConfigOption, IoSink, Sut, SutConfig},
};
use async_trait::async_trait;
use bstr::ByteSlice;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::unix::pipe, sync::mpsc, time::sleep};
use tracing::{debug, info};

const POISONED: &str = "ltx SUT lock poisoned";

#[derive(Clone, Debug, Default)]
struct LtxConfig {
    stdin: Option<Utf8PathBuf>,
    stdout: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    cwd: Option<Utf8PathBuf>,
}

/// Releases an execution slot when the command holding it goes away.
///
/// A command cancelled mid-flight still occupies its server-side slot, so
/// the guard first takes it down with a KILL and frees the id only once
/// the kill resolves.
struct SlotGuard {
    slots: Arc<Mutex<Vec<u32>>>,
    session: Arc<LtxSession>,
    slot: u32,
    armed: bool,
}

impl SlotGuard {
    /// Frees the slot right away. Only valid once the command's RESULT has
    /// been received.
    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            self.slots
                .lock()
                .expect(POISONED)
                .retain(|slot| *slot != self.slot);
            return;
        }

        let slots = self.slots.clone();
        let session = self.session.clone();
        let slot = self.slot;

        tokio::spawn(async move {
            if let Ok(done) = session.send(Request::Kill { slot }, None).await {
                let _ = done.await;
            }

            slots.lock().expect(POISONED).retain(|id| *id != slot);
        });
    }
}

/// SUT implementation driving an LTX executor over two pipes.
#[derive(Default)]
pub struct LtxSut {
    config: Mutex<LtxConfig>,
    session: tokio::sync::Mutex<Option<Arc<LtxSession>>>,
    slots: Arc<Mutex<Vec<u32>>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl LtxSut {
    const START_TIMEOUT: Duration = Duration::from_secs(10);
    const PING_TIMEOUT: Duration = Duration::from_secs(1);
    const STOP_TIMEOUT: Duration = Duration::from_secs(360);
    const FETCH_TIMEOUT: Duration = Duration::from_secs(3600);
    const PANIC_WINDOW: usize = 2048;

    /// Creates an unconfigured LTX SUT.
    pub fn new() -> Self {
        Self::default()
    }

    async fn current_session(&self) -> Result<Arc<LtxSession>, SutError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(SutError::NotRunning)
    }

    /// Reserves the smallest free execution slot.
    fn reserve_slot(&self) -> Result<u32, SutError> {
        let mut slots = self.slots.lock().expect(POISONED);

        let slot = (0..protocol::MAX_SLOTS)
            .find(|id| !slots.contains(id))
            .ok_or(LtxError::NoSlots)?;
        slots.push(slot);

        Ok(slot)
    }

    async fn exec_on_slot(
        &self,
        session: &LtxSession,
        slot: u32,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<CommandOutcome, SutError> {
        let start_ns = monotonic_ns();
        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel();

        let mut done = session
            .send(
                Request::Exec {
                    slot,
                    argv: vec![command.to_string()],
                },
                Some(stdout_tx),
            )
            .await
            .map_err(SutError::from)?;

        let mut seen: Vec<u8> = Vec::new();
        let mut panic = false;

        let reply = loop {
            tokio::select! {
                chunk = stdout_rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            seen.extend_from_slice(&chunk);
                            iobuffer.write(&chunk).await;

                            let window = seen.len().saturating_sub(Self::PANIC_WINDOW);
                            if !panic && seen[window..].contains_str("Kernel panic") {
                                panic = true;
                                // take the command down; its RESULT still
                                // completes the request
                                let _ = session.send(Request::Kill { slot }, None).await;
                            }
                        }
                        // sender gone: only the reply can arrive now
                        None => break done.await,
                    }
                }
                reply = &mut done => break reply,
            }
        };

        let reply = reply
            .map_err(|_| SutError::from(LtxError::SessionClosed))?
            .map_err(SutError::from)?;

        // chunks may still sit in the channel when RESULT wins the race
        while let Ok(chunk) = stdout_rx.try_recv() {
            iobuffer.write(&chunk).await;
        }

        if panic {
            return Err(SutError::KernelPanic);
        }

        match reply {
            Reply::Exec {
                stdout,
                time_ns,
                si_status,
                ..
            } => Ok(CommandOutcome {
                command: command.to_string(),
                stdout,
                returncode: si_status as i32,
                exec_time: Duration::from_nanos(time_ns.saturating_sub(start_ns)),
            }),
            _ => Err(LtxError::Protocol("unexpected reply to EXEC".to_string()).into()),
        }
    }

    /// Opens the write side of a FIFO, waiting for the server to hold the
    /// read side open.
    async fn open_sender_retry(path: &Utf8Path) -> Result<pipe::Sender, SutError> {
        let mut attempts = 0;

        loop {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(sender) => return Ok(sender),
                Err(err) if err.raw_os_error() == Some(libc::ENXIO) && attempts < 100 => {
                    attempts += 1;
                    sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl Sut for LtxSut {
    fn name(&self) -> &'static str {
        "ltx"
    }

    fn config_help(&self) -> &'static [ConfigOption] {
        &[
            ConfigOption {
                key: "stdin",
                help: "transport stdin file",
            },
            ConfigOption {
                key: "stdout",
                help: "transport stdout file",
            },
        ]
    }

    fn setup(&self, config: SutConfig) -> Result<(), SutError> {
        info!("initialize SUT");

        *self.config.lock().expect(POISONED) = LtxConfig {
            stdin: config.params.get("stdin").map(Utf8PathBuf::from),
            stdout: config.params.get("stdout").map(Utf8PathBuf::from),
            env: config.env,
            cwd: config.cwd,
        };

        Ok(())
    }

    fn parallel_execution(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => session.connected(),
            None => false,
        }
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        let session = self.current_session().await?;
        let start_ns = monotonic_ns();

        match session
            .request(Request::Ping, Self::PING_TIMEOUT)
            .await
            .map_err(SutError::from)?
        {
            Reply::Pong(time_ns) => Ok(Duration::from_nanos(time_ns.saturating_sub(start_ns))),
            _ => Err(LtxError::Protocol("unexpected reply to PING".to_string()).into()),
        }
    }

    async fn start(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if self.is_running().await {
            return Err(SutError::AlreadyRunning);
        }

        let config = self.config.lock().expect(POISONED).clone();

        let stdin = config
            .stdin
            .ok_or_else(|| SutError::Config("'stdin' transport file is not set".to_string()))?;
        let stdout = config
            .stdout
            .ok_or_else(|| SutError::Config("'stdout' transport file is not set".to_string()))?;

        info!(stdin = %stdin, stdout = %stdout, "connecting to LTX");

        // read-write mode keeps the FIFO from hitting EOF while the server
        // side reconnects its writer
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&stdout)?;
        let sender = Self::open_sender_retry(&stdin).await?;

        let session = Arc::new(LtxSession::connect(receiver, sender));

        session
            .request(Request::Version, Self::START_TIMEOUT)
            .await
            .map_err(SutError::from)?;

        if let Some(cwd) = config.cwd {
            session
                .request(
                    Request::Cwd {
                        slot: protocol::ALL_SLOTS,
                        path: cwd.to_string(),
                    },
                    Self::START_TIMEOUT,
                )
                .await
                .map_err(SutError::from)?;
        }

        for (key, value) in config.env {
            session
                .request(
                    Request::Env {
                        slot: protocol::ALL_SLOTS,
                        key,
                        value,
                    },
                    Self::START_TIMEOUT,
                )
                .await
                .map_err(SutError::from)?;
        }

        *self.session.lock().await = Some(session);

        info!("connected");

        Ok(())
    }

    async fn stop(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        let slots: Vec<u32> = self.slots.lock().expect(POISONED).clone();
        if !slots.is_empty() {
            info!(count = slots.len(), "killing occupied slots");

            futures::future::join_all(
                slots
                    .iter()
                    .map(|slot| session.request(Request::Kill { slot: *slot }, Self::STOP_TIMEOUT)),
            )
            .await;

            while !self.slots.lock().expect(POISONED).is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        }

        session.disconnect().await;

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

        let session = self.current_session().await?;

        debug!(command, "running command");

        let slot = self.reserve_slot()?;
        let guard = SlotGuard {
            slots: self.slots.clone(),
            session: session.clone(),
            slot,
            armed: true,
        };

        // any non-cancelled exit means the slot's RESULT was seen (or the
        // session is gone), so the id can be handed out again
        let ret = self.exec_on_slot(&session, slot, command, iobuffer).await;
        guard.release();
        let ret = ret?;

        debug!(command, returncode = ret.returncode, "command executed");

        Ok(ret)
    }

    async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError> {
        if !target_path.is_file() {
            return Err(SutError::FileNotFound(target_path.to_path_buf()));
        }

        let session = self.current_session().await?;
        let _guard = self.fetch_lock.lock().await;

        debug!(path = %target_path, "downloading file");

        match session
            .request(
                Request::GetFile {
                    path: target_path.to_string(),
                },
                Self::FETCH_TIMEOUT,
            )
            .await
            .map_err(SutError::from)?
        {
            Reply::GetFile(data) => Ok(data),
            _ => Err(LtxError::Protocol("unexpected reply to GET_FILE".to_string()).into()),
        }
    }
}
