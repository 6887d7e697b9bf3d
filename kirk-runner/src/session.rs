// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test run: one SUT, one temporary directory, one report.
//!
//! The session builds the SUT environment, starts the SUT, optionally runs
//! a single ad-hoc command, downloads the requested suite manifests from
//! the SUT, hands them to the suite scheduler and persists the results.

use crate::{
    errors::SessionError,
    events::{Event, EventBus},
    manifest::{self, Metadata, Suite},
    report,
    scheduler::{SchedulerOptions, SuiteScheduler, SutStdoutSink},
    sut::{IoSink, Sut, SutConfig},
    tempdir::TempDir,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    sync::Arc,
    time::Duration,
};
use tokio::time::timeout;
use tracing::{error, info};

/// Start attempts granted to the SUT at session begin.
const START_RETRIES: usize = 10;

/// How many old run directories are kept around.
const TMPDIR_ROTATE: usize = 5;

/// Mirrors ad-hoc command stdout to the event bus.
struct RunCmdSink {
    bus: EventBus,
}

#[async_trait]
impl IoSink for RunCmdSink {
    async fn write(&self, data: &[u8]) {
        self.bus
            .fire(Event::RunCmdStdout {
                data: String::from_utf8_lossy(data).into_owned(),
            })
            .await;
    }
}

/// Configuration of a [`Session`].
#[derive(Clone)]
pub struct SessionConfig {
    /// Temporary directory root (e.g. `/tmp`). Without one, nothing is
    /// cached or written locally.
    pub tmpdir: Option<Utf8PathBuf>,
    /// LTP installation directory on the SUT.
    pub ltpdir: Utf8PathBuf,
    /// The SUT to drive.
    pub sut: Arc<dyn Sut>,
    /// Transport-specific options for the SUT.
    pub sut_params: HashMap<String, String>,
    /// Disable LTP test colors.
    pub no_colors: bool,
    /// Timeout of a single test execution.
    pub exec_timeout: Duration,
    /// Timeout of a whole testing suite.
    pub suite_timeout: Duration,
    /// Regex excluding matching test names from execution.
    pub skip_tests: Option<String>,
    /// Number of parallel workers.
    pub workers: usize,
    /// Extra environment entries exported to the SUT. Built-ins win.
    pub env: BTreeMap<String, String>,
    /// Force parallel execution of all tests.
    pub force_parallel: bool,
}

/// The kirk session runner.
pub struct Session {
    sut: Arc<dyn Sut>,
    bus: EventBus,
    tempdir: TempDir,
    ltpdir: Utf8PathBuf,
    exec_timeout: Duration,
    scheduler: SuiteScheduler,
    metadata: Option<Metadata>,
    sut_config: SutConfig,
}

impl Session {
    /// Creates a session, rotating a fresh temporary directory and reading
    /// the optional metadata document from `<ltpdir>/metadata/ltp.json`.
    pub fn new(bus: EventBus, config: SessionConfig) -> Result<Self, SessionError> {
        let tempdir = TempDir::new(config.tmpdir.as_deref(), TMPDIR_ROTATE)?;

        let skip_tests = match config.skip_tests.as_deref() {
            Some(source) if !source.is_empty() => Some(Regex::new(source)?),
            _ => None,
        };

        let mut workers = config.workers.max(1);
        if !config.sut.parallel_execution() {
            info!("SUT doesn't support parallel execution, forcing workers=1");
            workers = 1;
        }

        let options = SchedulerOptions {
            exec_timeout: config.exec_timeout,
            suite_timeout: config.suite_timeout,
            max_workers: workers,
            force_parallel: config.force_parallel,
            skip_tests,
        };
        let scheduler = SuiteScheduler::new(config.sut.clone(), bus.clone(), &options);

        let metadata_path = config.ltpdir.join("metadata").join("ltp.json");
        let metadata = if metadata_path.is_file() {
            info!(path = %metadata_path, "reading metadata");
            Some(Metadata::parse(&fs::read_to_string(&metadata_path)?)?)
        } else {
            None
        };

        let sut_config = Self::build_sut_config(&config, &tempdir);

        Ok(Session {
            sut: config.sut,
            bus,
            tempdir,
            ltpdir: config.ltpdir,
            exec_timeout: config.exec_timeout,
            scheduler,
            metadata,
            sut_config,
        })
    }

    /// The temporary directory of this run.
    pub fn tempdir(&self) -> &TempDir {
        &self.tempdir
    }

    /// The environment and working directory handed to the SUT.
    fn build_sut_config(config: &SessionConfig, tempdir: &TempDir) -> SutConfig {
        let testcases = config.ltpdir.join("testcases").join("bin");

        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            format!(
                "/sbin:/usr/sbin:/usr/local/sbin:/root/bin:/usr/local/bin:/usr/bin:/bin:{testcases}"
            ),
        );
        env.insert("LTPROOT".to_string(), config.ltpdir.to_string());
        env.insert(
            "TMPDIR".to_string(),
            tempdir
                .root()
                .map(|root| root.to_string())
                .unwrap_or_else(|| "/tmp".to_string()),
        );
        env.insert(
            "LTP_COLORIZE_OUTPUT".to_string(),
            if config.no_colors { "0" } else { "1" }.to_string(),
        );
        env.insert(
            "LTP_TIMEOUT_MUL".to_string(),
            format!("{}", (config.exec_timeout.as_secs_f64() * 0.9) / 300.0),
        );

        for (key, value) in &config.env {
            if env.contains_key(key) {
                continue;
            }

            info!(key, value, "set environment variable");
            env.insert(key.clone(), value.clone());
        }

        SutConfig {
            params: config.sut_params.clone(),
            env,
            cwd: Some(testcases),
            tmpdir: tempdir.path().map(Utf8Path::to_path_buf),
        }
    }

    /// Runs the session: starts the SUT, optionally executes `command`,
    /// then downloads, schedules and reports the requested suites.
    pub async fn run(
        &self,
        command: Option<&str>,
        suites: &[String],
        report_path: Option<&Utf8Path>,
    ) -> Result<(), SessionError> {
        let tmpdir = self
            .tempdir
            .path()
            .unwrap_or(Utf8Path::new(""))
            .to_path_buf();

        self.bus.fire(Event::SessionStarted { tmpdir }).await;

        let ret = self.run_inner(command, suites, report_path).await;

        if let Err(err) = &ret {
            error!(error = %err, "session failed");
            self.bus
                .fire(Event::SessionError {
                    error: err.to_string(),
                })
                .await;
        }

        let stopped = self.stop().await;

        ret.and(stopped)
    }

    /// Stops the current session: the scheduler first, then the SUT.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.scheduler.stop().await;

        if self.sut.is_running().await {
            self.bus
                .fire(Event::SutStop {
                    sut: self.sut.name().to_string(),
                })
                .await;

            let sink = SutStdoutSink::new(self.bus.clone(), self.sut.name());
            self.sut.stop(&sink).await?;
        }

        Ok(())
    }

    async fn run_inner(
        &self,
        command: Option<&str>,
        suites: &[String],
        report_path: Option<&Utf8Path>,
    ) -> Result<(), SessionError> {
        self.sut.setup(self.sut_config.clone())?;

        self.bus
            .fire(Event::SutStart {
                sut: self.sut.name().to_string(),
            })
            .await;

        let sink = SutStdoutSink::new(self.bus.clone(), self.sut.name());
        self.sut.ensure_start(&sink, START_RETRIES).await?;

        if let Some(command) = command {
            self.exec_command(command).await?;
        }

        if !suites.is_empty() {
            let suites = self.download_suites(suites).await?;
            self.scheduler.schedule(&suites).await?;

            let results = self.scheduler.results();

            if let Some(tmpdir) = self.tempdir.path() {
                report::save_file(&results, &tmpdir.join("results.json"))?;
            }
            if let Some(path) = report_path {
                report::save_file(&results, path)?;
            }

            self.bus.fire(Event::SessionCompleted { results }).await;
        }

        Ok(())
    }

    /// Executes the single ad-hoc command under the execution timeout.
    async fn exec_command(&self, command: &str) -> Result<(), SessionError> {
        self.bus
            .fire(Event::RunCmdStart {
                command: command.to_string(),
            })
            .await;

        let sink = RunCmdSink {
            bus: self.bus.clone(),
        };

        match timeout(self.exec_timeout, self.sut.run_command(command, &sink)).await {
            Err(_elapsed) => Err(SessionError::CommandTimeout {
                command: command.to_string(),
            }),
            Ok(ret) => {
                let ret = ret?;

                self.bus
                    .fire(Event::RunCmdStop {
                        command: command.to_string(),
                        stdout: ret.stdout_lossy(),
                        returncode: ret.returncode,
                    })
                    .await;

                Ok(())
            }
        }
    }

    /// Downloads the runtest file of every requested suite from the SUT,
    /// caching a copy under the temporary directory.
    async fn download_suites(&self, names: &[String]) -> Result<Vec<Suite>, SessionError> {
        self.tempdir.mkdir("runtest")?;

        let mut suites = Vec::new();

        for name in names {
            let target = self.ltpdir.join("runtest").join(name);

            self.bus
                .fire(Event::SuiteDownloadStarted {
                    name: name.clone(),
                    target: target.clone(),
                })
                .await;

            let data = self.sut.fetch_file(&target).await?;
            let text = String::from_utf8_lossy(&data).into_owned();

            self.tempdir
                .mkfile(&format!("runtest/{name}"), text.as_bytes())?;

            self.bus
                .fire(Event::SuiteDownloadCompleted {
                    name: name.clone(),
                    target,
                })
                .await;

            suites.push(manifest::parse_runtest(name, &text, self.metadata.as_ref())?);
        }

        Ok(suites)
    }
}
