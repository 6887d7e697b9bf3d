// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The kirk command-line application.

mod ui;

use camino::Utf8PathBuf;
use clap::{CommandFactory, Parser, error::ErrorKind};
use kirk_runner::{
    errors::SessionError,
    events::{Event, EventBus},
    session::{Session, SessionConfig},
    signal::SignalHandlerKind,
    sut::{HostSut, LtxSut, SshSut, Sut},
};
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::Level;
use ui::UserInterface;

/// Everything went fine.
pub const EXIT_OK: i32 = 0;
/// The session ended with a terminal error.
pub const EXIT_ERROR: i32 = 1;
/// The user interrupted the run.
pub const EXIT_INTERRUPT: i32 = 130;

/// LTP next-gen runner.
#[derive(Debug, Parser)]
#[command(name = "kirk", version, about = "LTP next-gen runner")]
pub struct App {
    /// Verbose mode
    #[arg(short, long)]
    pub verbose: bool,

    /// If defined, no colors are shown
    #[arg(short = 'n', long)]
    pub no_colors: bool,

    /// LTP install directory
    #[arg(short = 'l', long, default_value = "/opt/ltp")]
    pub ltp_dir: Utf8PathBuf,

    /// LTP temporary directory
    #[arg(short = 'd', long, default_value = "/tmp")]
    pub tmp_dir: Utf8PathBuf,

    /// Skip specific tests
    #[arg(short = 'i', long)]
    pub skip_tests: Option<String>,

    /// Skip specific tests using a skip file (newline separated item)
    #[arg(short = 'I', long)]
    pub skip_file: Option<Utf8PathBuf>,

    /// Timeout before stopping the suite, in seconds
    #[arg(short = 'T', long, default_value_t = 3600)]
    pub suite_timeout: u64,

    /// Timeout before stopping a single execution, in seconds
    #[arg(short = 't', long, default_value_t = 3600)]
    pub exec_timeout: u64,

    /// Suites to run
    #[arg(short = 'r', long, num_args = 1..)]
    pub run_suite: Vec<String>,

    /// Command to run
    #[arg(short = 'c', long)]
    pub run_command: Option<String>,

    /// System Under Test parameters, for help see `--sut help`
    #[arg(short = 's', long, default_value = "host")]
    pub sut: String,

    /// JSON output report
    #[arg(short = 'j', long)]
    pub json_report: Option<Utf8PathBuf>,

    /// Number of workers to execute tests in parallel
    #[arg(short = 'w', long, default_value_t = 1)]
    pub workers: usize,

    /// Force parallelization execution of all tests
    #[arg(short = 'f', long)]
    pub force_parallel: bool,

    /// List of key=value environment values separated by ':'
    #[arg(short = 'e', long)]
    pub env: Option<String>,
}

/// Parses a `key=value:key=value` list.
fn parse_key_value_list(value: &str) -> Result<Vec<(String, String)>, String> {
    let mut entries = Vec::new();

    for param in value.split(':') {
        let (key, val) = param
            .split_once('=')
            .ok_or_else(|| format!("missing '=' assignment in '{param}' parameter"))?;

        if key.is_empty() {
            return Err(format!("empty key for '{param}' parameter"));
        }

        entries.push((key.to_string(), val.to_string()));
    }

    Ok(entries)
}

/// Parses the `--sut` option: `<name>:<param1>=<value1>:...`.
fn parse_sut_option(value: &str) -> Result<(String, HashMap<String, String>), String> {
    if value.is_empty() {
        return Err("SUT parameters can't be empty".to_string());
    }

    let (name, params) = match value.split_once(':') {
        Some((name, rest)) => (name, parse_key_value_list(rest)?),
        None => (value, Vec::new()),
    };

    Ok((name.to_string(), params.into_iter().collect()))
}

/// Instantiates a transport by name.
fn create_sut(name: &str) -> Option<Arc<dyn Sut>> {
    match name {
        "host" => Some(Arc::new(HostSut::new())),
        "ltx" => Some(Arc::new(LtxSut::new())),
        "ssh" => Some(Arc::new(SshSut::new())),
        _ => None,
    }
}

const SUT_NAMES: &[&str] = &["host", "ltx", "ssh"];

/// The `--sut help` message, listing every transport and its options.
fn sut_help() -> String {
    let mut message = String::from(
        "--sut option supports the following syntax:\n\
         \n\t<SUT>:<param1>=<value1>:<param2>=<value2>:..\n\
         \nSupported SUT: | ",
    );

    for name in SUT_NAMES {
        message.push_str(name);
        message.push_str(" | ");
    }
    message.push('\n');

    for name in SUT_NAMES {
        let sut = create_sut(name).expect("listed SUT exists");
        let help = sut.config_help();

        if help.is_empty() {
            message.push_str(&format!("\n{name} has no configuration\n"));
        } else {
            message.push_str(&format!("\n{name} configuration:\n"));
            for option in help {
                message.push_str(&format!("\t{}: {}\n", option.key, option.help));
            }
        }
    }

    message
}

/// Merges `--skip-tests` and the skip file into a single regex source.
fn merge_skip_tests(
    skip_tests: Option<&str>,
    skip_file: Option<&str>,
) -> Option<String> {
    let mut patterns: Vec<String> = Vec::new();

    if let Some(content) = skip_file {
        patterns.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    if let Some(skip) = skip_tests {
        if !skip.is_empty() {
            patterns.push(skip.to_string());
        }
    }

    if patterns.is_empty() {
        None
    } else {
        Some(patterns.join("|"))
    }
}

fn usage_error(message: &str) -> ! {
    App::command()
        .error(ErrorKind::InvalidValue, message)
        .exit()
}

impl App {
    /// Validates the arguments and runs the session, returning the process
    /// exit code.
    pub fn exec(self) -> i32 {
        if self.sut == "help" {
            println!("{}", sut_help());
            return EXIT_OK;
        }

        if self.run_suite.is_empty() && self.run_command.is_none() {
            usage_error("--run-suite/--run-command are required");
        }

        if let Some(report) = &self.json_report {
            if report.exists() {
                usage_error(&format!("JSON report file already exists: {report}"));
            }
        }

        if !self.tmp_dir.is_dir() {
            usage_error(&format!("'{}' temporary folder doesn't exist", self.tmp_dir));
        }

        let skip_file = match &self.skip_file {
            None => None,
            Some(path) => match std::fs::read_to_string(path) {
                Ok(content) => Some(content),
                Err(_) => usage_error(&format!("'{path}' skip file doesn't exist")),
            },
        };

        let skip_tests = merge_skip_tests(self.skip_tests.as_deref(), skip_file.as_deref());
        if let Some(skip) = &skip_tests {
            if regex::Regex::new(skip).is_err() {
                usage_error(&format!("'{skip}' is not a valid regular expression"));
            }
        }

        let (sut_name, sut_params) = match parse_sut_option(&self.sut) {
            Ok(parsed) => parsed,
            Err(err) => usage_error(&err),
        };
        let Some(sut) = create_sut(&sut_name) else {
            usage_error(&format!(
                "'{sut_name}' is not an available SUT (available: {})",
                SUT_NAMES.join(", ")
            ));
        };

        let env: BTreeMap<String, String> = match &self.env {
            None => BTreeMap::new(),
            Some(value) => match parse_key_value_list(value) {
                Ok(entries) => entries.into_iter().collect(),
                Err(err) => usage_error(&err),
            },
        };

        let config = SessionConfig {
            tmpdir: Some(self.tmp_dir.clone()),
            ltpdir: self.ltp_dir.clone(),
            sut,
            sut_params,
            no_colors: self.no_colors,
            exec_timeout: Duration::from_secs(self.exec_timeout),
            suite_timeout: Duration::from_secs(self.suite_timeout),
            skip_tests,
            workers: self.workers,
            env,
            force_parallel: self.force_parallel,
        };

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                eprintln!("Error: can't build the runtime: {err}");
                return EXIT_ERROR;
            }
        };

        runtime.block_on(self.run_session(config))
    }

    async fn run_session(&self, config: SessionConfig) -> i32 {
        let bus = EventBus::new();

        let interface = if self.workers > 1 || self.force_parallel {
            UserInterface::Parallel
        } else if self.verbose {
            UserInterface::Verbose
        } else {
            UserInterface::Simple
        };
        ui::install(&bus, interface, self.no_colors);

        let session = match Session::new(bus.clone(), config) {
            Ok(session) => session,
            Err(err) => {
                eprintln!("Error: {err}");
                return EXIT_ERROR;
            }
        };

        init_debug_log(&session);

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        let mut signals = match SignalHandlerKind::Standard.build() {
            Ok(signals) => signals,
            Err(err) => {
                eprintln!("Error: {err}");
                return EXIT_ERROR;
            }
        };

        let code = tokio::select! {
            ret = session.run(
                self.run_command.as_deref(),
                &self.run_suite,
                self.json_report.as_deref(),
            ) => match ret {
                Ok(()) => EXIT_OK,
                Err(SessionError::Sut(err)) => {
                    tracing::error!(error = %err, "SUT failure");
                    EXIT_ERROR
                }
                Err(_) => EXIT_ERROR,
            },
            _signal = signals.recv() => {
                let _ = session.stop().await;
                bus.fire(Event::SessionStopped).await;
                EXIT_INTERRUPT
            }
        };

        bus.stop().await;
        let _ = consumer.await;

        code
    }
}

/// Saves full tracing output into `debug.log` inside the run directory.
fn init_debug_log(session: &Session) {
    let Some(tmpdir) = session.tempdir().path() else {
        return;
    };

    let Ok(file) = File::create(tmpdir.join("debug.log")) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_max_level(Level::DEBUG)
        .try_init();
}
