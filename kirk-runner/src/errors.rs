// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by kirk.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error returned by an event handler.
///
/// Handler failures never terminate a run: the bus redirects them to the
/// `internal_error` event.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An error that occurred while operating the event bus.
#[derive(Debug, Error)]
pub enum EventsError {
    /// `start` was called while the consumer loop was already running.
    #[error("event loop is already running")]
    AlreadyRunning,
}

/// An error raised by a SUT transport.
#[derive(Debug, Error)]
pub enum SutError {
    /// The SUT was asked to do work before `start` completed.
    #[error("SUT is not running")]
    NotRunning,

    /// `start` was called twice without an intervening `stop`.
    #[error("SUT is already running")]
    AlreadyRunning,

    /// The substring `Kernel panic` appeared in a command's stdout.
    #[error("kernel panic detected on the SUT")]
    KernelPanic,

    /// An invalid option was given to `setup`.
    #[error("invalid SUT configuration: {0}")]
    Config(String),

    /// Connection lost, authentication failure or a protocol violation.
    #[error("SUT transport failure: {0}")]
    Transport(String),

    /// A probe command used to collect host or taint information failed.
    #[error("can't read information from SUT: {0}")]
    Info(String),

    /// A file requested through `fetch_file` does not exist on the SUT.
    #[error("`{0}` file doesn't exist")]
    FileNotFound(Utf8PathBuf),

    /// An LTX protocol failure.
    #[error(transparent)]
    Ltx(#[from] LtxError),

    /// A local I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An error raised by the LTX framed protocol.
#[derive(Debug, Error)]
pub enum LtxError {
    /// The server sent a frame that violates the protocol.
    #[error("LTX protocol violation: {0}")]
    Protocol(String),

    /// A frame could not be decoded as msgpack.
    #[error("LTX frame decoding failed: {0}")]
    Decode(String),

    /// A request could not be encoded as msgpack.
    #[error("LTX frame encoding failed: {0}")]
    Encode(String),

    /// The server replied with an ERROR frame.
    #[error("LTX error: {0}")]
    Remote(String),

    /// A request did not complete within its deadline.
    #[error("LTX request timed out")]
    RequestTimeout,

    /// The session was closed while requests were still in flight.
    #[error("LTX session closed")]
    SessionClosed,

    /// All 128 execution slots are busy.
    #[error("no execution slots available")]
    NoSlots,

    /// A slot id outside the valid range was used.
    #[error("out of bounds slot id: {0}")]
    InvalidSlot(u32),

    /// A failure on the underlying file descriptors.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An error that occurred while parsing a runtest manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The runtest file has no content.
    #[error("runtest content is empty")]
    EmptyContent,

    /// A test declaration line does not define a command.
    #[error("test declaration is not defining a command: `{line}`")]
    MissingCommand {
        /// The offending line.
        line: String,
    },

    /// The metadata document is not valid JSON.
    #[error("failed to parse metadata")]
    Metadata(#[from] serde_json::Error),
}

/// An error that occurred while writing the JSON report.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The report path already exists and will not be overwritten.
    #[error("`{0}` already exists")]
    AlreadyExists(Utf8PathBuf),

    /// Serialization failed.
    #[error("failed to serialize report")]
    Json(#[from] serde_json::Error),

    /// The report file could not be written.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An error raised while scheduling tests.
///
/// The kernel variants are the catastrophic SUT states the suite scheduler
/// recovers from with a restart and a residual replay.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A kernel panic was detected while a test was running.
    #[error("kernel panic detected")]
    KernelPanic,

    /// The kernel taint state changed while a test was running.
    #[error("kernel has been tainted")]
    KernelTainted,

    /// A test timed out and the SUT stopped replying to pings.
    #[error("kernel is not responding")]
    KernelTimeout,

    /// `schedule` was called with no jobs.
    #[error("jobs list is empty")]
    EmptyJobs,

    /// A SUT failure that is not a kernel-health condition.
    #[error(transparent)]
    Sut(#[from] SutError),
}

impl SchedulerError {
    /// Whether the suite scheduler should react with a SUT restart.
    pub fn is_kernel_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::KernelPanic
                | SchedulerError::KernelTainted
                | SchedulerError::KernelTimeout
        )
    }
}

/// An error that occurred while rotating temporary directories.
#[derive(Debug, Error)]
pub enum TempDirError {
    /// The configured root directory does not exist.
    #[error("root folder doesn't exist: {0}")]
    MissingRoot(Utf8PathBuf),

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An error raised by a session run.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The single ad-hoc command exceeded the execution timeout.
    #[error("command timeout: `{command}`")]
    CommandTimeout {
        /// The command that timed out.
        command: String,
    },

    /// The skip filter is not a valid regular expression.
    #[error("invalid skip-tests regular expression")]
    SkipRegex(#[from] regex::Error),

    /// The temporary directory could not be created.
    #[error(transparent)]
    TempDir(#[from] TempDirError),

    /// A downloaded runtest file could not be parsed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The JSON report could not be written.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The SUT failed outside of test scheduling.
    #[error(transparent)]
    Sut(#[from] SutError),

    /// Test scheduling failed beyond the suite scheduler's recovery.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A local I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);
