// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The System Under Test abstraction.
//!
//! A [`Sut`] can be the local host, a remote host reached over SSH, or a
//! lightweight executor attached through a pair of pipes speaking the LTX
//! protocol. All transports expose the same capability set; host and taint
//! information are implemented generically on top of [`Sut::run_command`].

mod host;
mod ltx;
mod ssh;

pub use host::HostSut;
pub use ltx::LtxSut;
pub use ssh::SshSut;

#[cfg(test)]
pub(crate) mod stub;

use crate::errors::SutError;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::LazyLock,
    time::Duration,
};
use tracing::warn;

/// Messages associated with the kernel taint bits, in bit order.
pub const TAINT_MESSAGES: [&str; 18] = [
    "proprietary module was loaded",
    "module was force loaded",
    "kernel running on an out of specification system",
    "module was force unloaded",
    "processor reported a Machine Check Exception (MCE)",
    "bad page referenced or some unexpected page flags",
    "taint requested by userspace application",
    "kernel died recently, i.e. there was an OOPS or BUG",
    "ACPI table overridden by user",
    "kernel issued warning",
    "staging driver was loaded",
    "workaround for bug in platform firmware applied",
    "externally-built (“out-of-tree”) module was loaded",
    "unsigned module was loaded",
    "soft lockup occurred",
    "kernel has been live patched",
    "auxiliary taint, defined for and used by distros",
    "kernel was built with the struct randomization plugin",
];

static MEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MemTotal:\s+(?P<memory>\d+\s+kB)").expect("meminfo regex is valid")
});

static SWAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SwapTotal:\s+(?P<swap>\d+\s+kB)").expect("meminfo regex is valid")
});

/// A sink that receives SUT stdout as raw bytes while a command runs.
#[async_trait]
pub trait IoSink: Send + Sync {
    /// Writes a chunk of stdout.
    async fn write(&self, data: &[u8]);
}

/// A sink that discards everything.
pub struct NullSink;

#[async_trait]
impl IoSink for NullSink {
    async fn write(&self, _data: &[u8]) {}
}

/// The outcome of a single command execution on the SUT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutcome {
    /// The executed command.
    pub command: String,
    /// Captured stdout, as raw bytes.
    pub stdout: Vec<u8>,
    /// Return code of the command.
    pub returncode: i32,
    /// Monotonic execution time.
    pub exec_time: Duration,
}

impl CommandOutcome {
    /// The captured stdout decoded with UTF-8 replacement.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Host information collected from the SUT.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostInfo {
    /// Distribution name.
    pub distro: String,
    /// Distribution version.
    pub distro_ver: String,
    /// Kernel version.
    pub kernel: String,
    /// Machine architecture.
    pub arch: String,
    /// CPU type.
    pub cpu: String,
    /// Total RAM, as reported by `/proc/meminfo`.
    pub ram: String,
    /// Total swap, as reported by `/proc/meminfo`.
    pub swap: String,
}

/// Configuration handed to [`Sut::setup`].
///
/// `params` carries the transport-specific options from the command line;
/// the other fields are filled in by the session.
#[derive(Clone, Debug, Default)]
pub struct SutConfig {
    /// Transport-specific `key=value` options.
    pub params: HashMap<String, String>,
    /// Environment exported to every command.
    pub env: BTreeMap<String, String>,
    /// Working directory for every command.
    pub cwd: Option<Utf8PathBuf>,
    /// The session temporary directory.
    pub tmpdir: Option<Utf8PathBuf>,
}

/// Help message for a single transport option.
#[derive(Clone, Copy, Debug)]
pub struct ConfigOption {
    /// Option key, as given on the command line.
    pub key: &'static str,
    /// Human readable description.
    pub help: &'static str,
}

/// Uniform capability set of a System Under Test.
#[async_trait]
pub trait Sut: Send + Sync {
    /// Name of the transport.
    fn name(&self) -> &'static str;

    /// Help messages for the transport-specific options.
    fn config_help(&self) -> &'static [ConfigOption];

    /// Late binding of options. Performs no I/O.
    fn setup(&self, config: SutConfig) -> Result<(), SutError>;

    /// Whether the transport may execute multiple commands concurrently.
    fn parallel_execution(&self) -> bool;

    /// Current connectivity state.
    async fn is_running(&self) -> bool;

    /// Liveness probe returning the round-trip time.
    async fn ping(&self) -> Result<Duration, SutError>;

    /// Starts communicating with the SUT.
    async fn start(&self, iobuffer: &dyn IoSink) -> Result<(), SutError>;

    /// Stops the current SUT session, killing any in-flight command or
    /// transfer. Stopping a stopped SUT is a no-op.
    async fn stop(&self, iobuffer: &dyn IoSink) -> Result<(), SutError>;

    /// Executes a shell command, streaming stdout to `iobuffer` as bytes
    /// arrive, and returns when the remote process terminates.
    ///
    /// Fails with [`SutError::KernelPanic`] if the substring `Kernel panic`
    /// appears in stdout.
    async fn run_command(
        &self,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<CommandOutcome, SutError>;

    /// Reads an entire file from the SUT.
    async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError>;

    /// Resilient start: up to `retries` attempts, each followed by a `stop`
    /// on failure.
    async fn ensure_start(&self, iobuffer: &dyn IoSink, retries: usize) -> Result<(), SutError> {
        let retries = retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.start(iobuffer).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if attempt >= retries {
                        return Err(err);
                    }

                    warn!(sut = self.name(), error = %err, "SUT start failed, retrying");
                    self.stop(iobuffer).await?;
                }
            }
        }
    }

    /// Collects host information by probing the SUT.
    async fn info(&self) -> Result<HostInfo, SutError> {
        let probe = |cmd: &'static str| async move {
            let ret = self.run_command(cmd, &NullSink).await?;
            if ret.returncode != 0 {
                return Err(SutError::Info(cmd.to_string()));
            }

            Ok(ret.stdout_lossy().trim_end().to_string())
        };

        let (distro, distro_ver, kernel, arch, cpu, meminfo) = futures::try_join!(
            probe(". /etc/os-release; echo \"$ID\""),
            probe(". /etc/os-release; echo \"$VERSION_ID\""),
            probe("uname -s -r -v"),
            probe("uname -m"),
            probe("uname -p"),
            probe("cat /proc/meminfo"),
        )?;

        let ram = MEM_RE
            .captures(&meminfo)
            .and_then(|caps| caps.name("memory"))
            .ok_or_else(|| SutError::Info("memory information from /proc/meminfo".to_string()))?
            .as_str()
            .to_string();

        let swap = SWAP_RE
            .captures(&meminfo)
            .and_then(|caps| caps.name("swap"))
            .ok_or_else(|| SutError::Info("swap information from /proc/meminfo".to_string()))?
            .as_str()
            .to_string();

        Ok(HostInfo {
            distro,
            distro_ver,
            kernel,
            arch,
            cpu,
            ram,
            swap,
        })
    }

    /// Reads the kernel taint state.
    ///
    /// Returns the taint bitmask and the messages of the set bits, in bit
    /// order.
    async fn tainted_info(&self) -> Result<(u64, Vec<String>), SutError> {
        let ret = self
            .run_command("cat /proc/sys/kernel/tainted", &NullSink)
            .await?;
        if ret.returncode != 0 {
            return Err(SutError::Info("tainted kernel information".to_string()));
        }

        let stdout = ret.stdout_lossy();
        let code: u64 = stdout
            .trim()
            .parse()
            .map_err(|_| SutError::Info(format!("unexpected taint state: {}", stdout.trim())))?;

        let messages = TAINT_MESSAGES
            .iter()
            .enumerate()
            .filter(|(bit, _)| code & (1 << bit) != 0)
            .map(|(_, msg)| msg.to_string())
            .collect();

        Ok((code, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// A SUT replying with canned stdout, to exercise the generic probes.
    struct CannedSut {
        replies: Mutex<HashMap<&'static str, (String, i32)>>,
        start_failures: Mutex<usize>,
        stops: Mutex<usize>,
    }

    impl CannedSut {
        fn new(replies: &[(&'static str, &str)]) -> Self {
            CannedSut {
                replies: Mutex::new(
                    replies
                        .iter()
                        .map(|(cmd, out)| (*cmd, (out.to_string(), 0)))
                        .collect(),
                ),
                start_failures: Mutex::new(0),
                stops: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Sut for CannedSut {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn config_help(&self) -> &'static [ConfigOption] {
            &[]
        }

        fn setup(&self, _config: SutConfig) -> Result<(), SutError> {
            Ok(())
        }

        fn parallel_execution(&self) -> bool {
            true
        }

        async fn is_running(&self) -> bool {
            true
        }

        async fn ping(&self) -> Result<Duration, SutError> {
            Ok(Duration::from_millis(1))
        }

        async fn start(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
            let mut failures = self.start_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SutError::Transport("start failed".to_string()));
            }
            Ok(())
        }

        async fn stop(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }

        async fn run_command(
            &self,
            command: &str,
            iobuffer: &dyn IoSink,
        ) -> Result<CommandOutcome, SutError> {
            let (stdout, returncode) = self
                .replies
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or(("".to_string(), 1));

            iobuffer.write(stdout.as_bytes()).await;

            Ok(CommandOutcome {
                command: command.to_string(),
                stdout: stdout.into_bytes(),
                returncode,
                exec_time: Duration::from_millis(1),
            })
        }

        async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError> {
            Err(SutError::FileNotFound(target_path.to_path_buf()))
        }
    }

    #[tokio::test]
    async fn info_parses_probe_output() {
        let sut = CannedSut::new(&[
            (". /etc/os-release; echo \"$ID\"", "opensuse-leap\n"),
            (". /etc/os-release; echo \"$VERSION_ID\"", "15.3\n"),
            ("uname -s -r -v", "Linux 5.17 #1 SMP\n"),
            ("uname -m", "x86_64\n"),
            ("uname -p", "x86_64\n"),
            (
                "cat /proc/meminfo",
                "MemTotal:       16384 kB\nSwapTotal:      1024 kB\n",
            ),
        ]);

        let info = sut.info().await.unwrap();
        assert_eq!(
            info,
            HostInfo {
                distro: "opensuse-leap".to_string(),
                distro_ver: "15.3".to_string(),
                kernel: "Linux 5.17 #1 SMP".to_string(),
                arch: "x86_64".to_string(),
                cpu: "x86_64".to_string(),
                ram: "16384 kB".to_string(),
                swap: "1024 kB".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn info_fails_without_meminfo_fields() {
        let sut = CannedSut::new(&[
            (". /etc/os-release; echo \"$ID\"", "opensuse-leap\n"),
            (". /etc/os-release; echo \"$VERSION_ID\"", "15.3\n"),
            ("uname -s -r -v", "Linux\n"),
            ("uname -m", "x86_64\n"),
            ("uname -p", "x86_64\n"),
            ("cat /proc/meminfo", "MemTotal:       16384 kB\n"),
        ]);

        assert!(matches!(sut.info().await, Err(SutError::Info(_))));
    }

    #[tokio::test]
    async fn tainted_info_maps_bits_to_messages() {
        let sut = CannedSut::new(&[("cat /proc/sys/kernel/tainted", "4097\n")]);

        let (code, messages) = sut.tainted_info().await.unwrap();
        assert_eq!(code, 4097);
        // bits 0 and 12
        assert_eq!(
            messages,
            vec![
                TAINT_MESSAGES[0].to_string(),
                TAINT_MESSAGES[12].to_string()
            ]
        );
    }

    #[tokio::test]
    async fn tainted_info_zero_has_no_messages() {
        let sut = CannedSut::new(&[("cat /proc/sys/kernel/tainted", "0\n")]);

        let (code, messages) = sut.tainted_info().await.unwrap();
        assert_eq!(code, 0);
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn ensure_start_retries_then_succeeds() {
        let sut = CannedSut::new(&[]);
        *sut.start_failures.lock().unwrap() = 2;

        sut.ensure_start(&NullSink, 5).await.unwrap();
        assert_eq!(*sut.stops.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn ensure_start_gives_up_after_retries() {
        let sut = CannedSut::new(&[]);
        *sut.start_failures.lock().unwrap() = 10;

        assert!(sut.ensure_start(&NullSink, 3).await.is_err());
        assert_eq!(*sut.stops.lock().unwrap(), 2);
    }
}
