// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SUT implementation communicating over SSH.

use crate::{
    errors::SutError,
    sut::{CommandOutcome, ConfigOption, IoSink, NullSink, Sut, SutConfig},
};
use async_trait::async_trait;
use bstr::ByteSlice;
use camino::{Utf8Path, Utf8PathBuf};
use russh::{
    ChannelMsg, Disconnect, Sig,
    client::{self, AuthResult, Handle, Handler},
    keys::{self, PrivateKeyWithHashAlg, PublicKey},
};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{Semaphore, watch},
};
use tracing::{debug, info};

const POISONED: &str = "ssh SUT lock poisoned";

/// Command scraping the session limit out of the remote sshd configuration.
const MAX_SESSIONS_CMD: &str =
    r#"sed -n "s/^MaxSessions\s*\([[:digit:]]*\)/\1/p" /etc/ssh/sshd_config"#;

const DEFAULT_MAX_SESSIONS: usize = 10;

struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Clone, Debug, Default)]
struct SshConfig {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key_file: Option<Utf8PathBuf>,
    reset_cmd: Option<String>,
    sudo: bool,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
}

/// SUT implementation using the SSH protocol to communicate and transfer
/// data.
pub struct SshSut {
    config: Mutex<SshConfig>,
    handle: tokio::sync::Mutex<Option<Arc<Handle<ClientHandler>>>>,
    session_sem: Mutex<Option<Arc<Semaphore>>>,
    stopping: AtomicBool,
    // flipped to true while stop runs; every open channel reacts by
    // signalling its remote process
    kill: watch::Sender<bool>,
}

impl Default for SshSut {
    fn default() -> Self {
        Self::new()
    }
}

impl SshSut {
    const BUFSIZE: usize = 1024;

    /// Creates an unconfigured SSH SUT.
    pub fn new() -> Self {
        SshSut {
            config: Mutex::new(SshConfig::default()),
            handle: tokio::sync::Mutex::new(None),
            session_sem: Mutex::new(None),
            stopping: AtomicBool::new(false),
            kill: watch::Sender::new(false),
        }
    }

    fn transport_err(err: russh::Error) -> SutError {
        SutError::Transport(err.to_string())
    }

    /// Wraps a command so that it runs with the configured cwd, environment
    /// and, optionally, under `sudo /bin/sh -c`.
    fn create_command(config: &SshConfig, cmd: &str) -> String {
        let mut script = String::new();

        if let Some(cwd) = &config.cwd {
            let _ = write!(script, "cd {cwd};");
        }

        for (key, value) in &config.env {
            let _ = write!(script, "export {key}={value};");
        }

        script.push_str(cmd);

        if config.sudo {
            script = format!("sudo /bin/sh -c {}", shell_words::quote(&script));
        }

        script
    }

    async fn cloned_handle(&self) -> Result<Arc<Handle<ClientHandler>>, SutError> {
        self.handle
            .lock()
            .await
            .clone()
            .ok_or(SutError::NotRunning)
    }

    async fn exec_channel(
        &self,
        handle: &Handle<ClientHandler>,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<(CommandOutcome, bool), SutError> {
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(Self::transport_err)?;
        channel
            .exec(true, command.as_bytes())
            .await
            .map_err(Self::transport_err)?;

        let start = Instant::now();
        let mut kill = self.kill.subscribe();
        let mut stdout: Vec<u8> = Vec::new();
        let mut returncode = None;
        let mut panic = false;

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    let Some(msg) = msg else { break };

                    match msg {
                        ChannelMsg::Data { ref data } => {
                            stdout.extend_from_slice(data);
                            iobuffer.write(data).await;

                            let window = stdout.len().saturating_sub(2 * Self::BUFSIZE);
                            if stdout[window..].contains_str("Kernel panic") {
                                panic = true;
                                break;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            returncode = Some(exit_status as i32);
                        }
                        _ => {}
                    }
                }
                _ = async { let _ = kill.wait_for(|stop| *stop).await; } => {
                    debug!(command, "killing remote process");
                    let _ = channel.signal(Sig::KILL).await;
                    let _ = channel.close().await;
                    break;
                }
            }
        }

        let exec_time = start.elapsed();

        Ok((
            CommandOutcome {
                command: command.to_string(),
                stdout,
                returncode: returncode.unwrap_or(-1),
                exec_time,
            },
            panic,
        ))
    }

    /// Runs the host-local reset command, tee-ing its stdout to the sink.
    async fn reset(&self, iobuffer: &dyn IoSink) -> Result<(), SutError> {
        let reset_cmd = self.config.lock().expect(POISONED).reset_cmd.clone();
        let Some(reset_cmd) = reset_cmd else {
            return Ok(());
        };

        info!(command = %reset_cmd, "executing reset command");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&reset_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdout) = child.stdout.take() {
            let mut chunk = [0u8; Self::BUFSIZE];
            loop {
                let read = stdout.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                iobuffer.write(&chunk[..read]).await;
            }
        }

        child.wait().await?;

        info!("reset command has been executed");

        Ok(())
    }
}

#[async_trait]
impl Sut for SshSut {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn config_help(&self) -> &'static [ConfigOption] {
        &[
            ConfigOption {
                key: "host",
                help: "IP address of the SUT (default: localhost)",
            },
            ConfigOption {
                key: "port",
                help: "TCP port of the service (default: 22)",
            },
            ConfigOption {
                key: "user",
                help: "name of the user (default: root)",
            },
            ConfigOption {
                key: "password",
                help: "root password",
            },
            ConfigOption {
                key: "key_file",
                help: "private key location",
            },
            ConfigOption {
                key: "reset_cmd",
                help: "command to reset the remote SUT",
            },
            ConfigOption {
                key: "sudo",
                help: "use sudo to access to root shell (default: 0)",
            },
        ]
    }

    fn setup(&self, config: SutConfig) -> Result<(), SutError> {
        info!("initialize SUT");

        let params = &config.params;

        let port: u16 = match params.get("port") {
            None => 22,
            Some(value) => value
                .parse()
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| {
                    SutError::Config("'port' must be an integer between 1-65535".to_string())
                })?,
        };

        let sudo = match params.get("sudo").map(String::as_str) {
            None | Some("0") => false,
            Some("1") => true,
            Some(_) => return Err(SutError::Config("'sudo' must be 0 or 1".to_string())),
        };

        *self.config.lock().expect(POISONED) = SshConfig {
            host: params
                .get("host")
                .cloned()
                .unwrap_or_else(|| "localhost".to_string()),
            port,
            user: params
                .get("user")
                .cloned()
                .unwrap_or_else(|| "root".to_string()),
            password: params.get("password").cloned(),
            key_file: params.get("key_file").map(Utf8PathBuf::from),
            reset_cmd: params.get("reset_cmd").cloned(),
            sudo,
            cwd: config.cwd,
            env: config.env,
        };

        Ok(())
    }

    fn parallel_execution(&self) -> bool {
        true
    }

    async fn is_running(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    async fn ping(&self) -> Result<Duration, SutError> {
        let handle = self.cloned_handle().await?;

        debug!("pinging SUT");

        let (ret, _) = self.exec_channel(&handle, "test .", &NullSink).await?;
        if ret.returncode != 0 {
            return Err(SutError::Transport("SUT is not replying".to_string()));
        }

        debug!(reply_time = ?ret.exec_time, "SUT replied");

        Ok(ret.exec_time)
    }

    async fn start(&self, _iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if self.is_running().await {
            return Err(SutError::AlreadyRunning);
        }

        let config = self.config.lock().expect(POISONED).clone();

        info!(host = %config.host, port = config.port, "connecting to SUT");

        let client_config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            client_config,
            (config.host.as_str(), config.port),
            ClientHandler,
        )
        .await
        .map_err(Self::transport_err)?;

        let auth = if let Some(key_file) = &config.key_file {
            let key = keys::load_secret_key(key_file.as_std_path(), None)
                .map_err(|err| SutError::Config(format!("can't load private key: {err}")))?;
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(Self::transport_err)?
                .flatten();

            handle
                .authenticate_publickey(
                    config.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                )
                .await
                .map_err(Self::transport_err)?
        } else {
            handle
                .authenticate_password(
                    config.user.clone(),
                    config.password.clone().unwrap_or_default(),
                )
                .await
                .map_err(Self::transport_err)?
        };

        if !matches!(auth, AuthResult::Success) {
            return Err(SutError::Transport(
                "remote authentication failed".to_string(),
            ));
        }

        // limit concurrent run_command calls to the remote session limit
        let (ret, _) = self
            .exec_channel(&handle, MAX_SESSIONS_CMD, &NullSink)
            .await?;
        let max_sessions = ret
            .stdout_lossy()
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_SESSIONS);

        info!(max_sessions, "maximum SSH sessions");

        *self.session_sem.lock().expect(POISONED) = Some(Arc::new(Semaphore::new(max_sessions)));
        *self.handle.lock().await = Some(Arc::new(handle));

        Ok(())
    }

    async fn stop(&self, iobuffer: &dyn IoSink) -> Result<(), SutError> {
        if !self.is_running().await {
            return Ok(());
        }

        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.kill.send(true);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            info!("closing connection");
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            info!("connection closed");
        }

        *self.session_sem.lock().expect(POISONED) = None;

        let ret = self.reset(iobuffer).await;

        let _ = self.kill.send(false);
        self.stopping.store(false, Ordering::SeqCst);

        ret
    }

    async fn run_command(
        &self,
        command: &str,
        iobuffer: &dyn IoSink,
    ) -> Result<CommandOutcome, SutError> {
        if command.is_empty() {
            return Err(SutError::Config("command is empty".to_string()));
        }

        let handle = self.cloned_handle().await?;
        let sem = self
            .session_sem
            .lock()
            .expect(POISONED)
            .clone()
            .ok_or(SutError::NotRunning)?;

        let _permit = sem
            .acquire_owned()
            .await
            .map_err(|_| SutError::NotRunning)?;

        debug!(command, "running command");

        let script = Self::create_command(&self.config.lock().expect(POISONED).clone(), command);
        let (mut ret, panic) = self.exec_channel(&handle, &script, iobuffer).await?;

        // report the original command, not the wrapped script
        ret.command = command.to_string();

        if panic {
            return Err(SutError::KernelPanic);
        }

        debug!(command, returncode = ret.returncode, "command executed");

        Ok(ret)
    }

    async fn fetch_file(&self, target_path: &Utf8Path) -> Result<Vec<u8>, SutError> {
        let handle = self.cloned_handle().await?;

        debug!(path = %target_path, "downloading file");

        let (ret, _) = self
            .exec_channel(&handle, &format!("cat {target_path}"), &NullSink)
            .await?;

        if ret.returncode != 0 {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }

            return Err(SutError::FileNotFound(target_path.to_path_buf()));
        }

        debug!(path = %target_path, bytes = ret.stdout.len(), "file copied");

        Ok(ret.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_with(params: &[(&str, &str)]) -> SutConfig {
        SutConfig {
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..SutConfig::default()
        }
    }

    #[test]
    fn setup_defaults() {
        let sut = SshSut::new();
        sut.setup(config_with(&[])).unwrap();

        let config = sut.config.lock().unwrap().clone();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "root");
        assert!(!config.sudo);
    }

    #[test]
    fn setup_rejects_bad_port() {
        let sut = SshSut::new();
        for port in ["0", "65536", "not-a-port"] {
            assert!(
                matches!(
                    sut.setup(config_with(&[("port", port)])),
                    Err(SutError::Config(_))
                ),
                "port {port} must be rejected"
            );
        }
    }

    #[test]
    fn setup_rejects_bad_sudo() {
        let sut = SshSut::new();
        assert!(matches!(
            sut.setup(config_with(&[("sudo", "yes")])),
            Err(SutError::Config(_))
        ));
    }

    #[test]
    fn create_command_applies_cwd_env_and_sudo() {
        let mut config = SshConfig {
            cwd: Some(Utf8PathBuf::from("/opt/ltp/testcases/bin")),
            ..SshConfig::default()
        };
        config
            .env
            .insert("LTPROOT".to_string(), "/opt/ltp".to_string());

        assert_eq!(
            SshSut::create_command(&config, "echo 0"),
            "cd /opt/ltp/testcases/bin;export LTPROOT=/opt/ltp;echo 0"
        );

        config.sudo = true;
        assert_eq!(
            SshSut::create_command(&config, "echo 0"),
            "sudo /bin/sh -c 'cd /opt/ltp/testcases/bin;export LTPROOT=/opt/ltp;echo 0'"
        );
    }

    #[tokio::test]
    async fn run_command_requires_connection() {
        let sut = SshSut::new();
        sut.setup(config_with(&[])).unwrap();

        assert!(matches!(
            sut.run_command("echo 0", &NullSink).await,
            Err(SutError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn stop_without_connection_is_noop() {
        let sut = SshSut::new();
        sut.setup(config_with(&[])).unwrap();
        sut.stop(&NullSink).await.unwrap();
    }
}
