// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LTX request/reply session.
//!
//! A dedicated reader task polls the server's stdout, feeds a streaming
//! decoder, and distributes each decoded frame to the queue of in-flight
//! requests in insertion order. A request accepts frames and signals
//! completion exactly once; the server is assumed to preserve per-slot
//! reply ordering, so the client never reorders.

use crate::{
    errors::LtxError,
    ltx::protocol::{self, FrameDecoder, Request, frame_bytes, frame_code, frame_slot},
};
use rmpv::Value;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tracing::{debug, warn};

const POISONED: &str = "ltx session lock poisoned";

/// A completed request's reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    /// Server version string.
    Version(String),
    /// Monotonic-ns timestamp from the server.
    Pong(u64),
    /// Full content of the requested file.
    GetFile(Vec<u8>),
    SetFile,
    Env,
    Cwd,
    /// Command completion, with the accumulated stdout.
    Exec {
        stdout: Vec<u8>,
        time_ns: u64,
        si_code: i64,
        si_status: i64,
    },
    Kill,
}

/// An in-flight request: the wire request plus its accumulation state and
/// completion channel.
struct Pending {
    request: Request,
    echoed: bool,
    data: Vec<u8>,
    stdout_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    done: Option<oneshot::Sender<Result<Reply, LtxError>>>,
}

impl Pending {
    fn is_completed(&self) -> bool {
        self.done.is_none()
    }

    fn complete(&mut self, result: Result<Reply, LtxError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    /// Feeds a decoded frame into the request.
    ///
    /// Frames that don't concern this request are ignored; protocol
    /// violations are returned as errors and fail the request.
    fn feed(&mut self, frame: &[Value]) -> Result<(), LtxError> {
        if self.is_completed() {
            return Ok(());
        }

        let code = frame_code(frame)?;

        match &self.request {
            Request::Version => {
                if code == protocol::VERSION {
                    let version = frame
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();

                    debug!(version, "VERSION echoed back");
                    self.complete(Ok(Reply::Version(version)));
                }
            }
            Request::Ping => match code {
                protocol::PING => {
                    debug!("PING echoed back, waiting for PONG");
                    self.echoed = true;
                }
                protocol::PONG => {
                    if !self.echoed {
                        return Err(LtxError::Protocol(
                            "PONG received without PING echo".to_string(),
                        ));
                    }

                    let time_ns = frame.get(1).and_then(Value::as_u64).unwrap_or(0);
                    self.complete(Ok(Reply::Pong(time_ns)));
                }
                _ => {}
            },
            Request::GetFile { .. } => match code {
                protocol::DATA => {
                    if let Some(bytes) = frame.get(1).and_then(frame_bytes) {
                        self.data.extend_from_slice(bytes);
                    }
                }
                protocol::GET_FILE => {
                    debug!("GET_FILE echoed back");
                    let data = std::mem::take(&mut self.data);
                    self.complete(Ok(Reply::GetFile(data)));
                }
                _ => {}
            },
            Request::SetFile { path, .. } => {
                if code == protocol::SET_FILE
                    && frame.get(1).and_then(Value::as_str) == Some(path)
                {
                    debug!("SET_FILE echoed back");
                    self.complete(Ok(Reply::SetFile));
                }
            }
            Request::Env { slot, .. } => {
                if code == protocol::ENV && frame_slot(frame) == Some(u64::from(*slot)) {
                    debug!("ENV echoed back");
                    self.complete(Ok(Reply::Env));
                }
            }
            Request::Cwd { slot, .. } => {
                if code == protocol::CWD && frame_slot(frame) == Some(u64::from(*slot)) {
                    debug!("CWD echoed back");
                    self.complete(Ok(Reply::Cwd));
                }
            }
            Request::Kill { slot } => {
                if code == protocol::KILL && frame_slot(frame) == Some(u64::from(*slot)) {
                    debug!("KILL echoed back");
                    self.complete(Ok(Reply::Kill));
                }
            }
            Request::Exec { slot, .. } => {
                if frame_slot(frame) != Some(u64::from(*slot)) {
                    return Ok(());
                }

                match code {
                    protocol::EXEC => {
                        debug!("EXEC echoed back");
                        self.echoed = true;
                    }
                    protocol::LOG => {
                        if !self.echoed {
                            return Err(LtxError::Protocol(
                                "LOG received without EXEC echo".to_string(),
                            ));
                        }

                        if let Some(chunk) = frame.get(3).and_then(frame_bytes) {
                            self.data.extend_from_slice(chunk);

                            if let Some(tx) = &self.stdout_tx {
                                let _ = tx.send(chunk.to_vec());
                            }
                        }
                    }
                    protocol::RESULT => {
                        if !self.echoed {
                            return Err(LtxError::Protocol(
                                "RESULT received without EXEC echo".to_string(),
                            ));
                        }

                        let time_ns = frame.get(2).and_then(Value::as_u64).unwrap_or(0);
                        let si_code = frame.get(3).and_then(Value::as_i64).unwrap_or(0);
                        let si_status = frame.get(4).and_then(Value::as_i64).unwrap_or(0);
                        let stdout = std::mem::take(&mut self.data);

                        self.complete(Ok(Reply::Exec {
                            stdout,
                            time_ns,
                            si_code,
                            si_status,
                        }));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

struct Inner {
    requests: Mutex<VecDeque<Pending>>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    connected: AtomicBool,
    stop: AtomicBool,
}

/// The client side of an LTX connection.
pub(crate) struct LtxSession {
    inner: Arc<Inner>,
}

impl LtxSession {
    const BUFSIZE: usize = 1 << 16;

    /// Starts a session over the given descriptor halves, spawning the
    /// reader task.
    pub(crate) fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            requests: Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            connected: AtomicBool::new(true),
            stop: AtomicBool::new(false),
        });

        tokio::spawn(Self::reader_loop(inner.clone(), reader));

        LtxSession { inner }
    }

    /// True while the reader task is alive.
    pub(crate) fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Stops the reader task and fails any request still in flight.
    pub(crate) async fn disconnect(&self) {
        if !self.connected() {
            return;
        }

        debug!("disconnecting");

        self.inner.stop.store(true, Ordering::SeqCst);

        while self.connected() {
            sleep(Duration::from_millis(10)).await;
        }

        debug!("disconnected");
    }

    /// Sends a request, returning the channel its reply will arrive on.
    ///
    /// `stdout_tx` receives stdout chunks as LOG frames arrive, for EXEC
    /// requests.
    pub(crate) async fn send(
        &self,
        request: Request,
        stdout_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ) -> Result<oneshot::Receiver<Result<Reply, LtxError>>, LtxError> {
        if !self.connected() {
            return Err(LtxError::SessionClosed);
        }

        let encoded = request.encode()?;
        let (done_tx, done_rx) = oneshot::channel();

        let mut writer = self.inner.writer.lock().await;

        // registration order must match wire order, so enqueue while
        // holding the writer
        self.inner
            .requests
            .lock()
            .expect(POISONED)
            .push_back(Pending {
                request,
                echoed: false,
                data: Vec::new(),
                stdout_tx,
                done: Some(done_tx),
            });

        writer.write_all(&encoded).await?;
        writer.flush().await?;

        Ok(done_rx)
    }

    /// Sends a request and waits for its reply under a deadline.
    pub(crate) async fn request(
        &self,
        request: Request,
        limit: Duration,
    ) -> Result<Reply, LtxError> {
        let done_rx = self.send(request, None).await?;

        match timeout(limit, done_rx).await {
            Err(_) => Err(LtxError::RequestTimeout),
            Ok(Err(_)) => Err(LtxError::SessionClosed),
            Ok(Ok(reply)) => reply,
        }
    }

    async fn reader_loop<R>(inner: Arc<Inner>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        debug!("starting message polling");

        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; Self::BUFSIZE];

        'outer: loop {
            if inner.stop.load(Ordering::SeqCst) {
                break;
            }

            match timeout(Duration::from_millis(100), reader.read(&mut chunk)).await {
                // poll tick, go check the stop flag
                Err(_) => continue,
                Ok(Ok(0)) => break,
                Ok(Ok(read)) => {
                    decoder.extend(&chunk[..read]);

                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => Self::dispatch(&inner, &frame),
                            Ok(None) => break,
                            Err(err) => {
                                warn!(error = %err, "undecodable LTX stream");
                                Self::fail_all(&inner, &err.to_string());
                                break 'outer;
                            }
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "LTX read failure");
                    Self::fail_all(&inner, &err.to_string());
                    break;
                }
            }
        }

        inner.connected.store(false, Ordering::SeqCst);

        // anything still in flight will never complete
        let mut requests = inner.requests.lock().expect(POISONED);
        for mut pending in requests.drain(..) {
            pending.complete(Err(LtxError::SessionClosed));
        }

        debug!("ending message polling");
    }

    fn dispatch(inner: &Inner, frame: &[Value]) {
        let code = match frame_code(frame) {
            Ok(code) => code,
            Err(err) => {
                warn!(error = %err, "dropping malformed frame");
                return;
            }
        };

        let mut requests = inner.requests.lock().expect(POISONED);

        if code == protocol::ERROR {
            let message = frame
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("unknown LTX error")
                .to_string();

            for mut pending in requests.drain(..) {
                pending.complete(Err(LtxError::Remote(message.clone())));
            }

            return;
        }

        // every in-flight request sees the frame, in insertion order
        let mut index = 0;
        while index < requests.len() {
            match requests[index].feed(frame) {
                Ok(()) => {
                    if requests[index].is_completed() {
                        requests.remove(index);
                    } else {
                        index += 1;
                    }
                }
                Err(err) => {
                    if let Some(mut pending) = requests.remove(index) {
                        pending.complete(Err(err));
                    }
                }
            }
        }
    }

    fn fail_all(inner: &Inner, message: &str) {
        let mut requests = inner.requests.lock().expect(POISONED);
        for mut pending in requests.drain(..) {
            pending.complete(Err(LtxError::Decode(message.to_string())));
        }
    }
}
