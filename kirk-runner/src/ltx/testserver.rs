// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A miniature in-process LTX server used by the protocol and transport
//! tests. It understands just enough of a shell to cover the commands the
//! tests run.

use crate::ltx::{
    monotonic_ns,
    protocol::{self, FrameDecoder, frame_bytes, frame_code, frame_slot},
};
use rmpv::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::sleep,
};

/// Version string the server hands back on VERSION.
pub(crate) const SERVER_VERSION: &str = "0.1";

/// Magic command making the server reply with an ERROR frame.
pub(crate) const TRIGGER_ERROR: &str = "trigger-error";

struct State {
    files: HashMap<String, Vec<u8>>,
    env: HashMap<String, String>,
}

async fn write_frame<W>(writer: &Arc<tokio::sync::Mutex<W>>, items: Vec<Value>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &Value::Array(items)).expect("frame encodes");

    // best effort: the client may already be gone
    let mut writer = writer.lock().await;
    if writer.write_all(&buf).await.is_ok() {
        let _ = writer.flush().await;
    }
}

/// Serves LTX frames until the client side closes.
pub(crate) async fn serve<R, W>(mut reader: R, writer: W)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    let state = Arc::new(Mutex::new(State {
        files: HashMap::new(),
        env: HashMap::new(),
    }));

    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];

    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };

        decoder.extend(&chunk[..read]);

        while let Ok(Some(frame)) = decoder.next_frame() {
            handle_frame(&frame, &writer, &state).await;
        }
    }
}

async fn handle_frame<W>(
    frame: &[Value],
    writer: &Arc<tokio::sync::Mutex<W>>,
    state: &Arc<Mutex<State>>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let Ok(code) = frame_code(frame) else {
        return;
    };

    match code {
        protocol::VERSION => {
            write_frame(
                writer,
                vec![
                    Value::from(protocol::VERSION),
                    Value::from(SERVER_VERSION),
                ],
            )
            .await;
        }
        protocol::PING => {
            write_frame(writer, vec![Value::from(protocol::PING)]).await;
            write_frame(
                writer,
                vec![Value::from(protocol::PONG), Value::from(monotonic_ns())],
            )
            .await;
        }
        protocol::ENV => {
            let slot = frame_slot(frame).unwrap_or(0);
            let key = frame.get(2).and_then(Value::as_str).unwrap_or_default();
            let value = frame.get(3).and_then(Value::as_str).unwrap_or_default();

            state
                .lock()
                .unwrap()
                .env
                .insert(key.to_string(), value.to_string());

            write_frame(
                writer,
                vec![Value::from(protocol::ENV), Value::from(slot)],
            )
            .await;
        }
        protocol::CWD => {
            let slot = frame_slot(frame).unwrap_or(0);
            write_frame(
                writer,
                vec![Value::from(protocol::CWD), Value::from(slot)],
            )
            .await;
        }
        protocol::SET_FILE => {
            let path = frame
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let data = frame
                .get(2)
                .and_then(frame_bytes)
                .unwrap_or_default()
                .to_vec();

            state.lock().unwrap().files.insert(path.clone(), data);

            write_frame(
                writer,
                vec![Value::from(protocol::SET_FILE), Value::from(path.as_str())],
            )
            .await;
        }
        protocol::GET_FILE => {
            let path = frame
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let data = state
                .lock()
                .unwrap()
                .files
                .get(&path)
                .cloned()
                .or_else(|| std::fs::read(&path).ok())
                .unwrap_or_default();

            // split the payload so the client exercises DATA accumulation
            let half = data.len() / 2;
            write_frame(
                writer,
                vec![
                    Value::from(protocol::DATA),
                    Value::Binary(data[..half].to_vec()),
                ],
            )
            .await;
            write_frame(
                writer,
                vec![
                    Value::from(protocol::DATA),
                    Value::Binary(data[half..].to_vec()),
                ],
            )
            .await;
            write_frame(
                writer,
                vec![Value::from(protocol::GET_FILE), Value::from(path.as_str())],
            )
            .await;
        }
        protocol::KILL => {
            let slot = frame_slot(frame).unwrap_or(0);
            write_frame(
                writer,
                vec![Value::from(protocol::KILL), Value::from(slot)],
            )
            .await;
            // the killed command reports CLD_KILLED with SIGKILL
            write_frame(
                writer,
                vec![
                    Value::from(protocol::RESULT),
                    Value::from(slot),
                    Value::from(monotonic_ns()),
                    Value::from(2u8),
                    Value::from(9u8),
                ],
            )
            .await;
        }
        protocol::EXEC => {
            let slot = frame_slot(frame).unwrap_or(0);
            let command = frame
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            write_frame(
                writer,
                vec![Value::from(protocol::EXEC), Value::from(slot)],
            )
            .await;

            if command == TRIGGER_ERROR {
                write_frame(
                    writer,
                    vec![Value::from(protocol::ERROR), Value::from("boom")],
                )
                .await;
                return;
            }

            let writer = writer.clone();
            let state = state.clone();

            // commands run concurrently, one task per slot
            tokio::spawn(async move {
                let (stdout, status) = emulate(&command, &state).await;

                if !stdout.is_empty() {
                    write_frame(
                        &writer,
                        vec![
                            Value::from(protocol::LOG),
                            Value::from(slot),
                            Value::from(monotonic_ns()),
                            Value::from(String::from_utf8_lossy(&stdout).into_owned().as_str()),
                        ],
                    )
                    .await;
                }

                write_frame(
                    &writer,
                    vec![
                        Value::from(protocol::RESULT),
                        Value::from(slot),
                        Value::from(monotonic_ns()),
                        Value::from(1u8),
                        Value::from(status),
                    ],
                )
                .await;
            });
        }
        _ => {
            write_frame(
                writer,
                vec![
                    Value::from(protocol::ERROR),
                    Value::from("unknown message type"),
                ],
            )
            .await;
        }
    }
}

/// A tiny command emulator covering what the tests execute.
async fn emulate(command: &str, state: &Arc<Mutex<State>>) -> (Vec<u8>, i64) {
    let tokens: Vec<&str> = command.split_whitespace().collect();

    match tokens.as_slice() {
        ["echo", "-n", rest @ ..] => (rest.join(" ").into_bytes(), 0),
        ["echo", rest @ ..] => (format!("{}\n", rest.join(" ")).into_bytes(), 0),
        ["printenv", key] => match state.lock().unwrap().env.get(*key) {
            Some(value) => (format!("{value}\n").into_bytes(), 0),
            None => (Vec::new(), 1),
        },
        ["sleep", secs] => {
            let secs: f64 = secs.parse().unwrap_or(0.0);
            sleep(Duration::from_secs_f64(secs)).await;
            (Vec::new(), 0)
        }
        ["cat", "/proc/sys/kernel/tainted"] => (b"0\n".to_vec(), 0),
        ["test", "."] => (Vec::new(), 0),
        _ => (Vec::new(), 127),
    }
}
