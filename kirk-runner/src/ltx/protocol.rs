// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LTX frame codec.
//!
//! Each frame is a msgpack array whose first element is the message-type
//! byte. Strings are UTF-8, numbers are 64-bit integers where meaningful,
//! file payloads are raw bytes.

use crate::errors::LtxError;
use bytes::{Buf, BytesMut};
use rmpv::Value;
use std::io::{self, Cursor};

/// VERSION message type.
pub const VERSION: u8 = 0x00;
/// PING message type.
pub const PING: u8 = 0x01;
/// PONG message type.
pub const PONG: u8 = 0x02;
/// GET_FILE message type.
pub const GET_FILE: u8 = 0x03;
/// SET_FILE message type.
pub const SET_FILE: u8 = 0x04;
/// ENV message type.
pub const ENV: u8 = 0x05;
/// CWD message type.
pub const CWD: u8 = 0x06;
/// EXEC message type.
pub const EXEC: u8 = 0x07;
/// RESULT message type.
pub const RESULT: u8 = 0x08;
/// LOG message type.
pub const LOG: u8 = 0x09;
/// DATA message type.
pub const DATA: u8 = 0xa0;
/// KILL message type.
pub const KILL: u8 = 0xa1;
/// ERROR message type.
pub const ERROR: u8 = 0xff;

/// Number of per-command execution slots.
pub const MAX_SLOTS: u32 = 128;
/// Sentinel slot meaning "broadcast to all slots" for ENV and CWD.
pub const ALL_SLOTS: u32 = 128;

/// A request sent to the LTX server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Protocol version handshake.
    Version,
    /// Liveness probe; the server replies with a PONG timestamp.
    Ping,
    /// Read a whole file; the server streams DATA frames then echoes.
    GetFile {
        /// Path of the file on the server.
        path: String,
    },
    /// Write a whole file; the server echoes on completion.
    SetFile {
        /// Path of the file on the server.
        path: String,
        /// Raw content.
        data: Vec<u8>,
    },
    /// Set an environment variable on a slot, or on all slots.
    Env {
        /// Slot id, or [`ALL_SLOTS`].
        slot: u32,
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Set the working directory of a slot, or of all slots.
    Cwd {
        /// Slot id, or [`ALL_SLOTS`].
        slot: u32,
        /// Directory path.
        path: String,
    },
    /// Execute a command on a slot.
    Exec {
        /// Slot id.
        slot: u32,
        /// Command argv.
        argv: Vec<String>,
    },
    /// Kill the command occupying a slot.
    Kill {
        /// Slot id.
        slot: u32,
    },
}

impl Request {
    /// The message-type byte of this request.
    pub fn code(&self) -> u8 {
        match self {
            Request::Version => VERSION,
            Request::Ping => PING,
            Request::GetFile { .. } => GET_FILE,
            Request::SetFile { .. } => SET_FILE,
            Request::Env { .. } => ENV,
            Request::Cwd { .. } => CWD,
            Request::Exec { .. } => EXEC,
            Request::Kill { .. } => KILL,
        }
    }

    /// The slot this request is routed to, when it has one.
    pub fn slot(&self) -> Option<u32> {
        match self {
            Request::Env { slot, .. } | Request::Cwd { slot, .. } => Some(*slot),
            Request::Exec { slot, .. } | Request::Kill { slot } => Some(*slot),
            _ => None,
        }
    }

    /// Encodes the request as a msgpack frame.
    ///
    /// Slot bounds are validated here: ENV and CWD accept the broadcast
    /// sentinel, EXEC and KILL do not.
    pub fn encode(&self) -> Result<Vec<u8>, LtxError> {
        let mut items = vec![Value::from(self.code())];

        match self {
            Request::Version | Request::Ping => {}
            Request::GetFile { path } => {
                items.push(Value::from(path.as_str()));
            }
            Request::SetFile { path, data } => {
                items.push(Value::from(path.as_str()));
                items.push(Value::Binary(data.clone()));
            }
            Request::Env { slot, key, value } => {
                check_slot(*slot, true)?;
                items.push(Value::from(*slot));
                items.push(Value::from(key.as_str()));
                items.push(Value::from(value.as_str()));
            }
            Request::Cwd { slot, path } => {
                check_slot(*slot, true)?;
                items.push(Value::from(*slot));
                items.push(Value::from(path.as_str()));
            }
            Request::Exec { slot, argv } => {
                check_slot(*slot, false)?;
                items.push(Value::from(*slot));
                for arg in argv {
                    items.push(Value::from(arg.as_str()));
                }
            }
            Request::Kill { slot } => {
                check_slot(*slot, false)?;
                items.push(Value::from(*slot));
            }
        }

        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(items))
            .map_err(|err| LtxError::Encode(err.to_string()))?;

        Ok(buf)
    }
}

fn check_slot(slot: u32, allow_broadcast: bool) -> Result<(), LtxError> {
    let bound = if allow_broadcast {
        ALL_SLOTS
    } else {
        MAX_SLOTS - 1
    };

    if slot > bound {
        return Err(LtxError::InvalidSlot(slot));
    }

    Ok(())
}

/// The message-type byte of a decoded frame.
pub fn frame_code(frame: &[Value]) -> Result<u8, LtxError> {
    frame
        .first()
        .and_then(Value::as_u64)
        .and_then(|code| u8::try_from(code).ok())
        .ok_or_else(|| LtxError::Protocol("frame carries no message type".to_string()))
}

/// The slot element of a decoded frame, when present.
pub fn frame_slot(frame: &[Value]) -> Option<u64> {
    frame.get(1).and_then(Value::as_u64)
}

/// Raw bytes of a frame element, accepting both string and binary
/// encodings.
pub fn frame_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::String(text) => Some(text.as_bytes()),
        Value::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

/// A streaming frame decoder, resilient to frame boundaries falling inside
/// read chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes into the decoder.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decodes the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<Value>>, LtxError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buf[..]);

        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);

                match value {
                    Value::Array(items) => Ok(Some(items)),
                    other => Err(LtxError::Protocol(format!(
                        "expected array frame, got {other}"
                    ))),
                }
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => Err(LtxError::Decode(err.to_string())),
        }
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    // truncated frames surface as UnexpectedEof on the inner read
    match err {
        rmpv::decode::Error::InvalidMarkerRead(inner)
        | rmpv::decode::Error::InvalidDataRead(inner) => {
            inner.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
