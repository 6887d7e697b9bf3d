// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling signals in kirk.
//!
//! A user interrupt cancels outstanding work cooperatively: the session is
//! stopped from the outside in, and the process exits with 130.

use crate::errors::SignalHandlerSetupError;

/// The kind of signal handling to set up for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler, capturing interrupt and termination
    /// signals.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    /// Builds the corresponding handler.
    pub fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// A shutdown request derived from a signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownEvent {
    /// SIGINT (ctrl-C).
    Interrupt,
    /// SIGHUP.
    Hangup,
    /// SIGTERM.
    Term,
}

/// The signal handler implementation.
#[derive(Debug)]
pub struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    /// Creates a new handler for ctrl-C and termination signals.
    pub fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new()?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    /// Creates a handler that never delivers anything.
    pub fn noop() -> Self {
        Self { signals: None }
    }

    /// The next shutdown request, if any ever arrives.
    pub async fn recv(&mut self) -> Option<ShutdownEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => std::future::pending().await,
        }
    }
}

mod imp {
    use super::ShutdownEvent;
    use std::io;
    use tokio::signal::unix::{SignalKind, signal};
    use tokio_stream::{StreamExt, StreamMap, wrappers::SignalStream};

    #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
    enum SignalId {
        Int,
        Hup,
        Term,
    }

    /// Streams for SIGINT, SIGHUP and SIGTERM.
    #[derive(Debug)]
    pub(super) struct Signals {
        // the number of streams is small, so a StreamMap backed by a Vec
        // is a good fit
        map: StreamMap<SignalId, SignalStream>,
    }

    impl Signals {
        pub(super) fn new() -> io::Result<Self> {
            let mut map = StreamMap::new();

            map.extend([
                (SignalId::Int, signal_stream(SignalKind::interrupt())?),
                (SignalId::Hup, signal_stream(SignalKind::hangup())?),
                (SignalId::Term, signal_stream(SignalKind::terminate())?),
            ]);

            Ok(Self { map })
        }

        pub(super) async fn recv(&mut self) -> Option<ShutdownEvent> {
            self.map.next().await.map(|(id, _)| match id {
                SignalId::Int => ShutdownEvent::Interrupt,
                SignalId::Hup => ShutdownEvent::Hangup,
                SignalId::Term => ShutdownEvent::Term,
            })
        }
    }

    fn signal_stream(kind: SignalKind) -> io::Result<SignalStream> {
        Ok(SignalStream::new(signal(kind)?))
    }
}
