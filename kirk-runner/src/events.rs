// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The named publish/subscribe event bus.
//!
//! Every component of the runner reports progress by firing events; user
//! interfaces and other observers subscribe by event name. Handler
//! invocations are queued and consumed by a single serial loop, so an
//! observer always sees a consistent, ordered narrative (`test_started`
//! precedes `test_completed` for the same test).

use crate::{
    errors::{EventsError, HandlerError},
    manifest::{Suite, Test},
    results::{SuiteResult, TestResult},
};
use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// An event fired on the bus.
///
/// Event names are wire-stable; consumers may ignore names they don't know.
#[derive(Clone, Debug)]
pub enum Event {
    /// A session started; carries the temporary directory of the run.
    SessionStarted { tmpdir: Utf8PathBuf },
    /// A session completed with the given suite results.
    SessionCompleted { results: Vec<SuiteResult> },
    /// A session was stopped by the user.
    SessionStopped,
    /// A session ended with an error.
    SessionError { error: String },
    /// The SUT is starting.
    SutStart { sut: String },
    /// The SUT is stopping.
    SutStop { sut: String },
    /// The SUT is restarting after a catastrophic failure.
    SutRestart { sut: String },
    /// Raw SUT stdout outside of test execution.
    SutStdout { sut: String, data: String },
    /// The SUT stopped replying to liveness probes.
    SutNotResponding,
    /// A suite manifest download started.
    SuiteDownloadStarted { name: String, target: Utf8PathBuf },
    /// A suite manifest download completed.
    SuiteDownloadCompleted { name: String, target: Utf8PathBuf },
    /// A suite execution started.
    SuiteStarted { suite: Suite },
    /// A suite execution completed.
    SuiteCompleted { results: SuiteResult },
    /// The suite-level deadline expired.
    SuiteTimeout { suite: Suite, timeout: Duration },
    /// A test execution started.
    TestStarted { test: Test },
    /// A chunk of test stdout arrived.
    TestStdout { test: Test, data: String },
    /// A test execution completed.
    TestCompleted { results: TestResult },
    /// A test exceeded its per-test deadline.
    TestTimedOut { test: Test, timeout: Duration },
    /// `Kernel panic` appeared in a test's stdout.
    KernelPanic,
    /// The kernel taint state changed; carries the new taint messages.
    KernelTainted { messages: Vec<String> },
    /// The single ad-hoc command started.
    RunCmdStart { command: String },
    /// A chunk of ad-hoc command stdout arrived.
    RunCmdStdout { data: String },
    /// The single ad-hoc command completed.
    RunCmdStop {
        command: String,
        stdout: String,
        returncode: i32,
    },
    /// An event handler failed; carries the error and the handler's event
    /// name.
    InternalError { error: String, handler: String },
}

impl Event {
    /// The wire-stable name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionStarted { .. } => "session_started",
            Event::SessionCompleted { .. } => "session_completed",
            Event::SessionStopped => "session_stopped",
            Event::SessionError { .. } => "session_error",
            Event::SutStart { .. } => "sut_start",
            Event::SutStop { .. } => "sut_stop",
            Event::SutRestart { .. } => "sut_restart",
            Event::SutStdout { .. } => "sut_stdout",
            Event::SutNotResponding => "sut_not_responding",
            Event::SuiteDownloadStarted { .. } => "suite_download_started",
            Event::SuiteDownloadCompleted { .. } => "suite_download_completed",
            Event::SuiteStarted { .. } => "suite_started",
            Event::SuiteCompleted { .. } => "suite_completed",
            Event::SuiteTimeout { .. } => "suite_timeout",
            Event::TestStarted { .. } => "test_started",
            Event::TestStdout { .. } => "test_stdout",
            Event::TestCompleted { .. } => "test_completed",
            Event::TestTimedOut { .. } => "test_timed_out",
            Event::KernelPanic => "kernel_panic",
            Event::KernelTainted { .. } => "kernel_tainted",
            Event::RunCmdStart { .. } => "run_cmd_start",
            Event::RunCmdStdout { .. } => "run_cmd_stdout",
            Event::RunCmdStop { .. } => "run_cmd_stop",
            Event::InternalError { .. } => "internal_error",
        }
    }
}

/// The reserved event name handler failures are redirected to.
pub const INTERNAL_ERROR: &str = "internal_error";

type HandlerFn = dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

struct Registered {
    event_name: String,
    func: Box<HandlerFn>,
}

enum QueueEntry {
    Invoke {
        handler: Arc<Registered>,
        event: Event,
    },
    Shutdown,
}

struct Inner {
    registry: Mutex<IndexMap<String, Vec<Arc<Registered>>>>,
    tx: UnboundedSender<QueueEntry>,
    rx: Mutex<Option<UnboundedReceiver<QueueEntry>>>,
    consumer: tokio::sync::Mutex<()>,
}

/// The process-wide event bus handle.
///
/// The bus is explicit shared state with a lifecycle bound to the session:
/// a handle is cloned into every component that publishes or subscribes.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a new bus with an empty registry.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        EventBus {
            inner: Arc::new(Inner {
                registry: Mutex::new(IndexMap::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                consumer: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Clears the entire registry.
    pub fn reset(&self) {
        debug!("reset events registry");
        self.registry().clear();
    }

    /// Returns true if `event_name` has at least one handler.
    pub fn is_registered(&self, event_name: &str) -> bool {
        self.registry().contains_key(event_name)
    }

    /// Registers a handler for `event_name`.
    ///
    /// Registering the same name multiple times appends handlers; they are
    /// invoked in insertion order.
    pub fn register<F>(&self, event_name: &str, handler: F)
    where
        F: Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync + 'static,
    {
        debug!(event = event_name, "register new event");

        let registered = Arc::new(Registered {
            event_name: event_name.to_string(),
            func: Box::new(handler),
        });

        self.registry()
            .entry(event_name.to_string())
            .or_default()
            .push(registered);
    }

    /// Unregisters every handler of `event_name`.
    pub fn unregister(&self, event_name: &str) {
        debug!(event = event_name, "unregister event");
        self.registry().shift_remove(event_name);
    }

    /// Fires an event.
    ///
    /// One invocation per handler currently registered under the event's
    /// name is queued, snapshotting the handler list at fire time. This
    /// never blocks on handler execution.
    pub async fn fire(&self, event: Event) {
        let handlers: Vec<_> = self
            .registry()
            .get(event.name())
            .map(|list| list.to_vec())
            .unwrap_or_default();

        for handler in handlers {
            let _ = self.inner.tx.send(QueueEntry::Invoke {
                handler,
                event: event.clone(),
            });
        }
    }

    /// Runs the consumer loop until [`stop`](Self::stop) is called.
    ///
    /// Invocations are awaited serially, in queue order. Reentrant start is
    /// an error.
    pub async fn start(&self) -> Result<(), EventsError> {
        let mut rx = self
            .inner
            .rx
            .lock()
            .expect("events lock poisoned")
            .take()
            .ok_or(EventsError::AlreadyRunning)?;

        let _guard = self.inner.consumer.lock().await;
        debug!("event loop started");

        while let Some(entry) = rx.recv().await {
            match entry {
                QueueEntry::Shutdown => break,
                QueueEntry::Invoke { handler, event } => self.consume(&handler, event).await,
            }
        }

        // drain whatever was queued behind the shutdown sentinel
        while let Ok(entry) = rx.try_recv() {
            if let QueueEntry::Invoke { handler, event } = entry {
                self.consume(&handler, event).await;
            }
        }

        *self.inner.rx.lock().expect("events lock poisoned") = Some(rx);

        debug!("event loop stopped");

        Ok(())
    }

    /// Stops the consumer loop, waiting for the queue to drain.
    ///
    /// Entries fired before the stop are still consumed; stopping an
    /// already stopped bus queues a sentinel the next start swallows.
    pub async fn stop(&self) {
        debug!("stopping event loop");

        let _ = self.inner.tx.send(QueueEntry::Shutdown);

        // the consumer holds this lock for as long as it runs
        let _guard = self.inner.consumer.lock().await;
    }

    async fn consume(&self, handler: &Registered, event: Event) {
        if let Err(err) = (handler.func)(event).await {
            error!(
                event = %handler.event_name,
                error = %err,
                "event handler failed"
            );

            // a failing internal_error handler is not redirected again
            if handler.event_name == INTERNAL_ERROR {
                return;
            }

            let internal = self
                .registry()
                .get(INTERNAL_ERROR)
                .and_then(|list| list.first().cloned());

            if let Some(internal) = internal {
                let _ = (internal.func)(Event::InternalError {
                    error: err.to_string(),
                    handler: handler.event_name.clone(),
                })
                .await;
            }
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, IndexMap<String, Vec<Arc<Registered>>>> {
        self.inner.registry.lock().expect("events lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    fn recording_handler(
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> impl Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> {
        move |event: Event| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{tag}:{}", event.name()));
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register("session_stopped", recording_handler(log.clone(), "first"));
        bus.register("session_stopped", recording_handler(log.clone(), "second"));

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(Event::SessionStopped).await;
        bus.fire(Event::SessionStopped).await;
        bus.stop().await;
        consumer.await.unwrap().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:session_stopped",
                "second:session_stopped",
                "first:session_stopped",
                "second:session_stopped",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let bus = EventBus::new();
        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(Event::KernelPanic).await;
        bus.stop().await;
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_failure_reaches_internal_error() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register("kernel_panic", |_event| {
            async move { Err::<(), HandlerError>("boom".into()) }.boxed()
        });
        bus.register("internal_error", {
            let log = log.clone();
            move |event: Event| {
                let log = log.clone();
                async move {
                    if let Event::InternalError { error, handler } = event {
                        log.lock().unwrap().push(format!("{handler}: {error}"));
                    }
                    Ok(())
                }
                .boxed()
            }
        });

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(Event::KernelPanic).await;
        bus.stop().await;
        consumer.await.unwrap().unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["kernel_panic: boom"]);
    }

    #[tokio::test]
    async fn unregister_removes_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.register("session_stopped", recording_handler(log.clone(), "h"));
        assert!(bus.is_registered("session_stopped"));
        bus.unregister("session_stopped");
        assert!(!bus.is_registered("session_stopped"));

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(Event::SessionStopped).await;
        bus.stop().await;
        consumer.await.unwrap().unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_restartable() {
        let bus = EventBus::new();

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });
        bus.stop().await;
        bus.stop().await;
        consumer.await.unwrap().unwrap();

        // the queue is handed back on exit, so the bus can start again
        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });
        bus.stop().await;
        consumer.await.unwrap().unwrap();
    }
}
