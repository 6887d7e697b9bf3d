// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Console user interfaces.
//!
//! All renderers are pure subscribers on the event bus: `simple` prints one
//! line per test, `verbose` also streams test stdout, `parallel` prints
//! completion lines suited to interleaved execution. The session picks
//! `parallel` automatically when more than one worker runs.

use futures::FutureExt;
use kirk_runner::{
    events::{Event, EventBus},
    results::{SuiteResult, TestResult},
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Which renderer to subscribe on the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserInterface {
    /// One line per test.
    Simple,
    /// Streams test stdout while running.
    Verbose,
    /// Per-test completion lines for interleaved execution.
    Parallel,
}

/// Color styles of the console output, all plain when colors are off.
#[derive(Clone, Copy, Debug)]
struct Theme {
    enabled: bool,
    green: Style,
    yellow: Style,
    red: Style,
    cyan: Style,
}

impl Theme {
    fn new(no_colors: bool) -> Self {
        Theme {
            enabled: !no_colors,
            green: Style::new().bright_green(),
            yellow: Style::new().bright_yellow(),
            red: Style::new().bright_red(),
            cyan: Style::new().bright_cyan(),
        }
    }

    fn paint(&self, style: Style, text: &str) -> String {
        if self.enabled {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}

/// Marker and style of a completed test.
fn test_marker(results: &TestResult) -> (&'static str, StyleKind) {
    if results.broken > 0 {
        ("broken", StyleKind::Cyan)
    } else if results.failed > 0 {
        ("fail", StyleKind::Red)
    } else if results.skipped > 0 && results.passed == 0 {
        ("skip", StyleKind::Yellow)
    } else {
        ("pass", StyleKind::Green)
    }
}

#[derive(Clone, Copy, Debug)]
enum StyleKind {
    Green,
    Yellow,
    Red,
    Cyan,
}

impl Theme {
    fn kind(&self, kind: StyleKind) -> Style {
        match kind {
            StyleKind::Green => self.green,
            StyleKind::Yellow => self.yellow,
            StyleKind::Red => self.red,
            StyleKind::Cyan => self.cyan,
        }
    }
}

/// Returns a user-friendly duration, for example `1h 0m 10s`.
fn user_friendly_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    let hours = (seconds / 3600.0).floor();
    let minutes = ((seconds % 3600.0) / 60.0).floor();
    let rest = seconds % 60.0;

    if hours > 0.0 {
        format!("{hours:.0}h {minutes:.0}m {rest:.0}s")
    } else if minutes > 0.0 {
        format!("{minutes:.0}m {rest:.0}s")
    } else {
        format!("{rest:.3}s")
    }
}

fn print_line(message: &str) {
    println!("{message}");
    let _ = std::io::stdout().flush();
}

fn print_inline(message: &str) {
    print!("{message}");
    let _ = std::io::stdout().flush();
}

fn suite_summary(results: &SuiteResult) -> String {
    let duration = user_friendly_duration(results.exec_time);

    format!(
        "\nSuite Name: {}\n\
         Total Run: {}\n\
         Elapsed Time: {}\n\
         Passed Tests: {}\n\
         Failed Tests: {}\n\
         Skipped Tests: {}\n\
         Broken Tests: {}\n\
         Warnings: {}\n\
         Kernel Version: {}\n\
         CPU: {}\n\
         Machine Architecture: {}\n\
         RAM: {}\n\
         Swap memory: {}\n\
         Distro: {}\n\
         Distro Version: {}\n",
        results.suite.name,
        results.suite.tests.len(),
        duration,
        results.passed(),
        results.failed(),
        results.skipped(),
        results.broken(),
        results.warnings(),
        results.host.kernel,
        results.host.cpu,
        results.host.arch,
        results.host.ram,
        results.host.swap,
        results.host.distro,
        results.host.distro_ver,
    )
}

/// Per-run flags the simple renderer folds into its completion markers.
#[derive(Debug, Default)]
struct SimpleState {
    sut_not_responding: bool,
    kernel_panic: bool,
    kernel_tainted: Option<String>,
    timed_out: bool,
}

/// Registers the chosen renderer's handlers on the bus.
pub fn install(bus: &EventBus, ui: UserInterface, no_colors: bool) {
    let theme = Theme::new(no_colors);

    install_common(bus, theme);

    match ui {
        UserInterface::Simple => install_simple(bus, theme),
        UserInterface::Verbose => install_verbose(bus, theme),
        UserInterface::Parallel => install_parallel(bus, theme),
    }
}

/// A handler printing a fixed rendering of one event.
macro_rules! on_event {
    ($bus:expr, $name:expr, $handler:expr) => {{
        let handler = $handler;
        $bus.register($name, move |event: Event| {
            let handler = handler.clone();
            async move {
                handler(event);
                Ok(())
            }
            .boxed()
        });
    }};
}

fn install_common(bus: &EventBus, theme: Theme) {
    on_event!(bus, "session_started", {
        move |event| {
            if let Event::SessionStarted { tmpdir } = event {
                print_line(&format!(
                    "Host information\n\n\tSystem: {}\n\tArchitecture: {}\n\n\tTemporary directory: {}\n",
                    std::env::consts::OS,
                    std::env::consts::ARCH,
                    tmpdir,
                ));
            }
        }
    });

    on_event!(bus, "session_stopped", {
        move |_event| print_line("Session stopped")
    });

    on_event!(bus, "sut_start", {
        move |event| {
            if let Event::SutStart { sut } = event {
                print_line(&format!("Connecting to SUT: {sut}"));
            }
        }
    });

    on_event!(bus, "sut_stop", {
        move |event| {
            if let Event::SutStop { sut } = event {
                print_line(&format!("\nDisconnecting from SUT: {sut}"));
            }
        }
    });

    on_event!(bus, "sut_restart", {
        move |event| {
            if let Event::SutRestart { sut } = event {
                print_line(&format!("Restarting SUT: {sut}"));
            }
        }
    });

    on_event!(bus, "run_cmd_start", {
        move |event| {
            if let Event::RunCmdStart { command } = event {
                print_line(&theme.paint(theme.cyan, &command));
            }
        }
    });

    on_event!(bus, "run_cmd_stdout", {
        move |event| {
            if let Event::RunCmdStdout { data } = event {
                print_inline(&data);
            }
        }
    });

    on_event!(bus, "run_cmd_stop", {
        move |event| {
            if let Event::RunCmdStop { returncode, .. } = event {
                print_line(&format!("\nExit code: {returncode}\n"));
            }
        }
    });

    on_event!(bus, "suite_download_started", {
        move |event| {
            if let Event::SuiteDownloadStarted { name, .. } = event {
                print_line(&format!("Downloading suite: {name}"));
            }
        }
    });

    on_event!(bus, "suite_started", {
        move |event| {
            if let Event::SuiteStarted { suite } = event {
                print_line(&format!("Starting suite: {}", suite.name));
            }
        }
    });

    on_event!(bus, "suite_completed", {
        move |event| {
            if let Event::SuiteCompleted { results } = event {
                print_line(&suite_summary(&results));
            }
        }
    });

    on_event!(bus, "suite_timeout", {
        move |event| {
            if let Event::SuiteTimeout { suite, timeout } = event {
                print_line(&theme.paint(
                    theme.red,
                    &format!(
                        "Suite '{}' timed out after {} seconds",
                        suite.name,
                        timeout.as_secs()
                    ),
                ));
            }
        }
    });

    on_event!(bus, "session_error", {
        move |event| {
            if let Event::SessionError { error } = event {
                print_line(&theme.paint(theme.red, &format!("Error: {error}")));
            }
        }
    });

    on_event!(bus, "internal_error", {
        move |event| {
            if let Event::InternalError { error, handler } = event {
                print_line(&theme.paint(
                    theme.red,
                    &format!("\nUI error in handler '{handler}': {error}\n"),
                ));
            }
        }
    });
}

fn install_simple(bus: &EventBus, theme: Theme) {
    let state = Arc::new(Mutex::new(SimpleState::default()));

    on_event!(bus, "sut_not_responding", {
        let state = state.clone();
        move |_event| {
            state.lock().expect("ui state lock poisoned").sut_not_responding = true;
            // this message will replace the ok/fail marker
            print_line(&theme.paint(theme.red, "SUT not responding"));
        }
    });

    on_event!(bus, "kernel_panic", {
        let state = state.clone();
        move |_event| {
            state.lock().expect("ui state lock poisoned").kernel_panic = true;
            print_line(&theme.paint(theme.red, "kernel panic"));
        }
    });

    on_event!(bus, "kernel_tainted", {
        let state = state.clone();
        move |event| {
            if let Event::KernelTainted { messages } = event {
                state.lock().expect("ui state lock poisoned").kernel_tainted = Some(messages.join(", "));
            }
        }
    });

    on_event!(bus, "test_timed_out", {
        let state = state.clone();
        move |_event| {
            state.lock().expect("ui state lock poisoned").timed_out = true;
        }
    });

    on_event!(bus, "test_started", {
        move |event| {
            if let Event::TestStarted { test } = event {
                print_inline(&format!("{}: ", test.name));
            }
        }
    });

    on_event!(bus, "test_completed", {
        let state = state.clone();
        move |event| {
            if let Event::TestCompleted { results } = event {
                let mut state = state.lock().expect("ui state lock poisoned");

                if state.sut_not_responding || state.kernel_panic {
                    // the replacement marker is already on screen
                    *state = SimpleState::default();
                    return;
                }

                let (marker, kind) = if state.timed_out {
                    ("timed out", StyleKind::Red)
                } else {
                    test_marker(&results)
                };

                let mut line = theme.paint(theme.kind(kind), marker);
                if let Some(tainted) = state.kernel_tainted.take() {
                    line.push_str(" | ");
                    line.push_str(&theme.paint(theme.yellow, &format!("tainted: {tainted}")));
                }

                print_line(&line);

                *state = SimpleState::default();
            }
        }
    });
}

fn install_verbose(bus: &EventBus, theme: Theme) {
    on_event!(bus, "test_started", {
        move |event| {
            if let Event::TestStarted { test } = event {
                print_line(&format!("===== {} =====", test.name));
                print_line(&theme.paint(theme.cyan, &test.full_command()));
            }
        }
    });

    on_event!(bus, "test_stdout", {
        move |event| {
            if let Event::TestStdout { data, .. } = event {
                print_inline(&data);
            }
        }
    });

    on_event!(bus, "kernel_tainted", {
        move |event| {
            if let Event::KernelTainted { messages } = event {
                print_line(
                    &theme.paint(theme.yellow, &format!("Tainted kernel: {}", messages.join(", "))),
                );
            }
        }
    });

    on_event!(bus, "test_completed", {
        move |event| {
            if let Event::TestCompleted { results } = event {
                let (marker, kind) = test_marker(&results);
                print_line(&format!(
                    "\n{} in {}",
                    theme.paint(theme.kind(kind), marker),
                    user_friendly_duration(results.exec_time),
                ));
            }
        }
    });
}

fn install_parallel(bus: &EventBus, theme: Theme) {
    on_event!(bus, "test_started", {
        move |event| {
            if let Event::TestStarted { test } = event {
                print_line(&format!("-> {}", test.name));
            }
        }
    });

    on_event!(bus, "kernel_tainted", {
        move |event| {
            if let Event::KernelTainted { messages } = event {
                print_line(
                    &theme.paint(theme.yellow, &format!("Tainted kernel: {}", messages.join(", "))),
                );
            }
        }
    });

    on_event!(bus, "kernel_panic", {
        move |_event| print_line(&theme.paint(theme.red, "kernel panic"))
    });

    on_event!(bus, "sut_not_responding", {
        move |_event| print_line(&theme.paint(theme.red, "SUT not responding"))
    });

    on_event!(bus, "test_completed", {
        move |event| {
            if let Event::TestCompleted { results } = event {
                let (marker, kind) = test_marker(&results);
                print_line(&format!(
                    "{}: {} ({})",
                    results.test.name,
                    theme.paint(theme.kind(kind), marker),
                    user_friendly_duration(results.exec_time),
                ));
            }
        }
    });
}
