// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of runtest manifests.
//!
//! A runtest file declares one test per line: the first token is the test
//! name, the second the command, the rest its arguments. A metadata
//! document, when available, decides whether a test is safe to run in
//! parallel with the others of its suite.

use crate::errors::ManifestError;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

/// Metadata keys that mark a test as unsafe for parallel execution.
pub const PARALLEL_BLACKLIST: &[&str] = &[
    "needs_root",
    "needs_device",
    "mount_device",
    "mntpoint",
    "resource_file",
    "format_device",
    "save_restore",
    "max_runtime",
];

/// A single test declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Test {
    /// Name of the test, unique inside its suite.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Arguments of the command.
    pub arguments: Vec<String>,
    /// Whether the test can run in parallel with others of the same suite.
    pub parallelizable: bool,
}

impl Test {
    /// The full shell command line, command and arguments joined.
    pub fn full_command(&self) -> String {
        if self.arguments.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.arguments.join(" "))
        }
    }
}

/// A testing suite: a named, ordered list of tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suite {
    /// Name of the suite.
    pub name: String,
    /// Tests of the suite, in declaration order.
    pub tests: Vec<Test>,
}

/// The LTP metadata document, mapping test names to their parameters.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Metadata {
    /// Per-test parameters.
    #[serde(default)]
    pub tests: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl Metadata {
    /// Parses a metadata document from its JSON text.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Reads a runtest file content and returns a [`Suite`].
///
/// Lines are whitespace-split; empty lines and `#` comments are ignored. A
/// line with fewer than two tokens is a hard error. A test is marked
/// parallelizable only when metadata is supplied, lists the test, and none
/// of the [`PARALLEL_BLACKLIST`] keys appear among its parameters.
pub fn parse_runtest(
    suite_name: &str,
    content: &str,
    metadata: Option<&Metadata>,
) -> Result<Suite, ManifestError> {
    if content.is_empty() {
        return Err(ManifestError::EmptyContent);
    }

    debug!(suite = suite_name, "collecting testing suite");

    let mut tests = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        let name = parts.next().unwrap_or_default().to_string();
        let command = parts
            .next()
            .ok_or_else(|| ManifestError::MissingCommand {
                line: trimmed.to_string(),
            })?
            .to_string();
        let arguments: Vec<String> = parts.map(str::to_string).collect();

        let parallelizable = match metadata.and_then(|meta| meta.tests.get(&name)) {
            // no metadata, or a test the metadata doesn't know about:
            // we can't tell whether it's safe to run in parallel
            None => false,
            Some(params) => !PARALLEL_BLACKLIST
                .iter()
                .any(|key| params.contains_key(*key)),
        };

        debug!(test = %name, parallelizable, "test declaration");

        tests.push(Test {
            name,
            command,
            arguments,
            parallelizable,
        });
    }

    debug!(suite = suite_name, tests = tests.len(), "collected suite");

    Ok(Suite {
        name: suite_name.to_string(),
        tests,
    })
}
