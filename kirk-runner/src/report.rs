// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The JSON report writer.
//!
//! The report has three fields: `environment` (host information),
//! `stats` (aggregate counters and runtime) and `results` (one entry per
//! executed test).

use crate::{errors::ExportError, results::SuiteResult, sut::HostInfo};
use camino::Utf8Path;
use serde::Serialize;
use std::fs;
use tracing::info;

#[derive(Serialize)]
struct Report {
    environment: Environment,
    stats: Stats,
    results: Vec<ReportEntry>,
}

#[derive(Serialize)]
struct Environment {
    distribution: String,
    distribution_version: String,
    kernel: String,
    arch: String,
    cpu: String,
    #[serde(rename = "RAM")]
    ram: String,
    swap: String,
}

impl From<&HostInfo> for Environment {
    fn from(host: &HostInfo) -> Self {
        Environment {
            distribution: host.distro.clone(),
            distribution_version: host.distro_ver.clone(),
            kernel: host.kernel.clone(),
            arch: host.arch.clone(),
            cpu: host.cpu.clone(),
            ram: host.ram.clone(),
            swap: host.swap.clone(),
        }
    }
}

#[derive(Serialize)]
struct Stats {
    runtime: f64,
    passed: u64,
    failed: u64,
    broken: u64,
    skipped: u64,
    warnings: u64,
}

#[derive(Serialize)]
struct ReportEntry {
    test_fqn: String,
    status: &'static str,
    test: ReportTest,
}

#[derive(Serialize)]
struct ReportTest {
    command: String,
    arguments: Vec<String>,
    failed: u64,
    passed: u64,
    broken: u64,
    skipped: u64,
    warnings: u64,
    duration: f64,
    result: &'static str,
    log: String,
    retval: Vec<String>,
}

/// Saves a JSON report for the given suite results into `path`.
///
/// An existing report is never overwritten. The environment section comes
/// from the first suite's host information.
pub fn save_file(results: &[SuiteResult], path: &Utf8Path) -> Result<(), ExportError> {
    if path.exists() {
        return Err(ExportError::AlreadyExists(path.to_path_buf()));
    }

    info!(path = %path, "exporting JSON report");

    let environment = results
        .first()
        .map(|suite| Environment::from(&suite.host))
        .unwrap_or_else(|| Environment::from(&HostInfo::default()));

    let stats = Stats {
        runtime: results
            .iter()
            .map(|suite| suite.exec_time.as_secs_f64())
            .sum(),
        passed: results.iter().map(SuiteResult::passed).sum(),
        failed: results.iter().map(SuiteResult::failed).sum(),
        broken: results.iter().map(SuiteResult::broken).sum(),
        skipped: results.iter().map(SuiteResult::skipped).sum(),
        warnings: results.iter().map(SuiteResult::warnings).sum(),
    };

    let mut entries = Vec::new();
    for suite in results {
        for test in &suite.tests {
            let status = test_status(test.broken, test.failed, test.skipped, test.passed);

            entries.push(ReportEntry {
                test_fqn: test.test.name.clone(),
                status,
                test: ReportTest {
                    command: test.test.command.clone(),
                    arguments: test.test.arguments.clone(),
                    failed: test.failed,
                    passed: test.passed,
                    broken: test.broken,
                    skipped: test.skipped,
                    warnings: test.warnings,
                    duration: test.exec_time.as_secs_f64(),
                    result: status,
                    log: test.stdout.clone(),
                    retval: vec![test.retcode.to_string()],
                },
            });
        }
    }

    let report = Report {
        environment,
        stats,
        results: entries,
    };

    let data = serde_json::to_string_pretty(&report)?;
    fs::write(path, data)?;

    info!("report exported");

    Ok(())
}

/// Per-test status: broken wins over fail, which wins over skip; skip only
/// when nothing else happened.
fn test_status(broken: u64, failed: u64, skipped: u64, passed: u64) -> &'static str {
    if broken > 0 {
        "broken"
    } else if failed > 0 {
        "fail"
    } else if skipped > 0 && passed == 0 {
        "skip"
    } else {
        "pass"
    }
}
