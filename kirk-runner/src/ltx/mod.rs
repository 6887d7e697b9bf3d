// Copyright (c) The kirk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The LTX pipe protocol.
//!
//! LTX is a binary, length-prefixed, self-describing framing spoken over a
//! pair of file descriptors, carrying a slot table of up to 128 concurrent
//! commands. [`protocol`] implements the frame codec, [`session`] the
//! request/reply plumbing on top of it.

pub mod protocol;
pub(crate) mod session;

#[cfg(test)]
pub(crate) mod testserver;

/// The current CLOCK_MONOTONIC reading, in nanoseconds.
///
/// LTX timestamps are monotonic nanoseconds of the executor's machine; the
/// transport runs on the same machine, so durations can be computed against
/// the local monotonic clock.
pub(crate) fn monotonic_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(now) => now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64,
        Err(_) => 0,
    }
}
