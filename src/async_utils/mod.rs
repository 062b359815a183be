//! Asynchronous utilities for use with Tokio.
//!
//! Some of this stuff is frankly Rust magic, but it enables everything else
//! we do. We pay the complexity tax here to establish the async queue-based
//! architecture of everything else we do.

use std::process::Output;

use crate::prelude::*;

pub mod blocking_iter_streams;
pub mod io;
pub mod size_hint;

pub use blocking_iter_streams::spawn_blocking_propagating_panics;

/// A boxed future, pinned and sendable.
pub type BoxedFuture<T> = futures::future::BoxFuture<'static, T>;

/// A boxed stream, pinned and sendable.
pub type BoxedStream<T> = futures::stream::BoxStream<'static, T>;

/// Check the result of an external command, reporting stderr on failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    match output.status.code() {
        Some(exit_code) if stderr.is_empty() => Err(anyhow!(
            "{} failed with exit code {}",
            command_name,
            exit_code
        )),
        Some(exit_code) => Err(anyhow!(
            "{} failed with exit code {}: {}",
            command_name,
            exit_code,
            stderr
        )),
        // Not all platforms have exit codes.
        None => Err(anyhow!("{} failed: {}", command_name, stderr)),
    }
}
