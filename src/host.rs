//! Host-level exceptions: errors raised by the runtime below the interpreter.
//!
//! Guest code never observes these; the unwinder tears down every guest frame
//! in the current nesting and hands the exception back to the embedder.

use thiserror::Error;

/// An exception originating below the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum HostException {
    /// Unrecoverable guest-visible fatal (e.g. raised by the `Fatal` opcode or
    /// scheduled by a surprise flag).
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Request timeout fired during execution.
    #[error("maximum execution time exceeded")]
    Timeout,

    /// Per-request memory limit exceeded.
    #[error("allowed memory size exhausted")]
    MemoryExceeded,

    /// Internal runtime failure.
    #[error("internal runtime error: {0}")]
    Internal(String),
}
