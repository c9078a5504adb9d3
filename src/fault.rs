//! In-flight exception records and the per-nesting fault stack.

use crate::{
    frame::FrameId,
    func::Offset,
    heap::HeapId,
};

/// Where a fault was (most recently) raised. The three fields bind together:
/// a fault either carries all of them or none, which is why they live in one
/// optional struct rather than three sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RaiseSite {
    /// VM-nesting depth at which the fault was raised.
    pub nesting: usize,
    /// Frame whose bytecode executed the raise.
    pub frame: FrameId,
    /// Offset of the raising instruction.
    pub offset: Offset,
}

/// The unit of work of the unwinder: one in-flight guest exception.
///
/// `Copy` is deliberate: drivers operate on a local copy of the top record
/// and write it back via [`FaultStack::replace_top`], because reentrant
/// raises may grow the stack underneath them. The record does not own the
/// exception reference exclusively; the fault stack entry does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fault {
    /// The guest throwable being propagated. The fault-stack entry owns one
    /// reference.
    pub exception: HeapId,
    /// Raise location; `None` until the driver binds it on first inspection,
    /// and reset when the fault propagates past a frame.
    pub site: Option<RaiseSite>,
    /// Number of handler entries already attempted in the raise frame,
    /// supporting the `Unwind` opcode re-entry protocol.
    pub handled_count: u32,
}

impl Fault {
    /// A freshly raised fault, not yet bound to a site.
    pub fn new(exception: HeapId) -> Self {
        Self {
            exception,
            site: None,
            handled_count: 0,
        }
    }
}

/// Ordered sequence of in-flight faults for one VM context; non-empty exactly
/// while an unwind is in progress.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FaultStack {
    records: Vec<Fault>,
}

impl FaultStack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, fault: Fault) {
        self.records.push(fault);
    }

    /// Pops the top fault. The caller takes over the exception reference.
    pub fn pop(&mut self) -> Option<Fault> {
        self.records.pop()
    }

    /// The top fault, if any.
    #[inline]
    pub fn peek(&self) -> Option<&Fault> {
        self.records.last()
    }

    /// Overwrites the top fault with `fault`.
    ///
    /// # Panics
    /// Panics on an empty stack.
    pub fn replace_top(&mut self, fault: Fault) {
        *self.records.last_mut().expect("FaultStack::replace_top: stack empty") = fault;
    }
}
