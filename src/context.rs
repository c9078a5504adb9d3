//! The VM context: interpreter registers and shared runtime state, threaded
//! through the unwinder's entry points by mutable borrow.

use crate::{
    class::ClassTable,
    fault::FaultStack,
    frame::{ActRec, FrameFlags, FrameId, Frames},
    func::{Func, FuncId, FuncTable, Offset},
    heap::{DestructObserver, Heap, HeapId, NopObserver},
    stack::Stack,
    value::TypedValue,
};

/// Thread-local intermediate cells of the member-instruction sequence.
///
/// Member base/dim/final instructions may hold live values here mid-sequence;
/// when one of them raises, the unwinder releases both cells before anything
/// else.
#[derive(Debug)]
pub struct MemberState {
    pub tv_ref: TypedValue,
    pub tv_ref2: TypedValue,
}

impl Default for MemberState {
    fn default() -> Self {
        Self {
            tv_ref: TypedValue::Uninit,
            tv_ref2: TypedValue::Uninit,
        }
    }
}

/// Debugger attachment point. Every hook is a no-op unless a debugger is
/// attached.
#[derive(Debug, Default)]
pub struct DebuggerHook {
    attached: bool,
    handler_entries: u32,
}

impl DebuggerHook {
    /// Attaches the debugger; subsequent hooks take effect.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Notifies the debugger that the VM is about to enter an exception
    /// handler.
    pub fn on_exception_handler_entered(&mut self) {
        if self.attached {
            self.handler_entries += 1;
        }
    }

    /// Number of handler entries observed while attached.
    pub fn handler_entries(&self) -> u32 {
        self.handler_entries
    }
}

/// The interpreter's mutable state: registers, tables, and the fault stack.
///
/// One context corresponds to one interpreter thread. A host callback may
/// re-enter the interpreter, producing a new *nesting level* on the same
/// context; `nesting` counts the enclosing levels.
#[derive(Debug)]
pub struct VmContext<D: DestructObserver = NopObserver> {
    pub funcs: FuncTable,
    pub classes: ClassTable,
    pub heap: Heap<D>,
    pub stack: Stack,
    pub frames: Frames,
    /// Current frame register; `None` when no guest frame is live.
    pub fp: Option<FrameId>,
    /// Current program counter: an offset into the current function's
    /// bytecode. Meaningless while `fp` is `None`.
    pub pc: Offset,
    pub faults: FaultStack,
    nesting: usize,
    /// Set while a host exception is being propagated; handler search refuses
    /// to enter guest handlers while this holds.
    pub(crate) unwinding_host: bool,
    pub member_state: MemberState,
    pub debugger: DebuggerHook,
}

impl VmContext<NopObserver> {
    /// Creates a context whose destructors complete without running guest
    /// code.
    pub fn new() -> Self {
        Self::with_observer(NopObserver)
    }
}

impl Default for VmContext<NopObserver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DestructObserver> VmContext<D> {
    /// Creates a context with a custom destructor observer.
    pub fn with_observer(observer: D) -> Self {
        Self {
            funcs: FuncTable::new(),
            classes: ClassTable::new(),
            heap: Heap::new(observer),
            stack: Stack::new(),
            frames: Frames::new(),
            fp: None,
            pc: 0,
            faults: FaultStack::new(),
            nesting: 0,
            unwinding_host: false,
            member_state: MemberState::default(),
            debugger: DebuggerHook::default(),
        }
    }

    /// Current VM-nesting depth.
    #[inline]
    pub fn nesting(&self) -> usize {
        self.nesting
    }

    /// Enters a nested interpreter level (host-to-guest callback).
    pub fn enter_nesting(&mut self) {
        self.nesting += 1;
    }

    /// Leaves a nested interpreter level.
    ///
    /// # Panics
    /// Panics when no nesting level is active.
    pub fn exit_nesting(&mut self) {
        assert!(self.nesting > 0, "VmContext::exit_nesting: not nested");
        self.nesting -= 1;
    }

    /// The current frame.
    ///
    /// # Panics
    /// Panics when no guest frame is live.
    #[must_use]
    pub fn current_frame(&self) -> &ActRec {
        let fp = self.fp.expect("VmContext::current_frame: no active frame");
        self.frames.get(fp)
    }

    /// Mutable access to the current frame.
    pub fn current_frame_mut(&mut self) -> &mut ActRec {
        let fp = self.fp.expect("VmContext::current_frame_mut: no active frame");
        self.frames.get_mut(fp)
    }

    /// The function of the current frame.
    #[must_use]
    pub fn current_func(&self) -> &Func {
        self.funcs.get(self.current_frame().func)
    }

    /// Enters a frame for `func` as a call from the current frame.
    ///
    /// `return_offset` is where the caller resumes; the new frame's temporary
    /// region starts at the current stack depth. Sets `fp` to the new frame
    /// and `pc` to the function entry. Embedder/test surface; the interpreter
    /// proper drives the same path from `FCall`.
    pub fn enter_frame(&mut self, func: FuncId, return_offset: Offset) -> FrameId {
        let rec = ActRec::new(func, self.funcs.get(func), self.fp, return_offset, self.stack.len());
        let id = self.frames.insert(rec);
        self.fp = Some(id);
        self.pc = 0;
        id
    }

    /// Enters a resumed coroutine frame owned by the coroutine object
    /// `owner`. The frame takes over one reference to `owner`.
    pub fn enter_resumed_frame(&mut self, func: FuncId, return_offset: Offset, owner: HeapId) -> FrameId {
        let mut rec = ActRec::new(func, self.funcs.get(func), self.fp, return_offset, self.stack.len());
        rec.flags |= FrameFlags::RESUMED;
        rec.owner = Some(owner);
        let id = self.frames.insert(rec);
        self.fp = Some(id);
        self.pc = 0;
        id
    }
}
