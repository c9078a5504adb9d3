//! Activation records and their arena.
//!
//! Each record represents one in-progress guest call. Records for regular
//! calls are created and destroyed LIFO with the call stack; records for
//! resumed coroutines hold a strong reference to the owning coroutine object
//! in `owner`.

use bitflags::bitflags;

use crate::{
    func::{Func, FuncId, Offset},
    heap::HeapId,
    value::TypedValue,
};

/// Unique identifier for activation records in the [`Frames`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FrameId(usize);

impl FrameId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Per-frame state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct FrameFlags: u8 {
        /// Frame belongs to a suspended coroutine that was re-entered.
        const RESUMED = 1 << 0;
        /// Sticky latch: locals have been released and must not be touched
        /// again.
        const LOCALS_RELEASED = 1 << 1;
        /// Frame was entered by `FCallAwait`: the caller awaits in place, so
        /// an escaping exception bubbles instead of being wrapped.
        const FCALL_AWAIT = 1 << 2;
    }
}

/// A class-reference slot. Debug builds trash these on unwind; see
/// [`crate::TRASH_CLS_REF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClsRef(pub usize);

/// One in-progress guest function call.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ActRec {
    pub func: FuncId,
    /// Back-link to the caller; absent at the outermost frame of a nesting
    /// level.
    pub caller: Option<FrameId>,
    /// Bytecode offset in the caller at which control resumes.
    pub return_offset: Offset,
    /// Receiver for method and constructor calls. The record owns one
    /// reference.
    pub this: Option<HeapId>,
    pub flags: FrameFlags,
    pub locals: Vec<TypedValue>,
    pub cls_ref_slots: Vec<ClsRef>,
    /// Evaluation-stack depth at which this frame's temporary region begins.
    pub stack_base: usize,
    /// The coroutine object owning a resumed frame. The record owns one
    /// reference, released during teardown.
    pub owner: Option<HeapId>,
}

impl ActRec {
    /// Creates a record for a regular (non-resumed) call to `func`.
    pub fn new(func_id: FuncId, func: &Func, caller: Option<FrameId>, return_offset: Offset, stack_base: usize) -> Self {
        Self {
            func: func_id,
            caller,
            return_offset,
            this: None,
            flags: FrameFlags::empty(),
            locals: std::iter::repeat_with(|| TypedValue::Uninit).take(func.num_locals).collect(),
            cls_ref_slots: vec![ClsRef(0); func.num_cls_ref_slots],
            stack_base,
            owner: None,
        }
    }

    #[inline]
    pub fn resumed(&self) -> bool {
        self.flags.contains(FrameFlags::RESUMED)
    }

    #[inline]
    pub fn locals_released(&self) -> bool {
        self.flags.contains(FrameFlags::LOCALS_RELEASED)
    }

    /// Sets the sticky locals-released latch.
    #[inline]
    pub fn set_locals_released(&mut self) {
        self.flags |= FrameFlags::LOCALS_RELEASED;
    }

    #[inline]
    pub fn is_fcall_await(&self) -> bool {
        self.flags.contains(FrameFlags::FCALL_AWAIT)
    }
}

/// The six teardown shapes a frame can take; every frame classifies into
/// exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    /// Plain synchronous call.
    RegularNotResumed,
    /// Async function still in its eager prefix; an escaping exception is
    /// wrapped into a failed wait-handle for the caller.
    AsyncEager,
    /// Async function entered via `FCallAwait`; the caller awaits in place,
    /// so the exception bubbles.
    AsyncInAwait,
    /// Resumed async function; failures go to its wait-handle.
    AsyncResumed,
    /// Resumed async generator.
    AsyncGenResumed,
    /// Resumed non-async generator.
    NonAsyncGenResumed,
}

impl ResumeKind {
    /// Classifies a frame by its function kind and resumption state.
    ///
    /// # Panics
    /// Panics on a resumed frame of a non-resumable function; such a frame
    /// cannot exist.
    pub fn classify(func: &Func, frame: &ActRec) -> Self {
        if !frame.resumed() {
            if func.is_async_function() {
                if frame.is_fcall_await() {
                    Self::AsyncInAwait
                } else {
                    Self::AsyncEager
                }
            } else {
                // Generators in their prologue (before CreateCont) behave as
                // regular frames.
                Self::RegularNotResumed
            }
        } else if func.is_async_function() {
            Self::AsyncResumed
        } else if func.is_async_generator() {
            Self::AsyncGenResumed
        } else if func.is_non_async_generator() {
            Self::NonAsyncGenResumed
        } else {
            panic!("ResumeKind::classify: resumed frame of non-resumable function {}", func.name);
        }
    }
}

/// Arena of activation records.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Frames {
    slots: Vec<Option<ActRec>>,
    free_list: Vec<FrameId>,
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record and returns its id.
    pub fn insert(&mut self, rec: ActRec) -> FrameId {
        if let Some(id) = self.free_list.pop() {
            self.slots[id.index()] = Some(rec);
            id
        } else {
            let id = FrameId(self.slots.len());
            self.slots.push(Some(rec));
            id
        }
    }

    /// Returns the record for `id`.
    ///
    /// # Panics
    /// Panics if the id is invalid or the record was already removed.
    #[must_use]
    pub fn get(&self, id: FrameId) -> &ActRec {
        self.slots
            .get(id.index())
            .expect("Frames::get: slot missing")
            .as_ref()
            .expect("Frames::get: frame already removed")
    }

    /// Returns a mutable record for `id`.
    pub fn get_mut(&mut self, id: FrameId) -> &mut ActRec {
        self.slots
            .get_mut(id.index())
            .expect("Frames::get_mut: slot missing")
            .as_mut()
            .expect("Frames::get_mut: frame already removed")
    }

    /// Removes the record for `id`, returning it.
    ///
    /// # Panics
    /// Panics if the id is invalid or the record was already removed.
    pub fn remove(&mut self, id: FrameId) -> ActRec {
        let rec = self
            .slots
            .get_mut(id.index())
            .expect("Frames::remove: slot missing")
            .take()
            .expect("Frames::remove: frame already removed");
        self.free_list.push(id);
        rec
    }

    /// True when the record for `id` is still live.
    #[must_use]
    pub fn is_live(&self, id: FrameId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }
}
