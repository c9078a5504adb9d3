//! Bytecode function descriptors: handler tables, call-prep regions, frame
//! geometry, and the coroutine-kind projections the frame tearer switches on.

use bitflags::bitflags;

use crate::{class::ClassId, op::Opcode};

/// Bytecode offset within a function's byte stream.
pub type Offset = u32;

/// Unique identifier for functions registered in the [`FuncTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FuncId(usize);

impl FuncId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Coroutine classification of a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FuncKind {
    Regular,
    /// Async function: the eager prefix runs synchronously until the first
    /// `Await`, after which the frame is owned by a wait-handle.
    AsyncFunction,
    AsyncGenerator,
    Generator,
}

bitflags! {
    /// Attribute flags on function descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct FuncAttrs: u8 {
        /// Native-backed builtin; its frame has no call-prep regions and the
        /// body cannot be a coroutine.
        const BUILTIN = 1 << 0;
    }
}

/// Kind of a protected-region handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
pub enum EhKind {
    /// Consumes the exception.
    Catch,
    /// Runs cleanup and re-raises via the `Unwind` opcode.
    Fault,
}

/// One entry of a function's exception-handler table: a protected bytecode
/// region `[base, past)` with its handler and optional enclosing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EhEnt {
    pub kind: EhKind,
    pub base: Offset,
    pub past: Offset,
    pub handler: Offset,
    /// Index of the enclosing entry in the same table, if any.
    pub parent: Option<usize>,
}

impl EhEnt {
    /// True when the region covers `offset`.
    #[inline]
    pub fn covers(&self, offset: Offset) -> bool {
        (self.base..self.past).contains(&offset)
    }
}

/// One call-prep (FPI) region: the span between a call-preparation
/// instruction and the matching call, recording where the preparation
/// instruction lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FpiEnt {
    /// Offset of the `FPush*` instruction that opened the region.
    pub fpush_off: Offset,
    pub base: Offset,
    pub past: Offset,
}

impl FpiEnt {
    #[inline]
    pub fn covers(&self, offset: Offset) -> bool {
        (self.base..self.past).contains(&offset)
    }
}

/// A bytecode function descriptor.
///
/// Fields are plain data filled in by the emitter (out of scope here); the
/// unwinder and tests consult them read-only.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Func {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub kind: FuncKind,
    /// Declaring class for methods.
    pub cls: Option<ClassId>,
    pub num_locals: usize,
    pub num_cls_ref_slots: usize,
    pub eh_table: Vec<EhEnt>,
    pub fpi_table: Vec<FpiEnt>,
    pub attrs: FuncAttrs,
}

impl Func {
    /// Creates a descriptor with no locals, handlers, or call-prep regions.
    pub fn new(name: impl Into<String>, kind: FuncKind, bytecode: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytecode,
            kind,
            cls: None,
            num_locals: 0,
            num_cls_ref_slots: 0,
            eh_table: Vec::new(),
            fpi_table: Vec::new(),
            attrs: FuncAttrs::empty(),
        }
    }

    /// Decodes the opcode byte at `offset`.
    ///
    /// # Panics
    /// Panics on an out-of-range offset or a byte that is not an opcode; both
    /// mean the recorded offset and the byte stream disagree.
    #[must_use]
    pub fn op_at(&self, offset: Offset) -> Opcode {
        let byte = *self
            .bytecode
            .get(offset as usize)
            .expect("Func::op_at: offset past end of bytecode");
        Opcode::try_from(byte).expect("Func::op_at: offset does not hold an opcode")
    }

    /// Index of the innermost handler-table entry whose protected region
    /// covers `offset`, or `None` when the offset is unprotected.
    ///
    /// With properly nested regions the innermost cover is the one with the
    /// narrowest span.
    #[must_use]
    pub fn find_eh(&self, offset: Offset) -> Option<usize> {
        self.eh_table
            .iter()
            .enumerate()
            .filter(|(_, eh)| eh.covers(offset))
            .min_by_key(|(_, eh)| eh.past - eh.base)
            .map(|(idx, _)| idx)
    }

    /// Returns the handler-table entry at `index`.
    ///
    /// # Panics
    /// Panics if the index is out of range (a corrupt `parent` chain).
    #[must_use]
    pub fn eh_at(&self, index: usize) -> &EhEnt {
        self.eh_table.get(index).expect("Func::eh_at: index out of range")
    }

    /// The innermost call-prep region covering `offset`, if any.
    #[must_use]
    pub fn call_prep_at(&self, offset: Offset) -> Option<&FpiEnt> {
        self.fpi_table
            .iter()
            .filter(|fpi| fpi.covers(offset))
            .min_by_key(|fpi| fpi.past - fpi.base)
    }

    /// Number of frame slots this function occupies: locals plus class-ref
    /// slots.
    #[inline]
    pub fn num_slots_in_frame(&self) -> usize {
        self.num_locals + self.num_cls_ref_slots
    }

    #[inline]
    pub fn is_async_function(&self) -> bool {
        self.kind == FuncKind::AsyncFunction
    }

    #[inline]
    pub fn is_async_generator(&self) -> bool {
        self.kind == FuncKind::AsyncGenerator
    }

    #[inline]
    pub fn is_non_async_generator(&self) -> bool {
        self.kind == FuncKind::Generator
    }

    /// True when frames of this function can be suspended and resumed.
    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.kind != FuncKind::Regular
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.attrs.contains(FuncAttrs::BUILTIN)
    }
}

/// Registry of function descriptors, keyed by [`FuncId`].
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FuncTable {
    funcs: Vec<Func>,
}

impl FuncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function and returns its id.
    pub fn define(&mut self, func: Func) -> FuncId {
        let id = FuncId(self.funcs.len());
        self.funcs.push(func);
        id
    }

    /// Returns the descriptor for `id`.
    ///
    /// # Panics
    /// Panics if the id is unknown.
    #[must_use]
    pub fn get(&self, id: FuncId) -> &Func {
        self.funcs.get(id.index()).expect("FuncTable::get: unknown function id")
    }

    /// Returns a mutable descriptor for `id`.
    pub fn get_mut(&mut self, id: FuncId) -> &mut Func {
        self.funcs
            .get_mut(id.index())
            .expect("FuncTable::get_mut: unknown function id")
    }
}
