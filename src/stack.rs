//! The evaluation stack: typed value cells interleaved with pre-live
//! activation records (calls being prepared but not yet entered).

use crate::{
    func::{FuncId, Offset},
    heap::{DestructObserver, Heap, HeapId},
    value::TypedValue,
};

/// A call in preparation: pushed by an `FPush*` instruction, entered by the
/// matching `FCall`. Tagged with the offset of the instruction that pushed it
/// so the disposer can recover the preparation kind.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PreLiveRec {
    pub func: FuncId,
    /// Receiver for method and constructor preparations. The record owns one
    /// reference.
    pub this: Option<HeapId>,
    /// Offset of the `FPush*` opcode that pushed this record.
    pub fpush_off: Offset,
}

/// One cell of the evaluation stack.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum StackCell {
    Tv(TypedValue),
    PreLive(PreLiveRec),
}

/// The evaluation stack. Grows upward; all indices quoted elsewhere
/// (`stack_base`) are depths into this stack.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Stack {
    cells: Vec<StackCell>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The top cell, if any.
    #[inline]
    pub fn top(&self) -> Option<&StackCell> {
        self.cells.last()
    }

    /// Pushes a typed value. The stack takes over the caller's reference.
    pub fn push_tv(&mut self, tv: TypedValue) {
        self.cells.push(StackCell::Tv(tv));
    }

    /// Pushes a pre-live activation record.
    pub fn push_pre_live(&mut self, rec: PreLiveRec) {
        self.cells.push(StackCell::PreLive(rec));
    }

    /// Pushes a heap object without incrementing its refcount: ownership of
    /// one existing reference is transferred onto the stack.
    pub fn push_object_no_rc(&mut self, id: HeapId) {
        self.cells.push(StackCell::Tv(TypedValue::Ref(id)));
    }

    /// Pops the top cell, which must be a typed value, and releases it.
    ///
    /// # Panics
    /// Panics on an empty stack or when the top cell is a pre-live record.
    pub fn pop_tv<D: DestructObserver>(&mut self, heap: &mut Heap<D>) {
        match self.cells.pop().expect("Stack::pop_tv: stack empty") {
            StackCell::Tv(tv) => tv.drop_with_heap(heap),
            StackCell::PreLive(_) => panic!("Stack::pop_tv: top of stack is a pre-live record"),
        }
    }

    /// Pops the top cell, which must be a typed value, and returns it without
    /// releasing. The caller takes over the reference.
    #[must_use]
    pub fn take_tv(&mut self) -> TypedValue {
        match self.cells.pop().expect("Stack::take_tv: stack empty") {
            StackCell::Tv(tv) => tv,
            StackCell::PreLive(_) => panic!("Stack::take_tv: top of stack is a pre-live record"),
        }
    }

    /// Pops the top cell, which must be a pre-live record, releasing the
    /// record's receiver reference.
    ///
    /// The receiver's destructor runs here unless its no-destruct latch was
    /// set first.
    ///
    /// # Panics
    /// Panics on an empty stack or when the top cell is a typed value.
    pub fn pop_pre_live<D: DestructObserver>(&mut self, heap: &mut Heap<D>) {
        match self.cells.pop().expect("Stack::pop_pre_live: stack empty") {
            StackCell::PreLive(rec) => {
                if let Some(this) = rec.this {
                    heap.dec_ref(this);
                }
            }
            StackCell::Tv(_) => panic!("Stack::pop_pre_live: top of stack is a typed value"),
        }
    }
}
