//! Runtime primitives the unwinder drives: frame-locals release and debug
//! trap patterns.

use log::trace;

use crate::{
    frame::{ActRec, ClsRef},
    heap::{DestructObserver, Heap, HeapId},
};

/// Trap pattern written over class-ref slots in debug builds once a frame's
/// temporaries have been discarded. Reads of a trashed slot fail loudly.
pub const TRASH_CLS_REF: ClsRef = ClsRef(0xbadc_1a55);

/// Releases a frame's locals and receiver, exactly once per frame.
///
/// Guest destructors triggered here may raise; raises are swallowed at the
/// heap's destructor boundary (see [`Heap::dec_ref`]), so this routine always
/// completes and the frame's locals-released latch is set on exit. `exception`
/// is the in-flight guest exception, if any; it is not consumed here, only
/// reported for tracing parity with normal returns.
///
/// Callers must not invoke this on a frame whose latch is already set; the
/// latch check lives at the call sites so they can branch on it.
pub fn release_frame_locals<D: DestructObserver>(
    heap: &mut Heap<D>,
    frame: &mut ActRec,
    exception: Option<HeapId>,
) {
    debug_assert!(!frame.locals_released(), "release_frame_locals: locals already released");
    frame.set_locals_released();
    trace!(
        "releasing {} locals (in-flight exception: {:?})",
        frame.locals.len(),
        exception.map(HeapId::index)
    );
    for local in frame.locals.drain(..) {
        local.drop_with_heap(heap);
    }
    if let Some(this) = frame.this.take() {
        heap.dec_ref(this);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        class::{Class, ClassTable, ObjectData},
        func::{Func, FuncKind, FuncTable},
        heap::{HeapData, NopObserver},
        value::TypedValue,
    };

    #[test]
    fn release_drops_locals_and_receiver() {
        let mut funcs = FuncTable::new();
        let mut f = Func::new("f", FuncKind::Regular, vec![]);
        f.num_locals = 2;
        let fid = funcs.define(f);

        let mut classes = ClassTable::new();
        let cls = classes.define(Class::new("C", 0));

        let mut heap: Heap<NopObserver> = Heap::new(NopObserver);
        let local = heap.allocate(HeapData::Str("local".to_owned()));
        let this = heap.allocate(HeapData::Object(ObjectData::new(cls, classes.get(cls))));

        let mut frame = ActRec::new(fid, funcs.get(fid), None, 0, 0);
        frame.locals[0] = TypedValue::Ref(local);
        frame.this = Some(this);

        release_frame_locals(&mut heap, &mut frame, None);
        assert!(frame.locals_released());
        assert!(frame.locals.is_empty());
        assert!(frame.this.is_none());
        assert!(!heap.is_live(local));
        assert!(!heap.is_live(this));
    }
}
