//! Shared fixtures for unwinder integration tests: scripted destructor
//! observers and small bytecode-function builders.
#![allow(dead_code)]

use kestrel::{
    Class, ClassFlags, ClassId, DestructObserver, DestructOutcome, Func, FuncKind, HeapData, HeapId, HostException,
    ObjectData, Opcode, VmContext, PREVIOUS_PROP_SLOT,
};

/// Observer that records destructor runs and can be scripted to raise for
/// instances of a chosen class.
#[derive(Debug, Default)]
pub struct Recorder {
    pub destructed: Vec<HeapId>,
    pub guest_raise_on: Option<ClassId>,
    pub host_raise_on: Option<ClassId>,
}

impl DestructObserver for Recorder {
    fn on_destruct(&mut self, cls: ClassId, obj: HeapId) -> DestructOutcome {
        self.destructed.push(obj);
        if self.host_raise_on == Some(cls) {
            return DestructOutcome::HostRaise(HostException::Timeout);
        }
        if self.guest_raise_on == Some(cls) {
            return DestructOutcome::GuestRaise;
        }
        DestructOutcome::Completed
    }
}

/// A function descriptor whose bytecode is `len` Nops.
pub fn nop_func(name: &str, len: usize) -> Func {
    Func::new(name, FuncKind::Regular, vec![Opcode::Nop as u8; len])
}

/// Defines the throwable base class (with the `previous` slot in range).
pub fn throwable_class<D: DestructObserver>(ctx: &mut VmContext<D>) -> ClassId {
    let mut class = Class::new("Exception", PREVIOUS_PROP_SLOT + 2);
    class.flags |= ClassFlags::THROWABLE;
    ctx.classes.define(class)
}

/// Allocates a throwable instance. The caller owns the fresh reference.
pub fn new_throwable<D: DestructObserver>(ctx: &mut VmContext<D>, cls: ClassId) -> HeapId {
    let obj = ObjectData::new(cls, ctx.classes.get(cls));
    ctx.heap.allocate(HeapData::Object(obj))
}

/// Reads the `previous` link of a throwable.
pub fn previous_of<D: DestructObserver>(ctx: &VmContext<D>, exc: HeapId) -> Option<HeapId> {
    let HeapData::Object(obj) = ctx.heap.get(exc) else {
        panic!("previous_of: not an object");
    };
    obj.prop(PREVIOUS_PROP_SLOT).ref_id()
}
