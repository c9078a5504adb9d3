//! Driver-level unwinding scenarios: handler entry, propagation, the
//! `Unwind` re-entry protocol, exception chaining, and host-exception
//! unwinds.

mod common;

use common::{new_throwable, nop_func, previous_of, throwable_class, Recorder};
use kestrel::{
    unwind_guest, unwind_guest_object, unwind_host, Class, EhEnt, EhKind, Fault, HeapData, HostException, Opcode,
    RaiseSite, TypedValue, UnwindResult, VmContext,
};

#[test]
fn catch_in_current_frame() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 64);
    f.bytecode[20] = Opcode::Throw as u8;
    f.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 10,
        past: 30,
        handler: 40,
        parent: None,
    }];
    let f = ctx.funcs.define(f);
    ctx.enter_frame(f, 0);

    // Temporaries pushed after the protected region's base.
    let temp = ctx.heap.allocate(HeapData::Str("temp".to_owned()));
    ctx.stack.push_tv(TypedValue::Ref(temp));
    ctx.stack.push_tv(TypedValue::Int(3));
    ctx.pc = 20;

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);
    assert_eq!(unwind_guest_object(&mut ctx, exc), UnwindResult::Resume);

    assert_eq!(ctx.pc, 40);
    let top = ctx.faults.peek().expect("fault retained for the handler");
    assert_eq!(top.handled_count, 1);
    assert_eq!(top.exception, exc);
    assert_eq!(ctx.stack.len(), 0, "temporaries must be discarded");
    assert!(!ctx.heap.is_live(temp));
    assert_eq!(ctx.heap.refcount(exc), 2, "test handle plus the fault's reference");
}

#[test]
fn propagation_through_one_frame() {
    let mut ctx = VmContext::new();
    let mut g = nop_func("g", 64);
    g.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 0,
        past: 20,
        handler: 30,
        parent: None,
    }];
    let g = ctx.funcs.define(g);
    let mut h = nop_func("h", 16);
    h.bytecode[5] = Opcode::Throw as u8;
    h.num_locals = 1;
    let h = ctx.funcs.define(h);

    let g_frame = ctx.enter_frame(g, 0);
    ctx.pc = 6;
    let h_frame = ctx.enter_frame(h, 8);
    let local = ctx.heap.allocate(HeapData::Str("local".to_owned()));
    ctx.current_frame_mut().locals[0] = TypedValue::Ref(local);
    ctx.pc = 5;

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);
    assert_eq!(unwind_guest_object(&mut ctx, exc), UnwindResult::Resume);

    assert!(!ctx.frames.is_live(h_frame), "h's frame must be disposed");
    assert!(!ctx.heap.is_live(local), "h's locals must be released");
    assert_eq!(ctx.fp, Some(g_frame));
    assert_eq!(ctx.pc, 30, "handler search resumed in g at its call-return offset");
    assert_eq!(ctx.faults.peek().unwrap().handled_count, 1);
}

#[test]
fn unwind_opcode_reenters_parent_chain() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 80);
    f.bytecode[12] = Opcode::Throw as u8;
    f.bytecode[64] = Opcode::Unwind as u8;
    f.eh_table = vec![
        EhEnt {
            kind: EhKind::Catch,
            base: 4,
            past: 40,
            handler: 50,
            parent: None,
        },
        EhEnt {
            kind: EhKind::Fault,
            base: 8,
            past: 20,
            handler: 60,
            parent: Some(0),
        },
    ];
    let f = ctx.funcs.define(f);
    ctx.enter_frame(f, 0);
    ctx.pc = 12;

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);

    // First pass enters the innermost fault funclet.
    assert_eq!(unwind_guest_object(&mut ctx, exc), UnwindResult::Resume);
    assert_eq!(ctx.pc, 60);
    assert_eq!(ctx.faults.peek().unwrap().handled_count, 1);

    // The funclet runs and executes Unwind; the resumed unwind never
    // revisits the funclet, entering the enclosing catch instead.
    ctx.pc = 64;
    assert_eq!(unwind_guest(&mut ctx), UnwindResult::Resume);
    assert_eq!(ctx.pc, 50);
    assert_eq!(ctx.faults.peek().unwrap().handled_count, 2);

    // Chain exhausted: the next resume leaves the frame and propagates.
    ctx.pc = 64;
    let result = unwind_guest(&mut ctx);
    assert_eq!(result, UnwindResult::Propagate(exc));
    assert!(ctx.faults.is_empty());
    assert!(ctx.fp.is_none());
    ctx.heap.dec_ref(exc);
    ctx.heap.dec_ref(exc);
}

#[test]
fn rethrow_from_handler_chains_previous() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 64);
    f.bytecode[20] = Opcode::Throw as u8;
    f.bytecode[45] = Opcode::Throw as u8;
    f.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 10,
        past: 30,
        handler: 40,
        parent: None,
    }];
    let f = ctx.funcs.define(f);
    ctx.enter_frame(f, 0);
    ctx.pc = 20;

    let cls = throwable_class(&mut ctx);
    let e1 = new_throwable(&mut ctx, cls);
    assert_eq!(unwind_guest_object(&mut ctx, e1), UnwindResult::Resume);
    assert_eq!(ctx.pc, 40);

    // The catch body raises a second exception outside the protected region.
    // The two faults share a raise frame, so they merge: the new exception
    // adopts the old one's handler progress and links it as `previous`.
    ctx.pc = 45;
    let e2 = new_throwable(&mut ctx, cls);
    let result = unwind_guest_object(&mut ctx, e2);

    assert_eq!(result, UnwindResult::Propagate(e2));
    assert_eq!(previous_of(&ctx, e2), Some(e1));
    assert!(ctx.faults.is_empty(), "the two faults collapsed into one");
    assert!(ctx.fp.is_none());
    assert_eq!(ctx.heap.refcount(e1), 2, "test handle plus the previous link");
    assert_eq!(ctx.heap.refcount(e2), 2, "test handle plus the propagated reference");
}

#[test]
fn torn_down_frame_skips_handler_search() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 32);
    f.bytecode[5] = Opcode::Throw as u8;
    f.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 0,
        past: 30,
        handler: 30,
        parent: None,
    }];
    let f = ctx.funcs.define(f);
    let mut main = nop_func("main", 32);
    main.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 0,
        past: 20,
        handler: 24,
        parent: None,
    }];
    let main = ctx.funcs.define(main);

    let main_frame = ctx.enter_frame(main, 0);
    ctx.pc = 4;
    ctx.enter_frame(f, 10);
    ctx.pc = 5;

    // The frame was already torn down by an exit hook; its handlers must not
    // run even though one covers the raise offset.
    ctx.current_frame_mut().set_locals_released();
    ctx.debugger.attach();

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);
    assert_eq!(unwind_guest_object(&mut ctx, exc), UnwindResult::Resume);

    assert_eq!(ctx.fp, Some(main_frame));
    assert_eq!(ctx.pc, 24, "only main's handler may be entered");
    assert_eq!(ctx.debugger.handler_entries(), 1);
}

#[test]
fn host_exception_from_destructor_disables_handlers() {
    let mut ctx = VmContext::with_observer(Recorder::default());
    let cls = throwable_class(&mut ctx);

    let mut dtor_owner = Class::new("Resource", 0);
    dtor_owner.dtor = Some(ctx.funcs.define(nop_func("__destruct", 4)));
    let dtor_owner = ctx.classes.define(dtor_owner);
    ctx.heap.observer_mut().host_raise_on = Some(dtor_owner);

    let mut main = nop_func("main", 32);
    main.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 0,
        past: 20,
        handler: 24,
        parent: None,
    }];
    let main = ctx.funcs.define(main);
    let mut f = nop_func("f", 16);
    f.bytecode[3] = Opcode::Throw as u8;
    f.num_locals = 1;
    let f = ctx.funcs.define(f);

    ctx.enter_frame(main, 0);
    ctx.pc = 4;
    ctx.enter_frame(f, 10);
    let resource = {
        let obj = kestrel::ObjectData::new(dtor_owner, ctx.classes.get(dtor_owner));
        ctx.heap.allocate(HeapData::Object(obj))
    };
    ctx.current_frame_mut().locals[0] = TypedValue::Ref(resource);
    ctx.pc = 3;
    ctx.debugger.attach();

    let exc = new_throwable(&mut ctx, cls);
    let result = unwind_guest_object(&mut ctx, exc);

    // Releasing f's locals ran the resource destructor, which raised a host
    // exception: from that point no guest handler may be entered, so the
    // exception escapes even though main's catch covers the call site.
    assert_eq!(result, UnwindResult::Propagate(exc));
    assert_eq!(ctx.debugger.handler_entries(), 0);
    assert!(ctx.fp.is_none());
    assert_eq!(ctx.heap.observer().destructed, vec![resource]);

    // The embedder surfaces the pending host exception through the host
    // driver; with every frame already gone it returns immediately.
    let pending = ctx.heap.take_pending_host().expect("host exception pending");
    assert_eq!(pending, HostException::Timeout);
    assert_eq!(unwind_host(&mut ctx, pending), HostException::Timeout);

    ctx.heap.dec_ref(exc);
    ctx.heap.dec_ref(exc);
}

#[test]
fn host_unwind_releases_pinned_faults_and_frames() {
    let mut ctx = VmContext::new();
    let cls = throwable_class(&mut ctx);
    let mut main = nop_func("main", 32);
    main.eh_table = vec![EhEnt {
        kind: EhKind::Catch,
        base: 0,
        past: 32,
        handler: 20,
        parent: None,
    }];
    let main = ctx.funcs.define(main);
    let f = ctx.funcs.define(nop_func("f", 16));

    let main_frame = ctx.enter_frame(main, 0);
    ctx.pc = 4;
    let f_frame = ctx.enter_frame(f, 10);
    ctx.pc = 5;

    // A guest fault already pinned to f (its unwind was in progress when the
    // host exception fired), plus live temporaries.
    let pinned = new_throwable(&mut ctx, cls);
    let mut fault = Fault::new(pinned);
    fault.site = Some(RaiseSite {
        nesting: 0,
        frame: f_frame,
        offset: 5,
    });
    ctx.faults.push(fault);
    let temp = ctx.heap.allocate(HeapData::Str("temp".to_owned()));
    ctx.stack.push_tv(TypedValue::Ref(temp));
    ctx.debugger.attach();

    let back = unwind_host(&mut ctx, HostException::MemoryExceeded);

    assert_eq!(back, HostException::MemoryExceeded);
    assert!(ctx.fp.is_none());
    assert!(ctx.faults.is_empty(), "pinned guest fault must be released");
    assert!(!ctx.heap.is_live(pinned));
    assert!(!ctx.heap.is_live(temp));
    assert!(!ctx.frames.is_live(f_frame));
    assert!(!ctx.frames.is_live(main_frame));
    assert_eq!(ctx.debugger.handler_entries(), 0, "guest handler search is disabled");
}

#[test]
fn member_instruction_raise_releases_intermediate_cells() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 32);
    f.bytecode[7] = Opcode::QueryM as u8;
    let f = ctx.funcs.define(f);
    ctx.enter_frame(f, 0);
    ctx.pc = 7;

    let base = ctx.heap.allocate(HeapData::Str("base".to_owned()));
    let dim = ctx.heap.allocate(HeapData::Str("dim".to_owned()));
    ctx.member_state.tv_ref = TypedValue::Ref(base);
    ctx.member_state.tv_ref2 = TypedValue::Ref(dim);

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);
    let result = unwind_guest_object(&mut ctx, exc);

    assert_eq!(result, UnwindResult::Propagate(exc));
    assert!(!ctx.heap.is_live(base));
    assert!(!ctx.heap.is_live(dim));
    assert_eq!(ctx.member_state.tv_ref, TypedValue::Uninit);
    assert_eq!(ctx.member_state.tv_ref2, TypedValue::Uninit);
    ctx.heap.dec_ref(exc);
    ctx.heap.dec_ref(exc);
}

#[test]
fn non_member_raise_leaves_intermediate_cells() {
    let mut ctx = VmContext::new();
    let mut f = nop_func("f", 32);
    f.bytecode[7] = Opcode::Throw as u8;
    let f = ctx.funcs.define(f);
    ctx.enter_frame(f, 0);
    ctx.pc = 7;

    let base = ctx.heap.allocate(HeapData::Str("base".to_owned()));
    ctx.member_state.tv_ref = TypedValue::Ref(base);

    let cls = throwable_class(&mut ctx);
    let exc = new_throwable(&mut ctx, cls);
    let result = unwind_guest_object(&mut ctx, exc);

    assert_eq!(result, UnwindResult::Propagate(exc));
    assert!(ctx.heap.is_live(base), "cells are untouched for non-member opcodes");
    assert_eq!(ctx.member_state.tv_ref, TypedValue::Ref(base));
    ctx.member_state.tv_ref.take().drop_with_heap(&mut ctx.heap);
    ctx.heap.dec_ref(exc);
    ctx.heap.dec_ref(exc);
}
