//! The exception unwinder.
//!
//! Unwinding proceeds as follows:
//!
//!   - Discard all evaluation-stack temporaries (including pre-live
//!     activation records).
//!
//!   - Check whether the offset that raised the exception lies inside a
//!     protected region; if a handler can take the fault, resume the VM at
//!     the handler.
//!
//!   - Check whether a guest exception is escaping an eagerly executed async
//!     function. If so, pop its frame, wrap the exception into a failed
//!     static wait-handle, leave it on the stack as the call's return value,
//!     and resume the VM.
//!
//!   - Failing all of the above, pop the current frame. If it was the last
//!     frame of this nesting level, hand the exception back to the embedder;
//!     otherwise repeat in the caller's frame.
//!
//! The drivers operate on a *copy* of the top fault record: handler code and
//! destructors may re-enter the interpreter and push further faults, so the
//! underlying stack can grow (and reallocate) mid-unwind. The copy is written
//! back via `replace_top` before control returns to guest code.

use ahash::AHashSet;
use log::{debug, trace};

use crate::{
    class::PREVIOUS_PROP_SLOT,
    context::VmContext,
    fault::{Fault, RaiseSite},
    frame::{FrameId, ResumeKind},
    func::Offset,
    heap::{DestructObserver, HeapData, HeapId},
    host::HostException,
    op::Opcode,
    runtime::{release_frame_locals, TRASH_CLS_REF},
    stack::StackCell,
    value::TypedValue,
    waithandle::{async_generator_fail, StaticWaitHandle},
};

/// Names of the builtins [`unwind_builtin_frame`] accepts. These have no
/// call-prep regions and cannot be coroutines.
pub const BUILTIN_UNWIND_FUNCS: [&str; 3] = ["debug_break", "enable_code_coverage", "start_code_coverage"];

/// Action the interpreter loop takes after handler resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnwindAction {
    /// No handler in this nesting took the fault; keep propagating.
    Propagate,
    /// A handler was identified and the VM state is prepared for entry.
    ResumeVm,
}

/// Outcome of a guest-exception unwind.
#[derive(Debug, PartialEq, Eq)]
pub enum UnwindResult {
    /// The VM state is ready to resume: either a handler was entered (`pc`
    /// points at it and the fault remains in flight), or the exception was
    /// absorbed into a wait-handle.
    Resume,
    /// The exception escaped the outermost frame of this nesting level. The
    /// caller takes over the exception reference and re-raises it to the
    /// enclosing host context.
    Propagate(HeapId),
}

/// Releases the thread-local member-instruction intermediates when the
/// raising instruction is in the member Dim/Final subranges. Other opcodes
/// never hold values there.
fn discard_member_tv_refs<D: DestructObserver>(ctx: &mut VmContext<D>) {
    // No live frame means no member sequence in flight.
    let Some(fp) = ctx.fp else { return };
    let throw_op = ctx.funcs.get(ctx.frames.get(fp).func).op_at(ctx.pc);
    if throw_op.is_member_dim_op() || throw_op.is_member_final_op() {
        trace!("releasing member intermediate cells at {:?}", throw_op);
        let tv = ctx.member_state.tv_ref.take();
        tv.drop_with_heap(&mut ctx.heap);
        let tv2 = ctx.member_state.tv_ref2.take();
        tv2.drop_with_heap(&mut ctx.heap);
    }
}

/// Discards every evaluation-stack cell above the frame's base.
///
/// Pre-live activation records pushed by a construct-prep instruction carry a
/// half-constructed receiver; it is marked no-destruct before the record is
/// popped. `offset` anchors the walk at the faulting instruction for tracing;
/// the cells themselves record which preparation instruction pushed them.
fn discard_stack_temps<D: DestructObserver>(ctx: &mut VmContext<D>, fp: FrameId, offset: Offset) {
    let frame = ctx.frames.get(fp);
    let base = frame.stack_base;
    let func_id = frame.func;
    trace!(
        "discard_stack_temps: base {} sp {} offset {} op {:?}",
        base,
        ctx.stack.len(),
        offset,
        ctx.funcs.get(func_id).op_at(offset)
    );

    while ctx.stack.len() > base {
        match ctx.stack.top().expect("discard_stack_temps: stack below frame base") {
            StackCell::PreLive(rec) => {
                let fpush_off = rec.fpush_off;
                let this = rec.this;
                if ctx.funcs.get(func_id).op_at(fpush_off).is_construct_prep() {
                    let this = this.expect("discard_stack_temps: construct-prep record without receiver");
                    ctx.heap.set_no_destruct(this);
                }
                trace!("  unwind pop pre-live record at depth {}", ctx.stack.len() - 1);
                ctx.stack.pop_pre_live(&mut ctx.heap);
            }
            StackCell::Tv(_) => {
                trace!("  unwind pop typed value at depth {}", ctx.stack.len() - 1);
                ctx.stack.pop_tv(&mut ctx.heap);
            }
        }
    }

    if cfg!(debug_assertions) {
        for slot in &mut ctx.frames.get_mut(fp).cls_ref_slots {
            *slot = TRASH_CLS_REF;
        }
    }
}

/// Walks the handler-table ancestry starting at `eh_idx`, skipping the
/// entries a previous pass through this frame already attempted.
///
/// Catch and fault handlers are mechanically identical here; the guest-level
/// difference (a catch consumes, a fault cleans up and re-raises via
/// `Unwind`) is enforced by the handler's own bytecode.
fn check_handlers<D: DestructObserver>(
    ctx: &mut VmContext<D>,
    fp: FrameId,
    eh_idx: usize,
    fault: &mut Fault,
) -> UnwindAction {
    let func_id = ctx.frames.get(fp).func;
    trace!("check_handlers: func {}", ctx.funcs.get(func_id).name);

    let mut idx = eh_idx;
    let mut i: u32 = 0;
    loop {
        if fault.handled_count <= i {
            fault.handled_count += 1;
            let eh = ctx.funcs.get(func_id).eh_at(idx);
            let (kind, handler) = (eh.kind, eh.handler);
            trace!("check_handlers: entering {kind} handler at {handler}");
            ctx.pc = handler;
            ctx.debugger.on_exception_handler_entered();
            return UnwindAction::ResumeVm;
        }
        match ctx.funcs.get(func_id).eh_at(idx).parent {
            Some(parent) => idx = parent,
            None => break,
        }
        i += 1;
    }
    UnwindAction::Propagate
}

/// Marks a half-constructed receiver no-destruct before its constructor's
/// frame is torn down.
///
/// When throwing from a constructor we normally avoid running the destructor
/// on an object that was never fully constructed. If we are unwinding through
/// the constructor's `RetC`, the constructor has logically finished and the
/// guard does not apply; likewise once locals are gone the receiver slot must
/// not be read. A ctor/dtor match can still be a direct method call, so the
/// caller's call-prep region has the final say.
fn guard_constructor_this<D: DestructObserver>(ctx: &mut VmContext<D>, fp: FrameId, cur_op: Opcode) {
    let frame = ctx.frames.get(fp);
    if cur_op == Opcode::RetC || frame.locals_released() {
        return;
    }
    let func_id = frame.func;
    if ctx.funcs.get(func_id).cls.is_none() {
        return;
    }
    let Some(this) = frame.this else { return };
    let HeapData::Object(obj) = ctx.heap.get(this) else {
        panic!("guard_constructor_this: receiver is not an object");
    };
    let class = ctx.classes.get(obj.cls());
    if class.ctor != Some(func_id) || class.dtor.is_none() {
        return;
    }
    let Some(caller_id) = frame.caller else { return };
    let caller = ctx.frames.get(caller_id);
    let caller_func = ctx.funcs.get(caller.func);
    let Some(fpi) = caller_func.call_prep_at(frame.return_offset) else {
        return;
    };
    if caller_func.op_at(fpi.fpush_off).is_construct_prep() {
        trace!("marking half-constructed receiver no-destruct");
        ctx.heap.set_no_destruct(this);
    }
}

/// Releases a frame's locals unless its sticky latch is already set.
///
/// Locals can already be gone: a destructor or exit hook that raised during
/// an earlier teardown attempt releases them and sets the latch, and from
/// then on they must not be touched.
fn release_locals_once<D: DestructObserver>(ctx: &mut VmContext<D>, fp: FrameId, exception: Option<HeapId>) {
    if !ctx.frames.get(fp).locals_released() {
        release_frame_locals(&mut ctx.heap, ctx.frames.get_mut(fp), exception);
    }
}

/// Discards the current frame, assuming the guest exception `guest` (or a
/// host exception, when `guest` is `None`) is being thrown. Advances
/// `(fp, pc)` to the caller.
///
/// Returns the exception that keeps propagating: unchanged in the common
/// case, or `None` once it has been absorbed into a wait-handle.
fn tear_down_frame<D: DestructObserver>(ctx: &mut VmContext<D>, mut guest: Option<HeapId>) -> Option<HeapId> {
    let fp = ctx.fp.expect("tear_down_frame: no active frame");
    let (func_id, caller, return_offset) = {
        let frame = ctx.frames.get(fp);
        (frame.func, frame.caller, frame.return_offset)
    };
    let cur_op = ctx.funcs.get(func_id).op_at(ctx.pc);
    trace!(
        "tear_down_frame: {} (caller: {:?})",
        ctx.funcs.get(func_id).name,
        caller.map(FrameId::index)
    );

    guard_constructor_this(ctx, fp, cur_op);

    let kind = ResumeKind::classify(ctx.funcs.get(func_id), ctx.frames.get(fp));
    match kind {
        ResumeKind::RegularNotResumed | ResumeKind::AsyncInAwait => {
            release_locals_once(ctx, fp, guest);
            let rec = ctx.frames.remove(fp);
            debug_assert_eq!(ctx.stack.len(), rec.stack_base, "tear_down_frame: temporaries not discarded");
        }
        ResumeKind::AsyncEager => {
            release_locals_once(ctx, fp, guest);
            let rec = ctx.frames.remove(fp);
            debug_assert_eq!(ctx.stack.len(), rec.stack_base, "tear_down_frame: temporaries not discarded");
            if let Some(exc) = guest.take() {
                // The exception escapes the eager prefix of an async
                // function: wrap it into a failed wait-handle and leave that
                // on the caller's return slot.
                let wait_handle = StaticWaitHandle::create_failed(&mut ctx.heap, exc);
                ctx.stack.push_object_no_rc(wait_handle);
                trace!("wrapped exception into failed static wait-handle");
            }
        }
        ResumeKind::AsyncResumed => {
            let owner = ctx.frames.get(fp).owner.expect("tear_down_frame: resumed frame without owner");
            if let Some(exc) = guest.take() {
                release_locals_once(ctx, fp, Some(exc));
                let HeapData::AsyncFnWaitHandle(wh) = ctx.heap.get_mut(owner) else {
                    panic!("tear_down_frame: async function frame owned by a non-wait-handle");
                };
                wh.fail(exc);
            } else {
                let is_running = matches!(ctx.heap.get(owner), HeapData::AsyncFnWaitHandle(wh) if wh.is_running());
                release_locals_once(ctx, fp, None);
                if is_running {
                    // Mark the handle abruptly interrupted; opcodes like
                    // Await may have changed its state just before the host
                    // exception fired.
                    let HeapData::AsyncFnWaitHandle(wh) = ctx.heap.get_mut(owner) else {
                        unreachable!()
                    };
                    wh.fail_host();
                }
            }
            ctx.heap.dec_ref(owner);
            ctx.frames.remove(fp);
        }
        ResumeKind::AsyncGenResumed => {
            let owner = ctx.frames.get(fp).owner.expect("tear_down_frame: resumed frame without owner");
            if let Some(exc) = guest.take() {
                release_locals_once(ctx, fp, Some(exc));
                if let Some(eager_result) = async_generator_fail(&mut ctx.heap, owner, exc) {
                    ctx.stack.push_object_no_rc(eager_result);
                }
            } else {
                let should_fail = matches!(
                    ctx.heap.get(owner),
                    HeapData::AsyncGenerator(gen) if gen.is_eagerly_executed() || gen.is_running()
                );
                release_locals_once(ctx, fp, None);
                if should_fail {
                    let HeapData::AsyncGenerator(gen) = ctx.heap.get_mut(owner) else {
                        unreachable!()
                    };
                    gen.fail_host();
                }
            }
            ctx.heap.dec_ref(owner);
            ctx.frames.remove(fp);
        }
        ResumeKind::NonAsyncGenResumed => {
            let owner = ctx.frames.get(fp).owner.expect("tear_down_frame: resumed frame without owner");
            release_locals_once(ctx, fp, guest);
            let HeapData::Generator(gen) = ctx.heap.get_mut(owner) else {
                panic!("tear_down_frame: generator frame owned by a non-generator");
            };
            gen.fail();
            ctx.heap.dec_ref(owner);
            ctx.frames.remove(fp);
        }
    }

    match caller {
        None => {
            // Final frame of this nesting level.
            ctx.fp = None;
            guest
        }
        Some(prev) => {
            ctx.pc = return_offset;
            ctx.fp = Some(prev);
            guest
        }
    }
}

/// Links `prev` into the end of `top`'s `previous` chain, releasing `prev`
/// instead when either chain contains a cycle.
///
/// The visited set spans both walks: linking must not create a cycle through
/// a node the two chains share.
fn chain_fault_objects<D: DestructObserver>(ctx: &mut VmContext<D>, top: HeapId, prev: HeapId) {
    fn is_throwable<D: DestructObserver>(ctx: &VmContext<D>, id: HeapId) -> bool {
        matches!(ctx.heap.get(id), HeapData::Object(obj) if ctx.classes.get(obj.cls()).is_throwable())
    }

    /// Walks `head`'s `previous` pointers until an unset slot, or reports a
    /// cycle by releasing `prev` and returning `None`.
    fn find_acyclic_prev<D: DestructObserver>(
        ctx: &mut VmContext<D>,
        seen: &mut AHashSet<HeapId>,
        mut head: HeapId,
        prev: HeapId,
    ) -> Option<HeapId> {
        loop {
            if !seen.insert(head) {
                trace!("chain_fault_objects: cycle detected, releasing predecessor");
                ctx.heap.dec_ref(prev);
                return None;
            }
            let HeapData::Object(obj) = ctx.heap.get(head) else {
                panic!("chain_fault_objects: throwable is not an object");
            };
            debug_assert!(
                ctx.classes.throwable_layout_ok(obj.cls()),
                "chain_fault_objects: throwable class missing the previous slot"
            );
            match obj.prop(PREVIOUS_PROP_SLOT) {
                TypedValue::Ref(next) if is_throwable(ctx, *next) => head = *next,
                _ => return Some(head),
            }
        }
    }

    let mut seen: AHashSet<HeapId> = AHashSet::new();

    let Some(tail) = find_acyclic_prev(ctx, &mut seen, top, prev) else {
        return;
    };
    if find_acyclic_prev(ctx, &mut seen, prev, prev).is_none() {
        return;
    }

    // Found an unset previous slot and neither chain is cyclic: transfer the
    // predecessor's reference into the slot.
    let HeapData::Object(tail_obj) = ctx.heap.get_mut(tail) else {
        unreachable!()
    };
    let old = std::mem::replace(tail_obj.prop_mut(PREVIOUS_PROP_SLOT), TypedValue::Ref(prev));
    old.drop_with_heap(&mut ctx.heap);
    trace!(
        "chained fault object {} behind {}",
        prev.index(),
        tail.index()
    );
}

/// Merges the current fault with the record beneath it when both were raised
/// at the same frame and nesting: the current exception escaped the handler
/// the previous one was being handled in.
///
/// On a merge the previous record's raise offset and handled count are
/// adopted (they reflect progress already made through this frame's handler
/// table), and the previous exception becomes the current one's `previous`
/// link. Returns true when a merge occurred so the driver retries handler
/// search with the restored handled count.
fn chain_faults<D: DestructObserver>(ctx: &mut VmContext<D>, fault: &mut Fault) -> bool {
    // The stack top is a stale image of `fault`; the local copy is
    // authoritative. Pop it so the record beneath becomes inspectable.
    let _ = ctx.faults.pop().expect("chain_faults: fault stack empty");
    let Some(prev) = ctx.faults.peek().copied() else {
        ctx.faults.push(*fault);
        return false;
    };

    let same_site = matches!(
        (fault.site, prev.site),
        (Some(cur), Some(before)) if cur.nesting == before.nesting && cur.frame == before.frame
    );
    if !same_site {
        ctx.faults.push(*fault);
        return false;
    }

    fault.site = prev.site;
    fault.handled_count = prev.handled_count;
    chain_fault_objects(ctx, fault.exception, prev.exception);
    let _ = ctx.faults.pop();
    ctx.faults.push(*fault);
    true
}

/// Resumes the unwind of the pending fault.
///
/// Used by the interpreter after a fault handler's `Unwind` opcode; a fault
/// must be in flight. Returns [`UnwindResult::Resume`] with the VM prepared
/// to continue, or hands the still-live exception back for propagation to
/// the enclosing host context.
pub fn unwind_guest<D: DestructObserver>(ctx: &mut VmContext<D>) -> UnwindResult {
    let mut fault = *ctx.faults.peek().expect("unwind_guest: no fault in flight");
    debug!("entering unwinder for fault: exception {}", fault.exception.index());

    discard_member_tv_refs(ctx);

    loop {
        let fp = ctx.fp.expect("unwind_guest: no active frame");
        let mut discard = false;
        if fault.site.is_none() {
            // Treat the fault as freshly thrown: it was either never seen by
            // the unwinder or it propagated here from a torn-down callee.
            fault.site = Some(RaiseSite {
                nesting: ctx.nesting(),
                frame: fp,
                offset: ctx.pc,
            });
            fault.handled_count = 0;
            discard = true;
        }
        let site = fault.site.expect("unwind_guest: raise site bound above");
        trace!(
            "unwind: func {}, raise offset {} frame {}",
            ctx.funcs.get(ctx.frames.get(fp).func).name,
            site.offset,
            fp.index()
        );

        // When handled_count is non-zero this fault already passed through
        // this frame once and the temporaries were discarded before the fault
        // funclet ran; the Unwind opcode contract requires the funclet to
        // leave the stack in that shape, so a second discard would walk cells
        // that are no longer there.
        if discard {
            discard_stack_temps(ctx, fp, site.offset);
        }

        loop {
            // Skip handler search with a pending host exception: no further
            // guest code may run in its face. Likewise when this frame was
            // already torn down (e.g. an exit hook raised after locals were
            // released), no handler of *this* frame can be entered.
            let skip = ctx.unwinding_host
                || ctx.heap.pending_host().is_some()
                || ctx.frames.get(fp).locals_released();
            if !skip {
                if let Some(eh_idx) = ctx.funcs.get(ctx.frames.get(fp).func).find_eh(site.offset) {
                    match check_handlers(ctx, fp, eh_idx, &mut fault) {
                        UnwindAction::ResumeVm => {
                            ctx.faults.replace_top(fault);
                            debug!("leaving unwinder: resuming at handler");
                            return UnwindResult::Resume;
                        }
                        UnwindAction::Propagate => {}
                    }
                }
            }
            // No further handlers for this offset and handled count: the
            // current exception escapes the handler that raised it, so it may
            // be chained with its predecessor.
            if !chain_faults(ctx, &mut fault) {
                break;
            }
        }

        match tear_down_frame(ctx, Some(fault.exception)) {
            None => {
                // Absorbed into a wait-handle; the fault's reference moved
                // with it.
                let _ = ctx.faults.pop().expect("unwind_guest: fault stack empty");
                debug!("leaving unwinder: fault absorbed by wait-handle");
                return UnwindResult::Resume;
            }
            Some(exception) => fault.exception = exception,
        }

        // Handler progress starts over in the caller's frame.
        fault.site = None;
        fault.handled_count = 0;
        ctx.faults.replace_top(fault);

        if ctx.fp.is_none() {
            break;
        }
    }

    debug!("unwind: reached the end of this nesting's frame chain");
    let fault = ctx.faults.pop().expect("unwind_guest: fault stack empty");
    UnwindResult::Propagate(fault.exception)
}

/// Begins a fresh unwind for `throwable`.
///
/// Takes a new reference to the throwable for the fault stack, then proceeds
/// as [`unwind_guest`].
pub fn unwind_guest_object<D: DestructObserver>(ctx: &mut VmContext<D>, throwable: HeapId) -> UnwindResult {
    ctx.heap.inc_ref(throwable);
    ctx.faults.push(Fault::new(throwable));
    unwind_guest(ctx)
}

/// Unwinds a host exception: tears down every frame of the current nesting
/// with guest handler search disabled, releasing any guest faults pinned to
/// the frames on the way, and returns the exception for the embedder to
/// re-raise.
pub fn unwind_host<D: DestructObserver>(ctx: &mut VmContext<D>, exception: HostException) -> HostException {
    debug_assert!(!ctx.unwinding_host, "unwind_host: already unwinding a host exception");
    let prior = std::mem::replace(&mut ctx.unwinding_host, true);
    debug!("entering unwinder for host exception: {exception}");
    let exception = unwind_host_frames(ctx, exception);
    ctx.unwinding_host = prior;
    debug!("leaving unwinder for host exception");
    exception
}

fn unwind_host_frames<D: DestructObserver>(ctx: &mut VmContext<D>, exception: HostException) -> HostException {
    discard_member_tv_refs(ctx);

    while let Some(fp) = ctx.fp {
        let offset = ctx.pc;
        trace!(
            "unwind_host: func {}, offset {} frame {}",
            ctx.funcs.get(ctx.frames.get(fp).func).name,
            offset,
            fp.index()
        );

        // Release every guest fault pinned to this frame.
        loop {
            let pinned = matches!(
                ctx.faults.peek(),
                Some(Fault { site: Some(site), .. }) if site.frame == fp && site.nesting == ctx.nesting()
            );
            if !pinned {
                break;
            }
            let fault = ctx.faults.pop().expect("unwind_host: fault stack empty");
            trace!("  releasing guest fault pinned to frame {}", fp.index());
            ctx.heap.dec_ref(fault.exception);
        }

        discard_stack_temps(ctx, fp, offset);

        let guest = tear_down_frame(ctx, None);
        assert!(guest.is_none(), "unwind_host: teardown produced a guest exception");
    }

    exception
}

/// Specialized cleanup for the enumerated debug builtins.
///
/// Builtin frames have no call-prep regions and cannot be coroutines, so
/// every cell above the frame base is a plain value. The interrupted call
/// yields a null return value on the caller's stack.
///
/// # Panics
/// Panics when the current frame is not one of [`BUILTIN_UNWIND_FUNCS`].
pub fn unwind_builtin_frame<D: DestructObserver>(ctx: &mut VmContext<D>) {
    let fp = ctx.fp.expect("unwind_builtin_frame: no active frame");
    let (func_id, caller, return_offset, base) = {
        let frame = ctx.frames.get(fp);
        (frame.func, frame.caller, frame.return_offset, frame.stack_base)
    };
    {
        let func = ctx.funcs.get(func_id);
        assert!(
            func.is_builtin() && BUILTIN_UNWIND_FUNCS.contains(&func.name.as_str()),
            "unwind_builtin_frame: {} is not an enumerated builtin",
            func.name
        );
    }
    trace!("unwind_builtin_frame: {}", ctx.funcs.get(func_id).name);

    while ctx.stack.len() > base {
        ctx.stack.pop_tv(&mut ctx.heap);
    }

    release_locals_once(ctx, fp, None);

    let caller = caller.expect("unwind_builtin_frame: builtin frame without a caller");
    ctx.frames.remove(fp);
    ctx.fp = Some(caller);
    ctx.pc = return_offset;
    ctx.stack.push_tv(TypedValue::Null);
}
