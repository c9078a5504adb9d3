//! Runtime core for the Kestrel bytecode VM.
//!
//! Kestrel executes a dynamically typed scripting language on a stack-based
//! bytecode VM with both synchronous and coroutine-style (async function,
//! generator) guest functions. This crate holds the runtime's value model and
//! the exception unwinder; the interpreter loop, compiler, and scheduler are
//! separate crates that drive these types through [`context::VmContext`].
//!
//! # Module Structure
//!
//! - `op` - Opcode discriminant and subrange predicates
//! - `value` - Typed value cells
//! - `heap` - Reference-counted arena with destructor observation
//! - `class` - Guest classes, instances, and the throwable hierarchy
//! - `func` - Bytecode function descriptors and handler tables
//! - `stack` - Evaluation stack of values and pre-live activation records
//! - `frame` - Activation records and resume-kind classification
//! - `fault` - In-flight exception records
//! - `waithandle` - Wait-handle and generator failure state machines
//! - `host` - Exceptions raised below the interpreter
//! - `context` - The VM context threaded through entry points
//! - `runtime` - Frame-locals release and debug trap patterns
//! - `unwind` - The exception unwinder

mod class;
mod context;
mod fault;
mod frame;
mod func;
mod heap;
mod host;
mod op;
mod runtime;
mod stack;
mod unwind;
mod value;
mod waithandle;

pub use crate::{
    class::{Class, ClassFlags, ClassId, ClassTable, ObjectData, PREVIOUS_PROP_SLOT},
    context::{DebuggerHook, MemberState, VmContext},
    fault::{Fault, FaultStack, RaiseSite},
    frame::{ActRec, ClsRef, FrameFlags, FrameId, Frames, ResumeKind},
    func::{EhEnt, EhKind, FpiEnt, Func, FuncAttrs, FuncId, FuncKind, FuncTable, Offset},
    heap::{DestructObserver, DestructOutcome, Heap, HeapData, HeapId, NopObserver},
    host::HostException,
    op::{InvalidOpcodeError, Opcode},
    runtime::{release_frame_locals, TRASH_CLS_REF},
    stack::{PreLiveRec, Stack, StackCell},
    unwind::{
        unwind_builtin_frame, unwind_guest, unwind_guest_object, unwind_host, UnwindResult, BUILTIN_UNWIND_FUNCS,
    },
    value::TypedValue,
    waithandle::{
        async_generator_fail, AsyncFnWaitHandle, AsyncGenerator, Generator, GeneratorState, StaticWaitHandle,
        WaitHandleState,
    },
};
