//! Wait-handles and generators: the coroutine objects the unwinder must
//! transition to a failed state instead of merely dropping.
//!
//! Scheduling and resumption live elsewhere; this module only implements the
//! state machines the frame tearer drives. Invalid transitions are contract
//! violations and abort.

use strum::Display;

use crate::{
    heap::{DestructObserver, Heap, HeapData, HeapId},
    value::TypedValue,
};

/// Lifecycle of a wait-handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum WaitHandleState {
    /// Body is executing on the interpreter stack right now.
    Running,
    /// Suspended at an `Await`, waiting on a child handle.
    Blocked,
    /// Finished with a value.
    Succeeded,
    /// Finished with a guest exception.
    Failed,
    /// Abruptly interrupted by a host exception; carries no guest result.
    Aborted,
}

/// A wait-handle whose result existed at creation time.
///
/// The unwinder creates failed ones to represent an exception escaping the
/// eager prefix of an async function.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct StaticWaitHandle {
    state: WaitHandleState,
    result: TypedValue,
}

impl StaticWaitHandle {
    /// Allocates a failed handle owning one reference to `exception`.
    ///
    /// The caller transfers its reference: no refcount is taken here.
    pub fn create_failed<D: DestructObserver>(heap: &mut Heap<D>, exception: HeapId) -> HeapId {
        heap.allocate(HeapData::StaticWaitHandle(Self {
            state: WaitHandleState::Failed,
            result: TypedValue::Ref(exception),
        }))
    }

    #[inline]
    pub fn state(&self) -> WaitHandleState {
        self.state
    }

    /// The stored result: the exception for failed handles.
    #[inline]
    pub fn result(&self) -> &TypedValue {
        &self.result
    }

    pub(crate) fn take_result(&mut self) -> TypedValue {
        self.result.take()
    }
}

/// The wait-handle of a suspended-or-running async function.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AsyncFnWaitHandle {
    state: WaitHandleState,
    result: TypedValue,
}

impl AsyncFnWaitHandle {
    /// A handle for an async function body that has been resumed.
    pub fn running() -> Self {
        Self {
            state: WaitHandleState::Running,
            result: TypedValue::Uninit,
        }
    }

    #[inline]
    pub fn state(&self) -> WaitHandleState {
        self.state
    }

    /// True while the body is executing on the interpreter stack.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == WaitHandleState::Running
    }

    /// Fails the handle with a guest exception, taking ownership of the
    /// caller's reference.
    ///
    /// # Panics
    /// Panics if the handle already finished.
    pub fn fail(&mut self, exception: HeapId) {
        assert!(
            matches!(self.state, WaitHandleState::Running | WaitHandleState::Blocked),
            "AsyncFnWaitHandle::fail: handle already finished ({})",
            self.state
        );
        self.state = WaitHandleState::Failed;
        self.result = TypedValue::Ref(exception);
    }

    /// Marks the handle abruptly interrupted by a host exception.
    ///
    /// # Panics
    /// Panics if the handle already finished.
    pub fn fail_host(&mut self) {
        assert!(
            matches!(self.state, WaitHandleState::Running | WaitHandleState::Blocked),
            "AsyncFnWaitHandle::fail_host: handle already finished ({})",
            self.state
        );
        self.state = WaitHandleState::Aborted;
    }

    pub(crate) fn take_result(&mut self) -> TypedValue {
        self.result.take()
    }
}

/// Lifecycle of a generator body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
pub enum GeneratorState {
    Ready,
    Running,
    Done,
    Failed,
    /// Abruptly interrupted by a host exception.
    Aborted,
}

/// An async generator: a coroutine producing wait-handles.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AsyncGenerator {
    state: GeneratorState,
    /// True while the current step runs eagerly (no scheduler involved); the
    /// consumer is given a static wait-handle instead of a scheduled one.
    eager: bool,
    /// Failure payload for non-eager steps, consumed by the scheduler.
    pending_exception: TypedValue,
}

impl AsyncGenerator {
    /// A generator whose current step is executing.
    pub fn running(eager: bool) -> Self {
        Self {
            state: GeneratorState::Running,
            eager,
            pending_exception: TypedValue::Uninit,
        }
    }

    #[inline]
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    #[inline]
    pub fn is_eagerly_executed(&self) -> bool {
        self.eager
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == GeneratorState::Running
    }

    /// Marks the generator abruptly interrupted by a host exception.
    pub fn fail_host(&mut self) {
        assert!(
            self.state == GeneratorState::Running,
            "AsyncGenerator::fail_host: generator not running ({})",
            self.state
        );
        self.state = GeneratorState::Aborted;
    }

    pub(crate) fn take_pending_exception(&mut self) -> TypedValue {
        self.pending_exception.take()
    }
}

/// Fails an async generator with a guest exception.
///
/// Takes ownership of the caller's reference to `exception`. When the current
/// step runs eagerly, returns a failed static wait-handle for the consumer
/// (ownership of the exception moves into the handle); otherwise the failure
/// is stored for the scheduler and `None` is returned.
///
/// # Panics
/// Panics if the generator is not running.
pub fn async_generator_fail<D: DestructObserver>(
    heap: &mut Heap<D>,
    generator: HeapId,
    exception: HeapId,
) -> Option<HeapId> {
    let eager = {
        let HeapData::AsyncGenerator(gen) = heap.get_mut(generator) else {
            panic!("async_generator_fail: object is not an async generator");
        };
        assert!(
            gen.state == GeneratorState::Running,
            "async_generator_fail: generator not running ({})",
            gen.state
        );
        gen.state = GeneratorState::Failed;
        if !gen.eager {
            gen.pending_exception = TypedValue::Ref(exception);
        }
        gen.eager
    };
    eager.then(|| StaticWaitHandle::create_failed(heap, exception))
}

/// A non-async generator.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Generator {
    state: GeneratorState,
}

impl Generator {
    /// A generator whose body is executing.
    pub fn running() -> Self {
        Self {
            state: GeneratorState::Running,
        }
    }

    #[inline]
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// Marks the generator finished. Later resumption attempts see an
    /// exhausted generator.
    pub fn fail(&mut self) {
        self.state = GeneratorState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, NopObserver};

    #[test]
    fn async_fn_handle_fails_once() {
        let mut heap: Heap<NopObserver> = Heap::new(NopObserver);
        let exc = heap.allocate(HeapData::Str("boom".to_owned()));
        let mut wh = AsyncFnWaitHandle::running();
        assert!(wh.is_running());
        wh.fail(exc);
        assert_eq!(wh.state(), WaitHandleState::Failed);
        wh.take_result().drop_with_heap(&mut heap);
    }

    #[test]
    #[should_panic(expected = "already finished")]
    fn async_fn_handle_rejects_double_fail() {
        let mut wh = AsyncFnWaitHandle::running();
        wh.fail_host();
        wh.fail_host();
    }

    #[test]
    fn eager_async_generator_returns_static_handle() {
        let mut heap: Heap<NopObserver> = Heap::new(NopObserver);
        let exc = heap.allocate(HeapData::Str("boom".to_owned()));
        let gen = heap.allocate(HeapData::AsyncGenerator(AsyncGenerator::running(true)));

        let eager = async_generator_fail(&mut heap, gen, exc).expect("eager result");
        let HeapData::StaticWaitHandle(wh) = heap.get(eager) else {
            panic!("expected static wait-handle");
        };
        assert_eq!(wh.state(), WaitHandleState::Failed);
        assert_eq!(wh.result().ref_id(), Some(exc));

        heap.dec_ref(eager);
        heap.dec_ref(gen);
    }

    #[test]
    fn scheduled_async_generator_stores_failure() {
        let mut heap: Heap<NopObserver> = Heap::new(NopObserver);
        let exc = heap.allocate(HeapData::Str("boom".to_owned()));
        let gen = heap.allocate(HeapData::AsyncGenerator(AsyncGenerator::running(false)));

        assert!(async_generator_fail(&mut heap, gen, exc).is_none());
        let HeapData::AsyncGenerator(g) = heap.get(gen) else { unreachable!() };
        assert_eq!(g.state(), GeneratorState::Failed);

        heap.dec_ref(gen);
    }
}
