//! Reference-counted arena backing all heap-only guest values.
//!
//! Uses a free list to reuse slots from freed values. The arena is generic
//! over a [`DestructObserver`]: when an object whose class declares a
//! destructor hits refcount zero (and its no-destruct latch is clear), the
//! observer stands in for the guest destructor call. A destructor may raise;
//! the raise is swallowed at this boundary and recorded in the surprise state
//! so the interpreter can schedule a fatal at its next safe point. A host
//! raise becomes the pending host exception, which disables guest handler
//! search for the rest of the unwind.

use log::trace;

use crate::{
    class::{ClassId, ObjectData},
    host::HostException,
    value::TypedValue,
    waithandle::{AsyncFnWaitHandle, AsyncGenerator, Generator, StaticWaitHandle},
};

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Every runtime value that must live in the arena.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum HeapData {
    /// A guest object instance (including throwables).
    Object(ObjectData),
    /// A wait-handle finished at creation time.
    StaticWaitHandle(StaticWaitHandle),
    /// The wait-handle of a resumed async function.
    AsyncFnWaitHandle(AsyncFnWaitHandle),
    /// An async generator coroutine.
    AsyncGenerator(AsyncGenerator),
    /// A non-async generator coroutine.
    Generator(Generator),
    /// A guest string payload (messages, names).
    Str(String),
}

impl HeapData {
    /// Collects ids of child references held by this value, draining them so
    /// the payload can be dropped without touching refcounts again.
    fn drain_child_ids(&mut self, out: &mut Vec<HeapId>) {
        let mut collect = |tv: TypedValue| {
            if let TypedValue::Ref(id) = tv {
                out.push(id);
            }
        };
        match self {
            Self::Object(obj) => {
                for prop in obj.take_props() {
                    collect(prop);
                }
            }
            Self::StaticWaitHandle(wh) => collect(wh.take_result()),
            Self::AsyncFnWaitHandle(wh) => collect(wh.take_result()),
            Self::AsyncGenerator(gen) => collect(gen.take_pending_exception()),
            Self::Generator(_) | Self::Str(_) => {}
        }
    }
}

/// Result of a guest destructor standing in behind the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestructOutcome {
    /// Destructor returned normally.
    Completed,
    /// Destructor raised a guest exception. Swallowed at this boundary; the
    /// surprise flag schedules a fatal at the interpreter's next safe point.
    GuestRaise,
    /// Destructor triggered a host exception (timeout, memory, fatal).
    HostRaise(HostException),
}

/// Hook standing in for guest destructor execution.
///
/// The interpreter installs an observer that runs the destructor bytecode;
/// tests install scripted observers. The default [`NopObserver`] completes
/// every destructor without running anything.
pub trait DestructObserver {
    /// Called when an instance of `cls` with a declared destructor is freed.
    fn on_destruct(&mut self, cls: ClassId, obj: HeapId) -> DestructOutcome;
}

/// Observer that treats every destructor as an empty body.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopObserver;

impl DestructObserver for NopObserver {
    fn on_destruct(&mut self, _cls: ClassId, _obj: HeapId) -> DestructOutcome {
        DestructOutcome::Completed
    }
}

/// A single entry inside the heap arena: refcount plus payload.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct HeapValue {
    refcount: usize,
    data: HeapData,
}

/// Reference-counted arena that backs all heap-only runtime values.
#[derive(Debug)]
pub struct Heap<D: DestructObserver> {
    entries: Vec<Option<HeapValue>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`,
    /// consumed by `allocate`.
    free_list: Vec<HeapId>,
    observer: D,
    /// Host exception raised by a destructor, pending propagation. Visible to
    /// handler search: no guest handler may run while this is set.
    pending_host: Option<HostException>,
    /// Set when a destructor raise was swallowed; the interpreter turns this
    /// into a fatal at its next safe point.
    surprise: bool,
    /// Number of destructor raises swallowed at the release boundary.
    swallowed_raises: u32,
}

impl<D: DestructObserver> Heap<D> {
    /// Creates a new heap with the given destructor observer.
    pub fn new(observer: D) -> Self {
        Self {
            entries: Vec::with_capacity(64),
            free_list: Vec::new(),
            observer,
            pending_host: None,
            surprise: false,
            swallowed_raises: 0,
        }
    }

    /// Returns a reference to the destructor observer.
    pub fn observer(&self) -> &D {
        &self.observer
    }

    /// Returns a mutable reference to the destructor observer.
    pub fn observer_mut(&mut self) -> &mut D {
        &mut self.observer
    }

    /// Allocates a new heap entry with refcount 1.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let new_entry = HeapValue { refcount: 1, data };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(new_entry));
            id
        }
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn inc_ref(&mut self, id: HeapId) {
        let value = self
            .entries
            .get_mut(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_mut()
            .expect("Heap::inc_ref: object already freed");
        value.refcount += 1;
    }

    /// Decrements the reference count and frees the value (plus children)
    /// once it hits zero.
    ///
    /// Freeing an object whose class declares a destructor notifies the
    /// observer first, unless the object's no-destruct latch is set. Observer
    /// raises are swallowed here; see the module docs.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
        let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
        if entry.refcount > 1 {
            entry.refcount -= 1;
            return;
        }

        if let HeapData::Object(obj) = &entry.data {
            if obj.has_dtor() && !obj.no_destruct() {
                let cls = obj.cls();
                match self.observer.on_destruct(cls, id) {
                    DestructOutcome::Completed => {}
                    DestructOutcome::GuestRaise => {
                        // Swallowed at the destructor boundary; guest
                        // execution proceeds and a fatal fires at the next
                        // safe point.
                        trace!("swallowing destructor raise for object {}", id.index());
                        self.surprise = true;
                        self.swallowed_raises += 1;
                    }
                    DestructOutcome::HostRaise(exc) => {
                        trace!("destructor raised host exception: {exc}");
                        if self.pending_host.is_none() {
                            self.pending_host = Some(exc);
                        }
                    }
                }
            }
        }

        let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
        let value = slot.take().expect("Heap::dec_ref: slot emptied during destructor");
        self.free_list.push(id);

        let mut child_ids = Vec::new();
        let mut data = value.data;
        data.drain_child_ids(&mut child_ids);
        drop(data);
        for child_id in child_ids {
            self.dec_ref(child_id);
        }
    }

    /// Returns an immutable reference to the heap data stored at `id`.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns a mutable reference to the heap data stored at `id`.
    ///
    /// # Panics
    /// Panics if the id is invalid or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Current refcount of a live entry. Test and assertion helper.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::refcount: slot missing")
            .as_ref()
            .expect("Heap::refcount: object already freed")
            .refcount
    }

    /// True when the entry at `id` has not been freed.
    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        matches!(self.entries.get(id.index()), Some(Some(_)))
    }

    /// Marks the object at `id` so its destructor is skipped on release.
    ///
    /// # Panics
    /// Panics if `id` does not refer to a live object.
    pub fn set_no_destruct(&mut self, id: HeapId) {
        let HeapData::Object(obj) = self.get_mut(id) else {
            panic!("Heap::set_no_destruct: not an object");
        };
        obj.set_no_destruct();
    }

    /// The host exception raised by a destructor, if one is pending.
    #[inline]
    pub fn pending_host(&self) -> Option<&HostException> {
        self.pending_host.as_ref()
    }

    /// Takes the pending host exception, clearing it.
    pub fn take_pending_host(&mut self) -> Option<HostException> {
        self.pending_host.take()
    }

    /// True when a destructor raise was swallowed since the last safe point.
    #[inline]
    pub fn surprise_flagged(&self) -> bool {
        self.surprise
    }

    /// Clears the surprise flag. Called by the interpreter at safe points.
    pub fn clear_surprise(&mut self) {
        self.surprise = false;
    }

    /// Number of destructor raises swallowed so far.
    #[inline]
    pub fn swallowed_raises(&self) -> u32 {
        self.swallowed_raises
    }
}
