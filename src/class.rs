//! Guest classes and object instances.
//!
//! Only the surface the unwinder needs: constructor/destructor identity for the
//! constructor guard, the throwable hierarchy for exception chaining, and fixed
//! property slots (the chainer reads and writes the `previous` slot directly).

use bitflags::bitflags;

use crate::{func::FuncId, value::TypedValue};

/// Unique identifier for classes registered in the [`ClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ClassId(usize);

impl ClassId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Classification flags for guest classes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct ClassFlags: u8 {
        /// Class is part of the throwable hierarchy (`Error`/`Exception` and
        /// subclasses). Only throwables participate in exception chaining.
        const THROWABLE = 1 << 0;
    }
}

/// Declared property slot of the `previous` link on both throwable base
/// classes. Debug builds verify the layout before chaining; see
/// [`ClassTable::throwable_layout_ok`].
pub const PREVIOUS_PROP_SLOT: usize = 6;

/// A guest class descriptor.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Class {
    pub name: String,
    /// Number of declared property slots on instances.
    pub num_props: usize,
    /// Constructor, when the class declares one.
    pub ctor: Option<FuncId>,
    /// Destructor, when the class declares one. Instances of such classes run
    /// guest code when their refcount reaches zero.
    pub dtor: Option<FuncId>,
    pub flags: ClassFlags,
}

impl Class {
    /// Creates a plain class with `num_props` property slots and no special
    /// members.
    pub fn new(name: impl Into<String>, num_props: usize) -> Self {
        Self {
            name: name.into(),
            num_props,
            ctor: None,
            dtor: None,
            flags: ClassFlags::empty(),
        }
    }

    /// True when instances belong to the throwable hierarchy.
    #[inline]
    pub fn is_throwable(&self) -> bool {
        self.flags.contains(ClassFlags::THROWABLE)
    }
}

/// Registry of guest classes, keyed by [`ClassId`].
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ClassTable {
    classes: Vec<Class>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class and returns its id.
    pub fn define(&mut self, class: Class) -> ClassId {
        let id = ClassId(self.classes.len());
        self.classes.push(class);
        id
    }

    /// Returns the class descriptor for `id`.
    ///
    /// # Panics
    /// Panics if the id is unknown.
    #[must_use]
    pub fn get(&self, id: ClassId) -> &Class {
        self.classes.get(id.index()).expect("ClassTable::get: unknown class id")
    }

    /// Returns a mutable class descriptor for `id`.
    pub fn get_mut(&mut self, id: ClassId) -> &mut Class {
        self.classes
            .get_mut(id.index())
            .expect("ClassTable::get_mut: unknown class id")
    }

    /// Debug check that a throwable class carries the `previous` slot the
    /// chainer writes through.
    pub fn throwable_layout_ok(&self, id: ClassId) -> bool {
        let class = self.get(id);
        class.is_throwable() && class.num_props > PREVIOUS_PROP_SLOT
    }
}

/// A guest object instance.
///
/// Properties are fixed slots indexed by declared-property position. The
/// `no_destruct` latch suppresses the destructor when the object is released;
/// the unwinder sets it on half-constructed receivers.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ObjectData {
    cls: ClassId,
    props: Vec<TypedValue>,
    no_destruct: bool,
    /// Cached at allocation so releasing the object does not need the class
    /// table; see `Heap::dec_ref`.
    has_dtor: bool,
}

impl ObjectData {
    /// Creates an instance of `cls` with all property slots set to null.
    pub fn new(cls: ClassId, class: &Class) -> Self {
        Self {
            cls,
            props: std::iter::repeat_with(|| TypedValue::Null).take(class.num_props).collect(),
            no_destruct: false,
            has_dtor: class.dtor.is_some(),
        }
    }

    #[inline]
    pub fn cls(&self) -> ClassId {
        self.cls
    }

    /// Reads the property at `slot`.
    ///
    /// # Panics
    /// Panics if the slot is out of range for the class.
    #[must_use]
    pub fn prop(&self, slot: usize) -> &TypedValue {
        self.props.get(slot).expect("ObjectData::prop: slot out of range")
    }

    /// Mutable access to the property at `slot`.
    pub fn prop_mut(&mut self, slot: usize) -> &mut TypedValue {
        self.props.get_mut(slot).expect("ObjectData::prop_mut: slot out of range")
    }

    /// Marks the object so its destructor is skipped on release. Sticky.
    #[inline]
    pub fn set_no_destruct(&mut self) {
        self.no_destruct = true;
    }

    #[inline]
    pub fn no_destruct(&self) -> bool {
        self.no_destruct
    }

    #[inline]
    pub fn has_dtor(&self) -> bool {
        self.has_dtor
    }

    /// Drains the property slots for release by the heap.
    pub(crate) fn take_props(&mut self) -> Vec<TypedValue> {
        std::mem::take(&mut self.props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throwable_layout_check() {
        let mut classes = ClassTable::new();
        let mut error = Class::new("Error", PREVIOUS_PROP_SLOT + 2);
        error.flags |= ClassFlags::THROWABLE;
        let error = classes.define(error);
        let plain = classes.define(Class::new("Plain", 1));

        assert!(classes.throwable_layout_ok(error));
        assert!(!classes.throwable_layout_ok(plain));
    }

    #[test]
    fn no_destruct_is_sticky() {
        let class = Class::new("C", 2);
        let mut obj = ObjectData::new(ClassId(0), &class);
        assert!(!obj.no_destruct());
        obj.set_no_destruct();
        obj.set_no_destruct();
        assert!(obj.no_destruct());
    }
}
