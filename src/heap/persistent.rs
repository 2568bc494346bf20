//! Persistent handles: strong roots that live outside the managed heap.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::heap::visitor::Visitor;
use crate::util::ObjectReference;

/// A table of persistent root slots.
///
/// Every thread owns one region for its own handles, and the process heap owns one for
/// handles that may be used from any thread.
#[derive(Default)]
pub struct PersistentRegion {
    slots: Vec<Option<ObjectReference>>,
    free_slots: Vec<usize>,
    in_use: usize,
    terminated: bool,
}

impl PersistentRegion {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, object: Option<ObjectReference>) -> usize {
        assert!(
            !self.terminated,
            "Persistent created in a terminated region"
        );
        self.in_use += 1;
        match self.free_slots.pop() {
            Some(index) => {
                self.slots[index] = object;
                index
            }
            None => {
                self.slots.push(object);
                self.slots.len() - 1
            }
        }
    }

    fn free(&mut self, index: usize) {
        if self.terminated {
            return;
        }
        self.slots[index] = None;
        self.free_slots.push(index);
        self.in_use -= 1;
    }

    /// The number of handles currently allocated in this region.
    pub fn len(&self) -> usize {
        self.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Handles whose slot holds an object.
    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Mark every object held by this region.
    pub(crate) fn trace(&self, visitor: &mut Visitor<'_>) {
        for object in self.slots.iter().flatten() {
            visitor.mark(*object);
        }
    }

    /// Clear the slots whose object satisfies `pred`. The handles stay allocated and read
    /// as empty. Returns the number of slots cleared.
    pub(crate) fn release_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(ObjectReference) -> bool,
    {
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(&pred) {
                *slot = None;
                released += 1;
            }
        }
        released
    }

    /// Clear every slot. Handles into a terminated region read as empty and ignore writes.
    pub(crate) fn terminate(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
        self.in_use = 0;
        self.terminated = true;
    }
}

/// A strong root to a managed object. Dropping the handle frees its slot.
pub struct Persistent {
    region: Arc<Mutex<PersistentRegion>>,
    index: usize,
}

impl Persistent {
    pub(crate) fn new(
        region: &Arc<Mutex<PersistentRegion>>,
        object: Option<ObjectReference>,
    ) -> Self {
        let index = region.lock().unwrap().allocate(object);
        Persistent {
            region: region.clone(),
            index,
        }
    }

    pub fn get(&self) -> Option<ObjectReference> {
        let region = self.region.lock().unwrap();
        if region.terminated {
            return None;
        }
        region.slots[self.index]
    }

    pub fn set(&self, object: Option<ObjectReference>) {
        let mut region = self.region.lock().unwrap();
        if region.terminated {
            return;
        }
        region.slots[self.index] = object;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl Drop for Persistent {
    fn drop(&mut self) {
        self.region.lock().unwrap().free(self.index);
    }
}

impl fmt::Debug for Persistent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Persistent({:?})", self.get())
    }
}
