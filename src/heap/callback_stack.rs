//! Work lists of (object, callback) pairs used while marking.
//!
//! A heap owns one [`CallbackStack`] for each [`CallbackKind`]. Entries are stored in
//! fixed-size blocks so that pushing never moves existing entries and the memory can be
//! released in one go once a collection has finished.

use std::fmt;
use std::mem;

use enum_map::Enum;

use crate::heap::visitor::Visitor;
use crate::util::ObjectReference;

/// A function invoked during a collection with the marking visitor and the object it was
/// registered for.
pub type VisitorCallback = fn(&mut Visitor<'_>, ObjectReference);

/// The four work lists of a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, strum_macros::Display)]
pub enum CallbackKind {
    /// Objects whose outgoing references still need to be traced.
    Marking,
    /// Callbacks run once marking has reached a fixpoint, such as weak table "iteration done"
    /// notifications.
    PostMarking,
    /// Callbacks that clear weak references to objects that did not survive.
    GlobalWeak,
    /// Ephemeron iteration callbacks. They are invoked repeatedly, without being removed,
    /// until marking stops producing work.
    Ephemeron,
}

/// A callback tagged with the work list it belongs to.
#[derive(Copy, Clone)]
pub enum Callback {
    Trace(VisitorCallback),
    PostMarking(VisitorCallback),
    GlobalWeak(VisitorCallback),
    EphemeronIteration(VisitorCallback),
}

impl Callback {
    /// The work list this callback may be pushed onto.
    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Trace(_) => CallbackKind::Marking,
            Callback::PostMarking(_) => CallbackKind::PostMarking,
            Callback::GlobalWeak(_) => CallbackKind::GlobalWeak,
            Callback::EphemeronIteration(_) => CallbackKind::Ephemeron,
        }
    }

    fn function(&self) -> VisitorCallback {
        match *self {
            Callback::Trace(f)
            | Callback::PostMarking(f)
            | Callback::GlobalWeak(f)
            | Callback::EphemeronIteration(f) => f,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Callback({})", self.kind())
    }
}

/// An entry of a callback stack.
#[derive(Copy, Clone, Debug)]
pub struct CallbackEntry {
    object: ObjectReference,
    callback: Callback,
}

impl CallbackEntry {
    pub fn object(&self) -> ObjectReference {
        self.object
    }

    pub fn callback(&self) -> Callback {
        self.callback
    }

    pub fn invoke(&self, visitor: &mut Visitor<'_>) {
        (self.callback.function())(visitor, self.object)
    }
}

/// A LIFO work list of callback entries, allocated in blocks of `block_size` entries.
///
/// The stack must be committed before anything is pushed onto it. A heap commits its
/// stacks when a collection starts and decommits them when it ends.
pub struct CallbackStack {
    kind: CallbackKind,
    block_size: usize,
    blocks: Vec<Vec<CallbackEntry>>,
    committed: bool,
}

impl CallbackStack {
    pub fn new(kind: CallbackKind, block_size: usize) -> Self {
        debug_assert!(block_size > 0);
        CallbackStack {
            kind,
            block_size,
            blocks: vec![],
            committed: false,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Reserve the first block.
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.blocks.push(Vec::with_capacity(self.block_size));
        self.committed = true;
    }

    /// Release all blocks. Pending entries are dropped.
    pub fn decommit(&mut self) {
        debug_assert!(
            self.is_empty() || self.kind == CallbackKind::Ephemeron,
            "{} callback stack decommitted with {} pending entries",
            self.kind,
            self.len()
        );
        self.blocks = vec![];
        self.committed = false;
    }

    /// Push an entry. The callback must be of this stack's kind.
    pub fn push(&mut self, object: ObjectReference, callback: Callback) {
        assert!(
            self.committed,
            "{} callback stack is not committed",
            self.kind
        );
        assert_eq!(
            callback.kind(),
            self.kind,
            "{:?} pushed onto the {} callback stack",
            callback,
            self.kind
        );
        self.push_entry(CallbackEntry { object, callback });
    }

    fn push_entry(&mut self, entry: CallbackEntry) {
        match self.blocks.last_mut() {
            Some(block) if block.len() < self.block_size => block.push(entry),
            _ => {
                trace!(
                    "{} callback stack: new block #{}",
                    self.kind,
                    self.blocks.len()
                );
                let mut block = Vec::with_capacity(self.block_size);
                block.push(entry);
                self.blocks.push(block);
            }
        }
    }

    /// Pop the most recently pushed entry.
    pub fn pop(&mut self) -> Option<CallbackEntry> {
        loop {
            let block = self.blocks.last_mut()?;
            if let Some(entry) = block.pop() {
                return Some(entry);
            }
            if self.blocks.len() == 1 {
                return None;
            }
            self.blocks.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Iterate the entries without removing them.
    pub fn iter(&self) -> impl Iterator<Item = &CallbackEntry> {
        self.blocks.iter().flatten()
    }

    /// Move all entries out into a new stack, leaving an empty stack with the same commit
    /// state behind.
    pub(crate) fn take(&mut self) -> CallbackStack {
        let mut fresh = CallbackStack::new(self.kind, self.block_size);
        if self.committed {
            fresh.commit();
        }
        mem::replace(self, fresh)
    }

    /// Move all entries of `other` onto this stack.
    pub(crate) fn append(&mut self, other: CallbackStack) {
        debug_assert_eq!(self.kind, other.kind);
        for entry in other.blocks.into_iter().flatten() {
            self.push_entry(entry);
        }
    }

    /// Is there an entry registered for `object`? This is a linear scan and is only
    /// available in debug builds.
    #[cfg(debug_assertions)]
    pub fn has_callback_for_object(&self, object: ObjectReference) -> bool {
        self.iter().any(|entry| entry.object == object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn noop(_visitor: &mut Visitor<'_>, _object: ObjectReference) {}

    fn object(raw: usize) -> ObjectReference {
        ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) }).unwrap()
    }

    #[test]
    fn lifo_across_blocks() {
        let mut stack = CallbackStack::new(CallbackKind::Marking, 4);
        stack.commit();
        assert!(stack.is_empty());
        for i in 1..=10 {
            stack.push(object(i * 16), Callback::Trace(noop));
        }
        assert_eq!(stack.len(), 10);
        assert_eq!(stack.blocks.len(), 3);
        for i in (1..=10).rev() {
            let entry = stack.pop().unwrap();
            assert_eq!(entry.object(), object(i * 16));
            assert_eq!(entry.callback().kind(), CallbackKind::Marking);
        }
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
        assert_eq!(stack.blocks.len(), 1);
    }

    #[test]
    fn push_after_draining_a_block() {
        let mut stack = CallbackStack::new(CallbackKind::PostMarking, 2);
        stack.commit();
        stack.push(object(16), Callback::PostMarking(noop));
        stack.push(object(32), Callback::PostMarking(noop));
        stack.push(object(48), Callback::PostMarking(noop));
        assert_eq!(stack.pop().unwrap().object(), object(48));
        stack.push(object(64), Callback::PostMarking(noop));
        assert_eq!(stack.pop().unwrap().object(), object(64));
        assert_eq!(stack.pop().unwrap().object(), object(32));
        assert_eq!(stack.pop().unwrap().object(), object(16));
        assert!(stack.pop().is_none());
    }

    #[test]
    #[should_panic(expected = "is not committed")]
    fn push_uncommitted() {
        let mut stack = CallbackStack::new(CallbackKind::Marking, 4);
        stack.push(object(16), Callback::Trace(noop));
    }

    #[test]
    #[should_panic(expected = "pushed onto the Marking callback stack")]
    fn push_mismatched_kind() {
        let mut stack = CallbackStack::new(CallbackKind::Marking, 4);
        stack.commit();
        stack.push(object(16), Callback::GlobalWeak(noop));
    }

    #[test]
    fn decommit_releases_blocks() {
        let mut stack = CallbackStack::new(CallbackKind::Ephemeron, 4);
        stack.commit();
        stack.push(object(16), Callback::EphemeronIteration(noop));
        stack.decommit();
        assert!(!stack.is_committed());
        assert!(stack.is_empty());
        stack.commit();
        assert!(stack.is_empty());
    }

    #[test]
    fn take_and_append() {
        let mut stack = CallbackStack::new(CallbackKind::Ephemeron, 2);
        stack.commit();
        for i in 1..=3 {
            stack.push(object(i * 16), Callback::EphemeronIteration(noop));
        }
        let taken = stack.take();
        assert!(stack.is_committed());
        assert!(stack.is_empty());
        assert_eq!(taken.iter().count(), 3);

        stack.push(object(64), Callback::EphemeronIteration(noop));
        stack.append(taken);
        assert_eq!(stack.len(), 4);
        let mut objects: Vec<_> = stack.iter().map(|e| e.object()).collect();
        objects.sort();
        assert_eq!(objects, vec![object(16), object(32), object(48), object(64)]);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn has_callback_for_object() {
        let mut stack = CallbackStack::new(CallbackKind::GlobalWeak, 4);
        stack.commit();
        stack.push(object(16), Callback::GlobalWeak(noop));
        assert!(stack.has_callback_for_object(object(16)));
        assert!(!stack.has_callback_for_object(object(32)));
    }
}
