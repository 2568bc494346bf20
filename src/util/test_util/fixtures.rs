// Not every test uses every fixture.
#![allow(dead_code)]

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::heap::visitor::Visitor;
use crate::heap::{GarbageCollected, GcReason, ThreadHeap};
use crate::process_heap::ProcessHeap;
use crate::thread_state::{StackState, ThreadState};
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};

pub trait FixtureContent {
    fn create() -> Self;
}

/// A process heap and the calling thread attached to a fresh main-thread heap.
pub struct HeapFixture {
    pub process: Arc<ProcessHeap>,
    pub state: Arc<ThreadState>,
}

impl FixtureContent for HeapFixture {
    fn create() -> Self {
        Self::with_options(Options::builtin())
    }
}

impl HeapFixture {
    pub fn with_options(options: Options) -> Self {
        let process = ProcessHeap::init(options);
        let state = ThreadState::attach_main_thread(process.clone());
        HeapFixture { process, state }
    }

    pub fn heap(&self) -> &Arc<ThreadHeap> {
        self.state.heap()
    }

    /// A precise collection on the calling thread.
    pub fn collect(&self) -> bool {
        self.state
            .collect_garbage(StackState::NoHeapPointersOnStack, GcReason::ForcedGc)
    }

    pub fn teardown(self) {
        self.state.detach();
        self.process.shutdown();
    }
}

pub fn with_heap<F: FnOnce(&HeapFixture)>(f: F) {
    let fixture = HeapFixture::create();
    f(&fixture);
    fixture.teardown();
}

/// The object reference of a value that lives on the managed heap.
pub fn object_of<T: GarbageCollected>(value: &T) -> ObjectReference {
    ObjectReference::from_raw_address(Address::from_ref(value)).unwrap()
}

/// A graph node with strong edges. Counts its finalizations.
pub struct Node {
    pub children: RefCell<Vec<ObjectReference>>,
    finalized: Arc<AtomicUsize>,
}

impl Node {
    pub fn new(finalized: &Arc<AtomicUsize>) -> Self {
        Node {
            children: RefCell::new(vec![]),
            finalized: finalized.clone(),
        }
    }

    pub fn add_child(&self, child: ObjectReference) {
        self.children.borrow_mut().push(child);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

impl GarbageCollected for Node {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        for child in self.children.borrow().iter() {
            visitor.mark(*child);
        }
    }
}

pub fn node<'a>(object: ObjectReference) -> &'a Node {
    unsafe { object.as_ref() }
}

/// A weak table: the value of an entry is kept alive only while its key is alive, and
/// entries with dead keys are removed after marking.
pub struct EphemeronTable {
    pub entries: RefCell<Vec<(ObjectReference, ObjectReference)>>,
    pub iterations: Arc<AtomicUsize>,
    pub done_calls: Arc<AtomicUsize>,
}

impl EphemeronTable {
    pub fn new() -> Self {
        EphemeronTable {
            entries: RefCell::new(vec![]),
            iterations: Arc::new(AtomicUsize::new(0)),
            done_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn insert(&self, key: ObjectReference, value: ObjectReference) {
        self.entries.borrow_mut().push((key, value));
    }

    pub fn contains_key(&self, key: ObjectReference) -> bool {
        self.entries.borrow().iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    fn iterate(visitor: &mut Visitor<'_>, object: ObjectReference) {
        let table = table(object);
        table.iterations.fetch_add(1, Ordering::SeqCst);
        for (key, value) in table.entries.borrow().iter() {
            if visitor.is_alive(*key) {
                visitor.mark(*value);
            }
        }
    }

    fn iteration_done(_visitor: &mut Visitor<'_>, object: ObjectReference) {
        table(object).done_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_dead_entries(visitor: &mut Visitor<'_>, object: ObjectReference) {
        table(object)
            .entries
            .borrow_mut()
            .retain(|(key, _)| visitor.is_alive(*key));
    }
}

impl GarbageCollected for EphemeronTable {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        let this = object_of(self);
        visitor.register_weak_table(this, Self::iterate, Self::iteration_done);
        visitor.register_weak_callback(this, Self::clear_dead_entries);
    }
}

pub fn table<'a>(object: ObjectReference) -> &'a EphemeronTable {
    unsafe { object.as_ref() }
}

/// An object too big for a normal page.
pub struct LargeBlob {
    pub bytes: [u8; 80 * 1024],
    finalized: Arc<AtomicUsize>,
}

impl LargeBlob {
    pub fn new(finalized: &Arc<AtomicUsize>) -> Self {
        LargeBlob {
            bytes: [0; 80 * 1024],
            finalized: finalized.clone(),
        }
    }
}

impl Drop for LargeBlob {
    fn drop(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

impl GarbageCollected for LargeBlob {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}
