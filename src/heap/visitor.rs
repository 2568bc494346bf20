//! The marking visitor.
//!
//! A [`Visitor`] is created by the collecting thread for the duration of a collection and
//! is the only way to reach the heap's callback stacks and compaction registrar. Trace
//! functions of managed types receive it and report their outgoing references with
//! [`Visitor::mark`].

use enum_map::EnumMap;

use crate::heap::callback_stack::{Callback, CallbackKind, CallbackStack, VisitorCallback};
use crate::heap::compaction::{HeapCompact, MovingObjectCallback};
use crate::heap::page::{ObjectHeader, PageHeader};
use crate::heap::{GcPhase, ThreadHeap};
use crate::util::{Address, ObjectReference};

/// Which objects a collection marks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkingMode {
    /// Every object of the heap.
    Global,
    /// Only objects on the pages of the thread with the given serial. Used when a thread
    /// detaches while other threads keep running.
    ThreadLocal(usize),
}

/// The state a heap keeps for marking: its four callback stacks and the compaction
/// registrar of the current collection.
pub struct MarkingState {
    queues: EnumMap<CallbackKind, CallbackStack>,
    compaction: Option<HeapCompact>,
}

impl MarkingState {
    pub fn new(block_size: usize) -> Self {
        MarkingState {
            queues: EnumMap::from_fn(|kind| CallbackStack::new(kind, block_size)),
            compaction: None,
        }
    }

    pub fn queue(&self, kind: CallbackKind) -> &CallbackStack {
        &self.queues[kind]
    }

    pub(crate) fn commit(&mut self) {
        for (_, queue) in self.queues.iter_mut() {
            queue.commit();
        }
    }

    pub(crate) fn decommit(&mut self) {
        for (_, queue) in self.queues.iter_mut() {
            queue.decommit();
        }
    }

    pub(crate) fn take_compaction(&mut self) -> Option<HeapCompact> {
        self.compaction.take()
    }
}

pub struct Visitor<'a> {
    heap: &'a ThreadHeap,
    marking: &'a mut MarkingState,
    mode: MarkingMode,
}

impl<'a> Visitor<'a> {
    pub(crate) fn new(
        heap: &'a ThreadHeap,
        marking: &'a mut MarkingState,
        mode: MarkingMode,
    ) -> Self {
        Visitor {
            heap,
            marking,
            mode,
        }
    }

    pub fn heap(&self) -> &ThreadHeap {
        self.heap
    }

    pub fn mode(&self) -> MarkingMode {
        self.mode
    }

    /// Is `object` marked by this collection at all? Objects of other heaps, and objects
    /// of other threads during a thread-local collection, are left alone.
    fn should_mark(&self, object: ObjectReference) -> bool {
        let page = unsafe { PageHeader::of_object(object) };
        if page.heap_id() != self.heap.id() {
            return false;
        }
        match self.mode {
            MarkingMode::Global => true,
            MarkingMode::ThreadLocal(serial) => page.owner() == serial,
        }
    }

    /// Mark a reachable object and queue it for tracing if it was not marked yet.
    pub fn mark(&mut self, object: ObjectReference) {
        if !self.should_mark(object) {
            return;
        }
        let header = unsafe { ObjectHeader::from_object(object) };
        debug_assert!(!header.is_free(), "Marking free block at {}", object);
        if !header.mark() {
            return;
        }
        if let Some(info) = header.info() {
            self.push_trace_callback(object, info.trace);
        }
    }

    /// Mark `object` if there is one.
    pub fn mark_option(&mut self, object: Option<ObjectReference>) {
        if let Some(object) = object {
            self.mark(object);
        }
    }

    /// Has `object` been found reachable? Objects this collection does not mark are
    /// reported as alive. Only meaningful once marking has reached its fixpoint.
    pub fn is_alive(&self, object: ObjectReference) -> bool {
        if !self.should_mark(object) {
            return true;
        }
        unsafe { ObjectHeader::from_object(object) }.is_marked()
    }

    fn assert_not_orphaned(&self, object: ObjectReference) {
        assert!(
            !self.heap.is_orphaned(object.to_raw_address()),
            "Callback pushed for {}, which is on an orphaned page",
            object
        );
    }

    pub fn push_trace_callback(&mut self, object: ObjectReference, callback: VisitorCallback) {
        self.assert_not_orphaned(object);
        self.marking.queues[CallbackKind::Marking].push(object, Callback::Trace(callback));
    }

    pub fn push_post_marking_callback(
        &mut self,
        object: ObjectReference,
        callback: VisitorCallback,
    ) {
        self.assert_not_orphaned(object);
        self.marking.queues[CallbackKind::PostMarking]
            .push(object, Callback::PostMarking(callback));
    }

    /// Run `callback` for `object` after marking, so it can clear references to objects
    /// that did not survive.
    pub fn register_weak_callback(&mut self, object: ObjectReference, callback: VisitorCallback) {
        self.assert_not_orphaned(object);
        self.marking.queues[CallbackKind::GlobalWeak].push(object, Callback::GlobalWeak(callback));
    }

    /// Register an ephemeron table. `iteration` is invoked repeatedly during marking and
    /// marks the values whose keys are alive. `done` runs once marking has finished.
    pub fn register_weak_table(
        &mut self,
        table: ObjectReference,
        iteration: VisitorCallback,
        done: VisitorCallback,
    ) {
        self.assert_not_orphaned(table);
        #[cfg(debug_assertions)]
        debug_assert!(
            !self.marking.queues[CallbackKind::Ephemeron].has_callback_for_object(table),
            "Weak table {} registered twice",
            table
        );
        self.marking.queues[CallbackKind::Ephemeron]
            .push(table, Callback::EphemeronIteration(iteration));
        self.push_post_marking_callback(table, done);
    }

    /// Treat `address` as a possible pointer into the heap. If it points into an allocated
    /// object, possibly into its interior, mark that object and return it.
    pub fn check_and_mark_pointer(&mut self, address: Address) -> Option<ObjectReference> {
        let phase = self.heap.phase();
        assert!(
            phase == GcPhase::Rooting || phase == GcPhase::Marking,
            "Pointer {} checked in phase {}",
            address,
            phase
        );
        let object = self.heap.lookup_object(address)?;
        self.mark(object);
        Some(object)
    }

    /// The compaction registrar of this collection, created on first use.
    pub fn compaction(&mut self) -> &mut HeapCompact {
        self.marking.compaction.get_or_insert_with(HeapCompact::new)
    }

    /// `slot` references a movable backing store.
    pub fn register_moving_object_reference(&mut self, slot: Address) {
        self.compaction().add(slot);
    }

    /// `slot` references a movable backing store, and `callback` must be told when it moves.
    pub fn register_moving_object_callback(
        &mut self,
        slot: Address,
        context: Address,
        callback: MovingObjectCallback,
    ) {
        self.compaction().add_callback(slot, context, callback);
    }

    /// `slot` is stored inside a movable backing store.
    pub fn register_relocation(&mut self, slot: Address) {
        self.compaction().add_interior_slot(slot);
    }

    /// Pop and invoke every entry of a callback stack, including entries pushed meanwhile.
    pub(crate) fn process_callbacks(&mut self, kind: CallbackKind) {
        while let Some(entry) = self.marking.queues[kind].pop() {
            entry.invoke(self);
        }
    }

    /// Trace until neither the marking stack nor the ephemeron callbacks produce more work.
    pub(crate) fn process_marking_to_fixpoint(&mut self) {
        let mut rounds = 0;
        loop {
            self.process_callbacks(CallbackKind::Marking);
            rounds += 1;

            // Ephemeron callbacks stay registered for the next round.
            let ephemerons = self.marking.queues[CallbackKind::Ephemeron].take();
            for entry in ephemerons.iter() {
                entry.invoke(self);
            }
            self.marking.queues[CallbackKind::Ephemeron].append(ephemerons);

            if self.marking.queues[CallbackKind::Marking].is_empty() {
                break;
            }
        }
        trace!("Marking reached its fixpoint after {} round(s)", rounds);
    }

    pub(crate) fn is_queue_empty(&self, kind: CallbackKind) -> bool {
        self.marking.queues[kind].is_empty()
    }
}
