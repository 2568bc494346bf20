//! The per-thread side of a heap.
//!
//! Every OS thread that uses a heap attaches to it and gets a [`ThreadState`]. The thread
//! allocates through it, registers its roots with it and reports safepoints through it.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use atomic::Atomic;
use bytemuck::NoUninit;

use crate::heap::arena::ThreadArena;
use crate::heap::page::GcInfo;
use crate::heap::persistent::{Persistent, PersistentRegion};
use crate::heap::visitor::Visitor;
use crate::heap::{AllocationError, GarbageCollected, GcPhase, GcReason, HeapMode, ThreadHeap};
use crate::process_heap::ProcessHeap;
use crate::safepoint::SafePointAwareMutexLocker;
use crate::util::constants::ALLOCATION_GRANULARITY;
use crate::util::{Address, ObjectReference};

/// Rounds of [`ThreadState::collect_all_garbage`].
const MAX_FORCED_GC_ROUNDS: usize = 5;

/// Whether a thread's stack may hold heap pointers while it is at a safepoint.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum StackState {
    NoHeapPointersOnStack,
    HeapPointersOnStack,
}

pub struct ThreadState {
    thread_id: ThreadId,
    serial: usize,
    heap: Arc<ThreadHeap>,
    at_safe_point: AtomicBool,
    stack_state: Atomic<StackState>,
    no_allocation_count: AtomicUsize,
    detached: AtomicBool,
    persistents: Arc<Mutex<PersistentRegion>>,
    /// Words this thread declared as possible heap pointers. Scanned conservatively.
    shadow_stack: Mutex<Vec<Address>>,
    arena: Mutex<ThreadArena>,
}

impl ThreadState {
    fn new(heap: Arc<ThreadHeap>) -> ThreadState {
        let serial = heap.process().next_thread_serial();
        ThreadState {
            thread_id: thread::current().id(),
            serial,
            heap,
            at_safe_point: AtomicBool::new(false),
            stack_state: Atomic::new(StackState::NoHeapPointersOnStack),
            no_allocation_count: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            persistents: Arc::new(Mutex::new(PersistentRegion::new())),
            shadow_stack: Mutex::new(vec![]),
            arena: Mutex::new(ThreadArena::new(serial)),
        }
    }

    /// Create a heap that other threads may join, and attach the calling thread to it. The
    /// calling thread must be the last to detach.
    pub fn attach_main_thread(process: Arc<ProcessHeap>) -> Arc<ThreadState> {
        Self::attach_to(ThreadHeap::new(process, HeapMode::MainThread))
    }

    /// Create a heap private to the calling thread and attach to it.
    pub fn attach_per_thread_heap(process: Arc<ProcessHeap>) -> Arc<ThreadState> {
        Self::attach_to(ThreadHeap::new(process, HeapMode::PerThread))
    }

    /// Attach the calling thread to a heap created by [`ThreadState::attach_main_thread`].
    pub fn attach(heap: &Arc<ThreadHeap>) -> Arc<ThreadState> {
        assert!(
            heap.mode() == HeapMode::MainThread,
            "Threads cannot attach to the per-thread heap {}",
            heap.id()
        );
        Self::attach_to(heap.clone())
    }

    fn attach_to(heap: Arc<ThreadHeap>) -> Arc<ThreadState> {
        let state = Arc::new(ThreadState::new(heap));
        {
            let mut threads = SafePointAwareMutexLocker::new(&state, state.heap.threads());
            threads.push(state.clone());
        }
        debug!(
            "Thread #{} ({:?}) attached to heap {}",
            state.serial,
            state.thread_id,
            state.heap.id()
        );
        state
    }

    pub fn heap(&self) -> &Arc<ThreadHeap> {
        &self.heap
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// A process-wide unique number of this thread state.
    pub fn serial(&self) -> usize {
        self.serial
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn assert_current_thread(&self) {
        assert!(
            self.is_current_thread(),
            "Thread state #{} used from another thread",
            self.serial
        );
    }

    pub fn is_at_safe_point(&self) -> bool {
        self.at_safe_point.load(Ordering::SeqCst)
    }

    pub(crate) fn set_at_safe_point(&self, value: bool) {
        self.at_safe_point.store(value, Ordering::SeqCst);
    }

    pub fn stack_state(&self) -> StackState {
        self.stack_state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stack_state(&self, stack_state: StackState) {
        self.stack_state.store(stack_state, Ordering::SeqCst);
    }

    /// Park if another thread requested a pause.
    pub fn check_and_park(&self, stack_state: StackState) {
        self.assert_current_thread();
        self.heap.barrier().check_and_park(self, stack_state);
    }

    /// A safepoint poll: park if another thread requested a pause, otherwise run a
    /// collection if one has been requested.
    pub fn safe_point(&self, stack_state: StackState) {
        self.check_and_park(stack_state);
        if self.heap.is_gc_requested() && self.is_allocation_allowed() {
            let reason = match stack_state {
                StackState::NoHeapPointersOnStack => GcReason::PreciseGc,
                StackState::HeapPointersOnStack => GcReason::ConservativeGc,
            };
            self.heap.collect_garbage(self, stack_state, reason);
        }
    }

    pub fn enter_safe_point(&self, stack_state: StackState) {
        self.assert_current_thread();
        self.heap.barrier().enter_safe_point(self, stack_state);
    }

    pub fn leave_safe_point(&self) {
        self.assert_current_thread();
        self.heap.barrier().leave_safe_point(self);
    }

    pub(crate) fn try_leave_safe_point(&self) -> bool {
        self.heap.barrier().try_leave_safe_point(self)
    }

    pub fn is_allocation_allowed(&self) -> bool {
        self.no_allocation_count.load(Ordering::Relaxed) == 0
    }

    /// Forbid allocation on this thread until the scope is dropped.
    pub(crate) fn no_allocation_scope(&self) -> NoAllocationScope<'_> {
        self.no_allocation_count.fetch_add(1, Ordering::Relaxed);
        NoAllocationScope { state: self }
    }

    /// Move `value` to the managed heap.
    pub fn allocate<T: GarbageCollected>(&self, value: T) -> ObjectReference {
        match self.try_allocate(value) {
            Ok(object) => object,
            Err(e) => panic!("Allocation on heap {} failed: {}", self.heap.id(), e),
        }
    }

    pub fn try_allocate<T: GarbageCollected>(
        &self,
        value: T,
    ) -> Result<ObjectReference, AllocationError> {
        self.assert_current_thread();
        assert!(
            !self.is_detached(),
            "Allocation on thread #{} after it detached",
            self.serial
        );
        assert!(
            self.is_allocation_allowed(),
            "Allocation on thread #{} during a garbage collection",
            self.serial
        );
        assert!(
            !self.is_at_safe_point(),
            "Allocation on thread #{} at a safepoint",
            self.serial
        );
        assert!(
            mem::align_of::<T>() <= ALLOCATION_GRANULARITY,
            "Managed objects must not be aligned to more than {} bytes",
            ALLOCATION_GRANULARITY
        );

        let object = self
            .arena()
            .allocate(&self.heap, GcInfo::of::<T>(), mem::size_of::<T>())
            .map_err(|e| {
                error!("Thread #{} failed to map page memory: {}", self.serial, e);
                AllocationError::OutOfMemory(e)
            })?;
        unsafe { object.to_raw_address().store(value) };

        if self.heap.should_collect() {
            self.heap.request_gc();
        }
        Ok(object)
    }

    pub(crate) fn arena(&self) -> MutexGuard<'_, ThreadArena> {
        self.arena.lock().unwrap()
    }

    /// A root owned by this thread.
    pub fn persistent(&self, object: Option<ObjectReference>) -> Persistent {
        Persistent::new(&self.persistents, object)
    }

    /// The number of live persistents of this thread.
    pub fn persistent_count(&self) -> usize {
        self.persistents.lock().unwrap().len()
    }

    /// The number of persistents of this thread that hold an object.
    pub(crate) fn occupied_persistent_count(&self) -> usize {
        self.persistents.lock().unwrap().occupied()
    }

    pub(crate) fn terminate_persistents(&self) {
        self.persistents.lock().unwrap().terminate();
    }

    /// Declare `word` to be a possible heap pointer held by this thread. It is scanned
    /// conservatively while the thread is at a safepoint with heap pointers on its stack.
    pub fn push_stack_root(&self, word: Address) {
        self.shadow_stack.lock().unwrap().push(word);
    }

    pub fn pop_stack_root(&self) -> Option<Address> {
        self.shadow_stack.lock().unwrap().pop()
    }

    pub(crate) fn visit_persistents(&self, visitor: &mut Visitor<'_>) {
        self.persistents.lock().unwrap().trace(visitor);
    }

    pub(crate) fn visit_stack(&self, visitor: &mut Visitor<'_>) {
        if self.stack_state() == StackState::NoHeapPointersOnStack {
            return;
        }
        let shadow_stack = self.shadow_stack.lock().unwrap();
        for word in shadow_stack.iter() {
            if let Some(object) = visitor.check_and_mark_pointer(*word) {
                trace!(
                    "Thread #{}: {} on the stack keeps {} alive",
                    self.serial,
                    word,
                    object
                );
            }
        }
    }

    /// Run a global collection. Returns false if it did not happen because another
    /// thread was collecting.
    pub fn collect_garbage(&self, stack_state: StackState, reason: GcReason) -> bool {
        self.assert_current_thread();
        self.heap.collect_garbage(self, stack_state, reason)
    }

    /// Collect repeatedly until the live size stops changing, so that objects released by
    /// finalizers are collected too.
    pub fn collect_all_garbage(&self) {
        let mut previous = self.heap.stats().marked_object_size();
        for _ in 0..MAX_FORCED_GC_ROUNDS {
            if !self.collect_garbage(StackState::NoHeapPointersOnStack, GcReason::ForcedGc) {
                continue;
            }
            let marked = self.heap.stats().marked_object_size();
            if marked == previous {
                break;
            }
            previous = marked;
        }
    }

    /// Wait at a safepoint until no collection is in flight on the heap.
    fn wait_for_collection_to_finish(&self) {
        self.enter_safe_point(StackState::NoHeapPointersOnStack);
        self.heap.wait_until_idle();
        self.leave_safe_point();
    }

    /// Leave the heap. Objects only reachable from this thread are collected first. If
    /// other threads remain, pages still holding objects are orphaned. If this is the last
    /// thread, the heap is destroyed.
    pub fn detach(&self) {
        assert!(
            self.is_current_thread(),
            "Thread state #{} can only be detached by its own thread",
            self.serial
        );
        assert!(!self.is_detached(), "Thread #{} detached twice", self.serial);
        let heap = self.heap.clone();

        let mut threads = loop {
            let threads = SafePointAwareMutexLocker::new(self, heap.threads());
            if heap.try_begin_collection() {
                break threads;
            }
            drop(threads);
            self.wait_for_collection_to_finish();
        };

        let live = heap.collect_garbage_for_terminating_thread(self);
        threads.retain(|thread| !ptr::eq(Arc::as_ptr(thread), self));
        let last = threads.is_empty();
        let (normal_pages, large_pages) = self.arena().take_pages();
        if last {
            assert!(
                thread::current().id() == heap.owner(),
                "The last thread to detach from heap {} must be the thread that created it",
                heap.id()
            );
        } else {
            heap.orphan_pages(normal_pages, large_pages, live);
        }
        heap.set_phase(GcPhase::Idle);
        drop(threads);
        if last {
            heap.destroy();
        }

        self.detached.store(true, Ordering::SeqCst);
        debug!(
            "Thread #{} detached from heap {}{}",
            self.serial,
            heap.id(),
            if last { " and destroyed it" } else { "" }
        );
    }
}

/// Forbids allocation on a thread while it is alive.
pub(crate) struct NoAllocationScope<'a> {
    state: &'a ThreadState,
}

impl Drop for NoAllocationScope<'_> {
    fn drop(&mut self) {
        self.state
            .no_allocation_count
            .fetch_sub(1, Ordering::Relaxed);
    }
}
