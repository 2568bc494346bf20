//! The heap shared by the threads attached to it, and its collector.
//!
//! A collection moves the heap through the phases of [`GcPhase`]. The collecting thread
//! parks every other attached thread, marks from the roots of all threads until the
//! marking stack and the ephemeron callbacks stop producing work, runs the post-marking
//! and weak callbacks, sweeps every arena and resumes the other threads.

pub mod arena;
pub mod callback_stack;
pub mod compaction;
pub mod containment_cache;
pub mod page;
pub mod page_pool;
pub mod persistent;
pub mod region_tree;
pub mod stats;
pub mod visitor;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use atomic::Atomic;
use atomic_refcell::AtomicRefCell;
use bytemuck::NoUninit;

use crate::heap::callback_stack::CallbackKind;
use crate::heap::compaction::HeapCompact;
use crate::heap::containment_cache::HeapDoesNotContainCache;
use crate::heap::page::{PageHeader, PageKind, PageMemoryRegion, PAGE_HEADER_SIZE};
use crate::heap::page_pool::{FreePagePool, OrphanedPagePool};
use crate::heap::region_tree::RegionTree;
use crate::heap::stats::ThreadHeapStats;
use crate::heap::visitor::{MarkingMode, MarkingState, Visitor};
use crate::process_heap::ProcessHeap;
use crate::safepoint::SafePointBarrier;
use crate::thread_state::{StackState, ThreadState};
use crate::util::constants::BLINK_PAGE_SIZE;
use crate::util::conversions::{blink_pages_align_up, bytes_to_formatted_string};
use crate::util::{memory, Address, ObjectReference};

/// A type that can be allocated on the managed heap.
///
/// `trace` must call [`Visitor::mark`] for every strong reference the object holds. Objects
/// are dropped by the collector, possibly on another thread, hence the `Send` bound.
pub trait GarbageCollected: Send + 'static {
    fn trace(&self, visitor: &mut Visitor<'_>);
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum GcPhase {
    Idle,
    Parking,
    Rooting,
    Marking,
    PostMarking,
    GlobalWeak,
    Sweeping,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum GcReason {
    /// Requested at a safepoint where the stack may hold heap pointers.
    ConservativeGc,
    /// Requested at a safepoint where the stack holds no heap pointers.
    PreciseGc,
    /// Requested explicitly by the embedder.
    ForcedGc,
    /// Run for a thread that is detaching.
    ThreadTerminationGc,
}

/// Who may attach to a heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapMode {
    /// Shared by any number of threads. The creating thread must detach last.
    MainThread,
    /// Private to the thread that created it.
    PerThread,
}

#[derive(Debug)]
pub enum AllocationError {
    /// Page memory could not be mapped.
    OutOfMemory(io::Error),
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocationError::OutOfMemory(e) => write!(f, "out of memory: {}", e),
        }
    }
}

impl std::error::Error for AllocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocationError::OutOfMemory(e) => Some(e),
        }
    }
}

/// Page memory owned by a heap.
struct PageState {
    regions: RegionTree,
    cache: HeapDoesNotContainCache,
    free_pages: FreePagePool,
    orphaned_pages: OrphanedPagePool,
}

impl PageState {
    fn add_region(&mut self, region: PageMemoryRegion) {
        // The cache may hold pages of the new region.
        self.cache.flush();
        self.regions.add(region);
    }
}

pub struct ThreadHeap {
    id: usize,
    mode: HeapMode,
    owner: ThreadId,
    process: Arc<ProcessHeap>,
    threads: Mutex<Vec<Arc<ThreadState>>>,
    barrier: SafePointBarrier,
    phase: Atomic<GcPhase>,
    /// Held while the phase returns to `Idle`.
    idle_lock: Mutex<()>,
    cv_idle: Condvar,
    marking: AtomicRefCell<MarkingState>,
    pages: Mutex<PageState>,
    orphaned_page_count: AtomicUsize,
    stats: ThreadHeapStats,
    gc_requested: AtomicBool,
    last_compaction: Mutex<Option<HeapCompact>>,
}

impl ThreadHeap {
    /// Create a heap owned by the calling thread. Threads join it through
    /// [`ThreadState`].
    pub(crate) fn new(process: Arc<ProcessHeap>, mode: HeapMode) -> Arc<ThreadHeap> {
        let options = process.options().clone();
        let id = process.heap_created();
        debug!("Created heap {} ({:?})", id, mode);
        Arc::new(ThreadHeap {
            id,
            mode,
            owner: thread::current().id(),
            barrier: SafePointBarrier::new(),
            threads: Mutex::new(vec![]),
            phase: Atomic::new(GcPhase::Idle),
            idle_lock: Mutex::new(()),
            cv_idle: Condvar::new(),
            marking: AtomicRefCell::new(MarkingState::new(options.callback_stack_block_size)),
            pages: Mutex::new(PageState {
                regions: RegionTree::default(),
                cache: HeapDoesNotContainCache::new(options.containment_cache_log_entries),
                free_pages: FreePagePool::default(),
                orphaned_pages: OrphanedPagePool::default(),
            }),
            orphaned_page_count: AtomicUsize::new(0),
            stats: ThreadHeapStats::new(process.clone()),
            gc_requested: AtomicBool::new(false),
            last_compaction: Mutex::new(None),
            process,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mode(&self) -> HeapMode {
        self.mode
    }

    /// The thread that created this heap.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn process(&self) -> &Arc<ProcessHeap> {
        &self.process
    }

    pub fn stats(&self) -> &ThreadHeapStats {
        &self.stats
    }

    pub fn phase(&self) -> GcPhase {
        self.phase.load(Ordering::SeqCst)
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        trace!("Heap {}: phase {}", self.id, phase);
        if phase == GcPhase::Idle {
            let _guard = self.idle_lock.lock().unwrap();
            self.phase.store(phase, Ordering::SeqCst);
            self.cv_idle.notify_all();
        } else {
            self.phase.store(phase, Ordering::SeqCst);
        }
    }

    /// Block until no collection is in flight.
    pub(crate) fn wait_until_idle(&self) {
        let mut guard = self.idle_lock.lock().unwrap();
        while self.phase() != GcPhase::Idle {
            guard = self.cv_idle.wait(guard).unwrap();
        }
    }

    pub(crate) fn barrier(&self) -> &SafePointBarrier {
        &self.barrier
    }

    pub(crate) fn threads(&self) -> &Mutex<Vec<Arc<ThreadState>>> {
        &self.threads
    }

    /// The number of attached threads.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Move the phase out of `Idle`. Fails if another collection is in flight.
    pub(crate) fn try_begin_collection(&self) -> bool {
        self.phase
            .compare_exchange(
                GcPhase::Idle,
                GcPhase::Parking,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Bring every other attached thread to a safepoint. `state` must be at a safepoint.
    /// Returns false if another thread owns a pause.
    pub fn park_others(&self, state: &ThreadState) -> bool {
        let threads = self.threads.lock().unwrap();
        self.barrier.park_others(state, &threads)
    }

    /// Release the threads parked by a successful [`ThreadHeap::park_others`].
    pub fn resume_others(&self, state: &ThreadState) {
        self.barrier.resume_others(state);
    }

    pub fn is_gc_requested(&self) -> bool {
        self.gc_requested.load(Ordering::Relaxed)
    }

    pub(crate) fn request_gc(&self) {
        if !self.gc_requested.swap(true, Ordering::Relaxed) {
            debug!(
                "Heap {}: GC requested, {} allocated since the last GC",
                self.id,
                bytes_to_formatted_string(self.stats.allocated_object_size())
            );
        }
    }

    /// Has the heap grown enough since the last collection to collect again?
    pub(crate) fn should_collect(&self) -> bool {
        let options = self.process.options();
        if self.stats.allocated_object_size() < options.gc_threshold {
            return false;
        }
        let live = self.stats.estimated_live_object_size() as f64;
        let at_last_gc = self.stats.object_size_at_last_gc() as f64;
        live > at_last_gc * options.heap_growing_rate
    }

    /// The compaction registrar filled in by the last collection, if any slot was
    /// registered during it.
    pub fn take_compaction(&self) -> Option<HeapCompact> {
        self.last_compaction.lock().unwrap().take()
    }

    /// Run a global collection from `state`. Returns false, without collecting, if another
    /// collection was in flight.
    pub fn collect_garbage(
        &self,
        state: &ThreadState,
        stack_state: StackState,
        reason: GcReason,
    ) -> bool {
        self.barrier.enter_safe_point(state, stack_state);
        if !self.try_begin_collection() {
            debug!("Heap {}: {} lost the race to collect", self.id, reason);
            self.barrier.leave_safe_point(state);
            return false;
        }

        let threads = self.threads.lock().unwrap();
        if !self.barrier.park_others(state, &threads) {
            debug!("Heap {}: {} lost the race to park the others", self.id, reason);
            self.set_phase(GcPhase::Idle);
            drop(threads);
            self.barrier.leave_safe_point(state);
            return false;
        }
        #[cfg(debug_assertions)]
        for thread in threads.iter() {
            debug_assert!(
                thread.is_at_safe_point(),
                "Thread #{} is not at a safepoint after parking",
                thread.serial()
            );
        }

        let participants: Vec<&ThreadState> = threads.iter().map(|t| &**t).collect();
        self.run_phases(state, &participants, MarkingMode::Global, reason);

        self.gc_requested.store(false, Ordering::Relaxed);
        self.set_phase(GcPhase::Idle);
        self.barrier.resume_others(state);
        drop(threads);
        self.barrier.leave_safe_point(state);
        true
    }

    /// Collect the objects of a detaching thread. The caller holds the thread list and has
    /// moved the phase out of `Idle`. Returns the bytes that survived on the thread's
    /// pages.
    pub(crate) fn collect_garbage_for_terminating_thread(&self, state: &ThreadState) -> usize {
        let serial = state.serial();
        let heap_id = self.id;
        let released = self
            .process
            .cross_thread_persistents()
            .lock()
            .unwrap()
            .release_where(|object| {
                let page = unsafe { PageHeader::of_object(object) };
                page.heap_id() == heap_id && page.owner() == serial
            });
        if released > 0 {
            debug!(
                "Thread #{}: cleared {} cross-thread persistent(s) into its pages",
                serial, released
            );
        }

        let collector = [state];
        let iterations = self.process.options().termination_gc_iterations;
        let mut count = state.occupied_persistent_count();
        let mut live = 0;
        for _ in 0..iterations {
            live = self.run_phases(
                state,
                &collector,
                MarkingMode::ThreadLocal(serial),
                GcReason::ThreadTerminationGc,
            );
            // Finalizers may have released more persistents.
            let new_count = state.occupied_persistent_count();
            if new_count == count {
                break;
            }
            count = new_count;
        }

        if count > 0 {
            warn!(
                "Thread #{} detached with {} live persistent(s). Their objects are left on orphaned pages.",
                serial, count
            );
        }
        state.terminate_persistents();
        live
    }

    /// Drive one collection from rooting to the end of sweeping. Returns the bytes that
    /// survived in the swept arenas.
    fn run_phases(
        &self,
        collector: &ThreadState,
        participants: &[&ThreadState],
        mode: MarkingMode,
        reason: GcReason,
    ) -> usize {
        let _no_allocation = collector.no_allocation_scope();
        info!(
            "Heap {}: GC start ({}, {:?}), {} live before",
            self.id,
            reason,
            mode,
            bytes_to_formatted_string(self.stats.estimated_live_object_size())
        );

        self.set_phase(GcPhase::Rooting);
        self.pages.lock().unwrap().cache.flush();
        for thread in participants {
            thread.arena().make_consistent_for_gc();
        }
        if mode == MarkingMode::Global {
            self.stats.reset_heap_counters();
        }

        let mut marking = self.marking.borrow_mut();
        marking.commit();
        {
            let mut visitor = Visitor::new(self, &mut marking, mode);
            match mode {
                MarkingMode::Global => {
                    for thread in participants {
                        thread.visit_persistents(&mut visitor);
                        thread.visit_stack(&mut visitor);
                    }
                    self.process
                        .cross_thread_persistents()
                        .lock()
                        .unwrap()
                        .trace(&mut visitor);
                }
                MarkingMode::ThreadLocal(_) => collector.visit_persistents(&mut visitor),
            }

            self.set_phase(GcPhase::Marking);
            visitor.process_marking_to_fixpoint();

            self.set_phase(GcPhase::PostMarking);
            visitor.process_callbacks(CallbackKind::PostMarking);
            assert!(
                visitor.is_queue_empty(CallbackKind::Marking),
                "Marking work was pushed by a post-marking callback"
            );

            self.set_phase(GcPhase::GlobalWeak);
            visitor.process_callbacks(CallbackKind::GlobalWeak);
            assert!(
                visitor.is_queue_empty(CallbackKind::Marking),
                "Marking work was pushed by a global weak callback"
            );
        }

        self.set_phase(GcPhase::Sweeping);
        marking.decommit();
        let compaction = marking.take_compaction();
        drop(marking);
        if let Some(compaction) = compaction {
            debug!(
                "Heap {}: {} movable backing store(s) registered",
                self.id,
                compaction.fixup_count()
            );
            *self.last_compaction.lock().unwrap() = Some(compaction);
        }

        let mut live = 0;
        let mut freed = 0;
        for thread in participants {
            let result = thread.arena().sweep(self);
            live += result.live;
            freed += result.freed;
        }
        match mode {
            MarkingMode::Global => {
                self.stats.increase_marked_object_size(live);
                self.release_orphaned_pages();
            }
            MarkingMode::ThreadLocal(_) => self.stats.release_object_size(freed),
        }

        info!(
            "Heap {}: GC end ({}), {} live, {} freed",
            self.id,
            reason,
            bytes_to_formatted_string(live),
            bytes_to_formatted_string(freed)
        );
        live
    }

    /// Find the allocated object containing `address`, consulting the containment cache
    /// first. Addresses outside every region are added to the cache.
    pub(crate) fn lookup_object(&self, address: Address) -> Option<ObjectReference> {
        let mut guard = self.pages.lock().unwrap();
        let pages = &mut *guard;
        if pages.cache.lookup(address) {
            debug_assert!(
                pages.regions.lookup(address).is_none(),
                "Cached address {} is in the heap",
                address
            );
            return None;
        }
        let region = match pages.regions.lookup(address) {
            Some(region) => region,
            None => {
                pages.cache.add_entry(address);
                return None;
            }
        };
        let page = unsafe { PageHeader::at(region.page_for(address)) };
        if page.kind() == PageKind::Free || page.is_orphaned() {
            return None;
        }
        page.find_object(address)
    }

    /// Is `address` on a page of a detached thread?
    pub(crate) fn is_orphaned(&self, address: Address) -> bool {
        if self.orphaned_page_count.load(Ordering::Relaxed) == 0 {
            return false;
        }
        self.pages.lock().unwrap().orphaned_pages.contains(address)
    }

    #[cfg(test)]
    pub(crate) fn containment_cache_is_empty(&self) -> bool {
        self.pages.lock().unwrap().cache.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn free_page_count(&self) -> usize {
        self.pages.lock().unwrap().free_pages.len()
    }

    #[cfg(test)]
    pub(crate) fn orphaned_page_count(&self) -> usize {
        self.orphaned_page_count.load(Ordering::Relaxed)
    }

    /// Hand a normal page to the arena of the thread with `serial`, mapping a new region if
    /// no free page is left.
    pub(crate) fn take_normal_page(&self, serial: usize) -> io::Result<Address> {
        let mut pages = self.pages.lock().unwrap();
        let page = match pages.free_pages.take() {
            Some(page) => page,
            None => {
                let region = PageMemoryRegion::allocate_normal()?;
                let first = region.base();
                for page in region.pages().skip(1) {
                    pages.free_pages.add(page);
                }
                pages.add_region(region);
                first
            }
        };
        drop(pages);
        unsafe {
            PageHeader::init(
                page,
                PageKind::Normal,
                self.id,
                serial,
                page + BLINK_PAGE_SIZE,
            )
        };
        self.stats.increase_allocated_space(BLINK_PAGE_SIZE);
        Ok(page)
    }

    /// Map a large page for a block of `block_size` bytes.
    pub(crate) fn allocate_large_page(
        &self,
        serial: usize,
        block_size: usize,
    ) -> io::Result<Address> {
        let size = blink_pages_align_up(PAGE_HEADER_SIZE + block_size);
        let region = PageMemoryRegion::allocate_large(size)?;
        let page = region.base();
        unsafe {
            PageHeader::init(
                page,
                PageKind::Large,
                self.id,
                serial,
                page + PAGE_HEADER_SIZE + block_size,
            )
        };
        self.pages.lock().unwrap().add_region(region);
        self.stats.increase_allocated_space(size);
        Ok(page)
    }

    /// Decommit a normal page and put it in the free page pool.
    pub(crate) fn release_normal_page(&self, page: Address) {
        if let Err(e) = memory::decommit(page, BLINK_PAGE_SIZE) {
            warn!("Failed to decommit page {}: {}", page, e);
            memory::zero(page, BLINK_PAGE_SIZE);
        }
        self.pages.lock().unwrap().free_pages.add(page);
        self.stats.decrease_allocated_space(BLINK_PAGE_SIZE);
    }

    /// Unmap a large page.
    pub(crate) fn release_large_page(&self, page: Address) {
        let region = self.pages.lock().unwrap().regions.remove(page);
        match region {
            Some(region) => self.stats.decrease_allocated_space(region.size()),
            None => debug_assert!(false, "Large page {} is not in the region tree", page),
        }
    }

    /// Keep the pages of a detached thread until the next global collection. `live` is the
    /// size of the objects left on them.
    pub(crate) fn orphan_pages(&self, normal: Vec<Address>, large: Vec<Address>, live: usize) {
        let mut pages = self.pages.lock().unwrap();
        for page in normal.into_iter().chain(large) {
            unsafe { pages.orphaned_pages.add(page) };
        }
        self.orphaned_page_count
            .store(pages.orphaned_pages.len(), Ordering::Relaxed);
        drop(pages);
        self.stats.release_object_size(live);
    }

    fn release_orphaned_pages(&self) {
        let orphaned = {
            let mut pages = self.pages.lock().unwrap();
            self.orphaned_page_count.store(0, Ordering::Relaxed);
            pages.orphaned_pages.take_all()
        };
        if orphaned.is_empty() {
            return;
        }
        debug!("Heap {}: releasing {} orphaned page(s)", self.id, orphaned.len());
        for page in orphaned {
            match unsafe { PageHeader::at(page) }.kind() {
                PageKind::Large => self.release_large_page(page),
                _ => self.release_normal_page(page),
            }
        }
    }

    /// Release all page memory. Called when the last thread detaches.
    pub(crate) fn destroy(&self) {
        let heap_id = self.id;
        self.process
            .cross_thread_persistents()
            .lock()
            .unwrap()
            .release_where(|object| {
                unsafe { PageHeader::of_object(object) }.heap_id() == heap_id
            });

        let regions = {
            let mut pages = self.pages.lock().unwrap();
            pages.cache.flush();
            pages.free_pages.clear();
            pages.orphaned_pages.clear();
            self.orphaned_page_count.store(0, Ordering::Relaxed);
            std::mem::take(&mut pages.regions)
        };
        let region_count = regions.len();
        drop(regions);

        self.stats.release_all();
        self.process.heap_destroyed();
        info!("Heap {} destroyed, {} region(s) unmapped", self.id, region_count);
    }
}
