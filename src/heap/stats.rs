use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::process_heap::ProcessHeap;

/// Size counters of one heap. Every change is mirrored into the process-wide totals.
pub struct ThreadHeapStats {
    process: Arc<ProcessHeap>,
    /// Bytes of page memory in use by arenas.
    allocated_space: AtomicUsize,
    /// Bytes allocated since the last collection.
    allocated_object_size: AtomicUsize,
    /// Bytes found live by the last collection.
    marked_object_size: AtomicUsize,
    /// `allocated_object_size + marked_object_size` when the last collection started.
    object_size_at_last_gc: AtomicUsize,
}

impl ThreadHeapStats {
    pub(crate) fn new(process: Arc<ProcessHeap>) -> Self {
        ThreadHeapStats {
            process,
            allocated_space: AtomicUsize::new(0),
            allocated_object_size: AtomicUsize::new(0),
            marked_object_size: AtomicUsize::new(0),
            object_size_at_last_gc: AtomicUsize::new(0),
        }
    }

    pub fn allocated_space(&self) -> usize {
        self.allocated_space.load(Ordering::Relaxed)
    }

    pub fn allocated_object_size(&self) -> usize {
        self.allocated_object_size.load(Ordering::Relaxed)
    }

    pub fn marked_object_size(&self) -> usize {
        self.marked_object_size.load(Ordering::Relaxed)
    }

    pub fn object_size_at_last_gc(&self) -> usize {
        self.object_size_at_last_gc.load(Ordering::Relaxed)
    }

    /// Bytes in allocated objects that have not been proven dead.
    pub fn estimated_live_object_size(&self) -> usize {
        self.allocated_object_size() + self.marked_object_size()
    }

    pub(crate) fn increase_allocated_space(&self, delta: usize) {
        self.allocated_space.fetch_add(delta, Ordering::Relaxed);
        self.process.increase_total_allocated_space(delta);
    }

    pub(crate) fn decrease_allocated_space(&self, delta: usize) {
        let old = self.allocated_space.fetch_sub(delta, Ordering::Relaxed);
        debug_assert!(old >= delta);
        self.process.decrease_total_allocated_space(delta);
    }

    pub(crate) fn increase_allocated_object_size(&self, delta: usize) {
        self.allocated_object_size
            .fetch_add(delta, Ordering::Relaxed);
        self.process.increase_total_allocated_object_size(delta);
    }

    pub(crate) fn increase_marked_object_size(&self, delta: usize) {
        self.marked_object_size.fetch_add(delta, Ordering::Relaxed);
        self.process.increase_total_marked_object_size(delta);
    }

    /// Forget `delta` bytes of objects that were freed outside a global collection. They
    /// are taken from the allocated counter first and from the marked counter for the
    /// rest.
    pub(crate) fn release_object_size(&self, delta: usize) {
        let allocated = self.allocated_object_size();
        let from_allocated = delta.min(allocated);
        let from_marked = delta - from_allocated;
        self.allocated_object_size
            .fetch_sub(from_allocated, Ordering::Relaxed);
        self.process
            .decrease_total_allocated_object_size(from_allocated);
        if from_marked > 0 {
            let old = self
                .marked_object_size
                .fetch_sub(from_marked, Ordering::Relaxed);
            debug_assert!(old >= from_marked);
            self.process.decrease_total_marked_object_size(from_marked);
        }
    }

    /// Called at the start of a global collection. The sweep adds every surviving object
    /// back to the marked counter.
    pub(crate) fn reset_heap_counters(&self) {
        let allocated = self.allocated_object_size.swap(0, Ordering::Relaxed);
        let marked = self.marked_object_size.swap(0, Ordering::Relaxed);
        self.object_size_at_last_gc
            .store(allocated + marked, Ordering::Relaxed);
        self.process.decrease_total_allocated_object_size(allocated);
        self.process.decrease_total_marked_object_size(marked);
    }

    /// Called when the heap is destroyed.
    pub(crate) fn release_all(&self) {
        let space = self.allocated_space.swap(0, Ordering::Relaxed);
        let allocated = self.allocated_object_size.swap(0, Ordering::Relaxed);
        let marked = self.marked_object_size.swap(0, Ordering::Relaxed);
        self.process.decrease_total_allocated_space(space);
        self.process.decrease_total_allocated_object_size(allocated);
        self.process.decrease_total_marked_object_size(marked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;

    #[test]
    fn counters_are_mirrored() {
        let process = ProcessHeap::init(Options::builtin());
        let stats = ThreadHeapStats::new(process.clone());
        stats.increase_allocated_space(4096);
        stats.increase_allocated_object_size(100);
        stats.increase_marked_object_size(50);
        assert_eq!(process.total_allocated_space(), 4096);
        assert_eq!(process.total_allocated_object_size(), 100);
        assert_eq!(process.total_marked_object_size(), 50);

        stats.reset_heap_counters();
        assert_eq!(stats.object_size_at_last_gc(), 150);
        assert_eq!(stats.estimated_live_object_size(), 0);
        assert_eq!(process.total_allocated_object_size(), 0);
        assert_eq!(process.total_marked_object_size(), 0);

        stats.release_all();
        assert_eq!(process.total_allocated_space(), 0);
    }

    #[test]
    fn release_object_size_prefers_allocated() {
        let process = ProcessHeap::init(Options::builtin());
        let stats = ThreadHeapStats::new(process.clone());
        stats.increase_allocated_object_size(30);
        stats.increase_marked_object_size(50);
        stats.release_object_size(40);
        assert_eq!(stats.allocated_object_size(), 0);
        assert_eq!(stats.marked_object_size(), 40);
        assert_eq!(process.total_allocated_object_size(), 0);
        assert_eq!(process.total_marked_object_size(), 40);
    }
}
