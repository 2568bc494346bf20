//! The process-wide registry shared by every heap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::utils::CachePadded;

use crate::heap::persistent::{Persistent, PersistentRegion};
use crate::util::conversions::bytes_to_formatted_string;
use crate::util::options::Options;
use crate::util::ObjectReference;

/// Process-wide state: options, aggregate counters over all heaps and the cross-thread
/// persistent roots.
///
/// A process heap is created with [`ProcessHeap::init`] and shared by reference counting
/// with every heap and thread state created from it. It must outlive all of them, which
/// [`ProcessHeap::shutdown`] checks.
pub struct ProcessHeap {
    options: Options,
    total_allocated_space: CachePadded<AtomicUsize>,
    total_allocated_object_size: CachePadded<AtomicUsize>,
    total_marked_object_size: CachePadded<AtomicUsize>,
    heap_count: AtomicUsize,
    next_heap_id: AtomicUsize,
    next_thread_serial: AtomicUsize,
    cross_thread_persistents: Arc<Mutex<PersistentRegion>>,
}

impl ProcessHeap {
    pub fn init(options: Options) -> Arc<ProcessHeap> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("Process heap initialized the logger."),
            Err(_) => debug!(
                "Process heap failed to initialize the logger. Possibly a logger has been initialized by user."
            ),
        }
        debug!("Initializing process heap with {:?}", options);
        Arc::new(ProcessHeap {
            options,
            total_allocated_space: CachePadded::new(AtomicUsize::new(0)),
            total_allocated_object_size: CachePadded::new(AtomicUsize::new(0)),
            total_marked_object_size: CachePadded::new(AtomicUsize::new(0)),
            heap_count: AtomicUsize::new(0),
            next_heap_id: AtomicUsize::new(1),
            next_thread_serial: AtomicUsize::new(1),
            cross_thread_persistents: Arc::new(Mutex::new(PersistentRegion::new())),
        })
    }

    /// Tear down the process heap. Every heap created from it must have been destroyed.
    pub fn shutdown(self: Arc<Self>) {
        let heaps = self.heap_count.load(Ordering::SeqCst);
        assert!(
            heaps == 0,
            "Process heap shut down while {} heap(s) still exist",
            heaps
        );
        info!(
            "Process heap shut down. Total allocated space: {}",
            bytes_to_formatted_string(self.total_allocated_space())
        );
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The number of heaps that have been created and not yet destroyed.
    pub fn heap_count(&self) -> usize {
        self.heap_count.load(Ordering::SeqCst)
    }

    pub fn total_allocated_space(&self) -> usize {
        self.total_allocated_space.load(Ordering::Relaxed)
    }

    pub fn total_allocated_object_size(&self) -> usize {
        self.total_allocated_object_size.load(Ordering::Relaxed)
    }

    pub fn total_marked_object_size(&self) -> usize {
        self.total_marked_object_size.load(Ordering::Relaxed)
    }

    pub(crate) fn increase_total_allocated_space(&self, delta: usize) {
        self.total_allocated_space
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn decrease_total_allocated_space(&self, delta: usize) {
        self.total_allocated_space
            .fetch_sub(delta, Ordering::Relaxed);
    }

    pub(crate) fn increase_total_allocated_object_size(&self, delta: usize) {
        self.total_allocated_object_size
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn decrease_total_allocated_object_size(&self, delta: usize) {
        self.total_allocated_object_size
            .fetch_sub(delta, Ordering::Relaxed);
    }

    pub(crate) fn increase_total_marked_object_size(&self, delta: usize) {
        self.total_marked_object_size
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn decrease_total_marked_object_size(&self, delta: usize) {
        self.total_marked_object_size
            .fetch_sub(delta, Ordering::Relaxed);
    }

    /// Returns a fresh heap id and counts the heap as live.
    pub(crate) fn heap_created(&self) -> usize {
        self.heap_count.fetch_add(1, Ordering::SeqCst);
        self.next_heap_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn heap_destroyed(&self) {
        let old = self.heap_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0);
    }

    pub(crate) fn next_thread_serial(&self) -> usize {
        self.next_thread_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// A root that may be created, read and dropped on any thread.
    pub fn cross_thread_persistent(&self, object: Option<ObjectReference>) -> Persistent {
        Persistent::new(&self.cross_thread_persistents, object)
    }

    pub(crate) fn cross_thread_persistents(&self) -> &Arc<Mutex<PersistentRegion>> {
        &self.cross_thread_persistents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_ids_are_unique() {
        let process = ProcessHeap::init(Options::builtin());
        let a = process.heap_created();
        let b = process.heap_created();
        assert_ne!(a, b);
        assert_eq!(process.heap_count(), 2);
        process.heap_destroyed();
        process.heap_destroyed();
        process.shutdown();
    }

    #[test]
    #[should_panic(expected = "still exist")]
    fn shutdown_with_live_heap() {
        let process = ProcessHeap::init(Options::builtin());
        process.heap_created();
        process.shutdown();
    }

    #[test]
    fn cross_thread_persistent_is_shared() {
        let process = ProcessHeap::init(Options::builtin());
        let handle = process.cross_thread_persistent(None);
        assert_eq!(process.cross_thread_persistents().lock().unwrap().len(), 1);
        let other = process.clone();
        std::thread::spawn(move || drop(handle)).join().unwrap();
        assert!(other.cross_thread_persistents().lock().unwrap().is_empty());
    }
}
