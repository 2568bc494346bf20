use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use super::heap_test_prelude::*;
use crate::{GarbageCollected, Persistent};

/// Keeps another object alive through a persistent until it is finalized.
struct Holder {
    _root: Persistent,
    finalized: Arc<AtomicUsize>,
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}

impl GarbageCollected for Holder {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}

#[test]
pub fn detach_finalizes_unreachable_objects() {
    with_heap(|fixture| {
        let heap = fixture.heap().clone();
        let finalized = Arc::new(AtomicUsize::new(0));
        {
            let finalized = finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                let a = state.allocate(Node::new(&finalized));
                let b = state.allocate(Node::new(&finalized));
                node(a).add_child(b);
                let root = state.persistent(Some(a));
                assert_eq!(state.persistent_count(), 1);
                drop(root);
                assert_eq!(state.persistent_count(), 0);
                state.detach();
                assert!(state.is_detached());
            })
            .join()
            .unwrap();
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.heap().thread_count(), 1);
        // The worker's page was emptied by its last collection.
        assert_eq!(fixture.heap().orphaned_page_count(), 0);
    })
}

#[test]
pub fn termination_collection_leaves_other_threads_alone() {
    with_heap(|fixture| {
        let state = &fixture.state;
        let heap = fixture.heap().clone();
        let main_finalized = Arc::new(AtomicUsize::new(0));
        // Garbage of the main thread, to be collected by a global collection only.
        state.allocate(Node::new(&main_finalized));

        let worker_finalized = Arc::new(AtomicUsize::new(0));
        {
            let worker_finalized = worker_finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                state.allocate(Node::new(&worker_finalized));
                state.detach();
            })
            .join()
            .unwrap();
        }
        assert_eq!(worker_finalized.load(Ordering::SeqCst), 1);
        assert_eq!(main_finalized.load(Ordering::SeqCst), 0);

        assert!(fixture.collect());
        assert_eq!(main_finalized.load(Ordering::SeqCst), 1);
    })
}

#[test]
pub fn live_persistents_orphan_pages_until_next_collection() {
    with_heap(|fixture| {
        let heap = fixture.heap().clone();
        let finalized = Arc::new(AtomicUsize::new(0));
        {
            let finalized = finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                let object = state.allocate(Node::new(&finalized));
                let root = state.persistent(Some(object));
                state.detach();
                // The region was terminated by the detach.
                assert_eq!(root.get(), None);
            })
            .join()
            .unwrap();
        }
        assert_eq!(fixture.heap().orphaned_page_count(), 1);
        let free_before = fixture.heap().free_page_count();

        assert!(fixture.collect());
        assert_eq!(fixture.heap().orphaned_page_count(), 0);
        assert_eq!(fixture.heap().free_page_count(), free_before + 1);
        // Orphaned pages are released without running finalizers.
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
    })
}

#[test]
pub fn termination_collection_repeats_for_released_persistents() {
    with_heap(|fixture| {
        let heap = fixture.heap().clone();
        let holder_finalized = Arc::new(AtomicUsize::new(0));
        let held_finalized = Arc::new(AtomicUsize::new(0));
        {
            let holder_finalized = holder_finalized.clone();
            let held_finalized = held_finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                let held = state.allocate(Node::new(&held_finalized));
                state.allocate(Holder {
                    _root: state.persistent(Some(held)),
                    finalized: holder_finalized,
                });
                state.detach();
            })
            .join()
            .unwrap();
        }
        assert_eq!(holder_finalized.load(Ordering::SeqCst), 1);
        assert_eq!(held_finalized.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.heap().orphaned_page_count(), 0);
    })
}

#[test]
pub fn termination_collection_is_capped() {
    let mut options = Options::builtin();
    options.termination_gc_iterations = 1;
    let fixture = HeapFixture::with_options(options);
    let heap = fixture.heap().clone();
    let holder_finalized = Arc::new(AtomicUsize::new(0));
    let held_finalized = Arc::new(AtomicUsize::new(0));
    {
        let holder_finalized = holder_finalized.clone();
        let held_finalized = held_finalized.clone();
        thread::spawn(move || {
            let state = ThreadState::attach(&heap);
            let held = state.allocate(Node::new(&held_finalized));
            state.allocate(Holder {
                _root: state.persistent(Some(held)),
                finalized: holder_finalized,
            });
            state.detach();
        })
        .join()
        .unwrap();
    }
    // One round only: the held node outlives the holder and its page is orphaned.
    assert_eq!(holder_finalized.load(Ordering::SeqCst), 1);
    assert_eq!(held_finalized.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.heap().orphaned_page_count(), 1);

    assert!(fixture.collect());
    assert_eq!(fixture.heap().orphaned_page_count(), 0);
    assert_eq!(held_finalized.load(Ordering::SeqCst), 0);
    fixture.teardown();
}

#[test]
pub fn cleared_persistents_are_not_live() {
    with_heap(|fixture| {
        let heap = fixture.heap().clone();
        let finalized = Arc::new(AtomicUsize::new(0));
        {
            let finalized = finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                let object = state.allocate(Node::new(&finalized));
                let root = state.persistent(Some(object));
                root.clear();
                assert_eq!(state.persistent_count(), 1);
                assert_eq!(state.occupied_persistent_count(), 0);
                state.detach();
            })
            .join()
            .unwrap();
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.heap().orphaned_page_count(), 0);
    })
}

#[test]
pub fn detach_waits_for_collection_in_flight() {
    panic_after(5000, || {
        let fixture = HeapFixture::create();
        let heap = fixture.heap().clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let worker = {
            let heap = heap.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                ready_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                state.detach();
            })
        };

        ready_rx.recv().unwrap();
        assert!(heap.try_begin_collection());
        go_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(heap.thread_count(), 2);

        heap.set_phase(GcPhase::Idle);
        worker.join().unwrap();
        assert_eq!(heap.thread_count(), 1);
        fixture.teardown();
    })
}

#[test]
pub fn cross_thread_persistents_are_cleared_at_detach() {
    with_heap(|fixture| {
        let heap = fixture.heap().clone();
        let process = fixture.process.clone();
        let finalized = Arc::new(AtomicUsize::new(0));
        let handle = {
            let finalized = finalized.clone();
            thread::spawn(move || {
                let state = ThreadState::attach(&heap);
                let object = state.allocate(Node::new(&finalized));
                let handle = process.cross_thread_persistent(Some(object));
                state.detach();
                handle
            })
            .join()
            .unwrap()
        };
        assert_eq!(handle.get(), None);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    })
}

#[test]
#[should_panic(expected = "must be the thread that created it")]
pub fn last_detach_by_other_thread() {
    let process = ProcessHeap::init(Options::builtin());
    let (heap_tx, heap_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let creator = {
        let process = process.clone();
        thread::spawn(move || {
            let state = ThreadState::attach_main_thread(process);
            heap_tx.send(state.heap().clone()).unwrap();
            go_rx.recv().unwrap();
            state.detach();
        })
    };

    let heap = heap_rx.recv().unwrap();
    let state = ThreadState::attach(&heap);
    go_tx.send(()).unwrap();
    creator.join().unwrap();
    state.detach();
}

#[test]
#[should_panic(expected = "after it detached")]
pub fn allocate_after_detach() {
    let process = ProcessHeap::init(Options::builtin());
    let state = ThreadState::attach_per_thread_heap(process);
    state.detach();
    let finalized = Arc::new(AtomicUsize::new(0));
    state.allocate(Node::new(&finalized));
}

#[test]
#[should_panic(expected = "Threads cannot attach to the per-thread heap")]
pub fn attach_to_per_thread_heap() {
    let process = ProcessHeap::init(Options::builtin());
    let state = ThreadState::attach_per_thread_heap(process);
    let heap = state.heap().clone();
    ThreadState::attach(&heap);
}

#[test]
#[should_panic(expected = "still exist")]
pub fn shutdown_before_detach() {
    let process = ProcessHeap::init(Options::builtin());
    let _state = ThreadState::attach_per_thread_heap(process.clone());
    process.shutdown();
}
