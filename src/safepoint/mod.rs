//! Cooperative stop-the-world coordination.
//!
//! Threads are never suspended by force. A thread that wants to collect sets the parking
//! flag of the heap's [`SafePointBarrier`] and waits until every other attached thread has
//! reported that it is at a safepoint, either by polling [`SafePointBarrier::check_and_park`]
//! or because it already entered one for a blocking operation.

pub mod locker;

pub use self::locker::SafePointAwareMutexLocker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crate::thread_state::{StackState, ThreadState};

struct BarrierData {
    /// The thread that owns the current pause.
    owner: Option<ThreadId>,
}

impl BarrierData {
    fn is_parked_by_other(&self) -> bool {
        self.owner
            .is_some_and(|owner| owner != thread::current().id())
    }
}

pub struct SafePointBarrier {
    parking_requested: AtomicBool,
    data: Mutex<BarrierData>,
    /// Signalled whenever a thread reaches a safepoint.
    cv_reached: Condvar,
    /// Signalled when a pause ends.
    cv_resume: Condvar,
}

impl Default for SafePointBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl SafePointBarrier {
    pub fn new() -> Self {
        SafePointBarrier {
            parking_requested: AtomicBool::new(false),
            data: Mutex::new(BarrierData { owner: None }),
            cv_reached: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    pub fn is_parking_requested(&self) -> bool {
        self.parking_requested.load(Ordering::Acquire)
    }

    /// Is a pause owned by any thread in progress?
    pub fn is_paused(&self) -> bool {
        self.data.lock().unwrap().owner.is_some()
    }

    /// Bring every thread in `threads` other than `current` to a safepoint. `current` must
    /// be at a safepoint.
    ///
    /// Blocks until all of them report a safepoint. Returns false, without waiting, if
    /// another thread already owns a pause.
    pub fn park_others(&self, current: &ThreadState, threads: &[Arc<ThreadState>]) -> bool {
        assert!(
            current.is_at_safe_point(),
            "Thread #{} must be at a safepoint to park the others",
            current.serial()
        );
        let mut data = self.data.lock().unwrap();
        if data.owner.is_some() {
            trace!(
                "Thread #{} lost the race to park the others",
                current.serial()
            );
            return false;
        }
        data.owner = Some(current.thread_id());
        self.parking_requested.store(true, Ordering::Release);
        trace!(
            "Thread #{} is parking {} other thread(s)",
            current.serial(),
            threads.len().saturating_sub(1)
        );

        while threads.iter().any(|thread| !thread.is_at_safe_point()) {
            data = self.cv_reached.wait(data).unwrap();
        }
        trace!("Thread #{} parked the others", current.serial());
        true
    }

    /// End the pause started by a successful [`SafePointBarrier::park_others`] of the same
    /// thread.
    pub fn resume_others(&self, current: &ThreadState) {
        let mut data = self.data.lock().unwrap();
        assert!(
            data.owner == Some(current.thread_id()),
            "Thread #{} resumed threads it did not park",
            current.serial()
        );
        self.release(&mut data);
        trace!("Thread #{} resumed the others", current.serial());
    }

    fn release(&self, data: &mut MutexGuard<BarrierData>) {
        data.owner = None;
        self.parking_requested.store(false, Ordering::Release);
        self.cv_resume.notify_all();
    }

    /// Park the calling thread if another thread has requested a pause, and return once
    /// that pause is over.
    pub fn check_and_park(&self, state: &ThreadState, stack_state: StackState) {
        if !self.is_parking_requested() {
            return;
        }
        let mut data = self.data.lock().unwrap();
        if !data.is_parked_by_other() {
            return;
        }
        state.set_stack_state(stack_state);
        state.set_at_safe_point(true);
        self.cv_reached.notify_all();
        trace!("Thread #{} parked", state.serial());
        while data.is_parked_by_other() {
            data = self.cv_resume.wait(data).unwrap();
        }
        state.set_at_safe_point(false);
        trace!("Thread #{} unparked", state.serial());
    }

    /// Declare the calling thread to be at a safepoint until it leaves it. Entering a
    /// safepoint the thread is already at only updates its stack state.
    pub fn enter_safe_point(&self, state: &ThreadState, stack_state: StackState) {
        let _data = self.data.lock().unwrap();
        state.set_stack_state(stack_state);
        state.set_at_safe_point(true);
        self.cv_reached.notify_all();
    }

    /// Leave a safepoint, waiting for a pause of another thread to end first.
    pub fn leave_safe_point(&self, state: &ThreadState) {
        let mut data = self.data.lock().unwrap();
        debug_assert!(state.is_at_safe_point());
        while data.is_parked_by_other() {
            data = self.cv_resume.wait(data).unwrap();
        }
        state.set_at_safe_point(false);
    }

    /// Leave a safepoint unless another thread's pause is in progress. Returns whether the
    /// thread left.
    pub fn try_leave_safe_point(&self, state: &ThreadState) -> bool {
        let data = self.data.lock().unwrap();
        if data.is_parked_by_other() {
            return false;
        }
        state.set_at_safe_point(false);
        true
    }
}

/// Keeps a thread at a safepoint for the duration of a blocking operation.
pub struct SafePointScope<'a> {
    state: &'a ThreadState,
}

impl<'a> SafePointScope<'a> {
    pub fn new(state: &'a ThreadState, stack_state: StackState) -> Self {
        state.enter_safe_point(stack_state);
        SafePointScope { state }
    }
}

impl Drop for SafePointScope<'_> {
    fn drop(&mut self) {
        self.state.leave_safe_point();
    }
}
