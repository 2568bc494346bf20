use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::thread_state::{StackState, ThreadState};

/// A mutex guard acquired while the thread is at a safepoint.
///
/// Blocking on a mutex that is held by a thread which is itself waiting for a pause would
/// deadlock if the blocked thread did not count as parked. The locker therefore enters a
/// safepoint before locking. If a pause started while it was blocked, the mutex is released
/// again, the thread waits for the pause to end and then retries.
///
/// The thread is not at a safepoint once the locker has been created.
pub struct SafePointAwareMutexLocker<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<'a, T> SafePointAwareMutexLocker<'a, T> {
    pub fn new(state: &ThreadState, mutex: &'a Mutex<T>) -> Self {
        loop {
            state.enter_safe_point(StackState::HeapPointersOnStack);
            let guard = mutex.lock().unwrap();
            if state.try_leave_safe_point() {
                return SafePointAwareMutexLocker { guard };
            }
            // A pause began while we were blocked. Let its owner have the mutex.
            drop(guard);
            trace!("Thread #{} waits for a pause before locking", state.serial());
            state.leave_safe_point();
        }
    }
}

impl<T> Deref for SafePointAwareMutexLocker<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SafePointAwareMutexLocker<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
