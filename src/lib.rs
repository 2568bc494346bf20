//! A tracing mark-sweep heap for multi-threaded embedders.
//!
//! Threads attach to a [`ThreadHeap`](heap::ThreadHeap) through a
//! [`ThreadState`](thread_state::ThreadState), allocate [`GarbageCollected`] objects on it
//! and poll safepoints. A collection parks the other attached threads cooperatively, marks
//! from persistent handles and conservatively scanned stack words, iterates ephemeron
//! tables to a fixpoint, runs weak callbacks and sweeps.
//!
//! All heaps of a process share a [`ProcessHeap`], created with [`ProcessHeap::init`] and
//! torn down with [`ProcessHeap::shutdown`] once every heap has been destroyed.

#[macro_use]
extern crate log;
#[cfg(test)]
#[macro_use]
extern crate lazy_static;

pub mod heap;
pub mod process_heap;
pub mod safepoint;
pub mod thread_state;
pub mod util;

#[cfg(test)]
mod tests;

pub use crate::heap::persistent::Persistent;
pub use crate::heap::visitor::Visitor;
pub use crate::heap::{AllocationError, GarbageCollected, GcPhase, GcReason, HeapMode};
pub use crate::process_heap::ProcessHeap;
pub use crate::thread_state::{StackState, ThreadState};
pub use crate::util::{Address, ObjectReference};
