// Tests that drive whole collections. Each test creates its own process heap, so they can
// run in parallel. Tests that read or write THREADHEAP_* environment variables must use
// `crate::util::test_util::serial_test`.

// Common includes for heap tests.
pub(crate) mod heap_test_prelude {
    pub use crate::heap::arena::object_block_size;
    pub use crate::heap::{GcPhase, GcReason};
    pub use crate::process_heap::ProcessHeap;
    pub use crate::thread_state::{StackState, ThreadState};
    pub use crate::util::options::Options;
    pub use crate::util::test_util::fixtures::*;
    pub use crate::util::test_util::panic_after;
    pub use crate::util::{Address, ObjectReference};
    pub use crate::Visitor;
}

mod heap_test_compaction;
mod heap_test_detach;
