use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::heap_test_prelude::*;
use crate::GarbageCollected;

/// Owns a movable backing store, referenced through `backing`.
struct Owner {
    backing: Cell<usize>,
    notify: bool,
}

static MOVES: AtomicUsize = AtomicUsize::new(0);

fn backing_moved(_context: Address, _from: Address, _to: Address, size: usize) {
    MOVES.fetch_add(size, Ordering::SeqCst);
}

impl GarbageCollected for Owner {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        let slot = Address::from_ref(&self.backing);
        if self.notify {
            visitor.register_moving_object_callback(slot, Address::from_ref(self), backing_moved);
        } else {
            visitor.register_moving_object_reference(slot);
        }
    }
}

#[test]
pub fn no_registrar_without_registrations() {
    with_heap(|fixture| {
        let finalized = std::sync::Arc::new(AtomicUsize::new(0));
        let object = fixture.state.allocate(Node::new(&finalized));
        let _root = fixture.state.persistent(Some(object));
        assert!(fixture.collect());
        assert!(fixture.heap().take_compaction().is_none());
    })
}

#[test]
pub fn registered_slots_are_fixed_up() {
    with_heap(|fixture| {
        let state = &fixture.state;
        let old_backing = [0u64; 4];
        let new_backing = [0u64; 4];
        let from = Address::from_ref(&old_backing);
        let to = Address::from_ref(&new_backing);

        let plain = state.allocate(Owner {
            backing: Cell::new(from.as_usize()),
            notify: false,
        });
        let notified_backing = [0u64; 4];
        let notified_from = Address::from_ref(&notified_backing);
        let notified = state.allocate(Owner {
            backing: Cell::new(notified_from.as_usize()),
            notify: true,
        });
        let _roots = [state.persistent(Some(plain)), state.persistent(Some(notified))];

        assert!(fixture.collect());
        let mut compaction = fixture.heap().take_compaction().unwrap();
        assert_eq!(compaction.fixup_count(), 2);
        assert!(compaction.has_fixup_for(from));
        assert!(compaction.has_fixup_for(notified_from));
        // Handed out once.
        assert!(fixture.heap().take_compaction().is_none());

        compaction.relocate(from, to, 32);
        let owner: &Owner = unsafe { plain.as_ref() };
        assert_eq!(owner.backing.get(), to.as_usize());

        let moves = MOVES.load(Ordering::SeqCst);
        compaction.relocate(notified_from, to, 32);
        let owner: &Owner = unsafe { notified.as_ref() };
        assert_eq!(owner.backing.get(), to.as_usize());
        assert_eq!(MOVES.load(Ordering::SeqCst), moves + 32);
    })
}
