//! Bookkeeping for a later compaction pass.
//!
//! During marking, owners of movable backing stores register the slots that reference
//! them. After the collection the registrar is handed to whoever moves the backing stores,
//! and [`HeapCompact::relocate`] patches every registered slot for each moved store.

use std::collections::{BTreeMap, HashMap};

use crate::util::Address;

/// Notified after a backing store registered with a callback has moved. Arguments are the
/// registration context, the old and new backing addresses, and the size of the store.
pub type MovingObjectCallback = fn(Address, Address, Address, usize);

/// The slots to fix up once movable backing stores are relocated.
#[derive(Default)]
pub struct HeapCompact {
    /// Backing store address to the slot that references it.
    fixups: HashMap<Address, Address>,
    /// Slot to the callback to invoke after its backing store moved.
    callbacks: HashMap<Address, (Address, MovingObjectCallback)>,
    /// Slots that live inside a movable backing store themselves, with their address after
    /// that store was relocated.
    interior_slots: BTreeMap<Address, Option<Address>>,
}

impl HeapCompact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `slot` as the reference to the backing store it currently points to.
    /// Registering the same store again replaces the slot.
    pub fn add(&mut self, slot: Address) {
        let backing: Address = unsafe { slot.load() };
        if backing.is_zero() {
            return;
        }
        if let Some(old) = self.fixups.insert(backing, slot) {
            if old != slot {
                trace!("Backing {} moved from slot {} to {}", backing, old, slot);
            }
        }
    }

    /// Register `slot` and ask for `callback` to be run with `context` once its backing
    /// store has moved.
    pub fn add_callback(
        &mut self,
        slot: Address,
        context: Address,
        callback: MovingObjectCallback,
    ) {
        self.add(slot);
        self.callbacks.insert(slot, (context, callback));
    }

    /// Register `slot` as a slot stored inside another movable backing store.
    pub fn add_interior_slot(&mut self, slot: Address) {
        self.add(slot);
        self.interior_slots.entry(slot).or_insert(None);
    }

    /// The number of backing stores with a registered slot.
    pub fn fixup_count(&self) -> usize {
        self.fixups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixups.is_empty() && self.interior_slots.is_empty()
    }

    pub fn has_fixup_for(&self, backing: Address) -> bool {
        self.fixups.contains_key(&backing)
    }

    /// The backing store of `size` bytes at `from` has been copied to `to`. Update the slot
    /// that refers to it and record the new location of interior slots it contains.
    pub fn relocate(&mut self, from: Address, to: Address, size: usize) {
        self.relocate_interior_slots(from, to, size);

        let slot = match self.fixups.get(&from) {
            Some(slot) => *slot,
            None => {
                trace!("No fixup registered for backing {}", from);
                return;
            }
        };
        // The slot may itself have moved along with an earlier relocated store.
        let location = self
            .interior_slots
            .get(&slot)
            .copied()
            .flatten()
            .unwrap_or(slot);
        let current: Address = unsafe { location.load() };
        debug_assert!(
            current == from,
            "Slot {} refers to {} instead of the relocated backing {}",
            location,
            current,
            from
        );
        unsafe { location.store(to) };
        trace!("Relocated {} -> {} (slot {})", from, to, location);

        if let Some((context, callback)) = self.callbacks.get(&slot) {
            callback(*context, from, to, size);
        }
    }

    fn relocate_interior_slots(&mut self, from: Address, to: Address, size: usize) {
        for (slot, relocated) in self.interior_slots.range_mut(from..from + size) {
            debug_assert!(relocated.is_none(), "Interior slot {} relocated twice", slot);
            *relocated = Some(to + (*slot - from));
        }
    }
}
