use crate::util::constants::LOG_BLINK_PAGE_SIZE;
use crate::util::conversions::blink_page_align_down;
use crate::util::Address;

/// A cache of heap pages that are known not to belong to the heap.
///
/// Conservative pointer scanning asks whether arbitrary words point into the heap. Most of
/// them do not, and a region tree lookup per word is expensive, so negative answers are
/// remembered here at page granularity. The table is 2-way set associative: a new entry
/// pushes the older entry of its set into the second way and evicts the one that was
/// there.
///
/// The cache is only sound while no region is added to the heap. The owner flushes it at
/// the start of every collection and whenever it maps a new region.
pub struct HeapDoesNotContainCache {
    log_entries: u8,
    entries: Box<[Address]>,
    has_entries: bool,
}

impl HeapDoesNotContainCache {
    pub fn new(log_entries: u8) -> Self {
        debug_assert!(log_entries >= 1);
        HeapDoesNotContainCache {
            log_entries,
            entries: vec![Address::ZERO; 1 << log_entries].into_boxed_slice(),
            has_entries: false,
        }
    }

    /// Drop all entries.
    pub fn flush(&mut self) {
        if self.has_entries {
            self.entries.fill(Address::ZERO);
            self.has_entries = false;
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.has_entries
    }

    /// Index of the first way of the set for `address`. Always even.
    fn hash(&self, address: Address) -> usize {
        let log_entries = self.log_entries as usize;
        let mut value = address >> LOG_BLINK_PAGE_SIZE as usize;
        value ^= value >> log_entries;
        value ^= value >> (log_entries * 2);
        value &= (1 << log_entries) - 1;
        value & !1
    }

    /// Is the page of `address` known not to be part of the heap?
    ///
    /// The zero page is always reported as not contained. The OS never maps it, so that is
    /// also the right answer.
    pub fn lookup(&self, address: Address) -> bool {
        let index = self.hash(address);
        let page = blink_page_align_down(address);
        self.entries[index] == page || self.entries[index + 1] == page
    }

    /// Remember that the page of `address` is not part of the heap. Adding a page that is
    /// already cached does nothing.
    pub fn add_entry(&mut self, address: Address) {
        if self.lookup(address) {
            return;
        }
        self.has_entries = true;
        let index = self.hash(address);
        let page = blink_page_align_down(address);
        self.entries[index + 1] = self.entries[index];
        self.entries[index] = page;
    }
}
