use std::collections::BTreeMap;

use crate::heap::page::PageMemoryRegion;
use crate::util::Address;

/// Maps address ranges to the page memory regions of a heap.
///
/// Regions never overlap, so the only candidate for an address is the region with the
/// greatest base address not above it.
#[derive(Default)]
pub struct RegionTree {
    regions: BTreeMap<Address, PageMemoryRegion>,
}

impl RegionTree {
    pub fn add(&mut self, region: PageMemoryRegion) {
        debug_assert!(self.lookup(region.base()).is_none());
        debug_assert!(self.lookup(region.end() - 1usize).is_none());
        let old = self.regions.insert(region.base(), region);
        debug_assert!(old.is_none());
    }

    /// Remove the region starting at `base`. Dropping the returned region unmaps it.
    pub fn remove(&mut self, base: Address) -> Option<PageMemoryRegion> {
        self.regions.remove(&base)
    }

    /// The region containing `addr`.
    pub fn lookup(&self, addr: Address) -> Option<&PageMemoryRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageMemoryRegion> {
        self.regions.values()
    }

    /// Remove and unmap all regions.
    pub fn clear(&mut self) {
        self.regions.clear();
    }
}
