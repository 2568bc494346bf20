use crate::heap::page::PageHeader;
use crate::util::Address;

/// Normal pages that are mapped but not used by any arena.
#[derive(Default)]
pub struct FreePagePool {
    pages: Vec<Address>,
}

impl FreePagePool {
    pub fn add(&mut self, page: Address) {
        self.pages.push(page);
    }

    pub fn take(&mut self) -> Option<Address> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Pages of threads that detached while other threads kept using the heap.
///
/// Nothing on these pages may be traced. They are released at the end of the next global
/// collection.
#[derive(Default)]
pub struct OrphanedPagePool {
    pages: Vec<Address>,
}

impl OrphanedPagePool {
    /// # Safety
    /// `page` must be the base of a live page.
    pub unsafe fn add(&mut self, page: Address) {
        PageHeader::at(page).set_orphaned();
        self.pages.push(page);
    }

    /// Does `addr` point into an orphaned page?
    pub fn contains(&self, addr: Address) -> bool {
        self.pages
            .iter()
            .any(|&page| unsafe { PageHeader::at(page) }.contains(addr))
    }

    pub fn take_all(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.pages)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}
