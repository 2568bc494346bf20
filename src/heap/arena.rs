//! Per-thread allocation and sweeping.
//!
//! Each thread allocates from its own pages. Small objects are bump allocated from the
//! current allocation area, which is refilled from a segregated free list and then from
//! fresh pages. Objects of at least [`LARGE_OBJECT_SIZE_THRESHOLD`] bytes get a large page
//! of their own.

use std::io;

use crate::heap::page::{GcInfo, ObjectHeader, PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::heap::ThreadHeap;
use crate::util::constants::*;
use crate::util::conversions::allocation_size_align_up;
use crate::util::{Address, ObjectReference};

/// The smallest block an object can occupy: a header and one allocation granule.
const MIN_OBJECT_BLOCK_SIZE: usize = 2 * ALLOCATION_GRANULARITY;

/// The number of free list buckets. Free blocks on a normal page are smaller than a page.
const FREE_LIST_BUCKETS: usize = LOG_BLINK_PAGE_SIZE as usize + 1;

/// The size of the block holding an object with `payload_size` bytes.
pub fn object_block_size(payload_size: usize) -> usize {
    allocation_size_align_up(ObjectHeader::SIZE + payload_size).max(MIN_OBJECT_BLOCK_SIZE)
}

fn bucket_index_for_size(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Free blocks of normal pages, bucketed by the floor of their log2 size.
struct FreeList {
    buckets: [Vec<Address>; FREE_LIST_BUCKETS],
}

impl FreeList {
    fn new() -> Self {
        FreeList {
            buckets: std::array::from_fn(|_| vec![]),
        }
    }

    /// # Safety
    /// `[addr, addr + size)` must be unused memory of a normal page.
    unsafe fn add(&mut self, addr: Address, size: usize) {
        ObjectHeader::init_free(addr, size);
        self.buckets[bucket_index_for_size(size)].push(addr);
    }

    /// Take a block of at least `size` bytes. Returns the block and its actual size.
    fn take(&mut self, size: usize) -> Option<(Address, usize)> {
        // Every block in a bucket above the floor bucket of `size` is large enough.
        let floor = bucket_index_for_size(size);
        let start = if size.is_power_of_two() {
            floor
        } else {
            floor + 1
        };
        for bucket in self.buckets.iter_mut().skip(start) {
            if let Some(addr) = bucket.pop() {
                let block_size = unsafe { ObjectHeader::at(addr) }.size();
                debug_assert!(block_size >= size);
                return Some((addr, block_size));
            }
        }
        None
    }

    fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
    }

    fn total_size(&self) -> usize {
        self.buckets
            .iter()
            .flatten()
            .map(|addr| unsafe { ObjectHeader::at(*addr) }.size())
            .sum()
    }
}

/// What a sweep found, in block bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub live: usize,
    pub freed: usize,
}

/// The pages and allocation state of one thread.
pub struct ThreadArena {
    serial: usize,
    normal_pages: Vec<Address>,
    large_pages: Vec<Address>,
    cursor: Address,
    limit: Address,
    free_list: FreeList,
}

impl ThreadArena {
    pub fn new(serial: usize) -> Self {
        ThreadArena {
            serial,
            normal_pages: vec![],
            large_pages: vec![],
            cursor: Address::ZERO,
            limit: Address::ZERO,
            free_list: FreeList::new(),
        }
    }

    pub fn normal_page_count(&self) -> usize {
        self.normal_pages.len()
    }

    pub fn large_page_count(&self) -> usize {
        self.large_pages.len()
    }

    /// Bytes in free blocks that can be reused without a new page.
    pub fn free_size(&self) -> usize {
        let bump = if self.cursor.is_zero() {
            0
        } else {
            self.limit - self.cursor
        };
        bump + self.free_list.total_size()
    }

    /// Allocate an unmarked object with `payload_size` bytes of zeroed payload. The block
    /// size is added to the heap's allocated object size.
    pub fn allocate(
        &mut self,
        heap: &ThreadHeap,
        info: &'static GcInfo,
        payload_size: usize,
    ) -> io::Result<ObjectReference> {
        let size = object_block_size(payload_size);
        let object = if size >= LARGE_OBJECT_SIZE_THRESHOLD {
            self.allocate_large(heap, info, size)?
        } else {
            match self.bump(info, size) {
                Some(object) => object,
                None => self.allocate_slow(heap, info, size)?,
            }
        };
        heap.stats().increase_allocated_object_size(size);
        Ok(object)
    }

    fn bump(&mut self, info: &'static GcInfo, size: usize) -> Option<ObjectReference> {
        if self.cursor.is_zero() || self.limit - self.cursor < size {
            return None;
        }
        let block = self.cursor;
        self.cursor = block + size;
        unsafe {
            // Keep the page walkable: the rest of the area is a free block.
            if self.cursor < self.limit {
                ObjectHeader::init_free(self.cursor, self.limit - self.cursor);
            }
            Some(ObjectHeader::init(block, info, size))
        }
    }

    fn set_allocation_area(&mut self, start: Address, end: Address) {
        trace!("Allocation area {}..{}", start, end);
        self.cursor = start;
        self.limit = end;
    }

    fn allocate_slow(
        &mut self,
        heap: &ThreadHeap,
        info: &'static GcInfo,
        size: usize,
    ) -> io::Result<ObjectReference> {
        // The old area stays formatted as a free block and is reclaimed by the next sweep.
        if let Some((block, block_size)) = self.free_list.take(size) {
            self.set_allocation_area(block, block + block_size);
        } else {
            let page = heap.take_normal_page(self.serial)?;
            self.normal_pages.push(page);
            let header = unsafe { PageHeader::at(page) };
            let (start, end) = (header.payload_start(), header.payload_end());
            unsafe { ObjectHeader::init_free(start, end - start) };
            self.set_allocation_area(start, end);
        }
        let object = self.bump(info, size);
        debug_assert!(object.is_some());
        object.ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation area"))
    }

    fn allocate_large(
        &mut self,
        heap: &ThreadHeap,
        info: &'static GcInfo,
        size: usize,
    ) -> io::Result<ObjectReference> {
        let page = heap.allocate_large_page(self.serial, size)?;
        self.large_pages.push(page);
        trace!("Large object of {} bytes on page {}", size, page);
        Ok(unsafe { ObjectHeader::init(page + PAGE_HEADER_SIZE, info, size) })
    }

    /// Close the allocation area so that every block is visible to marking and sweeping.
    pub fn make_consistent_for_gc(&mut self) {
        self.cursor = Address::ZERO;
        self.limit = Address::ZERO;
    }

    /// Finalize every unmarked object and clear the mark bits of the others. Pages without
    /// survivors are handed back to `heap`.
    pub fn sweep(&mut self, heap: &ThreadHeap) -> SweepResult {
        debug_assert!(self.cursor.is_zero(), "Sweeping an open allocation area");
        self.free_list.clear();
        let mut result = SweepResult::default();

        let pages = std::mem::take(&mut self.normal_pages);
        for page in pages {
            let (page_result, free_blocks) = unsafe { sweep_normal_page(page) };
            result.live += page_result.live;
            result.freed += page_result.freed;
            if page_result.live == 0 {
                heap.release_normal_page(page);
                continue;
            }
            for (addr, size) in free_blocks {
                unsafe { self.free_list.add(addr, size) };
            }
            self.normal_pages.push(page);
        }

        let pages = std::mem::take(&mut self.large_pages);
        for page in pages {
            let header = unsafe { ObjectHeader::at(page + PAGE_HEADER_SIZE) };
            if header.is_marked() {
                header.unmark();
                result.live += header.size();
                self.large_pages.push(page);
            } else {
                result.freed += header.size();
                unsafe { header.run_finalizer() };
                heap.release_large_page(page);
            }
        }

        trace!(
            "Swept arena of thread #{}: {:?}, {} normal / {} large pages left",
            self.serial,
            result,
            self.normal_pages.len(),
            self.large_pages.len()
        );
        result
    }

    /// Give up all pages, for example to orphan them. Returns the normal and the large
    /// pages.
    pub fn take_pages(&mut self) -> (Vec<Address>, Vec<Address>) {
        self.make_consistent_for_gc();
        self.free_list.clear();
        (
            std::mem::take(&mut self.normal_pages),
            std::mem::take(&mut self.large_pages),
        )
    }
}

/// Sweep one normal page. Dead objects are finalized and adjacent free blocks coalesced.
/// Returns the sweep counts and the free blocks of the page.
///
/// # Safety
/// `page` must be a normal page whose allocation area has been closed.
unsafe fn sweep_normal_page(page: Address) -> (SweepResult, Vec<(Address, usize)>) {
    let header = PageHeader::at(page);
    debug_assert_eq!(header.kind(), PageKind::Normal);
    let mut result = SweepResult::default();
    let mut free_blocks = vec![];
    let mut free_start: Option<Address> = None;

    for block in header.blocks() {
        let object = ObjectHeader::at(block);
        if object.is_free() {
            free_start.get_or_insert(block);
        } else if object.is_marked() {
            object.unmark();
            result.live += object.size();
            if let Some(start) = free_start.take() {
                free_blocks.push((start, block - start));
            }
        } else {
            result.freed += object.size();
            object.finalize();
            free_start.get_or_insert(block);
        }
    }
    if let Some(start) = free_start {
        free_blocks.push((start, header.payload_end() - start));
    }
    for &(start, size) in free_blocks.iter() {
        ObjectHeader::init_free(start, size);
    }
    (result, free_blocks)
}
