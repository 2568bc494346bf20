//! Heap memory layout: regions, pages and object headers.
//!
//! Memory is reserved from the OS in [`PageMemoryRegion`]s aligned to [`BLINK_PAGE_SIZE`].
//! A normal region holds [`BLINK_PAGES_PER_REGION`] pages of that size. A large object
//! region holds exactly one page that spans the whole region.
//!
//! Every page starts with a [`PageHeader`]. The payload that follows is an unbroken
//! sequence of blocks, each starting with an [`ObjectHeader`]. A block is either an
//! allocated object or a free block, so a page can always be walked from its payload start
//! to its payload end.

use std::marker::PhantomData;
use std::mem;

use static_assertions::const_assert_eq;

use crate::heap::callback_stack::VisitorCallback;
use crate::heap::visitor::Visitor;
use crate::heap::GarbageCollected;
use crate::util::constants::*;
use crate::util::conversions::{allocation_size_align_up, blink_page_align_down};
use crate::util::{memory, Address, ObjectReference};

/// Runs the destructor of a dead object.
pub type FinalizeFn = unsafe fn(ObjectReference);

/// Per-type information shared by all objects of a managed type.
pub struct GcInfo {
    pub trace: VisitorCallback,
    pub finalize: Option<FinalizeFn>,
}

impl GcInfo {
    pub fn of<T: GarbageCollected>() -> &'static GcInfo {
        GcInfoFor::<T>::INFO
    }
}

struct GcInfoFor<T>(PhantomData<T>);

impl<T: GarbageCollected> GcInfoFor<T> {
    const INFO: &'static GcInfo = &GcInfo {
        trace: trace_trampoline::<T>,
        finalize: if mem::needs_drop::<T>() {
            Some(finalize_trampoline::<T> as FinalizeFn)
        } else {
            None
        },
    };
}

fn trace_trampoline<T: GarbageCollected>(visitor: &mut Visitor<'_>, object: ObjectReference) {
    let value: &T = unsafe { object.as_ref() };
    value.trace(visitor);
}

unsafe fn finalize_trampoline<T: GarbageCollected>(object: ObjectReference) {
    std::ptr::drop_in_place(object.to_raw_address().to_mut_ptr::<T>());
}

const MARK_BIT: usize = 1;
const FREE_BIT: usize = 2;
const SIZE_MASK: usize = !ALLOCATION_MASK;

/// The header in front of every block of a page.
///
/// Allocated objects point at their type's [`GcInfo`]. Free blocks have no info. The size
/// of the block, including the header, is a multiple of [`ALLOCATION_GRANULARITY`], which
/// leaves the low bits free for the mark and free flags.
#[repr(C, align(16))]
pub struct ObjectHeader {
    info: Option<&'static GcInfo>,
    encoded: usize,
}

const_assert_eq!(mem::size_of::<ObjectHeader>(), ALLOCATION_GRANULARITY);

impl ObjectHeader {
    pub const SIZE: usize = mem::size_of::<ObjectHeader>();

    /// # Safety
    /// `addr` must be the start of a block inside a live page.
    pub unsafe fn at<'a>(addr: Address) -> &'a mut ObjectHeader {
        addr.as_mut_ref()
    }

    /// # Safety
    /// `object` must be an object allocated in a live page.
    pub unsafe fn from_object<'a>(object: ObjectReference) -> &'a mut ObjectHeader {
        Self::at(object.to_raw_address() - Self::SIZE)
    }

    /// Format `addr` as an unmarked object of `size` bytes.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be unused page memory.
    pub unsafe fn init(addr: Address, info: &'static GcInfo, size: usize) -> ObjectReference {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0 && size > Self::SIZE);
        addr.store(ObjectHeader {
            info: Some(info),
            encoded: size,
        });
        ObjectReference::from_raw_address_unchecked(addr + Self::SIZE)
    }

    /// Format `addr` as a free block of `size` bytes.
    ///
    /// # Safety
    /// `[addr, addr + size)` must be unused page memory.
    pub unsafe fn init_free(addr: Address, size: usize) {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0 && size >= Self::SIZE);
        addr.store(ObjectHeader {
            info: None,
            encoded: size | FREE_BIT,
        });
    }

    pub fn address(&self) -> Address {
        Address::from_ref(self)
    }

    /// The size of the block, including this header.
    pub fn size(&self) -> usize {
        self.encoded & SIZE_MASK
    }

    pub fn is_free(&self) -> bool {
        self.encoded & FREE_BIT != 0
    }

    pub fn is_marked(&self) -> bool {
        self.encoded & MARK_BIT != 0
    }

    /// Set the mark bit. Returns false if it was already set.
    pub fn mark(&mut self) -> bool {
        debug_assert!(!self.is_free());
        if self.is_marked() {
            return false;
        }
        self.encoded |= MARK_BIT;
        true
    }

    pub fn unmark(&mut self) {
        self.encoded &= !MARK_BIT;
    }

    pub fn info(&self) -> Option<&'static GcInfo> {
        self.info
    }

    pub fn payload(&self) -> Address {
        self.address() + Self::SIZE
    }

    pub fn payload_size(&self) -> usize {
        self.size() - Self::SIZE
    }

    pub fn object(&self) -> ObjectReference {
        debug_assert!(!self.is_free());
        unsafe { ObjectReference::from_raw_address_unchecked(self.payload()) }
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.is_in(self.address(), self.address() + self.size())
    }

    /// Run the destructor of a dead object, leaving the block allocated.
    ///
    /// # Safety
    /// The object must be unreachable and must not be used afterwards.
    pub unsafe fn run_finalizer(&self) {
        debug_assert!(!self.is_free() && !self.is_marked());
        if let Some(finalize) = self.info.and_then(|info| info.finalize) {
            finalize(self.object());
        }
    }

    /// Run the finalizer of a dead object and turn it into a free block.
    ///
    /// # Safety
    /// The object must be unreachable.
    pub unsafe fn finalize(&mut self) {
        self.run_finalizer();
        let size = self.size();
        memory::zero(self.payload(), size - Self::SIZE);
        Self::init_free(self.address(), size);
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// An unused page. Zeroed memory reads as a free page.
    Free = 0,
    Normal = 1,
    Large = 2,
}

/// The header at the start of every page.
#[repr(C)]
pub struct PageHeader {
    kind: PageKind,
    orphaned: bool,
    heap_id: usize,
    owner: usize,
    payload_end: Address,
}

/// The offset of the first block of a page.
pub const PAGE_HEADER_SIZE: usize = allocation_size_align_up(mem::size_of::<PageHeader>());

impl PageHeader {
    /// # Safety
    /// `page` must be the base of a mapped page.
    pub unsafe fn at<'a>(page: Address) -> &'a mut PageHeader {
        debug_assert!(page.is_aligned_to(BLINK_PAGE_SIZE));
        page.as_mut_ref()
    }

    /// The header of the page an object lives on. The object header always lies in the
    /// first page-size bytes of its page, also for large objects.
    ///
    /// # Safety
    /// `object` must be an object allocated in a live page.
    pub unsafe fn of_object<'a>(object: ObjectReference) -> &'a mut PageHeader {
        Self::at(blink_page_align_down(
            object.to_raw_address() - ObjectHeader::SIZE,
        ))
    }

    /// # Safety
    /// `page` must be the base of a mapped page that is not in use.
    pub unsafe fn init(
        page: Address,
        kind: PageKind,
        heap_id: usize,
        owner: usize,
        payload_end: Address,
    ) {
        page.store(PageHeader {
            kind,
            orphaned: false,
            heap_id,
            owner,
            payload_end,
        });
    }

    /// # Safety
    /// `page` must be the base of a mapped page that is not in use.
    pub unsafe fn init_free(page: Address) {
        Self::init(page, PageKind::Free, 0, 0, page + PAGE_HEADER_SIZE);
    }

    pub fn base(&self) -> Address {
        Address::from_ref(self)
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned
    }

    pub fn set_orphaned(&mut self) {
        self.orphaned = true;
    }

    pub fn heap_id(&self) -> usize {
        self.heap_id
    }

    /// The serial number of the thread that allocates on this page.
    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn payload_start(&self) -> Address {
        self.base() + PAGE_HEADER_SIZE
    }

    pub fn payload_end(&self) -> Address {
        self.payload_end
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.is_in(self.base(), self.payload_end)
    }

    /// Iterate the block headers of this page.
    pub fn blocks(&self) -> BlockIter {
        BlockIter {
            cursor: self.payload_start(),
            end: self.payload_end,
        }
    }

    /// The allocated object whose block contains `addr`, if any. Interior pointers and
    /// pointers into the object header both find the object.
    pub fn find_object(&self, addr: Address) -> Option<ObjectReference> {
        if !addr.is_in(self.payload_start(), self.payload_end) {
            return None;
        }
        let header = self
            .blocks()
            .map(|block| unsafe { ObjectHeader::at(block) })
            .find(|header| header.contains(addr))?;
        if header.is_free() {
            None
        } else {
            Some(header.object())
        }
    }
}

/// Iterator over the block addresses of a page.
pub struct BlockIter {
    cursor: Address,
    end: Address,
}

impl Iterator for BlockIter {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        if self.cursor >= self.end {
            return None;
        }
        let block = self.cursor;
        let size = unsafe { ObjectHeader::at(block) }.size();
        debug_assert!(size > 0, "Unformatted block at {}", block);
        if size == 0 {
            return None;
        }
        self.cursor = block + size;
        Some(block)
    }
}

/// A range of OS memory holding heap pages. Unmapped on drop.
pub struct PageMemoryRegion {
    base: Address,
    size: usize,
    is_large: bool,
}

impl PageMemoryRegion {
    /// Map a region of [`BLINK_PAGES_PER_REGION`] normal pages.
    pub fn allocate_normal() -> std::io::Result<Self> {
        let size = BLINK_PAGE_SIZE * BLINK_PAGES_PER_REGION;
        let base = memory::dzmmap_aligned(size, BLINK_PAGE_SIZE)?;
        trace!("Mapped normal region {}..{}", base, base + size);
        Ok(PageMemoryRegion {
            base,
            size,
            is_large: false,
        })
    }

    /// Map a region holding one large page of `size` bytes. `size` must be a multiple of
    /// [`BLINK_PAGE_SIZE`].
    pub fn allocate_large(size: usize) -> std::io::Result<Self> {
        debug_assert!(size % BLINK_PAGE_SIZE == 0);
        let base = memory::dzmmap_aligned(size, BLINK_PAGE_SIZE)?;
        trace!("Mapped large region {}..{}", base, base + size);
        Ok(PageMemoryRegion {
            base,
            size,
            is_large: true,
        })
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.base + self.size
    }

    pub fn is_large(&self) -> bool {
        self.is_large
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.is_in(self.base, self.end())
    }

    /// The base addresses of the pages of this region.
    pub fn pages(&self) -> impl Iterator<Item = Address> {
        let base = self.base;
        let count = if self.is_large {
            1
        } else {
            self.size / BLINK_PAGE_SIZE
        };
        (0..count).map(move |i| base + i * BLINK_PAGE_SIZE)
    }

    /// The base of the page containing `addr`.
    pub fn page_for(&self, addr: Address) -> Address {
        debug_assert!(self.contains(addr));
        if self.is_large {
            self.base
        } else {
            blink_page_align_down(addr)
        }
    }
}

impl Drop for PageMemoryRegion {
    fn drop(&mut self) {
        trace!("Unmapping region {}..{}", self.base, self.end());
        if let Err(e) = memory::munmap(self.base, self.size) {
            error!("Failed to unmap region {}: {}", self.base, e);
        }
    }
}
