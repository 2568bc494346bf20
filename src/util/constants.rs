pub const BYTES_IN_KBYTE: usize = 1 << 10;
pub const BYTES_IN_MBYTE: usize = 1 << 20;

/// log2 of the size of a heap page. Every page, normal or large, starts at an address
/// aligned to this size.
pub const LOG_BLINK_PAGE_SIZE: u8 = 17;
/// The size of a normal heap page.
pub const BLINK_PAGE_SIZE: usize = 1 << LOG_BLINK_PAGE_SIZE;

/// Normal pages are reserved from the OS in regions of this many pages. Pages of a region
/// that are not immediately needed go to the free page pool.
pub const BLINK_PAGES_PER_REGION: usize = 10;

/// Object blocks start at and are sized in multiples of this many bytes.
pub const ALLOCATION_GRANULARITY: usize = 16;
/// Low bits of a block size that are always zero.
pub const ALLOCATION_MASK: usize = ALLOCATION_GRANULARITY - 1;

/// Objects of at least this size (including the object header) get their own large
/// object page.
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = BLINK_PAGE_SIZE / 2;

pub const BYTES_IN_OS_PAGE: usize = 4 * BYTES_IN_KBYTE;
