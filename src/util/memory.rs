use crate::util::constants::BYTES_IN_OS_PAGE;
use crate::util::Address;
use std::io::Result;

/// Demand-zero mmap of `size` bytes at an address aligned to `align`.
/// This function guarantees to zero all mapped memory.
///
/// The mapping is over-reserved by `align` bytes and the unaligned head and tail are
/// unmapped again, so the result can be released with a single [`munmap`].
pub fn dzmmap_aligned(size: usize, align: usize) -> Result<Address> {
    debug_assert!(size > 0 && size % BYTES_IN_OS_PAGE == 0);
    debug_assert!(align.is_power_of_two() && align >= BYTES_IN_OS_PAGE);
    let unaligned_size = size + align;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), unaligned_size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    let unaligned_start = Address::from_mut_ptr(ptr);
    let start = unaligned_start.align_up(align);
    let gap_start = start - unaligned_start;
    let gap_end = unaligned_size - size - gap_start;
    if gap_start > 0 {
        munmap(unaligned_start, gap_start)?;
    }
    if gap_end > 0 {
        munmap(start + size, gap_end)?;
    }
    Ok(start)
}

/// Unmap the given range.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Give the physical memory of the range back to the OS while keeping the mapping.
/// The range reads as zero afterwards.
pub fn decommit(start: Address, size: usize) -> Result<()> {
    debug_assert!(start.is_aligned_to(BYTES_IN_OS_PAGE));
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )
}

pub fn zero(start: Address, len: usize) {
    unsafe { std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len) }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
