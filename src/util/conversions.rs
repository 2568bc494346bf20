use crate::util::constants::*;
use crate::util::Address;

/// The base of the heap page containing `addr`.
pub const fn blink_page_align_down(addr: Address) -> Address {
    addr.align_down(BLINK_PAGE_SIZE)
}

pub const fn blink_page_align_up(addr: Address) -> Address {
    addr.align_up(BLINK_PAGE_SIZE)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// Round an object size up to the allocation granularity.
pub const fn allocation_size_align_up(bytes: usize) -> usize {
    raw_align_up(bytes, ALLOCATION_GRANULARITY)
}

/// The number of bytes needed to hold `bytes` in whole heap pages.
pub const fn blink_pages_align_up(bytes: usize) -> usize {
    raw_align_up(bytes, BLINK_PAGE_SIZE)
}

pub fn bytes_to_formatted_string(bytes: usize) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut i = 0;
    let mut num = bytes;
    while i < UNITS.len() - 1 {
        let new_num = num >> 10;
        if new_num == 0 {
            return format!("{}{}", num, UNITS[i]);
        }
        num = new_num;
        i += 1;
    }
    format!("{}{}", num, UNITS[UNITS.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        let addr = unsafe { Address::from_usize(0x2_0001_0010) };
        assert_eq!(
            blink_page_align_down(addr),
            unsafe { Address::from_usize(0x2_0000_0000) }
        );
        assert_eq!(
            blink_page_align_up(addr),
            unsafe { Address::from_usize(0x2_0002_0000) }
        );
        assert_eq!(blink_pages_align_up(1), BLINK_PAGE_SIZE);
        assert_eq!(blink_pages_align_up(BLINK_PAGE_SIZE), BLINK_PAGE_SIZE);
    }

    #[test]
    fn test_allocation_size_align_up() {
        assert_eq!(allocation_size_align_up(0), 0);
        assert_eq!(allocation_size_align_up(1), ALLOCATION_GRANULARITY);
        assert_eq!(allocation_size_align_up(17), 2 * ALLOCATION_GRANULARITY);
    }

    #[test]
    fn test_bytes_to_formatted_string() {
        assert_eq!(bytes_to_formatted_string(0), "0B");
        assert_eq!(bytes_to_formatted_string(1023), "1023B");
        assert_eq!(bytes_to_formatted_string(1024), "1KiB");
        assert_eq!(bytes_to_formatted_string(1025), "1KiB");
        assert_eq!(bytes_to_formatted_string(1 << 20), "1MiB");
    }
}
