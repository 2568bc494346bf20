use std::fmt;
use std::num::NonZeroUsize;
use std::ops::*;

/// A size in bytes.
pub type ByteSize = usize;

/// A raw machine address. Arithmetic on it is safe; reading and writing through it is not.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct Address(usize);

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// The distance between two addresses. The left-hand side must be the higher one.
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "{} - {} would be negative",
            self,
            other
        );
        self.0 - other.0
    }
}

/// `address >> log_size` is the index of the `1 << log_size` sized chunk holding it.
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    pub const ZERO: Self = Address(0);
    pub const MAX: Self = Address(usize::MAX);

    pub fn from_ref<T>(r: &T) -> Address {
        Address(r as *const T as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// # Safety
    /// The result may point anywhere. Only use it for fixed addresses and for words that
    /// are checked against the heap before being dereferenced.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// # Safety
    /// The address must be valid and aligned for reads of `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Write `value` without dropping what was there before.
    ///
    /// # Safety
    /// The address must be valid and aligned for writes of `T`.
    pub unsafe fn store<T>(self, value: T) {
        (self.0 as *mut T).write(value);
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn align_up(self, align: ByteSize) -> Address {
        Address(crate::util::conversions::raw_align_up(self.0, align))
    }

    pub const fn align_down(self, align: ByteSize) -> Address {
        Address(crate::util::conversions::raw_align_down(self.0, align))
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        crate::util::conversions::raw_is_aligned(self.0, align)
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// # Safety
    /// A live `T` must be stored at the address for `'a`.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        &*self.to_mut_ptr()
    }

    /// # Safety
    /// A live `T` must be stored at the address for `'a`, and nothing else may access it
    /// meanwhile.
    pub unsafe fn as_mut_ref<'a, T>(self) -> &'a mut T {
        &mut *self.to_mut_ptr()
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Is this address within `[start, end)`?
    pub fn is_in(self, start: Address, end: Address) -> bool {
        start <= self && self < end
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The address of a managed object: the first byte of its payload, directly after the
/// object header. Never zero; nullable references are `Option<ObjectReference>`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    pub fn to_raw_address(self) -> Address {
        Address(self.0.get())
    }

    /// `None` for the zero address.
    pub fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        NonZeroUsize::new(addr.0).map(ObjectReference)
    }

    /// # Safety
    /// `addr` must not be zero.
    pub unsafe fn from_raw_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        ObjectReference(NonZeroUsize::new_unchecked(addr.0))
    }

    /// # Safety
    /// The object must have been allocated as a `T` and must not have been swept.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        self.to_raw_address().as_ref()
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "object {:#x}", self.0)
    }
}
