//! Utilities shared by the heap, the safepoint machinery and the tests.

/// Address and object reference newtypes.
pub mod address;
/// Size and layout constants for pages and objects.
pub mod constants;
/// Alignment helpers.
pub mod conversions;
/// Logger initialization
pub mod logger;
/// OS memory mapping wrappers.
pub mod memory;
/// Runtime options, read from `THREADHEAP_*` environment variables.
pub mod options;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
