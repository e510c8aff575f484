use core::fmt;

/// Highest byte address a 32-bit register can hold.
pub const LOW_LIMIT: u64 = 0xFFFF_FFFF;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("address {0:#x} does not fit in 32 bits")]
pub struct AddressOutOfRange(pub u64);

/// A host or bus address that is known to fit in 32 bits.
///
/// The only ways in are [`LowAddr::new`] (already a `u32`) and the checked conversions from wider
/// integers and pointers, which fail instead of truncating.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LowAddr(u32);

impl LowAddr {
    pub const ZERO: Self = Self(0);

    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn from_ptr<T>(ptr: *const T) -> Result<Self, AddressOutOfRange> {
        Self::try_from(ptr as usize)
    }

    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }

    /// Whether `[self, self + size)` stays within `0..=LOW_LIMIT` with `self + size <= LOW_LIMIT`.
    pub fn fits(self, size: u32) -> bool {
        u64::from(self.0) + u64::from(size) <= LOW_LIMIT
    }
}

impl TryFrom<u64> for LowAddr {
    type Error = AddressOutOfRange;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map(Self)
            .map_err(|_| AddressOutOfRange(value))
    }
}

impl TryFrom<usize> for LowAddr {
    type Error = AddressOutOfRange;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::try_from(value as u64)
    }
}

impl From<LowAddr> for u32 {
    fn from(value: LowAddr) -> Self {
        value.0
    }
}

impl From<LowAddr> for u64 {
    fn from(value: LowAddr) -> Self {
        u64::from(value.0)
    }
}

impl fmt::Display for LowAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for LowAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
