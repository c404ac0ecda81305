//! Raw process addresses.
//!
//! This is the only place in the crate that turns integers into pointers and
//! dereferences them without a probe. Everything outside this module reads
//! foreign memory through [`crate::memory`], which validates the page first and
//! then calls the unchecked accessors below.

use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
    sync::atomic::AtomicUsize,
};

/// Non-owning, pointer-sized location inside the current process.
///
/// Carries no lifetime: whoever dereferences it must know the page is mapped.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Wrapping signed offset, used for rel32 resolution
    pub const fn offset(self, delta: isize) -> Self {
        Self(self.0.wrapping_add_signed(delta))
    }

    pub fn checked_add(self, rhs: usize) -> Option<Self> {
        self.0.checked_add(rhs).map(Self)
    }

    pub fn checked_sub(self, rhs: usize) -> Option<Self> {
        self.0.checked_sub(rhs).map(Self)
    }

    /// Distance from `base` to `self`, `None` when `self` lies below `base`
    pub fn distance_from(self, base: Address) -> Option<usize> {
        self.0.checked_sub(base.0)
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 % align == 0
    }

    /// Reads a `T` without any validation.
    ///
    /// # Safety
    /// `[self, self + size_of::<T>())` must be mapped and readable.
    pub unsafe fn read_unchecked<T: Copy>(self) -> T {
        unsafe { std::ptr::read_unaligned(self.as_ptr::<T>()) }
    }

    /// Writes a `T` without any validation or protection change.
    ///
    /// # Safety
    /// `[self, self + size_of::<T>())` must be mapped and writable.
    pub unsafe fn write_unchecked<T: Copy>(self, value: T) {
        unsafe { std::ptr::write_unaligned(self.as_mut_ptr::<T>(), value) }
    }

    /// Borrows `len` bytes at this address.
    ///
    /// # Safety
    /// The range must stay mapped and readable for `'a`.
    pub unsafe fn as_slice_unchecked<'a>(self, len: usize) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr::<u8>(), len) }
    }

    /// Views a pointer-sized slot as an atomic cell.
    ///
    /// # Safety
    /// The slot must be mapped, writable, pointer aligned and outlive `'a`.
    pub unsafe fn as_atomic_unchecked<'a>(self) -> &'a AtomicUsize {
        unsafe { AtomicUsize::from_ptr(self.as_mut_ptr::<usize>()) }
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Self::Output {
        Address(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<usize> for Address {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Self::Output {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<Address> for usize {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:X})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
