use std::{
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

use super::address::Address;

#[derive(Debug, Error)]
pub enum FnPtrError {
    #[error("Function pointer is NULL")]
    FunctionPtrIsNull,

    #[error("Function pointer has wrong size (does not match usize)")]
    FunctionPtrSize,
}

pub type FnPtrResult<T> = std::result::Result<T, FnPtrError>;

/// Typed view over a function address.
///
/// Hooks deal in bare [`Address`] values; `FnPtr` is the bridge back to a
/// callable `extern` function type on the consumer side.
///
/// `T` must be a function pointer type (`extern "C" fn(..)`, `unsafe extern
/// "system" fn(..)`, ...).
#[derive(Debug)]
pub struct FnPtr<T: Copy + 'static> {
    raw: AtomicUsize,
    _phantom: PhantomData<T>,
}

// Safety: only an integer is stored, the pointee is code
unsafe impl<T: Copy + 'static> Send for FnPtr<T> {}
unsafe impl<T: Copy + 'static> Sync for FnPtr<T> {}

impl<T: Copy + 'static> FnPtr<T> {
    /// Unbound pointer, usable in a `static`; [`Self::as_fn`] fails until
    /// [`Self::set`] is called
    pub const fn null() -> Self {
        Self {
            raw: AtomicUsize::new(0),
            _phantom: PhantomData,
        }
    }

    /// Rebinds to `address`
    pub fn set(&self, address: Address) -> FnPtrResult<()> {
        Self::validate_size()?;

        if address.is_null() {
            return Err(FnPtrError::FunctionPtrIsNull);
        }

        self.raw.store(address.as_usize(), Ordering::Release);

        Ok(())
    }

    /// Back to the unbound state
    pub fn clear(&self) {
        self.raw.store(0, Ordering::Release);
    }

    pub fn from_address(address: Address) -> FnPtrResult<Self> {
        Self::validate_size()?;

        if address.is_null() {
            return Err(FnPtrError::FunctionPtrIsNull);
        }

        Ok(Self {
            raw: AtomicUsize::new(address.as_usize()),
            _phantom: PhantomData,
        })
    }

    pub fn from_fn(function: T) -> FnPtrResult<Self> {
        Self::from_address(Self::address_of(function)?)
    }

    /// Address of a function value of type `T`
    pub fn address_of(function: T) -> FnPtrResult<Address> {
        Self::validate_size()?;

        // Safety: validate_size guarantees T is exactly pointer sized
        let raw = unsafe { std::mem::transmute_copy::<T, usize>(&function) };

        Ok(Address::new(raw))
    }

    /// Returns the stored address as a callable `T`.
    ///
    /// # Safety
    /// The stored address must be a function with exactly the signature `T`.
    pub unsafe fn as_fn(&self) -> FnPtrResult<T> {
        let raw = self.raw.load(Ordering::Acquire);

        if raw == 0 {
            return Err(FnPtrError::FunctionPtrIsNull);
        }

        Ok(unsafe { std::mem::transmute_copy::<usize, T>(&raw) })
    }

    pub fn address(&self) -> Address {
        Address::new(self.raw.load(Ordering::Acquire))
    }

    fn validate_size() -> FnPtrResult<()> {
        if std::mem::size_of::<T>() != std::mem::size_of::<usize>() {
            log::error!(
                "Invalid function pointer type size: {} != {}",
                std::mem::size_of::<T>(),
                std::mem::size_of::<usize>()
            );
            return Err(FnPtrError::FunctionPtrSize);
        }

        Ok(())
    }
}
