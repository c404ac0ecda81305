//! Checked access to process memory.
//!
//! Every read of memory the crate does not own goes through here. A read is
//! only performed after the pages covering it are confirmed readable, so a
//! stale pointer or a guard page turns into `None`.

use thiserror::Error;

use crate::ffi::address::Address;
use crate::os::{self, OsError, PageProtection, Region};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("OS error: {0}")]
    Os(#[from] OsError),

    #[error("Memory at {0} is not readable")]
    Unreadable(Address),

    #[error("Failed to restore protection at {address}: {source}")]
    RestoreProtection { address: Address, source: OsError },
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Number of bytes readable starting at `address`, following adjacent
/// readable regions up to `wanted` bytes.
pub fn readable_span(address: Address, wanted: usize) -> usize {
    let mut covered = 0usize;
    let mut cursor = address;

    while covered < wanted {
        let Some(region) = os::query_region(cursor) else {
            break;
        };

        if !region.readable {
            break;
        }

        let Some(available) = region.end().distance_from(cursor) else {
            break;
        };

        if available == 0 {
            break;
        }

        covered = covered.saturating_add(available);
        cursor = region.end();
    }

    covered.min(wanted)
}

pub fn is_readable(address: Address, size: usize) -> bool {
    !address.is_null() && size > 0 && readable_span(address, size) == size
}

pub fn is_executable(address: Address) -> bool {
    os::query_region(address).is_some_and(|region| region.readable && region.executable)
}

/// Reads a `T` after probing the covering pages
pub fn read<T: Copy>(address: Address) -> Option<T> {
    if !is_readable(address, std::mem::size_of::<T>()) {
        return None;
    }

    // Safety: range probed above
    Some(unsafe { address.read_unchecked::<T>() })
}

/// Copies out `len` bytes after probing the covering pages
pub fn read_bytes(address: Address, len: usize) -> Option<Vec<u8>> {
    if !is_readable(address, len) {
        return None;
    }

    // Safety: range probed above
    Some(unsafe { address.as_slice_unchecked(len) }.to_vec())
}

/// Caches the last region seen so linear scans do not query the OS per byte.
///
/// Region answers can go stale if the host unmaps memory mid-scan; scans are
/// short lived so the cache only lives as long as the cursor.
#[derive(Debug, Default)]
pub struct ReadCursor {
    region: Option<Region>,
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn region_for(&mut self, address: Address) -> Option<Region> {
        if let Some(region) = self.region {
            if region.contains(address) {
                return Some(region);
            }
        }

        let region = os::query_region(address)?;
        self.region = Some(region);

        Some(region)
    }

    /// True if `[address, address + size)` is readable
    pub fn is_readable(&mut self, address: Address, size: usize) -> bool {
        if address.is_null() || size == 0 {
            return false;
        }

        let Some(region) = self.region_for(address) else {
            return false;
        };

        if !region.readable {
            return false;
        }

        match address.checked_add(size) {
            Some(end) if end <= region.end() => true,
            Some(_) => readable_span(address, size) == size,
            None => false,
        }
    }

    /// Like [`readable_span`], answered from the cached region when possible
    pub fn readable_len(&mut self, address: Address, wanted: usize) -> usize {
        if address.is_null() || wanted == 0 {
            return 0;
        }

        let Some(region) = self.region_for(address) else {
            return 0;
        };

        if !region.readable {
            return 0;
        }

        let available = region.end().distance_from(address).unwrap_or(0);
        if available >= wanted {
            wanted
        } else {
            readable_span(address, wanted)
        }
    }

    pub fn read<T: Copy>(&mut self, address: Address) -> Option<T> {
        if !self.is_readable(address, std::mem::size_of::<T>()) {
            return None;
        }

        // Safety: range probed above
        Some(unsafe { address.read_unchecked::<T>() })
    }

    /// Lends `len` readable bytes to `func` without copying them
    pub fn with_slice<R>(
        &mut self,
        address: Address,
        len: usize,
        func: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        if !self.is_readable(address, len) {
            return None;
        }

        // Safety: range probed above, the borrow does not escape `func`
        Some(func(unsafe { address.as_slice_unchecked(len) }))
    }
}

/// Runs `func` with `[address, address + size)` switched to `protection`,
/// then restores the previous protection.
///
/// # Safety
/// Changing protection affects every thread touching those pages.
pub unsafe fn with_protection<T, F: FnOnce() -> T>(
    address: Address,
    size: usize,
    protection: PageProtection,
    func: F,
) -> MemoryResult<T> {
    // Step 1: change protection and keep the old flags
    let old_protection = os::protect(address, size, protection)?;

    // Step 2: run callback
    let result = func();

    // Step 3: restore
    os::protect(address, size, old_protection)
        .map_err(|source| MemoryError::RestoreProtection { address, source })?;

    Ok(result)
}

/// Writes a `T` into possibly read-only memory.
///
/// # Safety
/// `address` must point to a live `T` that nothing else writes concurrently.
pub unsafe fn write_protected<T: Copy>(address: Address, value: T) -> MemoryResult<()> {
    if !is_readable(address, std::mem::size_of::<T>()) {
        return Err(MemoryError::Unreadable(address));
    }

    unsafe {
        with_protection(
            address,
            std::mem::size_of::<T>(),
            os::read_write_protection(),
            || address.write_unchecked(value),
        )
    }
}
