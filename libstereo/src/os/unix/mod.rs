//! Unix backend.
//!
//! Used for development and tests on hosts that are not the game's platform.
//! Regions come from `/proc/self/maps`; protection changes and allocations go
//! through libc.

use std::fs;

use super::{OsError, OsResult, PageProtection, Region};
use crate::ffi::address::Address;

const PROT_READ: u32 = libc::PROT_READ as u32;
const PROT_WRITE: u32 = libc::PROT_WRITE as u32;
const PROT_EXEC: u32 = libc::PROT_EXEC as u32;

pub fn read_write_protection() -> PageProtection {
    PageProtection(PROT_READ | PROT_WRITE)
}

pub fn read_write_execute_protection() -> PageProtection {
    PageProtection(PROT_READ | PROT_WRITE | PROT_EXEC)
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 0x1000 } else { size as usize }
}

/// Parses one `/proc/self/maps` line: `start-end perms offset dev inode path`
fn parse_maps_line(line: &str) -> Option<Region> {
    let mut parts = line.split_whitespace();

    let range = parts.next()?;
    let perms = parts.next()?.as_bytes();

    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;

    if end <= start || perms.len() < 3 {
        return None;
    }

    let readable = perms[0] == b'r';
    let writable = perms[1] == b'w';
    let executable = perms[2] == b'x';

    let mut protection = 0;
    if readable {
        protection |= PROT_READ;
    }
    if writable {
        protection |= PROT_WRITE;
    }
    if executable {
        protection |= PROT_EXEC;
    }

    Some(Region {
        base: Address::new(start),
        size: end - start,
        readable,
        writable,
        executable,
        protection: PageProtection(protection),
    })
}

fn regions() -> OsResult<Vec<Region>> {
    let maps = fs::read_to_string("/proc/self/maps")?;

    Ok(maps.lines().filter_map(parse_maps_line).collect())
}

/// Region containing `address`, read fresh from `/proc/self/maps`
pub fn query_region(address: Address) -> Option<Region> {
    if address.is_null() {
        return None;
    }

    match regions() {
        Ok(regions) => regions.into_iter().find(|region| region.contains(address)),
        Err(e) => {
            log::debug!("Failed to read process maps: {e}");
            None
        }
    }
}

/// mprotect(...) over the pages spanning `[address, address + size)`.
///
/// Returns the protection of the first page so the caller can restore it.
pub fn protect(address: Address, size: usize, protection: PageProtection) -> OsResult<PageProtection> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    if size == 0 {
        return Err(OsError::ZeroSize);
    }

    let previous = query_region(address)
        .ok_or(OsError::RegionNotFound(address.as_usize()))?
        .protection;

    let page = page_size();
    let start = address.as_usize() & !(page - 1);
    let end = address.as_usize().saturating_add(size);
    let length = end - start;

    let result = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            length,
            protection.0 as libc::c_int,
        )
    };

    if result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(previous)
}

fn try_mmap(hint: Option<Address>, size: usize) -> Option<Address> {
    let hint_ptr = hint.map_or(std::ptr::null_mut(), |addr| addr.as_mut_ptr::<libc::c_void>());

    let ptr = unsafe {
        libc::mmap(
            hint_ptr,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(Address::from_mut_ptr(ptr))
    }
}

/// Anonymous RWX mapping, preferably within rel32 reach of `near`.
///
/// The kernel treats the hint as advisory; a mapping that lands out of range
/// is released and the next hint tried.
pub fn alloc_executable(size: usize, near: Option<Address>) -> OsResult<Address> {
    if size == 0 {
        return Err(OsError::ZeroSize);
    }

    if let Some(target) = near {
        const REACH: usize = 0x7FFF_0000;

        let page = page_size();
        let mut distance = 0x10000usize;

        while distance < REACH {
            for hint in [target.checked_sub(distance), target.checked_add(distance)]
                .into_iter()
                .flatten()
            {
                let hint = Address::new(hint.as_usize() & !(page - 1));

                let Some(ptr) = try_mmap(Some(hint), size) else {
                    continue;
                };

                let gap = ptr
                    .distance_from(target)
                    .or_else(|| target.distance_from(ptr))
                    .unwrap_or(usize::MAX);

                if gap < REACH {
                    log::trace!("Mapped {size} bytes at {ptr} near {target}");
                    return Ok(ptr);
                }

                unsafe { libc::munmap(ptr.as_mut_ptr::<libc::c_void>(), size) };
            }

            distance = distance.saturating_mul(2);
        }

        log::debug!("No mapping near {target}, falling back to any address");
    }

    try_mmap(None, size).ok_or(OsError::AllocationFailed(size))
}

pub fn free_executable(address: Address, size: usize) -> OsResult<()> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    let result = unsafe { libc::munmap(address.as_mut_ptr::<libc::c_void>(), size) };

    if result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

/// x86-64 keeps instruction and data caches coherent
pub fn flush_instruction_cache(address: Address, _size: usize) -> OsResult<()> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    Ok(())
}

/// Module enumeration only exists for PE hosts
pub fn loaded_module_bases() -> OsResult<Vec<Address>> {
    Err(OsError::Unsupported)
}

pub fn main_module_base() -> Option<Address> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let region =
            parse_maps_line("7f0000001000-7f0000003000 r-xp 00000000 08:01 1234 /usr/lib/libc.so")
                .unwrap();

        assert_eq!(region.base, Address::new(0x7f00_0000_1000));
        assert_eq!(region.size, 0x2000);
        assert!(region.readable);
        assert!(!region.writable);
        assert!(region.executable);
    }

    #[test]
    fn test_parse_maps_line_rejects_garbage() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("zzzz-1000 rw-p").is_none());
        assert!(parse_maps_line("2000-1000 rw-p 0 0 0").is_none());
    }

    #[test]
    fn test_query_region_finds_stack_variable() {
        let value = 7u64;
        let region = query_region(Address::from_ptr(&value)).unwrap();

        assert!(region.readable);
        assert!(region.writable);
        assert!(region.contains(Address::from_ptr(&value)));
    }

    #[test]
    fn test_alloc_protect_free() {
        let target = Address::new(test_alloc_protect_free as usize);
        let block = alloc_executable(0x1000, Some(target)).unwrap();

        let region = query_region(block).unwrap();
        assert!(region.executable);

        let previous = protect(block, 0x10, read_write_protection()).unwrap();
        assert_eq!(previous, read_write_execute_protection());
        assert!(!query_region(block).unwrap().executable);

        free_executable(block, 0x1000).unwrap();
    }
}
