//! Windows backend built on the `windows` crate bindings.

use std::ffi::c_void;

use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
    VirtualQuery,
};
use windows::Win32::System::ProcessStatus::EnumProcessModules;
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::PCWSTR;

use super::{OsError, OsResult, PageProtection, Region};
use crate::ffi::address::Address;

const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE_RAW: u32 = 0x04;
const PAGE_WRITECOPY: u32 = 0x08;
const PAGE_EXECUTE: u32 = 0x10;
const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE_RAW: u32 = 0x40;
const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
const PAGE_GUARD: u32 = 0x100;

pub fn read_write_protection() -> PageProtection {
    PageProtection(PAGE_READWRITE.0)
}

pub fn read_write_execute_protection() -> PageProtection {
    PageProtection(PAGE_EXECUTE_READWRITE.0)
}

/// VirtualQuery(...) wrapped into a [`Region`]
pub fn query_region(address: Address) -> Option<Region> {
    if address.is_null() {
        return None;
    }

    let mut info = MEMORY_BASIC_INFORMATION::default();
    let info_size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();

    let result = unsafe { VirtualQuery(Some(address.as_ptr::<c_void>()), &mut info, info_size) };

    if result == 0 {
        return None;
    }

    let protect = info.Protect.0;
    let committed = info.State == MEM_COMMIT;
    let accessible = committed && protect & PAGE_GUARD == 0 && protect & PAGE_NOACCESS == 0;
    let base_protect = protect & 0xFF;

    let readable = accessible
        && matches!(
            base_protect,
            PAGE_READONLY
                | PAGE_READWRITE_RAW
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE_RAW
                | PAGE_EXECUTE_WRITECOPY
        );

    let writable = accessible
        && matches!(
            base_protect,
            PAGE_READWRITE_RAW | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE_RAW | PAGE_EXECUTE_WRITECOPY
        );

    let executable = accessible
        && matches!(
            base_protect,
            PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE_RAW | PAGE_EXECUTE_WRITECOPY
        );

    Some(Region {
        base: Address::from_mut_ptr(info.BaseAddress),
        size: info.RegionSize,
        readable,
        writable,
        executable,
        protection: PageProtection(protect),
    })
}

/// VirtualProtect(...), returns previous protection
pub fn protect(address: Address, size: usize, protection: PageProtection) -> OsResult<PageProtection> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    if size == 0 {
        return Err(OsError::ZeroSize);
    }

    let mut old_protect = PAGE_PROTECTION_FLAGS::default();

    unsafe {
        VirtualProtect(
            address.as_ptr::<c_void>(),
            size,
            PAGE_PROTECTION_FLAGS(protection.0),
            &mut old_protect,
        )?
    };

    Ok(PageProtection(old_protect.0))
}

fn try_alloc(hint: Option<Address>, size: usize) -> Option<Address> {
    let ptr = unsafe {
        VirtualAlloc(
            hint.map(|addr| addr.as_ptr::<c_void>()),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };

    (!ptr.is_null()).then(|| Address::from_mut_ptr(ptr))
}

/// Allocates RWX memory, preferably within rel32 reach of `near`.
///
/// Walks outwards from the target with 64KB aligned hints, first below and
/// then above, doubling the distance each attempt.
pub fn alloc_executable(size: usize, near: Option<Address>) -> OsResult<Address> {
    if size == 0 {
        return Err(OsError::ZeroSize);
    }

    if let Some(target) = near {
        const ALIGNMENT: usize = 0x10000;
        const MAX_ATTEMPTS: u32 = 20;

        let mut distance = 0x1000usize;

        for _ in 0..MAX_ATTEMPTS {
            if let Some(below) = target.checked_sub(distance) {
                let hint = Address::new(below.as_usize() / ALIGNMENT * ALIGNMENT);
                if let Some(ptr) = try_alloc(Some(hint), size) {
                    log::trace!("Allocated {size} bytes at {ptr} ({}KB before {target})", distance / 1024);
                    return Ok(ptr);
                }
            }

            if let Some(above) = target.checked_add(distance) {
                let hint = Address::new(above.as_usize() / ALIGNMENT * ALIGNMENT);
                if let Some(ptr) = try_alloc(Some(hint), size) {
                    log::trace!("Allocated {size} bytes at {ptr} ({}KB after {target})", distance / 1024);
                    return Ok(ptr);
                }
            }

            distance = distance.saturating_mul(2);
            if distance > 0x4000_0000 {
                break;
            }
        }

        log::debug!("No free block near {target}, falling back to any address");
    }

    try_alloc(None, size).ok_or(OsError::AllocationFailed(size))
}

pub fn free_executable(address: Address, _size: usize) -> OsResult<()> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    unsafe { VirtualFree(address.as_mut_ptr::<c_void>(), 0, MEM_RELEASE)? };

    Ok(())
}

/// FlushInstructionCache(...) on the current process
pub fn flush_instruction_cache(address: Address, size: usize) -> OsResult<()> {
    if address.is_null() {
        return Err(OsError::NullAddress);
    }

    unsafe { FlushInstructionCache(GetCurrentProcess(), Some(address.as_ptr::<c_void>()), size)? };

    Ok(())
}

/// Base addresses of every module mapped into the current process
pub fn loaded_module_bases() -> OsResult<Vec<Address>> {
    let process = unsafe { GetCurrentProcess() };

    let mut modules = vec![HMODULE::default(); 1024];
    let mut needed = 0u32;

    loop {
        let capacity = (modules.len() * std::mem::size_of::<HMODULE>()) as u32;

        unsafe { EnumProcessModules(process, modules.as_mut_ptr(), capacity, &mut needed)? };

        let count = needed as usize / std::mem::size_of::<HMODULE>();
        if count <= modules.len() {
            modules.truncate(count);
            break;
        }

        modules.resize(count, HMODULE::default());
    }

    Ok(modules
        .into_iter()
        .map(|module| Address::from_mut_ptr(module.0))
        .collect())
}

/// Base of the host executable image
pub fn main_module_base() -> Option<Address> {
    let module = unsafe { GetModuleHandleW(PCWSTR::null()) }.ok()?;

    Some(Address::from_mut_ptr(module.0))
}
