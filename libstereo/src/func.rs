//! Function boundaries from the exception directory.
//!
//! x64 images describe every non-leaf function with a `RUNTIME_FUNCTION`
//! entry. Without symbols this is the only reliable source of where a
//! function starts.

use goblin::pe::exception::RuntimeFunction;
use scroll::{LE, Pread};

use crate::ffi::address::Address;
use crate::memory;
use crate::pe::{ModuleBounds, ModuleRegistry, RUNTIME_FUNCTION_SIZE};
use crate::scan;

const UNW_FLAG_CHAININFO: u8 = 0x4;

/// Chains longer than this are treated as corrupt
const MAX_CHAIN_DEPTH: usize = 32;

/// Exception directory entry whose range holds `rva`
fn containing_entry(module: &ModuleBounds, rva: u32) -> Option<RuntimeFunction> {
    module
        .runtime_functions()
        .find(|entry| entry.begin_address <= rva && rva < entry.end_address)
}

/// Start of the function containing `middle`
pub fn find_function_start(registry: &ModuleRegistry, middle: Address) -> Option<Address> {
    let Some(module) = registry.module_within(middle) else {
        log::debug!("No module contains {middle}");
        return None;
    };

    if !module.has_exception_directory() {
        log::debug!("Module at {} has no exception directory", module.base());
        return None;
    }

    let rva = module.rva_of(middle)?;

    match containing_entry(module, rva) {
        Some(entry) => Some(module.va(entry.begin_address)),
        None => {
            log::debug!("No exception entry covers {middle} (rva 0x{rva:X})");
            None
        }
    }
}

/// Primary entry of a possibly chained `RUNTIME_FUNCTION`.
///
/// Functions split by the compiler (hot/cold parts) get fragments whose
/// unwind info carries `UNW_FLAG_CHAININFO` and points at the parent entry.
fn resolve_chain(module: &ModuleBounds, mut entry: RuntimeFunction) -> Option<RuntimeFunction> {
    for _ in 0..MAX_CHAIN_DEPTH {
        let unwind = module.va(entry.unwind_info_address);
        let header = memory::read::<[u8; 4]>(unwind)?;

        let flags = header[0] >> 3;
        if flags & UNW_FLAG_CHAININFO == 0 {
            return Some(entry);
        }

        // Unwind codes are 2 bytes each, padded to an even count
        let codes = (header[2] as usize + 1) & !1;
        let chained = unwind + 4 + codes * 2;

        let raw = memory::read::<[u8; RUNTIME_FUNCTION_SIZE]>(chained)?;
        entry = raw.pread_with::<RuntimeFunction>(0, LE).ok()?;
    }

    log::warn!("Unwind chain deeper than {MAX_CHAIN_DEPTH} in module at {}", module.base());
    None
}

/// Like [`find_function_start`] but follows chained unwind info to the
/// entry of the whole function rather than the fragment holding `middle`
pub fn find_function_entry(registry: &ModuleRegistry, middle: Address) -> Option<Address> {
    let module = registry.module_within(middle)?;
    let rva = module.rva_of(middle)?;

    let fragment = containing_entry(module, rva)?;
    let primary = resolve_chain(module, fragment)?;

    Some(module.va(primary.begin_address))
}

/// Entry with the largest begin address below `rva`
fn preceding_entry(module: &ModuleBounds, rva: u32) -> Option<RuntimeFunction> {
    module
        .runtime_functions()
        .filter(|entry| entry.begin_address < rva)
        .max_by_key(|entry| entry.begin_address)
}

/// Start of the nearest function at or before `middle` that some pointer in
/// the module refers to.
///
/// Virtually dispatched functions are the ones stored as absolute pointers;
/// plain call sites use rel32. Walks backwards one function at a time until a
/// stored pointer is found or the directory runs out.
pub fn find_virtual_function_start(registry: &ModuleRegistry, middle: Address) -> Option<Address> {
    let mut candidate = find_function_start(registry, middle)?;
    let module = registry.module_within(middle)?;

    loop {
        if scan::scan_ptr(module, candidate).is_some() {
            return Some(candidate);
        }

        let rva = module.rva_of(candidate)?;

        match preceding_entry(module, rva) {
            Some(entry) => candidate = module.va(entry.begin_address),
            None => {
                log::debug!("No stored pointer to any function at or before {middle}");
                return None;
            }
        }
    }
}
