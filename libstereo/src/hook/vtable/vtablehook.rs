use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::VmtHookResult;
use super::errors::VmtHookError;
use crate::ffi::POINTER_SIZE;
use crate::ffi::address::Address;
use crate::ffi::fnptr::FnPtr;
use crate::memory;

/// Upper bound on slots copied from a vtable
pub const MAX_VTABLE_SIZE: usize = 1024;

/// Per-object vtable replacement.
///
/// The object's vtable pointer is redirected to an owned copy of its
/// original vtable, so individual slots can be swapped without touching the
/// shared table other instances of the class use. The copy keeps the RTTI
/// locator slot in front of slot 0, so RTTI queries on the object still work.
pub struct VtableHook {
    object: Address,
    original_vtable: Address,

    // [locator, slot 0, slot 1, ...]; heap address is stable when the hook moves
    copy: Box<[AtomicUsize]>,
    len: usize,

    installed: AtomicBool,
}

impl VtableHook {
    /// Copies the vtable of `target` and points the object at the copy
    pub fn create(target: Address) -> VmtHookResult<Self> {
        if target.is_null() {
            return Err(VmtHookError::InvalidPointer);
        }

        if !target.is_aligned_to(POINTER_SIZE) {
            return Err(VmtHookError::MisalignedObject(target));
        }

        let original_vtable = Address::new(
            memory::read::<usize>(target).ok_or(VmtHookError::UnreadableObject(target))?,
        );

        if original_vtable.is_null() {
            return Err(VmtHookError::InvalidPointer);
        }

        // Count leading slots that hold code pointers
        let mut slots = Vec::new();
        while slots.len() < MAX_VTABLE_SIZE {
            let entry = original_vtable + slots.len() * POINTER_SIZE;

            match memory::read::<usize>(entry) {
                Some(function) if function != 0 && memory::is_executable(Address::new(function)) => {
                    slots.push(function);
                }
                _ => break,
            }
        }

        if slots.is_empty() {
            return Err(VmtHookError::EmptyVtable(original_vtable));
        }

        let locator = memory::read::<usize>(original_vtable - POINTER_SIZE).unwrap_or(0);

        let copy: Box<[AtomicUsize]> = std::iter::once(locator)
            .chain(slots.iter().copied())
            .map(AtomicUsize::new)
            .collect();

        let len = slots.len();

        let hook = Self {
            object: target,
            original_vtable,
            copy,
            len,
            installed: AtomicBool::new(false),
        };

        // Safety: object was read above and is pointer aligned
        let field = unsafe { target.as_atomic_unchecked() };
        field.store(hook.vtable().as_usize(), Ordering::Release);
        hook.installed.store(true, Ordering::Release);

        log::debug!(
            "VTable hook on object {target}: {len} slots copied from {original_vtable} to {}",
            hook.vtable()
        );

        Ok(hook)
    }

    /// Address of slot 0 in the owned copy
    pub fn vtable(&self) -> Address {
        Address::from_ptr(self.copy[1..].as_ptr())
    }

    pub fn original_vtable(&self) -> Address {
        self.original_vtable
    }

    pub fn object(&self) -> Address {
        self.object
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Function in slot `index` of the untouched original vtable
    pub fn original(&self, index: usize) -> VmtHookResult<Address> {
        self.check_index(index)?;

        memory::read::<usize>(self.original_vtable + index * POINTER_SIZE)
            .map(Address::new)
            .ok_or(VmtHookError::UnreadableOriginal(index))
    }

    /// Points slot `index` of the copy at `replacement` and returns the
    /// original function so the replacement can chain to it
    pub fn hook_method(&self, index: usize, replacement: Address) -> VmtHookResult<Address> {
        self.check_index(index)?;

        if replacement.is_null() {
            return Err(VmtHookError::InvalidPointer);
        }

        let original = self.original(index)?;
        self.copy[index + 1].store(replacement.as_usize(), Ordering::Release);

        log::debug!("Slot {index} of {} redirected: {original} -> {replacement}", self.object);

        Ok(original)
    }

    /// Typed variant of [`Self::hook_method`]
    pub fn hook_method_fn<F: Copy + 'static>(
        &self,
        index: usize,
        replacement: F,
    ) -> VmtHookResult<FnPtr<F>> {
        let replacement = FnPtr::address_of(replacement)?;
        let original = self.hook_method(index, replacement)?;

        Ok(FnPtr::from_address(original)?)
    }

    /// Puts the original function back into slot `index` of the copy
    pub fn unhook_method(&self, index: usize) -> VmtHookResult<()> {
        let original = self.original(index)?;
        self.copy[index + 1].store(original.as_usize(), Ordering::Release);

        Ok(())
    }

    /// Points the object back at its original vtable.
    ///
    /// Only happens while the object is readable and still points at this
    /// hook's copy; anything else is left alone. Returns whether it restored.
    pub fn remove(&self) -> bool {
        if !memory::is_readable(self.object, POINTER_SIZE) {
            log::debug!("Object {} is gone, nothing to restore", self.object);
            self.installed.store(false, Ordering::Release);
            return false;
        }

        // Safety: readable, aligned at create
        let field = unsafe { self.object.as_atomic_unchecked() };

        let restored = field
            .compare_exchange(
                self.vtable().as_usize(),
                self.original_vtable.as_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if restored {
            log::debug!("VTable of {} restored to {}", self.object, self.original_vtable);
        }

        self.installed.store(false, Ordering::Release);

        restored
    }

    fn check_index(&self, index: usize) -> VmtHookResult<()> {
        if index >= self.len {
            return Err(VmtHookError::IndexOutOfBounds {
                index,
                max: self.len,
            });
        }

        Ok(())
    }
}

impl Drop for VtableHook {
    fn drop(&mut self) {
        if self.is_installed() && !self.remove() {
            log::warn!(
                "VTable of {} was not restored on drop (changed or gone)",
                self.object
            );
        }
    }
}

impl fmt::Debug for VtableHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VtableHook")
            .field("object", &self.object)
            .field("original_vtable", &self.original_vtable)
            .field("vtable", &self.vtable())
            .field("len", &self.len)
            .field("installed", &self.installed)
            .finish()
    }
}
