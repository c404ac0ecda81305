use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;

use super::errors::{HookError, HookResult};
use super::traits::InstalledHook;
use crate::ffi::address::Address;
use crate::memory;

/// Hook by overwriting one stored function pointer
pub struct PointerHook {
    name: String,
    slot: Address,
    original: Address,
    replacement: Address,
    enabled: AtomicBool,

    guard: RwLock<()>,
}

impl PointerHook {
    pub fn new(name: impl Into<String>, slot: Address, replacement: Address) -> HookResult<Self> {
        if slot.is_null() {
            return Err(HookError::NullPointer("pointer slot"));
        }

        if replacement.is_null() {
            return Err(HookError::NullPointer("replacement"));
        }

        let original = memory::read::<usize>(slot)
            .map(Address::new)
            .ok_or(HookError::UnreadableSlot(slot))?;

        Ok(Self {
            name: name.into(),
            slot,
            original,
            replacement,
            enabled: AtomicBool::new(false),
            guard: RwLock::new(()),
        })
    }

    pub fn enable(&self) -> HookResult<()> {
        let _guard = self.guard.write();

        if self.is_enabled() {
            return Err(HookError::AlreadyEnabled);
        }

        unsafe { memory::write_protected(self.slot, self.replacement.as_usize())? };

        self.enabled.store(true, Ordering::Release);

        log::debug!("[{}] Slot {} now points to {}", self.name, self.slot, self.replacement);

        Ok(())
    }

    /// Puts the original pointer back if the slot still holds ours
    pub fn disable(&self) -> HookResult<()> {
        let _guard = self.guard.write();

        if !self.is_enabled() {
            return Err(HookError::NotEnabled);
        }

        self.enabled.store(false, Ordering::Release);

        let current = memory::read::<usize>(self.slot)
            .map(Address::new)
            .ok_or(HookError::UnreadableSlot(self.slot))?;

        if current != self.replacement {
            return Err(HookError::SlotChanged {
                slot: self.slot,
                expected: self.replacement,
                found: current,
            });
        }

        unsafe { memory::write_protected(self.slot, self.original.as_usize())? };

        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Drop for PointerHook {
    fn drop(&mut self) {
        if !self.is_enabled() {
            return;
        }

        match self.disable() {
            Ok(_) => log::debug!("[{}] Pointer restored in Drop", self.name),
            Err(err) => log::error!("[{}] Failed to restore pointer: {}", self.name, err),
        }
    }
}

impl fmt::Debug for PointerHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointerHook")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("original", &self.original)
            .field("replacement", &self.replacement)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl InstalledHook for PointerHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Address {
        self.slot
    }

    fn original(&self) -> Address {
        self.original
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled()
    }

    fn enable(&self) -> HookResult<()> {
        self.enable()
    }

    fn uninstall(&self) -> HookResult<()> {
        self.disable()
    }
}
