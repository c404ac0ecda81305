use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::InlineHookResult;
use super::disasm::{create_jump_bytes, verify_jump_bytes};
use super::errors::InlineHookError;
use super::trampoline::Trampoline;
use crate::ffi::address::Address;
use crate::ffi::fnptr::FnPtr;
use crate::hook::errors::HookResult;
use crate::hook::traits::InstalledHook;
use crate::{memory, os};

/// Redirects a function by overwriting its first instructions with a jump.
///
/// The overwritten instructions are relocated into a trampoline, which is
/// what callers of [`InlineHook::original`] end up executing.
pub struct InlineHook {
    name: String,
    target: Address,
    detour: Address,

    trampoline: Trampoline,

    enabled: AtomicBool,
    failed: AtomicBool,

    guard: RwLock<()>,
}

impl InlineHook {
    /// Prepares a hook for `target`; nothing is patched until [`Self::enable`]
    ///
    /// # Arguments
    /// - `target` - function entry to patch
    /// - `detour` - function that runs instead
    pub fn new(name: impl Into<String>, target: Address, detour: Address) -> InlineHookResult<Self> {
        if target.is_null() {
            return Err(InlineHookError::TargetIsNull);
        }

        if detour.is_null() {
            return Err(InlineHookError::DetourIsNull);
        }

        if !memory::is_executable(target) {
            return Err(InlineHookError::InaccessibleMemory(target));
        }

        let trampoline = Trampoline::new(target, detour)?;

        Ok(Self {
            name: name.into(),
            target,
            detour,
            trampoline,
            enabled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            guard: RwLock::new(()),
        })
    }

    /// Typed variant of [`Self::new`]
    pub fn with_detour<F: Copy + 'static>(
        name: impl Into<String>,
        target: Address,
        detour: F,
    ) -> InlineHookResult<Self> {
        let detour = FnPtr::address_of(detour).map_err(|_| InlineHookError::DetourIsNull)?;
        Self::new(name, target, detour)
    }

    /// Writes the jump to the detour over the target's first instructions
    pub fn enable(&self) -> InlineHookResult<()> {
        let _guard = self.guard.write();

        if self.is_failed() {
            return Err(InlineHookError::HookFailed);
        }

        if self.is_enabled() {
            return Err(InlineHookError::AlreadyEnabled);
        }

        log::debug!("[{}] Enabling hook at {}", self.name, self.target);

        let mut patch = create_jump_bytes(self.target, self.detour).inspect_err(|_| {
            self.failed.store(true, Ordering::Release);
        })?;

        verify_jump_bytes(&patch, self.target, self.detour)?;

        // Jump size is fixed when the trampoline is built
        if patch.len() != self.trampoline.jump_size() {
            self.failed.store(true, Ordering::Release);
            return Err(InlineHookError::EncodingError(format!(
                "Jump grew from {} to {} bytes",
                self.trampoline.jump_size(),
                patch.len()
            )));
        }

        // Pad the tail of a partially overwritten instruction
        patch.resize(self.trampoline.stolen_len(), 0x90);

        self.write_code(&patch).inspect_err(|_| {
            self.failed.store(true, Ordering::Release);
        })?;

        self.enabled.store(true, Ordering::Release);

        log::debug!("[{}] {} -> {}", self.name, self.target, self.detour);

        Ok(())
    }

    /// Restores the stolen bytes
    pub fn disable(&self) -> InlineHookResult<()> {
        let _guard = self.guard.write();

        if self.is_failed() {
            return Err(InlineHookError::HookFailed);
        }

        if !self.is_enabled() {
            return Err(InlineHookError::NotEnabled);
        }

        self.write_code(self.trampoline.stolen_bytes())?;

        self.enabled.store(false, Ordering::Release);

        log::debug!("[{}] Original bytes restored at {}", self.name, self.target);

        Ok(())
    }

    fn write_code(&self, bytes: &[u8]) -> InlineHookResult<()> {
        if !memory::is_readable(self.target, bytes.len()) {
            return Err(InlineHookError::InaccessibleMemory(self.target));
        }

        unsafe {
            memory::with_protection(
                self.target,
                bytes.len(),
                os::read_write_execute_protection(),
                || {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        self.target.as_mut_ptr::<u8>(),
                        bytes.len(),
                    )
                },
            )?;
        }

        std::sync::atomic::fence(Ordering::SeqCst);

        os::flush_instruction_cache(self.target, bytes.len())?;

        Ok(())
    }

    /// Entry of the trampoline; calling it runs the unhooked function
    pub fn original(&self) -> Address {
        self.trampoline.address()
    }

    /// Typed view of [`Self::original`]
    pub fn original_fn<F: Copy + 'static>(&self) -> InlineHookResult<F> {
        let _guard = self.guard.read();

        let ptr = FnPtr::<F>::from_address(self.original()).map_err(|_| InlineHookError::HookFailed)?;

        // Safety: trampoline lives as long as the hook
        unsafe { ptr.as_fn() }.map_err(|_| InlineHookError::HookFailed)
    }

    pub fn target(&self) -> Address {
        self.target
    }

    pub fn detour(&self) -> Address {
        self.detour
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

impl Drop for InlineHook {
    fn drop(&mut self) {
        if !self.is_enabled() || self.is_failed() {
            return;
        }

        match self.disable() {
            Ok(_) => {
                log::debug!("[{}] Hook disabled and original bytes restored in Drop", self.name);
            }
            Err(err) => {
                log::error!("[{}] Failed to drop: {}", self.name, err);
            }
        }
    }
}

impl fmt::Debug for InlineHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineHook")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("detour", &self.detour)
            .field("trampoline", &self.trampoline.address())
            .field("stolen_len", &self.trampoline.stolen_len())
            .field("enabled", &self.enabled)
            .field("failed", &self.failed)
            .finish()
    }
}

impl InstalledHook for InlineHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> Address {
        self.target
    }

    fn original(&self) -> Address {
        self.original()
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled()
    }

    fn enable(&self) -> HookResult<()> {
        Ok(self.enable()?)
    }

    fn uninstall(&self) -> HookResult<()> {
        Ok(self.disable()?)
    }
}
