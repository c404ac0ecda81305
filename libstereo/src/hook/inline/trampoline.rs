use super::InlineHookResult;
use super::disasm::{Disasm, create_jump_bytes, verify_jump_bytes};
use super::errors::InlineHookError;
use crate::ffi::address::Address;
use crate::os;

/// Fixed allocation per trampoline; stolen code plus the jump back never
/// comes close
pub(super) const TRAMPOLINE_SIZE: usize = 256;

/// Guard for safe memory allocation cleanup
struct AllocGuard {
    address: Address,
    size: usize,
    should_free: bool,
}

impl AllocGuard {
    fn new(address: Address, size: usize) -> Self {
        Self {
            address,
            size,
            should_free: true,
        }
    }

    fn release(mut self) -> Address {
        self.should_free = false;
        self.address
    }
}

impl Drop for AllocGuard {
    fn drop(&mut self) {
        if self.should_free {
            log::debug!("AllocGuard freeing memory at {}", self.address);

            if let Err(err) = os::free_executable(self.address, self.size) {
                log::error!("Failed to free AllocGuard memory: {}", err);
            }
        }
    }
}

/// Executable copy of the stolen prologue followed by a jump back into the
/// target right after the stolen bytes
pub(super) struct Trampoline {
    address: Address,
    disasm: Disasm,
}

impl Trampoline {
    pub(super) fn new(target: Address, detour: Address) -> InlineHookResult<Self> {
        let disasm = Disasm::steal(target, detour)?;

        let address = os::alloc_executable(TRAMPOLINE_SIZE, Some(target))?;
        let alloc_guard = AllocGuard::new(address, TRAMPOLINE_SIZE);

        log::trace!("Allocated trampoline at {address} for {target}");

        let relocated = disasm.relocate(address)?;

        // Resume at the first instruction not copied into the trampoline
        let resume = target + disasm.stolen_len();
        let jump_back_at = address + relocated.len();
        let jump_back = create_jump_bytes(jump_back_at, resume)?;
        verify_jump_bytes(&jump_back, jump_back_at, resume)?;

        let used = relocated.len() + jump_back.len();
        if used > TRAMPOLINE_SIZE {
            return Err(InlineHookError::TrampolineTooSmall {
                needed: used,
                available: TRAMPOLINE_SIZE,
            });
        }

        let mut code = Vec::with_capacity(TRAMPOLINE_SIZE);
        code.extend_from_slice(&relocated);
        code.extend_from_slice(&jump_back);

        // INT3 for anything that runs past the jump
        code.resize(TRAMPOLINE_SIZE, 0xCC);

        // Safety: freshly allocated RWX block of TRAMPOLINE_SIZE bytes
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), address.as_mut_ptr::<u8>(), code.len());
        }

        os::flush_instruction_cache(address, TRAMPOLINE_SIZE)?;

        log::debug!(
            "Trampoline for {target} at {address}: {} relocated bytes, resumes at {resume}",
            relocated.len()
        );

        Ok(Self {
            address: alloc_guard.release(),
            disasm,
        })
    }

    pub(super) fn address(&self) -> Address {
        self.address
    }

    pub(super) fn stolen_bytes(&self) -> &[u8] {
        self.disasm.stolen_bytes()
    }

    pub(super) fn stolen_len(&self) -> usize {
        self.disasm.stolen_len()
    }

    pub(super) fn jump_size(&self) -> usize {
        self.disasm.jump_size()
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        log::debug!("Freeing trampoline at {}", self.address);

        if let Err(err) = os::free_executable(self.address, TRAMPOLINE_SIZE) {
            log::error!("Failed to free trampoline memory: {}", err);
        }
    }
}
