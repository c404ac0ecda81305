use iced_x86::{IcedError, Mnemonic};
use thiserror::Error;

use crate::ffi::address::Address;
use crate::memory::MemoryError;
use crate::os::OsError;

#[derive(Debug, Error)]
pub enum InlineHookError {
    #[error("OS error: {0}")]
    Os(#[from] OsError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Iced error: {0}")]
    IcedError(#[from] IcedError),

    #[error("Target function is NULL")]
    TargetIsNull,

    #[error("Detour function is NULL")]
    DetourIsNull,

    #[error("Target memory at {0} is not accessible")]
    InaccessibleMemory(Address),

    #[error("Function ends before {needed} bytes can be patched (at {at})")]
    ShortTarget { at: Address, needed: usize },

    #[error("Failed to disassemble instruction at {0}")]
    InvalidInstruction(Address),

    #[error("Cannot relocate instruction: {0:?}")]
    NonRelocatableInstruction(Mnemonic),

    #[error("Trampoline too small: need {needed} bytes, have {available}")]
    TrampolineTooSmall { needed: usize, available: usize },

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Jump verification failed: expected target {expected:x}, got {actual:x}")]
    JumpVerificationFailed { expected: usize, actual: usize },

    #[error("Hook is already enabled")]
    AlreadyEnabled,

    #[error("Hook is not enabled")]
    NotEnabled,

    #[error("Hook is in failed state and cannot be used")]
    HookFailed,
}
