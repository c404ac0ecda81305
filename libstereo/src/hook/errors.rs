use thiserror::Error;

use super::inline::errors::InlineHookError;
use super::vtable::errors::VmtHookError;
use crate::ffi::address::Address;
use crate::memory::MemoryError;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Inline(#[from] InlineHookError),

    #[error(transparent)]
    Vmt(#[from] VmtHookError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Null pointer encountered: {0}")]
    NullPointer(&'static str),

    #[error("Slot at {0} is not readable")]
    UnreadableSlot(Address),

    #[error("Slot at {slot} holds {found}, expected {expected}; left untouched")]
    SlotChanged {
        slot: Address,
        expected: Address,
        found: Address,
    },

    #[error("Hook already enabled")]
    AlreadyEnabled,

    #[error("Hook not enabled")]
    NotEnabled,
}

pub type HookResult<T> = std::result::Result<T, HookError>;
