use thiserror::Error;

use crate::ffi::address::Address;

#[derive(Debug, Error)]
pub enum PeError {
    #[error("Module base is NULL")]
    NullBase,

    #[error("Headers at {0} are not readable")]
    UnreadableHeaders(Address),

    #[error("Invalid DOS magic 0x{0:04X}")]
    InvalidDosMagic(u16),

    #[error("Invalid NT signature 0x{0:08X}")]
    InvalidNtSignature(u32),

    #[error("Missing optional header")]
    MissingOptionalHeader,

    #[error("Goblin parsing error: {0}")]
    GoblinError(#[from] goblin::error::Error),
}

pub type PeResult<T> = std::result::Result<T, PeError>;
