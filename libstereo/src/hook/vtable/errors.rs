use thiserror::Error;

use crate::ffi::address::Address;
use crate::ffi::fnptr::FnPtrError;

#[derive(Debug, Error)]
pub enum VmtHookError {
    #[error("FnPtr error: {0}")]
    FnPtr(#[from] FnPtrError),

    #[error("Invalid or NULL pointer")]
    InvalidPointer,

    #[error("Object at {0} is not readable")]
    UnreadableObject(Address),

    #[error("Object at {0} is not pointer aligned")]
    MisalignedObject(Address),

    #[error("VTable at {0} has no executable slots")]
    EmptyVtable(Address),

    #[error("Index out of bounds: {index} (max: {max})")]
    IndexOutOfBounds { index: usize, max: usize },

    #[error("Original slot {0} is no longer readable")]
    UnreadableOriginal(usize),
}
