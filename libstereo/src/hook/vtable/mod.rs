pub mod errors;
mod vtablehook;

pub use vtablehook::{MAX_VTABLE_SIZE, VtableHook};

pub type VmtHookResult<T> = std::result::Result<T, errors::VmtHookError>;
