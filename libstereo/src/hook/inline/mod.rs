pub mod errors;
pub mod inlinehook;

mod disasm;
mod trampoline;

pub use inlinehook::InlineHook;

pub type InlineHookResult<T> = std::result::Result<T, errors::InlineHookError>;
