pub mod errors;
pub mod inline;
pub mod installer;
pub mod pointer;
pub mod traits;
pub mod vtable;

pub use errors::*;
pub use inline::InlineHook;
pub use installer::NativeHookInstaller;
pub use pointer::PointerHook;
pub use traits::*;
pub use vtable::VtableHook;
