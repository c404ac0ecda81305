pub mod address;
pub mod arch;
pub mod fnptr;

pub use arch::*;
