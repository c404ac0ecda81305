//! libstereo
//! In-process introspection and hooking core used to inject stereo rendering
//! into a running 64-bit host without symbols, headers or fixed offsets.
//!
//! Everything here works on the current process only. Addresses are plain
//! `Address` values; every read of foreign memory goes through the probes in
//! [`memory`] so a missing or guarded page turns into `None` instead of a crash.

// Discovery heuristics and code patching assume x86-64 encodings
#[cfg(not(target_arch = "x86_64"))]
compile_error!("Unsupported architecture - only x86_64 supported");

pub mod ffi;
pub mod func;
pub mod hook;
pub mod memory;
pub mod os;
pub mod pattern;
pub mod pe;
pub mod rtti;
pub mod scan;
pub mod stereo;

#[cfg(test)]
pub(crate) mod testing;

pub use ffi::address::Address;
pub use pattern::Pattern;
pub use pe::{ModuleBounds, ModuleRegistry};
pub use scan::{DecodedInstruction, Disassembler, Resolved};
