//! Disassembly-backed scanning.
//!
//! Everything decodes one instruction at a time through iced-x86 and
//! advances by the decoded length. Memory is probed before each decode, so
//! walking off the end of a mapping ends the walk instead of faulting.

mod instruction;

use std::ops::ControlFlow;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter, Mnemonic};
use serde::{Deserialize, Serialize};

pub use instruction::{DecodedInstruction, Resolved};

use crate::ffi::address::Address;
use crate::ffi::{BITNESS, MAX_INSTRUCTION_LEN, POINTER_SIZE};
use crate::memory::{self, ReadCursor};
use crate::pattern::Pattern;
use crate::pe::ModuleBounds;

/// Offset from a rel32 field to the end of a typical RIP-relative instruction
pub const DEFAULT_REL32_OFFSET: usize = 4;

/// Size of a rel32 field
const REL32_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    Ascii,
    #[default]
    Utf16,
}

impl StringEncoding {
    pub fn encode(self, text: &str, zero_terminated: bool) -> Vec<u8> {
        let mut bytes = match self {
            StringEncoding::Ascii => text.as_bytes().to_vec(),
            StringEncoding::Utf16 => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        };

        if zero_terminated {
            let width = match self {
                StringEncoding::Ascii => 1,
                StringEncoding::Utf16 => 2,
            };
            bytes.extend(std::iter::repeat_n(0u8, width));
        }

        bytes
    }
}

/// Reads a rel32 at `address` and resolves it: `address + custom_offset + rel32`
pub fn calculate_absolute(address: Address, custom_offset: usize) -> Option<Address> {
    let relative = memory::read::<i32>(address)?;

    Some((address + custom_offset).offset(relative as isize))
}

/// Location of `text` inside the module image
pub fn scan_string(
    module: &ModuleBounds,
    text: &str,
    encoding: StringEncoding,
    zero_terminated: bool,
) -> Option<Address> {
    if text.is_empty() {
        return None;
    }

    let pattern = Pattern::from_bytes(&encoding.encode(text, zero_terminated));
    let found = pattern.find(module.base(), module.size());

    if found.is_none() {
        log::debug!("String {text:?} ({encoding:?}) not found in module at {}", module.base());
    }

    found
}

/// Location of a pointer-aligned slot in the module that stores `value`
pub fn scan_ptr(module: &ModuleBounds, value: Address) -> Option<Address> {
    let mut cursor = ReadCursor::new();
    let mut slot = module.base();

    while let Some(next) = slot.checked_add(POINTER_SIZE) {
        if next > module.end() {
            break;
        }

        if cursor.read::<usize>(slot) == Some(value.as_usize()) {
            return Some(slot);
        }

        slot = next;
    }

    None
}

/// Single-instruction decoder with a rendering formatter
pub struct Disassembler {
    formatter: IntelFormatter,
    cursor: ReadCursor,
    text: String,
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Disassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disassembler").finish_non_exhaustive()
    }
}

impl Disassembler {
    pub fn new() -> Self {
        Self {
            formatter: IntelFormatter::new(),
            cursor: ReadCursor::new(),
            text: String::with_capacity(64),
        }
    }

    /// Decodes the instruction at `address`.
    ///
    /// `None` for unreadable memory or an invalid encoding.
    pub fn decode(&mut self, address: Address) -> Option<DecodedInstruction> {
        let available = self.cursor.readable_len(address, MAX_INSTRUCTION_LEN);
        if available == 0 {
            return None;
        }

        let instruction = self.cursor.with_slice(address, available, |bytes| {
            let mut decoder =
                Decoder::with_ip(BITNESS, bytes, address.as_u64(), DecoderOptions::NONE);
            decoder.decode()
        })?;

        if instruction.is_invalid() {
            return None;
        }

        self.text.clear();
        self.formatter.format(&instruction, &mut self.text);

        Some(DecodedInstruction::new(instruction, self.text.clone()))
    }

    /// Decodes forward from `address` for at most `max_instructions`,
    /// handing each instruction to `visitor`. Returns how many were decoded.
    pub fn walk<F>(&mut self, address: Address, max_instructions: usize, mut visitor: F) -> usize
    where
        F: FnMut(&DecodedInstruction) -> ControlFlow<()>,
    {
        let mut ip = address;
        let mut decoded = 0;

        while decoded < max_instructions {
            let Some(instruction) = self.decode(ip) else {
                break;
            };

            decoded += 1;

            if visitor(&instruction).is_break() {
                break;
            }

            ip = instruction.next_ip();
        }

        decoded
    }

    /// First instruction within `max_instructions` whose primary opcode is `opcode`
    pub fn scan_opcode(
        &mut self,
        address: Address,
        max_instructions: usize,
        opcode: u8,
    ) -> Option<Address> {
        self.scan_by(address, max_instructions, |instruction| {
            instruction.inner().op_code().op_code() == opcode as u32
        })
    }

    /// First instruction within `max_instructions` with the given mnemonic
    pub fn scan_mnemonic(
        &mut self,
        address: Address,
        max_instructions: usize,
        mnemonic: Mnemonic,
    ) -> Option<Address> {
        self.scan_by(address, max_instructions, |instruction| {
            instruction.mnemonic() == mnemonic
        })
    }

    fn scan_by<P>(&mut self, address: Address, max_instructions: usize, predicate: P) -> Option<Address>
    where
        P: Fn(&DecodedInstruction) -> bool,
    {
        let mut found = None;

        self.walk(address, max_instructions, |instruction| {
            if predicate(instruction) {
                found = Some(instruction.ip());
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        found
    }

    /// Address referenced by the instruction at `ip`
    pub fn resolve_displacement(&mut self, ip: Address) -> Option<Address> {
        self.decode(ip)?.displacement_target()
    }

    /// Finds the instruction that contains `middle` and refers to something.
    ///
    /// Candidates start 1 to 15 bytes before `middle`, nearest first.
    pub fn resolve_instruction(&mut self, middle: Address) -> Option<Resolved> {
        for back in 1..=MAX_INSTRUCTION_LEN {
            let Some(candidate) = middle.checked_sub(back) else {
                break;
            };

            let Some(instruction) = self.decode(candidate) else {
                continue;
            };

            if !instruction.covers(middle) {
                continue;
            }

            if let Some(target) = instruction.displacement_target() {
                return Some(Resolved {
                    address: candidate,
                    target,
                    instruction,
                });
            }
        }

        None
    }

    /// Byte-granular search in `[start, start + length)` for a rel32 field
    /// referring to `ptr`.
    ///
    /// A hit must also be confirmed by decoding the enclosing instruction,
    /// since unaligned bytes can look like a matching rel32 by accident.
    pub fn scan_displacement_reference(
        &mut self,
        start: Address,
        length: usize,
        ptr: Address,
    ) -> Option<Address> {
        if length < REL32_SIZE {
            return None;
        }

        let mut cursor = ReadCursor::new();
        let last = length - REL32_SIZE;
        let mut offset = 0usize;

        while offset <= last {
            let candidate = start + offset;

            let Some(relative) = cursor.read::<i32>(candidate) else {
                offset += REL32_SIZE;
                continue;
            };

            let absolute = (candidate + DEFAULT_REL32_OFFSET).offset(relative as isize);

            if absolute == ptr {
                match self.resolve_instruction(candidate) {
                    Some(resolved) if resolved.target == ptr => return Some(candidate),
                    _ => log::trace!("Rejected unaligned rel32 match at {candidate}"),
                }
            }

            offset += 1;
        }

        None
    }

    /// First code reference to `text` inside the module
    pub fn find_string_reference(
        &mut self,
        module: &ModuleBounds,
        text: &str,
        encoding: StringEncoding,
    ) -> Option<Address> {
        let string = scan_string(module, text, encoding, false)?;

        let reference = self.scan_displacement_reference(module.base(), module.size(), string);

        if reference.is_none() {
            log::debug!("No reference to {text:?} at {string}");
        }

        reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, SyntheticImage};

    fn buffer_with(code: &[u8]) -> (Vec<u8>, Address) {
        let mut buffer = vec![0xCCu8; 64];
        buffer[..code.len()].copy_from_slice(code);
        let base = Address::from_ptr(buffer.as_ptr());
        (buffer, base)
    }

    #[test]
    fn test_decode_renders_text() {
        let (_buffer, base) = buffer_with(&[0x0F, 0x28, 0xC1]);
        let mut disasm = Disassembler::new();

        let instruction = disasm.decode(base).unwrap();
        assert_eq!(instruction.len(), 3);
        assert_eq!(instruction.mnemonic(), Mnemonic::Movaps);
        assert!(instruction.text().contains("xmm0"));
    }

    #[test]
    fn test_decode_unreadable_is_none() {
        let mut disasm = Disassembler::new();
        assert!(disasm.decode(Address::new(0x10)).is_none());
        assert!(disasm.decode(Address::NULL).is_none());
    }

    #[test]
    fn test_calculate_absolute_positive_and_negative() {
        let mut buffer = [0u8; 8];
        buffer[..4].copy_from_slice(&0x100i32.to_le_bytes());
        buffer[4..].copy_from_slice(&(-0x20i32).to_le_bytes());
        let base = Address::from_ptr(buffer.as_ptr());

        assert_eq!(calculate_absolute(base, 4), Some(base + 4 + 0x100));
        assert_eq!(calculate_absolute(base + 4, 4), Some(base + 8 - 0x20));
        assert_eq!(calculate_absolute(Address::new(0x10), 4), None);
    }

    #[test]
    fn test_scan_mnemonic_and_opcode() {
        // xor eax,eax ; lea rax,[rip+0x10] ; ret
        let code = [0x31, 0xC0, 0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];
        let (_buffer, base) = buffer_with(&code);
        let mut disasm = Disassembler::new();

        assert_eq!(disasm.scan_mnemonic(base, 10, Mnemonic::Lea), Some(base + 2));
        assert_eq!(disasm.scan_opcode(base, 10, 0xC3), Some(base + 9));
        assert_eq!(disasm.scan_mnemonic(base, 1, Mnemonic::Ret), None);
    }

    #[test]
    fn test_resolve_displacement_variants() {
        // lea rax,[rip+0x10]
        let (_a, rip) = buffer_with(&[0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00]);
        // call rel32 -0x10
        let (_b, call) = buffer_with(&[0xE8, 0xF0, 0xFF, 0xFF, 0xFF]);
        // mov eax,[rcx+0x20]
        let (_c, plain) = buffer_with(&[0x8B, 0x41, 0x20]);
        // xor eax,eax
        let (_d, none) = buffer_with(&[0x31, 0xC0]);

        let mut disasm = Disassembler::new();
        assert_eq!(disasm.resolve_displacement(rip), Some(rip + 7 + 0x10));
        assert_eq!(disasm.resolve_displacement(call), Some(call + 5 - 0x10));
        assert_eq!(disasm.resolve_displacement(plain), Some(plain + 3 + 0x20));
        assert_eq!(disasm.resolve_displacement(none), None);
    }

    #[test]
    fn test_walk_stops_on_visitor_break() {
        let code = [0x90, 0x90, 0x90, 0xC3];
        let (_buffer, base) = buffer_with(&code);
        let mut disasm = Disassembler::new();

        let decoded = disasm.walk(base, 100, |instruction| {
            if instruction.is_return() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert_eq!(decoded, 4);
    }

    #[test]
    fn test_scan_displacement_reference_finds_lea() {
        let image = SyntheticImage::build();
        let module = image.module();
        let mut disasm = Disassembler::new();

        let string = image.base() + testing::PRIMARY_STRING_RVA as usize;
        let reference = disasm.scan_displacement_reference(module.base(), module.size(), string);

        assert_eq!(reference, Some(image.base() + testing::PRIMARY_REF_RVA as usize));
    }

    #[test]
    fn test_scan_displacement_reference_rejects_unaligned_match() {
        // Bytes that read as a rel32 to `target` but sit inside a nop run
        let mut buffer = vec![0x90u8; 32];
        let base = Address::from_ptr(buffer.as_ptr());
        let target = base + 8 + 4 + 0x40;
        buffer[8..12].copy_from_slice(&0x40i32.to_le_bytes());

        let mut disasm = Disassembler::new();
        assert_eq!(calculate_absolute(base + 8, 4), Some(target));
        assert_eq!(disasm.scan_displacement_reference(base, buffer.len(), target), None);
    }

    #[test]
    fn test_scan_string_both_encodings() {
        let image = SyntheticImage::build();
        let module = image.module();

        assert_eq!(
            scan_string(&module, testing::PRIMARY_STRING, StringEncoding::Utf16, false),
            Some(image.base() + testing::PRIMARY_STRING_RVA as usize)
        );
        assert_eq!(
            scan_string(&module, testing::ASCII_STRING, StringEncoding::Ascii, true),
            Some(image.base() + testing::ASCII_STRING_RVA as usize)
        );
        assert_eq!(scan_string(&module, "Not.There", StringEncoding::Utf16, false), None);
    }

    #[test]
    fn test_scan_ptr_finds_vtable_slot() {
        let image = SyntheticImage::build();
        let module = image.module();

        let function = image.base() + testing::FUNC_ADJACENT_RVA as usize;
        assert_eq!(
            scan_ptr(&module, function),
            Some(image.vtable() + testing::ADJACENT_SLOT * POINTER_SIZE)
        );
        assert_eq!(scan_ptr(&module, Address::new(0xDEAD_0000_BEEF)), None);
    }

    #[test]
    fn test_find_string_reference() {
        let image = SyntheticImage::build();
        let module = image.module();
        let mut disasm = Disassembler::new();

        assert_eq!(
            disasm.find_string_reference(&module, testing::SECONDARY_STRING, StringEncoding::Utf16),
            Some(image.base() + testing::SECONDARY_REF_RVA as usize)
        );
    }
}
