use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, Encoder, Instruction,
    InstructionBlock, MemoryOperand, Mnemonic, Register,
};

use super::InlineHookResult;
use super::errors::InlineHookError;
use crate::ffi::address::Address;
use crate::ffi::{BITNESS, JUMP_ABS_MIN_SIZE, JUMP_REL_MIN_SIZE, MAX_INSTRUCTION_LEN};
use crate::memory;

/// Whole instructions taken from the start of a function to make room for
/// the redirecting jump
pub(super) struct Disasm {
    target: Address,
    jump_size: usize,
    stolen_bytes: Vec<u8>,
    stolen_instructions: Vec<Instruction>,
}

impl Disasm {
    /// Minimum patch size for a jump between two addresses.
    ///
    /// A `jmp rel32` takes 5 bytes but only reaches +-2GB from the end of the
    /// jump; anything further needs `jmp [rip+0]` followed by the absolute
    /// target, 14 bytes in total.
    pub(super) fn jump_size_between(from: Address, to: Address) -> usize {
        if rel32_displacement(from, to).is_some() {
            JUMP_REL_MIN_SIZE
        } else {
            JUMP_ABS_MIN_SIZE
        }
    }

    /// Decodes whole instructions at `target` until they cover a jump to
    /// `detour`
    pub(super) fn steal(target: Address, detour: Address) -> InlineHookResult<Self> {
        let jump_size = Self::jump_size_between(target, detour);

        // Room for the last instruction to straddle the jump boundary
        let wanted = jump_size + MAX_INSTRUCTION_LEN;
        let available = memory::readable_span(target, wanted);

        if available < jump_size {
            return Err(InlineHookError::InaccessibleMemory(target));
        }

        let buffer = memory::read_bytes(target, available)
            .ok_or(InlineHookError::InaccessibleMemory(target))?;

        let mut decoder = Decoder::with_ip(BITNESS, &buffer, target.as_u64(), DecoderOptions::NONE);

        let mut stolen_len = 0usize;
        let mut stolen_instructions = Vec::new();
        let mut instruction = Instruction::default();

        while stolen_len < jump_size {
            if !decoder.can_decode() {
                return Err(InlineHookError::InaccessibleMemory(target + stolen_len));
            }

            decoder.decode_out(&mut instruction);

            if instruction.is_invalid() {
                return Err(InlineHookError::InvalidInstruction(target + stolen_len));
            }

            log::trace!(
                "Stolen instruction at 0x{:X}: {:?}, len={}",
                instruction.ip(),
                instruction.mnemonic(),
                instruction.len()
            );

            // Function ends inside the patch area
            if matches!(instruction.mnemonic(), Mnemonic::Ret | Mnemonic::Jmp) {
                log::error!(
                    "Cannot hook {target}: {:?} at 0x{:X} ends the function before {jump_size} bytes",
                    instruction.mnemonic(),
                    instruction.ip()
                );
                return Err(InlineHookError::ShortTarget {
                    at: Address::new(instruction.ip() as usize),
                    needed: jump_size,
                });
            }

            if is_loop(&instruction) {
                return Err(InlineHookError::NonRelocatableInstruction(instruction.mnemonic()));
            }

            stolen_len += instruction.len();
            stolen_instructions.push(instruction);
        }

        let stolen_bytes = buffer[..stolen_len].to_vec();

        log::debug!(
            "Stole {} instructions ({stolen_len} bytes) from {target} for a {jump_size} byte jump",
            stolen_instructions.len()
        );

        Ok(Self {
            target,
            jump_size,
            stolen_bytes,
            stolen_instructions,
        })
    }

    /// Re-encodes the stolen block to run from `new_ip`.
    ///
    /// Relative branches and RIP-relative operands are fixed up by the block
    /// encoder; short branches leaving the block are widened as needed.
    pub(super) fn relocate(&self, new_ip: Address) -> InlineHookResult<Vec<u8>> {
        log::debug!(
            "Relocating {} instructions from {} to {new_ip}",
            self.stolen_instructions.len(),
            self.target
        );

        let block = InstructionBlock::new(&self.stolen_instructions, new_ip.as_u64());
        let encoded = BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)?;

        if encoded.code_buffer.is_empty() {
            return Err(InlineHookError::EncodingError(format!(
                "Relocation of {} produced no bytes",
                self.target
            )));
        }

        log::trace!("Original bytes: {:02X?}", self.stolen_bytes);
        log::trace!("Relocated bytes: {:02X?}", encoded.code_buffer);

        Ok(encoded.code_buffer)
    }

    pub(super) fn jump_size(&self) -> usize {
        self.jump_size
    }

    pub(super) fn stolen_bytes(&self) -> &[u8] {
        &self.stolen_bytes
    }

    pub(super) fn stolen_len(&self) -> usize {
        self.stolen_bytes.len()
    }
}

fn is_loop(instruction: &Instruction) -> bool {
    use Mnemonic::*;
    matches!(
        instruction.mnemonic(),
        Loop | Loope | Loopne | Jecxz | Jcxz | Jrcxz
    )
}

fn rel32_displacement(from: Address, to: Address) -> Option<i32> {
    let distance = (to.as_u64() as i64)
        .wrapping_sub(from.as_u64() as i64)
        .wrapping_sub(JUMP_REL_MIN_SIZE as i64);

    i32::try_from(distance).ok()
}

/// Encodes a jump placed at `from` that lands on `to`
pub(super) fn create_jump_bytes(from: Address, to: Address) -> InlineHookResult<Vec<u8>> {
    log::trace!("Creating jump from {from} to {to}");

    let mut encoder = Encoder::new(BITNESS);

    if rel32_displacement(from, to).is_some() {
        let instruction = Instruction::with_branch(Code::Jmp_rel32_64, to.as_u64())?;
        encoder.encode(&instruction, from.as_u64())?;

        let buffer = encoder.take_buffer();
        if buffer.len() != JUMP_REL_MIN_SIZE {
            return Err(InlineHookError::EncodingError(format!(
                "Expected {JUMP_REL_MIN_SIZE} bytes for near jump, got {}",
                buffer.len()
            )));
        }

        return Ok(buffer);
    }

    // jmp [rip+0] followed by the absolute target
    let slot = from.as_u64() + 6;
    let instruction =
        Instruction::with1(Code::Jmp_rm64, MemoryOperand::with_base_displ(Register::RIP, slot as i64))?;

    let encoded_len = encoder.encode(&instruction, from.as_u64())?;
    if encoded_len != 6 {
        return Err(InlineHookError::EncodingError(format!(
            "Expected 6 bytes for indirect jump, got {encoded_len}"
        )));
    }

    let mut bytes = encoder.take_buffer();
    bytes.extend_from_slice(&to.as_u64().to_le_bytes());

    debug_assert_eq!(bytes.len(), JUMP_ABS_MIN_SIZE);

    Ok(bytes)
}

/// Decodes `jump_bytes` as if placed at `from` and checks they land on
/// `expected`
pub(super) fn verify_jump_bytes(
    jump_bytes: &[u8],
    from: Address,
    expected: Address,
) -> InlineHookResult<()> {
    let mut decoder = Decoder::with_ip(BITNESS, jump_bytes, from.as_u64(), DecoderOptions::NONE);

    let mismatch = |actual: u64| InlineHookError::JumpVerificationFailed {
        expected: expected.as_usize(),
        actual: actual as usize,
    };

    if !decoder.can_decode() {
        return Err(mismatch(0));
    }

    let instruction = decoder.decode();

    let actual = match instruction.code() {
        Code::Jmp_rel32_64 => instruction.near_branch_target(),
        Code::Jmp_rm64 if instruction.memory_base() == Register::RIP => {
            // Absolute target stored right behind the instruction
            let slot = instruction.len();
            let stored = jump_bytes
                .get(slot..slot + 8)
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .ok_or_else(|| mismatch(0))?;

            if instruction.memory_displacement64() != from.as_u64() + slot as u64 {
                return Err(mismatch(instruction.memory_displacement64()));
            }

            u64::from_le_bytes(stored)
        }
        code => {
            return Err(InlineHookError::EncodingError(format!(
                "Unexpected jump instruction code: {code:?}"
            )));
        }
    };

    if actual != expected.as_u64() {
        return Err(mismatch(actual));
    }

    Ok(())
}
