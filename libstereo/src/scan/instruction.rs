use iced_x86::{Instruction, Mnemonic, OpKind};

use crate::ffi::address::Address;

/// One decoded instruction together with its Intel syntax rendering
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    instruction: Instruction,
    text: String,
}

impl DecodedInstruction {
    pub(crate) fn new(instruction: Instruction, text: String) -> Self {
        Self { instruction, text }
    }

    /// Returns inner 'instruction' from 'iced_x86'
    pub fn inner(&self) -> &Instruction {
        &self.instruction
    }

    pub fn ip(&self) -> Address {
        Address::new(self.instruction.ip() as usize)
    }

    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the following instruction
    pub fn next_ip(&self) -> Address {
        Address::new(self.instruction.next_ip() as usize)
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.instruction.mnemonic()
    }

    /// Intel syntax text, e.g. `movaps xmm0,xmm1`
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True if `address` falls inside this instruction's bytes
    pub fn covers(&self, address: Address) -> bool {
        address >= self.ip() && address < self.next_ip()
    }

    pub fn is_return(&self) -> bool {
        self.mnemonic() == Mnemonic::Ret
    }

    pub fn is_breakpoint(&self) -> bool {
        self.mnemonic() == Mnemonic::Int3
    }

    pub fn is_unconditional_jump(&self) -> bool {
        self.mnemonic() == Mnemonic::Jmp
    }

    /// Target of a RIP-relative memory operand
    pub fn rip_operand_target(&self) -> Option<Address> {
        if !self.instruction.is_ip_rel_memory_operand() {
            return None;
        }

        Some(Address::new(self.instruction.ip_rel_memory_address() as usize))
    }

    /// Target of a near relative branch
    pub fn relative_branch_target(&self) -> Option<Address> {
        match self.instruction.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(Address::new(self.instruction.near_branch_target() as usize))
            }
            _ => None,
        }
    }

    /// `next_ip + displacement` for a memory operand with an explicit
    /// displacement that is not RIP-relative
    pub fn plain_displacement_target(&self) -> Option<Address> {
        let has_memory = self.instruction.op_kinds().any(|kind| kind == OpKind::Memory);

        if !has_memory || self.instruction.memory_displ_size() == 0 {
            return None;
        }

        let displacement = self.instruction.memory_displacement64() as i64;

        Some(self.next_ip().offset(displacement as isize))
    }

    /// The address this instruction refers to: RIP-relative operand first,
    /// then relative branch, then plain displacement
    pub fn displacement_target(&self) -> Option<Address> {
        self.rip_operand_target()
            .or_else(|| self.relative_branch_target())
            .or_else(|| self.plain_displacement_target())
    }
}

/// An instruction address, the instruction decoded there and the address it
/// refers to
#[derive(Debug, Clone)]
pub struct Resolved {
    pub address: Address,
    pub target: Address,
    pub instruction: DecodedInstruction,
}
