/// Minimum size of instructions in bytes for relative jump
pub const JUMP_REL_MIN_SIZE: usize = 5;

/// Minimum size of instructions in bytes for absolute jump
pub const JUMP_ABS_MIN_SIZE: usize = 14;

pub const MAX_JUMP_SIZE: usize = JUMP_ABS_MIN_SIZE;

pub const BITNESS: u32 = 64;

/// Longest legal x86-64 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();
