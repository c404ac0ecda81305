use std::ops::ControlFlow;

use crate::ffi::POINTER_SIZE;
use crate::ffi::address::Address;
use crate::memory;
use crate::scan::{DecodedInstruction, Disassembler};

use super::config::DiscoveryConfig;

/// Scores a decoded function body; higher means more likely the one wanted
pub trait FunctionScorer {
    fn score(&self, instructions: &[DecodedInstruction]) -> usize;
}

/// Counts instructions whose rendered text mentions a register class.
///
/// The view-offset function is dominated by vector math, so `xmm` operands
/// stand out against the rest of the vtable.
#[derive(Debug, Clone)]
pub struct SimdRegisterScorer {
    register_class: String,
}

impl SimdRegisterScorer {
    pub fn new(register_class: impl Into<String>) -> Self {
        Self {
            register_class: register_class.into(),
        }
    }
}

impl Default for SimdRegisterScorer {
    fn default() -> Self {
        Self::new("xmm")
    }
}

impl FunctionScorer for SimdRegisterScorer {
    fn score(&self, instructions: &[DecodedInstruction]) -> usize {
        instructions
            .iter()
            .filter(|instruction| instruction.text().contains(self.register_class.as_str()))
            .count()
    }
}

/// Picks the first vtable slot whose function scores at least `threshold`
#[derive(Debug, Clone)]
pub struct SlotClassifier<S: FunctionScorer = SimdRegisterScorer> {
    scorer: S,
    threshold: usize,
    max_slots: usize,
    max_instructions: usize,
}

impl SlotClassifier<SimdRegisterScorer> {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            SimdRegisterScorer::new(config.register_class.clone()),
            config.threshold,
            config.max_slots,
            config.max_instructions,
        )
    }
}

impl Default for SlotClassifier<SimdRegisterScorer> {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

impl<S: FunctionScorer> SlotClassifier<S> {
    pub fn new(scorer: S, threshold: usize, max_slots: usize, max_instructions: usize) -> Self {
        Self {
            scorer,
            threshold,
            max_slots,
            max_instructions,
        }
    }

    /// Body of the function at `address`, up to and including the first
    /// `ret`, `int3` or unconditional `jmp`
    pub fn decode_body(&self, disasm: &mut Disassembler, address: Address) -> Vec<DecodedInstruction> {
        let mut body = Vec::new();

        disasm.walk(address, self.max_instructions, |instruction| {
            body.push(instruction.clone());

            if instruction.is_return()
                || instruction.is_breakpoint()
                || instruction.is_unconditional_jump()
            {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        body
    }

    /// Index of the first qualifying slot of `vtable`.
    ///
    /// Null slots are skipped; the scan ends at the first unreadable one.
    pub fn classify(&self, disasm: &mut Disassembler, vtable: Address) -> Option<usize> {
        for index in 0..self.max_slots {
            let Some(function) = memory::read::<usize>(vtable + index * POINTER_SIZE) else {
                log::debug!("Slot {index} of {vtable} is unreadable, stopping");
                break;
            };

            if function == 0 {
                log::debug!("Slot {index} of {vtable} is null, skipping");
                continue;
            }

            let body = self.decode_body(disasm, Address::new(function));
            let score = self.scorer.score(&body);

            log::debug!(
                "Slot {index} -> 0x{function:X}: {} instructions, score {score}",
                body.len()
            );

            if score >= self.threshold {
                return Some(index);
            }
        }

        None
    }
}
